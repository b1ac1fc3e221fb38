//! Physical dataset storage.
//!
//! An upload is a JSON object mapping split names to `{ "x": [...], "y": [...] }`.
//! `train` and `test` are required; other splits (e.g. `validation`) are kept
//! as given. Each split lands in its own file under
//! `<root>/datasets/<url>/<split>.json`. Trained models live under
//! `<root>/models/<url>`.
//!
//! Uploads are two-phase: [`DatasetStorage::stage`] validates and writes the
//! splits under `<root>/staging/`, then [`DatasetStorage::commit`] renames
//! them into place. Committed content is never overwritten.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

use crate::backend::SplitRef;

pub const REQUIRED_SPLITS: [&str; 2] = ["train", "test"];

/// Largest accepted upload, in bytes.
pub const MAX_DATASET_SIZE: u64 = 1_000_000_000;

static STAGE_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid dataset content: {0}")]
    Invalid(String),

    #[error("invalid storage key: {0:?}")]
    InvalidKey(String),

    #[error("no stored content for dataset {0}")]
    NotStored(String),

    #[error("dataset {url} has no {split} split")]
    MissingSplit { url: String, split: String },

    #[error("content for dataset {0} is already stored")]
    AlreadyStored(String),
}

pub type Result<T> = std::result::Result<T, DatasetError>;

/// What an upload left on disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredContent {
    pub size: u64,
    /// Hex BLAKE3 of the uploaded bytes.
    pub hash: String,
    /// Shape of one input sample.
    pub shape: Vec<u32>,
}

/// Validated content waiting under the staging area.
#[derive(Clone, Debug)]
pub struct Staged {
    pub url: String,
    pub location: PathBuf,
    pub content: StoredContent,
}

/// An opened dataset: the split files found for one storage key.
#[derive(Clone, Debug)]
pub struct DatasetSource {
    url: String,
    splits: BTreeMap<String, PathBuf>,
}

impl DatasetSource {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn split_names(&self) -> impl Iterator<Item = &str> {
        self.splits.keys().map(String::as_str)
    }

    pub fn split(&self, name: &str) -> Result<SplitRef> {
        self.splits
            .get(name)
            .map(|path| SplitRef {
                name: name.to_string(),
                path: path.clone(),
            })
            .ok_or_else(|| DatasetError::MissingSplit {
                url: self.url.clone(),
                split: name.to_string(),
            })
    }

    pub fn has_split(&self, name: &str) -> bool {
        self.splits.contains_key(name)
    }
}

/// Dataset storage capability. Calls touch the filesystem and block.
pub trait DatasetStorage: Send + Sync {
    fn get_path(&self, url: &str) -> Result<PathBuf>;

    fn open(&self, url: &str) -> Result<DatasetSource>;

    /// Validates `content` and writes it aside without touching `url`.
    fn stage(&self, url: &str, content: &[u8]) -> Result<Staged>;

    /// Moves staged content into place. Fails with `AlreadyStored` when
    /// `url` already has content.
    fn commit(&self, staged: &Staged) -> Result<()>;

    fn discard(&self, staged: &Staged) -> Result<()>;

    fn store(&self, url: &str, content: &[u8]) -> Result<StoredContent> {
        let staged = self.stage(url, content)?;
        if let Err(e) = self.commit(&staged) {
            self.discard(&staged)?;
            return Err(e);
        }
        Ok(staged.content)
    }

    fn model_path(&self, url: &str) -> Result<PathBuf>;
}

#[derive(Clone, Debug)]
pub struct FsDatasetStorage {
    root: PathBuf,
}

impl FsDatasetStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Storage keys are record ids; anything that could escape the root is refused.
fn check_key(url: &str) -> Result<()> {
    let bad = url.is_empty()
        || url == "."
        || url == ".."
        || url.contains(['/', '\\', '\0']);
    if bad {
        return Err(DatasetError::InvalidKey(url.to_string()));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Split {
    x: Vec<JsonValue>,
    y: Vec<JsonValue>,
}

fn parse_upload(content: &[u8]) -> Result<BTreeMap<String, Split>> {
    let splits: BTreeMap<String, Split> = serde_json::from_slice(content)
        .map_err(|e| DatasetError::Invalid(e.to_string()))?;

    for name in REQUIRED_SPLITS {
        if !splits.contains_key(name) {
            return Err(DatasetError::Invalid(format!("missing {name} split")));
        }
    }
    for (name, split) in &splits {
        check_key(name).map_err(|_| DatasetError::Invalid(format!("bad split name {name:?}")))?;
        if split.x.len() != split.y.len() {
            return Err(DatasetError::Invalid(format!(
                "{name}: {} inputs but {} targets",
                split.x.len(),
                split.y.len()
            )));
        }
        if split.x.is_empty() {
            return Err(DatasetError::Invalid(format!("{name} split is empty")));
        }
    }
    Ok(splits)
}

/// Nested array lengths along the first element, e.g. `[[1,2,3],[4,5,6]]` is `[2, 3]`.
fn infer_shape(sample: &JsonValue) -> Vec<u32> {
    let mut shape = Vec::new();
    let mut cur = sample;
    while let JsonValue::Array(items) = cur {
        shape.push(items.len() as u32);
        match items.first() {
            Some(next) => cur = next,
            None => break,
        }
    }
    shape
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl DatasetStorage for FsDatasetStorage {
    fn get_path(&self, url: &str) -> Result<PathBuf> {
        check_key(url)?;
        Ok(self.root.join("datasets").join(url))
    }

    fn open(&self, url: &str) -> Result<DatasetSource> {
        let dir = self.get_path(url)?;
        if !dir.is_dir() {
            return Err(DatasetError::NotStored(url.to_string()));
        }

        let mut splits = BTreeMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                splits.insert(stem.to_string(), path.clone());
            }
        }
        debug!(url, splits = splits.len(), "datasets: opened");

        Ok(DatasetSource {
            url: url.to_string(),
            splits,
        })
    }

    fn stage(&self, url: &str, content: &[u8]) -> Result<Staged> {
        check_key(url)?;
        let splits = parse_upload(content)?;

        let shape = splits
            .get("train")
            .and_then(|s| s.x.first())
            .map(infer_shape)
            .unwrap_or_default();
        let hash = hex::encode(blake3::hash(content).as_bytes());

        let location = self.root.join("staging").join(format!(
            "{url}.{}.{}",
            std::process::id(),
            STAGE_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&location)?;
        let staged = Staged {
            url: url.to_string(),
            location,
            content: StoredContent {
                size: content.len() as u64,
                hash,
                shape,
            },
        };

        for (name, split) in &splits {
            let written = serde_json::to_vec(&serde_json::json!({ "x": split.x, "y": split.y }))
                .map_err(|e| DatasetError::Invalid(e.to_string()))
                .and_then(|bytes| write_atomic(&staged.location.join(format!("{name}.json")), &bytes));
            if let Err(e) = written {
                self.discard(&staged)?;
                return Err(e);
            }
        }

        debug!(url, location = %staged.location.display(), "datasets: staged");
        Ok(staged)
    }

    fn commit(&self, staged: &Staged) -> Result<()> {
        let target = self.get_path(&staged.url)?;
        if target.exists() {
            return Err(DatasetError::AlreadyStored(staged.url.clone()));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&staged.location, &target)?;

        info!(url = %staged.url, size = staged.content.size, hash = %staged.content.hash, shape = ?staged.content.shape, "datasets: stored");
        Ok(())
    }

    fn discard(&self, staged: &Staged) -> Result<()> {
        match fs::remove_dir_all(&staged.location) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn model_path(&self, url: &str) -> Result<PathBuf> {
        check_key(url)?;
        Ok(self.root.join("models").join(url))
    }
}
