//! Storage trait and implementations

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::query::{Page, Predicate};
use crate::schema::Kind;
use crate::{MetaError, Result};

/// A record as the backend sees it: indexed access columns plus the full
/// JSON body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub kind: Kind,
    pub id: String,
    pub owner: String,
    pub is_public: bool,
    /// Bumped on every replace; used for optimistic concurrency.
    pub version: u64,
    pub body: serde_json::Value,
}

/// Durable document store contract.
///
/// Every method is atomic for the single record it touches. There is no
/// cross-record transaction.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fails with `Conflict` when the id is already taken.
    async fn insert(&self, doc: StoredDocument) -> Result<()>;

    async fn get(&self, kind: Kind, id: &str) -> Result<Option<StoredDocument>>;

    /// Writes `doc` only if the stored version equals `expected_version`.
    /// Returns the new version.
    async fn replace(&self, doc: StoredDocument, expected_version: u64) -> Result<u64>;

    /// Returns whether a record was removed.
    async fn delete(&self, kind: Kind, id: &str) -> Result<bool>;

    /// Matching records in insertion order, windowed by `page`.
    async fn find(&self, kind: Kind, predicate: &Predicate, page: Page)
        -> Result<Vec<StoredDocument>>;

    async fn count(&self, kind: Kind, predicate: &Predicate) -> Result<u64>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Row {
    seq: u64,
    doc: StoredDocument,
}

/// Shared table logic for the in-process backends.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Table {
    next_seq: u64,
    rows: BTreeMap<String, Row>,
}

fn row_key(kind: Kind, id: &str) -> String {
    format!("{}:{}", kind.as_str(), id)
}

impl Table {
    fn insert(&mut self, mut doc: StoredDocument) -> Result<()> {
        let key = row_key(doc.kind, &doc.id);
        if self.rows.contains_key(&key) {
            return Err(MetaError::Conflict(format!("{} {} already exists", doc.kind, doc.id)));
        }
        if doc.version == 0 {
            doc.version = 1;
        }
        self.next_seq += 1;
        self.rows.insert(key, Row { seq: self.next_seq, doc });
        Ok(())
    }

    fn get(&self, kind: Kind, id: &str) -> Option<StoredDocument> {
        self.rows.get(&row_key(kind, id)).map(|r| r.doc.clone())
    }

    fn replace(&mut self, mut doc: StoredDocument, expected_version: u64) -> Result<u64> {
        let key = row_key(doc.kind, &doc.id);
        let row = self
            .rows
            .get_mut(&key)
            .ok_or_else(|| MetaError::not_found(doc.kind, doc.id.clone()))?;

        if row.doc.version != expected_version {
            return Err(MetaError::Conflict(format!(
                "{} {} was modified concurrently (expected version {}, found {})",
                doc.kind, doc.id, expected_version, row.doc.version
            )));
        }

        doc.version = expected_version + 1;
        let version = doc.version;
        row.doc = doc;
        Ok(version)
    }

    fn delete(&mut self, kind: Kind, id: &str) -> bool {
        self.rows.remove(&row_key(kind, id)).is_some()
    }

    fn matching<'a>(
        &'a self,
        kind: Kind,
        predicate: &'a Predicate,
    ) -> impl Iterator<Item = &'a Row> + 'a {
        self.rows
            .values()
            .filter(move |r| r.doc.kind == kind && predicate.matches(&r.doc))
    }

    fn find(&self, kind: Kind, predicate: &Predicate, page: Page) -> Vec<StoredDocument> {
        let mut rows: Vec<&Row> = self.matching(kind, predicate).collect();
        rows.sort_by_key(|r| r.seq);
        rows.into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .map(|r| r.doc.clone())
            .collect()
    }

    fn count(&self, kind: Kind, predicate: &Predicate) -> u64 {
        self.matching(kind, predicate).count() as u64
    }
}

/// In-memory storage (for testing and embedding)
#[derive(Clone, Default)]
pub struct InMemoryStore {
    table: Arc<RwLock<Table>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn insert(&self, doc: StoredDocument) -> Result<()> {
        self.table.write().await.insert(doc)
    }

    async fn get(&self, kind: Kind, id: &str) -> Result<Option<StoredDocument>> {
        Ok(self.table.read().await.get(kind, id))
    }

    async fn replace(&self, doc: StoredDocument, expected_version: u64) -> Result<u64> {
        self.table.write().await.replace(doc, expected_version)
    }

    async fn delete(&self, kind: Kind, id: &str) -> Result<bool> {
        Ok(self.table.write().await.delete(kind, id))
    }

    async fn find(
        &self,
        kind: Kind,
        predicate: &Predicate,
        page: Page,
    ) -> Result<Vec<StoredDocument>> {
        Ok(self.table.read().await.find(kind, predicate, page))
    }

    async fn count(&self, kind: Kind, predicate: &Predicate) -> Result<u64> {
        Ok(self.table.read().await.count(kind, predicate))
    }
}

/// JSON snapshot on disk.
///
/// A write is applied to a copy of the table, the copy is written to a temp
/// file and renamed over the snapshot, and only then swapped in. A failed
/// write leaves both the file and the in-memory table unchanged.
pub struct FileBackedStore {
    path: PathBuf,
    table: Mutex<Table>,
}

impl FileBackedStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let table = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Table::default(),
            Err(e) => return Err(MetaError::Storage(format!("{}: {e}", path.display()))),
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MetaError::Storage(format!("{}: {e}", parent.display())))?;
        }

        tracing::debug!(path = %path.display(), "metastore: file store opened");
        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, table: &Table) -> Result<()> {
        let bytes = serde_json::to_vec(table)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| MetaError::Storage(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| MetaError::Storage(format!("{}: {e}", self.path.display())))?;
        Ok(())
    }

    async fn write<R>(&self, f: impl FnOnce(&mut Table) -> Result<R>) -> Result<R> {
        let mut guard = self.table.lock().await;
        let mut next = guard.clone();
        let out = f(&mut next)?;
        self.persist(&next).await?;
        *guard = next;
        Ok(out)
    }
}

#[async_trait]
impl DocumentStore for FileBackedStore {
    async fn insert(&self, doc: StoredDocument) -> Result<()> {
        self.write(|t| t.insert(doc)).await
    }

    async fn get(&self, kind: Kind, id: &str) -> Result<Option<StoredDocument>> {
        Ok(self.table.lock().await.get(kind, id))
    }

    async fn replace(&self, doc: StoredDocument, expected_version: u64) -> Result<u64> {
        self.write(|t| t.replace(doc, expected_version)).await
    }

    async fn delete(&self, kind: Kind, id: &str) -> Result<bool> {
        // no rewrite when nothing was removed
        if self.table.lock().await.get(kind, id).is_none() {
            return Ok(false);
        }
        self.write(|t| Ok(t.delete(kind, id))).await
    }

    async fn find(
        &self,
        kind: Kind,
        predicate: &Predicate,
        page: Page,
    ) -> Result<Vec<StoredDocument>> {
        Ok(self.table.lock().await.find(kind, predicate, page))
    }

    async fn count(&self, kind: Kind, predicate: &Predicate) -> Result<u64> {
        Ok(self.table.lock().await.count(kind, predicate))
    }
}
