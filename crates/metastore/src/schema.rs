use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{MetaError, Result};

/// Record collections held by the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Dataset,
    Architecture,
    Model,
    Task,
}

impl Kind {
    /// Collection name, also used as the `kind` column by SQL backends.
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Dataset => "datasets",
            Kind::Architecture => "architectures",
            Kind::Model => "models",
            Kind::Task => "tasks",
        }
    }

    pub fn parse(s: &str) -> Option<Kind> {
        match s {
            "datasets" => Some(Kind::Dataset),
            "architectures" => Some(Kind::Architecture),
            "models" => Some(Kind::Model),
            "tasks" => Some(Kind::Task),
            _ => None,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Dataset => "Dataset",
            Kind::Architecture => "Architecture",
            Kind::Model => "Model",
            Kind::Task => "Task",
        };
        f.write_str(name)
    }
}

/// Common identity and access fields of every stored record.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: Kind;

    fn id(&self) -> &str;

    /// Assigns the identity. Records with self-referential fields (the
    /// storage `url`) update them here.
    fn set_id(&mut self, id: String);

    fn owner(&self) -> &str;

    fn is_public(&self) -> bool;
}

/// Descriptive fields shared by datasets, architectures and models.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceBase {
    pub owner: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub hash: Option<String>, // hex BLAKE3 of content
    pub date: i64,            // unix seconds at creation
    #[serde(default)]
    pub shape: Vec<u32>,
}

impl ResourceBase {
    pub fn new(owner: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            title: title.into(),
            date: crate::now_ts(),
            ..Default::default()
        }
    }
}

// ---- Dataset ----

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DatasetStatus {
    Pending,
    Received,
    Failure,
    Published,
}

impl DatasetStatus {
    /// Dataset status only moves forward.
    pub fn can_advance_to(self, next: DatasetStatus) -> bool {
        use DatasetStatus::*;
        matches!(
            (self, next),
            (Pending, Received) | (Pending, Failure) | (Received, Published) | (Received, Failure)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetStatus::Pending => "PENDING",
            DatasetStatus::Received => "RECEIVED",
            DatasetStatus::Failure => "FAILURE",
            DatasetStatus::Published => "PUBLISHED",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetCategory {
    Classification,
    Regression,
}

impl DatasetCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetCategory::Classification => "classification",
            DatasetCategory::Regression => "regression",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub url: String, // storage key, mirrors id
    pub status: DatasetStatus,
    pub is_public: bool,
    pub base: ResourceBase,
    #[serde(default)]
    pub published_at: Option<i64>,
}

impl Dataset {
    pub fn new(base: ResourceBase) -> Self {
        Self {
            id: String::new(),
            url: String::new(),
            status: DatasetStatus::Pending,
            is_public: false,
            base,
            published_at: None,
        }
    }

    pub fn advance(&mut self, next: DatasetStatus) -> Result<()> {
        if !self.status.can_advance_to(next) {
            return Err(MetaError::InvalidTransition {
                kind: Kind::Dataset,
                id: self.id.clone(),
                from: self.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        self.status = next;
        Ok(())
    }
}

impl Record for Dataset {
    const KIND: Kind = Kind::Dataset;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.url = id.clone();
        self.id = id;
    }

    fn owner(&self) -> &str {
        &self.base.owner
    }

    fn is_public(&self) -> bool {
        self.is_public
    }
}

// ---- Architecture ----

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Architecture {
    pub id: String,
    pub is_public: bool,
    pub base: ResourceBase,
    /// Layer graph, only interpreted by the model backend.
    pub architecture: serde_json::Value,
}

impl Architecture {
    pub fn new(base: ResourceBase, architecture: serde_json::Value) -> Self {
        Self {
            id: String::new(),
            is_public: false,
            base,
            architecture,
        }
    }
}

impl Record for Architecture {
    const KIND: Kind = Kind::Architecture;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn owner(&self) -> &str {
        &self.base.owner
    }

    fn is_public(&self) -> bool {
        self.is_public
    }
}

// ---- Model ----

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelStatus {
    Pending,
    Initialize,
    Training,
    Testing,
    Ready,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub url: String,
    pub status: ModelStatus,
    pub is_public: bool,
    pub base: ResourceBase,
    /// Weak references: ids only, resolved by lookup.
    pub architecture: String,
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    /// Location of the trained artifact, set after a successful train.
    #[serde(default)]
    pub artifact: Option<String>,
}

impl Model {
    pub fn new(base: ResourceBase, architecture: impl Into<String>, dataset: Option<String>) -> Self {
        Self {
            id: String::new(),
            url: String::new(),
            status: ModelStatus::Pending,
            is_public: false,
            base,
            architecture: architecture.into(),
            dataset,
            accuracy: None,
            metrics: BTreeMap::new(),
            artifact: None,
        }
    }
}

impl Record for Model {
    const KIND: Kind = Kind::Model;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.url = id.clone();
        self.id = id;
    }

    fn owner(&self) -> &str {
        &self.base.owner
    }

    fn is_public(&self) -> bool {
        self.is_public
    }
}
