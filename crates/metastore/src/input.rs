//! Creation payloads and update patches.
//!
//! Every accepted field is listed explicitly. Untyped JSON goes through
//! `from_json`, which rejects unknown keys instead of silently dropping
//! them. Identity, owner, status and references are never patchable.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::schema::{Architecture, Dataset, DatasetCategory, Model, ResourceBase};
use crate::{MetaError, Result};

fn parse<T: DeserializeOwned>(value: JsonValue) -> Result<T> {
    serde_json::from_value(value).map_err(|e| MetaError::Validation(e.to_string()))
}

fn check_title(title: &str) -> Result<()> {
    if title.trim().is_empty() {
        return Err(MetaError::Validation("title must not be empty".into()));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewDataset {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<DatasetCategory>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub shape: Vec<u32>,
    #[serde(default)]
    pub is_public: bool,
}

impl NewDataset {
    pub fn from_json(value: JsonValue) -> Result<Self> {
        parse(value)
    }

    pub fn into_record(self, owner: &str) -> Result<Dataset> {
        check_title(&self.title)?;
        let mut base = ResourceBase::new(owner, self.title);
        base.description = self.description;
        base.category = self.category.map(|c| c.as_str().to_string());
        base.labels = self.labels;
        base.shape = self.shape;

        let mut ds = Dataset::new(base);
        ds.is_public = self.is_public;
        Ok(ds)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<DatasetCategory>,
    #[serde(default)]
    pub labels: Option<Vec<String>>,
    #[serde(default)]
    pub shape: Option<Vec<u32>>,
    #[serde(default)]
    pub is_public: Option<bool>,
}

impl DatasetPatch {
    pub fn from_json(value: JsonValue) -> Result<Self> {
        parse(value)
    }

    pub fn validate(&self) -> Result<()> {
        match &self.title {
            Some(t) => check_title(t),
            None => Ok(()),
        }
    }

    pub fn apply(self, ds: &mut Dataset) {
        if let Some(title) = self.title {
            ds.base.title = title;
        }
        if let Some(description) = self.description {
            ds.base.description = Some(description);
        }
        if let Some(category) = self.category {
            ds.base.category = Some(category.as_str().to_string());
        }
        if let Some(labels) = self.labels {
            ds.base.labels = labels;
        }
        if let Some(shape) = self.shape {
            ds.base.shape = shape;
        }
        if let Some(is_public) = self.is_public {
            ds.is_public = is_public;
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewArchitecture {
    /// Optional caller-chosen id; a fresh one is generated otherwise.
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub is_public: bool,
    pub architecture: JsonValue,
}

impl NewArchitecture {
    pub fn from_json(value: JsonValue) -> Result<Self> {
        parse(value)
    }

    pub fn into_record(self, owner: &str) -> Result<(Option<String>, Architecture)> {
        check_title(&self.title)?;
        if self.architecture.is_null() {
            return Err(MetaError::Validation("architecture must not be null".into()));
        }
        if let Some(id) = &self.id {
            if id.trim().is_empty() {
                return Err(MetaError::Validation("id must not be empty".into()));
            }
        }

        let mut base = ResourceBase::new(owner, self.title);
        base.description = self.description;
        base.category = self.category;

        let mut arch = Architecture::new(base, self.architecture);
        arch.is_public = self.is_public;
        Ok((self.id, arch))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArchitecturePatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub is_public: Option<bool>,
    #[serde(default)]
    pub architecture: Option<JsonValue>,
}

impl ArchitecturePatch {
    pub fn from_json(value: JsonValue) -> Result<Self> {
        parse(value)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(t) = &self.title {
            check_title(t)?;
        }
        if matches!(self.architecture, Some(JsonValue::Null)) {
            return Err(MetaError::Validation("architecture must not be null".into()));
        }
        Ok(())
    }

    pub fn apply(self, arch: &mut Architecture) {
        if let Some(title) = self.title {
            arch.base.title = title;
        }
        if let Some(description) = self.description {
            arch.base.description = Some(description);
        }
        if let Some(category) = self.category {
            arch.base.category = Some(category);
        }
        if let Some(is_public) = self.is_public {
            arch.is_public = is_public;
        }
        if let Some(architecture) = self.architecture {
            arch.architecture = architecture;
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewModel {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub is_public: bool,
    pub architecture: String,
    #[serde(default)]
    pub dataset: Option<String>,
}

impl NewModel {
    pub fn from_json(value: JsonValue) -> Result<Self> {
        parse(value)
    }

    /// Builds the record. The references are not checked here; the caller
    /// resolves them first.
    pub fn into_record(self, owner: &str) -> Result<Model> {
        check_title(&self.title)?;
        let mut base = ResourceBase::new(owner, self.title);
        base.description = self.description;
        base.category = self.category;
        base.labels = self.labels;

        let mut model = Model::new(base, self.architecture, self.dataset);
        model.is_public = self.is_public;
        Ok(model)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub labels: Option<Vec<String>>,
    #[serde(default)]
    pub is_public: Option<bool>,
}

impl ModelPatch {
    pub fn from_json(value: JsonValue) -> Result<Self> {
        parse(value)
    }

    pub fn validate(&self) -> Result<()> {
        match &self.title {
            Some(t) => check_title(t),
            None => Ok(()),
        }
    }

    pub fn apply(self, model: &mut Model) {
        if let Some(title) = self.title {
            model.base.title = title;
        }
        if let Some(description) = self.description {
            model.base.description = Some(description);
        }
        if let Some(category) = self.category {
            model.base.category = Some(category);
        }
        if let Some(labels) = self.labels {
            model.base.labels = labels;
        }
        if let Some(is_public) = self.is_public {
            model.is_public = is_public;
        }
    }
}
