//! Request-side operations on datasets, architectures, models and tasks.
//!
//! Access rules shared by every mutation:
//! - a record the caller cannot see is `NotFound`
//! - a record the caller can see but does not own is `AccessDenied`
//! - creating anything requires a signed-in caller

use std::sync::Arc;

use bytes::Bytes;
use metastore::{
    owned_by, visible_to, Architecture, ArchitecturePatch, Caller, Dataset, DatasetPatch,
    DatasetStatus, MetaError, MetadataRepository, Model, ModelPatch, NewArchitecture, NewDataset,
    NewModel, Operation, Page, Record, Task, TaskConfig,
};
use modelops::{DatasetStorage, MAX_DATASET_SIZE};
use serde_json::{Map, Value as JsonValue};
use tracing::{info, warn};

use crate::error::ServiceError;
use crate::queue::JobQueue;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Clone)]
pub struct ResourceService {
    repo: MetadataRepository,
    datasets: Arc<dyn DatasetStorage>,
    queue: Arc<dyn JobQueue>,
    max_upload: u64,
}

/// Content is accepted once, while the dataset is still `PENDING`.
fn ensure_pending(ds: &Dataset) -> Result<()> {
    if ds.status != DatasetStatus::Pending {
        return Err(MetaError::Conflict(format!(
            "dataset {} is {}, content can only be uploaded once",
            ds.id,
            ds.status.as_str()
        ))
        .into());
    }
    Ok(())
}

fn require_user(caller: &Caller) -> Result<&str> {
    caller
        .id()
        .ok_or_else(|| MetaError::AccessDenied("sign in required".into()).into())
}

impl ResourceService {
    pub fn new(
        repo: MetadataRepository,
        datasets: Arc<dyn DatasetStorage>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            repo,
            datasets,
            queue,
            max_upload: MAX_DATASET_SIZE,
        }
    }

    /// Overrides the upload size limit (bytes).
    pub fn with_max_upload(mut self, bytes: u64) -> Self {
        self.max_upload = bytes;
        self
    }

    pub fn repository(&self) -> &MetadataRepository {
        &self.repo
    }

    async fn visible<T: Record>(&self, caller: &Caller, id: &str) -> Result<T> {
        Ok(self.repo.find_by_id::<T>(id, visible_to(caller)).await?)
    }

    /// Visible first, owned second, so a hidden record never reveals itself
    /// through `AccessDenied`.
    async fn owned<T: Record>(&self, caller: &Caller, id: &str) -> Result<T> {
        let rec: T = self.visible(caller, id).await?;
        if caller.id() != Some(rec.owner()) {
            return Err(MetaError::AccessDenied(format!("{} {} belongs to another user", T::KIND, id)).into());
        }
        Ok(rec)
    }

    async fn list<T: Record>(&self, caller: &Caller, page: Page) -> Result<Vec<T>> {
        Ok(self.repo.list::<T>(&visible_to(caller), page).await?)
    }

    async fn count<T: Record>(&self, caller: &Caller) -> Result<u64> {
        Ok(self.repo.count::<T>(&visible_to(caller)).await?)
    }

    async fn delete<T: Record>(&self, caller: &Caller, id: &str) -> Result<()> {
        self.owned::<T>(caller, id).await?;
        self.repo.delete::<T>(id).await?;
        info!(kind = %T::KIND, id, "service: deleted");
        Ok(())
    }

    // ---- datasets ----

    pub async fn create_dataset(&self, caller: &Caller, new: NewDataset) -> Result<Dataset> {
        let user = require_user(caller)?;
        let ds = self.repo.create(new.into_record(user)?).await?;
        info!(id = %ds.id, owner = user, "service: dataset created");
        Ok(ds)
    }

    pub async fn get_dataset(&self, caller: &Caller, id: &str) -> Result<Dataset> {
        self.visible(caller, id).await
    }

    pub async fn list_datasets(&self, caller: &Caller, page: Page) -> Result<Vec<Dataset>> {
        self.list(caller, page).await
    }

    pub async fn count_datasets(&self, caller: &Caller) -> Result<u64> {
        self.count::<Dataset>(caller).await
    }

    pub async fn update_dataset(
        &self,
        caller: &Caller,
        id: &str,
        patch: DatasetPatch,
    ) -> Result<Dataset> {
        patch.validate()?;
        self.owned::<Dataset>(caller, id).await?;
        Ok(self.repo.update::<Dataset>(id, |ds| patch.apply(ds)).await?)
    }

    /// Published datasets are never deleted, whoever asks.
    pub async fn delete_dataset(&self, caller: &Caller, id: &str) -> Result<()> {
        let ds: Dataset = self.visible(caller, id).await?;
        if ds.status == DatasetStatus::Published {
            return Err(MetaError::Conflict(format!("dataset {id} is published")).into());
        }
        self.delete::<Dataset>(caller, id).await
    }

    /// Stores the content of a `PENDING` dataset and moves it to `RECEIVED`.
    /// If the content is rejected the dataset moves to `FAILURE`.
    ///
    /// Content is staged first and only committed once the versioned move to
    /// `RECEIVED` has been flushed, so a concurrent upload that loses the race
    /// gets `Conflict` and leaves the stored content untouched.
    pub async fn upload_dataset(&self, caller: &Caller, id: &str, content: Bytes) -> Result<Dataset> {
        let size = content.len() as u64;
        if size > self.max_upload {
            return Err(MetaError::Validation(format!(
                "upload of {size} bytes exceeds the {} byte limit",
                self.max_upload
            ))
            .into());
        }
        let ds: Dataset = self.owned(caller, id).await?;
        ensure_pending(&ds)?;

        let storage = self.datasets.clone();
        let url = ds.url.clone();
        let staged = match tokio::task::spawn_blocking(move || storage.stage(&url, &content)).await? {
            Ok(staged) => staged,
            Err(e) => {
                warn!(id, error = %e, "service: dataset upload rejected");
                self.repo
                    .edit::<Dataset>(id)
                    .await?
                    .scope(|ds| -> Result<()> {
                        ensure_pending(ds)?;
                        Ok(ds.advance(DatasetStatus::Failure)?)
                    })
                    .await?;
                return Err(e.into());
            }
        };

        let stored = staged.content.clone();
        let claimed = match self.repo.edit::<Dataset>(id).await {
            Ok(ctx) => {
                ctx.scope(|ds| -> Result<()> {
                    ensure_pending(ds)?;
                    ds.advance(DatasetStatus::Received)?;
                    ds.base.size = Some(stored.size);
                    ds.base.hash = Some(stored.hash);
                    if !stored.shape.is_empty() {
                        ds.base.shape = stored.shape;
                    }
                    Ok(())
                })
                .await
            }
            Err(e) => Err(e.into()),
        };

        let storage = self.datasets.clone();
        let ds = match claimed {
            Ok((ds, ())) => ds,
            Err(e) => {
                tokio::task::spawn_blocking(move || storage.discard(&staged)).await??;
                return Err(e);
            }
        };

        let committed = tokio::task::spawn_blocking(move || {
            let committed = storage.commit(&staged);
            if committed.is_err() {
                if let Err(e) = storage.discard(&staged) {
                    warn!(url = %staged.url, error = %e, "service: could not discard staged upload");
                }
            }
            committed
        })
        .await?;
        if let Err(e) = committed {
            warn!(id, error = %e, "service: received dataset could not be committed");
            self.repo
                .edit::<Dataset>(id)
                .await?
                .scope(|ds| -> Result<()> { Ok(ds.advance(DatasetStatus::Failure)?) })
                .await?;
            return Err(e.into());
        }

        info!(id = %ds.id, size = ?ds.base.size, "service: dataset received");
        Ok(ds)
    }

    pub async fn publish_dataset(&self, caller: &Caller, id: &str) -> Result<Dataset> {
        let ds: Dataset = self.owned(caller, id).await?;
        if ds.status != DatasetStatus::Received {
            return Err(MetaError::Conflict(format!(
                "dataset {id} is {}, only received datasets can be published",
                ds.status.as_str()
            ))
            .into());
        }
        let (ds, ()) = self
            .repo
            .edit::<Dataset>(id)
            .await?
            .scope(|ds| {
                ds.advance(DatasetStatus::Published)?;
                ds.published_at = Some(metastore::now_ts());
                Ok::<_, MetaError>(())
            })
            .await?;
        Ok(ds)
    }

    // ---- architectures ----

    /// An explicit id in the payload is used as is and must be free.
    pub async fn create_architecture(
        &self,
        caller: &Caller,
        new: NewArchitecture,
    ) -> Result<Architecture> {
        let user = require_user(caller)?;
        let arch = match new.into_record(user)? {
            (Some(id), arch) => self.repo.create_with_id(arch, id).apply(|_| {}).await?,
            (None, arch) => self.repo.create(arch).await?,
        };
        info!(id = %arch.id, owner = user, "service: architecture created");
        Ok(arch)
    }

    pub async fn get_architecture(&self, caller: &Caller, id: &str) -> Result<Architecture> {
        self.visible(caller, id).await
    }

    pub async fn list_architectures(&self, caller: &Caller, page: Page) -> Result<Vec<Architecture>> {
        self.list(caller, page).await
    }

    pub async fn count_architectures(&self, caller: &Caller) -> Result<u64> {
        self.count::<Architecture>(caller).await
    }

    pub async fn update_architecture(
        &self,
        caller: &Caller,
        id: &str,
        patch: ArchitecturePatch,
    ) -> Result<Architecture> {
        patch.validate()?;
        self.owned::<Architecture>(caller, id).await?;
        Ok(self.repo.update::<Architecture>(id, |a| patch.apply(a)).await?)
    }

    pub async fn delete_architecture(&self, caller: &Caller, id: &str) -> Result<()> {
        self.delete::<Architecture>(caller, id).await
    }

    // ---- models ----

    /// The architecture must belong to the caller; the dataset, if given,
    /// must be visible to them. Either missing is `NotFound`.
    pub async fn create_model(&self, caller: &Caller, new: NewModel) -> Result<Model> {
        let user = require_user(caller)?;
        self.repo
            .find_by_id::<Architecture>(&new.architecture, owned_by(user, &new.architecture))
            .await?;
        let shape = match &new.dataset {
            Some(dataset_id) => self.visible::<Dataset>(caller, dataset_id).await?.base.shape,
            None => Vec::new(),
        };

        let mut model = new.into_record(user)?;
        model.base.shape = shape;
        let model = self.repo.create(model).await?;
        info!(id = %model.id, owner = user, architecture = %model.architecture, "service: model created");
        Ok(model)
    }

    pub async fn get_model(&self, caller: &Caller, id: &str) -> Result<Model> {
        self.visible(caller, id).await
    }

    pub async fn list_models(&self, caller: &Caller, page: Page) -> Result<Vec<Model>> {
        self.list(caller, page).await
    }

    pub async fn count_models(&self, caller: &Caller) -> Result<u64> {
        self.count::<Model>(caller).await
    }

    pub async fn update_model(&self, caller: &Caller, id: &str, patch: ModelPatch) -> Result<Model> {
        patch.validate()?;
        self.owned::<Model>(caller, id).await?;
        Ok(self.repo.update::<Model>(id, |m| patch.apply(m)).await?)
    }

    /// Tasks and artifacts that reference the model are left in place.
    pub async fn delete_model(&self, caller: &Caller, id: &str) -> Result<()> {
        self.delete::<Model>(caller, id).await
    }

    // ---- tasks ----

    /// Creates a pending task and hands its id to the queue.
    ///
    /// Training needs ownership of the model; testing and prediction only
    /// need to see it.
    pub async fn submit_task(
        &self,
        caller: &Caller,
        model_id: &str,
        operation: Operation,
        config: TaskConfig,
    ) -> Result<Task> {
        let user = require_user(caller)?;
        config.validate(operation)?;

        let model: Model = match operation {
            Operation::Train => self.owned(caller, model_id).await?,
            Operation::Test | Operation::Predict => self.visible(caller, model_id).await?,
        };
        if let Some(dataset_id) = &config.dataset {
            self.visible::<Dataset>(caller, dataset_id).await?;
        }

        let task = self
            .repo
            .create(Task::new(user, model.id, operation, config))
            .await?;
        self.queue.enqueue(&task.id).await?;
        info!(task_id = %task.id, operation = operation.as_str(), model = %task.model, "service: task submitted");
        Ok(task)
    }

    pub async fn train(&self, caller: &Caller, model_id: &str, config: TaskConfig) -> Result<Task> {
        self.submit_task(caller, model_id, Operation::Train, config).await
    }

    pub async fn test(&self, caller: &Caller, model_id: &str, config: TaskConfig) -> Result<Task> {
        self.submit_task(caller, model_id, Operation::Test, config).await
    }

    pub async fn predict(&self, caller: &Caller, model_id: &str, input: JsonValue) -> Result<Task> {
        let config = TaskConfig {
            input: Some(input),
            ..TaskConfig::default()
        };
        self.submit_task(caller, model_id, Operation::Predict, config).await
    }

    pub async fn get_task(&self, caller: &Caller, id: &str) -> Result<Task> {
        self.visible(caller, id).await
    }

    pub async fn list_tasks(&self, caller: &Caller, page: Page) -> Result<Vec<Task>> {
        self.list(caller, page).await
    }

    pub async fn count_tasks(&self, caller: &Caller) -> Result<u64> {
        self.count::<Task>(caller).await
    }

    pub async fn task_history(&self, caller: &Caller, id: &str) -> Result<Map<String, JsonValue>> {
        Ok(self.get_task(caller, id).await?.history)
    }
}
