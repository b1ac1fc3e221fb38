//! Runs one task end to end: resolve, mirror status, call the backend,
//! record the outcome.

use std::path::PathBuf;
use std::sync::Arc;

use metastore::{
    now_ts, Architecture, Dataset, ErrorRecord, MetaError, MetadataRepository, Model,
    ModelStatus, Operation, Record, Task, TaskConfig, TaskStatus,
};
use modelops::{
    Artifact, DatasetSource, DatasetStorage, FitData, Metrics, ModelBackend, TrainConfig,
};
use serde_json::{json, Map, Value as JsonValue};
use tracing::{error, info, warn};

use crate::error::ExecutionError;
use crate::queue::JobQueue;

type Result<T> = std::result::Result<T, ExecutionError>;

/// Everything the blocking part of a run needs, detached from the store.
#[derive(Clone, Debug)]
struct Job {
    task_id: String,
    operation: Operation,
    config: TaskConfig,
    architecture: JsonValue,
    input_shape: Vec<u32>,
    dataset_url: Option<String>,
    model_url: String,
    artifact: Option<PathBuf>,
}

impl Job {
    fn train_config(&self) -> TrainConfig {
        TrainConfig {
            batch_size: self.config.batch_size,
            epochs: self.config.epochs,
            optimizer: self.config.optimizer.clone(),
            loss: self.config.loss.clone(),
            learning_rate: self.config.learning_rate,
            metrics: self.config.metrics.clone(),
        }
    }
}

/// What the backend produced for one operation.
#[derive(Debug)]
enum Produced {
    Trained {
        artifact: PathBuf,
        history: JsonValue,
        metrics: Metrics,
    },
    Tested {
        metrics: Metrics,
    },
    Predicted {
        output: JsonValue,
    },
}

impl Produced {
    fn history(&self) -> Map<String, JsonValue> {
        let mut out = Map::new();
        match self {
            Produced::Trained {
                history, metrics, ..
            } => {
                out.insert("train".into(), history.clone());
                if !metrics.is_empty() {
                    out.insert("metrics".into(), json!(metrics));
                }
            }
            Produced::Tested { metrics } => {
                out.insert("metrics".into(), json!(metrics));
            }
            Produced::Predicted { output } => {
                out.insert("result".into(), output.clone());
            }
        }
        out
    }
}

pub struct JobExecutor {
    repo: MetadataRepository,
    backend: Arc<dyn ModelBackend>,
    datasets: Arc<dyn DatasetStorage>,
    queue: Arc<dyn JobQueue>,
}

impl JobExecutor {
    pub fn new(
        repo: MetadataRepository,
        backend: Arc<dyn ModelBackend>,
        datasets: Arc<dyn DatasetStorage>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            repo,
            backend,
            datasets,
            queue,
        }
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Executes the task `task_id` and returns its final status.
    ///
    /// A task that is already terminal is left alone. A task found still
    /// `Started` was abandoned by an earlier delivery and is failed as
    /// interrupted.
    pub async fn execute(&self, task_id: &str) -> Result<TaskStatus> {
        let task = match self.repo.get::<Task>(task_id).await {
            Ok(task) => task,
            Err(MetaError::NotFound { .. }) => {
                let err = ExecutionError::TaskNotFound(task_id.to_string());
                warn!(task_id, "executor: task does not exist");
                self.queue.mark_failed(task_id, &err.to_string()).await?;
                return Err(err);
            }
            Err(e) => return Err(e.into()),
        };

        match task.status {
            TaskStatus::Pending => {}
            TaskStatus::Started => {
                let err = ExecutionError::Interrupted(task_id.to_string());
                warn!(task_id, "executor: task was left started by an earlier run");
                self.release_model(&task).await;
                self.record_failure(task_id, &err).await?;
                return Err(err);
            }
            status => {
                info!(task_id, status = status.as_str(), "executor: task already finished, skipping");
                return Ok(status);
            }
        }

        let task = self
            .repo
            .edit::<Task>(task_id)
            .await?
            .scope(|t| t.start(now_ts()))
            .await?
            .0;
        info!(task_id, operation = task.operation.as_str(), model = %task.model, "executor: task started");

        let mut restore: Option<(String, ModelStatus)> = None;
        let outcome = match self.run(&task, &mut restore).await {
            Ok(produced) => self.settle(&task, produced, &mut restore).await,
            Err(err) => Err(err),
        };
        match outcome {
            Ok(()) => {
                info!(task_id, "executor: task succeeded");
                Ok(TaskStatus::Success)
            }
            Err(err) => {
                error!(task_id, error = %err, kind = err.kind_name(), "executor: task failed");
                if let Some((model_id, status)) = restore {
                    if let Err(e) = self.set_model_status(&model_id, status).await {
                        warn!(task_id, model = %model_id, error = %e, "executor: could not restore model status");
                    }
                }
                if let Err(e) = self.record_failure(task_id, &err).await {
                    error!(task_id, error = %e, "executor: could not record task failure");
                }
                Err(err)
            }
        }
    }

    /// Writes the backend's results to the model and completes the task.
    /// `restore` is cleared once the model has been settled.
    async fn settle(
        &self,
        task: &Task,
        produced: Produced,
        restore: &mut Option<(String, ModelStatus)>,
    ) -> Result<()> {
        self.finish_model(task, &produced, restore.clone()).await?;
        *restore = None;

        let history = produced.history();
        self.repo
            .edit::<Task>(&task.id)
            .await?
            .scope(|t| t.complete(history, now_ts()))
            .await?;
        Ok(())
    }

    /// Undoes the status mirror left by a run that never finished. A model
    /// still `TRAINING` or `TESTING` for this task goes back to `READY` when
    /// it has a trained artifact, else `PENDING`.
    async fn release_model(&self, task: &Task) {
        let mirrored = match task.operation {
            Operation::Train => ModelStatus::Training,
            Operation::Test => ModelStatus::Testing,
            Operation::Predict => return,
        };
        let released = self
            .repo
            .update::<Model>(&task.model, |m| {
                if m.status == mirrored {
                    m.status = if m.artifact.is_some() {
                        ModelStatus::Ready
                    } else {
                        ModelStatus::Pending
                    };
                }
            })
            .await;
        match released {
            Ok(model) => info!(task_id = %task.id, model = %model.id, status = ?model.status, "executor: released model"),
            Err(e) => warn!(task_id = %task.id, model = %task.model, error = %e, "executor: could not release model"),
        }
    }

    async fn record_failure(&self, task_id: &str, err: &ExecutionError) -> Result<()> {
        let record = ErrorRecord::from_error(err.kind_name(), err);
        self.repo
            .edit::<Task>(task_id)
            .await?
            .scope(|t| t.fail(record, now_ts()))
            .await?;
        Ok(())
    }

    async fn reference<T: Record>(&self, id: &str) -> Result<T> {
        match self.repo.get::<T>(id).await {
            Ok(rec) => Ok(rec),
            Err(MetaError::NotFound { .. }) => Err(ExecutionError::MissingReference {
                kind: T::KIND,
                id: id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_model_status(&self, model_id: &str, status: ModelStatus) -> Result<Model> {
        Ok(self
            .repo
            .update::<Model>(model_id, |m| m.status = status)
            .await?)
    }

    /// Resolves references, mirrors the model status, and runs the backend.
    /// `restore` is filled once the model status has been changed.
    async fn run(
        &self,
        task: &Task,
        restore: &mut Option<(String, ModelStatus)>,
    ) -> Result<Produced> {
        let model: Model = self.reference(&task.model).await?;
        let architecture: Architecture = self.reference(&model.architecture).await?;

        let dataset_id = task.config.dataset.clone().or_else(|| model.dataset.clone());
        let dataset: Option<Dataset> = match (&dataset_id, task.operation.needs_dataset()) {
            (Some(id), true) => Some(self.reference(id).await?),
            // predict only borrows the input shape
            (Some(id), false) => match self.repo.get::<Dataset>(id).await {
                Ok(ds) => Some(ds),
                Err(MetaError::NotFound { .. }) => None,
                Err(e) => return Err(e.into()),
            },
            (None, true) => {
                return Err(MetaError::Validation(format!(
                    "{} needs a dataset but model {} has none",
                    task.operation.as_str(),
                    model.id
                ))
                .into())
            }
            (None, false) => None,
        };

        let mirror = match task.operation {
            Operation::Train => Some(ModelStatus::Training),
            Operation::Test => Some(ModelStatus::Testing),
            Operation::Predict => None,
        };
        if let Some(status) = mirror {
            self.set_model_status(&model.id, status).await?;
            *restore = Some((model.id.clone(), model.status));
        }

        let input_shape = dataset
            .as_ref()
            .map(|d| d.base.shape.clone())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| model.base.shape.clone());

        let job = Job {
            task_id: task.id.clone(),
            operation: task.operation,
            config: task.config.clone(),
            architecture: architecture.architecture,
            input_shape,
            dataset_url: dataset.map(|d| d.url),
            model_url: model.url,
            artifact: model.artifact.map(PathBuf::from),
        };

        let backend = self.backend.clone();
        let datasets = self.datasets.clone();
        tokio::task::spawn_blocking(move || perform(backend.as_ref(), datasets.as_ref(), &job))
            .await?
    }

    async fn finish_model(
        &self,
        task: &Task,
        produced: &Produced,
        restore: Option<(String, ModelStatus)>,
    ) -> Result<()> {
        match produced {
            Produced::Trained {
                artifact, metrics, ..
            } => {
                let location = artifact.to_string_lossy().into_owned();
                let metrics = metrics.clone();
                self.repo
                    .update::<Model>(&task.model, move |m| {
                        m.accuracy = metrics
                            .get("accuracy")
                            .or_else(|| metrics.get("acc"))
                            .copied()
                            .or(m.accuracy);
                        if !metrics.is_empty() {
                            m.metrics = metrics;
                        }
                        m.artifact = Some(location);
                        m.status = ModelStatus::Ready;
                    })
                    .await?;
            }
            Produced::Tested { .. } | Produced::Predicted { .. } => {
                if let Some((model_id, status)) = restore {
                    self.set_model_status(&model_id, status).await?;
                }
            }
        }
        Ok(())
    }
}

fn open_dataset(datasets: &dyn DatasetStorage, job: &Job) -> Result<DatasetSource> {
    let url = job.dataset_url.as_deref().ok_or_else(|| {
        MetaError::Validation(format!("{} needs a dataset", job.operation.as_str()))
    })?;
    Ok(datasets.open(url)?)
}

/// Loads the trained artifact when there is one, else builds a fresh model.
fn materialize(backend: &dyn ModelBackend, job: &Job) -> Result<Artifact> {
    match &job.artifact {
        Some(path) => Ok(backend.load(path)?),
        None => build(backend, job),
    }
}

fn build(backend: &dyn ModelBackend, job: &Job) -> Result<Artifact> {
    let mut artifact = backend.construct(&job.architecture, &job.input_shape)?;
    backend.configure(&mut artifact, &job.train_config())?;
    Ok(artifact)
}

fn perform(backend: &dyn ModelBackend, datasets: &dyn DatasetStorage, job: &Job) -> Result<Produced> {
    match job.operation {
        Operation::Train => {
            let source = open_dataset(datasets, job)?;
            let artifact = build(backend, job)?;

            let train = source.split("train")?;
            let validation = ["validation", "test"]
                .into_iter()
                .find(|name| source.has_split(name))
                .map(|name| source.split(name))
                .transpose()?;

            let config = job.train_config();
            info!(task_id = %job.task_id, epochs = config.epochs, batch_size = config.batch_size, "executor: fitting");
            let outcome = backend.fit(&artifact, &FitData { train, validation }, &config)?;

            let location = datasets.model_path(&job.model_url)?;
            backend.save(&outcome.artifact, &location)?;

            Ok(Produced::Trained {
                artifact: location,
                history: outcome.history,
                metrics: outcome.metrics,
            })
        }
        Operation::Test => {
            let source = open_dataset(datasets, job)?;
            let artifact = materialize(backend, job)?;
            let metrics = backend.evaluate(&artifact, &source.split("test")?)?;
            Ok(Produced::Tested { metrics })
        }
        Operation::Predict => {
            let input = job.config.input.as_ref().ok_or_else(|| {
                MetaError::Validation("predict requires an input".into())
            })?;
            let artifact = materialize(backend, job)?;
            let output = backend.predict(&artifact, input)?;
            Ok(Produced::Predicted { output })
        }
    }
}
