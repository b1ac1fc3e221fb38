use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use bytes::Bytes;
use metastore::{
    Caller, DatasetStatus, DocumentStore, InMemoryStore, Kind, MetaError, MetadataRepository,
    ModelStatus, NewArchitecture, NewDataset, NewModel, Operation, Page, Predicate, StoredDocument,
    Task, TaskConfig, TaskStatus,
};
use modelops::{
    Artifact, BackendError, DatasetError, DatasetSource, DatasetStorage, FitData, FitOutcome,
    FsDatasetStorage, Metrics, ModelBackend, SplitRef, Staged, TrainConfig,
};
use orchestrator::{
    run_worker_loop, ExecutionError, InMemoryQueue, JobExecutor, JobQueue, ResourceService,
    ServiceError, WorkerOptions,
};
use serde_json::{json, Value as JsonValue};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Holds one backend call until the test releases it.
struct Gate {
    op: &'static str,
    entered: oneshot::Sender<()>,
    release: oneshot::Receiver<()>,
}

#[derive(Default)]
struct FakeBackend {
    calls: Mutex<Vec<String>>,
    fail_on: Mutex<Option<&'static str>>,
    gate: Mutex<Option<Gate>>,
}

impl FakeBackend {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn fail_on(&self, op: &'static str) {
        *self.fail_on.lock().unwrap() = Some(op);
    }

    /// Makes the next `op` call block. The first receiver fires once the
    /// call is running; sending on the returned sender lets it finish.
    fn hold(&self, op: &'static str) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        *self.gate.lock().unwrap() = Some(Gate {
            op,
            entered: entered_tx,
            release: release_rx,
        });
        (entered_rx, release_tx)
    }

    fn pause(&self, op: &str) {
        let gate = {
            let mut gate = self.gate.lock().unwrap();
            match gate.as_ref() {
                Some(g) if g.op == op => gate.take(),
                _ => None,
            }
        };
        if let Some(gate) = gate {
            let _ = gate.entered.send(());
            let _ = gate.release.blocking_recv();
        }
    }

    fn record(&self, op: &str) -> Result<(), BackendError> {
        self.calls.lock().unwrap().push(op.to_string());
        if *self.fail_on.lock().unwrap() == Some(op) {
            return Err(BackendError::Worker(format!("{op} exploded")));
        }
        Ok(())
    }
}

impl ModelBackend for FakeBackend {
    fn construct(&self, architecture: &JsonValue, input_shape: &[u32]) -> Result<Artifact, BackendError> {
        self.record("construct")?;
        Ok(Artifact {
            handle: json!({ "arch": architecture }),
            input_shape: input_shape.to_vec(),
        })
    }

    fn configure(&self, _artifact: &mut Artifact, _config: &TrainConfig) -> Result<(), BackendError> {
        self.record("configure")
    }

    fn fit(&self, artifact: &Artifact, data: &FitData, _config: &TrainConfig) -> Result<FitOutcome, BackendError> {
        self.record("fit")?;
        self.pause("fit");
        assert_eq!(data.train.name, "train");
        Ok(FitOutcome {
            artifact: artifact.clone(),
            history: json!({ "loss": [0.7, 0.3] }),
            metrics: Metrics::from([("accuracy".to_string(), 0.9)]),
        })
    }

    fn evaluate(&self, _artifact: &Artifact, data: &SplitRef) -> Result<Metrics, BackendError> {
        self.record("evaluate")?;
        self.pause("evaluate");
        assert_eq!(data.name, "test");
        Ok(Metrics::from([
            ("loss".to_string(), 0.3),
            ("accuracy".to_string(), 0.88),
        ]))
    }

    fn predict(&self, _artifact: &Artifact, _input: &JsonValue) -> Result<JsonValue, BackendError> {
        self.record("predict")?;
        Ok(json!([0.1, 0.9]))
    }

    fn save(&self, _artifact: &Artifact, location: &Path) -> Result<(), BackendError> {
        self.record("save")?;
        if let Some(parent) = location.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(location, b"weights")?;
        Ok(())
    }

    fn load(&self, _location: &Path) -> Result<Artifact, BackendError> {
        self.record("load")?;
        Ok(Artifact {
            handle: json!("loaded"),
            input_shape: vec![2],
        })
    }
}

struct Harness {
    repo: MetadataRepository,
    queue: Arc<InMemoryQueue>,
    backend: Arc<FakeBackend>,
    service: ResourceService,
    executor: Arc<JobExecutor>,
    storage: Arc<dyn DatasetStorage>,
    _dir: tempfile::TempDir,
}

/// Filesystem storage that takes its time staging uploads.
struct SlowStorage {
    inner: FsDatasetStorage,
    delay: Duration,
}

impl DatasetStorage for SlowStorage {
    fn get_path(&self, url: &str) -> Result<std::path::PathBuf, DatasetError> {
        self.inner.get_path(url)
    }

    fn open(&self, url: &str) -> Result<DatasetSource, DatasetError> {
        self.inner.open(url)
    }

    fn stage(&self, url: &str, content: &[u8]) -> Result<Staged, DatasetError> {
        std::thread::sleep(self.delay);
        self.inner.stage(url, content)
    }

    fn commit(&self, staged: &Staged) -> Result<(), DatasetError> {
        self.inner.commit(staged)
    }

    fn discard(&self, staged: &Staged) -> Result<(), DatasetError> {
        self.inner.discard(staged)
    }

    fn model_path(&self, url: &str) -> Result<std::path::PathBuf, DatasetError> {
        self.inner.model_path(url)
    }
}

/// In-memory store whose dataset reads can be made to fail.
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryStore,
    fail_dataset_reads: AtomicBool,
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn insert(&self, doc: StoredDocument) -> metastore::Result<()> {
        self.inner.insert(doc).await
    }

    async fn get(&self, kind: Kind, id: &str) -> metastore::Result<Option<StoredDocument>> {
        if kind == Kind::Dataset && self.fail_dataset_reads.load(Ordering::SeqCst) {
            return Err(MetaError::Storage("dataset table unavailable".into()));
        }
        self.inner.get(kind, id).await
    }

    async fn replace(&self, doc: StoredDocument, expected_version: u64) -> metastore::Result<u64> {
        self.inner.replace(doc, expected_version).await
    }

    async fn delete(&self, kind: Kind, id: &str) -> metastore::Result<bool> {
        self.inner.delete(kind, id).await
    }

    async fn find(
        &self,
        kind: Kind,
        predicate: &Predicate,
        page: Page,
    ) -> metastore::Result<Vec<StoredDocument>> {
        self.inner.find(kind, predicate, page).await
    }

    async fn count(&self, kind: Kind, predicate: &Predicate) -> metastore::Result<u64> {
        self.inner.count(kind, predicate).await
    }
}

fn harness() -> Harness {
    harness_on(MetadataRepository::in_memory(), |fs| {
        Arc::new(fs) as Arc<dyn DatasetStorage>
    })
}

fn harness_with(storage: impl FnOnce(FsDatasetStorage) -> Arc<dyn DatasetStorage>) -> Harness {
    harness_on(MetadataRepository::in_memory(), storage)
}

fn harness_on(
    repo: MetadataRepository,
    storage: impl FnOnce(FsDatasetStorage) -> Arc<dyn DatasetStorage>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(InMemoryQueue::new());
    let backend = Arc::new(FakeBackend::default());
    let storage = storage(FsDatasetStorage::new(dir.path()));

    let service = ResourceService::new(repo.clone(), storage.clone(), queue.clone());
    let executor = Arc::new(JobExecutor::new(
        repo.clone(),
        backend.clone(),
        storage.clone(),
        queue.clone(),
    ));
    Harness {
        repo,
        queue,
        backend,
        service,
        executor,
        storage,
        _dir: dir,
    }
}

fn upload_body() -> Bytes {
    Bytes::from(
        json!({
            "train": {"x": [[0.0, 1.0], [1.0, 0.0]], "y": [1, 0]},
            "test": {"x": [[1.0, 1.0]], "y": [0]}
        })
        .to_string(),
    )
}

fn new_dataset(is_public: bool) -> NewDataset {
    NewDataset::from_json(json!({ "title": "xor", "is_public": is_public })).unwrap()
}

/// Dataset (uploaded), architecture and model, all owned by `owner`.
async fn model_fixture(h: &Harness, owner: &Caller, public: bool) -> (String, String, String) {
    let ds = h.service.create_dataset(owner, new_dataset(public)).await.unwrap();
    h.service.upload_dataset(owner, &ds.id, upload_body()).await.unwrap();

    let arch = h
        .service
        .create_architecture(
            owner,
            NewArchitecture::from_json(json!({
                "title": "mlp",
                "architecture": {"layers": [{"type": "dense", "units": 2}]}
            }))
            .unwrap(),
        )
        .await
        .unwrap();

    let model = h
        .service
        .create_model(
            owner,
            NewModel::from_json(json!({
                "title": "xor-net",
                "architecture": arch.id,
                "dataset": ds.id,
                "is_public": public
            }))
            .unwrap(),
        )
        .await
        .unwrap();

    (ds.id, arch.id, model.id)
}

#[tokio::test]
async fn train_task_runs_to_success() {
    let h = harness();
    let u1 = Caller::user("u1");
    let (_, _, model_id) = model_fixture(&h, &u1, false).await;

    let task = h.service.train(&u1, &model_id, TaskConfig::default()).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(h.queue.pending_len().await, 1);

    let delivery = h.queue.receive().await.unwrap().unwrap();
    assert_eq!(delivery.task_id, task.id);
    let status = h.executor.execute(&task.id).await.unwrap();
    assert_eq!(status, TaskStatus::Success);

    let done: Task = h.repo.get(&task.id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Success);
    assert!(done.started_at.is_some());
    assert!(done.finished_at.is_some());
    assert!(!done.history.contains_key("error"));
    assert_eq!(done.history["train"], json!({"loss": [0.7, 0.3]}));

    let model = h.service.get_model(&u1, &model_id).await.unwrap();
    assert_eq!(model.status, ModelStatus::Ready);
    assert_eq!(model.accuracy, Some(0.9));
    let artifact = model.artifact.expect("artifact location recorded");
    assert!(Path::new(&artifact).exists());

    assert_eq!(
        h.backend.calls(),
        vec!["construct", "configure", "fit", "save"]
    );
}

#[tokio::test]
async fn dispatch_mirrors_status_while_backend_runs() {
    let h = harness();
    let u1 = Caller::user("u1");
    let (_, _, model_id) = model_fixture(&h, &u1, false).await;

    // train: task STARTED and model TRAINING while fit runs
    let task = h.service.train(&u1, &model_id, TaskConfig::default()).await.unwrap();
    let (entered, release) = h.backend.hold("fit");
    let executor = h.executor.clone();
    let id = task.id.clone();
    let run = tokio::spawn(async move { executor.execute(&id).await });

    entered.await.unwrap();
    let running: Task = h.repo.get(&task.id).await.unwrap();
    assert_eq!(running.status, TaskStatus::Started);
    assert!(running.finished_at.is_none());
    let model = h.service.get_model(&u1, &model_id).await.unwrap();
    assert_eq!(model.status, ModelStatus::Training);

    release.send(()).unwrap();
    assert_eq!(run.await.unwrap().unwrap(), TaskStatus::Success);
    let model = h.service.get_model(&u1, &model_id).await.unwrap();
    assert_eq!(model.status, ModelStatus::Ready);

    // test: model TESTING while evaluate runs, READY again afterwards
    let task = h.service.test(&u1, &model_id, TaskConfig::default()).await.unwrap();
    let (entered, release) = h.backend.hold("evaluate");
    let executor = h.executor.clone();
    let id = task.id.clone();
    let run = tokio::spawn(async move { executor.execute(&id).await });

    entered.await.unwrap();
    let running: Task = h.repo.get(&task.id).await.unwrap();
    assert_eq!(running.status, TaskStatus::Started);
    let model = h.service.get_model(&u1, &model_id).await.unwrap();
    assert_eq!(model.status, ModelStatus::Testing);

    release.send(()).unwrap();
    assert_eq!(run.await.unwrap().unwrap(), TaskStatus::Success);
    let model = h.service.get_model(&u1, &model_id).await.unwrap();
    assert_eq!(model.status, ModelStatus::Ready);
}

#[tokio::test]
async fn model_deleted_during_training_fails_task() {
    let h = harness();
    let u1 = Caller::user("u1");
    let (_, _, model_id) = model_fixture(&h, &u1, false).await;

    let task = h.service.train(&u1, &model_id, TaskConfig::default()).await.unwrap();
    let (entered, release) = h.backend.hold("fit");
    let executor = h.executor.clone();
    let id = task.id.clone();
    let run = tokio::spawn(async move { executor.execute(&id).await });

    entered.await.unwrap();
    h.service.delete_model(&u1, &model_id).await.unwrap();
    release.send(()).unwrap();

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(err, ExecutionError::Metadata(MetaError::NotFound { .. })));

    let failed: Task = h.repo.get(&task.id).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failure);
    assert!(failed.finished_at.is_some());
    assert_eq!(failed.error().unwrap().kind, "NotFound");
}

#[tokio::test]
async fn interrupted_training_releases_model() {
    let h = harness();
    let u1 = Caller::user("u1");
    let (_, _, model_id) = model_fixture(&h, &u1, false).await;

    let task = h.service.train(&u1, &model_id, TaskConfig::default()).await.unwrap();
    h.repo
        .update::<Task>(&task.id, |t| t.start(0).unwrap())
        .await
        .unwrap();
    h.repo
        .update::<metastore::Model>(&model_id, |m| m.status = ModelStatus::Training)
        .await
        .unwrap();

    let err = h.executor.execute(&task.id).await.unwrap_err();
    assert!(matches!(err, ExecutionError::Interrupted(_)));

    let model = h.service.get_model(&u1, &model_id).await.unwrap();
    assert_eq!(model.status, ModelStatus::Pending);

    // a trained model goes back to ready
    let test = h.service.test(&u1, &model_id, TaskConfig::default()).await.unwrap();
    h.repo
        .update::<Task>(&test.id, |t| t.start(0).unwrap())
        .await
        .unwrap();
    h.repo
        .update::<metastore::Model>(&model_id, |m| {
            m.status = ModelStatus::Testing;
            m.artifact = Some("/models/old".into());
        })
        .await
        .unwrap();
    h.executor.execute(&test.id).await.unwrap_err();
    let model = h.service.get_model(&u1, &model_id).await.unwrap();
    assert_eq!(model.status, ModelStatus::Ready);
}

#[tokio::test]
async fn deleted_architecture_fails_task_and_keeps_model_status() {
    let h = harness();
    let u1 = Caller::user("u1");
    let (_, arch_id, model_id) = model_fixture(&h, &u1, false).await;
    let before = h.service.get_model(&u1, &model_id).await.unwrap().status;

    h.service.delete_architecture(&u1, &arch_id).await.unwrap();
    let task = h.service.train(&u1, &model_id, TaskConfig::default()).await.unwrap();

    let err = h.executor.execute(&task.id).await.unwrap_err();
    assert!(matches!(err, ExecutionError::MissingReference { .. }));

    let failed: Task = h.repo.get(&task.id).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failure);
    let error = failed.error().expect("error recorded");
    assert_eq!(error.kind, "MissingReference");
    assert!(error.message.contains(&arch_id));

    let model = h.service.get_model(&u1, &model_id).await.unwrap();
    assert_eq!(model.status, before);
    assert!(h.backend.calls().is_empty());
}

#[tokio::test]
async fn backend_failure_restores_model_status() {
    let h = harness();
    let u1 = Caller::user("u1");
    let (_, _, model_id) = model_fixture(&h, &u1, false).await;
    h.backend.fail_on("fit");

    let task = h.service.train(&u1, &model_id, TaskConfig::default()).await.unwrap();
    let err = h.executor.execute(&task.id).await.unwrap_err();
    assert_eq!(err.kind_name(), "BackendError");

    let failed: Task = h.repo.get(&task.id).await.unwrap();
    let error = failed.error().unwrap();
    assert_eq!(error.kind, "BackendError");
    assert!(error.trace.contains("fit exploded"));

    let model = h.service.get_model(&u1, &model_id).await.unwrap();
    assert_eq!(model.status, ModelStatus::Pending);
    assert!(model.artifact.is_none());
}

#[tokio::test]
async fn test_after_train_loads_artifact() {
    let h = harness();
    let u1 = Caller::user("u1");
    let (_, _, model_id) = model_fixture(&h, &u1, false).await;

    let train = h.service.train(&u1, &model_id, TaskConfig::default()).await.unwrap();
    h.executor.execute(&train.id).await.unwrap();

    let test = h.service.test(&u1, &model_id, TaskConfig::default()).await.unwrap();
    assert_eq!(h.executor.execute(&test.id).await.unwrap(), TaskStatus::Success);

    let history = h.service.task_history(&u1, &test.id).await.unwrap();
    assert_eq!(history["metrics"]["accuracy"], json!(0.88));
    assert!(h.backend.calls().ends_with(&["load".to_string(), "evaluate".to_string()]));

    // test leaves a trained model ready
    let model = h.service.get_model(&u1, &model_id).await.unwrap();
    assert_eq!(model.status, ModelStatus::Ready);
}

#[tokio::test]
async fn predict_on_untrained_model_builds_it() {
    let h = harness();
    let u1 = Caller::user("u1");
    let (_, _, model_id) = model_fixture(&h, &u1, false).await;

    let task = h.service.predict(&u1, &model_id, json!([[1.0, 0.0]])).await.unwrap();
    h.executor.execute(&task.id).await.unwrap();

    let done: Task = h.repo.get(&task.id).await.unwrap();
    assert_eq!(done.operation, Operation::Predict);
    assert_eq!(done.history["result"], json!([0.1, 0.9]));
    assert_eq!(h.backend.calls(), vec!["construct", "configure", "predict"]);
}

#[tokio::test]
async fn predict_tolerates_only_a_missing_dataset() {
    let store = Arc::new(FlakyStore::default());
    let h = harness_on(MetadataRepository::new(store.clone()), |fs| {
        Arc::new(fs) as Arc<dyn DatasetStorage>
    });
    let u1 = Caller::user("u1");
    let (ds_id, _, model_id) = model_fixture(&h, &u1, false).await;

    store.fail_dataset_reads.store(true, Ordering::SeqCst);
    let task = h.service.predict(&u1, &model_id, json!([1])).await.unwrap();
    let err = h.executor.execute(&task.id).await.unwrap_err();
    assert_eq!(err.kind_name(), "StorageError");
    let failed: Task = h.repo.get(&task.id).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failure);

    store.fail_dataset_reads.store(false, Ordering::SeqCst);
    h.service.delete_dataset(&u1, &ds_id).await.unwrap();
    let task = h.service.predict(&u1, &model_id, json!([1])).await.unwrap();
    assert_eq!(h.executor.execute(&task.id).await.unwrap(), TaskStatus::Success);
}

#[tokio::test]
async fn second_upload_conflicts() {
    let h = harness();
    let u1 = Caller::user("u1");
    let ds = h.service.create_dataset(&u1, new_dataset(false)).await.unwrap();
    assert_eq!(ds.status, DatasetStatus::Pending);

    let received = h.service.upload_dataset(&u1, &ds.id, upload_body()).await.unwrap();
    assert_eq!(received.status, DatasetStatus::Received);
    assert_eq!(received.base.shape, vec![2]);
    assert!(received.base.hash.is_some());

    let err = h
        .service
        .upload_dataset(&u1, &ds.id, upload_body())
        .await
        .unwrap_err();
    assert_eq!(err.kind_name(), "ConflictError");

    let again = h.service.get_dataset(&u1, &ds.id).await.unwrap();
    assert_eq!(again.status, DatasetStatus::Received);
    assert_eq!(again.base.hash, received.base.hash);
}

#[tokio::test]
async fn concurrent_uploads_keep_the_first_content() {
    let h = harness_with(|fs| {
        Arc::new(SlowStorage {
            inner: fs,
            delay: Duration::from_millis(100),
        }) as Arc<dyn DatasetStorage>
    });
    let u1 = Caller::user("u1");
    let ds = h.service.create_dataset(&u1, new_dataset(false)).await.unwrap();

    let wide = Bytes::from(
        json!({
            "train": {"x": [[0.0, 1.0, 2.0]], "y": [1]},
            "test": {"x": [[1.0, 1.0, 1.0]], "y": [0]}
        })
        .to_string(),
    );
    let (a, b) = tokio::join!(
        h.service.upload_dataset(&u1, &ds.id, upload_body()),
        h.service.upload_dataset(&u1, &ds.id, wide),
    );

    let (winner, loser) = match (a, b) {
        (Ok(w), Err(l)) | (Err(l), Ok(w)) => (w, l),
        (a, b) => panic!("expected exactly one upload to win: {a:?} / {b:?}"),
    };
    assert_eq!(loser.kind_name(), "ConflictError");

    let stored = h.service.get_dataset(&u1, &ds.id).await.unwrap();
    assert_eq!(stored.status, DatasetStatus::Received);
    assert_eq!(stored.base.hash, winner.base.hash);
    assert_eq!(stored.base.shape, winner.base.shape);

    let train = h.storage.open(&ds.url).unwrap().split("train").unwrap();
    let raw: JsonValue = serde_json::from_slice(&std::fs::read(&train.path).unwrap()).unwrap();
    let width = raw["x"][0].as_array().unwrap().len() as u32;
    assert_eq!(vec![width], winner.base.shape);
}

#[tokio::test]
async fn oversized_upload_is_rejected() {
    let mut h = harness();
    h.service = h.service.clone().with_max_upload(16);
    let u1 = Caller::user("u1");
    let ds = h.service.create_dataset(&u1, new_dataset(false)).await.unwrap();

    let err = h
        .service
        .upload_dataset(&u1, &ds.id, upload_body())
        .await
        .unwrap_err();
    assert_eq!(err.kind_name(), "ValidationError");

    let ds = h.service.get_dataset(&u1, &ds.id).await.unwrap();
    assert_eq!(ds.status, DatasetStatus::Pending);
    assert!(ds.base.hash.is_none());
}

#[tokio::test]
async fn bad_upload_marks_dataset_failed() {
    let h = harness();
    let u1 = Caller::user("u1");
    let ds = h.service.create_dataset(&u1, new_dataset(false)).await.unwrap();

    let err = h
        .service
        .upload_dataset(&u1, &ds.id, Bytes::from_static(b"{\"train\": 1}"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Dataset(_)));

    let ds = h.service.get_dataset(&u1, &ds.id).await.unwrap();
    assert_eq!(ds.status, DatasetStatus::Failure);
}

#[tokio::test]
async fn published_dataset_cannot_be_deleted() {
    let h = harness();
    let u1 = Caller::user("u1");
    let u2 = Caller::user("u2");

    let public = h.service.create_dataset(&u1, new_dataset(true)).await.unwrap();
    h.service.upload_dataset(&u1, &public.id, upload_body()).await.unwrap();
    h.service.publish_dataset(&u1, &public.id).await.unwrap();

    for caller in [&u1, &u2] {
        let err = h.service.delete_dataset(caller, &public.id).await.unwrap_err();
        assert_eq!(err.kind_name(), "ConflictError");
    }

    let private = h.service.create_dataset(&u1, new_dataset(false)).await.unwrap();
    h.service.upload_dataset(&u1, &private.id, upload_body()).await.unwrap();
    h.service.publish_dataset(&u1, &private.id).await.unwrap();
    let err = h.service.delete_dataset(&u2, &private.id).await.unwrap_err();
    assert_eq!(err.kind_name(), "NotFound");
}

#[tokio::test]
async fn only_received_datasets_publish() {
    let h = harness();
    let u1 = Caller::user("u1");
    let ds = h.service.create_dataset(&u1, new_dataset(false)).await.unwrap();
    let err = h.service.publish_dataset(&u1, &ds.id).await.unwrap_err();
    assert_eq!(err.kind_name(), "ConflictError");
}

#[tokio::test]
async fn mutation_rules_for_other_users() {
    let h = harness();
    let u1 = Caller::user("u1");
    let u2 = Caller::user("u2");
    let (ds_id, _, model_id) = model_fixture(&h, &u1, true).await;

    let err = h
        .service
        .train(&u2, &model_id, TaskConfig::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind_name(), "AccessDenied");

    // visible is enough to test
    let task = h.service.test(&u2, &model_id, TaskConfig::default()).await.unwrap();
    assert_eq!(task.owner, "u2");
    assert!(!task.is_public);
    assert!(h.service.get_task(&u1, &task.id).await.is_err());

    let err = h.service.delete_dataset(&u2, &ds_id).await.unwrap_err();
    assert_eq!(err.kind_name(), "AccessDenied");

    let err = h
        .service
        .create_dataset(&Caller::anonymous(), new_dataset(true))
        .await
        .unwrap_err();
    assert_eq!(err.kind_name(), "AccessDenied");
}

#[tokio::test]
async fn model_needs_own_architecture() {
    let h = harness();
    let u1 = Caller::user("u1");
    let u2 = Caller::user("u2");
    let (_, arch_id, _) = model_fixture(&h, &u1, true).await;

    let err = h
        .service
        .create_model(
            &u2,
            NewModel::from_json(json!({"title": "copy", "architecture": arch_id})).unwrap(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Metadata(MetaError::NotFound { .. })));
}

#[tokio::test]
async fn invalid_config_is_rejected_before_queueing() {
    let h = harness();
    let u1 = Caller::user("u1");
    let (_, _, model_id) = model_fixture(&h, &u1, false).await;

    let config = TaskConfig {
        epochs: 0,
        ..TaskConfig::default()
    };
    let err = h.service.train(&u1, &model_id, config).await.unwrap_err();
    assert_eq!(err.kind_name(), "ValidationError");
    assert_eq!(h.queue.pending_len().await, 0);
    assert_eq!(h.service.count_tasks(&u1).await.unwrap(), 0);
}

#[tokio::test]
async fn redelivered_tasks_are_idempotent() {
    let h = harness();
    let u1 = Caller::user("u1");
    let (_, _, model_id) = model_fixture(&h, &u1, false).await;

    let task = h.service.predict(&u1, &model_id, json!([1])).await.unwrap();
    h.executor.execute(&task.id).await.unwrap();
    let calls = h.backend.calls().len();

    assert_eq!(h.executor.execute(&task.id).await.unwrap(), TaskStatus::Success);
    assert_eq!(h.backend.calls().len(), calls);

    // a task left started by a dead worker
    let stuck = h.service.predict(&u1, &model_id, json!([1])).await.unwrap();
    h.repo
        .update::<Task>(&stuck.id, |t| t.start(0).unwrap())
        .await
        .unwrap();
    let err = h.executor.execute(&stuck.id).await.unwrap_err();
    assert!(matches!(err, ExecutionError::Interrupted(_)));
    let stuck: Task = h.repo.get(&stuck.id).await.unwrap();
    assert_eq!(stuck.status, TaskStatus::Failure);
    assert_eq!(stuck.error().unwrap().kind, "Interrupted");
}

#[tokio::test]
async fn missing_task_is_failed_on_the_queue() {
    let h = harness();
    let err = h.executor.execute("ghost").await.unwrap_err();
    assert!(matches!(err, ExecutionError::TaskNotFound(_)));
    let failed = h.queue.failed().await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, "ghost");
}

#[tokio::test]
async fn listing_is_paged_and_filtered() {
    let h = harness();
    let u1 = Caller::user("u1");
    let u2 = Caller::user("u2");
    for i in 0..4 {
        h.service.create_dataset(&u1, new_dataset(i % 2 == 0)).await.unwrap();
    }
    h.service.create_dataset(&u2, new_dataset(false)).await.unwrap();

    assert_eq!(h.service.count_datasets(&u1).await.unwrap(), 4);
    assert_eq!(h.service.count_datasets(&u2).await.unwrap(), 3);
    assert_eq!(h.service.count_datasets(&Caller::anonymous()).await.unwrap(), 2);

    let page = Page::new(1, 2).unwrap();
    assert_eq!(h.service.list_datasets(&u1, page).await.unwrap().len(), 2);
    assert!(Page::from_params(Some(-1), None).is_err());
}

#[tokio::test]
async fn worker_loop_drains_queue() {
    let h = harness();
    let u1 = Caller::user("u1");
    let (_, _, model_id) = model_fixture(&h, &u1, false).await;

    let cancel = CancellationToken::new();
    let opts = WorkerOptions {
        worker_id: "test-worker".into(),
        max_concurrent: 2,
        poll_every: Duration::from_millis(20),
        heartbeat_every: Duration::from_millis(10),
    };
    let worker = tokio::spawn(run_worker_loop(h.executor.clone(), opts, cancel.clone()));

    let good = h.service.predict(&u1, &model_id, json!([1])).await.unwrap();
    h.queue.enqueue("ghost").await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let acked = h.queue.acked().await;
        let failed = h.queue.failed().await;
        if acked.contains(&good.id) && failed.iter().any(|(id, _)| id == "ghost") {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "worker did not drain the queue");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    cancel.cancel();
    worker.await.unwrap();

    let done: Task = h.repo.get(&good.id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Success);
}

#[tokio::test]
async fn unfinished_tasks_are_requeued() {
    let h = harness();
    let u1 = Caller::user("u1");
    let (_, _, model_id) = model_fixture(&h, &u1, false).await;

    let finished = h.service.predict(&u1, &model_id, json!([1])).await.unwrap();
    h.queue.receive().await.unwrap();
    h.executor.execute(&finished.id).await.unwrap();
    h.queue.ack(&finished.id).await.unwrap();
    let pending = h.service.predict(&u1, &model_id, json!([1])).await.unwrap();
    h.queue.receive().await.unwrap();
    h.queue.ack(&pending.id).await.unwrap();

    let fresh = InMemoryQueue::new();
    let n = orchestrator::worker_loop::requeue_unfinished(&h.repo, &fresh)
        .await
        .unwrap();
    assert_eq!(n, 1);
    assert_eq!(fresh.receive().await.unwrap().unwrap().task_id, pending.id);
}
