use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
    },
};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::{fs, sync::Semaphore};
use tracing_subscriber::*;

use crate::{
    procedures::{Evaluation, EvaluationError, Evaluator, MergeError, Merger},
    settings::{AggregationSettings, RecoverySettings, StorageSettings},
    state_machine::{
        initializer::{AggregatorInitializer, Backfill},
        Aggregator,
        EventSubscriber,
    },
    storage::{
        artifacts::tests::{set_modified, storage_settings},
        ArtifactStore,
        InMemory,
        MetadataStorage,
        MetricRecord,
        StorageResult,
        VersionRecord,
    },
};

pub fn enable_logging() {
    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(true)
        .try_init();
}

/// A merger that joins the contents of its inputs with `+`.
#[derive(Clone, Default)]
pub struct FakeMerger(Arc<FakeMergerState>);

#[derive(Default)]
struct FakeMergerState {
    fail: AtomicBool,
    gate: Mutex<Option<Arc<Semaphore>>>,
    calls: Mutex<Vec<Vec<PathBuf>>>,
}

impl FakeMerger {
    /// Makes every following merge fail after writing a partial output.
    pub fn set_failing(&self, fail: bool) {
        self.0.fail.store(fail, Ordering::SeqCst);
    }

    /// Makes every following merge wait for a permit of the returned semaphore after reading
    /// its inputs.
    pub fn close_gate(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.0.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// The inputs of every merge so far.
    pub fn calls(&self) -> Vec<Vec<PathBuf>> {
        self.0.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Merger for FakeMerger {
    async fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MergeError> {
        self.0.calls.lock().unwrap().push(inputs.to_vec());

        let mut contents = Vec::with_capacity(inputs.len());
        for input in inputs {
            contents.push(fs::read_to_string(input).await.unwrap());
        }

        let gate = self.0.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }

        if self.0.fail.load(Ordering::SeqCst) {
            fs::write(output, "partial").await.unwrap();
            return Err(MergeError::MissingOutput(output.to_path_buf()));
        }
        fs::write(output, contents.join("+")).await.unwrap();
        Ok(())
    }
}

/// An evaluator that derives the metrics from the artifact length.
#[derive(Clone, Default)]
pub struct FakeEvaluator(Arc<FakeEvaluatorState>);

#[derive(Default)]
struct FakeEvaluatorState {
    fail: AtomicBool,
    evaluated: Mutex<Vec<PathBuf>>,
}

impl FakeEvaluator {
    pub fn set_failing(&self, fail: bool) {
        self.0.fail.store(fail, Ordering::SeqCst);
    }

    pub fn evaluated(&self) -> Vec<PathBuf> {
        self.0.evaluated.lock().unwrap().clone()
    }

    /// The evaluation of an artifact with the given content.
    pub fn evaluation_of(content: &str) -> Evaluation {
        let len = content.len() as f64;
        Evaluation {
            accuracy: 1.0 / (1.0 + len),
            loss: len,
        }
    }
}

#[async_trait]
impl Evaluator for FakeEvaluator {
    async fn evaluate(&self, artifact: &Path) -> Result<Evaluation, EvaluationError> {
        self.0.evaluated.lock().unwrap().push(artifact.to_path_buf());
        if self.0.fail.load(Ordering::SeqCst) {
            return Err(EvaluationError::NoResult("evaluation failed".to_string()));
        }
        match fs::read_to_string(artifact).await {
            Ok(content) => Ok(Self::evaluation_of(&content)),
            Err(err) => Err(EvaluationError::NoResult(err.to_string())),
        }
    }
}

/// An in-memory metadata store whose version registry can be made to fail.
#[derive(Clone, Default)]
pub struct FlakyRegistry {
    pub inner: InMemory,
    fail: Arc<AtomicBool>,
}

impl FlakyRegistry {
    pub fn new(inner: InMemory) -> Self {
        Self {
            inner,
            fail: Arc::default(),
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetadataStorage for FlakyRegistry {
    async fn version(&mut self, name: &str) -> StorageResult<Option<VersionRecord>> {
        self.inner.version(name).await
    }

    async fn set_version(&mut self, record: &VersionRecord) -> StorageResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("version registry unavailable"));
        }
        self.inner.set_version(record).await
    }

    async fn append_metric(&mut self, record: &MetricRecord) -> StorageResult<()> {
        self.inner.append_metric(record).await
    }

    async fn metrics(&mut self) -> StorageResult<Vec<MetricRecord>> {
        self.inner.metrics().await
    }

    async fn metric_count(&mut self) -> StorageResult<u64> {
        self.inner.metric_count().await
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        self.inner.is_ready().await
    }
}

/// An initialized set of artifact zones with fake procedures and an in-memory metadata store.
pub struct Fixture {
    pub dir: TempDir,
    pub aggregation: AggregationSettings,
    pub storage: StorageSettings,
    pub recovery: RecoverySettings,
    pub store: ArtifactStore,
    pub merger: FakeMerger,
    pub evaluator: FakeEvaluator,
    pub metadata: InMemory,
}

impl Fixture {
    pub async fn new() -> Self {
        enable_logging();
        let dir = TempDir::new().unwrap();
        let storage = storage_settings(dir.path());
        let aggregation = AggregationSettings::default();
        let store = ArtifactStore::new(&storage, aggregation.extension.clone());
        store.init().await.unwrap();
        Self {
            dir,
            aggregation,
            storage,
            recovery: RecoverySettings::default(),
            store,
            merger: FakeMerger::default(),
            evaluator: FakeEvaluator::default(),
            metadata: InMemory::new(),
        }
    }

    pub fn initializer(&self) -> AggregatorInitializer<FakeMerger, FakeEvaluator, InMemory> {
        self.initializer_with(self.metadata.clone())
    }

    /// An initializer that records metadata in `metadata` instead of the fixture's store.
    pub fn initializer_with<S>(
        &self,
        metadata: S,
    ) -> AggregatorInitializer<FakeMerger, FakeEvaluator, S>
    where
        S: MetadataStorage,
    {
        AggregatorInitializer::new(
            self.aggregation.clone(),
            self.storage.clone(),
            self.recovery.clone(),
            self.store.clone(),
            self.merger.clone(),
            self.evaluator.clone(),
            metadata,
        )
    }

    pub async fn init(
        &self,
    ) -> (
        Aggregator<FakeMerger, FakeEvaluator, InMemory>,
        EventSubscriber,
        Backfill<FakeEvaluator, InMemory>,
    ) {
        self.initializer().init().await.unwrap()
    }

    /// Uploads an update and returns its staged path.
    pub async fn stage(&self, name: &str, content: &str) -> PathBuf {
        self.store.stage(name, content.as_bytes()).await.unwrap().path
    }

    pub fn write_live(&self, content: &str) {
        std::fs::write(&self.storage.live_path, content).unwrap();
    }

    pub fn live_content(&self) -> Option<String> {
        std::fs::read_to_string(&self.storage.live_path).ok()
    }

    /// Writes an artifact into the archive zone with the given modification time.
    pub fn write_archived(&self, name: &str, content: &str, modified_secs: u64) -> PathBuf {
        let path = self.storage.archive_dir.join(name);
        std::fs::write(&path, content).unwrap();
        set_modified(&path, modified_secs);
        path
    }

    pub fn staging_names(&self) -> Vec<String> {
        file_names(&self.storage.staging_dir)
    }

    pub fn archive_names(&self) -> Vec<String> {
        file_names(&self.storage.archive_dir)
    }

    pub fn archived_content(&self, name: &str) -> String {
        std::fs::read_to_string(self.storage.archive_dir.join(name)).unwrap()
    }

    pub async fn version(&self) -> Option<VersionRecord> {
        self.metadata
            .clone()
            .version(&self.aggregation.model_name)
            .await
            .unwrap()
    }

    pub async fn metrics(&self) -> Vec<MetricRecord> {
        self.metadata.clone().metrics().await.unwrap()
    }

    /// Everything a pass may touch.
    pub async fn snapshot(&self) -> Snapshot {
        Snapshot {
            staging: self.staging_names(),
            archive: self.archive_names(),
            live: self.live_content(),
            version: self.version().await,
            metrics: self.metrics().await,
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct Snapshot {
    pub staging: Vec<String>,
    pub archive: Vec<String>,
    pub live: Option<String>,
    pub version: Option<VersionRecord>,
    pub metrics: Vec<MetricRecord>,
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
