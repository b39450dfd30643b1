//! In-memory doubles for exercising the lifecycle manager and stores in
//! tests and local runs.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::client::ClusterClient;
use crate::cluster::{NamespacedName, OwnerReference, ResourceObject, WorkUnit};
use crate::context::{
    OutputReader, OutputSink, PhaseCheck, TaskExecutionContext, TaskMetadata, TaskOutputs,
    TaskPlugin,
};
use crate::error::ClusterError;
use crate::phase::{StateBlob, Transition};

/// In-memory control plane: stores objects by (kind, namespace, name) and
/// can be primed to fail creates with a specific classified error.
#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<HashMap<(String, String, String), ResourceObject>>,
    create_failure: Mutex<Option<ClusterError>>,
    create_calls: AtomicUsize,
    update_calls: AtomicUsize,
}

impl FakeCluster {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, object: ResourceObject) {
        let key = (
            object.kind.clone(),
            object.meta.namespace.clone(),
            object.meta.name.clone(),
        );
        self.objects
            .lock()
            .expect("fake cluster poisoned")
            .insert(key, object);
    }

    /// Every subsequent create fails with `err` until cleared.
    pub fn fail_creates_with(&self, err: ClusterError) {
        *self.create_failure.lock().expect("fake cluster poisoned") = Some(err);
    }

    pub fn clear_create_failure(&self) {
        *self.create_failure.lock().expect("fake cluster poisoned") = None;
    }

    pub fn object(&self, kind: &str, name: &NamespacedName) -> Option<ResourceObject> {
        self.objects
            .lock()
            .expect("fake cluster poisoned")
            .get(&(
                kind.to_string(),
                name.namespace.clone(),
                name.name.clone(),
            ))
            .cloned()
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn create(&self, object: &ResourceObject) -> Result<(), ClusterError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self
            .create_failure
            .lock()
            .expect("fake cluster poisoned")
            .clone()
        {
            return Err(err);
        }
        let key = (
            object.kind.clone(),
            object.meta.namespace.clone(),
            object.meta.name.clone(),
        );
        let mut objects = self.objects.lock().expect("fake cluster poisoned");
        if objects.contains_key(&key) {
            return Err(ClusterError::AlreadyExists(
                object.meta.namespaced_name().to_string(),
            ));
        }
        objects.insert(key, object.clone());
        Ok(())
    }

    async fn get(
        &self,
        kind: &str,
        name: &NamespacedName,
    ) -> Result<ResourceObject, ClusterError> {
        self.object(kind, name)
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))
    }

    async fn update(&self, object: &ResourceObject) -> Result<(), ClusterError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let key = (
            object.kind.clone(),
            object.meta.namespace.clone(),
            object.meta.name.clone(),
        );
        let mut objects = self.objects.lock().expect("fake cluster poisoned");
        if !objects.contains_key(&key) {
            return Err(ClusterError::NotFound(
                object.meta.namespaced_name().to_string(),
            ));
        }
        objects.insert(key, object.clone());
        Ok(())
    }
}

/// Output sink that keeps committed outputs in memory.
#[derive(Default)]
pub struct MemorySink {
    committed: Mutex<Vec<TaskOutputs>>,
}

impl MemorySink {
    pub fn committed(&self) -> Vec<TaskOutputs> {
        self.committed.lock().expect("memory sink poisoned").clone()
    }
}

#[async_trait]
impl OutputSink for MemorySink {
    async fn commit(&self, outputs: TaskOutputs) -> anyhow::Result<()> {
        self.committed
            .lock()
            .expect("memory sink poisoned")
            .push(outputs);
        Ok(())
    }
}

/// Execution context backed by plain memory plus a temp-style output root.
pub struct TestContext {
    metadata: TaskMetadata,
    state: Mutex<Option<StateBlob>>,
    output_root: PathBuf,
    sink: Arc<MemorySink>,
}

impl TestContext {
    pub fn new(namespace: &str, task_name: &str) -> Self {
        Self {
            metadata: TaskMetadata {
                namespace: namespace.to_string(),
                labels: BTreeMap::new(),
                annotations: BTreeMap::new(),
                owner_reference: OwnerReference {
                    kind: "Workflow".to_string(),
                    name: format!("wf-{task_name}"),
                    controller: true,
                },
                generated_name: task_name.to_string(),
            },
            state: Mutex::new(None),
            output_root: std::env::temp_dir(),
            sink: Arc::new(MemorySink::default()),
        }
    }

    pub fn with_output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.output_root = root.into();
        self
    }

    pub fn metadata_mut(&mut self) -> &mut TaskMetadata {
        &mut self.metadata
    }

    pub fn stored_state(&self) -> Option<StateBlob> {
        self.state.lock().expect("test context poisoned").clone()
    }

    pub fn seed_state(&self, blob: StateBlob) {
        *self.state.lock().expect("test context poisoned") = Some(blob);
    }

    pub fn sink(&self) -> Arc<MemorySink> {
        self.sink.clone()
    }
}

impl TaskExecutionContext for TestContext {
    fn metadata(&self) -> &TaskMetadata {
        &self.metadata
    }

    fn read_state(&self) -> anyhow::Result<Option<StateBlob>> {
        Ok(self.state.lock().expect("test context poisoned").clone())
    }

    fn write_state(&self, blob: StateBlob) -> anyhow::Result<()> {
        *self.state.lock().expect("test context poisoned") = Some(blob);
        Ok(())
    }

    fn output_root(&self) -> PathBuf {
        self.output_root.clone()
    }

    fn output_sink(&self) -> Arc<dyn OutputSink> {
        self.sink.clone()
    }
}

/// Plugin double with configurable resource limits, phase verdicts and
/// failure injection.
pub struct StubPlugin {
    kind: String,
    limits: BTreeMap<String, String>,
    phase: Mutex<Transition>,
    outputs: Mutex<Option<Arc<dyn OutputReader>>>,
    fail_build: Mutex<bool>,
    fail_identity: Mutex<bool>,
}

impl StubPlugin {
    pub fn new(kind: &str, limits: &[(&str, &str)]) -> Self {
        Self {
            kind: kind.to_string(),
            limits: limits
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            phase: Mutex::new(Transition::running()),
            outputs: Mutex::new(None),
            fail_build: Mutex::new(false),
            fail_identity: Mutex::new(false),
        }
    }

    pub fn set_phase(&self, transition: Transition) {
        *self.phase.lock().expect("stub plugin poisoned") = transition;
    }

    pub fn set_outputs(&self, reader: Arc<dyn OutputReader>) {
        *self.outputs.lock().expect("stub plugin poisoned") = Some(reader);
    }

    pub fn fail_build(&self) {
        *self.fail_build.lock().expect("stub plugin poisoned") = true;
    }

    pub fn fail_identity(&self) {
        *self.fail_identity.lock().expect("stub plugin poisoned") = true;
    }
}

#[async_trait]
impl TaskPlugin for StubPlugin {
    fn id(&self) -> &str {
        "stub"
    }

    fn resource_kind(&self) -> &str {
        &self.kind
    }

    async fn build_resource(
        &self,
        _ctx: &dyn TaskExecutionContext,
    ) -> anyhow::Result<ResourceObject> {
        if *self.fail_build.lock().expect("stub plugin poisoned") {
            anyhow::bail!("stub build failure");
        }
        Ok(ResourceObject {
            kind: self.kind.clone(),
            units: vec![WorkUnit {
                name: "main".to_string(),
                limits: self.limits.clone(),
            }],
            payload: serde_json::json!({"image": "task:latest"}),
            ..Default::default()
        })
    }

    fn build_identity_resource(
        &self,
        _metadata: &TaskMetadata,
    ) -> anyhow::Result<ResourceObject> {
        if *self.fail_identity.lock().expect("stub plugin poisoned") {
            anyhow::bail!("stub identity failure");
        }
        Ok(ResourceObject {
            kind: self.kind.clone(),
            ..Default::default()
        })
    }

    async fn task_phase(
        &self,
        _ctx: &dyn TaskExecutionContext,
        _resource: &ResourceObject,
    ) -> anyhow::Result<PhaseCheck> {
        let transition = self.phase.lock().expect("stub plugin poisoned").clone();
        let outputs = self.outputs.lock().expect("stub plugin poisoned").clone();
        Ok(PhaseCheck {
            transition,
            outputs,
        })
    }
}
