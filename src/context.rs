//! Capability traits consumed by the lifecycle manager: the execution
//! context a task runs under, the plugin that knows how to build and judge
//! its backing resource, and the output reader/sink pair.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;

use crate::cluster::{OwnerReference, ResourceObject};
use crate::phase::{StateBlob, Transition};

/// Identity and placement metadata for one task execution.
#[derive(Debug, Clone, Default)]
pub struct TaskMetadata {
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// The execution's controlling object; stamped as the sole owner
    /// reference of every created resource.
    pub owner_reference: OwnerReference,
    /// Deterministic name for the backing resource.
    pub generated_name: String,
}

/// Task outputs as a JSON document.
pub type TaskOutputs = Value;

/// Source of a finished task's outputs.
#[async_trait]
pub trait OutputReader: Send + Sync {
    async fn read(&self) -> anyhow::Result<TaskOutputs>;
}

/// Destination for a finished task's outputs. Commit failures abort the
/// check pass; the outputs are not considered committed.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn commit(&self, outputs: TaskOutputs) -> anyhow::Result<()>;
}

/// Default reader for plugins that leave outputs at the execution's
/// conventional file location.
pub struct FileOutputReader {
    root: PathBuf,
}

impl FileOutputReader {
    pub const OUTPUT_FILE: &'static str = "outputs.json";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl OutputReader for FileOutputReader {
    async fn read(&self) -> anyhow::Result<TaskOutputs> {
        let path = self.root.join(Self::OUTPUT_FILE);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading task outputs at {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("decoding task outputs at {}", path.display()))
    }
}

/// The execution-side view of one task: identity metadata, the persisted
/// state blob, and where outputs go.
pub trait TaskExecutionContext: Send + Sync {
    fn metadata(&self) -> &TaskMetadata;

    /// Read the persisted state blob; `None` before the first write.
    fn read_state(&self) -> anyhow::Result<Option<StateBlob>>;

    fn write_state(&self, blob: StateBlob) -> anyhow::Result<()>;

    /// Conventional root for file-based outputs.
    fn output_root(&self) -> PathBuf;

    fn output_sink(&self) -> Arc<dyn OutputSink>;
}

/// Verdict from evaluating a fetched resource, optionally carrying a
/// plugin-supplied output reader for the success path.
pub struct PhaseCheck {
    pub transition: Transition,
    pub outputs: Option<Arc<dyn OutputReader>>,
}

impl PhaseCheck {
    pub fn transition(transition: Transition) -> Self {
        Self {
            transition,
            outputs: None,
        }
    }

    pub fn with_outputs(transition: Transition, outputs: Arc<dyn OutputReader>) -> Self {
        Self {
            transition,
            outputs: Some(outputs),
        }
    }
}

/// A task type's knowledge of its backing resource: how to build it, how to
/// name it, and how to judge a fetched instance.
#[async_trait]
pub trait TaskPlugin: Send + Sync {
    fn id(&self) -> &str;

    /// Kind of the resource this plugin manages (and watches).
    fn resource_kind(&self) -> &str;

    /// Build the full resource specification for launch.
    async fn build_resource(
        &self,
        ctx: &dyn TaskExecutionContext,
    ) -> anyhow::Result<ResourceObject>;

    /// Build only the resource's identity (kind + metadata, no spec), enough
    /// to fetch or finalize it.
    fn build_identity_resource(&self, metadata: &TaskMetadata) -> anyhow::Result<ResourceObject>;

    /// Compute the task phase from the fetched resource.
    async fn task_phase(
        &self,
        ctx: &dyn TaskExecutionContext,
        resource: &ResourceObject,
    ) -> anyhow::Result<PhaseCheck>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_reader_reads_outputs_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(FileOutputReader::OUTPUT_FILE),
            br#"{"result": 42}"#,
        )
        .unwrap();

        let reader = FileOutputReader::new(dir.path());
        let outputs = reader.read().await.unwrap();
        assert_eq!(outputs["result"], 42);
    }

    #[tokio::test]
    async fn file_reader_fails_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let reader = FileOutputReader::new(dir.path());
        let err = reader.read().await.unwrap_err();
        assert!(err.to_string().contains("reading task outputs"));
    }

    #[tokio::test]
    async fn file_reader_fails_on_malformed_outputs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(FileOutputReader::OUTPUT_FILE), b"{oops").unwrap();
        let reader = FileOutputReader::new(dir.path());
        assert!(reader.read().await.is_err());
    }
}
