//! The workflow record that drives reconciliation, and the persistence
//! seam it is read and written through.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cluster::ObjectMeta;
use crate::error::StoreError;

/// Execution phase of a workflow record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowPhase {
    #[default]
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl WorkflowPhase {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowPhase::Running)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub phase: WorkflowPhase,
    #[serde(default)]
    pub message: Option<String>,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

/// The persisted workflow object owning one or more task executions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workflow {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub status: WorkflowStatus,
}

impl Workflow {
    /// Cache key shared by the version cache and the terminated filter.
    pub fn key(&self) -> String {
        workflow_key(&self.meta.namespace, &self.meta.name)
    }
}

pub fn workflow_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Abstract workflow persistence store.
///
/// `update` writes the whole object, `update_status` only its status
/// subresource; both return the stored workflow carrying its (possibly
/// unchanged) version token.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Workflow, StoreError>;

    async fn update(&self, workflow: Workflow) -> Result<Workflow, StoreError>;

    async fn update_status(&self, workflow: Workflow) -> Result<Workflow, StoreError>;
}

/// In-memory store for tests and local runs. Bumps the version token only
/// when a write actually changes the stored object, mirroring how the real
/// control plane reports no-op writes.
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    records: Mutex<HashMap<String, Workflow>>,
    version_counter: AtomicU64,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Seed a workflow, assigning it a fresh version token.
    pub fn insert(&self, mut workflow: Workflow) -> Workflow {
        workflow.meta.resource_version = self.next_version();
        let mut records = self.records.lock().expect("workflow records poisoned");
        records.insert(workflow.key(), workflow.clone());
        workflow
    }

    fn next_version(&self) -> String {
        let v = self.version_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("v{v}")
    }

    /// Content identity, version token excluded.
    fn fingerprint(workflow: &Workflow) -> String {
        let mut normalized = workflow.clone();
        normalized.meta.resource_version = String::new();
        serde_json::to_string(&normalized).expect("workflow serializes")
    }

    fn write(&self, workflow: Workflow, status_only: bool) -> Result<Workflow, StoreError> {
        let key = workflow.key();
        let mut records = self.records.lock().expect("workflow records poisoned");
        let merged = match records.get(&key) {
            Some(stored) if status_only => {
                let mut merged = stored.clone();
                merged.status = workflow.status;
                merged
            }
            Some(_) | None => workflow,
        };
        let unchanged = records
            .get(&key)
            .filter(|stored| Self::fingerprint(stored) == Self::fingerprint(&merged))
            .cloned();
        if let Some(stored) = unchanged {
            return Ok(stored);
        }
        let mut stored = merged;
        stored.meta.resource_version = self.next_version();
        records.insert(key, stored.clone());
        Ok(stored)
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Workflow, StoreError> {
        let records = self.records.lock().expect("workflow records poisoned");
        records
            .get(&workflow_key(namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(workflow_key(namespace, name)))
    }

    async fn update(&self, workflow: Workflow) -> Result<Workflow, StoreError> {
        self.write(workflow, false)
    }

    async fn update_status(&self, workflow: Workflow) -> Result<Workflow, StoreError> {
        self.write(workflow, true)
    }
}
