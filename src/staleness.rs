//! Staleness/eviction cache in front of the workflow store.
//!
//! Suppresses redundant reconciliation passes two ways: a version-token
//! cache that turns reads of an unchanged workflow into a stale signal, and
//! a bounded membership filter that short-circuits reads of workflows known
//! to have terminated. Both are in-memory only; losing them on restart costs
//! extra passes, never correctness.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::cluster::ManagedFieldsEntry;
use crate::error::StoreError;
use crate::workflowstore::{Workflow, WorkflowStore};

/// Bounded approximate membership set with least-recently-used eviction.
///
/// `contains` refreshes recency, so keys that keep being asked about stay
/// resident. Eviction produces a false negative, costing the caller one
/// redundant re-check; there are no false positives.
pub struct LruFilter {
    capacity: usize,
    state: Mutex<LruState>,
}

struct LruState {
    seq: u64,
    /// key -> most recent touch sequence.
    entries: HashMap<String, u64>,
    /// Touch log; stale entries (sequence no longer current for the key)
    /// are dropped lazily when they surface or on compaction.
    order: VecDeque<(u64, String)>,
}

impl LruFilter {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(LruState {
                seq: 0,
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn add(&self, key: &str) {
        let mut state = self.state.lock().expect("lru filter poisoned");
        Self::touch(&mut state, key);
        while state.entries.len() > self.capacity {
            let Some((seq, victim)) = state.order.pop_front() else {
                break;
            };
            if state.entries.get(&victim) == Some(&seq) {
                state.entries.remove(&victim);
                metrics::counter!("windlass_terminated_filter_evicted_total").increment(1);
            }
        }
        self.compact(&mut state);
    }

    pub fn contains(&self, key: &str) -> bool {
        let mut state = self.state.lock().expect("lru filter poisoned");
        if !state.entries.contains_key(key) {
            return false;
        }
        Self::touch(&mut state, key);
        self.compact(&mut state);
        true
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("lru filter poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn touch(state: &mut LruState, key: &str) {
        state.seq += 1;
        let seq = state.seq;
        state.entries.insert(key.to_string(), seq);
        state.order.push_back((seq, key.to_string()));
    }

    /// Keep the touch log proportional to the live set: drop stale head
    /// entries, and rebuild the log outright if repeated touches let it
    /// balloon past four times capacity.
    fn compact(&self, state: &mut LruState) {
        while let Some((seq, key)) = state.order.front() {
            if state.entries.get(key) == Some(seq) {
                break;
            }
            state.order.pop_front();
        }
        if state.order.len() > self.capacity * 4 {
            let mut live: Vec<(u64, String)> = state
                .entries
                .iter()
                .map(|(k, s)| (*s, k.clone()))
                .collect();
            live.sort_unstable();
            state.order = live.into();
        }
    }
}

/// Decorator over a [`WorkflowStore`] that tracks last-accepted version
/// tokens and terminated workflows.
pub struct StalenessAwareStore {
    inner: Arc<dyn WorkflowStore>,
    versions: DashMap<String, String>,
    terminated: LruFilter,
}

impl StalenessAwareStore {
    pub fn new(inner: Arc<dyn WorkflowStore>, terminated_capacity: usize) -> Self {
        Self {
            inner,
            versions: DashMap::new(),
            terminated: LruFilter::new(terminated_capacity),
        }
    }

    /// Cached last-accepted version token for a key, if any.
    pub fn cached_version(&self, key: &str) -> Option<String> {
        self.versions.get(key).map(|v| v.clone())
    }

    pub fn is_terminated(&self, key: &str) -> bool {
        self.terminated.contains(key)
    }

    fn record_write(&self, supplied: &Workflow, stored: &Workflow) {
        let key = supplied.key();
        if stored.meta.resource_version == supplied.meta.resource_version {
            metrics::counter!("windlass_workflow_redundant_update_total").increment(1);
        } else if !stored.status.is_terminal() {
            self.versions.insert(key.clone(), stored.meta.resource_version.clone());
        }

        if stored.status.is_terminal() {
            metrics::counter!("windlass_workflow_evicted_total").increment(1);
            self.versions.remove(&key);
            self.terminated.add(&key);
            debug!(workflow = %key, "workflow terminated, short-circuiting future reads");
        }
    }

    /// Clear accumulated field-management metadata down to a single empty
    /// entry. The workflow object has a sole writer, so the bookkeeping only
    /// inflates the persisted object and slows store I/O.
    fn truncate_managed_fields(workflow: &mut Workflow) {
        if !workflow.meta.managed_fields.is_empty() {
            workflow.meta.managed_fields.truncate(1);
            workflow.meta.managed_fields[0] = ManagedFieldsEntry::default();
        }
    }
}

#[async_trait]
impl WorkflowStore for StalenessAwareStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Workflow, StoreError> {
        let key = crate::workflowstore::workflow_key(namespace, name);
        if self.terminated.contains(&key) {
            metrics::counter!("windlass_workflow_terminated_hit_total").increment(1);
            return Err(StoreError::Terminated);
        }

        let workflow = self.inner.get(namespace, name).await?;
        let stale = self
            .versions
            .get(&key)
            .is_some_and(|cached| *cached == workflow.meta.resource_version);
        if stale {
            metrics::counter!("windlass_workflow_stale_total").increment(1);
            return Err(StoreError::Stale);
        }
        Ok(workflow)
    }

    async fn update(&self, mut workflow: Workflow) -> Result<Workflow, StoreError> {
        Self::truncate_managed_fields(&mut workflow);
        let stored = self.inner.update(workflow.clone()).await?;
        self.record_write(&workflow, &stored);
        Ok(stored)
    }

    async fn update_status(&self, workflow: Workflow) -> Result<Workflow, StoreError> {
        let stored = self.inner.update_status(workflow.clone()).await?;
        self.record_write(&workflow, &stored);
        Ok(stored)
    }
}
