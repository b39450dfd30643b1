//! Windlass - the task-execution core of a cluster-backed workflow
//! orchestrator.
//!
//! Three cooperating pieces: a persisted state machine that drives each
//! task's backing resource through create, observe and finalize
//! ([`lifecycle::ResourceLifecycleManager`]); an adaptive backoff layer that
//! throttles control-plane calls under sustained quota rejection while
//! letting small requests through ([`backoff::BackoffRegistry`]); and a
//! staleness/eviction cache in front of the workflow persistence store
//! ([`staleness::StalenessAwareStore`]).

pub mod backoff;
pub mod client;
pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod observability;
pub mod phase;
pub mod quota;
pub mod staleness;
pub mod testing;
pub mod watch;
pub mod workflowstore;

pub use backoff::{BackoffRegistry, ResourceAwareBackOffHandler};
pub use client::ClusterClient;
pub use cluster::{NamespacedName, ObjectMeta, Quantity, ResourceList, ResourceObject};
pub use config::TaskPluginConfig;
pub use context::{TaskExecutionContext, TaskMetadata, TaskPlugin};
pub use error::{BackoffError, ClusterError, StoreError};
pub use lifecycle::ResourceLifecycleManager;
pub use phase::{TaskPhase, Transition};
pub use staleness::StalenessAwareStore;
pub use watch::{WatchBinding, WatchEvent};
pub use workflowstore::{Workflow, WorkflowStore};
