//! Configuration for the task-execution core.
//!
//! Uses the following environment variables:
//! - `WINDLASS_INJECT_FINALIZER`: attach the lifecycle finalizer to created
//!   resources so out-of-band deletion is observed before removal
//!   (default: false)
//! - `WINDLASS_TERMINATED_FILTER_CAPACITY`: capacity of the terminated
//!   workflow membership filter (default: 1000)

use std::collections::BTreeMap;
use std::env;

use serde::{Deserialize, Serialize};

/// Finalizer token appended to resources this core manages.
pub const FINALIZER: &str = "windlass/task-lifecycle";

/// Default capacity of the terminated-workflow filter. Sized for the number
/// of terminated workflows expected to linger concurrently; eviction only
/// costs one redundant re-check.
pub const DEFAULT_TERMINATED_FILTER_CAPACITY: usize = 1000;

/// Settings applied to every resource the lifecycle manager creates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPluginConfig {
    /// Annotations applied when the task supplies no value for the key.
    #[serde(default)]
    pub default_annotations: BTreeMap<String, String>,

    /// Labels applied when the task supplies no value for the key.
    #[serde(default)]
    pub default_labels: BTreeMap<String, String>,

    /// Whether created resources carry [`FINALIZER`].
    #[serde(default)]
    pub inject_finalizer: bool,

    /// Capacity of the terminated-workflow membership filter.
    #[serde(default = "default_filter_capacity")]
    pub terminated_filter_capacity: usize,
}

fn default_filter_capacity() -> usize {
    DEFAULT_TERMINATED_FILTER_CAPACITY
}

impl Default for TaskPluginConfig {
    fn default() -> Self {
        Self {
            default_annotations: BTreeMap::new(),
            default_labels: BTreeMap::new(),
            inject_finalizer: false,
            terminated_filter_capacity: DEFAULT_TERMINATED_FILTER_CAPACITY,
        }
    }
}

impl TaskPluginConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let inject_finalizer = env::var("WINDLASS_INJECT_FINALIZER")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let terminated_filter_capacity = env::var("WINDLASS_TERMINATED_FILTER_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TERMINATED_FILTER_CAPACITY);

        Self {
            inject_finalizer,
            terminated_filter_capacity,
            ..Self::default()
        }
    }
}
