//! Task phases, the transitions the lifecycle manager hands back to the
//! scheduler, and the small persisted state blob that makes those
//! transitions idempotent across reconciliation passes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version stamped on every persisted [`PluginState`] blob. A mismatch is a
/// retryable corrupted-state condition, not a fatal one.
pub const PLUGIN_STATE_VERSION: u32 = 1;

/// Observable phase of a task, as reported to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskPhase {
    Undefined,
    WaitingForResources,
    Queued,
    Initializing,
    Running,
    Success,
    RetryableFailure,
    PermanentFailure,
}

impl TaskPhase {
    /// Terminal phases end the current attempt; the scheduler decides
    /// whether a retryable failure spawns another attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskPhase::Success | TaskPhase::RetryableFailure | TaskPhase::PermanentFailure
        )
    }
}

/// A phase transition produced by one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub phase: TaskPhase,
    /// Machine-readable reason code, set on failure transitions.
    pub code: Option<String>,
    pub message: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl Transition {
    fn new(phase: TaskPhase, code: Option<String>, message: Option<String>) -> Self {
        Self {
            phase,
            code,
            message,
            occurred_at: Utc::now(),
        }
    }

    pub fn queued(message: impl Into<String>) -> Self {
        Self::new(TaskPhase::Queued, None, Some(message.into()))
    }

    pub fn waiting_for_resources(message: impl Into<String>) -> Self {
        Self::new(TaskPhase::WaitingForResources, None, Some(message.into()))
    }

    pub fn running() -> Self {
        Self::new(TaskPhase::Running, None, None)
    }

    pub fn success() -> Self {
        Self::new(TaskPhase::Success, None, None)
    }

    pub fn retryable_failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            TaskPhase::RetryableFailure,
            Some(code.into()),
            Some(message.into()),
        )
    }

    pub fn permanent_failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            TaskPhase::PermanentFailure,
            Some(code.into()),
            Some(message.into()),
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

/// Phase of the per-task state machine persisted between passes.
///
/// `AllocationTokenAcquired` is declared but never reached by any current
/// transition; it is kept for state-blob compatibility pending product
/// clarification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PluginPhase {
    #[default]
    NotStarted,
    AllocationTokenAcquired,
    Started,
}

/// The persisted state machine blob, stored versioned alongside the task
/// record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginState {
    pub phase: PluginPhase,
}

/// A versioned state blob as read back from the task record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateBlob {
    pub version: u32,
    pub payload: Vec<u8>,
}

impl StateBlob {
    pub fn encode(version: u32, state: &PluginState) -> anyhow::Result<Self> {
        Ok(Self {
            version,
            payload: serde_json::to_vec(state)?,
        })
    }

    pub fn decode(&self) -> Result<PluginState, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}
