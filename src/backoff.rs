//! Adaptive backoff for control-plane calls.
//!
//! Blends two signals per (resource-kind, namespace) key:
//! - a time window growing exponentially on failure (base 2s, cap 10m), and
//! - learned per-dimension ceilings: the smallest quantity recently rejected
//!   for insufficient quota.
//!
//! An operation is attempted when the window has elapsed *or* every
//! requested dimension is strictly below its ceiling, so small requests keep
//! flowing while the control plane rejects large ones. Refusals are
//! non-blocking and computed lazily against wall clock at call time; there
//! are no timers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::cluster::{Quantity, ResourceList};
use crate::error::{BackoffError, ClusterError};
use crate::quota;

/// Base of the exponential delay, in seconds (`base^exponent`).
pub const BACKOFF_BASE_SECS: u64 = 2;

/// Cap on the exponential delay.
pub const MAX_BACKOFF_SECS: u64 = 600;

/// Exponent-driven time window. The window only advances on failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleBackOffBlocker {
    exponent: u32,
    next_eligible: DateTime<Utc>,
}

impl SimpleBackOffBlocker {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            exponent: 0,
            next_eligible: now,
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.next_eligible
    }

    pub fn next_eligible_time(&self) -> DateTime<Utc> {
        self.next_eligible
    }

    /// Advance the window by the next exponential step and return the delay.
    pub fn grow(&mut self, now: DateTime<Utc>) -> Duration {
        let secs = BACKOFF_BASE_SECS
            .saturating_pow(self.exponent)
            .min(MAX_BACKOFF_SECS);
        let delay = Duration::seconds(secs as i64);
        self.next_eligible = now + delay;
        self.exponent = self.exponent.saturating_add(1);
        delay
    }

    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.exponent = 0;
        self.next_eligible = now;
    }
}

/// Smallest quantity rejected per resource dimension. An absent key means
/// unbounded; reset clears the map rather than writing a sentinel value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceCeilings {
    ceilings: HashMap<String, Quantity>,
}

impl ResourceCeilings {
    /// Eligible only when every requested dimension is strictly below its
    /// ceiling. The lookup is an explicit present/absent check: a dimension
    /// with no recorded ceiling never blocks.
    pub fn is_eligible(&self, requested: &ResourceList) -> bool {
        requested
            .iter()
            .all(|(dimension, quantity)| match self.ceilings.get(dimension) {
                Some(ceiling) => quantity < ceiling,
                None => true,
            })
    }

    /// Lower one dimension's ceiling; ceilings never move up except via
    /// [`Self::reset_all`].
    pub fn lower(&mut self, dimension: &str, quantity: Quantity) {
        match self.ceilings.get_mut(dimension) {
            Some(ceiling) if *ceiling <= quantity => {}
            Some(ceiling) => *ceiling = quantity,
            None => {
                self.ceilings.insert(dimension.to_string(), quantity);
            }
        }
    }

    pub fn lower_all(&mut self, rejected: &ResourceList) {
        for (dimension, quantity) in rejected {
            self.lower(dimension, *quantity);
        }
    }

    pub fn reset_all(&mut self) {
        self.ceilings.clear();
    }

    pub fn get(&self, dimension: &str) -> Option<Quantity> {
        self.ceilings.get(dimension).copied()
    }
}

#[derive(Debug)]
struct HandlerState {
    blocker: SimpleBackOffBlocker,
    ceilings: ResourceCeilings,
}

/// Per-key composition of the time window and the resource ceilings.
///
/// The internal mutex guards only in-memory bookkeeping and is never held
/// across the awaited operation, so concurrent callers on the same key can
/// race to attempt; the recorded outcome of each attempt is applied under
/// the lock.
#[derive(Debug)]
pub struct ResourceAwareBackOffHandler {
    state: Mutex<HandlerState>,
}

impl ResourceAwareBackOffHandler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HandlerState {
                blocker: SimpleBackOffBlocker::new(Utc::now()),
                ceilings: ResourceCeilings::default(),
            }),
        }
    }

    /// Route one operation through the backoff policy.
    ///
    /// Attempts iff the window has elapsed or `requested` fits under current
    /// ceilings. Success resets window and ceilings; failure grows the
    /// window, and a quota rejection additionally lowers the cited
    /// dimensions' ceilings. A refusal never invokes the operation.
    pub async fn run<F, Fut>(
        &self,
        requested: &ResourceList,
        operation: F,
    ) -> Result<(), BackoffError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), ClusterError>>,
    {
        let now = Utc::now();
        {
            let state = self.state.lock().expect("backoff state poisoned");
            if state.blocker.is_active(now) && !state.ceilings.is_eligible(requested) {
                metrics::counter!("windlass_backoff_blocked_total").increment(1);
                debug!(
                    next_eligible = %state.blocker.next_eligible_time(),
                    "refusing operation: backoff window active and request exceeds ceiling",
                );
                return Err(BackoffError::Blocked {
                    next_eligible: state.blocker.next_eligible_time(),
                });
            }
        }

        match operation().await {
            Ok(()) => {
                let mut state = self.state.lock().expect("backoff state poisoned");
                state.blocker.reset(Utc::now());
                state.ceilings.reset_all();
                Ok(())
            }
            Err(err) => {
                let mut state = self.state.lock().expect("backoff state poisoned");
                let delay = state.blocker.grow(Utc::now());
                if quota::is_quota_exceeded(&err) {
                    metrics::counter!("windlass_backoff_quota_rejected_total").increment(1);
                    let rejected = quota::rejected_quantities(&err.to_string());
                    warn!(
                        %err,
                        delay_secs = delay.num_seconds(),
                        lowered = rejected.len(),
                        "operation rejected for insufficient quota",
                    );
                    state.ceilings.lower_all(&rejected);
                } else {
                    warn!(
                        %err,
                        delay_secs = delay.num_seconds(),
                        "operation failed, backing off",
                    );
                }
                Err(BackoffError::Rejected { source: err })
            }
        }
    }

    /// Current ceiling for a dimension, if one is recorded.
    pub fn ceiling(&self, dimension: &str) -> Option<Quantity> {
        self.state
            .lock()
            .expect("backoff state poisoned")
            .ceilings
            .get(dimension)
    }

    /// Expiry of the current window.
    pub fn next_eligible_time(&self) -> DateTime<Utc> {
        self.state
            .lock()
            .expect("backoff state poisoned")
            .blocker
            .next_eligible_time()
    }
}

impl Default for ResourceAwareBackOffHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry key: one handler per resource kind per namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackoffKey {
    pub kind: String,
    pub namespace: String,
}

/// Lazily populated handler registry. Entries live for the process lifetime
/// and the map never shrinks; first access under concurrency yields exactly
/// one live handler per key.
#[derive(Debug, Default)]
pub struct BackoffRegistry {
    handlers: DashMap<BackoffKey, Arc<ResourceAwareBackOffHandler>>,
}

impl BackoffRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self, kind: &str, namespace: &str) -> Arc<ResourceAwareBackOffHandler> {
        let key = BackoffKey {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
        };
        self.handlers
            .entry(key)
            .or_insert_with(|| Arc::new(ResourceAwareBackOffHandler::new()))
            .clone()
    }
}
