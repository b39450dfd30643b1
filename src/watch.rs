//! Event filtering between a resource watch and the reconciliation queue.
//!
//! The subscription mechanics live elsewhere; a [`WatchBinding`] only decides
//! which raw events turn into work. Creates and deletes never do (the
//! lifecycle manager observes both through its own passes), and updates only
//! when the object actually changed and is controlled by the owner kind we
//! reconcile.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cluster::{NamespacedName, ObjectMeta};

/// Raw watch event for one resource object. Updates carry the previous
/// metadata when the watch layer has it; a missing `old` counts as a change.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Created(ObjectMeta),
    Updated {
        old: Option<ObjectMeta>,
        new: ObjectMeta,
    },
    Deleted(ObjectMeta),
    /// Out-of-band notification (e.g. a periodic resync) with no old/new pair.
    Generic(ObjectMeta),
}

/// Destination for reconciliation work derived from watch events.
pub trait WorkEnqueuer: Send + Sync {
    fn enqueue(&self, owner: NamespacedName) -> anyhow::Result<()>;
}

/// Binds one watched resource kind to the queue of its owning objects.
pub struct WatchBinding {
    resource_kind: String,
    owner_kind: String,
    queue: Arc<dyn WorkEnqueuer>,
}

impl WatchBinding {
    pub fn new(
        resource_kind: impl Into<String>,
        owner_kind: impl Into<String>,
        queue: Arc<dyn WorkEnqueuer>,
    ) -> Self {
        Self {
            resource_kind: resource_kind.into(),
            owner_kind: owner_kind.into(),
            queue,
        }
    }

    /// Whether this binding consumes events for `kind`.
    pub fn wants(&self, kind: &str) -> bool {
        kind == self.resource_kind
    }

    /// Filter one event, enqueueing the controlling owner when it passes.
    /// Enqueue failures are logged and swallowed; the next resync redelivers.
    pub fn observe(&self, event: WatchEvent) {
        match event {
            WatchEvent::Created(meta) => {
                metrics::counter!("windlass_watch_create_dropped_total").increment(1);
                debug!(object = %meta.namespaced_name(), "dropping create event");
            }
            WatchEvent::Deleted(meta) => {
                metrics::counter!("windlass_watch_delete_dropped_total").increment(1);
                debug!(object = %meta.namespaced_name(), "dropping delete event");
            }
            WatchEvent::Updated { old, new } => {
                let changed = match &old {
                    Some(old) => old.resource_version != new.resource_version,
                    None => true,
                };
                if changed && self.enqueue_owner(&new) {
                    metrics::counter!("windlass_watch_update_enqueued_total").increment(1);
                } else {
                    metrics::counter!("windlass_watch_update_dropped_total").increment(1);
                    debug!(
                        object = %new.namespaced_name(),
                        changed,
                        "dropping update event",
                    );
                }
            }
            WatchEvent::Generic(meta) => {
                if self.enqueue_owner(&meta) {
                    metrics::counter!("windlass_watch_generic_enqueued_total").increment(1);
                } else {
                    metrics::counter!("windlass_watch_generic_dropped_total").increment(1);
                }
            }
        }
    }

    /// Enqueue the controlling owner iff its kind matches. Returns whether
    /// the event was enqueued.
    fn enqueue_owner(&self, meta: &ObjectMeta) -> bool {
        let Some(owner) = meta.controller() else {
            return false;
        };
        if owner.kind != self.owner_kind {
            return false;
        }
        let target = NamespacedName::new(&meta.namespace, &owner.name);
        if let Err(err) = self.queue.enqueue(target.clone()) {
            warn!(owner = %target, %err, "failed to enqueue watch event");
        }
        true
    }
}
