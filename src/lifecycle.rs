//! Drives one task's backing resource through create → observe → finalize.
//!
//! The scheduler calls [`ResourceLifecycleManager::handle`] once per
//! reconciliation pass. A small persisted state machine decides whether the
//! pass launches the resource or checks on it; every transition is
//! idempotent and safe under at-least-once invocation.

use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffRegistry;
use crate::client::ClusterClient;
use crate::cluster::ResourceObject;
use crate::config::{TaskPluginConfig, FINALIZER};
use crate::context::{FileOutputReader, OutputReader, TaskExecutionContext, TaskMetadata, TaskPlugin};
use crate::error::BackoffError;
use crate::phase::{
    PluginPhase, PluginState, StateBlob, TaskPhase, Transition, PLUGIN_STATE_VERSION,
};
use crate::quota;

/// Scheduler-facing capability flags. Currently empty; present so the
/// scheduler interface stays stable when capabilities appear.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PluginProperties {}

/// Generic manager for tasks backed by a cluster resource. Task types plug
/// in through [`TaskPlugin`]; everything else (metadata stamping, backoff,
/// phase bookkeeping, finalization) is shared here.
pub struct ResourceLifecycleManager {
    id: String,
    plugin: Arc<dyn TaskPlugin>,
    client: Arc<dyn ClusterClient>,
    config: TaskPluginConfig,
    backoff: Arc<BackoffRegistry>,
}

impl ResourceLifecycleManager {
    pub fn new(
        plugin: Arc<dyn TaskPlugin>,
        client: Arc<dyn ClusterClient>,
        config: TaskPluginConfig,
        backoff: Arc<BackoffRegistry>,
    ) -> Self {
        Self {
            id: plugin.id().to_string(),
            plugin,
            client,
            config,
            backoff,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn properties(&self) -> PluginProperties {
        PluginProperties::default()
    }

    /// One reconciliation pass: launch if the task has not started, observe
    /// otherwise. The phase moves to `Started` only once launch reports the
    /// resource queued, and is persisted before the transition is returned.
    pub async fn handle(&self, ctx: &dyn TaskExecutionContext) -> anyhow::Result<Transition> {
        let state = match ctx.read_state().context("reading plugin state")? {
            None => PluginState::default(),
            Some(blob) if blob.version != PLUGIN_STATE_VERSION => {
                return Ok(Transition::retryable_failure(
                    "CorruptedPluginState",
                    format!(
                        "plugin state version mismatch: expected [{PLUGIN_STATE_VERSION}] got [{}]",
                        blob.version
                    ),
                ));
            }
            Some(blob) => blob
                .decode()
                .context("CorruptedPluginState: failed to decode plugin state")?,
        };

        if state.phase == PluginPhase::NotStarted {
            let transition = self.launch_resource(ctx).await?;
            if transition.phase == TaskPhase::Queued {
                let blob = StateBlob::encode(
                    PLUGIN_STATE_VERSION,
                    &PluginState {
                        phase: PluginPhase::Started,
                    },
                )?;
                ctx.write_state(blob)
                    .context("persisting plugin state after launch")?;
            }
            return Ok(transition);
        }

        self.check_resource_phase(ctx).await
    }

    /// Build, stamp and create the backing resource, routed through the
    /// per-(kind, namespace) backoff handler.
    async fn launch_resource(&self, ctx: &dyn TaskExecutionContext) -> anyhow::Result<Transition> {
        let mut object = self
            .plugin
            .build_resource(ctx)
            .await
            .with_context(|| format!("plugin [{}] failed to build resource", self.id))?;
        self.apply_object_metadata(ctx.metadata(), &mut object);

        info!(
            kind = %object.kind,
            object = %object.meta.namespaced_name(),
            "creating backing resource",
        );

        let requested = object.requested_limits();
        let handler = self.backoff.handler(&object.kind, &object.meta.namespace);
        let outcome = handler
            .run(&requested, || async { self.client.create(&object).await })
            .await;

        let source = match outcome {
            Ok(()) => return Ok(Transition::queued("task submitted to cluster")),
            Err(BackoffError::Blocked { next_eligible }) => {
                warn!(
                    object = %object.meta.namespaced_name(),
                    %next_eligible,
                    "launch refused: backoff window active",
                );
                return Ok(Transition::waiting_for_resources(format!(
                    "resource quota exceeded, creation blocked until {next_eligible}"
                )));
            }
            Err(BackoffError::Rejected { source }) => source,
        };

        if source.is_already_exists() {
            // A previous pass created the object and failed before
            // persisting; treat as a successful idempotent retry.
            return Ok(Transition::queued("task submitted to cluster"));
        }
        if quota::is_quota_exceeded(&source) {
            // Quota rejections are retried indefinitely; there is no retry
            // cap at this layer.
            warn!(object = %object.meta.namespaced_name(), %source, "launch rejected for quota");
            return Ok(Transition::waiting_for_resources(
                "failed to launch task, resource quota exceeded",
            ));
        }
        if source.is_forbidden() {
            return Ok(Transition::retryable_failure(
                "RuntimeFailure",
                source.to_string(),
            ));
        }
        if source.is_malformed() {
            error!(plugin = %self.id, %source, "badly formatted resource");
            return Ok(Transition::permanent_failure(
                "BadResourceFormat",
                source.to_string(),
            ));
        }
        if source.is_too_large() {
            error!(plugin = %self.id, %source, "resource too large");
            return Ok(Transition::permanent_failure(
                "EntityTooLarge",
                source.to_string(),
            ));
        }

        let reason = source.reason();
        error!(plugin = %self.id, %source, reason, "failed to launch task, system error");
        Err(anyhow::Error::new(source)
            .context(format!("failed to create resource ({reason})")))
    }

    /// Fetch the backing resource and translate what the plugin sees into a
    /// phase transition, committing outputs on success.
    async fn check_resource_phase(
        &self,
        ctx: &dyn TaskExecutionContext,
    ) -> anyhow::Result<Transition> {
        let metadata = ctx.metadata();
        let mut object = match self.plugin.build_identity_resource(metadata) {
            Ok(object) => object,
            Err(err) => {
                error!(
                    name = %metadata.generated_name,
                    %err,
                    "failed to build identity resource",
                );
                return Ok(Transition::permanent_failure(
                    "BadTaskDefinition",
                    format!("failed to build resource, caused by: {err}"),
                ));
            }
        };
        self.apply_object_metadata(metadata, &mut object);
        let nsname = object.meta.namespaced_name();

        let fetched = match self.client.get(&object.kind, &nsname).await {
            Ok(fetched) => fetched,
            Err(err) if err.is_not_exists() => {
                // Happens when a node goes away and the platform removes the
                // resource underneath us; retried by the scheduler's policy.
                warn!(object = %nsname, %err, "backing resource not found");
                return Ok(Transition::retryable_failure(
                    "ResourceNotFound",
                    format!("resource not found, name [{nsname}]. reason: {err}"),
                ));
            }
            Err(err) => {
                let reason = err.reason();
                warn!(object = %nsname, %err, reason, "failed to fetch backing resource");
                return Err(anyhow::Error::new(err)
                    .context(format!("failed to fetch resource [{nsname}] ({reason})")));
            }
        };

        if fetched.meta.is_deleted() {
            metrics::counter!("windlass_resource_deleted_total").increment(1);
        }

        let check = self
            .plugin
            .task_phase(ctx, &fetched)
            .await
            .with_context(|| format!("plugin [{}] failed to evaluate task phase", self.id))?;
        let transition = check.transition;

        if transition.phase == TaskPhase::Success {
            let reader: Arc<dyn OutputReader> = match check.outputs {
                Some(reader) => {
                    debug!(plugin = %self.id, "plugin supplied an output reader");
                    reader
                }
                None => {
                    debug!(plugin = %self.id, "no output reader supplied, assuming file-based outputs");
                    Arc::new(FileOutputReader::new(ctx.output_root()))
                }
            };
            let outputs = reader
                .read()
                .await
                .with_context(|| format!("reading outputs for [{nsname}]"))?;
            ctx.output_sink()
                .commit(outputs)
                .await
                .with_context(|| format!("committing outputs for [{nsname}]"))?;
            return Ok(transition);
        }

        if !transition.is_terminal() && fetched.meta.is_deleted() {
            // The resource carries a deletion marker while the task still
            // looks live: deleted out-of-band (node loss or manual delete).
            // Our finalizer would hold it forever, so fail the attempt and
            // let finalize release it.
            return Ok(Transition::retryable_failure(
                "ResourceDeletedExternally",
                format!("object [{nsname}] terminated in the background"),
            ));
        }

        Ok(transition)
    }

    /// Cancellation is owner-reference garbage collection plus the finalizer
    /// removal in [`Self::finalize`]; nothing to do here.
    pub async fn abort(&self, ctx: &dyn TaskExecutionContext) -> anyhow::Result<()> {
        info!(
            name = %ctx.metadata().generated_name,
            "abort invoked, deletion is delegated to owner GC",
        );
        Ok(())
    }

    /// Release the lifecycle finalizer so the platform can remove the
    /// resource. Idempotent: every step tolerates repetition, and any
    /// transient failure is retried on the next invocation.
    pub async fn finalize(&self, ctx: &dyn TaskExecutionContext) -> anyhow::Result<()> {
        if !self.config.inject_finalizer {
            return Ok(());
        }
        let metadata = ctx.metadata();
        let mut object = match self.plugin.build_identity_resource(metadata) {
            Ok(object) => object,
            Err(err) => {
                // Building the identity would fail again on every retry, so
                // skip finalization rather than wedge the task forever.
                error!(
                    name = %metadata.generated_name,
                    %err,
                    "failed to build identity resource while finalizing, skipping",
                );
                return Ok(());
            }
        };
        self.apply_object_metadata(metadata, &mut object);
        let nsname = object.meta.namespaced_name();

        let fetched = match self.client.get(&object.kind, &nsname).await {
            Ok(fetched) => fetched,
            Err(err) if err.is_not_exists() => return Ok(()),
            Err(err) => {
                warn!(object = %nsname, %err, "failed to fetch resource while finalizing");
                return Err(anyhow::Error::new(err)
                    .context(format!("failed to fetch resource [{nsname}] while finalizing")));
            }
        };

        self.clear_finalizers(fetched).await
    }

    async fn clear_finalizers(&self, mut object: ResourceObject) -> anyhow::Result<()> {
        let nsname = object.meta.namespaced_name();
        if object.meta.finalizers.is_empty() {
            debug!(object = %nsname, "finalizers already empty");
            return Ok(());
        }
        object.meta.finalizers.clear();
        match self.client.update(&object).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_exists() => Ok(()),
            Err(err) => {
                warn!(object = %nsname, %err, "failed to clear finalizers");
                Err(anyhow::Error::new(err)
                    .context(format!("failed to clear finalizers on [{nsname}]")))
            }
        }
    }

    /// Stamp ownership metadata onto a built object. Idempotent; applied on
    /// both the launch and observe paths so the object identity is always
    /// derived the same way. Task-supplied labels/annotations win over
    /// configured defaults, and defaults only fill gaps.
    fn apply_object_metadata(&self, metadata: &TaskMetadata, object: &mut ResourceObject) {
        let meta = &mut object.meta;
        meta.namespace = metadata.namespace.clone();
        meta.name = metadata.generated_name.clone();

        let mut annotations = self.config.default_annotations.clone();
        annotations.extend(std::mem::take(&mut meta.annotations));
        annotations.extend(metadata.annotations.clone());
        meta.annotations = annotations;

        let mut labels = self.config.default_labels.clone();
        labels.extend(std::mem::take(&mut meta.labels));
        labels.extend(metadata.labels.clone());
        meta.labels = labels;

        meta.owner_references = vec![metadata.owner_reference.clone()];

        if self.config.inject_finalizer && !meta.finalizers.iter().any(|f| f == FINALIZER) {
            meta.finalizers.push(FINALIZER.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;
    use crate::cluster::{ObjectMeta, Quantity};
    use crate::error::ClusterError;
    use crate::phase::PluginPhase;
    use crate::testing::{FakeCluster, StubPlugin, TestContext};

    fn manager(
        plugin: Arc<StubPlugin>,
        cluster: Arc<FakeCluster>,
        config: TaskPluginConfig,
    ) -> ResourceLifecycleManager {
        ResourceLifecycleManager::new(plugin, cluster, config, Arc::new(BackoffRegistry::new()))
    }

    fn quota_rejection(detail: &str) -> ClusterError {
        ClusterError::Forbidden {
            message: format!("exceeded quota: project-quota, {detail}"),
        }
    }

    fn decode_phase(ctx: &TestContext) -> Option<PluginPhase> {
        ctx.stored_state().map(|blob| blob.decode().unwrap().phase)
    }

    #[tokio::test]
    async fn launch_success_is_queued_and_persists_started() {
        let plugin = Arc::new(StubPlugin::new("Pod", &[("cpu", "1")]));
        let cluster = FakeCluster::shared();
        let mgr = manager(plugin, cluster.clone(), TaskPluginConfig::default());
        let ctx = TestContext::new("ns", "task-0");

        let transition = mgr.handle(&ctx).await.unwrap();
        assert_eq!(transition.phase, TaskPhase::Queued);
        assert_eq!(decode_phase(&ctx), Some(PluginPhase::Started));
        assert!(cluster
            .object("Pod", &crate::cluster::NamespacedName::new("ns", "task-0"))
            .is_some());
    }

    #[tokio::test]
    async fn launch_already_exists_is_idempotent_queued() {
        let plugin = Arc::new(StubPlugin::new("Pod", &[("cpu", "1")]));
        let cluster = FakeCluster::shared();
        let mgr = manager(plugin, cluster.clone(), TaskPluginConfig::default());

        // First pass creates; wipe the persisted state to simulate a crash
        // between create and persist, then retry.
        let ctx = TestContext::new("ns", "task-0");
        mgr.handle(&ctx).await.unwrap();
        let retry_ctx = TestContext::new("ns", "task-0");
        let transition = mgr.handle(&retry_ctx).await.unwrap();
        assert_eq!(transition.phase, TaskPhase::Queued);
        assert_eq!(decode_phase(&retry_ctx), Some(PluginPhase::Started));
    }

    #[tokio::test]
    async fn launch_quota_rejection_waits_and_learns_ceiling() {
        let plugin = Arc::new(StubPlugin::new("Pod", &[("cpu", "4")]));
        let cluster = FakeCluster::shared();
        let registry = Arc::new(BackoffRegistry::new());
        let mgr = ResourceLifecycleManager::new(
            plugin,
            cluster.clone(),
            TaskPluginConfig::default(),
            registry.clone(),
        );
        cluster.fail_creates_with(quota_rejection("requested: limits.cpu=4, used: limits.cpu=1"));

        let ctx = TestContext::new("ns", "task-0");
        let transition = mgr.handle(&ctx).await.unwrap();
        assert_eq!(transition.phase, TaskPhase::WaitingForResources);
        // Not queued, so the phase must not advance.
        assert_eq!(decode_phase(&ctx), None);

        let handler = registry.handler("Pod", "ns");
        assert!(handler.ceiling("cpu").unwrap() <= Quantity::from_units(4));
        assert!(handler.next_eligible_time() > Utc::now());

        // A smaller task fits under the learned ceiling and launches even
        // though the window is active.
        cluster.clear_create_failure();
        let small = Arc::new(StubPlugin::new("Pod", &[("cpu", "2")]));
        let small_mgr = ResourceLifecycleManager::new(
            small,
            cluster.clone(),
            TaskPluginConfig::default(),
            registry,
        );
        let small_ctx = TestContext::new("ns", "task-1");
        let transition = small_mgr.handle(&small_ctx).await.unwrap();
        assert_eq!(transition.phase, TaskPhase::Queued);
    }

    #[tokio::test]
    async fn launch_blocked_window_waits_without_create_call() {
        let plugin = Arc::new(StubPlugin::new("Pod", &[("cpu", "4")]));
        let cluster = FakeCluster::shared();
        let registry = Arc::new(BackoffRegistry::new());
        let mgr = ResourceLifecycleManager::new(
            plugin,
            cluster.clone(),
            TaskPluginConfig::default(),
            registry,
        );
        cluster.fail_creates_with(quota_rejection("requested: limits.cpu=4"));

        let ctx = TestContext::new("ns", "task-0");
        mgr.handle(&ctx).await.unwrap();
        let creates_after_first = cluster.create_calls();

        // Same size again: at the ceiling, inside the window -> refused
        // without touching the control plane.
        let ctx2 = TestContext::new("ns", "task-1");
        let transition = mgr.handle(&ctx2).await.unwrap();
        assert_eq!(transition.phase, TaskPhase::WaitingForResources);
        assert_eq!(cluster.create_calls(), creates_after_first);
    }

    #[tokio::test]
    async fn launch_forbidden_non_quota_is_retryable() {
        let plugin = Arc::new(StubPlugin::new("Pod", &[("cpu", "1")]));
        let cluster = FakeCluster::shared();
        cluster.fail_creates_with(ClusterError::Forbidden {
            message: "RBAC: denied".into(),
        });
        let mgr = manager(plugin, cluster, TaskPluginConfig::default());

        let transition = mgr.handle(&TestContext::new("ns", "task-0")).await.unwrap();
        assert_eq!(transition.phase, TaskPhase::RetryableFailure);
        assert_eq!(transition.code.as_deref(), Some("RuntimeFailure"));
    }

    #[tokio::test]
    async fn launch_malformed_resource_is_terminal_failure() {
        let plugin = Arc::new(StubPlugin::new("Pod", &[("cpu", "1")]));
        let cluster = FakeCluster::shared();
        cluster.fail_creates_with(ClusterError::Invalid("spec.containers required".into()));
        let mgr = manager(plugin, cluster, TaskPluginConfig::default());

        let transition = mgr.handle(&TestContext::new("ns", "task-0")).await.unwrap();
        assert_eq!(transition.phase, TaskPhase::PermanentFailure);
        assert_eq!(transition.code.as_deref(), Some("BadResourceFormat"));
    }

    #[tokio::test]
    async fn launch_entity_too_large_is_terminal_failure() {
        let plugin = Arc::new(StubPlugin::new("Pod", &[("cpu", "1")]));
        let cluster = FakeCluster::shared();
        cluster.fail_creates_with(ClusterError::TooLarge("3MB object".into()));
        let mgr = manager(plugin, cluster, TaskPluginConfig::default());

        let transition = mgr.handle(&TestContext::new("ns", "task-0")).await.unwrap();
        assert_eq!(transition.phase, TaskPhase::PermanentFailure);
        assert_eq!(transition.code.as_deref(), Some("EntityTooLarge"));
    }

    #[tokio::test]
    async fn launch_system_error_is_fatal() {
        let plugin = Arc::new(StubPlugin::new("Pod", &[("cpu", "1")]));
        let cluster = FakeCluster::shared();
        cluster.fail_creates_with(ClusterError::Api {
            reason: "ServerTimeout".into(),
            message: "etcd leader changed".into(),
        });
        let mgr = manager(plugin, cluster, TaskPluginConfig::default());

        let err = mgr
            .handle(&TestContext::new("ns", "task-0"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ServerTimeout"));
    }

    #[tokio::test]
    async fn handle_version_mismatch_is_retryable_corrupted_state() {
        let plugin = Arc::new(StubPlugin::new("Pod", &[]));
        let mgr = manager(plugin, FakeCluster::shared(), TaskPluginConfig::default());
        let ctx = TestContext::new("ns", "task-0");
        ctx.seed_state(StateBlob {
            version: 7,
            payload: b"{}".to_vec(),
        });

        let transition = mgr.handle(&ctx).await.unwrap();
        assert_eq!(transition.phase, TaskPhase::RetryableFailure);
        assert_eq!(transition.code.as_deref(), Some("CorruptedPluginState"));
    }

    #[tokio::test]
    async fn handle_undecodable_state_is_fatal() {
        let plugin = Arc::new(StubPlugin::new("Pod", &[]));
        let mgr = manager(plugin, FakeCluster::shared(), TaskPluginConfig::default());
        let ctx = TestContext::new("ns", "task-0");
        ctx.seed_state(StateBlob {
            version: PLUGIN_STATE_VERSION,
            payload: b"not json".to_vec(),
        });

        let err = mgr.handle(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("CorruptedPluginState"));
    }

    fn started_ctx(namespace: &str, name: &str) -> TestContext {
        let ctx = TestContext::new(namespace, name);
        ctx.seed_state(
            StateBlob::encode(
                PLUGIN_STATE_VERSION,
                &PluginState {
                    phase: PluginPhase::Started,
                },
            )
            .unwrap(),
        );
        ctx
    }

    #[tokio::test]
    async fn check_not_found_is_retryable_with_namespaced_name() {
        let plugin = Arc::new(StubPlugin::new("Pod", &[]));
        let mgr = manager(plugin, FakeCluster::shared(), TaskPluginConfig::default());

        let transition = mgr.handle(&started_ctx("ns", "task-0")).await.unwrap();
        assert_eq!(transition.phase, TaskPhase::RetryableFailure);
        assert_eq!(transition.code.as_deref(), Some("ResourceNotFound"));
        assert!(transition.message.unwrap().contains("ns/task-0"));
    }

    #[tokio::test]
    async fn check_bad_identity_is_bad_task_definition() {
        let plugin = Arc::new(StubPlugin::new("Pod", &[]));
        plugin.fail_identity();
        let mgr = manager(plugin, FakeCluster::shared(), TaskPluginConfig::default());

        let transition = mgr.handle(&started_ctx("ns", "task-0")).await.unwrap();
        assert_eq!(transition.phase, TaskPhase::PermanentFailure);
        assert_eq!(transition.code.as_deref(), Some("BadTaskDefinition"));
    }

    #[tokio::test]
    async fn check_success_commits_outputs_via_default_reader() {
        let plugin = Arc::new(StubPlugin::new("Pod", &[]));
        plugin.set_phase(Transition::success());
        let cluster = FakeCluster::shared();
        cluster.put(ResourceObject {
            kind: "Pod".into(),
            meta: ObjectMeta {
                namespace: "ns".into(),
                name: "task-0".into(),
                ..Default::default()
            },
            ..Default::default()
        });
        let mgr = manager(plugin, cluster, TaskPluginConfig::default());

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("outputs.json"), br#"{"answer": 42}"#).unwrap();
        let ctx = started_ctx("ns", "task-0").with_output_root(dir.path());
        ctx.seed_state(
            StateBlob::encode(
                PLUGIN_STATE_VERSION,
                &PluginState {
                    phase: PluginPhase::Started,
                },
            )
            .unwrap(),
        );

        let transition = mgr.handle(&ctx).await.unwrap();
        assert_eq!(transition.phase, TaskPhase::Success);
        let committed = ctx.sink().committed();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0]["answer"], 42);
    }

    #[tokio::test]
    async fn check_success_with_missing_outputs_is_fatal() {
        let plugin = Arc::new(StubPlugin::new("Pod", &[]));
        plugin.set_phase(Transition::success());
        let cluster = FakeCluster::shared();
        cluster.put(ResourceObject {
            kind: "Pod".into(),
            meta: ObjectMeta {
                namespace: "ns".into(),
                name: "task-0".into(),
                ..Default::default()
            },
            ..Default::default()
        });
        let mgr = manager(plugin, cluster, TaskPluginConfig::default());

        let dir = tempfile::tempdir().unwrap();
        let ctx = started_ctx("ns", "task-0").with_output_root(dir.path());
        ctx.seed_state(
            StateBlob::encode(
                PLUGIN_STATE_VERSION,
                &PluginState {
                    phase: PluginPhase::Started,
                },
            )
            .unwrap(),
        );

        assert!(mgr.handle(&ctx).await.is_err());
        assert!(ctx.sink().committed().is_empty());
    }

    #[tokio::test]
    async fn check_background_deletion_overrides_non_terminal_phase() {
        let plugin = Arc::new(StubPlugin::new("Pod", &[]));
        plugin.set_phase(Transition::running());
        let cluster = FakeCluster::shared();
        cluster.put(ResourceObject {
            kind: "Pod".into(),
            meta: ObjectMeta {
                namespace: "ns".into(),
                name: "task-0".into(),
                deletion_timestamp: Some(Utc::now()),
                ..Default::default()
            },
            ..Default::default()
        });
        let mgr = manager(plugin, cluster, TaskPluginConfig::default());

        let transition = mgr.handle(&started_ctx("ns", "task-0")).await.unwrap();
        assert_eq!(transition.phase, TaskPhase::RetryableFailure);
        assert_eq!(
            transition.code.as_deref(),
            Some("ResourceDeletedExternally")
        );
    }

    #[tokio::test]
    async fn check_terminal_phase_passes_through_despite_deletion() {
        let plugin = Arc::new(StubPlugin::new("Pod", &[]));
        plugin.set_phase(Transition::permanent_failure("TaskFailed", "exit code 1"));
        let cluster = FakeCluster::shared();
        cluster.put(ResourceObject {
            kind: "Pod".into(),
            meta: ObjectMeta {
                namespace: "ns".into(),
                name: "task-0".into(),
                deletion_timestamp: Some(Utc::now()),
                ..Default::default()
            },
            ..Default::default()
        });
        let mgr = manager(plugin, cluster, TaskPluginConfig::default());

        let transition = mgr.handle(&started_ctx("ns", "task-0")).await.unwrap();
        assert_eq!(transition.code.as_deref(), Some("TaskFailed"));
    }

    fn finalizing_config() -> TaskPluginConfig {
        TaskPluginConfig {
            inject_finalizer: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn finalize_without_injection_is_noop() {
        let plugin = Arc::new(StubPlugin::new("Pod", &[]));
        let cluster = FakeCluster::shared();
        let mgr = manager(plugin, cluster.clone(), TaskPluginConfig::default());
        mgr.finalize(&TestContext::new("ns", "task-0")).await.unwrap();
        assert_eq!(cluster.update_calls(), 0);
    }

    #[tokio::test]
    async fn finalize_clears_finalizers() {
        let plugin = Arc::new(StubPlugin::new("Pod", &[]));
        let cluster = FakeCluster::shared();
        cluster.put(ResourceObject {
            kind: "Pod".into(),
            meta: ObjectMeta {
                namespace: "ns".into(),
                name: "task-0".into(),
                finalizers: vec![FINALIZER.to_string()],
                ..Default::default()
            },
            ..Default::default()
        });
        let mgr = manager(plugin, cluster.clone(), finalizing_config());

        mgr.finalize(&TestContext::new("ns", "task-0")).await.unwrap();
        assert_eq!(cluster.update_calls(), 1);
        let stored = cluster
            .object("Pod", &crate::cluster::NamespacedName::new("ns", "task-0"))
            .unwrap();
        assert!(stored.meta.finalizers.is_empty());
    }

    #[tokio::test]
    async fn finalize_with_empty_finalizers_skips_update() {
        let plugin = Arc::new(StubPlugin::new("Pod", &[]));
        let cluster = FakeCluster::shared();
        cluster.put(ResourceObject {
            kind: "Pod".into(),
            meta: ObjectMeta {
                namespace: "ns".into(),
                name: "task-0".into(),
                ..Default::default()
            },
            ..Default::default()
        });
        let mgr = manager(plugin, cluster.clone(), finalizing_config());

        mgr.finalize(&TestContext::new("ns", "task-0")).await.unwrap();
        assert_eq!(cluster.update_calls(), 0);
    }

    #[tokio::test]
    async fn finalize_missing_resource_is_noop() {
        let plugin = Arc::new(StubPlugin::new("Pod", &[]));
        let cluster = FakeCluster::shared();
        let mgr = manager(plugin, cluster.clone(), finalizing_config());
        mgr.finalize(&TestContext::new("ns", "task-0")).await.unwrap();
        assert_eq!(cluster.update_calls(), 0);
    }

    #[tokio::test]
    async fn metadata_stamping_precedence_and_finalizer_idempotence() {
        let plugin = Arc::new(StubPlugin::new("Pod", &[]));
        let config = TaskPluginConfig {
            inject_finalizer: true,
            default_labels: BTreeMap::from([
                ("team".to_string(), "default-team".to_string()),
                ("tier".to_string(), "batch".to_string()),
            ]),
            default_annotations: BTreeMap::from([(
                "audit".to_string(),
                "enabled".to_string(),
            )]),
            ..Default::default()
        };
        let mgr = manager(plugin.clone(), FakeCluster::shared(), config);

        let mut ctx = TestContext::new("ns", "task-0");
        ctx.metadata_mut()
            .labels
            .insert("team".to_string(), "task-team".to_string());

        let mut object = plugin.build_resource(&ctx).await.unwrap();
        mgr.apply_object_metadata(ctx.metadata(), &mut object);
        mgr.apply_object_metadata(ctx.metadata(), &mut object);

        assert_eq!(object.meta.namespace, "ns");
        assert_eq!(object.meta.name, "task-0");
        // Task-supplied value wins; default fills the gap.
        assert_eq!(object.meta.labels["team"], "task-team");
        assert_eq!(object.meta.labels["tier"], "batch");
        assert_eq!(object.meta.annotations["audit"], "enabled");
        assert_eq!(object.meta.owner_references.len(), 1);
        assert_eq!(object.meta.owner_references[0].kind, "Workflow");
        // Stamped twice, finalizer appended once.
        assert_eq!(
            object
                .meta
                .finalizers
                .iter()
                .filter(|f| *f == FINALIZER)
                .count(),
            1
        );
    }
}
