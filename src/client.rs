//! Control-plane CRUD seam.

use async_trait::async_trait;

use crate::cluster::{NamespacedName, ResourceObject};
use crate::error::ClusterError;

/// Minimal CRUD client over the cluster control plane.
///
/// Implementations are expected to serve `get` from a local informer cache
/// when possible and fall back to the authoritative API otherwise; callers
/// treat a `get` result as possibly slightly stale and rely on retries, not
/// read-your-writes.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn create(&self, object: &ResourceObject) -> Result<(), ClusterError>;

    async fn get(
        &self,
        kind: &str,
        name: &NamespacedName,
    ) -> Result<ResourceObject, ClusterError>;

    async fn update(&self, object: &ResourceObject) -> Result<(), ClusterError>;
}
