use crate::error::Result;
use crate::outcome::UpdateOutcome;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use volresize_core::{ClaimKey, ObjectEvent, PersistentVolume, PersistentVolumeClaim};

/// Trait for the cluster object store the controller reads from and writes to
///
/// Reads return owned snapshots. Writes are conditional on the
/// `metadata.resourceVersion` carried by the object passed in and report
/// their result as an [`UpdateOutcome`]. `MemoryStore` backs tests and local
/// development; `HttpStore` talks to a Kubernetes-compatible API server.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch a claim; `Ok(None)` when it does not exist
    async fn get_claim(&self, key: &ClaimKey) -> Result<Option<PersistentVolumeClaim>>;

    /// List every claim
    async fn list_claims(&self) -> Result<Vec<PersistentVolumeClaim>>;

    /// Fetch a volume by name; `Ok(None)` when it does not exist
    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>>;

    /// Write the status of a claim
    async fn update_claim_status(
        &self,
        claim: PersistentVolumeClaim,
    ) -> UpdateOutcome<PersistentVolumeClaim>;

    /// Write a volume (spec included, used to record the new capacity)
    async fn update_volume(&self, volume: PersistentVolume) -> UpdateOutcome<PersistentVolume>;

    /// Fetch the decoded data of a secret; `Ok(None)` when it does not exist
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>>;

    /// Subscribe to change notifications
    ///
    /// Stores without push notifications return a receiver that never yields;
    /// the controller's periodic resync covers them.
    fn subscribe(&self) -> broadcast::Receiver<ObjectEvent>;
}
