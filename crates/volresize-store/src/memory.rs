use crate::error::{Result, StoreError};
use crate::outcome::UpdateOutcome;
use crate::traits::ObjectStore;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;
use volresize_core::{
    ClaimKey, ObjectEvent, PersistentVolume, PersistentVolumeClaim, WatchEventType,
};

/// Capacity of the notification channel
const EVENT_CAPACITY: usize = 4096;

#[derive(Default)]
struct StoreState {
    claims: HashMap<ClaimKey, PersistentVolumeClaim>,
    volumes: HashMap<String, PersistentVolume>,
    secrets: HashMap<(String, String), BTreeMap<String, String>>,
    next_version: u64,
    injected_claim_conflicts: u32,
    injected_volume_conflicts: u32,
}

impl StoreState {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

/// In-memory object store for tests and local development
///
/// Assigns monotonically increasing resource versions, enforces them on
/// every write made through [`ObjectStore`], and broadcasts a notification
/// for each mutation. The `insert_*`/`delete_*` helpers act as the external
/// writers (users, provisioners) that the controller shares objects with.
pub struct MemoryStore {
    state: RwLock<StoreState>,
    event_tx: broadcast::Sender<ObjectEvent>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(StoreState::default()),
            event_tx,
            writes: AtomicU64::new(0),
        }
    }

    fn publish(&self, event: ObjectEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    /// Create or replace a claim as an external writer, ignoring its resourceVersion
    pub async fn insert_claim(&self, mut claim: PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let key = ClaimKey::from_claim(&claim)?;
        claim.metadata.namespace = Some(key.namespace.clone());

        let mut state = self.state.write().await;
        claim.metadata.resource_version = Some(state.bump());
        let event_type = if state.claims.contains_key(&key) {
            WatchEventType::Modified
        } else {
            WatchEventType::Added
        };
        state.claims.insert(key.clone(), claim.clone());
        drop(state);

        debug!("Memory store: {:?} claim {}", event_type, key);
        self.publish(ObjectEvent::claim(event_type, claim.clone()));
        Ok(claim)
    }

    /// Create or replace a volume as an external writer, ignoring its resourceVersion
    pub async fn insert_volume(&self, mut volume: PersistentVolume) -> Result<PersistentVolume> {
        let name = volume
            .metadata
            .name
            .clone()
            .ok_or_else(|| StoreError::invalid_object("volume has no name"))?;

        let mut state = self.state.write().await;
        volume.metadata.resource_version = Some(state.bump());
        let event_type = if state.volumes.contains_key(&name) {
            WatchEventType::Modified
        } else {
            WatchEventType::Added
        };
        state.volumes.insert(name.clone(), volume.clone());
        drop(state);

        debug!("Memory store: {:?} volume {}", event_type, name);
        self.publish(ObjectEvent::volume(event_type, volume.clone()));
        Ok(volume)
    }

    /// Store a secret's decoded data
    pub async fn insert_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) {
        self.state
            .write()
            .await
            .secrets
            .insert((namespace.to_string(), name.to_string()), data);
    }

    /// Delete a claim as an external writer
    pub async fn delete_claim(&self, key: &ClaimKey) -> Option<PersistentVolumeClaim> {
        let removed = self.state.write().await.claims.remove(key);
        if let Some(claim) = &removed {
            debug!("Memory store: deleted claim {}", key);
            self.publish(ObjectEvent::claim(WatchEventType::Deleted, claim.clone()));
        }
        removed
    }

    /// Delete a volume as an external writer
    pub async fn delete_volume(&self, name: &str) -> Option<PersistentVolume> {
        let removed = self.state.write().await.volumes.remove(name);
        if let Some(volume) = &removed {
            debug!("Memory store: deleted volume {}", name);
            self.publish(ObjectEvent::volume(WatchEventType::Deleted, volume.clone()));
        }
        removed
    }

    /// Make the next `count` claim status writes fail with a conflict
    pub async fn inject_claim_conflicts(&self, count: u32) {
        self.state.write().await.injected_claim_conflicts = count;
    }

    /// Make the next `count` volume writes fail with a conflict
    pub async fn inject_volume_conflicts(&self, count: u32) {
        self.state.write().await.injected_volume_conflicts = count;
    }

    /// Number of writes accepted through [`ObjectStore`]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_claim(&self, key: &ClaimKey) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.state.read().await.claims.get(key).cloned())
    }

    async fn list_claims(&self) -> Result<Vec<PersistentVolumeClaim>> {
        let state = self.state.read().await;
        let mut claims: Vec<_> = state.claims.values().cloned().collect();
        claims.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(claims)
    }

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self.state.read().await.volumes.get(name).cloned())
    }

    async fn update_claim_status(
        &self,
        claim: PersistentVolumeClaim,
    ) -> UpdateOutcome<PersistentVolumeClaim> {
        let key = match ClaimKey::from_claim(&claim) {
            Ok(k) => k,
            Err(e) => return UpdateOutcome::Failed(e.into()),
        };

        let mut state = self.state.write().await;
        if state.injected_claim_conflicts > 0 {
            state.injected_claim_conflicts -= 1;
            let current_version = state
                .claims
                .get(&key)
                .and_then(|c| c.metadata.resource_version.clone());
            return UpdateOutcome::Conflict { current_version };
        }

        let Some(stored) = state.claims.get(&key) else {
            return UpdateOutcome::NotFound;
        };
        if stored.metadata.resource_version != claim.metadata.resource_version {
            return UpdateOutcome::Conflict {
                current_version: stored.metadata.resource_version.clone(),
            };
        }

        // Status subresource: only the status is taken from the caller
        let mut updated = stored.clone();
        updated.status = claim.status;
        updated.metadata.resource_version = Some(state.bump());
        state.claims.insert(key.clone(), updated.clone());
        drop(state);

        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!("Memory store: updated status of claim {}", key);
        self.publish(ObjectEvent::claim(WatchEventType::Modified, updated.clone()));
        UpdateOutcome::Updated(updated)
    }

    async fn update_volume(&self, mut volume: PersistentVolume) -> UpdateOutcome<PersistentVolume> {
        let Some(name) = volume.metadata.name.clone() else {
            return UpdateOutcome::Failed(StoreError::invalid_object("volume has no name"));
        };

        let mut state = self.state.write().await;
        if state.injected_volume_conflicts > 0 {
            state.injected_volume_conflicts -= 1;
            let current_version = state
                .volumes
                .get(&name)
                .and_then(|v| v.metadata.resource_version.clone());
            return UpdateOutcome::Conflict { current_version };
        }

        let Some(stored) = state.volumes.get(&name) else {
            return UpdateOutcome::NotFound;
        };
        if stored.metadata.resource_version != volume.metadata.resource_version {
            return UpdateOutcome::Conflict {
                current_version: stored.metadata.resource_version.clone(),
            };
        }

        volume.metadata.resource_version = Some(state.bump());
        state.volumes.insert(name.clone(), volume.clone());
        drop(state);

        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!("Memory store: updated volume {}", name);
        self.publish(ObjectEvent::volume(WatchEventType::Modified, volume.clone()));
        UpdateOutcome::Updated(volume)
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self
            .state
            .read()
            .await
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    fn subscribe(&self) -> broadcast::Receiver<ObjectEvent> {
        self.event_tx.subscribe()
    }
}
