use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Trait for the lock object behind leader election
///
/// A lease is held by one identity at a time and stays valid for
/// `lease_duration` after its last renewal.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Take the lease if it is free, expired, or already ours, and renew it.
    ///
    /// Returns `Ok(false)` when another identity holds a live lease or a
    /// concurrent writer won the race.
    async fn try_acquire_or_renew(
        &self,
        name: &str,
        identity: &str,
        lease_duration: Duration,
    ) -> Result<bool>;

    /// Give the lease up if `identity` holds it
    async fn release(&self, name: &str, identity: &str) -> Result<()>;

    /// Current holder of the lease, if any
    async fn holder(&self, name: &str) -> Result<Option<String>>;
}

#[derive(Debug, Clone)]
struct LeaseState {
    holder: Option<String>,
    renewed_at: Instant,
    duration: Duration,
    transitions: u32,
}

/// In-memory lease lock for tests and single-process deployments
#[derive(Default)]
pub struct MemoryLeaseLock {
    leases: Mutex<HashMap<String, LeaseState>>,
}

impl MemoryLeaseLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times the lease changed hands
    pub async fn transitions(&self, name: &str) -> u32 {
        self.leases
            .lock()
            .await
            .get(name)
            .map(|l| l.transitions)
            .unwrap_or(0)
    }
}

#[async_trait]
impl LeaseLock for MemoryLeaseLock {
    async fn try_acquire_or_renew(
        &self,
        name: &str,
        identity: &str,
        lease_duration: Duration,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut leases = self.leases.lock().await;
        let lease = leases.entry(name.to_string()).or_insert(LeaseState {
            holder: None,
            renewed_at: now,
            duration: lease_duration,
            transitions: 0,
        });

        let held_by_other = match lease.holder.as_deref() {
            Some(holder) if holder != identity => {
                now.duration_since(lease.renewed_at) < lease.duration
            }
            _ => false,
        };
        if held_by_other {
            return Ok(false);
        }

        if lease.holder.as_deref() != Some(identity) {
            debug!("Lease {} acquired by {}", name, identity);
            lease.transitions += 1;
        }
        lease.holder = Some(identity.to_string());
        lease.renewed_at = now;
        lease.duration = lease_duration;
        Ok(true)
    }

    async fn release(&self, name: &str, identity: &str) -> Result<()> {
        let mut leases = self.leases.lock().await;
        if let Some(lease) = leases.get_mut(name) {
            if lease.holder.as_deref() == Some(identity) {
                debug!("Lease {} released by {}", name, identity);
                lease.holder = None;
            }
        }
        Ok(())
    }

    async fn holder(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .leases
            .lock()
            .await
            .get(name)
            .and_then(|l| l.holder.clone()))
    }
}
