//! Leader gate around the controller's run loop.
//!
//! Only the instance holding the lease runs the controller. Losing the lease
//! cancels the run's token; the run loop stops taking work and returns.

use crate::error::{ControllerError, Result};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use volresize_store::LeaseLock;

/// Work run while leading; must return once its token is cancelled
pub type RunFn = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send>;

/// Trait for the primitive that decides which instance is active
#[async_trait]
pub trait LeaderGate: Send + Sync {
    /// Run `task` while holding leadership.
    ///
    /// Returns when `shutdown` is cancelled and the task has finished, or
    /// with an error when leadership was lost.
    async fn run(&self, shutdown: CancellationToken, task: RunFn) -> Result<()>;

    /// Liveness as seen by the health endpoint
    fn healthy(&self) -> bool;
}

/// Gate for single-instance deployments: runs immediately, always healthy
#[derive(Debug, Default)]
pub struct Standalone;

#[async_trait]
impl LeaderGate for Standalone {
    async fn run(&self, shutdown: CancellationToken, task: RunFn) -> Result<()> {
        task(shutdown.child_token()).await;
        Ok(())
    }

    fn healthy(&self) -> bool {
        true
    }
}

/// Configuration for [`LeaseElector`]
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Name of the lease object
    pub lock_name: String,
    /// Identity written into the lease while leading
    pub identity: String,
    /// How long a lease stays valid after a renewal
    pub lease_duration: Duration,
    /// Give up leadership when no renewal succeeded for this long
    pub renew_deadline: Duration,
    /// Interval between acquire and renew attempts
    pub retry_period: Duration,
    /// Slack on top of `lease_duration` before the health check fails
    pub health_timeout: Duration,
}

impl LeaseConfig {
    pub fn new(lock_name: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            lock_name: lock_name.into(),
            identity: identity.into(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(5),
            health_timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Default)]
struct ElectionState {
    leading: bool,
    last_renewal: Option<Instant>,
}

/// Leader election over a [`LeaseLock`]
pub struct LeaseElector {
    lock: Arc<dyn LeaseLock>,
    config: LeaseConfig,
    state: Mutex<ElectionState>,
}

impl LeaseElector {
    pub fn new(lock: Arc<dyn LeaseLock>, config: LeaseConfig) -> Self {
        Self {
            lock,
            config,
            state: Mutex::new(ElectionState::default()),
        }
    }

    pub fn is_leading(&self) -> bool {
        self.state.lock().leading
    }

    /// One acquire/renew attempt, bounded by the retry period
    async fn try_acquire(&self) -> bool {
        let attempt = self.lock.try_acquire_or_renew(
            &self.config.lock_name,
            &self.config.identity,
            self.config.lease_duration,
        );
        match tokio::time::timeout(self.config.retry_period, attempt).await {
            Ok(Ok(acquired)) => acquired,
            Ok(Err(e)) => {
                warn!("Lease {} update failed: {}", self.config.lock_name, e);
                false
            }
            Err(_) => {
                warn!("Lease {} update timed out", self.config.lock_name);
                false
            }
        }
    }

    /// Wait until the lease is ours; `false` if shutdown came first
    async fn acquire(&self, shutdown: &CancellationToken) -> bool {
        let mut interval = tokio::time::interval(self.config.retry_period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = interval.tick() => {
                    if self.try_acquire().await {
                        return true;
                    }
                    debug!("Lease {} is held elsewhere", self.config.lock_name);
                }
            }
        }
    }

    fn set_leading(&self, leading: bool) {
        let mut state = self.state.lock();
        state.leading = leading;
        state.last_renewal = leading.then(Instant::now);
    }
}

#[async_trait]
impl LeaderGate for LeaseElector {
    async fn run(&self, shutdown: CancellationToken, task: RunFn) -> Result<()> {
        info!(
            "Waiting for leadership on lease {} as {}",
            self.config.lock_name, self.config.identity
        );
        if !self.acquire(&shutdown).await {
            return Ok(());
        }
        self.set_leading(true);
        info!("Became leader on lease {}", self.config.lock_name);

        let token = shutdown.child_token();
        let mut handle = tokio::spawn(task(token.clone()));
        let mut interval = tokio::time::interval(self.config.retry_period);
        interval.tick().await;
        let mut lost = false;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = &mut handle => {
                    self.set_leading(false);
                    self.release().await;
                    return Ok(());
                }
                _ = interval.tick() => {
                    if self.try_acquire().await {
                        self.state.lock().last_renewal = Some(Instant::now());
                        continue;
                    }
                    let since = self
                        .state
                        .lock()
                        .last_renewal
                        .map(|t| t.elapsed())
                        .unwrap_or_default();
                    if since >= self.config.renew_deadline {
                        error!(
                            "Failed to renew lease {} for {:?}, giving up leadership",
                            self.config.lock_name, since
                        );
                        lost = true;
                        break;
                    }
                }
            }
        }

        token.cancel();
        if let Err(e) = handle.await {
            warn!("Leader task ended abnormally: {}", e);
        }
        self.set_leading(false);

        if lost {
            return Err(ControllerError::leader_election(format!(
                "leadership on lease {} lost",
                self.config.lock_name
            )));
        }
        self.release().await;
        Ok(())
    }

    fn healthy(&self) -> bool {
        let state = self.state.lock();
        is_healthy(
            state.leading,
            state.last_renewal,
            Instant::now(),
            self.config.lease_duration + self.config.health_timeout,
        )
    }
}

impl LeaseElector {
    async fn release(&self) {
        if let Err(e) = self
            .lock
            .release(&self.config.lock_name, &self.config.identity)
            .await
        {
            warn!("Failed to release lease {}: {}", self.config.lock_name, e);
        }
    }
}

/// Unhealthy only while leading with a renewal older than `max_age`
fn is_healthy(leading: bool, last_renewal: Option<Instant>, now: Instant, max_age: Duration) -> bool {
    if !leading {
        return true;
    }
    last_renewal.is_some_and(|t| now.saturating_duration_since(t) <= max_age)
}
