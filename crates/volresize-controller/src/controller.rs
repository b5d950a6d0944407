use crate::error::{ControllerError, Result};
use crate::metrics::ResizerMetrics;
use crate::queue::{RateLimiterConfig, WorkQueue};
use crate::reconciler::{FailureKind, InUsePolicy, Reconciler};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use volresize_core::conditions::{has_condition, RESIZING};
use volresize_core::objects::{claim_requested_bytes, claim_status_bytes, claim_volume_name};
use volresize_core::{ClaimKey, ObjectEvent, PersistentVolumeClaim, WatchEventType};
use volresize_driver::Resizer;
use volresize_store::ObjectStore;

/// Configuration for the resize controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of reconciliation workers
    pub workers: usize,
    /// Interval between full re-lists of every claim
    pub resync_period: Duration,
    /// Retry backoff bounds
    pub rate_limiter: RateLimiterConfig,
    /// Treatment of "volume in use" driver failures
    pub in_use_policy: InUsePolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            resync_period: Duration::from_secs(600),
            rate_limiter: RateLimiterConfig::default(),
            in_use_policy: InUsePolicy::Handle,
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(ControllerError::invalid_config("workers must be at least 1"));
        }
        if self.resync_period.is_zero() {
            return Err(ControllerError::invalid_config("resync period must be positive"));
        }
        if self.rate_limiter.base_delay.is_zero() {
            return Err(ControllerError::invalid_config(
                "retry interval start must be positive",
            ));
        }
        Ok(())
    }
}

/// Watches claims and volumes and drives pending expansions
pub struct ResizeController {
    store: Arc<dyn ObjectStore>,
    reconciler: Arc<Reconciler>,
    queue: WorkQueue<ClaimKey>,
    metrics: ResizerMetrics,
    config: ControllerConfig,
}

impl ResizeController {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        resizer: Arc<Resizer>,
        metrics: ResizerMetrics,
        config: ControllerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            resizer,
            metrics.clone(),
            config.in_use_policy,
        ));
        Ok(Self {
            store,
            reconciler,
            queue: WorkQueue::with_backoff(config.rate_limiter.clone()),
            metrics,
            config,
        })
    }

    pub fn queue(&self) -> &WorkQueue<ClaimKey> {
        &self.queue
    }

    /// Run until `token` is cancelled.
    ///
    /// Cancelling stops the queue; passes already in flight finish before
    /// this returns.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!(
            "Starting resize controller for driver {} ({} workers, resync every {:?})",
            self.reconciler.resizer().name(),
            self.config.workers,
            self.config.resync_period
        );

        // Subscribe before the initial list so nothing in between is missed
        let events = self.store.subscribe();
        if let Err(e) = resync(self.store.as_ref(), &self.queue).await {
            error!("Initial claim list failed: {}", e);
        }

        let mut tasks = JoinSet::new();
        for id in 0..self.config.workers {
            tasks.spawn(worker(
                id,
                self.queue.clone(),
                self.reconciler.clone(),
                self.metrics.clone(),
            ));
        }
        tasks.spawn(watch_events(
            events,
            self.store.clone(),
            self.queue.clone(),
            token.clone(),
        ));
        tasks.spawn(resync_loop(
            self.config.resync_period,
            self.store.clone(),
            self.queue.clone(),
            token.clone(),
        ));

        token.cancelled().await;
        info!("Resize controller shutting down");
        self.queue.shut_down();

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("Controller task failed: {}", e);
            }
        }
        info!("Resize controller stopped");
        Ok(())
    }
}

async fn worker(
    id: usize,
    queue: WorkQueue<ClaimKey>,
    reconciler: Arc<Reconciler>,
    metrics: ResizerMetrics,
) {
    debug!("Worker {} started", id);
    while let Some(key) = queue.get().await {
        metrics.set_queue_depth(queue.len());
        metrics.record_attempt();

        match reconciler.reconcile(&key).await {
            Ok(outcome) => {
                debug!(claim = %key, ?outcome, "Reconciled");
                metrics.record_success();
                queue.forget(&key);
            }
            Err(e) => {
                let kind = e.kind();
                metrics.record_failure(kind.label());
                let retries = queue.num_requeues(&key);
                match kind {
                    FailureKind::InUse => {
                        info!(claim = %key, retries, "Volume in use, will retry: {}", e)
                    }
                    FailureKind::Conflict => {
                        debug!(claim = %key, retries, "Conflict, will retry: {}", e)
                    }
                    _ => warn!(
                        claim = %key,
                        retries,
                        kind = kind.label(),
                        "Reconcile failed: {}",
                        e
                    ),
                }
                queue.add_rate_limited(key.clone());
            }
        }
        queue.done(&key);
    }
    debug!("Worker {} stopped", id);
}

/// Turn store notifications into queue operations
async fn watch_events(
    events: broadcast::Receiver<ObjectEvent>,
    store: Arc<dyn ObjectStore>,
    queue: WorkQueue<ClaimKey>,
    token: CancellationToken,
) {
    let mut stream = BroadcastStream::new(events);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(event)) => handle_event(&queue, event),
                Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                    warn!("Missed {} store notifications, relisting claims", missed);
                    if let Err(e) = resync(store.as_ref(), &queue).await {
                        error!("Relist after lag failed: {}", e);
                    }
                }
                None => {
                    debug!("Store notification stream closed");
                    break;
                }
            }
        }
    }
}

/// Queue operations for one store notification
pub(crate) fn handle_event(queue: &WorkQueue<ClaimKey>, event: ObjectEvent) {
    let Some(key) = event.claim_key() else {
        return;
    };
    match event {
        ObjectEvent::Claim {
            event_type: WatchEventType::Deleted,
            ..
        } => queue.forget(&key),
        ObjectEvent::Claim { object, .. } => {
            if claim_wants_attention(&object) {
                queue.add(key);
            }
        }
        ObjectEvent::Volume { .. } => queue.add(key),
    }
}

/// Bound claims asking for more than they report, or still marked Resizing
fn claim_wants_attention(claim: &PersistentVolumeClaim) -> bool {
    if claim_volume_name(claim).is_none() {
        return false;
    }
    if has_condition(claim, RESIZING) {
        return true;
    }
    match (claim_requested_bytes(claim), claim_status_bytes(claim)) {
        (Ok(requested), Ok(Some(reported))) => requested > reported,
        (Ok(_), Ok(None)) => true,
        _ => false,
    }
}

async fn resync_loop(
    period: Duration,
    store: Arc<dyn ObjectStore>,
    queue: WorkQueue<ClaimKey>,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    // The initial list already ran
    interval.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = resync(store.as_ref(), &queue).await {
                    error!("Periodic claim resync failed: {}", e);
                }
            }
        }
    }
}

/// Queue every claim in the store
async fn resync(store: &dyn ObjectStore, queue: &WorkQueue<ClaimKey>) -> Result<()> {
    let claims = store.list_claims().await?;
    debug!("Resync: queueing {} claims", claims.len());
    for claim in &claims {
        match ClaimKey::from_claim(claim) {
            Ok(key) => queue.add(key),
            Err(e) => warn!("Skipping claim without identity: {}", e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::*;
    use volresize_core::conditions::FILE_SYSTEM_RESIZE_PENDING;
    use volresize_core::objects::volume_capacity_bytes;
    use volresize_driver::{DriverCode, MockDriver};
    use volresize_store::MemoryStore;

    fn fast_config(workers: usize) -> ControllerConfig {
        ControllerConfig {
            workers,
            resync_period: Duration::from_secs(3600),
            rate_limiter: RateLimiterConfig {
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(50),
            },
            in_use_policy: InUsePolicy::Handle,
        }
    }

    async fn wait_until(check: impl Fn() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    async fn wait_for_size(store: &MemoryStore, name: &str, size: i64) {
        for _ in 0..500 {
            if volume_size(store, name).await == size {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pv-{} never reached {} bytes", name, size);
    }

    async fn wait_for_condition(store: &MemoryStore, key: &ClaimKey, type_: &str) {
        for _ in 0..500 {
            let claim = store.get_claim(key).await.unwrap().unwrap();
            if has_condition(&claim, type_) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never got condition {}", key, type_);
    }

    async fn volume_size(store: &MemoryStore, name: &str) -> i64 {
        let volume = store.get_volume(&format!("pv-{}", name)).await.unwrap().unwrap();
        volume_capacity_bytes(&volume).unwrap()
    }

    struct Running {
        controller: Arc<ResizeController>,
        token: CancellationToken,
        handle: tokio::task::JoinHandle<Result<()>>,
    }

    async fn start(store: Arc<MemoryStore>, driver: Arc<MockDriver>, config: ControllerConfig) -> Running {
        let controller = Arc::new(
            ResizeController::new(
                store,
                resizer(driver).await,
                ResizerMetrics::unregistered().unwrap(),
                config,
            )
            .unwrap(),
        );
        let token = CancellationToken::new();
        let handle = {
            let (c, t) = (controller.clone(), token.clone());
            tokio::spawn(async move { c.run(t).await })
        };
        Running {
            controller,
            token,
            handle,
        }
    }

    impl Running {
        async fn stop(self) {
            self.token.cancel();
            self.handle.await.unwrap().unwrap();
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(ControllerConfig::default().validate().is_ok());
        let bad = ControllerConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(matches!(
            bad.validate(),
            Err(ControllerError::InvalidConfig { .. })
        ));
    }

    #[tokio::test]
    async fn test_event_filtering() {
        let queue: WorkQueue<ClaimKey> = WorkQueue::with_backoff(RateLimiterConfig::default());
        let key = ClaimKey::new("default", "data");

        // Already satisfied claims are ignored
        handle_event(
            &queue,
            ObjectEvent::claim(WatchEventType::Modified, claim("data", 5 * GI, 5 * GI)),
        );
        assert!(queue.is_empty());

        handle_event(
            &queue,
            ObjectEvent::claim(WatchEventType::Modified, claim("data", 10 * GI, 5 * GI)),
        );
        assert!(queue.is_pending(&key));

        // Volume changes queue the bound claim
        let other = ClaimKey::new("default", "logs");
        handle_event(
            &queue,
            ObjectEvent::volume(WatchEventType::Modified, volume("logs", GI)),
        );
        assert!(queue.is_pending(&other));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_deleted_event_forgets_backoff() {
        let queue: WorkQueue<ClaimKey> = WorkQueue::with_backoff(RateLimiterConfig::default());
        let key = ClaimKey::new("default", "data");
        queue.add_rate_limited(key.clone());
        assert_eq!(queue.num_requeues(&key), 1);

        handle_event(
            &queue,
            ObjectEvent::claim(WatchEventType::Deleted, claim("data", 10 * GI, 5 * GI)),
        );
        assert_eq!(queue.num_requeues(&key), 0);
        queue.shut_down();
    }

    #[tokio::test]
    async fn test_resizes_existing_and_new_claims() {
        let store = Arc::new(MemoryStore::new());
        let driver = Arc::new(MockDriver::new(DRIVER));
        store.insert_volume(volume("old", 5 * GI)).await.unwrap();
        store.insert_claim(claim("old", 10 * GI, 5 * GI)).await.unwrap();

        let running = start(store.clone(), driver.clone(), fast_config(2)).await;

        // Picked up by the initial list
        wait_for_size(&store, "old", 10 * GI).await;

        // Picked up from notifications
        store.insert_volume(volume("new", GI)).await.unwrap();
        store.insert_claim(claim("new", GI, GI)).await.unwrap();
        store.insert_claim(claim("new", 3 * GI, GI)).await.unwrap();
        wait_for_size(&store, "new", 3 * GI).await;

        running.stop().await;
        assert_eq!(driver.call_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_one_expand_per_volume_at_a_time() {
        let store = Arc::new(MemoryStore::new());
        let driver = Arc::new(MockDriver::new(DRIVER).with_delay(Duration::from_millis(20)));
        let names: Vec<String> = (0..8).map(|i| format!("c{}", i)).collect();
        for name in &names {
            store.insert_volume(volume(name, GI)).await.unwrap();
            store.insert_claim(claim(name, 2 * GI, GI)).await.unwrap();
        }

        let running = start(store.clone(), driver.clone(), fast_config(4)).await;

        // Keep poking the same claims while they are being processed
        for _ in 0..5 {
            for name in &names {
                running.controller.queue().add(ClaimKey::new("default", name.as_str()));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        for name in &names {
            wait_for_size(&store, name, 2 * GI).await;
        }
        running.stop().await;

        assert_eq!(driver.max_concurrent_per_volume(), 1);
        assert!(driver.max_concurrent() > 1);
        assert_eq!(driver.call_count(), names.len());
    }

    #[tokio::test]
    async fn test_in_use_is_retried_until_detached() {
        let store = Arc::new(MemoryStore::new());
        let driver = Arc::new(MockDriver::new(DRIVER));
        driver.fail_volume("vol-data", DriverCode::FailedPrecondition, "attached");
        store.insert_volume(volume("data", 5 * GI)).await.unwrap();
        store.insert_claim(claim("data", 10 * GI, 5 * GI)).await.unwrap();

        let running = start(store.clone(), driver.clone(), fast_config(1)).await;
        let key = ClaimKey::new("default", "data");

        wait_until(|| driver.call_count() >= 3).await;
        assert_eq!(volume_size(&store, "data").await, 5 * GI);
        let claim_obj = store.get_claim(&key).await.unwrap().unwrap();
        assert!(has_condition(&claim_obj, RESIZING));
        assert!(running.controller.queue().num_requeues(&key) >= 1);

        driver.clear_failures();
        wait_for_size(&store, "data", 10 * GI).await;
        wait_until(|| running.controller.queue().num_requeues(&key) == 0).await;
        running.stop().await;
    }

    #[tokio::test]
    async fn test_deleted_claim_leaves_no_pending_entry() {
        let store = Arc::new(MemoryStore::new());
        let driver = Arc::new(MockDriver::new(DRIVER));
        driver.fail_volume("vol-data", DriverCode::Unavailable, "down");
        store.insert_volume(volume("data", 5 * GI)).await.unwrap();
        store.insert_claim(claim("data", 10 * GI, 5 * GI)).await.unwrap();

        let running = start(store.clone(), driver.clone(), fast_config(1)).await;
        let key = ClaimKey::new("default", "data");
        wait_until(|| driver.call_count() >= 2).await;

        store.delete_claim(&key).await;
        let queue = running.controller.queue().clone();
        queue.add(key.clone());
        wait_until(|| {
            !queue.is_pending(&key) && !queue.is_processing(&key) && queue.num_requeues(&key) == 0
        })
        .await;

        // Stays quiet afterwards
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!queue.is_pending(&key));
        running.stop().await;
    }

    #[tokio::test]
    async fn test_node_expansion_pending_survives_resync() {
        let store = Arc::new(MemoryStore::new());
        let driver = Arc::new(node_expanding_driver());
        store.insert_volume(volume("data", 5 * GI)).await.unwrap();
        store.insert_claim(claim("data", 10 * GI, 5 * GI)).await.unwrap();

        let mut config = fast_config(1);
        config.resync_period = Duration::from_millis(20);
        let running = start(store.clone(), driver.clone(), config).await;
        let key = ClaimKey::new("default", "data");

        wait_for_condition(&store, &key, FILE_SYSTEM_RESIZE_PENDING).await;

        // Several resyncs later the condition is still there
        tokio::time::sleep(Duration::from_millis(150)).await;
        let claim_obj = store.get_claim(&key).await.unwrap().unwrap();
        assert!(has_condition(&claim_obj, FILE_SYSTEM_RESIZE_PENDING));
        assert_eq!(driver.call_count(), 1);
        running.stop().await;
    }

    #[tokio::test]
    async fn test_stops_promptly_when_idle() {
        let store = Arc::new(MemoryStore::new());
        let driver = Arc::new(MockDriver::new(DRIVER));
        let running = start(store, driver, fast_config(3)).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        let queue = running.controller.queue().clone();
        tokio::time::timeout(Duration::from_secs(2), running.stop())
            .await
            .unwrap();
        assert!(queue.is_shutting_down());
    }
}
