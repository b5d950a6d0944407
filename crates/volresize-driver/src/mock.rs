use crate::client::DriverClient;
use crate::error::{DriverCode, DriverError, Result};
use crate::types::{DriverCapability, ExpandRequest, ExpandResponse};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;

#[derive(Default)]
struct MockState {
    scripted: VecDeque<DriverError>,
    failing_volumes: HashMap<String, (DriverCode, String)>,
    node_expansion_required: bool,
    calls: Vec<ExpandRequest>,
    in_flight: HashMap<String, usize>,
    max_in_flight_per_volume: usize,
    in_flight_total: usize,
    max_in_flight_total: usize,
}

/// Mock storage driver for tests and `--mock-driver` runs
///
/// Grants every expand request at exactly the requested size unless a
/// failure was scripted. Records every call and the highest number of
/// concurrent calls observed, per volume and overall.
pub struct MockDriver {
    name: String,
    capabilities: Vec<DriverCapability>,
    delay: Duration,
    probe_error: Option<DriverCode>,
    state: Mutex<MockState>,
}

impl MockDriver {
    /// A driver with controller expansion (online) and no node expansion
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: vec![
                DriverCapability::ControllerService,
                DriverCapability::ControllerExpandVolume,
                DriverCapability::OnlineExpansion,
            ],
            delay: Duration::ZERO,
            probe_error: None,
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<DriverCapability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Make each expand call take this long
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make identity and capability probes fail with `code`
    pub fn with_probe_error(mut self, code: DriverCode) -> Self {
        self.probe_error = Some(code);
        self
    }

    /// Report node expansion as required on successful expands
    pub fn set_node_expansion_required(&self, required: bool) {
        self.state.lock().node_expansion_required = required;
    }

    /// Fail the next expand call, whatever its volume
    pub fn push_error(&self, code: DriverCode, message: impl Into<String>) {
        self.state
            .lock()
            .scripted
            .push_back(DriverError::new(code, message));
    }

    /// Fail every expand call for `handle` until cleared
    pub fn fail_volume(&self, handle: &str, code: DriverCode, message: impl Into<String>) {
        self.state
            .lock()
            .failing_volumes
            .insert(handle.to_string(), (code, message.into()));
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.scripted.clear();
        state.failing_volumes.clear();
    }

    /// Every expand request received, in arrival order
    pub fn calls(&self) -> Vec<ExpandRequest> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Highest number of simultaneous calls seen for any one volume
    pub fn max_concurrent_per_volume(&self) -> usize {
        self.state.lock().max_in_flight_per_volume
    }

    /// Highest number of simultaneous calls seen overall
    pub fn max_concurrent(&self) -> usize {
        self.state.lock().max_in_flight_total
    }

    fn probe(&self) -> Result<()> {
        match self.probe_error {
            Some(code) => Err(DriverError::new(code, "mock probe failure")),
            None => Ok(()),
        }
    }
}

/// Marks a call as in flight until dropped, including when the caller
/// abandons the call on timeout
struct InFlight<'a> {
    driver: &'a MockDriver,
    handle: String,
}

impl<'a> InFlight<'a> {
    fn enter(driver: &'a MockDriver, handle: &str) -> Self {
        let mut state = driver.state.lock();
        let count = state.in_flight.entry(handle.to_string()).or_insert(0);
        *count += 1;
        let count = *count;
        state.max_in_flight_per_volume = state.max_in_flight_per_volume.max(count);
        state.in_flight_total += 1;
        state.max_in_flight_total = state.max_in_flight_total.max(state.in_flight_total);
        Self {
            driver,
            handle: handle.to_string(),
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.driver.state.lock();
        if let Some(count) = state.in_flight.get_mut(&self.handle) {
            *count -= 1;
            if *count == 0 {
                state.in_flight.remove(&self.handle);
            }
        }
        state.in_flight_total -= 1;
    }
}

#[async_trait]
impl DriverClient for MockDriver {
    async fn driver_name(&self) -> Result<String> {
        self.probe()?;
        Ok(self.name.clone())
    }

    async fn capabilities(&self) -> Result<Vec<DriverCapability>> {
        self.probe()?;
        Ok(self.capabilities.clone())
    }

    async fn expand_volume(&self, request: ExpandRequest) -> Result<ExpandResponse> {
        let handle = request.volume_handle.clone();
        let required_bytes = request.required_bytes;
        self.state.lock().calls.push(request);

        let _in_flight = InFlight::enter(self, &handle);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mut state = self.state.lock();
        if let Some(err) = state.scripted.pop_front() {
            debug!("Mock: scripted failure for {}: {}", handle, err);
            return Err(err);
        }
        if let Some((code, message)) = state.failing_volumes.get(&handle) {
            debug!("Mock: failing volume {} with {}", handle, code);
            return Err(DriverError::new(*code, message.clone()));
        }

        debug!("Mock: expanded {} to {} bytes", handle, required_bytes);
        Ok(ExpandResponse {
            capacity_bytes: required_bytes,
            node_expansion_required: state.node_expansion_required,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccessType, VolumeCapability};
    use std::sync::Arc;

    fn request(handle: &str, bytes: i64) -> ExpandRequest {
        ExpandRequest {
            volume_handle: handle.to_string(),
            required_bytes: bytes,
            secrets: Default::default(),
            capability: VolumeCapability {
                access_type: AccessType::Mount { fs_type: None },
                access_modes: vec![],
            },
        }
    }

    #[tokio::test]
    async fn test_grants_requested_size() {
        let driver = MockDriver::new("mock.csi");
        let resp = driver.expand_volume(request("vol-1", 1024)).await.unwrap();
        assert_eq!(resp.capacity_bytes, 1024);
        assert!(!resp.node_expansion_required);

        driver.set_node_expansion_required(true);
        let resp = driver.expand_volume(request("vol-1", 2048)).await.unwrap();
        assert!(resp.node_expansion_required);
        assert_eq!(driver.call_count(), 2);
    }

    #[tokio::test]
    async fn test_scripted_and_persistent_failures() {
        let driver = MockDriver::new("mock.csi");
        driver.push_error(DriverCode::Unavailable, "down");
        driver.fail_volume("vol-2", DriverCode::FailedPrecondition, "attached");

        let err = driver.expand_volume(request("vol-1", 1)).await.unwrap_err();
        assert_eq!(err.status_code(), Some(DriverCode::Unavailable));
        assert!(driver.expand_volume(request("vol-1", 1)).await.is_ok());

        for _ in 0..2 {
            let err = driver.expand_volume(request("vol-2", 1)).await.unwrap_err();
            assert_eq!(err.status_code(), Some(DriverCode::FailedPrecondition));
        }
        driver.clear_failures();
        assert!(driver.expand_volume(request("vol-2", 1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_probe_error() {
        let driver = MockDriver::new("mock.csi").with_probe_error(DriverCode::Unavailable);
        assert!(driver.driver_name().await.is_err());
        assert!(driver.capabilities().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_tracking() {
        let driver = Arc::new(MockDriver::new("mock.csi").with_delay(Duration::from_millis(50)));

        let mut handles = Vec::new();
        for handle in ["vol-1", "vol-1", "vol-2"] {
            let driver = driver.clone();
            handles.push(tokio::spawn(async move {
                driver.expand_volume(request(handle, 1)).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(driver.max_concurrent_per_volume(), 2);
        assert_eq!(driver.max_concurrent(), 3);
    }
}
