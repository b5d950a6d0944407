use crate::error::Result;
use crate::types::{DriverCapability, ExpandRequest, ExpandResponse};
use async_trait::async_trait;

/// Trait for the transport that reaches a storage driver
///
/// Implementations only move requests and answers; retries, timeouts and
/// classification of failures belong to the `Resizer`.
#[async_trait]
pub trait DriverClient: Send + Sync {
    /// Name the driver reports from its identity service
    async fn driver_name(&self) -> Result<String>;

    /// Capabilities advertised by the driver's controller and node services
    async fn capabilities(&self) -> Result<Vec<DriverCapability>>;

    /// Ask the driver to grow a volume to at least `required_bytes`
    async fn expand_volume(&self, request: ExpandRequest) -> Result<ExpandResponse>;
}
