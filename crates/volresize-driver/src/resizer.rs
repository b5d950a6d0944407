use crate::client::DriverClient;
use crate::error::{DriverCode, DriverError, ResizeError, Result};
use crate::types::{DriverCapabilities, ExpandRequest, ExpansionOutcome, VolumeCapability};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use volresize_core::objects::volume_csi_source;
use volresize_core::PersistentVolume;

/// Prefix of the leader-election lock name
pub const LOCK_NAME_PREFIX: &str = "external-resizer-";

/// Turns a volume and a target size into one driver call
///
/// The driver's name and capabilities are probed once in
/// [`Resizer::from_client`] and never change afterwards, so the resizer can
/// be shared read-only by every worker.
pub struct Resizer {
    client: Arc<dyn DriverClient>,
    name: String,
    capabilities: DriverCapabilities,
    timeout: Duration,
}

impl Resizer {
    /// Probe the driver and build a resizer for it
    ///
    /// Fails when the driver cannot be probed, reports an empty name, or
    /// supports neither controller nor node expansion.
    pub async fn from_client(client: Arc<dyn DriverClient>, timeout: Duration) -> Result<Self> {
        let name = with_deadline(timeout, "identity probe", client.driver_name()).await?;
        if name.trim().is_empty() {
            return Err(DriverError::invalid_identity("driver name is empty"));
        }

        let list = with_deadline(timeout, "capability probe", client.capabilities()).await?;
        let capabilities = DriverCapabilities::from_list(&list);
        if capabilities.supports_nothing() {
            return Err(DriverError::expansion_not_supported(&name));
        }

        info!(
            driver = %name,
            controller_expansion = capabilities.supports_controller_expansion(),
            online_expansion = capabilities.supports_online_expansion(),
            node_expansion = capabilities.node_expand,
            "Probed storage driver"
        );

        Ok(Self {
            client,
            name,
            capabilities,
            timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> &DriverCapabilities {
        &self.capabilities
    }

    pub fn supports_controller_expansion(&self) -> bool {
        self.capabilities.supports_controller_expansion()
    }

    pub fn can_support_online_expansion(&self) -> bool {
        self.capabilities.supports_online_expansion()
    }

    /// Whether the volume needs a node-side phase after the controller one
    pub fn requires_node_expansion(&self, volume: &PersistentVolume) -> bool {
        self.can_support(volume)
            && (self.capabilities.node_expand || !self.supports_controller_expansion())
    }

    /// Whether the volume is CSI-backed by this driver
    pub fn can_support(&self, volume: &PersistentVolume) -> bool {
        volume_csi_source(volume).is_some_and(|csi| csi.driver == self.name)
    }

    /// Name of the leader-election lock for this driver
    pub fn lock_name(&self) -> String {
        format!("{}{}", LOCK_NAME_PREFIX, sanitize_name(&self.name))
    }

    /// Issue exactly one expand call for `volume`, bounded by the timeout
    pub async fn resize(
        &self,
        volume: &PersistentVolume,
        target_bytes: i64,
        secrets: BTreeMap<String, String>,
    ) -> std::result::Result<ExpansionOutcome, ResizeError> {
        let volume_name = volume.metadata.name.clone().unwrap_or_default();
        let csi = volume_csi_source(volume).ok_or_else(|| ResizeError::InvalidVolume {
            volume: volume_name.clone(),
            message: "volume has no CSI source".to_string(),
        })?;
        if csi.volume_handle.is_empty() {
            return Err(ResizeError::InvalidVolume {
                volume: volume_name,
                message: "volume handle is empty".to_string(),
            });
        }

        let request = ExpandRequest {
            volume_handle: csi.volume_handle.clone(),
            required_bytes: target_bytes,
            secrets,
            capability: VolumeCapability::from_volume(volume),
        };
        let handle = request.volume_handle.clone();
        debug!(volume = %volume_name, handle = %handle, target_bytes, "Calling driver expand");

        let response = with_deadline(self.timeout, "expand", self.client.expand_volume(request))
            .await
            .map_err(|e| ResizeError::from_driver(&handle, e))?;

        // Zero means the driver did not report a size
        let new_size = if response.capacity_bytes > 0 {
            response.capacity_bytes
        } else {
            target_bytes
        };
        if new_size < target_bytes {
            return Err(ResizeError::ShortGrant {
                requested: target_bytes,
                granted: new_size,
            });
        }

        Ok(ExpansionOutcome {
            new_size,
            node_expansion_required: response.node_expansion_required
                && self.capabilities.node_expand,
        })
    }
}

async fn with_deadline<T>(
    timeout: Duration,
    what: &str,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::new(
            DriverCode::DeadlineExceeded,
            format!("{} timed out after {:?}", what, timeout),
        )),
    }
}

/// Replace everything but ASCII alphanumerics and '-' with '-', and never
/// end on '-'
pub fn sanitize_name(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if sanitized.ends_with('-') {
        sanitized.push('X');
    }
    sanitized
}
