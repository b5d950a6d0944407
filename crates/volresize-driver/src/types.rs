//! Request, response and capability types exchanged with a storage driver.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use volresize_core::objects::{volume_access_modes, volume_csi_source, volume_is_block};
use volresize_core::PersistentVolume;

/// A capability advertised by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverCapability {
    /// The driver runs a controller service
    ControllerService,
    /// The controller service implements volume expansion
    ControllerExpandVolume,
    /// Volumes can be expanded while attached
    OnlineExpansion,
    /// Volumes can be expanded only while detached
    OfflineExpansion,
    /// The node service implements filesystem expansion
    NodeExpandVolume,
}

/// Facts about the attached driver, fixed after the startup probe
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverCapabilities {
    pub controller_service: bool,
    pub controller_expand: bool,
    pub online_expansion: bool,
    pub offline_expansion: bool,
    pub node_expand: bool,
}

impl DriverCapabilities {
    pub fn from_list(capabilities: &[DriverCapability]) -> Self {
        let has = |c: DriverCapability| capabilities.contains(&c);
        Self {
            controller_service: has(DriverCapability::ControllerService),
            controller_expand: has(DriverCapability::ControllerExpandVolume),
            online_expansion: has(DriverCapability::OnlineExpansion),
            offline_expansion: has(DriverCapability::OfflineExpansion),
            node_expand: has(DriverCapability::NodeExpandVolume),
        }
    }

    /// Expansion can be performed through the controller service
    pub fn supports_controller_expansion(&self) -> bool {
        self.controller_service && self.controller_expand
    }

    /// Controller expansion is allowed while the volume is attached
    pub fn supports_online_expansion(&self) -> bool {
        self.supports_controller_expansion() && self.online_expansion
    }

    /// Neither phase of expansion is available
    pub fn supports_nothing(&self) -> bool {
        !self.supports_controller_expansion() && !self.node_expand
    }
}

/// How the volume is presented to workloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    Block,
    Mount {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fs_type: Option<String>,
    },
}

/// Volume capability sent with an expand request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeCapability {
    pub access_type: AccessType,
    #[serde(default)]
    pub access_modes: Vec<String>,
}

impl VolumeCapability {
    /// Derive the capability from a volume's spec
    pub fn from_volume(volume: &PersistentVolume) -> Self {
        let access_type = if volume_is_block(volume) {
            AccessType::Block
        } else {
            AccessType::Mount {
                fs_type: volume_csi_source(volume).and_then(|csi| csi.fs_type.clone()),
            }
        };
        Self {
            access_type,
            access_modes: volume_access_modes(volume),
        }
    }
}

/// One controller expand call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandRequest {
    pub volume_handle: String,
    pub required_bytes: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, String>,
    pub capability: VolumeCapability,
}

/// Answer to a successful expand call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandResponse {
    /// Size now provisioned; zero when the driver does not report it
    #[serde(default)]
    pub capacity_bytes: i64,
    #[serde(default)]
    pub node_expansion_required: bool,
}

/// Result of one successful resize attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpansionOutcome {
    /// Capacity actually provisioned
    pub new_size: i64,
    /// A node agent still has to grow the filesystem
    pub node_expansion_required: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{CSIPersistentVolumeSource, PersistentVolumeSpec};

    #[test]
    fn test_capabilities_from_list() {
        let caps = DriverCapabilities::from_list(&[
            DriverCapability::ControllerService,
            DriverCapability::ControllerExpandVolume,
            DriverCapability::OnlineExpansion,
        ]);
        assert!(caps.supports_controller_expansion());
        assert!(caps.supports_online_expansion());
        assert!(!caps.node_expand);
        assert!(!caps.supports_nothing());

        // Expand without a controller service does not count
        let caps = DriverCapabilities::from_list(&[DriverCapability::ControllerExpandVolume]);
        assert!(!caps.supports_controller_expansion());
        assert!(caps.supports_nothing());

        let node_only = DriverCapabilities::from_list(&[DriverCapability::NodeExpandVolume]);
        assert!(!node_only.supports_nothing());
    }

    #[test]
    fn test_capability_from_volume() {
        let mut volume = PersistentVolume::default();
        volume.spec = Some(PersistentVolumeSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            csi: Some(CSIPersistentVolumeSource {
                driver: "hostpath.csi.k8s.io".to_string(),
                volume_handle: "vol-1".to_string(),
                fs_type: Some("ext4".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });

        let cap = VolumeCapability::from_volume(&volume);
        assert_eq!(
            cap.access_type,
            AccessType::Mount {
                fs_type: Some("ext4".to_string())
            }
        );
        assert_eq!(cap.access_modes, vec!["ReadWriteOnce".to_string()]);

        volume.spec.as_mut().unwrap().volume_mode = Some("Block".to_string());
        assert_eq!(VolumeCapability::from_volume(&volume).access_type, AccessType::Block);
    }

    #[test]
    fn test_response_defaults() {
        let resp: ExpandResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(resp.capacity_bytes, 0);
        assert!(!resp.node_expansion_required);

        let cap: DriverCapability = serde_json::from_str("\"NODE_EXPAND_VOLUME\"").unwrap();
        assert_eq!(cap, DriverCapability::NodeExpandVolume);
    }
}
