//! Accessors over the claim and volume objects.
//!
//! These keep `Option` plumbing out of the reconciler and give every size a
//! single byte-based representation.

use crate::error::{CoreError, Result};
use crate::quantity::{set_storage_in_map, storage_from_map};
use crate::types::{ClaimKey, DEFAULT_NAMESPACE};
use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, PersistentVolume, PersistentVolumeClaim, SecretReference,
};

/// Size requested in the claim's spec (the authoritative target size)
pub fn claim_requested_bytes(claim: &PersistentVolumeClaim) -> Result<i64> {
    let requests = claim
        .spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref());
    storage_from_map(requests)?.ok_or_else(|| {
        CoreError::missing_field("PersistentVolumeClaim", "spec.resources.requests.storage")
    })
}

/// Size reported in the claim's status, if any
pub fn claim_status_bytes(claim: &PersistentVolumeClaim) -> Result<Option<i64>> {
    storage_from_map(claim.status.as_ref().and_then(|s| s.capacity.as_ref()))
}

/// Record a size in the claim's status capacity
pub fn set_claim_status_bytes(claim: &mut PersistentVolumeClaim, bytes: i64) {
    let status = claim.status.get_or_insert_with(Default::default);
    set_storage_in_map(&mut status.capacity, bytes);
}

/// Name of the volume bound to the claim, if bound
pub fn claim_volume_name(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .spec
        .as_ref()
        .and_then(|s| s.volume_name.as_deref())
        .filter(|n| !n.is_empty())
}

/// Current size of the volume (the authoritative current size)
pub fn volume_capacity_bytes(volume: &PersistentVolume) -> Result<i64> {
    let capacity = volume.spec.as_ref().and_then(|s| s.capacity.as_ref());
    storage_from_map(capacity)?
        .ok_or_else(|| CoreError::missing_field("PersistentVolume", "spec.capacity.storage"))
}

/// Record a new size on the volume
pub fn set_volume_capacity_bytes(volume: &mut PersistentVolume, bytes: i64) {
    let spec = volume.spec.get_or_insert_with(Default::default);
    set_storage_in_map(&mut spec.capacity, bytes);
}

/// CSI source of the volume, if the volume is driver-backed
pub fn volume_csi_source(volume: &PersistentVolume) -> Option<&CSIPersistentVolumeSource> {
    volume.spec.as_ref().and_then(|s| s.csi.as_ref())
}

/// Secret reference used for expansion calls.
///
/// The controller-expand reference wins; the node-expand reference is used
/// when it is the only one configured.
pub fn volume_expand_secret_ref(volume: &PersistentVolume) -> Option<&SecretReference> {
    let csi = volume_csi_source(volume)?;
    csi.controller_expand_secret_ref
        .as_ref()
        .or(csi.node_expand_secret_ref.as_ref())
}

/// Claim that the volume is bound to, if any
pub fn volume_claim_key(volume: &PersistentVolume) -> Option<ClaimKey> {
    let claim_ref = volume.spec.as_ref()?.claim_ref.as_ref()?;
    let name = claim_ref.name.as_deref()?;
    let namespace = claim_ref.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE);
    Some(ClaimKey::new(namespace, name))
}

/// Access modes declared on the volume
pub fn volume_access_modes(volume: &PersistentVolume) -> Vec<String> {
    volume
        .spec
        .as_ref()
        .and_then(|s| s.access_modes.clone())
        .unwrap_or_default()
}

/// Whether the volume is exposed as a raw block device
pub fn volume_is_block(volume: &PersistentVolume) -> bool {
    volume
        .spec
        .as_ref()
        .and_then(|s| s.volume_mode.as_deref())
        == Some("Block")
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ObjectReference, PersistentVolumeClaimSpec, PersistentVolumeSpec,
        VolumeResourceRequirements,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::collections::BTreeMap;

    fn make_claim(request: &str) -> PersistentVolumeClaim {
        let mut claim = PersistentVolumeClaim::default();
        claim.metadata.name = Some("data".to_string());
        claim.spec = Some(PersistentVolumeClaimSpec {
            volume_name: Some("pv-1".to_string()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(request.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        });
        claim
    }

    #[test]
    fn test_claim_accessors() {
        let mut claim = make_claim("10Gi");
        assert_eq!(claim_requested_bytes(&claim).unwrap(), 10 << 30);
        assert_eq!(claim_volume_name(&claim), Some("pv-1"));
        assert_eq!(claim_status_bytes(&claim).unwrap(), None);

        set_claim_status_bytes(&mut claim, 5 << 30);
        assert_eq!(claim_status_bytes(&claim).unwrap(), Some(5 << 30));
    }

    #[test]
    fn test_claim_without_request_is_an_error() {
        let claim = PersistentVolumeClaim::default();
        assert!(claim_requested_bytes(&claim).is_err());
        assert_eq!(claim_volume_name(&claim), None);
    }

    #[test]
    fn test_empty_volume_name_is_unbound() {
        let mut claim = make_claim("1Gi");
        claim.spec.as_mut().unwrap().volume_name = Some(String::new());
        assert_eq!(claim_volume_name(&claim), None);
    }

    #[test]
    fn test_volume_accessors() {
        let mut volume = PersistentVolume::default();
        volume.spec = Some(PersistentVolumeSpec {
            claim_ref: Some(ObjectReference {
                name: Some("data".to_string()),
                namespace: Some("apps".to_string()),
                ..Default::default()
            }),
            csi: Some(CSIPersistentVolumeSource {
                driver: "hostpath.csi.example.com".to_string(),
                volume_handle: "vol-1".to_string(),
                node_expand_secret_ref: Some(SecretReference {
                    name: Some("node-secret".to_string()),
                    namespace: Some("kube-system".to_string()),
                }),
                ..Default::default()
            }),
            ..Default::default()
        });

        assert!(volume_capacity_bytes(&volume).is_err());
        set_volume_capacity_bytes(&mut volume, 5 << 30);
        assert_eq!(volume_capacity_bytes(&volume).unwrap(), 5 << 30);
        assert_eq!(
            volume_claim_key(&volume),
            Some(ClaimKey::new("apps", "data"))
        );
        assert_eq!(
            volume_expand_secret_ref(&volume).and_then(|r| r.name.as_deref()),
            Some("node-secret")
        );
        assert!(!volume_is_block(&volume));
    }
}
