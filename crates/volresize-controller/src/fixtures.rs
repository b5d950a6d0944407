//! Claim/volume builders shared by the controller tests.

use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, ObjectReference, PersistentVolumeSpec, SecretReference,
};
use std::sync::Arc;
use std::time::Duration;
use volresize_core::objects::{set_claim_status_bytes, set_volume_capacity_bytes};
use volresize_core::quantity::set_storage_in_map;
use volresize_core::{PersistentVolume, PersistentVolumeClaim};
use volresize_driver::{DriverCapability, MockDriver, Resizer};

pub const GI: i64 = 1 << 30;
pub const DRIVER: &str = "mock.csi.volresize.io";

/// A claim bound to `pv-<name>`, requesting `requested` bytes and reporting
/// `status` bytes
pub fn claim(name: &str, requested: i64, status: i64) -> PersistentVolumeClaim {
    let mut claim = PersistentVolumeClaim::default();
    claim.metadata.name = Some(name.to_string());
    claim.metadata.namespace = Some("default".to_string());

    let spec = claim.spec.get_or_insert_with(Default::default);
    spec.volume_name = Some(format!("pv-{}", name));
    let resources = spec.resources.get_or_insert_with(Default::default);
    set_storage_in_map(&mut resources.requests, requested);

    set_claim_status_bytes(&mut claim, status);
    claim
}

/// A CSI volume of `capacity` bytes served by `driver`, bound to claim `name`
pub fn volume_for(name: &str, capacity: i64, driver: &str) -> PersistentVolume {
    let mut volume = PersistentVolume::default();
    volume.metadata.name = Some(format!("pv-{}", name));
    volume.spec = Some(PersistentVolumeSpec {
        access_modes: Some(vec!["ReadWriteOnce".to_string()]),
        claim_ref: Some(ObjectReference {
            namespace: Some("default".to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        }),
        csi: Some(CSIPersistentVolumeSource {
            driver: driver.to_string(),
            volume_handle: format!("vol-{}", name),
            ..Default::default()
        }),
        ..Default::default()
    });
    set_volume_capacity_bytes(&mut volume, capacity);
    volume
}

pub fn volume(name: &str, capacity: i64) -> PersistentVolume {
    volume_for(name, capacity, DRIVER)
}

/// Reference the given secret for controller expansion
pub fn with_expand_secret(mut volume: PersistentVolume, namespace: &str, name: &str) -> PersistentVolume {
    if let Some(csi) = volume.spec.as_mut().and_then(|s| s.csi.as_mut()) {
        csi.controller_expand_secret_ref = Some(SecretReference {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
        });
    }
    volume
}

pub fn node_expanding_driver() -> MockDriver {
    let driver = MockDriver::new(DRIVER).with_capabilities(vec![
        DriverCapability::ControllerService,
        DriverCapability::ControllerExpandVolume,
        DriverCapability::NodeExpandVolume,
    ]);
    driver.set_node_expansion_required(true);
    driver
}

pub async fn resizer(driver: Arc<MockDriver>) -> Arc<Resizer> {
    Arc::new(
        Resizer::from_client(driver, Duration::from_secs(10))
            .await
            .unwrap(),
    )
}
