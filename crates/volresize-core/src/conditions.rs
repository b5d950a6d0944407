//! Claim status conditions written by the resize controller.

use chrono::Utc;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimCondition};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

/// Controller-side expansion is in progress
pub const RESIZING: &str = "Resizing";

/// Controller-side expansion finished; the node agent must grow the filesystem
pub const FILE_SYSTEM_RESIZE_PENDING: &str = "FileSystemResizePending";

/// Message attached to the FileSystemResizePending condition
pub const FS_RESIZE_PENDING_MESSAGE: &str =
    "Waiting for user to (re-)start a pod to finish file system resize of volume on node.";

/// Find a condition by type
pub fn get_condition<'a>(
    claim: &'a PersistentVolumeClaim,
    type_: &str,
) -> Option<&'a PersistentVolumeClaimCondition> {
    claim
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == type_))
}

/// Whether the claim carries a `True` condition of the given type
pub fn has_condition(claim: &PersistentVolumeClaim, type_: &str) -> bool {
    get_condition(claim, type_).is_some_and(|c| c.status == "True")
}

/// Set a `True` condition on the claim.
///
/// An existing condition of the same type keeps its transition time when it
/// was already `True`; reason and message are refreshed. Returns whether the
/// claim changed.
pub fn set_condition(
    claim: &mut PersistentVolumeClaim,
    type_: &str,
    reason: Option<&str>,
    message: Option<&str>,
) -> bool {
    let now = Time(Utc::now());
    let status = claim.status.get_or_insert_with(Default::default);
    let conditions = status.conditions.get_or_insert_with(Vec::new);

    let desired = PersistentVolumeClaimCondition {
        type_: type_.to_string(),
        status: "True".to_string(),
        reason: reason.map(str::to_string),
        message: message.map(str::to_string),
        last_probe_time: None,
        last_transition_time: Some(now),
    };

    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status == "True"
                && existing.reason == desired.reason
                && existing.message == desired.message
            {
                return false;
            }
            let last_transition_time = if existing.status == "True" {
                existing.last_transition_time.clone()
            } else {
                desired.last_transition_time.clone()
            };
            *existing = PersistentVolumeClaimCondition {
                last_transition_time,
                ..desired
            };
        }
        None => conditions.push(desired),
    }
    true
}

/// Remove every condition of the given type. Returns whether the claim changed.
pub fn remove_condition(claim: &mut PersistentVolumeClaim, type_: &str) -> bool {
    let Some(conditions) = claim.status.as_mut().and_then(|s| s.conditions.as_mut()) else {
        return false;
    };
    let before = conditions.len();
    conditions.retain(|c| c.type_ != type_);
    before != conditions.len()
}
