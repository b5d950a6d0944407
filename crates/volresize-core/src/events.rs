use crate::objects::volume_claim_key;
use crate::types::ClaimKey;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use serde::{Deserialize, Serialize};

/// Watch event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// Change notification emitted by the object store
#[derive(Debug, Clone)]
pub enum ObjectEvent {
    /// A claim was created, updated or deleted
    Claim {
        event_type: WatchEventType,
        object: Box<PersistentVolumeClaim>,
    },
    /// A volume was created, updated or deleted
    Volume {
        event_type: WatchEventType,
        object: Box<PersistentVolume>,
    },
}

impl ObjectEvent {
    pub fn claim(event_type: WatchEventType, object: PersistentVolumeClaim) -> Self {
        Self::Claim {
            event_type,
            object: Box::new(object),
        }
    }

    pub fn volume(event_type: WatchEventType, object: PersistentVolume) -> Self {
        Self::Volume {
            event_type,
            object: Box::new(object),
        }
    }

    pub fn event_type(&self) -> WatchEventType {
        match self {
            ObjectEvent::Claim { event_type, .. } | ObjectEvent::Volume { event_type, .. } => {
                *event_type
            }
        }
    }

    /// Claim this event concerns: the claim itself, or the claim a volume is bound to
    pub fn claim_key(&self) -> Option<ClaimKey> {
        match self {
            ObjectEvent::Claim { object, .. } => ClaimKey::from_claim(object).ok(),
            ObjectEvent::Volume { object, .. } => volume_claim_key(object),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolumeSpec};

    #[test]
    fn test_claim_event_key() {
        let mut claim = PersistentVolumeClaim::default();
        claim.metadata.name = Some("data".to_string());
        claim.metadata.namespace = Some("apps".to_string());

        let event = ObjectEvent::claim(WatchEventType::Added, claim);
        assert_eq!(event.event_type(), WatchEventType::Added);
        assert_eq!(event.claim_key(), Some(ClaimKey::new("apps", "data")));
    }

    #[test]
    fn test_volume_event_maps_to_bound_claim() {
        let mut volume = PersistentVolume::default();
        volume.metadata.name = Some("pv-1".to_string());
        assert_eq!(
            ObjectEvent::volume(WatchEventType::Modified, volume.clone()).claim_key(),
            None
        );

        volume.spec = Some(PersistentVolumeSpec {
            claim_ref: Some(ObjectReference {
                name: Some("data".to_string()),
                namespace: Some("apps".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(
            ObjectEvent::volume(WatchEventType::Modified, volume).claim_key(),
            Some(ClaimKey::new("apps", "data"))
        );
    }

    #[test]
    fn test_watch_event_type_serde() {
        let json = serde_json::to_string(&WatchEventType::Deleted).unwrap();
        assert_eq!(json, "\"DELETED\"");
    }
}
