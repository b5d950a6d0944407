use crate::error::{CoreError, Result};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Namespace assumed for objects that do not carry one
pub const DEFAULT_NAMESPACE: &str = "default";

/// ClaimKey identifies a PersistentVolumeClaim and is the work queue item.
///
/// It carries no object state: every reconciliation pass re-reads the claim
/// from the object store using this key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClaimKey {
    /// Claim namespace
    pub namespace: String,
    /// Claim name
    pub name: String,
}

impl ClaimKey {
    /// Create a new ClaimKey
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Build the key of an existing claim object
    pub fn from_claim(claim: &PersistentVolumeClaim) -> Result<Self> {
        let name = claim
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| CoreError::missing_field("PersistentVolumeClaim", "metadata.name"))?;
        let namespace = claim
            .metadata
            .namespace
            .as_deref()
            .unwrap_or(DEFAULT_NAMESPACE);
        Ok(Self::new(namespace, name))
    }
}

impl fmt::Display for ClaimKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_key_display() {
        let key = ClaimKey::new("default", "data");
        assert_eq!(key.to_string(), "default/data");
    }

    #[test]
    fn test_claim_key_from_claim_defaults_namespace() {
        let mut claim = PersistentVolumeClaim::default();
        claim.metadata.name = Some("logs".to_string());
        assert_eq!(
            ClaimKey::from_claim(&claim).unwrap(),
            ClaimKey::new("default", "logs")
        );

        let nameless = PersistentVolumeClaim::default();
        assert!(ClaimKey::from_claim(&nameless).is_err());
    }
}
