// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use crate::metrics::ResizerMetrics;
use miette::Diagnostic;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use volresize_core::conditions::{
    has_condition, remove_condition, set_condition, FILE_SYSTEM_RESIZE_PENDING,
    FS_RESIZE_PENDING_MESSAGE, RESIZING,
};
use volresize_core::objects::{
    claim_requested_bytes, claim_status_bytes, claim_volume_name, set_claim_status_bytes,
    set_volume_capacity_bytes, volume_capacity_bytes, volume_expand_secret_ref,
};
use volresize_core::{format_storage, ClaimKey, CoreError, PersistentVolume, PersistentVolumeClaim};
use volresize_driver::{ResizeError, Resizer};
use volresize_store::{ObjectStore, StoreError, UpdateOutcome};

/// How a driver "volume in use" refusal is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InUsePolicy {
    /// Reported as its own failure category and logged as an expected wait
    Handle,
    /// Treated like any other transient driver failure
    Ignore,
}

impl InUsePolicy {
    pub fn from_flag(handle: bool) -> Self {
        if handle {
            InUsePolicy::Handle
        } else {
            InUsePolicy::Ignore
        }
    }
}

/// Terminal result of a successful reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The claim no longer exists
    ClaimDeleted,
    /// The claim is not bound yet
    Unbound,
    /// The bound volume object does not exist
    VolumeMissing,
    /// The volume is not served by this driver
    NotHandled,
    /// Requested size already satisfied, nothing to write
    UpToDate,
    /// Requested size already satisfied; a stale Resizing condition was removed
    ClearedResizing,
    /// Expansion finished, the claim reports `size`
    Resized { size: i64 },
    /// Controller expansion finished, the node agent must grow the filesystem
    NodeExpansionPending { size: i64 },
    /// The driver no longer knows the volume
    DriverVolumeNotFound,
}

/// Failure category of a pass, used for logging and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Conflict,
    InUse,
    Transient,
    InvalidRequest,
    Store,
    Internal,
}

impl FailureKind {
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::Conflict => "conflict",
            FailureKind::InUse => "in_use",
            FailureKind::Transient => "transient",
            FailureKind::InvalidRequest => "invalid",
            FailureKind::Store => "store",
            FailureKind::Internal => "internal",
        }
    }
}

/// A pass that must be retried; none of these are terminal
#[derive(Error, Debug, Diagnostic)]
pub enum ReconcileError {
    /// The object changed since it was read
    #[error("Conflicting update of {object}")]
    #[diagnostic(code(volresize::controller::reconcile::conflict))]
    Conflict {
        #[allow(unused)]
        object: String,
    },

    /// The driver failed the expand call
    #[error("Expanding volume {volume} failed: {source}")]
    #[diagnostic(code(volresize::controller::reconcile::driver))]
    Driver {
        #[allow(unused)]
        volume: String,
        kind: FailureKind,
        #[source]
        source: ResizeError,
    },

    /// A secret referenced by the volume does not exist
    #[error("Expand secret {namespace}/{name} not found")]
    #[diagnostic(
        code(volresize::controller::reconcile::missing_secret),
        help("Create the secret referenced by the volume's expand secret reference")
    )]
    MissingSecret {
        #[allow(unused)]
        namespace: String,
        #[allow(unused)]
        name: String,
    },

    /// Object store error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    /// The claim or volume is malformed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Object(#[from] CoreError),
}

impl ReconcileError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ReconcileError::Conflict { .. } => FailureKind::Conflict,
            ReconcileError::Driver { kind, .. } => *kind,
            ReconcileError::MissingSecret { .. } => FailureKind::InvalidRequest,
            ReconcileError::Store(_) => FailureKind::Store,
            ReconcileError::Object(_) => FailureKind::Internal,
        }
    }
}

/// Walks one claim through the controller side of the expansion protocol
///
/// Every pass starts from the objects currently in the store; nothing is
/// carried over between passes except what the claim's conditions and the
/// volume's capacity record.
pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    resizer: Arc<Resizer>,
    metrics: ResizerMetrics,
    in_use_policy: InUsePolicy,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        resizer: Arc<Resizer>,
        metrics: ResizerMetrics,
        in_use_policy: InUsePolicy,
    ) -> Self {
        Self {
            store,
            resizer,
            metrics,
            in_use_policy,
        }
    }

    pub fn resizer(&self) -> &Resizer {
        &self.resizer
    }

    /// Run one reconciliation pass for the claim
    #[instrument(skip(self, key), fields(claim = %key))]
    pub async fn reconcile(&self, key: &ClaimKey) -> Result<ReconcileOutcome, ReconcileError> {
        let Some(claim) = self.store.get_claim(key).await? else {
            debug!("Claim no longer exists");
            return Ok(ReconcileOutcome::ClaimDeleted);
        };
        let Some(volume_name) = claim_volume_name(&claim).map(str::to_string) else {
            debug!("Claim is not bound yet");
            return Ok(ReconcileOutcome::Unbound);
        };
        let Some(volume) = self.store.get_volume(&volume_name).await? else {
            debug!(volume = %volume_name, "Bound volume does not exist");
            return Ok(ReconcileOutcome::VolumeMissing);
        };
        if !self.resizer.can_support(&volume) {
            debug!(volume = %volume_name, "Volume is not served by this driver");
            return Ok(ReconcileOutcome::NotHandled);
        }

        let requested = claim_requested_bytes(&claim)?;
        let current = volume_capacity_bytes(&volume)?;

        if requested <= current {
            return self.reconcile_satisfied(claim, &volume, current).await;
        }

        info!(
            volume = %volume_name,
            from = %format_storage(current),
            to = %format_storage(requested),
            "Expansion requested"
        );

        if !self.resizer.supports_controller_expansion() {
            return self.skip_controller_expansion(claim, volume, requested).await;
        }

        let claim = self.mark_resizing(claim).await;
        let secrets = self.expand_secrets(&volume).await?;

        let result = self.resizer.resize(&volume, requested, secrets).await;
        let driver_result = match &result {
            Ok(_) => "success",
            Err(e) => e.label(),
        };
        self.metrics
            .record_driver_call(self.resizer.name(), driver_result);

        match result {
            Ok(outcome) => {
                if self
                    .write_volume_capacity(volume, outcome.new_size)
                    .await?
                    .is_none()
                {
                    return Ok(ReconcileOutcome::VolumeMissing);
                }
                info!(
                    volume = %volume_name,
                    size = %format_storage(outcome.new_size),
                    node_expansion_required = outcome.node_expansion_required,
                    "Controller expansion finished"
                );
                if outcome.node_expansion_required {
                    self.mark_node_expansion_pending(claim, outcome.new_size)
                        .await
                } else {
                    self.mark_resize_finished(claim, outcome.new_size).await
                }
            }
            Err(ResizeError::NotFound { .. }) => {
                warn!(volume = %volume_name, "Driver does not know the volume, nothing to expand");
                let mut updated = claim;
                if remove_condition(&mut updated, RESIZING)
                    && self.write_claim_status(updated).await?.is_none()
                {
                    return Ok(ReconcileOutcome::ClaimDeleted);
                }
                Ok(ReconcileOutcome::DriverVolumeNotFound)
            }
            Err(ResizeError::Unsupported { message }) => {
                debug!(volume = %volume_name, "Driver rejected controller expansion: {}", message);
                self.skip_controller_expansion(claim, volume, requested).await
            }
            Err(e) => {
                let kind = self.classify(&e);
                if kind == FailureKind::InUse {
                    info!(volume = %volume_name, "Volume is in use, waiting before retrying expansion");
                }
                Err(ReconcileError::Driver {
                    volume: volume_name,
                    kind,
                    source: e,
                })
            }
        }
    }

    fn classify(&self, err: &ResizeError) -> FailureKind {
        match err {
            ResizeError::InUse { .. } => match self.in_use_policy {
                InUsePolicy::Handle => FailureKind::InUse,
                InUsePolicy::Ignore => FailureKind::Transient,
            },
            ResizeError::InvalidRequest { .. } | ResizeError::InvalidVolume { .. } => {
                FailureKind::InvalidRequest
            }
            ResizeError::Transient { .. }
            | ResizeError::ShortGrant { .. }
            | ResizeError::NotFound { .. }
            | ResizeError::Unsupported { .. } => FailureKind::Transient,
        }
    }

    /// Requested size is already provisioned
    async fn reconcile_satisfied(
        &self,
        claim: PersistentVolumeClaim,
        volume: &PersistentVolume,
        current: i64,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let reported = claim_status_bytes(&claim)?;
        let fs_pending = has_condition(&claim, FILE_SYSTEM_RESIZE_PENDING);

        // A previous pass grew the volume but stopped before the claim was updated
        if reported.is_some_and(|r| r < current) && !fs_pending {
            info!(size = %format_storage(current), "Finishing interrupted expansion");
            return if self.resizer.requires_node_expansion(volume) {
                self.mark_node_expansion_pending(claim, current).await
            } else {
                self.mark_resize_finished(claim, current).await
            };
        }

        if has_condition(&claim, RESIZING) {
            let mut updated = claim;
            remove_condition(&mut updated, RESIZING);
            return Ok(match self.write_claim_status(updated).await? {
                Some(_) => {
                    debug!("Cleared stale Resizing condition");
                    ReconcileOutcome::ClearedResizing
                }
                None => ReconcileOutcome::ClaimDeleted,
            });
        }

        Ok(ReconcileOutcome::UpToDate)
    }

    /// Driver has no controller phase: record the target on the volume and
    /// hand over to the node agent
    async fn skip_controller_expansion(
        &self,
        claim: PersistentVolumeClaim,
        volume: PersistentVolume,
        requested: i64,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        if self.write_volume_capacity(volume, requested).await?.is_none() {
            return Ok(ReconcileOutcome::VolumeMissing);
        }
        self.mark_node_expansion_pending(claim, requested).await
    }

    /// Set Resizing; failures are logged and the pass continues with the
    /// snapshot it had
    async fn mark_resizing(&self, claim: PersistentVolumeClaim) -> PersistentVolumeClaim {
        let mut updated = claim.clone();
        if !set_condition(&mut updated, RESIZING, None, None) {
            return claim;
        }
        match self.store.update_claim_status(updated).await {
            UpdateOutcome::Updated(stored) => stored,
            other => {
                warn!("Could not set Resizing condition ({})", other.label());
                claim
            }
        }
    }

    async fn mark_node_expansion_pending(
        &self,
        mut claim: PersistentVolumeClaim,
        size: i64,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        set_condition(
            &mut claim,
            FILE_SYSTEM_RESIZE_PENDING,
            None,
            Some(FS_RESIZE_PENDING_MESSAGE),
        );
        remove_condition(&mut claim, RESIZING);
        Ok(match self.write_claim_status(claim).await? {
            Some(_) => ReconcileOutcome::NodeExpansionPending { size },
            None => ReconcileOutcome::ClaimDeleted,
        })
    }

    async fn mark_resize_finished(
        &self,
        mut claim: PersistentVolumeClaim,
        size: i64,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        set_claim_status_bytes(&mut claim, size);
        remove_condition(&mut claim, RESIZING);
        remove_condition(&mut claim, FILE_SYSTEM_RESIZE_PENDING);
        Ok(match self.write_claim_status(claim).await? {
            Some(_) => {
                info!(size = %format_storage(size), "Resize finished");
                ReconcileOutcome::Resized { size }
            }
            None => ReconcileOutcome::ClaimDeleted,
        })
    }

    /// Conditional claim status write; `Ok(None)` when the claim is gone
    async fn write_claim_status(
        &self,
        claim: PersistentVolumeClaim,
    ) -> Result<Option<PersistentVolumeClaim>, ReconcileError> {
        let object = format!(
            "claim {}",
            ClaimKey::from_claim(&claim).map_or_else(|_| "<unnamed>".to_string(), |k| k.to_string())
        );
        resolve(self.store.update_claim_status(claim).await, object)
    }

    /// Conditional volume capacity write; `Ok(None)` when the volume is gone
    async fn write_volume_capacity(
        &self,
        mut volume: PersistentVolume,
        size: i64,
    ) -> Result<Option<PersistentVolume>, ReconcileError> {
        let object = format!(
            "volume {}",
            volume.metadata.name.as_deref().unwrap_or("<unnamed>")
        );
        set_volume_capacity_bytes(&mut volume, size);
        resolve(self.store.update_volume(volume).await, object)
    }

    async fn expand_secrets(
        &self,
        volume: &PersistentVolume,
    ) -> Result<BTreeMap<String, String>, ReconcileError> {
        let Some(secret_ref) = volume_expand_secret_ref(volume) else {
            return Ok(BTreeMap::new());
        };
        let namespace = secret_ref.namespace.clone().unwrap_or_default();
        let name = secret_ref.name.clone().unwrap_or_default();

        match self.store.get_secret(&namespace, &name).await? {
            Some(data) => Ok(data),
            None => Err(ReconcileError::MissingSecret { namespace, name }),
        }
    }
}

fn resolve<T>(outcome: UpdateOutcome<T>, object: String) -> Result<Option<T>, ReconcileError> {
    match outcome {
        UpdateOutcome::Updated(stored) => Ok(Some(stored)),
        UpdateOutcome::NotFound => Ok(None),
        UpdateOutcome::Conflict { .. } => Err(ReconcileError::Conflict { object }),
        UpdateOutcome::Failed(e) => Err(e.into()),
    }
}
