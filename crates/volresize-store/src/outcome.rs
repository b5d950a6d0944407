use crate::error::StoreError;

/// Result of a resource-version checked write.
///
/// The store never overwrites an object whose resourceVersion moved since it
/// was read; callers branch on this instead of inspecting error types.
#[derive(Debug)]
pub enum UpdateOutcome<T> {
    /// The write was applied; carries the stored object with its new version
    Updated(T),
    /// Someone else modified the object after it was read
    Conflict {
        /// Version currently stored, when the store reports it
        current_version: Option<String>,
    },
    /// The object no longer exists
    NotFound,
    /// Any other failure
    Failed(StoreError),
}

impl<T> UpdateOutcome<T> {
    pub fn is_updated(&self) -> bool {
        matches!(self, UpdateOutcome::Updated(_))
    }

    /// Short label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            UpdateOutcome::Updated(_) => "updated",
            UpdateOutcome::Conflict { .. } => "conflict",
            UpdateOutcome::NotFound => "not_found",
            UpdateOutcome::Failed(_) => "failed",
        }
    }

    /// Transform the updated object, keeping the other outcomes as they are
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> UpdateOutcome<U> {
        match self {
            UpdateOutcome::Updated(t) => UpdateOutcome::Updated(f(t)),
            UpdateOutcome::Conflict { current_version } => {
                UpdateOutcome::Conflict { current_version }
            }
            UpdateOutcome::NotFound => UpdateOutcome::NotFound,
            UpdateOutcome::Failed(e) => UpdateOutcome::Failed(e),
        }
    }
}
