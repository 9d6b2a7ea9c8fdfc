//! Crate-level error types for settings validation and submit runs.
//!
//! The wire-level [`RestError`](crate::rest::RestError) lives next to the REST
//! types; this module holds the errors produced by the settings protocol
//! itself. All of them are plain values: returned, compared in tests, rendered
//! inline. None of them is ever used as a panic.

/// Why pending settings changes cannot be submitted right now.
///
/// Returned by [`SettingsModule::validate`](crate::settings::SettingsModule)
/// implementations and by the generic submit guards. The `can_submit`
/// selector collapses any variant to `false` rather than propagating it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A required setting has no usable value.
    #[error("required setting '{0}' is missing")]
    MissingSetting(&'static str),

    /// A setting is present but rejected by module rules.
    #[error("setting '{field}' is invalid: {reason}")]
    InvalidSetting {
        /// The offending settings key.
        field: &'static str,
        /// Module-supplied explanation.
        reason: String,
    },

    /// A save is already in flight.
    #[error("a save is already in flight")]
    SaveInFlight,

    /// The draft does not differ from the saved baseline.
    #[error("no settings changes to submit")]
    NoChanges,
}

/// Error returned when a submit run stops early.
///
/// Pipelines stop at the first failing step and never attempt the remaining
/// ones; the error names the step that aborted the run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SubmitError {
    /// Validation rejected the changes before any step ran.
    #[error("changes are not submittable: {0}")]
    NotSubmittable(#[source] ValidationError),

    /// A pipeline step (or the final save) failed.
    #[error("submit step '{step}' failed: {source}")]
    Step {
        /// Name of the step that failed.
        step: &'static str,
        /// The underlying REST failure.
        #[source]
        source: crate::rest::RestError,
    },
}

impl SubmitError {
    /// The failing step's name, or `None` for validation rejections.
    pub fn step(&self) -> Option<&'static str> {
        match self {
            SubmitError::NotSubmittable(_) => None,
            SubmitError::Step { step, .. } => Some(step),
        }
    }
}
