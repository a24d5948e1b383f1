//! The orchestrator's error type: wraps [`ArchonError`] from the
//! controller/exposure path with the composite failures that only make
//! sense once more than one controller is involved (`spec.md` §7 "one
//! central enum with `#[from]` conversions", applied one level up per
//! `SPEC_FULL.md` §7).

use archon_core::error::ArchonError;
use archon_storage::LockfileError;

/// Errors raised while driving an exposure or recovery pass across a
/// fleet of controllers.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// One controller failed outright; the others in the fleet were not
    /// implicated and need no special handling.
    #[error(transparent)]
    Controller(#[from] ArchonError),

    /// One or more controllers failed mid-exposure; the rest were aborted
    /// in response. Carries every controller's outcome so the caller can
    /// report which succeeded and which failed.
    #[error("{} of {} controller(s) failed during the exposure: {}", failures.len(), total, describe(failures))]
    PartialFailure {
        /// Total number of controllers participating in the exposure.
        total: usize,
        /// `(controller, error)` pairs for every controller that failed.
        failures: Vec<(String, ArchonError)>,
    },

    /// A lockfile could not be created, read, or removed.
    #[error(transparent)]
    Lockfile(#[from] LockfileError),

    /// The FITS writer port failed.
    #[error("persisting exposure {exposure_no} for {controller}/{detector}: {message}")]
    Persist {
        /// Exposure number being persisted.
        exposure_no: u64,
        /// Controller the frame was fetched from.
        controller: String,
        /// Detector region within that controller's frame.
        detector: String,
        /// Underlying cause, from the injected `FitsWriter`'s `anyhow::Error`.
        message: String,
    },

    /// The exposure-counter store failed to allocate or read a value.
    #[error("exposure counter store error: {0}")]
    Counter(String),

    /// No controller matched a name requested by the caller.
    #[error("unknown controller(s): {0:?}")]
    UnknownControllers(Vec<String>),
}

fn describe(failures: &[(String, ArchonError)]) -> String {
    failures
        .iter()
        .map(|(name, err)| format!("{name}: {err}"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl OrchestratorError {
    /// CLI exit code, per `spec.md` §7: 2 for user/caller errors, 3 for
    /// device or persistence errors.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::Controller(e) => e.exit_code(),
            OrchestratorError::UnknownControllers(_) => 2,
            OrchestratorError::PartialFailure { failures, .. } => {
                if failures.iter().any(|(_, e)| e.exit_code() == 3) {
                    3
                } else {
                    2
                }
            }
            OrchestratorError::Lockfile(_)
            | OrchestratorError::Persist { .. }
            | OrchestratorError::Counter(_) => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_err() -> ArchonError {
        ArchonError::Device { controller: "ccd1".into(), message: "nak".into() }
    }

    fn config_err() -> ArchonError {
        ArchonError::Config("bad line".into())
    }

    #[test]
    fn partial_failure_exit_code_escalates_to_device_when_any_source_is_a_device_error() {
        let err = OrchestratorError::PartialFailure {
            total: 2,
            failures: vec![("ccd1".to_string(), config_err()), ("ccd2".to_string(), device_err())],
        };
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn partial_failure_exit_code_stays_user_when_all_sources_are_user_errors() {
        let err = OrchestratorError::PartialFailure {
            total: 1,
            failures: vec![("ccd1".to_string(), config_err())],
        };
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn unknown_controllers_is_a_user_error() {
        let err = OrchestratorError::UnknownControllers(vec!["ccd9".to_string()]);
        assert_eq!(err.exit_code(), 2);
    }
}
