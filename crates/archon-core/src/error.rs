//! The error taxonomy shared by every `archond` crate.
//!
//! This module defines [`ArchonError`], a single `thiserror` enum that
//! consolidates everything that can go wrong talking to an Archon
//! controller, from a malformed wire frame to a failed FITS rename.
//!
//! ## Error categories
//!
//! - **Protocol-fatal** — [`ArchonError::Protocol`], [`ArchonError::Disconnected`].
//!   These poison the connection: every outstanding command fails and the
//!   controller status model is pushed to `UNKNOWN | ERROR`.
//! - **Per-command** — [`ArchonError::CommandFailed`], [`ArchonError::Timeout`].
//!   These fail only the originating command; the connection and status are
//!   untouched.
//! - **Caller errors** — [`ArchonError::InvalidState`], [`ArchonError::Config`].
//!   Never touch controller status; the caller asked for something that
//!   cannot happen right now or that is malformed.
//! - **Device/persist errors** — [`ArchonError::Device`], [`ArchonError::Fetch`],
//!   [`ArchonError::Persist`]. `Persist` does not fail the exposure: the
//!   lockfile retains the data and recovery reruns the write.
//!
//! `spec.md` §7 leaves these unnamed ("signalling only"); the names below are
//! chosen for clarity and are not meant to mirror any upstream vocabulary.

use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type ArchonResult<T> = std::result::Result<T, ArchonError>;

/// Primary error type for the `archond` workspace.
#[derive(Error, Debug, Clone)]
pub enum ArchonError {
    /// A malformed frame, an unknown command id, or a FETCH length mismatch.
    #[error("protocol error on controller '{controller}': {message}")]
    Protocol {
        /// Name of the controller descriptor the error occurred on.
        controller: String,
        /// Human-readable detail.
        message: String,
    },

    /// The controller replied `?II` (NAK) to a command.
    #[error("command '{command}' failed (NAK) on controller '{controller}'")]
    CommandFailed {
        /// Name of the controller descriptor the error occurred on.
        controller: String,
        /// The literal command text that was rejected.
        command: String,
    },

    /// No reply arrived before the command's deadline.
    #[error("command '{command}' timed out on controller '{controller}' after {elapsed_ms}ms")]
    Timeout {
        /// Name of the controller descriptor the error occurred on.
        controller: String,
        /// The literal command text that timed out.
        command: String,
        /// How long the caller waited before giving up.
        elapsed_ms: u64,
    },

    /// The TCP connection to the controller was lost or never established.
    #[error("controller '{controller}' disconnected: {message}")]
    Disconnected {
        /// Name of the controller descriptor the error occurred on.
        controller: String,
        /// Human-readable detail (refused, reset, EOF, ...).
        message: String,
    },

    /// A command was issued while the controller status bitmask forbids it.
    #[error("invalid state on controller '{controller}': {message}")]
    InvalidState {
        /// Name of the controller descriptor the error occurred on.
        controller: String,
        /// Human-readable detail, e.g. "expose requires IDLE, got EXPOSING".
        message: String,
    },

    /// A named parameter was missing, the ACF text was malformed, or the
    /// derived geometry was inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// `POWERBAD` was reported, or a hardware sanity check failed.
    #[error("device error on controller '{controller}': {message}")]
    Device {
        /// Name of the controller descriptor the error occurred on.
        controller: String,
        /// Human-readable detail.
        message: String,
    },

    /// Buffer selection or byte-reshaping failed.
    #[error("fetch error on controller '{controller}': {message}")]
    Fetch {
        /// Name of the controller descriptor the error occurred on.
        controller: String,
        /// Human-readable detail.
        message: String,
    },

    /// A FITS write or rename failed. Non-fatal to the exposure: the
    /// lockfile retains the data for a later `recover`.
    #[error("persist error for exposure {exposure_no} on controller '{controller}': {message}")]
    Persist {
        /// Exposure number the write belonged to.
        exposure_no: u64,
        /// Name of the controller descriptor the error occurred on.
        controller: String,
        /// Human-readable detail.
        message: String,
    },

    /// An in-flight `expose`/`readout`/`flush` was cancelled by an explicit
    /// `abort`. Not a caller mistake and not a device fault; distinguished
    /// from both so the orchestrator can tell "this controller's exposure
    /// was deliberately cut short" apart from a real failure.
    #[error("exposure aborted on controller '{controller}'")]
    Aborted {
        /// Name of the controller descriptor the error occurred on.
        controller: String,
    },
}

impl ArchonError {
    /// Maps an error to the CLI exit-code category described in `spec.md` §7:
    /// user/caller errors exit `2`, device/protocol errors exit `3`.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            ArchonError::InvalidState { .. } | ArchonError::Config(_) => 2,
            _ => 3,
        }
    }

    /// The controller name this error is attributed to, if any. `Config`
    /// errors are not controller-scoped.
    #[must_use]
    pub fn controller(&self) -> Option<&str> {
        match self {
            ArchonError::Protocol { controller, .. }
            | ArchonError::CommandFailed { controller, .. }
            | ArchonError::Timeout { controller, .. }
            | ArchonError::Disconnected { controller, .. }
            | ArchonError::InvalidState { controller, .. }
            | ArchonError::Device { controller, .. }
            | ArchonError::Fetch { controller, .. }
            | ArchonError::Persist { controller, .. }
            | ArchonError::Aborted { controller } => Some(controller),
            ArchonError::Config(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_and_config_exit_two() {
        assert_eq!(
            ArchonError::InvalidState {
                controller: "ccd1".into(),
                message: "not idle".into()
            }
            .exit_code(),
            2
        );
        assert_eq!(ArchonError::Config("bad acf".into()).exit_code(), 2);
    }

    #[test]
    fn device_and_protocol_exit_three() {
        assert_eq!(
            ArchonError::Device {
                controller: "ccd1".into(),
                message: "POWERBAD".into()
            }
            .exit_code(),
            3
        );
        assert_eq!(
            ArchonError::Timeout {
                controller: "ccd1".into(),
                command: "STATUS".into(),
                elapsed_ms: 5000
            }
            .exit_code(),
            3
        );
    }
}
