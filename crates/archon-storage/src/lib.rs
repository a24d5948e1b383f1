//! Durable persistence for the `archond` workspace: a FITS file writer, the
//! sidecar lockfile format that brackets every write (`spec.md` §3/§4.6/§6),
//! and the persisted monotonic exposure counter (`spec.md` §6).
//!
//! None of this crate touches controller state; it only implements the
//! narrow [`archon_core::ports`] traits the orchestrator depends on, so the
//! orchestrator itself stays unit-testable against in-memory fakes.

pub mod checksum;
pub mod exposure_counter;
pub mod fits;
pub mod header;
pub mod lockfile;

pub use checksum::DailyChecksumSidecar;
pub use exposure_counter::FileExposureCounterStore;
pub use fits::FilesystemFitsWriter;
pub use lockfile::{Lockfile, LockfileError};
