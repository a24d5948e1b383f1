//! ACF (Archon configuration file) parsing, editing, and geometry
//! computation (`spec.md` §4.3).

pub mod document;
pub mod geometry;
pub mod manager;

pub use document::{AcfDocument, ParseError};
pub use geometry::compute_geometry;
pub use manager::{AcfManager, ApplySubsystems};
