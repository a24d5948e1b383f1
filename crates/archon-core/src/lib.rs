//! Shared primitives for the `archond` workspace.
//!
//! This crate has no knowledge of TCP sockets, ACF text, or FITS files — it
//! only defines the vocabulary the other crates share: the wire codec, the
//! controller status bitmask, the command id allocator, the core data model,
//! and the narrow port traits (reply sink, FITS writer, clock, ...) that let
//! `archon-orchestrator` be unit-tested against in-memory fakes.

pub mod data;
pub mod error;
pub mod ids;
pub mod link;
pub mod ports;
pub mod status;
pub mod wire;

pub use data::{BufferDescriptor, ControllerDescriptor, DetectorDescriptor, ExposureRecord};
pub use error::{ArchonError, ArchonResult};
pub use ids::CommandIdAllocator;
pub use link::ControllerLink;
pub use ports::Cotask;
pub use status::{ControllerStatus, StatusFlags};
pub use wire::{CommandFrame, ReplyFrame};
