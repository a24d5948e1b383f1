//! The Archon controller client: one persistent TCP connection, request
//! correlation, timeouts, and notification/status delivery (`spec.md`
//! §4.2).

pub mod connection;
pub mod pending;
pub mod reply;

pub use connection::{ConnectOptions, ControllerClient};
pub use pending::PendingCommandTable;
pub use reply::parse_frame_reply;
