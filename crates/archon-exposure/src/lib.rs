//! The per-controller exposure state machine (`spec.md` §4.5): `expose`,
//! `abort`, `readout`, `fetch`, `flush`, `write_config`, `reset`, gated by a
//! controller-local mutex so exactly one state-changing operation is in
//! flight at a time.

pub mod engine;
pub mod frame;

pub use engine::{EngineConfig, ExposureEngine};
pub use frame::decode_frame;
