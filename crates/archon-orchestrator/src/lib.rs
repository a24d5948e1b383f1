//! The multi-controller exposure orchestrator (`spec.md` §4.6): fans an
//! exposure out across every configured controller, fans the resulting
//! frames back in, crops and persists one FITS file per detector region,
//! and recovers any write a prior process was interrupted mid-way
//! through.

pub mod crop;
pub mod error;
pub mod header;
pub mod orchestrator;
pub mod paths;

pub use error::OrchestratorError;
pub use header::TapAndBiasConfig;
pub use orchestrator::{ExposureOrchestrator, ExposureOutcome, OrchestratorPorts};
pub use paths::{FilenamePolicy, TemplateFilenamePolicy};
