//! An [`EnvironmentalSensorReader`] backed by a fixed, site-configured
//! map of FITS header keyword to value. `SPEC_FULL.md` §4.6 header
//! augmentation: every site has its own dome/weather telemetry and this
//! daemon has no business bundling a client for any particular vendor's
//! sensor bus, so the default implementation simply republishes whatever
//! the operator configured as of daemon startup. A future `archond` could
//! swap this port for one that polls a live weather station without the
//! orchestrator changing at all.

use archon_core::ports::EnvironmentalSensorReader;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Republishes a fixed set of environmental header values on every read.
#[derive(Debug, Clone, Default)]
pub struct StaticEnvironmentalSensorReader {
    values: BTreeMap<String, String>,
}

impl StaticEnvironmentalSensorReader {
    /// Builds a reader over `values`, a keyword -> value map taken verbatim
    /// from site configuration.
    #[must_use]
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }
}

#[async_trait]
impl EnvironmentalSensorReader for StaticEnvironmentalSensorReader {
    async fn read(&self) -> BTreeMap<String, String> {
        self.values.clone()
    }
}
