//! Site-configured per-detector electronics characterization, resolved
//! into an `archon_storage::header::DetectorHeaderContext` for each
//! persisted frame.

use archon_core::data::DetectorDescriptor;
use archon_storage::header::{BiasSection, DetectorHeaderContext, TapCharacterization};
use std::collections::HashMap;

/// Per-detector gain/read-noise and bias-section configuration, loaded
/// once at startup from site configuration and looked up by detector name
/// for every persisted frame.
#[derive(Debug, Clone, Default)]
pub struct TapAndBiasConfig {
    taps: HashMap<String, TapCharacterization>,
    bias_sections: HashMap<String, BiasSection>,
}

impl TapAndBiasConfig {
    /// Builds a configuration from explicit per-detector maps.
    #[must_use]
    pub fn new(taps: HashMap<String, TapCharacterization>, bias_sections: HashMap<String, BiasSection>) -> Self {
        Self { taps, bias_sections }
    }

    /// Builds the header context for `detector`, filling in whatever this
    /// configuration knows about its tap and bias section; both are
    /// `None` when the site has not characterized that detector.
    #[must_use]
    pub fn context_for<'a>(&self, detector: &'a DetectorDescriptor, backplane_id: &'a str) -> DetectorHeaderContext<'a> {
        DetectorHeaderContext {
            detector,
            backplane_id,
            tap: self.taps.get(&detector.name).copied(),
            bias_section: self.bias_sections.get(&detector.name).copied(),
        }
    }
}
