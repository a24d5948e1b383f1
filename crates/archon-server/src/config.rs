//! Site configuration: one TOML file describing every controller, its
//! detectors, per-detector electronics characterization, and the storage
//! layout. Loaded with `figment`, the same typed-`Settings` + `Provider`
//! shape the teacher's `rust_daq::config::Settings` uses, pared down to
//! what the daemon itself needs (no instrument/processor registry, no
//! versioning module: those concerns belong to the GUI app this daemon has
//! no counterpart of).

use archon_core::data::{ControllerDescriptor, DetectorDescriptor};
use archon_storage::header::{BiasSection, TapCharacterization};
use archon_storage::DailyChecksumSidecar;
use figment::providers::{Format, Serialized, Toml};
use figment::{Figment, Provider};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

impl Provider for Settings {
    fn metadata(&self) -> figment::Metadata {
        figment::Metadata::named("archond defaults")
    }

    fn data(&self) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        Serialized::defaults(Settings::default()).data()
    }
}

/// Root site configuration, loaded from an optional TOML file layered over
/// built-in defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// `tracing-subscriber` filter directive used when `RUST_LOG` is unset.
    pub log_level: String,
    /// gRPC server settings.
    pub grpc: GrpcSettings,
    /// FITS storage layout.
    pub storage: StorageSettings,
    /// Reported in every FITS header's `SWVER` keyword.
    pub software_version: String,
    /// Reported in every FITS header's `BACKPLANE` keyword.
    pub backplane_id: String,
    /// One entry per controller this daemon drives.
    pub controllers: Vec<ControllerConfig>,
    /// Per-detector gain/read-noise characterization, keyed by detector name.
    pub taps: HashMap<String, TapConfig>,
    /// Per-detector bias/overscan section, keyed by detector name.
    pub bias_sections: HashMap<String, BiasSectionConfig>,
    /// Fixed environmental sensor values (dome temperature, humidity, ...)
    /// republished verbatim into every exposure's FITS header, keyed by FITS
    /// keyword (`SPEC_FULL.md` §4.6).
    pub environment: BTreeMap<String, String>,
    /// Delay between successive `WCONFIGnnnn` lines sent during
    /// `write_config` (`spec.md` §4.3 "rate-limited by a configured
    /// inter-line delay").
    pub acf_inter_line_delay_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            grpc: GrpcSettings::default(),
            storage: StorageSettings::default(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            backplane_id: "X16".to_string(),
            controllers: Vec::new(),
            taps: HashMap::new(),
            bias_sections: HashMap::new(),
            environment: BTreeMap::new(),
            acf_inter_line_delay_ms: 10,
        }
    }
}

/// gRPC listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GrpcSettings {
    /// Address `ArchonControl` listens on, e.g. `"0.0.0.0:4243"`.
    pub bind_addr: String,
}

impl Default for GrpcSettings {
    fn default() -> Self {
        Self { bind_addr: "0.0.0.0:4243".to_string() }
    }
}

/// FITS file storage layout (`SPEC_FULL.md` §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Root directory FITS files and the exposure counter are written under.
    pub directory: PathBuf,
    /// Filename template, substituting `{observatory}`, `{hemisphere}`,
    /// `{controller}`, `{detector}`, and `{exposure}` (`spec.md` §6).
    pub path_template: String,
    /// Site identity substituted for `{observatory}` in [`Self::path_template`].
    pub observatory: String,
    /// Site identity substituted for `{hemisphere}` in [`Self::path_template`].
    pub hemisphere: String,
    /// Whether to append a SHA-256 line to a shared daily checksum sidecar
    /// after every write.
    pub daily_checksum: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./data"),
            path_template: "{controller}_{detector}_{exposure}.fits".to_string(),
            observatory: String::new(),
            hemisphere: String::new(),
            daily_checksum: true,
        }
    }
}

impl StorageSettings {
    /// Path the persisted exposure counter lives at, under [`Self::directory`].
    #[must_use]
    pub fn exposure_counter_path(&self) -> PathBuf {
        self.directory.join(".exposure_counter")
    }

    /// Builds the optional daily checksum sidecar this configuration
    /// describes; `None` when [`Self::daily_checksum`] is `false`.
    #[must_use]
    pub fn checksum_sidecar(&self) -> Option<Arc<DailyChecksumSidecar>> {
        if self.daily_checksum {
            Some(Arc::new(DailyChecksumSidecar::new(self.directory.clone(), true)))
        } else {
            None
        }
    }
}

/// One configured controller: how to reach it, which ACF to load, and which
/// detector regions to crop out of its readout buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Human-readable controller name, used as the orchestrator/gRPC key.
    pub name: String,
    /// TCP host.
    pub host: String,
    /// TCP port (`4242` is the Archon default).
    #[serde(default = "default_archon_port")]
    pub port: u16,
    /// Detector regions sharing this controller's readout buffer.
    pub detectors: Vec<DetectorConfig>,
    /// Path to the ACF file loaded into this controller at startup.
    pub acf_path: PathBuf,
}

fn default_archon_port() -> u16 {
    4242
}

impl ControllerConfig {
    /// Converts this site-configuration entry into the domain descriptor
    /// `archon-client`/`archon-orchestrator` operate on.
    #[must_use]
    pub fn to_descriptor(&self) -> ControllerDescriptor {
        ControllerDescriptor {
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
            detectors: self.detectors.iter().map(DetectorConfig::to_descriptor).collect(),
        }
    }
}

/// One detector region within a controller's readout buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Detector name, e.g. `"red"`.
    pub name: String,
    /// Left edge, inclusive.
    pub x0: u32,
    /// Top edge, inclusive.
    pub y0: u32,
    /// Right edge, exclusive.
    pub x1: u32,
    /// Bottom edge, exclusive.
    pub y1: u32,
    /// Physical sensor tap feeding this region (`A`, `B`, or `C`).
    pub sensor_tap: char,
}

impl DetectorConfig {
    #[must_use]
    fn to_descriptor(&self) -> DetectorDescriptor {
        DetectorDescriptor {
            name: self.name.clone(),
            x0: self.x0,
            y0: self.y0,
            x1: self.x1,
            y1: self.y1,
            sensor_tap: self.sensor_tap,
        }
    }
}

/// Per-tap gain/read-noise characterization (`SPEC_FULL.md` §4.6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TapConfig {
    /// Electrons per ADU.
    pub gain_e_per_adu: f64,
    /// Read noise, in electrons RMS.
    pub read_noise_e: f64,
}

impl From<TapConfig> for TapCharacterization {
    fn from(cfg: TapConfig) -> Self {
        TapCharacterization { gain_e_per_adu: cfg.gain_e_per_adu, read_noise_e: cfg.read_noise_e }
    }
}

/// A detector's overscan/bias region, in cropped-image pixel coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BiasSectionConfig {
    /// Left edge, inclusive.
    pub x0: u32,
    /// Bottom edge, inclusive.
    pub y0: u32,
    /// Right edge, exclusive.
    pub x1: u32,
    /// Top edge, exclusive.
    pub y1: u32,
}

impl From<BiasSectionConfig> for BiasSection {
    fn from(cfg: BiasSectionConfig) -> Self {
        BiasSection { x0: cfg.x0, y0: cfg.y0, x1: cfg.x1, y1: cfg.y1 }
    }
}

impl Settings {
    /// Loads settings from `path` layered over built-in defaults; `None`
    /// runs with defaults alone (an empty controller fleet).
    ///
    /// # Errors
    ///
    /// Returns an error if `path` exists but cannot be parsed as TOML, or if
    /// the merged configuration does not deserialize into [`Settings`].
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut figment = Figment::from(Settings::default());
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        Ok(figment.extract()?)
    }

    /// Builds the `(name -> TapCharacterization)`/`(name -> BiasSection)`
    /// maps [`archon_orchestrator::TapAndBiasConfig`] is constructed from.
    #[must_use]
    pub fn tap_and_bias_config(&self) -> archon_orchestrator::TapAndBiasConfig {
        let taps = self.taps.iter().map(|(name, cfg)| (name.clone(), (*cfg).into())).collect();
        let bias_sections =
            self.bias_sections.iter().map(|(name, cfg)| (name.clone(), (*cfg).into())).collect();
        archon_orchestrator::TapAndBiasConfig::new(taps, bias_sections)
    }
}
