//! Injected ports: reply sink, FITS writer, clock, environmental sensor
//! reader, and exposure-counter store.
//!
//! `spec.md` §9: "Reply sink, FITS writer, clock, environmental sensor
//! reader, and exposure-counter store should be behind narrow interfaces so
//! the core can be unit-tested against in-memory fakes." These traits are
//! the seam; `archon-storage` and `archon-server` provide the real
//! implementations (filesystem FITS writer + lockfiles, a system clock, a
//! tonic-backed reply sink), while `archon-orchestrator`'s tests use
//! in-memory fakes implementing the same traits — the same shape as the
//! teacher's `Commandable`/`Readable` capability traits in
//! `daq_core::capabilities`.

use crate::data::{FetchedFrame, Geometry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

/// Publishes structured key/value events to operators (`spec.md` §6).
///
/// Every event carries at least a `controller` field; the core only asserts
/// the key/value contract described in `spec.md` §6, never a wire format.
#[async_trait]
pub trait ReplySink: Send + Sync {
    /// Publishes one event under `key` (e.g. `"status"`, `"frame"`,
    /// `"error"`, `"filenames"`) with the given structured payload.
    async fn publish(&self, key: &str, payload: Value);
}

/// Persists one frame + header pair to durable storage.
///
/// `spec.md` §4.6 step 6: each write is bracketed by a sidecar lockfile
/// (created before this is called) and a temp-path-then-rename sequence
/// implemented inside the writer so the rename is atomic on the target
/// filesystem.
#[async_trait]
pub trait FitsWriter: Send + Sync {
    /// Writes `frame` and `header` to `path`, creating parent directories as
    /// needed. Must write to a temporary path in the same directory as
    /// `path` and rename into place, never leaving a partial file visible
    /// under `path`.
    async fn write(
        &self,
        path: &str,
        frame: &FetchedFrame,
        header: &BTreeMap<String, String>,
    ) -> anyhow::Result<()>;
}

/// The current wall-clock time, injected so tests can control it.
pub trait Clock: Send + Sync {
    /// Returns the current UTC time.
    fn now(&self) -> DateTime<Utc>;
}

/// The real-time system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Reads ambient environmental sensors (dome temperature, humidity, ...)
/// for inclusion in FITS headers. Optional: implementations may return an
/// empty map when no sensors are configured.
#[async_trait]
pub trait EnvironmentalSensorReader: Send + Sync {
    /// Reads the current environmental sensor values, keyed by FITS header
    /// keyword.
    async fn read(&self) -> BTreeMap<String, String>;
}

/// An injected side effect registered to run concurrently with an
/// exposure's integration or readout window (`spec.md` §4.5 "pre-exposure
/// and read cotasks"; §4.6 steps 2/4). A cotask might poll a guider, log
/// tip-tilt telemetry, or capture anything else an operator wants folded
/// into the resulting FITS header without blocking the exposure itself.
///
/// A cotask may fail without aborting the exposure (`spec.md` §4.6 step 2);
/// the orchestrator surfaces the failure through the reply sink and simply
/// omits that cotask's header contribution, the same "optional, narrow,
/// logged-not-fatal" shape as the teacher's `DeviceLifecycle` hooks in
/// `hardware::registry`.
#[async_trait]
pub trait Cotask: Send + Sync {
    /// A short name identifying this cotask in surfaced failures and logs.
    fn name(&self) -> &str;

    /// Runs the side effect, returning FITS header keyword/value pairs to
    /// merge into every detector header for the exposure it ran alongside.
    async fn run(&self) -> anyhow::Result<BTreeMap<String, String>>;
}

/// Persists and allocates the monotonic exposure counter (`spec.md` §6).
#[async_trait]
pub trait ExposureCounterStore: Send + Sync {
    /// Atomically increments and returns the next exposure number, reading
    /// the previous value from durable storage first if this is the first
    /// call in the process.
    async fn next(&self) -> anyhow::Result<u64>;

    /// The last allocated exposure number without allocating a new one, for
    /// status reporting (`spec.md` §6 `last_exposure_no`).
    async fn current(&self) -> anyhow::Result<u64>;
}

/// Computes a default FITS header for one detector region, merging in
/// caller-supplied extras. Kept as a free function rather than a port:
/// unlike the above, this has no external state to inject, but it is the
/// one piece of header-building logic every [`FitsWriter`] implementation
/// needs, so it lives next to the port traits.
#[must_use]
pub fn default_header(
    exposure_no: u64,
    controller: &str,
    detector: &str,
    geometry: &Geometry,
    exposed_at: DateTime<Utc>,
    software_version: &str,
    extras: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut header = BTreeMap::new();
    header.insert("EXPNUM".to_string(), exposure_no.to_string());
    header.insert("CONTROLL".to_string(), controller.to_string());
    header.insert("DETECTOR".to_string(), detector.to_string());
    header.insert("DATE-OBS".to_string(), exposed_at.to_rfc3339());
    header.insert("NAXIS1".to_string(), geometry.pixels.to_string());
    header.insert("NAXIS2".to_string(), geometry.lines.to_string());
    header.insert("PRESKPL".to_string(), geometry.pre_skip_lines.to_string());
    header.insert("PRESKPP".to_string(), geometry.pre_skip_pixels.to_string());
    header.insert("POSTSKPL".to_string(), geometry.post_skip_lines.to_string());
    header.insert("POSTSKPP".to_string(), geometry.post_skip_pixels.to_string());
    header.insert("OVRSCANL".to_string(), geometry.overscan_lines.to_string());
    header.insert("OVRSCANP".to_string(), geometry.overscan_pixels.to_string());
    header.insert("CBIN".to_string(), geometry.horizontal_binning.to_string());
    header.insert("RBIN".to_string(), geometry.vertical_binning.to_string());
    header.insert("SWVER".to_string(), software_version.to_string());
    for (k, v) in extras {
        header.insert(k.clone(), v.clone());
    }
    header
}
