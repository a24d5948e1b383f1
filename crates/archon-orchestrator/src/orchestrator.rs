//! The multi-controller exposure orchestrator (`spec.md` §4.6): drives an
//! exposure across every configured controller as a single operation,
//! persists one FITS file per detector region, and recovers any exposure
//! interrupted mid-write.

use crate::crop::crop_frame;
use crate::error::OrchestratorError;
use crate::header::TapAndBiasConfig;
use crate::paths::FilenamePolicy;
use archon_core::data::{ControllerDescriptor, FetchedFrame};
use archon_core::error::{ArchonError, ArchonResult};
use archon_core::link::ControllerLink;
use archon_core::ports::{Clock, Cotask, EnvironmentalSensorReader, ExposureCounterStore, FitsWriter, ReplySink};
use archon_core::status::{flag, status_names};
use archon_exposure::ExposureEngine;
use archon_storage::lockfile::Lockfile;
use archon_storage::DailyChecksumSidecar;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// One controller's engine plus the descriptor that drives cropping and
/// header composition for its detectors.
struct ControllerUnit<L: ControllerLink> {
    engine: Arc<ExposureEngine<L>>,
    descriptor: ControllerDescriptor,
}

/// Everything the orchestrator needs beyond the controller fleet itself:
/// the injected ports from `spec.md` §9 plus the header/filename policy
/// `SPEC_FULL.md` §4.6 adds.
pub struct OrchestratorPorts {
    /// Persists the monotonic exposure counter across restarts.
    pub counter: Arc<dyn ExposureCounterStore>,
    /// Publishes structured events to operators.
    pub reply_sink: Arc<dyn ReplySink>,
    /// Writes FITS files to durable storage.
    pub fits_writer: Arc<dyn FitsWriter>,
    /// The wall clock, injected for testability.
    pub clock: Arc<dyn Clock>,
    /// Reads ambient environmental sensors for header augmentation.
    pub env_sensor: Arc<dyn EnvironmentalSensorReader>,
    /// Decides where each detector's FITS file is written.
    pub filenames: Arc<dyn FilenamePolicy>,
    /// Optional daily checksum sidecar (`spec.md` §6); `None` disables it
    /// entirely rather than writing with `enabled: false`, since sites that
    /// never configure a checksum directory have nowhere to write one.
    pub checksum: Option<Arc<DailyChecksumSidecar>>,
    /// Side effects run concurrently with integration, across the whole
    /// fleet, once per exposure (`spec.md` §4.6 step 2). Usually empty.
    pub pre_exposure_cotasks: Vec<Arc<dyn Cotask>>,
    /// Side effects run concurrently with readout, across the whole fleet,
    /// once per exposure (`spec.md` §4.6 step 4). Usually empty.
    pub read_cotasks: Vec<Arc<dyn Cotask>>,
}

/// The result of one completed (possibly partially failed at the fetch
/// stage) exposure.
#[derive(Debug, Clone)]
pub struct ExposureOutcome {
    /// The exposure number allocated for this exposure.
    pub exposure_no: u64,
    /// Every FITS file path written.
    pub filenames: Vec<String>,
}

/// Drives a fleet of controllers through the exposure lifecycle and
/// persists the resulting frames.
pub struct ExposureOrchestrator<L: ControllerLink> {
    controllers: HashMap<String, ControllerUnit<L>>,
    ports: OrchestratorPorts,
    software_version: String,
    backplane_id: String,
    tap_and_bias: TapAndBiasConfig,
    exposure_lock: Mutex<()>,
}

impl<L: ControllerLink + 'static> ExposureOrchestrator<L> {
    /// Builds an orchestrator over `controllers`: `(descriptor, engine)`
    /// pairs, one per configured controller.
    #[must_use]
    pub fn new(
        controllers: Vec<(ControllerDescriptor, Arc<ExposureEngine<L>>)>,
        ports: OrchestratorPorts,
        software_version: impl Into<String>,
        backplane_id: impl Into<String>,
        tap_and_bias: TapAndBiasConfig,
    ) -> Self {
        let controllers = controllers
            .into_iter()
            .map(|(descriptor, engine)| (descriptor.name.clone(), ControllerUnit { engine, descriptor }))
            .collect();
        Self {
            controllers,
            ports,
            software_version: software_version.into(),
            backplane_id: backplane_id.into(),
            tap_and_bias,
            exposure_lock: Mutex::new(()),
        }
    }

    /// Every configured controller's name.
    #[must_use]
    pub fn controller_names(&self) -> Vec<&str> {
        self.controllers.keys().map(String::as_str).collect()
    }

    /// Looks up one controller's engine by name, for RPCs that address a
    /// single controller directly (`Fetch`, `WriteConfig`, `ReadConfig`).
    #[must_use]
    pub fn engine(&self, name: &str) -> Option<Arc<ExposureEngine<L>>> {
        self.controllers.get(name).map(|unit| unit.engine.clone())
    }

    /// Resolves `requested` against the configured fleet, per the same
    /// "empty/`None` means every controller" rule [`Self::expose_all`] uses.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::UnknownControllers`] if any requested
    /// name is not configured.
    pub fn resolve(&self, requested: Option<&[String]>) -> Result<Vec<String>, OrchestratorError> {
        self.resolve_targets(requested)
    }

    /// Aborts every in-flight exposure among `targets` (or the whole fleet).
    /// Controllers not currently `EXPOSING` are skipped rather than failed,
    /// since `abort()` is only valid in that state (`spec.md` §4.5).
    pub async fn abort_many(&self, controllers: Option<&[String]>) -> Result<(), OrchestratorError> {
        let targets = self.resolve_targets(controllers)?;
        futures::future::join_all(targets.iter().map(|name| {
            let engine = self.controllers[name].engine.clone();
            async move {
                if engine.status() & flag::EXPOSING != 0 {
                    engine.abort().await?;
                }
                Ok::<(), ArchonError>(())
            }
        }))
        .await
        .into_iter()
        .collect::<Result<Vec<()>, ArchonError>>()?;
        Ok(())
    }

    /// Triggers readout on every targeted controller concurrently, without
    /// fetching or persisting (used when a caller wants to drive readout
    /// independently of [`Self::expose_all`]'s combined flow).
    pub async fn readout_many(&self, controllers: Option<&[String]>) -> Result<(), OrchestratorError> {
        let targets = self.resolve_targets(controllers)?;
        let results: Vec<(String, ArchonResult<()>)> = futures::future::join_all(targets.iter().map(|name| {
            let engine = self.controllers[name].engine.clone();
            let name = name.clone();
            async move { (name, engine.readout().await) }
        }))
        .await;
        let failures: Vec<(String, ArchonError)> =
            results.into_iter().filter_map(|(n, r)| r.err().map(|e| (n, e))).collect();
        if !failures.is_empty() {
            return Err(OrchestratorError::PartialFailure { total: targets.len(), failures });
        }
        Ok(())
    }

    /// Idles every targeted controller's CCD concurrently.
    pub async fn flush_many(&self, controllers: Option<&[String]>, count: u32) -> Result<(), OrchestratorError> {
        let targets = self.resolve_targets(controllers)?;
        let results: Vec<(String, ArchonResult<()>)> = futures::future::join_all(targets.iter().map(|name| {
            let engine = self.controllers[name].engine.clone();
            let name = name.clone();
            async move { (name, engine.flush(count).await) }
        }))
        .await;
        let failures: Vec<(String, ArchonError)> =
            results.into_iter().filter_map(|(n, r)| r.err().map(|e| (n, e))).collect();
        if !failures.is_empty() {
            return Err(OrchestratorError::PartialFailure { total: targets.len(), failures });
        }
        Ok(())
    }

    fn resolve_targets(&self, requested: Option<&[String]>) -> Result<Vec<String>, OrchestratorError> {
        match requested {
            None => Ok(self.controllers.keys().cloned().collect()),
            Some(names) if names.is_empty() => Ok(self.controllers.keys().cloned().collect()),
            Some(names) => {
                let unknown: Vec<String> =
                    names.iter().filter(|n| !self.controllers.contains_key(*n)).cloned().collect();
                if !unknown.is_empty() {
                    return Err(OrchestratorError::UnknownControllers(unknown));
                }
                Ok(names.to_vec())
            }
        }
    }

    /// Drives one exposure across `controllers` (or every controller, if
    /// `None`): broadcasts `expose`, fetches and persists every detector's
    /// frame, and publishes status/frame/filenames events as it goes.
    ///
    /// `spec.md` §8 scenario 3: if any controller's integration fails
    /// (including abort), the rest are aborted and the exposure counter is
    /// **not** advanced — allocation happens only after every targeted
    /// controller reaches `FETCH_PENDING`. `spec.md` §9 open question (b):
    /// once allocated, a later fetch or persist failure leaves the counter
    /// advanced; recovery relies on the lockfile, not a rollback.
    pub async fn expose_all(
        &self,
        controllers: Option<&[String]>,
        integration_cs: u32,
        auto_read: bool,
        extra_header: BTreeMap<String, String>,
    ) -> Result<ExposureOutcome, OrchestratorError> {
        let _guard = self.exposure_lock.lock().await;
        let targets = self.resolve_targets(controllers)?;

        self.ports
            .reply_sink
            .publish(
                "system",
                serde_json::json!({ "controller": "*", "message": "exposure starting", "controllers": targets }),
            )
            .await;

        let environment = self.ports.env_sensor.read().await;

        // `spec.md` §4.6 steps 2/4: pre-exposure and read cotasks run
        // concurrently with the integration+readout window. The orchestrator
        // always drives `expose(auto_read=true)` (step 3), so both windows
        // fall inside this one future; there is no separate readout-only
        // phase to scope read cotasks to more tightly.
        let cotasks: Vec<Arc<dyn Cotask>> = self
            .ports
            .pre_exposure_cotasks
            .iter()
            .cloned()
            .chain(self.ports.read_cotasks.iter().cloned())
            .collect();
        let expose_fut = futures::future::join_all(targets.iter().map(|name| {
            let unit = &self.controllers[name];
            let engine = unit.engine.clone();
            let name = name.clone();
            async move { (name, engine.expose(integration_cs, auto_read).await) }
        }));
        let (cotask_header, expose_results): (BTreeMap<String, String>, Vec<(String, Result<(), ArchonError>)>) =
            tokio::join!(self.run_cotasks(&cotasks), expose_fut);

        let failed: Vec<(String, ArchonError)> = expose_results
            .iter()
            .filter_map(|(name, result)| result.as_ref().err().map(|e| (name.clone(), e.clone())))
            .collect();

        if !failed.is_empty() {
            self.abort_others(&targets, &failed).await;
            self.ports
                .reply_sink
                .publish("error", serde_json::json!({ "controller": "*", "failures": describe(&failed) }))
                .await;
            return Err(OrchestratorError::PartialFailure { total: targets.len(), failures: failed });
        }

        for name in &targets {
            let status = self.controllers[name].engine.status();
            self.publish_status(name, status).await;
        }

        let exposure_no = self
            .ports
            .counter
            .next()
            .await
            .map_err(|e| OrchestratorError::Counter(e.to_string()))?;

        let mut merged_header = cotask_header;
        merged_header.extend(extra_header);
        let filenames = self.fetch_and_persist(exposure_no, &targets, &merged_header, &environment).await?;

        self.ports
            .reply_sink
            .publish("filenames", serde_json::json!({ "controller": "*", "exposure_no": exposure_no, "filenames": filenames }))
            .await;

        Ok(ExposureOutcome { exposure_no, filenames })
    }

    /// Runs every cotask concurrently, merging the header contributions of
    /// those that succeed. A failing cotask is logged and surfaced via the
    /// reply sink rather than aborting the exposure (`spec.md` §4.6 step 2).
    async fn run_cotasks(&self, cotasks: &[Arc<dyn Cotask>]) -> BTreeMap<String, String> {
        let results = futures::future::join_all(cotasks.iter().map(|cotask| {
            let cotask = cotask.clone();
            async move { (cotask.name().to_string(), cotask.run().await) }
        }))
        .await;

        let mut merged = BTreeMap::new();
        for (name, result) in results {
            match result {
                Ok(header) => merged.extend(header),
                Err(e) => {
                    warn!(cotask = %name, error = %e, "cotask failed; exposure continues without its header contribution");
                    self.ports
                        .reply_sink
                        .publish("error", serde_json::json!({ "controller": "*", "cotask": name, "message": e.to_string() }))
                        .await;
                }
            }
        }
        merged
    }

    async fn abort_others(&self, targets: &[String], failed: &[(String, ArchonError)]) {
        let failed_names: Vec<&str> = failed.iter().map(|(n, _)| n.as_str()).collect();
        futures::future::join_all(targets.iter().filter(|name| !failed_names.contains(&name.as_str())).map(|name| {
            let unit = &self.controllers[name];
            let engine = unit.engine.clone();
            async move {
                if engine.status() & flag::EXPOSING != 0 {
                    if let Err(e) = engine.abort().await {
                        warn!(controller = %unit.descriptor.name, error = %e, "abort during partial-failure unwind failed");
                    }
                }
            }
        }))
        .await;
    }

    async fn publish_status(&self, controller: &str, status: u32) {
        let names = status_names(status);
        self.ports
            .reply_sink
            .publish("status", serde_json::json!({ "controller": controller, "status": status, "status_names": names }))
            .await;
    }

    async fn fetch_and_persist(
        &self,
        exposure_no: u64,
        targets: &[String],
        extra_header: &BTreeMap<String, String>,
        environment: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, OrchestratorError> {
        let fetched: Vec<(String, Result<FetchedFrame, ArchonError>)> =
            futures::future::join_all(targets.iter().map(|name| {
                let unit = &self.controllers[name];
                let engine = unit.engine.clone();
                let name = name.clone();
                async move { (name, engine.fetch(None).await) }
            }))
            .await;

        let mut filenames = Vec::new();
        let mut failures = Vec::new();
        for (controller, result) in fetched {
            match result {
                Ok(frame) => {
                    let unit = &self.controllers[&controller];
                    match self.persist_detectors(exposure_no, unit, &frame, extra_header, environment).await {
                        Ok(mut paths) => filenames.append(&mut paths),
                        // Only a hard failure (e.g. the detector's rectangle
                        // does not fit the fetched buffer) reaches here.
                        // `ArchonError::Persist` is handled, and logged and
                        // published, inside `persist_detectors` itself and
                        // never propagates this far (`spec.md` §7: "PersistError
                        // does not fail the exposure").
                        Err(e) => failures.push((controller, e)),
                    }
                }
                Err(e) => failures.push((controller, e)),
            }
        }

        if !failures.is_empty() {
            return Err(OrchestratorError::PartialFailure { total: targets.len(), failures });
        }
        Ok(filenames)
    }

    /// Writes one FITS file per detector region. A write/rename failure
    /// (`ArchonError::Persist`) is logged and published via the reply sink's
    /// `error` key, then skipped rather than propagated: the lockfile
    /// created before the write (`spec.md` §4.6 step 6) is left in place for
    /// `recover` to replay, and the remaining detectors are still attempted.
    /// Only a failure that occurs *before* any lockfile exists — cropping
    /// the detector's rectangle out of the fetched buffer — fails the whole
    /// exposure, since there is nothing for recovery to act on in that case.
    async fn persist_detectors(
        &self,
        exposure_no: u64,
        unit: &ControllerUnit<L>,
        frame: &FetchedFrame,
        extra_header: &BTreeMap<String, String>,
        environment: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, ArchonError> {
        let now = self.ports.clock.now();
        let mut paths = Vec::new();
        for detector in &unit.descriptor.detectors {
            let cropped = crop_frame(frame, detector)?;
            let ctx = self.tap_and_bias.context_for(detector, &self.backplane_id);
            let mut header = archon_storage::header::build_detector_header(
                exposure_no,
                &unit.descriptor.name,
                &cropped.geometry,
                now,
                &self.software_version,
                &ctx,
                environment,
            );
            for (k, v) in extra_header {
                header.insert(k.clone(), v.clone());
            }

            let target_path = self.ports.filenames.path_for(exposure_no, &unit.descriptor.name, &detector.name);
            match self
                .persist_one_detector(exposure_no, &unit.descriptor.name, &detector.name, &target_path, &cropped, &header, now)
                .await
            {
                Ok(()) => paths.push(target_path),
                Err(e) => {
                    warn!(controller = %unit.descriptor.name, detector = %detector.name, path = %target_path, error = %e, "persist failed; lockfile retained for recovery");
                    self.ports
                        .reply_sink
                        .publish(
                            "error",
                            serde_json::json!({
                                "controller": unit.descriptor.name,
                                "detector": detector.name,
                                "exposure_no": exposure_no,
                                "path": target_path,
                                "message": e.to_string(),
                            }),
                        )
                        .await;
                }
            }
        }
        Ok(paths)
    }

    /// Brackets one detector's write with its lockfile: create -> write ->
    /// remove -> optional checksum. Returns [`ArchonError::Persist`] on any
    /// failure of the create/write/remove sequence.
    #[allow(clippy::too_many_arguments)]
    async fn persist_one_detector(
        &self,
        exposure_no: u64,
        controller: &str,
        detector: &str,
        target_path: &str,
        cropped: &FetchedFrame,
        header: &BTreeMap<String, String>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), ArchonError> {
        let lock = Lockfile {
            exposure_no,
            controller: controller.to_string(),
            detector: Some(detector.to_string()),
            target_path: target_path.to_string(),
            started_at: now,
            frame: cropped.clone(),
            header: header.clone(),
        };
        lock.create().await.map_err(|e| persist_err(exposure_no, controller, detector, e))?;
        self.ports
            .fits_writer
            .write(target_path, cropped, header)
            .await
            .map_err(|e| persist_err(exposure_no, controller, detector, e))?;
        Lockfile::remove(target_path)
            .await
            .map_err(|e| persist_err(exposure_no, controller, detector, e))?;
        if let Some(checksum) = &self.ports.checksum {
            if let Err(e) = checksum.record(now, target_path, cropped).await {
                warn!(path = %target_path, error = %e, "checksum sidecar write failed; frame is already persisted");
            }
        }
        info!(controller, detector, path = %target_path, "wrote frame");
        Ok(())
    }

    /// Recovers every lockfile found directly under `dir`: re-writes each
    /// embedded frame to its recorded target path and removes the
    /// lockfile. Malformed lockfiles are logged and skipped rather than
    /// failing the whole pass. `spec.md` §4.6 "Recovery".
    pub async fn recover(&self, dir: &Path) -> Result<Vec<String>, OrchestratorError> {
        let found = Lockfile::scan_dir(dir).await?;
        let mut recovered = Vec::new();
        for entry in found {
            let lock = match entry {
                Ok(lock) => lock,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable lockfile during recovery");
                    continue;
                }
            };
            self.ports
                .fits_writer
                .write(&lock.target_path, &lock.frame, &lock.header)
                .await
                .map_err(|e| OrchestratorError::Persist {
                    exposure_no: lock.exposure_no,
                    controller: lock.controller.clone(),
                    detector: lock.detector.clone().unwrap_or_default(),
                    message: e.to_string(),
                })?;
            Lockfile::remove(&lock.target_path).await?;
            info!(path = %lock.target_path, exposure_no = lock.exposure_no, "recovered frame from lockfile");
            recovered.push(lock.target_path);
        }
        Ok(recovered)
    }

    /// Cancels any in-flight exposure on every controller and returns the
    /// fleet to `IDLE` (`spec.md` §4.6 "Cancellation").
    pub async fn reset_all(&self) {
        futures::future::join_all(self.controllers.values().map(|unit| {
            let engine = unit.engine.clone();
            async move {
                if engine.status() & flag::EXPOSING != 0 {
                    let _ = engine.abort().await;
                }
                engine.reset().await;
            }
        }))
        .await;
    }
}

fn persist_err(exposure_no: u64, controller: &str, detector: &str, source: impl std::fmt::Display) -> ArchonError {
    ArchonError::Persist {
        exposure_no,
        controller: controller.to_string(),
        message: format!("detector {detector}: {source}"),
    }
}

fn describe(failures: &[(String, ArchonError)]) -> String {
    failures.iter().map(|(n, e)| format!("{n}: {e}")).collect::<Vec<_>>().join(", ")
}
