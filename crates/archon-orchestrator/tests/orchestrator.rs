//! End-to-end exercises of [`ExposureOrchestrator`] against in-memory
//! fakes, covering the `spec.md` §8 multi-controller scenarios this crate
//! owns: synchronized two-controller exposure, partial-fleet abort leaving
//! the exposure counter unadvanced, and lockfile recovery after a
//! simulated crash.

use archon_acf::document::AcfDocument;
use archon_acf::manager::AcfManager;
use archon_core::data::{BufferDescriptor, ControllerDescriptor, DetectorDescriptor};
use archon_core::error::ArchonError;
use archon_core::link::ControllerLink;
use archon_core::ports::{Clock, Cotask, EnvironmentalSensorReader, ExposureCounterStore, FitsWriter, ReplySink};
use archon_core::status::{flag, StatusFlags};
use archon_exposure::{EngineConfig, ExposureEngine};
use archon_orchestrator::{ExposureOrchestrator, OrchestratorError, OrchestratorPorts, TapAndBiasConfig, TemplateFilenamePolicy};
use archon_storage::FilesystemFitsWriter;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::{broadcast, mpsc};

const ACF_TEXT: &str = "[CONFIG]\n\
PARAMETER0=DoFlush=0\n\
PARAMETER1=IntMS=0\n\
PARAMETER2=Exposures=0\n\
PARAMETER3=ReadOut=0\n\
PARAMETER4=AbortExposure=0\n\
PARAMETER5=FlushCount=0\n\
PARAMETER6=Lines=100\n\
PARAMETER7=Pixels=100\n\
PARAMETER8=TapLines=1\n\
PARAMETER9=TapLine0=A,100\n";

struct FakeLink {
    name: String,
    status_replies: StdMutex<Vec<String>>,
    frame_replies: StdMutex<Vec<Vec<BufferDescriptor>>>,
    fetch_payload: StdMutex<Vec<u8>>,
    nak_on: StdMutex<Vec<String>>,
    bits: AtomicU32,
    tx: broadcast::Sender<StatusFlags>,
}

impl FakeLink {
    fn new(name: &str, status_replies: Vec<String>, frame_replies: Vec<Vec<BufferDescriptor>>, fetch_payload: Vec<u8>) -> Self {
        let (tx, _rx) = broadcast::channel(16);
        Self {
            name: name.to_string(),
            status_replies: StdMutex::new(status_replies),
            frame_replies: StdMutex::new(frame_replies),
            fetch_payload: StdMutex::new(fetch_payload),
            nak_on: StdMutex::new(Vec::new()),
            bits: AtomicU32::new(flag::IDLE),
            tx,
        }
    }

    fn take_status(&self) -> String {
        let mut scripted = self.status_replies.lock().unwrap();
        if scripted.len() > 1 {
            scripted.remove(0)
        } else {
            scripted.first().cloned().unwrap_or_default()
        }
    }

    fn take_frame(&self) -> Vec<BufferDescriptor> {
        let mut scripted = self.frame_replies.lock().unwrap();
        if scripted.len() > 1 {
            scripted.remove(0)
        } else {
            scripted.first().cloned().unwrap_or_default()
        }
    }

    fn set_nak_on(&self, commands: Vec<String>) {
        *self.nak_on.lock().unwrap() = commands;
    }
}

#[async_trait]
impl ControllerLink for FakeLink {
    fn controller_name(&self) -> &str {
        &self.name
    }

    async fn send(&self, text: &str, _timeout: Option<Duration>, _unique: bool) -> archon_core::error::ArchonResult<String> {
        if self.nak_on.lock().unwrap().iter().any(|n| n == text) {
            return Err(ArchonError::CommandFailed { controller: self.name.clone(), command: text.to_string() });
        }
        if text == "STATUS" {
            return Ok(self.take_status());
        }
        Ok(String::new())
    }

    async fn poll_frame(&self) -> archon_core::error::ArchonResult<Vec<BufferDescriptor>> {
        Ok(self.take_frame())
    }

    async fn stream_fetch(
        &self,
        _buffer_index: u8,
        _expected_len: usize,
    ) -> archon_core::error::ArchonResult<mpsc::Receiver<archon_core::error::ArchonResult<Bytes>>> {
        let (tx, rx) = mpsc::channel(1);
        let payload = self.fetch_payload.lock().unwrap().clone();
        tx.send(Ok(Bytes::from(payload))).await.ok();
        Ok(rx)
    }

    fn status(&self) -> StatusFlags {
        self.bits.load(Ordering::SeqCst)
    }

    fn subscribe_status(&self) -> (StatusFlags, broadcast::Receiver<StatusFlags>) {
        (self.status(), self.tx.subscribe())
    }

    fn update_status(&self, flags: StatusFlags, on: bool) {
        let next = archon_core::status::apply(self.status(), flags, on);
        self.bits.store(next, Ordering::SeqCst);
        let _ = self.tx.send(next);
    }

    fn set_status_exact(&self, flags: StatusFlags) {
        self.bits.store(flags, Ordering::SeqCst);
        let _ = self.tx.send(flags);
    }
}

fn complete_buffer(frame_number: u64) -> BufferDescriptor {
    BufferDescriptor { index: 1, complete: true, frame_number, width: 100, height: 100, bit_width: 16, timestamp_raw: 0 }
}

fn descriptor(name: &str) -> ControllerDescriptor {
    ControllerDescriptor {
        name: name.to_string(),
        host: "127.0.0.1".to_string(),
        port: 4242,
        detectors: vec![DetectorDescriptor { name: format!("{name}_det"), x0: 0, y0: 0, x1: 100, y1: 100, sensor_tap: 'A' }],
    }
}

fn engine_for(link: Arc<FakeLink>) -> Arc<ExposureEngine<FakeLink>> {
    let doc = AcfDocument::parse(ACF_TEXT).unwrap();
    let acf = AcfManager::new(link.clone(), doc, Duration::ZERO);
    Arc::new(ExposureEngine::new(link, acf, EngineConfig { poll_interval: Duration::from_millis(2) }))
}

#[derive(Default)]
struct RecordingReplySink {
    events: StdMutex<Vec<(String, Value)>>,
}

#[async_trait]
impl ReplySink for RecordingReplySink {
    async fn publish(&self, key: &str, payload: Value) {
        self.events.lock().unwrap().push((key.to_string(), payload));
    }
}

struct FixedClock;

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

struct EmptyEnvironment;

#[async_trait]
impl EnvironmentalSensorReader for EmptyEnvironment {
    async fn read(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

struct CountingCounter(AtomicU64);

#[async_trait]
impl ExposureCounterStore for CountingCounter {
    async fn next(&self) -> anyhow::Result<u64> {
        Ok(self.0.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn current(&self) -> anyhow::Result<u64> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

fn ports(dir: &std::path::Path, counter: Arc<CountingCounter>) -> OrchestratorPorts {
    OrchestratorPorts {
        counter,
        reply_sink: Arc::new(RecordingReplySink::default()),
        fits_writer: Arc::new(FilesystemFitsWriter::new()),
        clock: Arc::new(FixedClock),
        env_sensor: Arc::new(EmptyEnvironment),
        filenames: Arc::new(TemplateFilenamePolicy::new(dir, "{controller}_{detector}_{exposure}.fits")),
        checksum: None,
        pre_exposure_cotasks: Vec::new(),
        read_cotasks: Vec::new(),
    }
}

#[tokio::test]
async fn two_controller_exposure_writes_both_files_and_advances_the_counter() {
    let dir = tempdir().unwrap();
    let payload = vec![0xABu8; 100 * 100 * 2];
    let link1 = Arc::new(FakeLink::new("ccd1", vec!["EXPOSURES=0".to_string()], vec![Vec::new(), vec![complete_buffer(5)]], payload.clone()));
    let link2 = Arc::new(FakeLink::new("ccd2", vec!["EXPOSURES=0".to_string()], vec![Vec::new(), vec![complete_buffer(5)]], payload));

    let counter = Arc::new(CountingCounter(AtomicU64::new(0)));
    let orchestrator = ExposureOrchestrator::new(
        vec![(descriptor("ccd1"), engine_for(link1)), (descriptor("ccd2"), engine_for(link2))],
        ports(dir.path(), counter),
        "0.1.0",
        "X16",
        TapAndBiasConfig::default(),
    );

    let outcome = orchestrator.expose_all(None, 600, true, BTreeMap::new()).await.unwrap();
    assert_eq!(outcome.exposure_no, 1);
    assert_eq!(outcome.filenames.len(), 2);
    for path in &outcome.filenames {
        assert!(std::path::Path::new(path).exists());
    }
}

struct FixedHeaderCotask {
    name: &'static str,
    keyword: &'static str,
    value: &'static str,
}

#[async_trait]
impl Cotask for FixedHeaderCotask {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(&self) -> anyhow::Result<BTreeMap<String, String>> {
        let mut header = BTreeMap::new();
        header.insert(self.keyword.to_string(), self.value.to_string());
        Ok(header)
    }
}

struct FailingCotask;

#[async_trait]
impl Cotask for FailingCotask {
    fn name(&self) -> &str {
        "failing"
    }

    async fn run(&self) -> anyhow::Result<BTreeMap<String, String>> {
        Err(anyhow::anyhow!("guider offline"))
    }
}

#[tokio::test]
async fn cotask_header_contributions_are_merged_into_every_detector_header() {
    let dir = tempdir().unwrap();
    let payload = vec![0xABu8; 100 * 100 * 2];
    let link = Arc::new(FakeLink::new("ccd1", vec!["EXPOSURES=0".to_string()], vec![Vec::new(), vec![complete_buffer(5)]], payload));

    let counter = Arc::new(CountingCounter(AtomicU64::new(0)));
    let mut ports = ports(dir.path(), counter);
    ports.pre_exposure_cotasks = vec![Arc::new(FixedHeaderCotask { name: "guider", keyword: "GUIDERMS", value: "0.12" })];
    ports.read_cotasks = vec![Arc::new(FailingCotask)];
    let orchestrator =
        ExposureOrchestrator::new(vec![(descriptor("ccd1"), engine_for(link))], ports, "0.1.0", "X16", TapAndBiasConfig::default());

    let outcome = orchestrator.expose_all(None, 600, true, BTreeMap::new()).await.unwrap();
    assert_eq!(outcome.filenames.len(), 1);

    let written = std::fs::read(&outcome.filenames[0]).unwrap();
    let text = String::from_utf8_lossy(&written);
    assert!(text.contains("GUIDERMS"), "successful cotask's header contribution should reach the written file");
}

#[tokio::test]
async fn one_controller_failing_integration_aborts_the_other_and_does_not_advance_the_counter() {
    let dir = tempdir().unwrap();
    let link1 = Arc::new(FakeLink::new("ccd1", vec!["EXPOSURES=0".to_string()], vec![Vec::new()], Vec::new()));
    link1.set_nak_on(vec!["STATUS".to_string()]);

    let long_status: Vec<String> = std::iter::repeat("EXPOSURES=1".to_string()).take(200).collect();
    let link2 = Arc::new(FakeLink::new("ccd2", long_status, vec![Vec::new()], Vec::new()));

    let counter = Arc::new(CountingCounter(AtomicU64::new(0)));
    let orchestrator = Arc::new(ExposureOrchestrator::new(
        vec![(descriptor("ccd1"), engine_for(link1.clone())), (descriptor("ccd2"), engine_for(link2.clone()))],
        ports(dir.path(), counter.clone()),
        "0.1.0",
        "X16",
        TapAndBiasConfig::default(),
    ));

    let err = orchestrator.expose_all(None, 6_000, false, BTreeMap::new()).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::PartialFailure { .. }));
    assert_eq!(counter.current().await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(link2.status(), flag::IDLE);
}

#[tokio::test]
async fn recover_replays_a_lockfile_left_behind_by_a_simulated_crash() {
    let dir = tempdir().unwrap();
    let link1 = Arc::new(FakeLink::new("ccd1", vec!["EXPOSURES=0".to_string()], vec![Vec::new()], Vec::new()));
    let counter = Arc::new(CountingCounter(AtomicU64::new(0)));
    let orchestrator = ExposureOrchestrator::new(
        vec![(descriptor("ccd1"), engine_for(link1))],
        ports(dir.path(), counter),
        "0.1.0",
        "X16",
        TapAndBiasConfig::default(),
    );

    let target = dir.path().join("ccd1_ccd1_det_00001.fits").to_string_lossy().to_string();
    let lock = archon_storage::lockfile::Lockfile {
        exposure_no: 1,
        controller: "ccd1".to_string(),
        detector: Some("ccd1_det".to_string()),
        target_path: target.clone(),
        started_at: Utc::now(),
        frame: archon_core::data::FetchedFrame {
            controller: "ccd1".to_string(),
            data: archon_core::data::FrameData::U16(vec![7u16; 4]),
            width: 2,
            height: 2,
            geometry: archon_core::data::Geometry::default(),
        },
        header: BTreeMap::new(),
    };
    lock.create().await.unwrap();

    let recovered = orchestrator.recover(dir.path()).await.unwrap();
    assert_eq!(recovered, vec![target.clone()]);
    assert!(std::path::Path::new(&target).exists());
    assert!(!archon_storage::lockfile::Lockfile::path_for(&target).exists());
}

#[tokio::test]
async fn reset_all_returns_an_exposing_controller_to_idle() {
    let dir = tempdir().unwrap();
    let long_status: Vec<String> = std::iter::repeat("EXPOSURES=1".to_string()).take(200).collect();
    let link = Arc::new(FakeLink::new("ccd1", long_status, vec![Vec::new()], Vec::new()));
    let counter = Arc::new(CountingCounter(AtomicU64::new(0)));
    let engine = engine_for(link.clone());
    let orchestrator = Arc::new(ExposureOrchestrator::new(
        vec![(descriptor("ccd1"), engine)],
        ports(dir.path(), counter),
        "0.1.0",
        "X16",
        TapAndBiasConfig::default(),
    ));

    let runner = orchestrator.clone();
    let handle = tokio::spawn(async move { runner.expose_all(None, 6_000, false, BTreeMap::new()).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(link.status() & flag::EXPOSING, flag::EXPOSING);

    orchestrator.reset_all().await;
    let result = handle.await.unwrap();
    assert!(result.is_err());
    assert_eq!(link.status(), flag::IDLE);
}
