//! `archond`: connects to every configured Archon controller, composes the
//! exposure orchestrator over the filesystem/gRPC ports, and serves
//! `ArchonControl` until interrupted (`spec.md` §1/§6).

mod cli;
mod config;
mod environment;
mod events;
mod logging;
mod service;

use archon_acf::document::AcfDocument;
use archon_acf::manager::AcfManager;
use archon_client::{ConnectOptions, ControllerClient};
use archon_core::data::ControllerDescriptor;
use archon_core::ports::{ExposureCounterStore, ReplySink, SystemClock};
use archon_exposure::{EngineConfig, ExposureEngine};
use archon_orchestrator::{ExposureOrchestrator, OrchestratorPorts};
use archon_proto::archon::archon_control_server::ArchonControlServer;
use clap::Parser;
use cli::{Cli, Command};
use config::{ControllerConfig, Settings};
use environment::StaticEnvironmentalSensorReader;
use events::EventBus;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::Server;
use tracing::{error, info, warn};

type ControllerFleet = Vec<(ControllerDescriptor, Arc<ExposureEngine<ControllerClient>>)>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("loading configuration: {e}");
            std::process::exit(2);
        }
    };
    logging::init(&settings.log_level);

    let result = match cli.command {
        Command::Serve => serve(settings).await,
        Command::Recover { directory } => recover(settings, directory).await,
        Command::Reset => reset(settings).await,
    };

    if let Err(e) = result {
        error!(error = %e, "archond exiting with an error");
        std::process::exit(exit_code_for(&e));
    }
}

/// Maps a top-level failure to the exit-code categories `spec.md` §7
/// requires (2 = user/caller error, 3 = device error), falling back to 1
/// for failures with no narrower classification (e.g. reading the ACF
/// file off disk, a malformed gRPC bind address).
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(e) = err.downcast_ref::<archon_orchestrator::OrchestratorError>() {
        return e.exit_code();
    }
    if let Some(e) = err.downcast_ref::<archon_core::error::ArchonError>() {
        return e.exit_code();
    }
    1
}

/// Connects to every controller in `settings`, loading and streaming its
/// ACF, and returns the engines the orchestrator will drive.
///
/// # Errors
///
/// Fails on the first controller that cannot be connected to or whose ACF
/// cannot be read/parsed; `archond` has no partial-fleet startup mode.
async fn connect_fleet(settings: &Settings) -> anyhow::Result<ControllerFleet> {
    let inter_line_delay = Duration::from_millis(settings.acf_inter_line_delay_ms);
    let mut fleet = Vec::with_capacity(settings.controllers.len());
    for controller in &settings.controllers {
        let descriptor = controller.to_descriptor();
        info!(controller = %descriptor.name, host = %descriptor.host, port = descriptor.port, "connecting");
        let client = ControllerClient::connect(descriptor.clone(), ConnectOptions::default()).await?;
        let document = load_acf(controller).await?;
        let acf = AcfManager::new(client.clone(), document, inter_line_delay);
        let engine = ExposureEngine::new(client, acf, EngineConfig::default());
        fleet.push((descriptor, Arc::new(engine)));
    }
    Ok(fleet)
}

async fn load_acf(controller: &ControllerConfig) -> anyhow::Result<AcfDocument> {
    let text = tokio::fs::read_to_string(&controller.acf_path).await.map_err(|e| {
        anyhow::anyhow!("reading ACF file {} for controller '{}': {e}", controller.acf_path.display(), controller.name)
    })?;
    AcfDocument::parse(&text)
        .map_err(|e| anyhow::anyhow!("parsing ACF file {} for controller '{}': {e}", controller.acf_path.display(), controller.name))
}

fn build_ports(settings: &Settings, events: Arc<EventBus>) -> OrchestratorPorts {
    let reply_sink: Arc<dyn ReplySink> = events;
    OrchestratorPorts {
        counter: Arc::new(archon_storage::FileExposureCounterStore::new(settings.storage.exposure_counter_path())),
        reply_sink,
        fits_writer: Arc::new(archon_storage::FilesystemFitsWriter::new()),
        clock: Arc::new(SystemClock),
        env_sensor: Arc::new(StaticEnvironmentalSensorReader::new(settings.environment.clone())),
        filenames: Arc::new(
            archon_orchestrator::TemplateFilenamePolicy::new(
                settings.storage.directory.clone(),
                settings.storage.path_template.clone(),
            )
            .with_site(settings.storage.observatory.clone(), settings.storage.hemisphere.clone()),
        ),
        checksum: settings.storage.checksum_sidecar(),
        // No site has registered a cotask implementation in this pack; the
        // port exists so one can be wired in here without touching the
        // orchestrator.
        pre_exposure_cotasks: Vec::new(),
        read_cotasks: Vec::new(),
    }
}

async fn serve(settings: Settings) -> anyhow::Result<()> {
    let fleet = connect_fleet(&settings).await?;
    let events = Arc::new(EventBus::new());
    let ports = build_ports(&settings, events.clone());
    let orchestrator = ExposureOrchestrator::new(
        fleet,
        ports,
        settings.software_version.clone(),
        settings.backplane_id.clone(),
        settings.tap_and_bias_config(),
    );

    // `spec.md` §4.6 "Recovery": replay any lockfiles left behind by a
    // prior crash before accepting new exposure requests.
    match orchestrator.recover(&settings.storage.directory).await {
        Ok(recovered) if !recovered.is_empty() => {
            info!(count = recovered.len(), "recovered frames from lockfiles found at startup");
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "startup lockfile recovery failed; retry with the `recover` command"),
    }

    let addr = settings.grpc.bind_addr.parse()?;
    let service = service::ArchonControlService::new(orchestrator, events, settings.storage.directory.clone());
    info!(addr = %addr, "serving ArchonControl");
    Server::builder()
        .add_service(ArchonControlServer::new(service))
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;
    Ok(())
}

async fn recover(settings: Settings, directory: Option<PathBuf>) -> anyhow::Result<()> {
    let dir = directory.unwrap_or_else(|| settings.storage.directory.clone());
    let events = Arc::new(EventBus::new());
    let ports = build_ports(&settings, events.clone());
    // Recovery only touches the injected `FitsWriter`/lockfile ports; no
    // controller needs to be reachable to replay a crash-interrupted write.
    let orchestrator: ExposureOrchestrator<ControllerClient> = ExposureOrchestrator::new(
        ControllerFleet::new(),
        ports,
        settings.software_version.clone(),
        settings.backplane_id.clone(),
        settings.tap_and_bias_config(),
    );
    let recovered = orchestrator.recover(&dir).await?;
    info!(count = recovered.len(), directory = %dir.display(), "recovery complete");
    for path in &recovered {
        println!("{path}");
    }
    Ok(())
}

async fn reset(settings: Settings) -> anyhow::Result<()> {
    let fleet = connect_fleet(&settings).await?;
    let names: Vec<String> = fleet.iter().map(|(d, _)| d.name.clone()).collect();
    let events = Arc::new(EventBus::new());
    let ports = build_ports(&settings, events);
    let orchestrator = ExposureOrchestrator::new(
        fleet,
        ports,
        settings.software_version.clone(),
        settings.backplane_id.clone(),
        settings.tap_and_bias_config(),
    );
    orchestrator.reset_all().await;
    let counter = orchestrator_exposure_counter(&settings).await?;
    info!(controllers = ?names, last_exposure_no = counter, "fleet reset to IDLE");
    Ok(())
}

async fn orchestrator_exposure_counter(settings: &Settings) -> anyhow::Result<u64> {
    let store = archon_storage::FileExposureCounterStore::new(settings.storage.exposure_counter_path());
    Ok(store.current().await?)
}
