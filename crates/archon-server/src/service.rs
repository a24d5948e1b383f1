//! The `ArchonControl` gRPC composition root: translates RPC calls into
//! [`ExposureOrchestrator`]/[`ExposureEngine`] operations and maps the core
//! error taxonomy onto `tonic::Status` (`SPEC_FULL.md` §6 "reply sink port").

use crate::events::EventBus;
use archon_core::error::ArchonError;
use archon_core::link::ControllerLink;
use archon_exposure::ExposureEngine;
use archon_orchestrator::{ExposureOrchestrator, OrchestratorError};
use archon_proto::archon::archon_control_server::ArchonControl;
use archon_proto::archon::{
    AbortReply, AbortRequest, Event, ExposeReply, ExposeRequest, FetchReply, FetchRequest, FlushReply,
    FlushRequest, ReadConfigReply, ReadConfigRequest, ReadoutReply, ReadoutRequest, RecoverReply, RecoverRequest,
    ResetReply, ResetRequest, SubscribeEventsRequest, WriteConfigReply, WriteConfigRequest,
};
use archon_proto::convert::fetched_frame_to_reply;
use futures::Stream;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status};

/// The `ArchonControl` service implementation, generic over the concrete
/// [`ControllerLink`] so tests can run it against an in-memory fake instead
/// of a real TCP connection (mirrors `archon-orchestrator`'s own genericity).
pub struct ArchonControlService<L: ControllerLink> {
    orchestrator: ExposureOrchestrator<L>,
    events: std::sync::Arc<EventBus>,
    default_recover_dir: PathBuf,
}

impl<L: ControllerLink + 'static> ArchonControlService<L> {
    /// Builds the service over an already-constructed orchestrator.
    #[must_use]
    pub fn new(
        orchestrator: ExposureOrchestrator<L>,
        events: std::sync::Arc<EventBus>,
        default_recover_dir: PathBuf,
    ) -> Self {
        Self { orchestrator, events, default_recover_dir }
    }

    fn engine_or_status(&self, name: &str) -> Result<std::sync::Arc<ExposureEngine<L>>, Status> {
        self.orchestrator
            .engine(name)
            .ok_or_else(|| Status::not_found(format!("unknown controller '{name}'")))
    }
}

fn archon_err_to_status(err: &ArchonError) -> Status {
    match err {
        ArchonError::InvalidState { .. } => Status::failed_precondition(err.to_string()),
        ArchonError::Config(_) => Status::invalid_argument(err.to_string()),
        ArchonError::CommandFailed { .. } | ArchonError::Timeout { .. } => Status::deadline_exceeded(err.to_string()),
        ArchonError::Aborted { .. } => Status::cancelled(err.to_string()),
        ArchonError::Protocol { .. } | ArchonError::Disconnected { .. } | ArchonError::Device { .. } => {
            Status::unavailable(err.to_string())
        }
        ArchonError::Fetch { .. } | ArchonError::Persist { .. } => Status::internal(err.to_string()),
    }
}

fn orchestrator_err_to_status(err: OrchestratorError) -> Status {
    match err {
        OrchestratorError::Controller(e) => archon_err_to_status(&e),
        OrchestratorError::UnknownControllers(names) => {
            Status::not_found(format!("unknown controller(s): {names:?}"))
        }
        OrchestratorError::PartialFailure { .. } => Status::aborted(err.to_string()),
        OrchestratorError::Lockfile(_) | OrchestratorError::Persist { .. } | OrchestratorError::Counter(_) => {
            Status::internal(err.to_string())
        }
    }
}

fn controllers_arg(controllers: &[String]) -> Option<&[String]> {
    Some(controllers)
}

#[tonic::async_trait]
impl<L: ControllerLink + 'static> ArchonControl for ArchonControlService<L> {
    async fn expose(&self, request: Request<ExposeRequest>) -> Result<Response<ExposeReply>, Status> {
        let req = request.into_inner();
        let extra_header: BTreeMap<String, String> = req.extra_header.into_iter().collect();
        let outcome = self
            .orchestrator
            .expose_all(controllers_arg(&req.controllers), req.integration_cs, req.auto_read, extra_header)
            .await
            .map_err(orchestrator_err_to_status)?;
        Ok(Response::new(ExposeReply {
            exposure_no: outcome.exposure_no,
            filenames: outcome.filenames,
        }))
    }

    async fn abort(&self, request: Request<AbortRequest>) -> Result<Response<AbortReply>, Status> {
        let req = request.into_inner();
        self.orchestrator
            .abort_many(controllers_arg(&req.controllers))
            .await
            .map_err(orchestrator_err_to_status)?;
        Ok(Response::new(AbortReply {}))
    }

    async fn readout(&self, request: Request<ReadoutRequest>) -> Result<Response<ReadoutReply>, Status> {
        let req = request.into_inner();
        self.orchestrator
            .readout_many(controllers_arg(&req.controllers))
            .await
            .map_err(orchestrator_err_to_status)?;
        Ok(Response::new(ReadoutReply {}))
    }

    async fn fetch(&self, request: Request<FetchRequest>) -> Result<Response<FetchReply>, Status> {
        let req = request.into_inner();
        let engine = self.engine_or_status(&req.controller)?;
        let buffer_index = req.buffer_index.map(|i| i as u8);
        let frame = engine.fetch(buffer_index).await.map_err(|e| archon_err_to_status(&e))?;
        // A direct `Fetch` call is a diagnostic pull, not bound to an
        // exposure record, so no default header is computed here; the
        // `Expose` path is what populates a FITS header via the
        // orchestrator's persistence step.
        Ok(Response::new(fetched_frame_to_reply(&req.controller, &frame, &BTreeMap::new())))
    }

    async fn flush(&self, request: Request<FlushRequest>) -> Result<Response<FlushReply>, Status> {
        let req = request.into_inner();
        self.orchestrator
            .flush_many(controllers_arg(&req.controllers), req.count)
            .await
            .map_err(orchestrator_err_to_status)?;
        Ok(Response::new(FlushReply {}))
    }

    async fn write_config(
        &self,
        request: Request<WriteConfigRequest>,
    ) -> Result<Response<WriteConfigReply>, Status> {
        let req = request.into_inner();
        let engine = self.engine_or_status(&req.controller)?;
        let overrides: HashMap<String, String> = req.overrides.into_iter().collect();
        let apply = archon_acf::ApplySubsystems {
            all: req.apply_all,
            cds: req.apply_cds,
            system: req.apply_system,
            timing: req.apply_timing,
        };
        engine
            .write_config(&req.acf_text, &overrides, apply)
            .await
            .map_err(|e| archon_err_to_status(&e))?;
        Ok(Response::new(WriteConfigReply {}))
    }

    async fn read_config(&self, request: Request<ReadConfigRequest>) -> Result<Response<ReadConfigReply>, Status> {
        let req = request.into_inner();
        let engine = self.engine_or_status(&req.controller)?;
        let text = engine.read_config().await.map_err(|e| archon_err_to_status(&e))?;
        Ok(Response::new(ReadConfigReply { acf_text: text }))
    }

    async fn recover(&self, request: Request<RecoverRequest>) -> Result<Response<RecoverReply>, Status> {
        let req = request.into_inner();
        let dir = if req.directory.is_empty() {
            self.default_recover_dir.clone()
        } else {
            PathBuf::from(req.directory)
        };
        let recovered = self.orchestrator.recover(&dir).await.map_err(orchestrator_err_to_status)?;
        Ok(Response::new(RecoverReply { recovered_paths: recovered }))
    }

    async fn reset(&self, request: Request<ResetRequest>) -> Result<Response<ResetReply>, Status> {
        let req = request.into_inner();
        // Resolve first purely to reject an unknown controller name; the
        // fleet-wide reset itself always touches every configured
        // controller regardless of which subset was named, matching
        // `spec.md` §4.6 "Cancellation": `reset` always returns the whole
        // fleet to `IDLE`.
        self.orchestrator.resolve(controllers_arg(&req.controllers)).map_err(orchestrator_err_to_status)?;
        self.orchestrator.reset_all().await;
        Ok(Response::new(ResetReply {}))
    }

    type SubscribeEventsStream = Pin<Box<dyn Stream<Item = Result<Event, Status>> + Send + 'static>>;

    async fn subscribe_events(
        &self,
        request: Request<SubscribeEventsRequest>,
    ) -> Result<Response<Self::SubscribeEventsStream>, Status> {
        let keys: Vec<String> = request.into_inner().keys;
        let rx = self.events.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(move |item| match item {
            Ok(event) => {
                if keys.is_empty() || keys.contains(&event.key) {
                    Some(Ok(event))
                } else {
                    None
                }
            }
            // A lagged receiver means events were dropped under backpressure;
            // surface nothing for that tick rather than failing the whole
            // stream, since subsequent events are still valid.
            Err(_) => None,
        });
        Ok(Response::new(Box::pin(stream)))
    }
}
