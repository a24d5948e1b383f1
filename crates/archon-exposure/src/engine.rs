//! Per-controller exposure state machine (`spec.md` §4.5). Exactly one of
//! `{expose, readout, fetch, flush, write_config}` runs at a time, gated by
//! `op_lock`; status polls (`STATUS`, `FRAME`) and `abort` are not gated,
//! grounded on the teacher's PVCAM single-flight acquisition guard
//! (`daq-driver-pvcam::components::acquisition`).

use crate::frame::decode_frame;
use archon_acf::{AcfManager, ApplySubsystems};
use archon_core::data::{select_fetch_buffer, BufferDescriptor, FetchedFrame};
use archon_core::error::{ArchonError, ArchonResult};
use archon_core::link::ControllerLink;
use archon_core::status::{flag, StatusFlags};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Tunables for the exposure engine's status-polling loops.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// How often to re-poll `STATUS`/`FRAME` while waiting on a transition.
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// What the engine remembers about the exposure currently in progress, used
/// to recognise the buffer it is waiting on.
#[derive(Debug, Clone, Copy)]
struct CurrentExposure {
    starting_frame_number: u64,
}

/// Drives one controller's exposure lifecycle: `expose`, `abort`,
/// `readout`, `fetch`, `flush`, `write_config`, `reset`.
pub struct ExposureEngine<L: ControllerLink> {
    link: Arc<L>,
    acf: Mutex<AcfManager<L>>,
    op_lock: Mutex<()>,
    current: Mutex<Option<CurrentExposure>>,
    abort_requested: AtomicBool,
    error_latched: AtomicBool,
    config_invalid: AtomicBool,
    config: EngineConfig,
}

impl<L: ControllerLink> ExposureEngine<L> {
    /// Builds an engine around an already-connected link and a loaded ACF
    /// manager for the same controller.
    #[must_use]
    pub fn new(link: Arc<L>, acf: AcfManager<L>, config: EngineConfig) -> Self {
        Self {
            link,
            acf: Mutex::new(acf),
            op_lock: Mutex::new(()),
            current: Mutex::new(None),
            abort_requested: AtomicBool::new(false),
            error_latched: AtomicBool::new(false),
            config_invalid: AtomicBool::new(false),
            config,
        }
    }

    /// The controller this engine drives.
    #[must_use]
    pub fn controller_name(&self) -> &str {
        self.link.controller_name()
    }

    /// The controller's current status bitmask, for callers (such as the
    /// orchestrator) that need to decide whether an in-flight exposure
    /// needs aborting without going through an engine operation.
    #[must_use]
    pub fn status(&self) -> archon_core::status::StatusFlags {
        self.link.status()
    }

    /// Starts an integration. Requires `IDLE`; sets `IntMS`/`Exposures` and
    /// `EXPOSING | READOUT_PENDING`. If `auto_read` is true, this does not
    /// return until readout also completes; otherwise it returns once
    /// integration alone finishes, leaving `READOUT_PENDING` set for a
    /// later explicit `readout()`.
    ///
    /// # Errors
    ///
    /// Returns [`ArchonError::InvalidState`] if not `IDLE`, [`ArchonError::Config`]
    /// if a prior `write_config` failed and has not been retried
    /// successfully, [`ArchonError::Aborted`] if `abort()` interrupts the
    /// integration wait, or a transport error — any of which (other than
    /// `Aborted`) latches the engine in `ERROR` until [`ExposureEngine::reset`].
    pub async fn expose(&self, integration_cs: u32, auto_read: bool) -> ArchonResult<()> {
        let _guard = self.op_lock.lock().await;
        self.check_not_latched()?;
        self.require_status(flag::IDLE, "expose")?;

        self.abort_requested.store(false, Ordering::SeqCst);

        let result: ArchonResult<()> = async {
            // Auto-flush must not run concurrently with integration; see
            // `spec.md` §4.5 "disables auto-flush by parameter poke".
            self.write_acf_line("DoFlush", "0").await?;

            let starting_frame_number = self.highest_frame_number().await?;
            self.write_acf_line("IntMS", &integration_cs.to_string()).await?;
            self.write_acf_line("Exposures", "1").await?;

            *self.current.lock().await = Some(CurrentExposure {
                starting_frame_number,
            });
            self.link.update_status(flag::EXPOSING | flag::READOUT_PENDING, true);

            self.wait_integration_complete().await?;
            // Integration is done; `READOUT_PENDING` stays set. Clear only
            // `EXPOSING` rather than asserting `IDLE`: `spec.md` §8
            // scenario 1's documented sequence has no `IDLE` state between
            // integration and readout, and subscribers must observe exactly
            // the bitmasks the controller passes through.
            self.link.update_status(flag::EXPOSING, false);

            if auto_read {
                self.readout_inner().await?;
            }
            Ok(())
        }
        .await;

        if let Err(ref e) = result {
            if !matches!(e, ArchonError::Aborted { .. }) {
                self.link.update_status(flag::ERROR, true);
                self.error_latched.store(true, Ordering::SeqCst);
            }
            self.current.lock().await.take();
        }
        result
    }

    /// Cancels an in-flight exposure. Valid only while `EXPOSING`. Not
    /// gated by `op_lock`: it must be able to interrupt `expose()` while
    /// that call still holds the lock.
    ///
    /// # Errors
    ///
    /// Returns [`ArchonError::InvalidState`] if the controller is not
    /// currently `EXPOSING`.
    pub async fn abort(&self) -> ArchonResult<()> {
        self.require_status(flag::EXPOSING, "abort")?;
        self.abort_requested.store(true, Ordering::SeqCst);
        self.write_acf_line("AbortExposure", "1").await?;
        self.link.update_status(flag::READOUT_PENDING, false);
        self.link.update_status(flag::IDLE, true);
        info!(controller = self.controller_name(), "exposure aborted");
        Ok(())
    }

    /// Triggers readout. Requires `READOUT_PENDING`; completes when the
    /// polled `FRAME` reports a new complete buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ArchonError::InvalidState`] if `READOUT_PENDING` is not
    /// set, or a transport error from the underlying polls/commands.
    pub async fn readout(&self) -> ArchonResult<()> {
        let _guard = self.op_lock.lock().await;
        self.readout_inner().await
    }

    async fn readout_inner(&self) -> ArchonResult<()> {
        self.require_status(flag::READOUT_PENDING, "readout")?;
        let starting_frame_number = self
            .current
            .lock()
            .await
            .map(|c| c.starting_frame_number)
            .unwrap_or(0);

        self.write_acf_line("ReadOut", "1").await?;
        self.link.update_status(flag::READOUT_PENDING, false);
        self.link.update_status(flag::READING, true);

        self.wait_buffer_complete(starting_frame_number).await?;

        self.link.update_status(flag::FETCH_PENDING, true);
        self.link.update_status(flag::READING, false);
        Ok(())
    }

    /// Fetches the completed buffer. Requires `FETCH_PENDING` unless an
    /// explicit `buffer_index` is supplied, per `spec.md` §4.5 `fetch(buffer?)`.
    ///
    /// # Errors
    ///
    /// Returns [`ArchonError::Fetch`] on a `FETCH_MISMATCH` (declared vs.
    /// received length) or if no complete buffer is available; propagates
    /// transport errors otherwise.
    pub async fn fetch(&self, buffer_index: Option<u8>) -> ArchonResult<FetchedFrame> {
        let _guard = self.op_lock.lock().await;
        if buffer_index.is_none() {
            self.require_status(flag::FETCH_PENDING, "fetch")?;
        }

        self.link.update_status(flag::FETCHING, true);
        self.link.update_status(flag::FETCH_PENDING, false);

        let result = self.fetch_inner(buffer_index).await;

        match &result {
            Ok(_) => self.link.update_status(flag::IDLE, true),
            Err(_) => {
                self.link.update_status(flag::ERROR, true);
                self.error_latched.store(true, Ordering::SeqCst);
            }
        }
        self.current.lock().await.take();
        result
    }

    async fn fetch_inner(&self, buffer_index: Option<u8>) -> ArchonResult<FetchedFrame> {
        let buffers = self.link.poll_frame().await?;
        let chosen: BufferDescriptor = match buffer_index {
            Some(idx) => buffers
                .iter()
                .find(|b| b.index == idx)
                .copied()
                .ok_or_else(|| fetch_error(self.controller_name(), "requested buffer not present"))?,
            None => select_fetch_buffer(&buffers)
                .copied()
                .ok_or_else(|| fetch_error(self.controller_name(), "no complete buffer available"))?,
        };

        let geometry = {
            let acf = self.acf.lock().await;
            archon_acf::compute_geometry(acf.document())?
        };

        let expected_len = chosen.byte_size();
        let mut rx = self.link.stream_fetch(chosen.index, expected_len).await?;
        let mut raw = Vec::with_capacity(expected_len);
        while let Some(chunk) = rx.recv().await {
            raw.extend_from_slice(&chunk?);
        }
        if raw.len() != expected_len {
            return Err(fetch_error(
                self.controller_name(),
                &format!(
                    "FETCH_MISMATCH: declared {expected_len} bytes, received {}",
                    raw.len()
                ),
            ));
        }

        let data = decode_frame(&raw, chosen.bit_width, self.controller_name())?;
        Ok(FetchedFrame {
            controller: self.controller_name().to_string(),
            data,
            width: chosen.width,
            height: chosen.height,
            geometry,
        })
    }

    /// Idles the CCD to clear accumulated dark current. Requires `IDLE`.
    ///
    /// # Errors
    ///
    /// Returns [`ArchonError::InvalidState`] if not `IDLE`, or a transport
    /// error from the underlying parameter writes/polls.
    pub async fn flush(&self, count: u32) -> ArchonResult<()> {
        let _guard = self.op_lock.lock().await;
        self.check_not_latched()?;
        self.require_status(flag::IDLE, "flush")?;

        self.write_acf_line("FlushCount", &count.to_string()).await?;
        self.link.update_status(flag::FLUSHING, true);
        self.write_acf_line("DoFlush", "1").await?;

        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            let status = self.link.send("STATUS", None, false).await?;
            if status_field(&status, "FLUSHCOUNT").map(|v| v == "0").unwrap_or(false) {
                break;
            }
        }
        self.link.update_status(flag::IDLE, true);
        Ok(())
    }

    /// Loads and streams a new ACF to the controller. Gated by the same
    /// lock as `expose`/`readout`/`fetch`/`flush`. On failure, `expose` is
    /// refused with [`ArchonError::Config`] until a subsequent call
    /// succeeds (`spec.md` §8 scenario 5).
    ///
    /// # Errors
    ///
    /// Propagates [`ArchonError::Config`]/[`ArchonError::CommandFailed`]
    /// from [`AcfManager::write_config`].
    pub async fn write_config(
        &self,
        text: &str,
        overrides: &HashMap<String, String>,
        apply: ApplySubsystems,
    ) -> ArchonResult<()> {
        let _guard = self.op_lock.lock().await;
        let result = self.acf.lock().await.write_config(text, overrides, apply).await;
        match &result {
            Ok(()) => self.config_invalid.store(false, Ordering::SeqCst),
            Err(e) => {
                warn!(error = %e, "write_config failed; expose refused until a successful reload");
                self.config_invalid.store(true, Ordering::SeqCst);
            }
        }
        result
    }

    /// Reads back the controller's live `[CONFIG]` text via `RCONFIGnnnn`
    /// polling. Not gated by `op_lock`'s exclusivity with `expose`/`readout`/
    /// etc: `spec.md` §4.3 `read_config` is a plain read, safe to interleave
    /// with an in-progress exposure.
    ///
    /// # Errors
    ///
    /// Propagates transport errors from the underlying `RCONFIGnnnn` polls.
    pub async fn read_config(&self) -> ArchonResult<String> {
        self.acf.lock().await.read_config().await
    }

    /// Clears the `ERROR` latch and returns the controller to `IDLE`.
    /// Required after any expose-path failure before further exposures are
    /// accepted (`spec.md` §4.5 failure semantics).
    pub async fn reset(&self) {
        self.error_latched.store(false, Ordering::SeqCst);
        self.abort_requested.store(false, Ordering::SeqCst);
        *self.current.lock().await = None;
        self.link.update_status(flag::ERROR, false);
        self.link
            .update_status(flag::READOUT_PENDING | flag::FETCH_PENDING, false);
        self.link.update_status(flag::IDLE, true);
    }

    fn check_not_latched(&self) -> ArchonResult<()> {
        if self.error_latched.load(Ordering::SeqCst) {
            return Err(ArchonError::InvalidState {
                controller: self.controller_name().to_string(),
                message: "engine is latched in ERROR; call reset() first".to_string(),
            });
        }
        if self.config_invalid.load(Ordering::SeqCst) {
            return Err(ArchonError::Config(format!(
                "controller '{}' has no valid configuration loaded",
                self.controller_name()
            )));
        }
        Ok(())
    }

    fn require_status(&self, required: StatusFlags, op: &str) -> ArchonResult<()> {
        let current = self.link.status();
        if current & required == 0 {
            return Err(ArchonError::InvalidState {
                controller: self.controller_name().to_string(),
                message: format!(
                    "{op} requires status bit(s) {:?}, current bits are {:?}",
                    archon_core::status::status_names(required),
                    archon_core::status::status_names(current)
                ),
            });
        }
        Ok(())
    }

    async fn write_acf_line(&self, name: &str, value: &str) -> ArchonResult<()> {
        self.acf.lock().await.write_line(name, value).await
    }

    async fn highest_frame_number(&self) -> ArchonResult<u64> {
        let buffers = self.link.poll_frame().await?;
        Ok(buffers.iter().map(|b| b.frame_number).max().unwrap_or(0))
    }

    /// Polls `STATUS` until `Exposures` reads back `0`, confirming the
    /// firmware's own timing script has consumed the one-shot trigger
    /// rather than assuming it resets immediately (`spec.md` §9 open
    /// question (a)).
    async fn wait_integration_complete(&self) -> ArchonResult<()> {
        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            if self.abort_requested.swap(false, Ordering::SeqCst) {
                return Err(ArchonError::Aborted {
                    controller: self.controller_name().to_string(),
                });
            }
            let status = self.link.send("STATUS", None, false).await?;
            if status_field(&status, "EXPOSURES").map(|v| v == "0").unwrap_or(false) {
                return Ok(());
            }
        }
    }

    async fn wait_buffer_complete(&self, starting_frame_number: u64) -> ArchonResult<()> {
        loop {
            if self.abort_requested.swap(false, Ordering::SeqCst) {
                return Err(ArchonError::Aborted {
                    controller: self.controller_name().to_string(),
                });
            }
            let buffers = self.link.poll_frame().await?;
            if buffers
                .iter()
                .any(|b| b.complete && b.frame_number > starting_frame_number)
            {
                return Ok(());
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

fn fetch_error(controller: &str, message: &str) -> ArchonError {
    ArchonError::Fetch {
        controller: controller.to_string(),
        message: message.to_string(),
    }
}

/// Splits a `STATUS` reply payload's `KEY=VALUE` tokens and looks up `key`.
/// Mirrors `archon-client::reply`'s tokenizer but kept local: this crate
/// deliberately depends only on the `ControllerLink` port, not on
/// `archon-client`'s concrete reply parser.
fn status_field<'a>(payload: &'a str, key: &str) -> Option<&'a str> {
    payload
        .split_whitespace()
        .filter_map(|tok| tok.split_once('='))
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_field_is_case_insensitive() {
        let payload = "Exposures=0 POWER=GOOD";
        assert_eq!(status_field(payload, "EXPOSURES"), Some("0"));
        assert_eq!(status_field(payload, "power"), Some("GOOD"));
        assert_eq!(status_field(payload, "missing"), None);
    }
}
