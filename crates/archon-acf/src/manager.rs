//! Sequences the wire-level commands that write and read back a
//! controller's ACF configuration (`spec.md` §4.3 `write_config`,
//! `write_line`, `read_config`).

use crate::document::{AcfDocument, Section, CONFIG_SECTION};
use archon_core::error::{ArchonError, ArchonResult};
use archon_core::link::ControllerLink;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Which subsystem-apply commands to send after streaming `WCONFIG` lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySubsystems {
    /// Send `APPLYALL`.
    pub all: bool,
    /// Send `APPLYCDS`.
    pub cds: bool,
    /// Send `APPLYSYSTEM`.
    pub system: bool,
    /// Send `LOADTIMING`.
    pub timing: bool,
}

/// Owns one controller's in-memory ACF document and sequences edits against
/// it over a [`ControllerLink`].
pub struct AcfManager<L: ControllerLink> {
    link: Arc<L>,
    document: AcfDocument,
    /// Rate limit between successive `WCONFIGnnnn` lines, per `spec.md`
    /// §4.3 "each WCONFIGnnnn is rate-limited by a configured inter-line
    /// delay".
    inter_line_delay: Duration,
}

impl<L: ControllerLink> AcfManager<L> {
    /// Builds a manager around an already-parsed document.
    #[must_use]
    pub fn new(link: Arc<L>, document: AcfDocument, inter_line_delay: Duration) -> Self {
        Self {
            link,
            document,
            inter_line_delay,
        }
    }

    /// The currently held document.
    #[must_use]
    pub fn document(&self) -> &AcfDocument {
        &self.document
    }

    /// Loads a whole new ACF text, applies `overrides` to named parameters
    /// before transmission, and streams it to the controller:
    /// `POLLOFF`, `CLEARCONFIG`, one `WCONFIGnnnnKEY=VALUE` per CONFIG line,
    /// optional `APPLYALL`/`APPLYCDS`/`APPLYSYSTEM`/`LOADTIMING`, `POLLON`.
    ///
    /// Fails atomically: on the first NAK, the whole operation is abandoned
    /// and the error names the failing line. The manager's held document is
    /// only replaced on success.
    ///
    /// # Errors
    ///
    /// Propagates [`ArchonError::CommandFailed`]/[`ArchonError::Timeout`]
    /// from the first command that does not succeed.
    pub async fn write_config(
        &mut self,
        text: &str,
        overrides: &HashMap<String, String>,
        apply: ApplySubsystems,
    ) -> ArchonResult<()> {
        let mut doc = AcfDocument::parse(text)
            .map_err(|e| ArchonError::Config(format!("malformed ACF text: {e}")))?;
        for (name, value) in overrides {
            if doc.set_named(name, value).is_none() {
                return Err(ArchonError::Config(format!(
                    "override references unknown parameter '{name}'"
                )));
            }
        }

        self.send("POLLOFF").await?;
        self.send("CLEARCONFIG").await?;

        let config = doc
            .config()
            .cloned()
            .unwrap_or_else(|| Section { lines: Vec::new() });
        for (slot, line) in config.lines.iter().enumerate() {
            let command = format!("WCONFIG{slot:04}{line}");
            self.send(&command).await.map_err(|e| annotate_failing_line(e, slot))?;
            if !self.inter_line_delay.is_zero() {
                tokio::time::sleep(self.inter_line_delay).await;
            }
        }

        if apply.all {
            self.send("APPLYALL").await?;
        }
        if apply.cds {
            self.send("APPLYCDS").await?;
        }
        if apply.system {
            self.send("APPLYSYSTEM").await?;
        }
        if apply.timing {
            self.send("LOADTIMING").await?;
        }

        self.send("POLLON").await?;

        info!(lines = config.lines.len(), "ACF write_config completed");
        self.document = doc;
        Ok(())
    }

    /// Locates `name`'s CONFIG slot, issues the single `WCONFIGnnnn...`
    /// update, and activates it without a full reload via `FASTLOADPARAM`.
    ///
    /// # Errors
    ///
    /// Returns [`ArchonError::Config`] if `name` has no known slot;
    /// propagates transport errors from [`ControllerLink::send`].
    pub async fn write_line(&mut self, name: &str, value: &str) -> ArchonResult<()> {
        let (slot, line) = self
            .document
            .set_named(name, value)
            .ok_or_else(|| ArchonError::Config(format!("unknown parameter '{name}'")))?;

        let command = format!("WCONFIG{slot:04}{line}");
        self.send(&command).await?;

        let activate = format!("FASTLOADPARAM {name}={value}");
        self.send(&activate).await?;
        Ok(())
    }

    /// Enumerates `RCONFIGnnnn` slots from `0` until an empty reply
    /// terminates the stream, returning the reassembled `[CONFIG]` text.
    ///
    /// # Errors
    ///
    /// Propagates transport errors from [`ControllerLink::send`].
    pub async fn read_config(&self) -> ArchonResult<String> {
        let mut lines = Vec::new();
        for slot in 0..u32::MAX {
            let command = format!("RCONFIG{slot:04}");
            let reply = self.link.send(&command, None, false).await?;
            let line = reply.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                break;
            }
            lines.push(line.to_string());
        }
        let mut out = String::from("[CONFIG]\n");
        for line in lines {
            out.push_str(&line);
            out.push('\n');
        }
        Ok(out)
    }

    async fn send(&self, text: &str) -> ArchonResult<String> {
        self.link.send(text, None, false).await.map_err(|e| {
            warn!(command = text, error = %e, "ACF command failed");
            e
        })
    }
}

fn annotate_failing_line(err: ArchonError, slot: usize) -> ArchonError {
    match err {
        ArchonError::CommandFailed { controller, command } => ArchonError::CommandFailed {
            controller,
            command: format!("{command} (CONFIG line {slot})"),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archon_core::data::BufferDescriptor;
    use archon_core::status::{flag, StatusFlags};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::{broadcast, mpsc};

    /// A fake controller link that records every command it sees and NAKs
    /// a configured set of them, standing in for a real TCP connection in
    /// unit tests (the teacher's `daq-driver-mock` pattern).
    struct FakeLink {
        sent: StdMutex<Vec<String>>,
        nak_on: Vec<String>,
        replies: StdMutex<HashMap<String, String>>,
        bits: AtomicU32,
        tx: broadcast::Sender<StatusFlags>,
    }

    impl FakeLink {
        fn new(nak_on: Vec<String>) -> Self {
            let (tx, _rx) = broadcast::channel(16);
            Self {
                sent: StdMutex::new(Vec::new()),
                nak_on,
                replies: StdMutex::new(HashMap::new()),
                bits: AtomicU32::new(flag::IDLE),
                tx,
            }
        }
    }

    #[async_trait]
    impl ControllerLink for FakeLink {
        fn controller_name(&self) -> &str {
            "ccd1"
        }

        async fn send(
            &self,
            text: &str,
            _timeout: Option<Duration>,
            _unique: bool,
        ) -> ArchonResult<String> {
            self.sent.lock().unwrap_or_else(|e| e.into_inner()).push(text.to_string());
            if self.nak_on.iter().any(|n| n == text) {
                return Err(ArchonError::CommandFailed {
                    controller: "ccd1".into(),
                    command: text.to_string(),
                });
            }
            Ok(self
                .replies
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(text)
                .cloned()
                .unwrap_or_default())
        }

        async fn poll_frame(&self) -> ArchonResult<Vec<BufferDescriptor>> {
            Ok(Vec::new())
        }

        async fn stream_fetch(
            &self,
            _buffer_index: u8,
            _expected_len: usize,
        ) -> ArchonResult<mpsc::Receiver<ArchonResult<Bytes>>> {
            let (_tx, rx) = mpsc::channel(1);
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

    const SAMPLE: &str = "[CONFIG]\nPARAMETER0=Exposures=1\nPARAMETER1=IntMS=100\nLines=100\nPixels=200\n";

    #[tokio::test]
    async fn write_config_streams_every_line_and_brackets_poll() {
        let link = Arc::new(FakeLink::new(Vec::new()));
        let mut mgr = AcfManager::new(link.clone(), AcfDocument::default(), Duration::ZERO);
        mgr.write_config(SAMPLE, &HashMap::new(), ApplySubsystems::default())
            .await
            .unwrap();
        let sent = link.sent.lock().unwrap().clone();
        assert_eq!(sent.first().unwrap(), "POLLOFF");
        assert_eq!(sent.last().unwrap(), "POLLON");
        assert!(sent.iter().any(|l| l.starts_with("WCONFIG0000")));
    }

    #[tokio::test]
    async fn write_config_fails_atomically_on_nak_and_names_the_line() {
        let failing_line = "WCONFIG0002Lines=100";
        let link = Arc::new(FakeLink::new(vec![failing_line.to_string()]));
        let mut mgr = AcfManager::new(link.clone(), AcfDocument::default(), Duration::ZERO);
        let err = mgr
            .write_config(SAMPLE, &HashMap::new(), ApplySubsystems::default())
            .await
            .unwrap_err();
        match err {
            ArchonError::CommandFailed { command, .. } => {
                assert!(command.contains("CONFIG line 2"));
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
        // The document must not have been replaced by the failed attempt.
        assert!(mgr.document().config().is_none());
    }

    #[tokio::test]
    async fn write_line_locates_slot_and_activates() {
        let link = Arc::new(FakeLink::new(Vec::new()));
        let doc = AcfDocument::parse(SAMPLE).unwrap();
        let mut mgr = AcfManager::new(link.clone(), doc, Duration::ZERO);
        mgr.write_line("IntMS", "1500").await.unwrap();
        let sent = link.sent.lock().unwrap().clone();
        assert!(sent.iter().any(|l| l == "WCONFIG0001PARAMETER1=IntMS=1500"));
        assert!(sent.iter().any(|l| l == "FASTLOADPARAM IntMS=1500"));
        assert_eq!(mgr.document().named_value("IntMS"), Some("1500"));
    }

    #[tokio::test]
    async fn write_line_rejects_unknown_parameter() {
        let link = Arc::new(FakeLink::new(Vec::new()));
        let doc = AcfDocument::parse(SAMPLE).unwrap();
        let mut mgr = AcfManager::new(link, doc, Duration::ZERO);
        let err = mgr.write_line("DoesNotExist", "1").await.unwrap_err();
        assert!(matches!(err, ArchonError::Config(_)));
    }

    #[tokio::test]
    async fn read_config_stops_at_empty_reply() {
        let link = Arc::new(FakeLink::new(Vec::new()));
        {
            let mut replies = link.replies.lock().unwrap();
            replies.insert("RCONFIG0000".to_string(), "PARAMETER0=Exposures=1\n".to_string());
            replies.insert("RCONFIG0001".to_string(), "Lines=100\n".to_string());
            replies.insert("RCONFIG0002".to_string(), String::new());
        }
        let mgr = AcfManager::new(link, AcfDocument::default(), Duration::ZERO);
        let text = mgr.read_config().await.unwrap();
        assert_eq!(text, "[CONFIG]\nPARAMETER0=Exposures=1\nLines=100\n");
    }
}
