//! The per-controller TCP connection: a dedicated reader task, a single
//! serialized writer, id-correlated request/reply, timeouts, and status
//! subscription (`spec.md` §4.2).

use crate::pending::{PendingCommand, PendingCommandTable, PendingState, Responder};
use crate::reply::{parse_frame_reply, parse_power_state, PowerState};
use archon_core::data::{BufferDescriptor, ControllerDescriptor};
use archon_core::error::{ArchonError, ArchonResult};
use archon_core::ids::CommandIdAllocator;
use archon_core::link::ControllerLink;
use archon_core::status::{flag, ControllerStatus, StatusFlags};
use archon_core::wire::CommandFrame;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, error, info, instrument, warn};

/// Chunk size used when forwarding a `FETCH` binary payload to the caller,
/// so a multi-megabyte frame does not have to land in memory all at once
/// inside the reader task before being handed off.
const FETCH_CHUNK_BYTES: usize = 64 * 1024;

/// Tunables for [`ControllerClient::connect`].
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    /// Bound on the TCP handshake itself.
    pub connect_timeout: Duration,
    /// Default per-command deadline when a caller does not override it.
    pub default_command_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            default_command_timeout: Duration::from_secs(10),
        }
    }
}

/// One persistent connection to an Archon controller.
pub struct ControllerClient {
    descriptor: ControllerDescriptor,
    default_command_timeout: Duration,
    write_tx: mpsc::UnboundedSender<Vec<u8>>,
    pending: Arc<Mutex<PendingCommandTable>>,
    ids: Arc<Mutex<CommandIdAllocator>>,
    status: Arc<ControllerStatus>,
}

impl ControllerClient {
    /// Opens the socket, starts the reader/writer tasks, sends a status
    /// query, and sets status to `IDLE | POWERON` unless the power check
    /// reports `POWERBAD`.
    ///
    /// # Errors
    ///
    /// Returns [`ArchonError::Disconnected`] on refusal or handshake
    /// timeout (`spec.md` §4.2 `CONNECT_FAILED`).
    #[instrument(skip(opts), fields(controller = %descriptor.name))]
    pub async fn connect(
        descriptor: ControllerDescriptor,
        opts: ConnectOptions,
    ) -> ArchonResult<Arc<Self>> {
        let addr = format!("{}:{}", descriptor.host, descriptor.port);
        let stream = tokio::time::timeout(opts.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ArchonError::Disconnected {
                controller: descriptor.name.clone(),
                message: format!("CONNECT_FAILED: timed out connecting to {addr}"),
            })?
            .map_err(|e| ArchonError::Disconnected {
                controller: descriptor.name.clone(),
                message: format!("CONNECT_FAILED: {e}"),
            })?;
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();

        let pending = Arc::new(Mutex::new(PendingCommandTable::new()));
        let ids = Arc::new(Mutex::new(CommandIdAllocator::new()));
        let status = Arc::new(ControllerStatus::new());

        let (write_tx, write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(writer_task(write_half, write_rx));

        let client = Arc::new(Self {
            descriptor: descriptor.clone(),
            default_command_timeout: opts.default_command_timeout,
            write_tx,
            pending: pending.clone(),
            ids: ids.clone(),
            status: status.clone(),
        });

        tokio::spawn(reader_task(
            descriptor.name.clone(),
            read_half,
            pending,
            ids,
            status.clone(),
        ));

        match client.send("STATUS", None, false).await {
            Ok(payload) => match parse_power_state(&payload, &descriptor.name) {
                Ok(PowerState::Bad) => status.set_exact(flag::POWERBAD),
                Ok(_) => status.update(flag::IDLE | flag::POWERON, true),
                Err(e) => {
                    warn!(error = %e, "could not parse initial STATUS reply; assuming IDLE");
                    status.update(flag::IDLE | flag::POWERON, true);
                }
            },
            Err(e) => {
                warn!(error = %e, "initial STATUS query failed; leaving status UNKNOWN");
            }
        }

        Ok(client)
    }

    /// The controller descriptor this client was built from.
    #[must_use]
    pub fn descriptor(&self) -> &ControllerDescriptor {
        &self.descriptor
    }

    async fn write(&self, frame: CommandFrame) -> ArchonResult<()> {
        self.write_tx
            .send(frame.encode())
            .map_err(|_| ArchonError::Disconnected {
                controller: self.descriptor.name.clone(),
                message: "writer task is gone".into(),
            })
    }
}

#[async_trait]
impl ControllerLink for ControllerClient {
    fn controller_name(&self) -> &str {
        &self.descriptor.name
    }

    #[instrument(skip(self), fields(controller = %self.descriptor.name, command = %text))]
    async fn send(
        &self,
        text: &str,
        timeout: Option<Duration>,
        unique: bool,
    ) -> ArchonResult<String> {
        if unique && self.pending.lock().await.has_in_flight_text(text) {
            return Err(ArchonError::InvalidState {
                controller: self.descriptor.name.clone(),
                message: format!("command '{text}' is already in flight"),
            });
        }

        let id = {
            let mut ids = self.ids.lock().await;
            ids.allocate().ok_or_else(|| ArchonError::Protocol {
                controller: self.descriptor.name.clone(),
                message: "command id pool exhausted (255 in-flight commands)".into(),
            })?
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(
            id,
            PendingCommand {
                text: text.to_string(),
                responder: Responder::Text(tx),
                state: PendingState::Running,
            },
        );

        self.write(CommandFrame::new(id, text)).await?;

        let deadline = timeout.unwrap_or(self.default_command_timeout);
        let started = tokio::time::Instant::now();
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => {
                self.ids.lock().await.release(id);
                result
            }
            Ok(Err(_recv_dropped)) => {
                self.ids.lock().await.release(id);
                Err(ArchonError::Disconnected {
                    controller: self.descriptor.name.clone(),
                    message: "connection closed while awaiting reply".into(),
                })
            }
            Err(_elapsed) => {
                self.pending.lock().await.mark_timed_out(id);
                Err(ArchonError::Timeout {
                    controller: self.descriptor.name.clone(),
                    command: text.to_string(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
        }
    }

    async fn poll_frame(&self) -> ArchonResult<Vec<BufferDescriptor>> {
        let payload = self.send("FRAME", None, false).await?;
        parse_frame_reply(&payload, &self.descriptor.name)
    }

    #[instrument(skip(self), fields(controller = %self.descriptor.name, buffer_index))]
    async fn stream_fetch(
        &self,
        buffer_index: u8,
        expected_len: usize,
    ) -> ArchonResult<mpsc::Receiver<ArchonResult<Bytes>>> {
        let id = {
            let mut ids = self.ids.lock().await;
            ids.allocate().ok_or_else(|| ArchonError::Protocol {
                controller: self.descriptor.name.clone(),
                message: "command id pool exhausted (255 in-flight commands)".into(),
            })?
        };

        let (tx, rx) = mpsc::channel(4);
        let text = format!("FETCH{buffer_index}");
        self.pending.lock().await.insert(
            id,
            PendingCommand {
                text: text.clone(),
                responder: Responder::Binary { expected_len, tx },
                state: PendingState::Running,
            },
        );
        self.write(CommandFrame::new(id, &text)).await?;
        // The id is released by the reader task once the binary transfer
        // completes (or fails); `send`'s timeout machinery does not apply
        // here since the caller drives the returned receiver at its own
        // pace, per `spec.md` §4.2 "returns immediately ... reads the
        // expected byte count off the socket in chunks".
        Ok(rx)
    }

    fn status(&self) -> StatusFlags {
        self.status.get()
    }

    fn subscribe_status(&self) -> (StatusFlags, broadcast::Receiver<StatusFlags>) {
        (self.status.get(), self.status.subscribe())
    }

    fn update_status(&self, flags: StatusFlags, on: bool) {
        self.status.update(flags, on);
    }

    fn set_status_exact(&self, flags: StatusFlags) {
        self.status.set_exact(flags);
    }
}

/// Drains `write_rx` and writes each frame to the socket, serializing all
/// writes through this single task (`spec.md` §5: "bytes written on a
/// single controller socket are strictly serialised").
async fn writer_task(mut write_half: OwnedWriteHalf, mut write_rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = write_rx.recv().await {
        if let Err(e) = write_half.write_all(&bytes).await {
            error!(error = %e, "controller write failed; writer task exiting");
            return;
        }
    }
    debug!("writer task exiting: channel closed");
}

/// Reads frames off the socket, correlates them to pending commands, and
/// handles connection loss (`spec.md` §4.2).
async fn reader_task(
    controller: String,
    read_half: OwnedReadHalf,
    pending: Arc<Mutex<PendingCommandTable>>,
    ids: Arc<Mutex<CommandIdAllocator>>,
    status: Arc<ControllerStatus>,
) {
    let mut reader = BufReader::new(read_half);
    loop {
        let mut header = [0u8; 3];
        if let Err(e) = reader.read_exact(&mut header).await {
            warn!(error = %e, "controller connection lost");
            disconnect_all(&controller, &pending, &ids, &status).await;
            return;
        }

        let marker = header[0];
        let id = match std::str::from_utf8(&header[1..3])
            .ok()
            .and_then(|s| u8::from_str_radix(s, 16).ok())
        {
            Some(id) => id,
            None => {
                error!(?header, "malformed reply header; disconnecting");
                disconnect_all(&controller, &pending, &ids, &status).await;
                return;
            }
        };

        match marker {
            b'?' => {
                let mut newline = [0u8; 1];
                let _ = reader.read_exact(&mut newline).await;
                let command_text = pending
                    .lock()
                    .await
                    .peek(id)
                    .map(|c| c.text.clone())
                    .unwrap_or_default();
                finalize_text(
                    &pending,
                    &ids,
                    &controller,
                    id,
                    Err(ArchonError::CommandFailed {
                        controller: controller.clone(),
                        command: command_text,
                    }),
                )
                .await;
            }
            b'<' => {
                let expected_len = {
                    let table = pending.lock().await;
                    match table.peek(id) {
                        Some(PendingCommand {
                            responder: Responder::Binary { expected_len, .. },
                            ..
                        }) => Some(*expected_len),
                        _ => None,
                    }
                };
                if let Some(expected_len) = expected_len {
                    if let Err(e) =
                        relay_binary(&mut reader, &pending, &ids, id, expected_len, &controller)
                            .await
                    {
                        error!(error = %e, "binary FETCH relay failed; disconnecting");
                        disconnect_all(&controller, &pending, &ids, &status).await;
                        return;
                    }
                } else {
                    let mut line = Vec::new();
                    if reader.read_until(b'\n', &mut line).await.is_err() {
                        disconnect_all(&controller, &pending, &ids, &status).await;
                        return;
                    }
                    let payload = String::from_utf8_lossy(&line).to_string();
                    finalize_text(&pending, &ids, &controller, id, Ok(payload)).await;
                }
            }
            other => {
                error!(marker = other as char, "unexpected reply marker; disconnecting");
                disconnect_all(&controller, &pending, &ids, &status).await;
                return;
            }
        }
    }
}

/// Resolves (or silently finalizes, if timed-out/unknown) the text
/// responder for `id`.
async fn finalize_text(
    pending: &Arc<Mutex<PendingCommandTable>>,
    ids: &Arc<Mutex<CommandIdAllocator>>,
    controller: &str,
    id: u8,
    result: ArchonResult<String>,
) {
    let command = pending.lock().await.remove(id);
    ids.lock().await.release(id);
    match command {
        Some(PendingCommand {
            responder: Responder::Text(tx),
            ..
        }) => {
            let _ = tx.send(result);
        }
        Some(PendingCommand {
            responder: Responder::Binary { tx, .. },
            ..
        }) => {
            // A text reply arrived for a command that expected binary
            // (e.g. the controller NAK'd a FETCH). Surface it as a
            // protocol error on the binary channel instead of silently
            // dropping it.
            let _ = tx
                .send(Err(result.err().unwrap_or_else(|| ArchonError::Protocol {
                    controller: controller.to_string(),
                    message: "expected binary FETCH reply, got text".into(),
                })))
                .await;
        }
        None => {
            debug!(id, "reply for unknown/already-finalized command id; dropping");
        }
    }
}

/// Streams `expected_len` bytes from `reader` to the pending command's
/// binary channel in [`FETCH_CHUNK_BYTES`] pieces, then finalizes it.
async fn relay_binary(
    reader: &mut BufReader<OwnedReadHalf>,
    pending: &Arc<Mutex<PendingCommandTable>>,
    ids: &Arc<Mutex<CommandIdAllocator>>,
    id: u8,
    expected_len: usize,
    controller: &str,
) -> ArchonResult<()> {
    let tx = {
        let table = pending.lock().await;
        match table.peek(id) {
            Some(PendingCommand {
                responder: Responder::Binary { tx, .. },
                ..
            }) => tx.clone(),
            _ => {
                return Err(ArchonError::Protocol {
                    controller: controller.to_string(),
                    message: format!("no binary responder registered for id {id:#04X}"),
                })
            }
        }
    };

    let mut remaining = expected_len;
    let mut io_error = None;
    while remaining > 0 {
        let take = remaining.min(FETCH_CHUNK_BYTES);
        let mut buf = BytesMut::zeroed(take);
        if let Err(e) = reader.read_exact(&mut buf).await {
            io_error = Some(e.to_string());
            break;
        }
        remaining -= take;
        if tx.send(Ok(buf.freeze())).await.is_err() {
            // Caller dropped the receiver; stop relaying but keep draining
            // the socket so the byte stream stays in sync for the next
            // command.
            let mut sink = vec![0u8; remaining];
            let _ = reader.read_exact(&mut sink).await;
            remaining = 0;
            break;
        }
    }

    pending.lock().await.remove(id);
    ids.lock().await.release(id);

    if let Some(message) = io_error {
        let _ = tx
            .send(Err(ArchonError::Fetch {
                controller: controller.to_string(),
                message: format!("FETCH_MISMATCH: socket closed early: {message}"),
            }))
            .await;
        return Err(ArchonError::Disconnected {
            controller: controller.to_string(),
            message: "socket closed mid-FETCH".into(),
        });
    }
    Ok(())
}

/// Fails every outstanding command, resets the id pool, and marks status
/// `UNKNOWN | ERROR` (`spec.md` §4.2).
async fn disconnect_all(
    controller: &str,
    pending: &Arc<Mutex<PendingCommandTable>>,
    ids: &Arc<Mutex<CommandIdAllocator>>,
    status: &Arc<ControllerStatus>,
) {
    let drained = pending.lock().await.drain();
    for (_, command) in drained {
        let err = ArchonError::Disconnected {
            controller: controller.to_string(),
            message: "connection lost".into(),
        };
        match command.responder {
            Responder::Text(tx) => {
                let _ = tx.send(Err(err));
            }
            Responder::Binary { tx, .. } => {
                let _ = tx.send(Err(err)).await;
            }
        }
    }
    *ids.lock().await = CommandIdAllocator::new();
    status.set_exact(flag::UNKNOWN | flag::ERROR);
    info!(controller, "connection marked disconnected");
}
