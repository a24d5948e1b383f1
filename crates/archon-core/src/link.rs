//! The narrow seam between `archon-client`'s TCP connection and the
//! higher-level crates (`archon-acf`, `archon-exposure`) that issue
//! commands without caring how they reach the wire.
//!
//! `archon-client::ControllerClient` implements [`ControllerLink`]; tests in
//! `archon-acf` and `archon-exposure` implement it against an in-memory
//! fake, matching the teacher's "drivers behind capability traits" pattern
//! in `daq_core::capabilities`.

use crate::data::BufferDescriptor;
use crate::error::ArchonResult;
use crate::status::StatusFlags;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// A single correlated request/reply exchange, plus the binary `FETCH`
/// fast path and status subscription, abstracted away from the socket.
#[async_trait]
pub trait ControllerLink: Send + Sync {
    /// The controller name this link talks to, for error attribution.
    fn controller_name(&self) -> &str;

    /// Sends `text` as a new command and awaits its terminal reply.
    ///
    /// `timeout` overrides the client's default per-command deadline.
    /// `unique` rejects the call with [`crate::error::ArchonError::InvalidState`]
    /// if a command with the same literal text is already in flight, per
    /// `spec.md` §4.2.
    async fn send(&self, text: &str, timeout: Option<Duration>, unique: bool)
        -> ArchonResult<String>;

    /// Polls `FRAME` and parses it into buffer descriptors. A convenience
    /// built on [`ControllerLink::send`]; kept on the trait so fakes can
    /// return canned buffer states without parsing text.
    async fn poll_frame(&self) -> ArchonResult<Vec<BufferDescriptor>>;

    /// Issues `FETCH<index>` and streams the binary payload back in chunks
    /// rather than buffering the whole frame, per `spec.md` §4.2
    /// `stream_fetch`. The channel is closed after `expected_len` bytes (or
    /// an error is sent and the channel closed early on mismatch).
    async fn stream_fetch(
        &self,
        buffer_index: u8,
        expected_len: usize,
    ) -> ArchonResult<mpsc::Receiver<ArchonResult<Bytes>>>;

    /// The current status bitmask.
    fn status(&self) -> StatusFlags;

    /// Subscribes to status changes, returning the current value and a
    /// receiver for subsequent distinct values (`spec.md` §4.2: "newly
    /// subscribed consumers receive the current value first").
    fn subscribe_status(&self) -> (StatusFlags, broadcast::Receiver<StatusFlags>);

    /// Applies a status delta under the exclusion-group rules of
    /// `spec.md` §3/§4.4. The exposure engine drives its own state-machine
    /// transitions (e.g. `EXPOSING | READOUT_PENDING` on `expose`) through
    /// this rather than waiting on a polled reply.
    fn update_status(&self, flags: StatusFlags, on: bool);

    /// Overwrites the status bitmask wholesale, bypassing exclusion-group
    /// derivation. Used when reconstructing state from an authoritative
    /// `STATUS` poll (e.g. on connect, or after a background poll).
    fn set_status_exact(&self, flags: StatusFlags);
}
