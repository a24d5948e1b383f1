//! The in-flight command table owned by the connection's reader task.
//!
//! `spec.md` §9: "a cleaner split in the target: a `PendingCommand` value
//! owned by the client, and a `ReplyFuture` owned by the caller; the two are
//! linked by id." [`PendingCommandTable`] is the client-owned half;
//! `ControllerClient::send`/`stream_fetch` hand callers the `ReplyFuture`
//! half (a `oneshot`/`mpsc` receiver).

use archon_core::error::ArchonResult;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};

/// What a pending command resolves through, once its reply completes.
pub enum Responder {
    /// A single-line text reply, resolved once.
    Text(oneshot::Sender<ArchonResult<String>>),
    /// A `FETCH` binary reply: `expected_len` bytes are forwarded to `tx` in
    /// chunks as they arrive.
    Binary {
        /// Declared payload length, from the last `FRAME` buffer poll.
        expected_len: usize,
        /// Channel the reader task forwards decoded byte chunks to.
        tx: mpsc::Sender<ArchonResult<Bytes>>,
    },
}

/// Terminal status of a pending command (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    /// Still awaiting a reply.
    Running,
    /// The caller's deadline passed; the id stays reserved ("poisoned")
    /// until the late reply, if any, finally arrives.
    TimedOut,
}

/// One request whose reply has not yet completed.
pub struct PendingCommand {
    /// The literal command text, for error messages and `unique` checks.
    pub text: String,
    /// How this command's reply will be delivered to the caller.
    pub responder: Responder,
    /// Current lifecycle state.
    pub state: PendingState,
}

/// The table of in-flight commands, keyed by wire id. Not `Send`-shared
/// directly; callers wrap it in `tokio::sync::Mutex`.
#[derive(Default)]
pub struct PendingCommandTable {
    commands: HashMap<u8, PendingCommand>,
}

impl PendingCommandTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new in-flight command under `id`. Panics in debug builds
    /// if `id` is already tracked — the id allocator guarantees this cannot
    /// happen.
    pub fn insert(&mut self, id: u8, command: PendingCommand) {
        debug_assert!(
            !self.commands.contains_key(&id),
            "id {id:#04X} already has a pending command"
        );
        self.commands.insert(id, command);
    }

    /// True if any in-flight command has the same literal text, used to
    /// implement `send(..., unique=true)` (`spec.md` §4.2).
    #[must_use]
    pub fn has_in_flight_text(&self, text: &str) -> bool {
        self.commands.values().any(|c| c.text == text)
    }

    /// Marks `id` as timed out in place, leaving it in the table so a late
    /// reply can still be matched and discarded cleanly.
    pub fn mark_timed_out(&mut self, id: u8) {
        if let Some(cmd) = self.commands.get_mut(&id) {
            cmd.state = PendingState::TimedOut;
        }
    }

    /// Removes and returns the pending command for `id`, if any.
    pub fn remove(&mut self, id: u8) -> Option<PendingCommand> {
        self.commands.remove(&id)
    }

    /// Borrows the pending command for `id`, if any, without removing it.
    #[must_use]
    pub fn peek(&self, id: u8) -> Option<&PendingCommand> {
        self.commands.get(&id)
    }

    /// Drains every pending command, for use when the connection is lost
    /// and every outstanding command must fail (`spec.md` §4.2).
    pub fn drain(&mut self) -> Vec<(u8, PendingCommand)> {
        self.commands.drain().collect()
    }

    /// Number of commands currently in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// True if no commands are in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_duplicate_text() {
        let mut table = PendingCommandTable::new();
        let (tx, _rx) = oneshot::channel();
        table.insert(
            1,
            PendingCommand {
                text: "STATUS".into(),
                responder: Responder::Text(tx),
                state: PendingState::Running,
            },
        );
        assert!(table.has_in_flight_text("STATUS"));
        assert!(!table.has_in_flight_text("FRAME"));
    }

    #[test]
    fn drain_empties_table() {
        let mut table = PendingCommandTable::new();
        let (tx, _rx) = oneshot::channel();
        table.insert(
            5,
            PendingCommand {
                text: "FRAME".into(),
                responder: Responder::Text(tx),
                state: PendingState::Running,
            },
        );
        let drained = table.drain();
        assert_eq!(drained.len(), 1);
        assert!(table.is_empty());
    }
}
