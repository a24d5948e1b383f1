//! The controller status bitmask and its exclusion rules.
//!
//! `spec.md` §3/§4.4: the firmware does not expose this composite state; it
//! is reconstructed and maintained entirely client-side from polled `STATUS`
//! and `FRAME` replies. Per `spec.md` §9, this is a plain integer with named
//! bit constants and a small helper enforcing exclusion groups — no class
//! hierarchy.

use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::broadcast;

/// Minimal `bitflags`-style const generator, kept local rather than pulling
/// in the `bitflags` crate for twelve constants.
macro_rules! bitflags_like {
    ($($name:ident = $value:expr),+ $(,)?) => {
        /// Named bit constants for [`ControllerStatus`].
        #[allow(missing_docs)]
        pub mod flag {
            $(pub const $name: u32 = $value;)+
        }
    };
}

bitflags_like! {
    UNKNOWN = 1 << 0,
    IDLE = 1 << 1,
    EXPOSING = 1 << 2,
    READOUT_PENDING = 1 << 3,
    READING = 1 << 4,
    FETCHING = 1 << 5,
    FETCH_PENDING = 1 << 6,
    FLUSHING = 1 << 7,
    ERROR = 1 << 8,
    POWERON = 1 << 9,
    POWERBAD = 1 << 10,
    POWEROFF = 1 << 11,
}

/// The set of bits that together form a `ControllerStatus`.
pub type StatusFlags = u32;

/// Mutually-exclusive bit groups: setting any bit in a group clears the rest
/// of that group. `READOUT_PENDING` is deliberately absent — it is
/// compatible with `EXPOSING` per `spec.md` §3.
const EXCLUSION_GROUPS: &[&[u32]] = &[
    &[flag::IDLE, flag::EXPOSING, flag::READING, flag::FETCHING],
    &[flag::POWERON, flag::POWEROFF, flag::POWERBAD],
];

/// Human-readable names for every bit, in declaration order, for the reply
/// sink's `status_names` field (`spec.md` §6).
const NAMED_BITS: &[(&str, u32)] = &[
    ("UNKNOWN", flag::UNKNOWN),
    ("IDLE", flag::IDLE),
    ("EXPOSING", flag::EXPOSING),
    ("READOUT_PENDING", flag::READOUT_PENDING),
    ("READING", flag::READING),
    ("FETCHING", flag::FETCHING),
    ("FETCH_PENDING", flag::FETCH_PENDING),
    ("FLUSHING", flag::FLUSHING),
    ("ERROR", flag::ERROR),
    ("POWERON", flag::POWERON),
    ("POWERBAD", flag::POWERBAD),
    ("POWEROFF", flag::POWEROFF),
];

/// Renders the set bits of `bits` as their names, in declaration order.
#[must_use]
pub fn status_names(bits: StatusFlags) -> Vec<&'static str> {
    NAMED_BITS
        .iter()
        .filter(|(_, bit)| bits & bit != 0)
        .map(|(name, _)| *name)
        .collect()
}

/// Applies `flags` to `current` under the exclusion rules of `spec.md` §3:
/// setting any bit in an exclusion group clears the rest of that group.
/// Bits outside any group are unaffected by exclusion and are simply
/// set/cleared per `on`.
#[must_use]
pub fn apply(current: StatusFlags, flags: StatusFlags, on: bool) -> StatusFlags {
    if !on {
        return current & !flags;
    }
    let mut next = current | flags;
    for group in EXCLUSION_GROUPS {
        let group_mask: u32 = group.iter().fold(0, |acc, b| acc | b);
        if flags & group_mask != 0 {
            // Clear every bit of this group, then re-set only the ones in `flags`.
            next &= !group_mask;
            next |= flags & group_mask;
        }
    }
    next
}

/// The live, observable status of one controller.
///
/// Holds the current bitmask plus a `tokio::sync::broadcast` channel so late
/// subscribers can be handed the current value before any future change
/// (`spec.md` §4.2 `subscribe_status`: "newly-subscribed consumers receive
/// the current value first"; slow consumers are naturally coalesced by
/// `broadcast`'s ring buffer, which only ever holds the latest N changes).
pub struct ControllerStatus {
    bits: AtomicU32,
    tx: broadcast::Sender<StatusFlags>,
}

impl ControllerStatus {
    /// Creates a new status model starting at `UNKNOWN`.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(64);
        Self {
            bits: AtomicU32::new(flag::UNKNOWN),
            tx,
        }
    }

    /// The current bitmask.
    #[must_use]
    pub fn get(&self) -> StatusFlags {
        self.bits.load(Ordering::SeqCst)
    }

    /// Applies a delta and notifies subscribers, unless the resulting value
    /// is identical to the previous one (`spec.md` §4.4: "identical re-sets
    /// are elided").
    pub fn update(&self, flags: StatusFlags, on: bool) {
        let mut updated = false;
        // Loop to tolerate a concurrent writer; there is at most one status
        // writer per controller (the engine + the background poller), so
        // contention here is rare.
        loop {
            let current = self.bits.load(Ordering::SeqCst);
            let next = apply(current, flags, on);
            if next == current {
                return;
            }
            if self
                .bits
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                updated = true;
                break;
            }
        }
        if updated {
            // A broadcast send fails only when there are no subscribers;
            // that is not an error condition for a status model.
            let _ = self.tx.send(self.get());
        }
    }

    /// Sets the bitmask to exactly `flags`, bypassing exclusion-group
    /// derivation. Used when reconstructing state wholesale (e.g. after a
    /// `STATUS` poll returns an authoritative snapshot).
    pub fn set_exact(&self, flags: StatusFlags) {
        let previous = self.bits.swap(flags, Ordering::SeqCst);
        if previous != flags {
            let _ = self.tx.send(flags);
        }
    }

    /// Subscribes to status changes. The returned receiver's first `recv()`
    /// call is primed with the current value by the caller using
    /// [`ControllerStatus::get`] before polling the stream — see
    /// `archon-client::subscribe_status` for the combined helper.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StatusFlags> {
        self.tx.subscribe()
    }
}

impl Default for ControllerStatus {
    fn default() -> Self {
        Self::new()
    }
}
