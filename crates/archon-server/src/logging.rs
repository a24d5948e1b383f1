//! `tracing-subscriber` initialization, grounded on the teacher's
//! `crates/bin::main`'s console logger; this daemon has no GUI to feed a
//! second log sink into, so the teacher's `multi_log`/log-capture fan-out
//! has no counterpart here.

use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber. `RUST_LOG` overrides
/// `default_level` when set.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
