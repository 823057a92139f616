//! The relay core: connection table and the single-threaded event loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub mod conn_table;
pub mod event_loop;

/// Per-datagram buffer size; survives maximum UDP datagrams plus masking
/// overhead plus dummy padding.
pub const BUFFER_SIZE: usize = 65535;

/// Upper bound on one readiness wait, milliseconds.
pub const POLL_TIMEOUT_MS: i32 = 5000;

/// Window between a handshake request and its accepted response.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Minimum spacing between housekeeping ticks.
pub const ITERATE_INTERVAL: Duration = Duration::from_millis(1000);

/// Set by the signal handler; every relay loop observes it at the next
/// readiness boundary.
pub static SHUTDOWN: AtomicBool = AtomicBool::new(false);

pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}
