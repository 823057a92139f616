//! Logger setup: `env_logger` with a compact `[instance][level]` prefix.
//!
//! Each relay instance runs in a worker thread named after its config
//! section, so the thread name doubles as the instance tag in every line.

use std::io::Write;

use log::{Level, LevelFilter};

fn level_letter(level: Level) -> char {
    match level {
        Level::Error => 'E',
        Level::Warn => 'W',
        Level::Info => 'I',
        Level::Debug => 'D',
        Level::Trace => 'T',
    }
}

/// Initialises the global logger. Call once, before any worker threads
/// start.
pub fn init(level: LevelFilter) {
    env_logger::Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            let thread = std::thread::current();
            writeln!(
                buf,
                "[{}][{}] {}",
                thread.name().unwrap_or("main"),
                level_letter(record.level()),
                record.args()
            )
        })
        .init();
}
