/*
 * Copyright (c) 2025 sh0rch <sh0rch@iwl.dev>
 *
 * This file is part of udp_wgobfs.
 *
 * Licensed under the MIT License. See LICENSE file in the project root for full license information.
 */

//! Main entry point for the udp_wgobfs relay.
//!
//! Parses the command line and/or config file, initialises logging,
//! installs the signal handlers and runs one relay worker thread per
//! configuration section. Sections are fully isolated: each worker owns
//! its ingress socket, connection table and buffer.

mod cli;
mod codec;
mod config;
mod logger;
mod masking;
mod netutils;
mod relay;

use std::collections::HashSet;
use std::io;
use std::sync::atomic::Ordering;
use std::thread;

use log::{error, info};

use crate::config::ObfuscatorConfig;
use crate::relay::event_loop::Relay;

extern "C" fn handle_signal(_signal: libc::c_int) {
    relay::SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let handler = handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

/// Cross-section validation: every section must be complete and no two
/// sections may share an ingress port.
fn check_configs(configs: &[ObfuscatorConfig]) -> io::Result<()> {
    let mut ports = HashSet::new();
    for config in configs {
        config::validate(config)?;
        if let Some(port) = config.listen_port {
            if !ports.insert((config.listen_addr, port)) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Ingress port {port} is used by more than one section"),
                ));
            }
        }
    }
    Ok(())
}

fn run_instance(config: ObfuscatorConfig) -> io::Result<()> {
    let mut relay = Relay::new(&config)?;
    relay.run()
}

/// Application entry point.
///
/// Returns a `std::io::Result<()>`; any startup error exits non-zero.
fn main() -> io::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let configs = match cli::parse_args(&args) {
        Ok(cli::Command::Help) => {
            cli::show_usage(&args[0]);
            return Ok(());
        }
        Ok(cli::Command::Version) => {
            println!("udp_wgobfs version {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Ok(cli::Command::Run(configs)) => configs,
        Err(e) => {
            eprintln!("{e}");
            return Err(e);
        }
    };

    // One process-wide logger; sections tag their lines with the worker
    // thread name, and the most verbose section sets the global level.
    let level = configs.iter().map(|c| c.verbose).max().unwrap_or(log::LevelFilter::Info);
    logger::init(level);

    if let Err(e) = check_configs(&configs) {
        error!("{e}");
        return Err(e);
    }

    install_signal_handlers();

    // One worker thread per section; nothing is shared between instances.
    let mut handles = Vec::with_capacity(configs.len());
    for config in configs {
        let name = config.section.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_instance(config))?;
        handles.push((name, handle));
    }

    let mut failed = false;
    for (name, handle) in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("[{name}] {e}");
                failed = true;
            }
            Err(_) => {
                error!("[{name}] worker thread panicked");
                failed = true;
            }
        }
    }
    if failed {
        return Err(io::Error::other("one or more relay instances failed"));
    }
    info!("All instances stopped");
    Ok(())
}
