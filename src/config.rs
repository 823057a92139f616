/*
 * Copyright (c) 2025 sh0rch <sh0rch@iwl.dev>
 * SPDX-License-Identifier: MIT
 *
 * This module provides configuration parsing and management for the udp_wgobfs
 * relay. It defines the per-instance settings structure, the INI-style config
 * file parser with named sections, value parsing shared with the command line,
 * and startup validation.
 */

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use log::LevelFilter;

use crate::codec::MAX_DUMMY_TOTAL;
use crate::masking;
use crate::netutils;

pub const DEFAULT_INSTANCE_NAME: &str = "main";
pub const MAX_CLIENTS_DEFAULT: usize = 1024;
pub const IDLE_TIMEOUT_DEFAULT: Duration = Duration::from_secs(300);
pub const MAX_DUMMY_DATA_DEFAULT: usize = 4;

/// A pre-configured client binding: datagrams for `client` use a fixed
/// local egress port, and the entry is exempt from idle purging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticBinding {
    pub client: SocketAddrV4,
    pub local_port: u16,
}

/// Settings for one relay instance (one config section).
///
/// The three required fields stay `Option` so validation can tell a
/// missing value from a default; everything else carries its default.
#[derive(Clone)]
pub struct ObfuscatorConfig {
    /// Instance name, used as the log prefix and worker thread name.
    pub section: String,
    /// Ingress UDP port (`source-lport`); required.
    pub listen_port: Option<u16>,
    /// Ingress bind address (`source-if`).
    pub listen_addr: Ipv4Addr,
    /// Upstream WireGuard endpoint as `host:port` (`target`); required.
    pub target: Option<String>,
    /// XOR key, 1..=255 bytes (`key`); required.
    pub key: Option<String>,
    /// Pre-created bindings (`static-bindings`).
    pub static_bindings: Vec<StaticBinding>,
    /// Cap on live client entries (`max-client`).
    pub max_clients: usize,
    /// Idle purge timeout (`idle-timeout`, seconds in config).
    pub idle_timeout: Duration,
    /// Dummy padding cap for data packets (`max-dummy`).
    pub max_dummy_data: usize,
    /// Firewall mark for egress sockets (`fwmark`), Linux only.
    pub fwmark: Option<u32>,
    /// Masking profile name (`masking`); unset means auto-detection.
    pub masking: Option<String>,
    /// Log level (`verbose`).
    pub verbose: LevelFilter,
}

impl Default for ObfuscatorConfig {
    fn default() -> Self {
        ObfuscatorConfig {
            section: DEFAULT_INSTANCE_NAME.to_string(),
            listen_port: None,
            listen_addr: Ipv4Addr::UNSPECIFIED,
            target: None,
            key: None,
            static_bindings: Vec::new(),
            max_clients: MAX_CLIENTS_DEFAULT,
            idle_timeout: IDLE_TIMEOUT_DEFAULT,
            max_dummy_data: MAX_DUMMY_DATA_DEFAULT,
            fwmark: None,
            masking: None,
            verbose: LevelFilter::Info,
        }
    }
}

fn invalid<T>(msg: String) -> io::Result<T> {
    Err(io::Error::new(io::ErrorKind::InvalidData, msg))
}

fn parse_u16(key: &str, value: &str) -> io::Result<u16> {
    match value.parse::<u16>() {
        Ok(v) if v > 0 => Ok(v),
        _ => invalid(format!("Invalid {key}: {value} (must be between 1 and 65535)")),
    }
}

/// Parses a verbosity level: a level name or its numeric alias 0..4.
pub fn parse_level(value: &str) -> io::Result<LevelFilter> {
    match value.to_ascii_lowercase().as_str() {
        "error" | "0" => Ok(LevelFilter::Error),
        "warn" | "1" => Ok(LevelFilter::Warn),
        "info" | "2" => Ok(LevelFilter::Info),
        "debug" | "3" => Ok(LevelFilter::Debug),
        "trace" | "4" => Ok(LevelFilter::Trace),
        _ => invalid(format!(
            "Invalid verbosity level: {value} (must be one of 'ERROR', 'WARN', 'INFO', 'DEBUG', 'TRACE' or 0-4)"
        )),
    }
}

/// Parses one `client_ip:client_port:local_port` static binding.
fn parse_binding(value: &str) -> io::Result<StaticBinding> {
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() != 3 {
        return invalid(format!(
            "Invalid static binding: {value} (must be <client_ip>:<client_port>:<local_port>)"
        ));
    }
    let ip = netutils::parse_ipv4(parts[0])?;
    let client_port = parse_u16("static binding client port", parts[1])?;
    let local_port = parse_u16("static binding local port", parts[2])?;
    Ok(StaticBinding { client: SocketAddrV4::new(ip, client_port), local_port })
}

/// Applies a single `key = value` setting to `config`.
///
/// Shared between the config file parser and the command line so both
/// accept the same keys with the same semantics.
pub fn apply_option(config: &mut ObfuscatorConfig, key: &str, value: &str) -> io::Result<()> {
    match key {
        "source-lport" => config.listen_port = Some(parse_u16(key, value)?),
        "source-if" => config.listen_addr = netutils::parse_ipv4(value)?,
        "target" => {
            netutils::split_host_port(value)?;
            config.target = Some(value.to_string());
        }
        "key" => {
            if value.is_empty() || value.len() > 255 {
                return invalid("Invalid key (must be 1-255 characters long)".to_string());
            }
            config.key = Some(value.to_string());
        }
        "static-bindings" => {
            for part in value.split(',') {
                let binding = parse_binding(part.trim())?;
                if config.static_bindings.iter().any(|b| b.client == binding.client) {
                    return invalid(format!(
                        "Duplicate static binding for client {}",
                        binding.client
                    ));
                }
                config.static_bindings.push(binding);
            }
        }
        "max-client" => {
            config.max_clients = match value.parse::<usize>() {
                Ok(v) if v > 0 => v,
                _ => {
                    return invalid(format!(
                        "Invalid maximum number of clients: {value} (must be greater than 0)"
                    ))
                }
            };
        }
        "idle-timeout" => {
            config.idle_timeout = match value.parse::<u64>() {
                Ok(v) if v > 0 => Duration::from_secs(v),
                _ => {
                    return invalid(format!(
                        "Invalid idle timeout: {value} (must be greater than 0)"
                    ))
                }
            };
        }
        "max-dummy" => {
            config.max_dummy_data = match value.parse::<usize>() {
                Ok(v) if v <= MAX_DUMMY_TOTAL => v,
                _ => {
                    return invalid(format!(
                        "Invalid maximum dummy length for data packets: {value} (must be between 0 and {MAX_DUMMY_TOTAL})"
                    ))
                }
            };
        }
        "fwmark" => {
            config.fwmark = Some(value.parse::<u32>().map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Invalid fwmark: {value} (must be an integer)"),
                )
            })?);
        }
        "masking" => {
            if masking::find_profile(value).is_none() {
                return invalid(format!("Unknown masking profile: {value}"));
            }
            config.masking = Some(value.to_ascii_lowercase());
        }
        "verbose" => config.verbose = parse_level(value)?,
        _ => return invalid(format!("Unknown configuration key: {key}")),
    }
    Ok(())
}

/// Checks that the required settings are present and consistent.
pub fn validate(config: &ObfuscatorConfig) -> io::Result<()> {
    if config.listen_port.is_none() {
        return invalid(format!("[{}] 'source-lport' is not set", config.section));
    }
    if config.target.is_none() {
        return invalid(format!("[{}] 'target' is not set", config.section));
    }
    if config.key.is_none() {
        return invalid(format!("[{}] 'key' is not set", config.section));
    }
    Ok(())
}

/// Parses an INI-style configuration into one config per section.
///
/// Settings before the first `[section]` header belong to the implicit
/// `main` instance; each header starts a fresh config with defaults.
pub fn parse_config(input: &str) -> io::Result<Vec<ObfuscatorConfig>> {
    let mut configs: Vec<ObfuscatorConfig> = Vec::new();
    let mut current = ObfuscatorConfig::default();
    let mut current_dirty = false;

    for raw_line in input.lines() {
        // Strip comments, then surrounding whitespace.
        let line = match raw_line.split_once('#') {
            Some((before, _)) => before,
            None => raw_line,
        }
        .trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') {
            if current_dirty {
                configs.push(current);
            }
            current = ObfuscatorConfig::default();
            current.section = line[1..line.len() - 1].trim().to_string();
            if current.section.is_empty() {
                return invalid("Empty section name in configuration".to_string());
            }
            if configs.iter().any(|c| c.section == current.section) {
                return invalid(format!("Duplicate section name: {}", current.section));
            }
            current_dirty = true;
            continue;
        }

        let (key, value) = match line.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => return invalid(format!("Invalid configuration line: {line}")),
        };
        if key.is_empty() || value.is_empty() {
            return invalid(format!("Invalid configuration line: {line}"));
        }
        apply_option(&mut current, key, value)?;
        current_dirty = true;
    }

    if current_dirty {
        configs.push(current);
    }
    Ok(configs)
}

/// Reads and parses a configuration file.
pub fn load_config_file(path: &str) -> io::Result<Vec<ObfuscatorConfig>> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        io::Error::new(e.kind(), format!("Can't open config file {path}: {e}"))
    })?;
    let configs = parse_config(&contents)?;
    if configs.is_empty() {
        return invalid(format!("No settings found in config file {path}"));
    }
    Ok(configs)
}
