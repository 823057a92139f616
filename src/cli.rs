/*
 * Copyright (c) 2025 sh0rch <sh0rch@iwl.dev>
 *
 * This file is part of udp_wgobfs.
 *
 * Licensed under the MIT License. See LICENSE file in the project root for full license information.
 */

//! CLI module for udp_wgobfs.
//!
//! Hand-rolled long/short option parsing sharing one option table with the
//! config file: every configuration key is also a command-line option with
//! the same name and semantics. `--config` loads an INI-style file whose
//! sections become independent relay instances; options after it modify
//! the last section read, matching the order-dependent behaviour of the
//! config keys themselves.

use std::io;

use crate::config::{self, ObfuscatorConfig};

/// Result of command-line parsing.
pub enum Command {
    /// Run the given relay instances.
    Run(Vec<ObfuscatorConfig>),
    /// Print usage and exit.
    Help,
    /// Print version information and exit.
    Version,
}

/// Option table: long name, short name, takes a value.
const OPTIONS: &[(&str, char, bool)] = &[
    ("help", '?', false),
    ("version", 'V', false),
    ("config", 'c', true),
    ("source-if", 'i', true),
    ("source-lport", 'p', true),
    ("target", 't', true),
    ("key", 'k', true),
    ("static-bindings", 'b', true),
    ("max-client", 'm', true),
    ("idle-timeout", 'l', true),
    ("max-dummy", 'd', true),
    ("fwmark", 'f', true),
    ("masking", 'M', true),
    ("verbose", 'v', true),
];

fn find_option(arg: &str) -> Option<&'static (&'static str, char, bool)> {
    if let Some(long) = arg.strip_prefix("--") {
        let name = long.split_once('=').map_or(long, |(n, _)| n);
        OPTIONS.iter().find(|(l, _, _)| *l == name)
    } else if let Some(short) = arg.strip_prefix('-') {
        let mut chars = short.chars();
        let c = chars.next()?;
        if chars.next().is_some() {
            return None;
        }
        OPTIONS.iter().find(|(_, s, _)| *s == c)
    } else {
        None
    }
}

/// Prints the usage text.
pub fn show_usage(arg0: &str) {
    println!(
        "Usage: {arg0} [options]
  -?, --help                 Give this help list
  -V, --version              Print program version

Main settings:
  -c, --config=<config_file> Read configuration from file
                             (can be used instead of the rest arguments;
                             every [section] starts another relay instance)
  -i, --source-if=<ip>       Source interface to listen on
                             (optional, default - 0.0.0.0, e.g. all)
  -p, --source-lport=<port>  Source port to listen
  -t, --target=<ip>:<port>   Target IP and port
  -k, --key=<key>            Obfuscation key
                             (required, must be 1-255 characters long)
  -b, --static-bindings=<ip>:<port>:<port>,...
                             Comma-separated static bindings for two-way mode
                             as <client_ip>:<client_port>:<forward_port>
  -v, --verbose=<level>      Verbosity level (optional, default - INFO)
                             0 - ERROR (critical errors only)
                             1 - WARN (important messages)
                             2 - INFO (status messages, connections, etc.)
                             3 - DEBUG (detailed debug messages)
                             4 - TRACE (packet dumps)

Additional options:
  -m, --max-client=<number>  Maximum number of clients (default: 1024)
  -l, --idle-timeout=<sec>   Idle timeout in seconds (default: 300)
  -d, --max-dummy=<bytes>    Maximum length of dummy bytes for data packets
                             (default: 4)
  -f, --fwmark=<mark>        Firewall mark for egress sockets (Linux only)
  -M, --masking=<profile>    Masking profile (default: auto-detection)"
    );
}

/// Parses the process arguments into a [`Command`].
pub fn parse_args(args: &[String]) -> io::Result<Command> {
    if args.len() <= 1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("No arguments provided, use \"{} --help\" for usage information", args[0]),
        ));
    }

    let mut configs: Vec<ObfuscatorConfig> = vec![ObfuscatorConfig::default()];
    let mut i = 1;
    while i < args.len() {
        let arg = &args[i];
        let (long, short, has_arg) = match find_option(arg) {
            Some(o) => *o,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Unknown option: {arg}"),
                ))
            }
        };
        let value = if has_arg {
            match arg.split_once('=') {
                Some((_, v)) => v.to_string(),
                None => {
                    i += 1;
                    match args.get(i) {
                        Some(v) => v.clone(),
                        None => {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidInput,
                                format!("Option --{long} requires a value"),
                            ))
                        }
                    }
                }
            }
        } else {
            String::new()
        };

        match short {
            '?' => return Ok(Command::Help),
            'V' => return Ok(Command::Version),
            'c' => {
                // Replace the working set with the file's sections; later
                // options keep modifying the last section.
                configs = config::load_config_file(&value)?;
            }
            _ => {
                if let Some(current) = configs.last_mut() {
                    config::apply_option(current, long, &value)?;
                }
            }
        }
        i += 1;
    }

    Ok(Command::Run(configs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("udp_wgobfs")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_no_arguments_is_an_error() {
        assert!(parse_args(&args(&[])).is_err());
    }

    #[test]
    fn test_long_and_short_forms() {
        let parsed = parse_args(&args(&[
            "--source-lport=1234",
            "-t",
            "10.0.0.1:51820",
            "--key",
            "secret",
            "-v",
            "DEBUG",
        ]))
        .unwrap();
        let configs = match parsed {
            Command::Run(c) => c,
            _ => panic!("expected Run"),
        };
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].listen_port, Some(1234));
        assert_eq!(configs[0].target.as_deref(), Some("10.0.0.1:51820"));
        assert_eq!(configs[0].key.as_deref(), Some("secret"));
        assert_eq!(configs[0].verbose, log::LevelFilter::Debug);
    }

    #[test]
    fn test_help_and_version() {
        assert!(matches!(parse_args(&args(&["--help"])).unwrap(), Command::Help));
        assert!(matches!(parse_args(&args(&["-V"])).unwrap(), Command::Version));
    }

    #[test]
    fn test_unknown_option_rejected() {
        assert!(parse_args(&args(&["--bogus", "1"])).is_err());
        assert!(parse_args(&args(&["positional"])).is_err());
    }

    #[test]
    fn test_missing_value_rejected() {
        assert!(parse_args(&args(&["--key"])).is_err());
    }
}
