/*
 * Copyright (c) 2025 sh0rch <sh0rch@iwl.dev>
 *
 * This file is part of udp_wgobfs.
 *
 * Licensed under the MIT License. See LICENSE file in the project root for full license information.
 */

//! Address and checksum helpers shared by the relay core.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, ToSocketAddrs};

pub mod poller;
pub mod sockopt;

/// Splits a `host:port` string into its parts.
///
/// The host is returned verbatim (it may still need resolution); the port
/// must parse as a non-zero u16.
pub fn split_host_port(s: &str) -> io::Result<(&str, u16)> {
    let (host, port) = s.rsplit_once(':').ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("invalid host:port format: {s}"))
    })?;
    let port: u16 = port.parse().map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("invalid port: {s}"))
    })?;
    if host.is_empty() || port == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid host:port format: {s}"),
        ));
    }
    Ok((host, port))
}

/// Resolves `host:port` to an IPv4 endpoint.
///
/// IPv6 records are skipped; resolution failure or an IPv6-only host is an
/// error, reported once at startup.
pub fn resolve_ipv4(s: &str) -> io::Result<SocketAddrV4> {
    let (host, port) = split_host_port(s)?;
    let addrs = (host, port).to_socket_addrs().map_err(|e| {
        io::Error::new(io::ErrorKind::Other, format!("can't resolve hostname {host}: {e}"))
    })?;
    for addr in addrs {
        if let std::net::SocketAddr::V4(v4) = addr {
            return Ok(v4);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::Other,
        format!("no IPv4 address found for {host}"),
    ))
}

/// Parses a bare IPv4 address.
pub fn parse_ipv4(s: &str) -> io::Result<Ipv4Addr> {
    s.parse().map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("invalid IPv4 address: {s}"))
    })
}

/// Bitwise CRC-32 (reflected polynomial 0xEDB88320), as used by the STUN
/// FINGERPRINT attribute.
#[inline]
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = !0;
    for &b in data {
        crc ^= b as u32;
        for _ in 0..8 {
            let mix = crc & 1;
            crc >>= 1;
            if mix != 0 {
                crc ^= 0xEDB8_8320;
            }
        }
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_check_value() {
        // Standard CRC-32 check value.
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_crc32_empty() {
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn test_split_host_port() {
        let (host, port) = split_host_port("10.0.0.1:51820").unwrap();
        assert_eq!(host, "10.0.0.1");
        assert_eq!(port, 51820);

        let (host, port) = split_host_port("vpn.example.com:443").unwrap();
        assert_eq!(host, "vpn.example.com");
        assert_eq!(port, 443);

        assert!(split_host_port("no-port").is_err());
        assert!(split_host_port(":123").is_err());
        assert!(split_host_port("host:0").is_err());
        assert!(split_host_port("host:notaport").is_err());
    }

    #[test]
    fn test_resolve_ipv4_literal() {
        let addr = resolve_ipv4("127.0.0.1:51820").unwrap();
        assert_eq!(addr, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 51820));
    }

    #[test]
    fn test_parse_ipv4() {
        assert_eq!(parse_ipv4("0.0.0.0").unwrap(), Ipv4Addr::UNSPECIFIED);
        assert!(parse_ipv4("::1").is_err());
        assert!(parse_ipv4("256.0.0.1").is_err());
    }
}
