/*
 * Copyright (c) 2025 sh0rch <sh0rch@iwl.dev>
 *
 * This file is part of udp_wgobfs.
 *
 * Licensed under the MIT License. See LICENSE file in the project root for full license information.
 */

//! UDP echo/probe utility for exercising a deployed relay by hand.
//!
//! In server mode it stands in for the upstream endpoint: every datagram
//! is dumped and echoed back to its sender, so a relay pointed at it
//! round-trips whatever the client side produces. In probe mode it emits
//! WireGuard-shaped datagrams (a handshake initiation followed by
//! transport-data packets) towards the relay and dumps everything that
//! comes back.
//!
//! Dumps use the same single-line hex form as the relay's TRACE output,
//! tagged with whether the first 32-bit word still looks like a WireGuard
//! type — the quickest way to see which side of a relay chain you are on.
//!
//! Usage:
//! - As a server: `udp_echo [bind_addr] [port]`
//! - As a probe:  `udp_echo --probe [relay_ip] [port] [payload_len]`

use std::env;
use std::net::UdpSocket;
use std::thread;
use std::time::Duration;

/// `wireguard` when the first little-endian word is a valid WireGuard
/// type, `obfuscated` otherwise (the relay's own classification rule).
fn shape_tag(buf: &[u8]) -> &'static str {
    if buf.len() >= 4 && (1..=4).contains(&u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])) {
        "wireguard"
    } else {
        "obfuscated"
    }
}

/// Builds a WireGuard-shaped datagram: 4-byte little-endian type header
/// followed by a recognisable payload pattern.
fn wg_shaped_packet(wg_type: u8, payload_len: usize) -> Vec<u8> {
    let mut packet = vec![wg_type, 0, 0, 0];
    packet.extend((0..payload_len).map(|i| (i & 0xFF) as u8));
    packet
}

/// Sends a handshake-initiation-shaped probe and then data-shaped probes
/// through the relay, dumping every response.
fn run_probe(ip: &str, port: u16, payload_len: usize) {
    let sock = UdpSocket::bind("0.0.0.0:0").expect("bind failed");
    sock.set_read_timeout(Some(Duration::from_secs(2))).expect("set timeout failed");
    let dest = format!("{ip}:{port}");

    let handshake = wg_shaped_packet(0x01, 28);
    sock.send_to(&handshake, &dest).expect("send_to failed");
    println!(
        "[probe] sent {} bytes ({}) to {dest}: {}",
        handshake.len(),
        shape_tag(&handshake),
        hex::encode_upper(&handshake)
    );

    let mut buf = [0u8; 65535];
    match sock.recv_from(&mut buf) {
        Ok((len, src)) => println!(
            "[probe] got {len} bytes ({}) from {src}: {}",
            shape_tag(&buf[..len]),
            hex::encode_upper(&buf[..len])
        ),
        Err(_) => println!("[probe] no reply to handshake probe (relay drops data until a real handshake completes)"),
    }

    loop {
        let data = wg_shaped_packet(0x04, payload_len);
        sock.send_to(&data, &dest).expect("send_to failed");
        println!("[probe] sent {} bytes ({}) to {dest}", data.len(), shape_tag(&data));

        match sock.recv_from(&mut buf) {
            Ok((len, src)) => println!(
                "[probe] got {len} bytes ({}) from {src}: {}",
                shape_tag(&buf[..len]),
                hex::encode_upper(&buf[..len])
            ),
            Err(_) => println!("[probe] no reply"),
        }
        thread::sleep(Duration::from_secs(1));
    }
}

/// Echoes every received datagram back to its sender.
fn run_server(bind_addr: &str, port: u16) {
    let addr = format!("{bind_addr}:{port}");
    let sock = UdpSocket::bind(&addr).expect("bind failed");
    println!("[server] echoing on {addr}");

    let mut buf = [0u8; 65535];
    loop {
        match sock.recv_from(&mut buf) {
            Ok((len, src)) => {
                println!(
                    "[server] got {len} bytes ({}) from {src}: {}",
                    shape_tag(&buf[..len]),
                    hex::encode_upper(&buf[..len])
                );
                if let Err(e) = sock.send_to(&buf[..len], src) {
                    eprintln!("[server] failed to send echo: {e}");
                }
            }
            Err(e) => {
                eprintln!("[server] recv_from failed: {e}");
                thread::sleep(Duration::from_secs(1));
            }
        }
    }
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() > 1 && args[1] == "--probe" {
        let ip = args.get(2).map(|s| s.as_str()).unwrap_or("127.0.0.1");
        let port: u16 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(51820);
        let payload_len: usize = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(64);
        run_probe(ip, port, payload_len);
    } else {
        let bind_addr = args.get(1).map(|s| s.as_str()).unwrap_or("0.0.0.0");
        let port: u16 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(51820);
        run_server(bind_addr, port);
    }
}
