/*
 * Copyright (c) 2025 sh0rch <sh0rch@iwl.dev>
 *
 * This file is part of udp_wgobfs.
 *
 * Licensed under the MIT License. See LICENSE file in the project root for full license information.
 */

//! # Relay event loop
//!
//! Single-threaded readiness loop over the ingress socket plus every
//! per-client egress socket. Each datagram is classified by the
//! obfuscation marker, optionally unmasked and decoded, run through the
//! handshake state machine, re-encoded for the opposite side and
//! forwarded. A housekeeping tick purges expired entries and drives the
//! masking keep-alive timers.
//!
//! Per-packet errors never leave an iteration: every datagram is either
//! forwarded or dropped with a log line, and UDP semantics leave
//! retransmission to the endpoints.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddrV4, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, error, info, log_enabled, trace, warn, Level};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use sha2::{Digest, Sha256};

use crate::codec::{self, WgType};
use crate::config::ObfuscatorConfig;
use crate::masking::{self, Direction, MaskingProfile, SendCtx, Unwrapped};
use crate::netutils::{self, poller::Poller, sockopt};
use crate::relay::conn_table::ConnTable;
use crate::relay::{
    shutdown_requested, BUFFER_SIZE, HANDSHAKE_TIMEOUT, ITERATE_INTERVAL, POLL_TIMEOUT_MS,
};

fn yn(v: bool) -> &'static str {
    if v {
        "yes"
    } else {
        "no"
    }
}

/// Hex dump of a forwarded datagram, TRACE only.
fn dump_packet(tag: &str, data: &[u8]) {
    if log_enabled!(Level::Trace) {
        trace!("{tag}: {}", hex::encode_upper(data));
    }
}

/// Seeds the per-instance padding generator. Padding lengths and the
/// randomised type byte only need to be unpredictable to an observer, not
/// cryptographically strong; startup entropy is folded with the endpoints
/// this instance owns so sections running in the same process never share
/// a keystream of padding decisions.
fn instance_rng(listen: &SocketAddrV4, target: &SocketAddrV4) -> SmallRng {
    let clock = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64;
    let endpoints = ((u32::from(*listen.ip()) as u64) << 32)
        | ((listen.port() as u64) << 16)
        | (target.port() as u64);
    let upstream = (u32::from(*target.ip()) as u64) << 8;
    let seed = clock.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ fastrand::u64(..) ^ endpoints ^ upstream;
    SmallRng::seed_from_u64(seed)
}

/// One relay instance: ingress socket, connection table and the loop state.
pub struct Relay {
    listen_sock: UdpSocket,
    listen_fd: RawFd,
    target: SocketAddrV4,
    key: Vec<u8>,
    max_dummy_data: usize,
    idle_timeout: Duration,
    fwmark: Option<u32>,
    pinned_masking: Option<&'static dyn MaskingProfile>,
    table: ConnTable,
    poller: Poller,
    /// Egress socket descriptor back to the owning client endpoint.
    fd_map: HashMap<RawFd, SocketAddrV4>,
    buf: Vec<u8>,
    rng: SmallRng,
    last_tick: Instant,
}

impl Relay {
    /// Builds a relay from a validated configuration: resolves the target,
    /// binds the ingress socket, sets up readiness and pre-populates the
    /// static bindings. Every failure here is fatal for the instance.
    pub fn new(config: &ObfuscatorConfig) -> io::Result<Relay> {
        let listen_port = config
            .listen_port
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "'source-lport' is not set"))?;
        let target_str = config
            .target
            .as_deref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "'target' is not set"))?;
        let key = config
            .key
            .as_deref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "'key' is not set"))?
            .as_bytes()
            .to_vec();

        let pinned_masking = match config.masking.as_deref() {
            Some(name) => Some(masking::find_profile(name).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("Unknown masking profile: {name}"))
            })?),
            None => None,
        };

        let target = netutils::resolve_ipv4(target_str)?;
        info!("Target: {target}");

        let listen_sock = UdpSocket::bind(SocketAddrV4::new(config.listen_addr, listen_port))
            .map_err(|e| io::Error::new(e.kind(), format!("source socket bind: {e}")))?;
        let listen_fd = listen_sock.as_raw_fd();
        let listen_local = match listen_sock.local_addr()? {
            std::net::SocketAddr::V4(v4) => v4,
            _ => SocketAddrV4::new(config.listen_addr, listen_port),
        };
        info!("Listening on {listen_local} for source");

        // The key itself must never reach the logs.
        debug!("Key fingerprint: {}", &hex::encode(Sha256::digest(&key))[..16]);

        let mut poller = Poller::new()?;
        poller.register(listen_fd)?;

        let now = Instant::now();
        let mut table = ConnTable::new(config.max_clients);
        let mut fd_map = HashMap::new();
        for binding in &config.static_bindings {
            let entry =
                table.insert_static(binding.client, binding.local_port, target, config.fwmark, now)?;
            let fd = entry.sock.as_raw_fd();
            let our_port = entry.our_addr.port();
            poller.register(fd)?;
            fd_map.insert(fd, binding.client);
            info!("Static binding: client {} via local port {our_port}", binding.client);
        }

        Ok(Relay {
            listen_sock,
            listen_fd,
            target,
            key,
            max_dummy_data: config.max_dummy_data,
            idle_timeout: config.idle_timeout,
            fwmark: config.fwmark,
            pinned_masking,
            table,
            poller,
            fd_map,
            buf: vec![0u8; BUFFER_SIZE],
            rng: instance_rng(&listen_local, &target),
            last_tick: now,
        })
    }

    /// Runs until a shutdown signal is observed.
    pub fn run(&mut self) -> io::Result<()> {
        info!("WireGuard obfuscator successfully started");
        let mut ready: Vec<RawFd> = Vec::new();
        while !shutdown_requested() {
            self.poller.wait(&mut ready, POLL_TIMEOUT_MS)?;
            let now = Instant::now();
            for &fd in ready.iter() {
                if fd == self.listen_fd {
                    self.handle_ingress(now);
                } else if let Some(&client_addr) = self.fd_map.get(&fd) {
                    self.handle_egress(client_addr, now);
                }
            }
            if now.saturating_duration_since(self.last_tick) >= ITERATE_INTERVAL {
                self.housekeeping(now);
                self.last_tick = now;
            }
        }
        self.shutdown();
        Ok(())
    }

    /// Client → server path.
    fn handle_ingress(&mut self, now: Instant) {
        let (received, src) = match sockopt::recv_from_trunc(&self.listen_sock, &mut self.buf) {
            Ok(v) => v,
            Err(e) => {
                debug!("recvfrom failed: {e}");
                return;
            }
        };
        if received > BUFFER_SIZE {
            debug!("Received oversized packet from {src} ({received} bytes), ignoring");
            return;
        }
        if received < 4 {
            debug!("Received too short packet from {src} ({received} bytes), ignoring");
            return;
        }

        let mut length = received;
        let obfuscated = codec::is_obfuscated(&self.buf[..length]);
        let known = self.table.contains(&src);
        trace!(
            "Received {length} bytes from {src} to {} (known={}, obfuscated={})",
            self.target,
            yn(known),
            yn(obfuscated)
        );
        dump_packet(if obfuscated { "X->" } else { "O->" }, &self.buf[..length]);

        // Masking layer: strip a known framing, or auto-detect one for an
        // unknown client. Cover messages end here.
        let mut detected: Option<&'static dyn MaskingProfile> = None;
        if obfuscated {
            let listen_sock = &self.listen_sock;
            let send_back = move |b: &[u8]| listen_sock.send_to(b, src);
            let entry = self.table.get(&src);
            let profile = match entry {
                Some(e) => e.masking,
                None => self.pinned_masking,
            };
            let send_forward_cl = entry.map(|e| {
                let sock = &e.sock;
                move |b: &[u8]| sock.send(b)
            });
            let send_forward = send_forward_cl
                .as_ref()
                .map(|c| c as &dyn Fn(&[u8]) -> io::Result<usize>);
            let ctx = SendCtx { send_back: &send_back, send_forward };

            let result = if let Some(profile) = profile {
                profile.unwrap(&mut self.buf, length, Direction::ClientToServer, &src, &self.target, &ctx)
            } else if !known {
                let (result, profile) =
                    masking::autodetect(&mut self.buf, length, &src, &self.target, &ctx);
                detected = profile;
                result
            } else {
                Unwrapped::NotMine
            };
            match result {
                Unwrapped::Payload(n) => length = n,
                Unwrapped::Consumed => return,
                // Not a known masked format: treat as a bare obfuscated datagram.
                Unwrapped::NotMine => {}
            }
        }
        if length < 4 {
            debug!("Received too short packet from {src} after unmasking ({length} bytes), ignoring");
            return;
        }

        let mut peer_version = None;
        if obfuscated {
            match codec::decode(&mut self.buf, length, &self.key) {
                Some(d) => {
                    length = d.length;
                    peer_version = Some(d.version);
                }
                None => {
                    debug!("Failed to decode packet from {src}");
                    return;
                }
            }
        }

        match codec::wg_packet_type(&self.buf[..length]) {
            Some(WgType::Handshake) => {
                info!(
                    "Received WireGuard handshake from {src} ({length} bytes, obfuscated={})",
                    yn(obfuscated)
                );
                if !self.table.contains(&src) {
                    let entry = match self.table.insert_dynamic(src, self.target, self.fwmark, now)
                    {
                        Ok(e) => e,
                        Err(e) => {
                            error!("Failed to add client {src}: {e}");
                            return;
                        }
                    };
                    entry.masking = self.pinned_masking.or(detected);
                    let fd = entry.sock.as_raw_fd();
                    let our_port = entry.our_addr.port();
                    if let Err(e) = self.poller.register(fd) {
                        error!("Failed to register egress socket for {src}: {e}");
                        self.table.remove(&src);
                        return;
                    }
                    self.fd_map.insert(fd, src);
                    debug!("Added client {src}, egress port {our_port}");
                }
                let Some(entry) = self.table.get_mut(&src) else { return };
                entry.handshake_direction = Direction::ClientToServer;
                entry.last_handshake_request = Some(now);
                if !obfuscated {
                    if let Some(profile) = entry.masking {
                        let listen_sock = &self.listen_sock;
                        let send_back = move |b: &[u8]| listen_sock.send_to(b, src);
                        let sock = &entry.sock;
                        let send_forward = move |b: &[u8]| sock.send(b);
                        profile.on_handshake_req(
                            Direction::ClientToServer,
                            &src,
                            &self.target,
                            &SendCtx { send_back: &send_back, send_forward: Some(&send_forward) },
                        );
                    }
                }
            }
            Some(WgType::HandshakeResp) => {
                info!(
                    "Received WireGuard handshake response from {src} ({length} bytes, obfuscated={})",
                    yn(obfuscated)
                );
                let Some(entry) = self.table.get_mut(&src) else {
                    debug!("Ignoring handshake response from unknown client {src}");
                    return;
                };
                let in_window = entry
                    .last_handshake_request
                    .is_some_and(|t| now.saturating_duration_since(t) <= HANDSHAKE_TIMEOUT);
                if entry.handshake_direction != Direction::ServerToClient || !in_window {
                    debug!("Ignoring WireGuard handshake response from {src}, handshake timeout");
                    return;
                }
                let first = !entry.handshaked;
                entry.handshaked = true;
                entry.client_obfuscated = obfuscated;
                entry.server_obfuscated = !obfuscated;
                entry.last_handshake = Some(now);
                if first {
                    info!(
                        "Handshake for client {src} completed (client obfuscated={}, server obfuscated={})",
                        yn(entry.client_obfuscated),
                        yn(entry.server_obfuscated)
                    );
                    if let Some(profile) = entry.masking {
                        info!("Masking profile for client {src}: {}", profile.name());
                    }
                }
            }
            _ => {
                if !self.table.get(&src).is_some_and(|e| e.handshaked) {
                    debug!(
                        "Ignoring data from {src} to {} until the handshake is completed",
                        self.target
                    );
                    return;
                }
            }
        }

        let Some(entry) = self.table.get_mut(&src) else { return };
        if let Some(version) = peer_version {
            if version < entry.version {
                warn!(
                    "Client {src} uses obfuscation version {version}, downgrading from {}",
                    entry.version
                );
                entry.version = version;
            }
        }

        if !obfuscated {
            length = codec::encode(
                &mut self.buf,
                length,
                &self.key,
                entry.version,
                self.max_dummy_data,
                &mut self.rng,
            );
            if let Some(profile) = entry.masking {
                let listen_sock = &self.listen_sock;
                let send_back = move |b: &[u8]| listen_sock.send_to(b, src);
                let sock = &entry.sock;
                let send_forward = move |b: &[u8]| sock.send(b);
                let ctx = SendCtx { send_back: &send_back, send_forward: Some(&send_forward) };
                match profile.wrap(&mut self.buf, length, Direction::ClientToServer, &src, &self.target, &ctx)
                {
                    Some(n) => length = n,
                    None => return,
                }
            }
        }

        dump_packet(if obfuscated { "O->" } else { "X->" }, &self.buf[..length]);
        match entry.sock.send(&self.buf[..length]) {
            Ok(sent) if sent != length => {
                warn!("Partial send to server for {src} ({sent} of {length} bytes)")
            }
            Ok(_) => {}
            Err(e) => debug!("send to server failed for {src}: {e}"),
        }
        entry.last_activity = now;
    }

    /// Server → client path, mirrored from [`Relay::handle_ingress`].
    fn handle_egress(&mut self, client_addr: SocketAddrV4, now: Instant) {
        let received = {
            let Some(entry) = self.table.get(&client_addr) else { return };
            match sockopt::recv_trunc(&entry.sock, &mut self.buf) {
                Ok(n) => n,
                Err(e) => {
                    debug!("recv failed: {e}");
                    return;
                }
            }
        };
        if received > BUFFER_SIZE {
            debug!("Received oversized packet from {} ({received} bytes), ignoring", self.target);
            return;
        }
        if received < 4 {
            debug!("Received too short packet from {} ({received} bytes), ignoring", self.target);
            return;
        }

        let mut length = received;
        let obfuscated = codec::is_obfuscated(&self.buf[..length]);
        trace!(
            "Received {length} bytes from {} to {client_addr} (obfuscated={})",
            self.target,
            yn(obfuscated)
        );
        dump_packet(if obfuscated { "<-X" } else { "<-O" }, &self.buf[..length]);

        if obfuscated {
            let entry = match self.table.get(&client_addr) {
                Some(e) => e,
                None => return,
            };
            if let Some(profile) = entry.masking {
                let sock = &entry.sock;
                let send_back = move |b: &[u8]| sock.send(b);
                let listen_sock = &self.listen_sock;
                let send_forward = move |b: &[u8]| listen_sock.send_to(b, client_addr);
                let ctx = SendCtx { send_back: &send_back, send_forward: Some(&send_forward) };
                match profile.unwrap(
                    &mut self.buf,
                    length,
                    Direction::ServerToClient,
                    &self.target,
                    &client_addr,
                    &ctx,
                ) {
                    Unwrapped::Payload(n) => length = n,
                    Unwrapped::Consumed => return,
                    Unwrapped::NotMine => {}
                }
            }
        }
        if length < 4 {
            debug!(
                "Received too short packet from {} after unmasking ({length} bytes), ignoring",
                self.target
            );
            return;
        }

        let mut peer_version = None;
        if obfuscated {
            match codec::decode(&mut self.buf, length, &self.key) {
                Some(d) => {
                    length = d.length;
                    peer_version = Some(d.version);
                }
                None => {
                    debug!("Failed to decode packet from {}", self.target);
                    return;
                }
            }
        }

        let target = self.target;
        let Some(entry) = self.table.get_mut(&client_addr) else { return };
        match codec::wg_packet_type(&self.buf[..length]) {
            Some(WgType::Handshake) => {
                // Real WireGuard servers do not initiate handshakes
                // unprompted; tolerated for NAT-traversal setups.
                info!(
                    "Received unusual reverse WireGuard handshake from {target} for {client_addr} ({length} bytes, obfuscated={})",
                    yn(obfuscated)
                );
                entry.handshake_direction = Direction::ServerToClient;
                entry.last_handshake_request = Some(now);
                if !obfuscated {
                    if let Some(profile) = entry.masking {
                        let sock = &entry.sock;
                        let send_back = move |b: &[u8]| sock.send(b);
                        let listen_sock = &self.listen_sock;
                        let send_forward = move |b: &[u8]| listen_sock.send_to(b, client_addr);
                        profile.on_handshake_req(
                            Direction::ServerToClient,
                            &target,
                            &client_addr,
                            &SendCtx { send_back: &send_back, send_forward: Some(&send_forward) },
                        );
                    }
                }
            }
            Some(WgType::HandshakeResp) => {
                info!(
                    "Received WireGuard handshake response from {target} ({length} bytes, obfuscated={})",
                    yn(obfuscated)
                );
                let in_window = entry
                    .last_handshake_request
                    .is_some_and(|t| now.saturating_duration_since(t) <= HANDSHAKE_TIMEOUT);
                if entry.handshake_direction != Direction::ClientToServer || !in_window {
                    debug!("Ignoring WireGuard handshake response, handshake timeout");
                    return;
                }
                let first = !entry.handshaked;
                entry.handshaked = true;
                entry.server_obfuscated = obfuscated;
                entry.client_obfuscated = !obfuscated;
                entry.last_handshake = Some(now);
                if first {
                    info!(
                        "Handshake for client {client_addr} completed (client obfuscated={}, server obfuscated={})",
                        yn(entry.client_obfuscated),
                        yn(entry.server_obfuscated)
                    );
                    if let Some(profile) = entry.masking {
                        info!("Masking profile for client {client_addr}: {}", profile.name());
                    }
                }
            }
            _ => {
                if !entry.handshaked {
                    debug!(
                        "Ignoring response from {target} to {client_addr} until the handshake is completed"
                    );
                    return;
                }
            }
        }

        if let Some(version) = peer_version {
            if version < entry.version {
                warn!(
                    "Server uses obfuscation version {version} for client {client_addr}, downgrading from {}",
                    entry.version
                );
                entry.version = version;
            }
        }

        if !obfuscated {
            length = codec::encode(
                &mut self.buf,
                length,
                &self.key,
                entry.version,
                self.max_dummy_data,
                &mut self.rng,
            );
            if let Some(profile) = entry.masking {
                let sock = &entry.sock;
                let send_back = move |b: &[u8]| sock.send(b);
                let listen_sock = &self.listen_sock;
                let send_forward = move |b: &[u8]| listen_sock.send_to(b, client_addr);
                let ctx = SendCtx { send_back: &send_back, send_forward: Some(&send_forward) };
                match profile.wrap(
                    &mut self.buf,
                    length,
                    Direction::ServerToClient,
                    &target,
                    &client_addr,
                    &ctx,
                ) {
                    Some(n) => length = n,
                    None => return,
                }
            }
        }

        dump_packet(if obfuscated { "<-O" } else { "<-X" }, &self.buf[..length]);
        match self.listen_sock.send_to(&self.buf[..length], client_addr) {
            Ok(sent) if sent != length => {
                warn!("Partial send to client {client_addr} ({sent} of {length} bytes)")
            }
            Ok(_) => {}
            Err(e) => debug!("send to client {client_addr} failed: {e}"),
        }
        entry.last_activity = now;
    }

    /// Periodic tick: purge expired entries and fire masking keep-alives.
    fn housekeeping(&mut self, now: Instant) {
        for entry in self.table.take_expired(now, self.idle_timeout) {
            debug!("Removing idle client {}", entry.client_addr());
            let fd = entry.sock.as_raw_fd();
            if let Err(e) = self.poller.deregister(fd) {
                debug!("Failed to deregister egress socket for {}: {e}", entry.client_addr());
            }
            self.fd_map.remove(&fd);
            // The egress socket closes when the entry drops here.
        }

        let target = self.target;
        for (client_addr, entry) in self.table.iter_mut() {
            let Some(profile) = entry.masking else { continue };
            let Some(interval) = profile.timer_interval() else { continue };
            if now.saturating_duration_since(entry.last_masking_timer) < interval {
                continue;
            }
            entry.last_masking_timer = now;
            let listen_sock = &self.listen_sock;
            let to_client = move |b: &[u8]| listen_sock.send_to(b, *client_addr);
            let sock = &entry.sock;
            let to_server = move |b: &[u8]| sock.send(b);
            profile.on_timer(
                entry.client_obfuscated,
                entry.server_obfuscated,
                client_addr,
                &target,
                &to_client,
                &to_server,
            );
        }
    }

    /// Releases every socket; entries close as they drop.
    fn shutdown(&mut self) {
        for entry in self.table.drain() {
            let _ = self.poller.deregister(entry.sock.as_raw_fd());
        }
        self.fd_map.clear();
        let _ = self.poller.deregister(self.listen_fd);
        info!("Stopped.");
    }
}
