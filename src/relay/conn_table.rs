/*
 * Copyright (c) 2025 sh0rch <sh0rch@iwl.dev>
 *
 * This file is part of udp_wgobfs.
 *
 * Licensed under the MIT License. See LICENSE file in the project root for full license information.
 */

//! Connection table: one entry per observed client endpoint.
//!
//! Each entry owns a dedicated egress UDP socket connected to the target
//! (so plain `send`/`recv` suffice and the OS filters spoofed replies) and
//! the per-session obfuscation state. Entries are created dynamically on
//! the first handshake from an unknown client, or eagerly at startup for
//! static bindings; dynamic entries are purged by the housekeeping tick.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use crate::codec::OBFUSCATION_VERSION;
use crate::masking::{Direction, MaskingProfile};
use crate::netutils::sockopt;
use crate::relay::HANDSHAKE_TIMEOUT;

/// Per-client session state.
pub struct ClientEntry {
    /// Client endpoint; always equals the table key for this entry.
    client_addr: SocketAddrV4,
    /// Local endpoint of the egress socket.
    pub our_addr: SocketAddrV4,
    /// Egress socket, connected to the resolved target.
    pub sock: UdpSocket,
    pub last_activity: Instant,
    pub last_handshake_request: Option<Instant>,
    pub last_handshake: Option<Instant>,
    pub last_masking_timer: Instant,
    /// Obfuscation version for this session; downgrade-only.
    pub version: u8,
    /// Masking profile pinned to this session, if any.
    pub masking: Option<&'static dyn MaskingProfile>,
    pub handshaked: bool,
    pub handshake_direction: Direction,
    /// True when the client side speaks the obfuscated format.
    pub client_obfuscated: bool,
    /// True when the server side speaks the obfuscated format.
    pub server_obfuscated: bool,
    pub is_static: bool,
}

impl std::fmt::Debug for ClientEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientEntry")
            .field("client_addr", &self.client_addr)
            .field("our_addr", &self.our_addr)
            .field("sock", &self.sock)
            .field("last_activity", &self.last_activity)
            .field("last_handshake_request", &self.last_handshake_request)
            .field("last_handshake", &self.last_handshake)
            .field("last_masking_timer", &self.last_masking_timer)
            .field("version", &self.version)
            .field("masking", &self.masking.map(MaskingProfile::name))
            .field("handshaked", &self.handshaked)
            .field("handshake_direction", &self.handshake_direction)
            .field("client_obfuscated", &self.client_obfuscated)
            .field("server_obfuscated", &self.server_obfuscated)
            .field("is_static", &self.is_static)
            .finish()
    }
}

impl ClientEntry {
    pub fn client_addr(&self) -> SocketAddrV4 {
        self.client_addr
    }

    /// Purge policy: a non-static entry expires when idle past the idle
    /// timeout, or when it never completed a handshake and has been quiet
    /// past the handshake window.
    pub fn expired(&self, now: Instant, idle_timeout: Duration) -> bool {
        if self.is_static {
            return false;
        }
        let idle = now.saturating_duration_since(self.last_activity);
        idle >= idle_timeout || (!self.handshaked && idle >= HANDSHAKE_TIMEOUT)
    }
}

/// Socket options applied to every egress socket.
fn configure_egress(sock: &UdpSocket, fwmark: Option<u32>) -> io::Result<()> {
    sockopt::set_dont_fragment(sock)?;
    if let Some(mark) = fwmark {
        sockopt::set_fwmark(sock, mark)?;
    }
    Ok(())
}

fn local_v4(sock: &UdpSocket) -> io::Result<SocketAddrV4> {
    match sock.local_addr()? {
        std::net::SocketAddr::V4(v4) => Ok(v4),
        _ => Err(io::Error::new(io::ErrorKind::Other, "egress socket is not IPv4")),
    }
}

/// Endpoint-keyed map of client entries with a hard capacity cap.
pub struct ConnTable {
    entries: HashMap<SocketAddrV4, ClientEntry>,
    max_clients: usize,
}

impl ConnTable {
    pub fn new(max_clients: usize) -> Self {
        ConnTable { entries: HashMap::new(), max_clients }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, addr: &SocketAddrV4) -> bool {
        self.entries.contains_key(addr)
    }

    pub fn get(&self, addr: &SocketAddrV4) -> Option<&ClientEntry> {
        self.entries.get(addr)
    }

    pub fn get_mut(&mut self, addr: &SocketAddrV4) -> Option<&mut ClientEntry> {
        self.entries.get_mut(addr)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&SocketAddrV4, &mut ClientEntry)> {
        self.entries.iter_mut()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = ClientEntry> + '_ {
        self.entries.drain().map(|(_, e)| e)
    }

    fn insert(
        &mut self,
        client_addr: SocketAddrV4,
        sock: UdpSocket,
        target: SocketAddrV4,
        is_static: bool,
        now: Instant,
    ) -> io::Result<&mut ClientEntry> {
        sock.connect(target)?;
        let our_addr = local_v4(&sock)?;
        let entry = ClientEntry {
            client_addr,
            our_addr,
            sock,
            last_activity: now,
            last_handshake_request: None,
            last_handshake: None,
            last_masking_timer: now,
            version: OBFUSCATION_VERSION,
            masking: None,
            handshaked: false,
            handshake_direction: Direction::ClientToServer,
            client_obfuscated: false,
            server_obfuscated: false,
            is_static,
        };
        Ok(self.entries.entry(client_addr).or_insert(entry))
    }

    /// Creates an entry for a newly observed client: a fresh egress socket
    /// on an OS-assigned port, connected to the target. Fails cleanly at
    /// the capacity cap.
    pub fn insert_dynamic(
        &mut self,
        client_addr: SocketAddrV4,
        target: SocketAddrV4,
        fwmark: Option<u32>,
        now: Instant,
    ) -> io::Result<&mut ClientEntry> {
        if self.entries.len() >= self.max_clients {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("Maximum number of clients reached ({})", self.max_clients),
            ));
        }
        let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        configure_egress(&sock, fwmark)?;
        self.insert(client_addr, sock, target, false, now)
    }

    /// Creates a static-binding entry with the egress socket bound to the
    /// requested local port. Duplicate client endpoints are rejected.
    pub fn insert_static(
        &mut self,
        client_addr: SocketAddrV4,
        local_port: u16,
        target: SocketAddrV4,
        fwmark: Option<u32>,
        now: Instant,
    ) -> io::Result<&mut ClientEntry> {
        if self.entries.contains_key(&client_addr) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("Duplicate static binding for client {client_addr}"),
            ));
        }
        if self.entries.len() >= self.max_clients {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("Maximum number of clients reached ({})", self.max_clients),
            ));
        }
        let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, local_port))?;
        configure_egress(&sock, fwmark)?;
        self.insert(client_addr, sock, target, true, now)
    }

    pub fn remove(&mut self, addr: &SocketAddrV4) -> Option<ClientEntry> {
        self.entries.remove(addr)
    }

    /// Removes and returns every entry the purge policy considers expired,
    /// so the caller can deregister their sockets before they close.
    pub fn take_expired(&mut self, now: Instant, idle_timeout: Duration) -> Vec<ClientEntry> {
        let expired: Vec<SocketAddrV4> = self
            .entries
            .values()
            .filter(|e| e.expired(now, idle_timeout))
            .map(|e| e.client_addr)
            .collect();
        expired.into_iter().filter_map(|addr| self.entries.remove(&addr)).collect()
    }
}
