/*
 * Copyright (c) 2025 sh0rch <sh0rch@iwl.dev>
 *
 * This file is part of udp_wgobfs.
 *
 * Licensed under the MIT License. See LICENSE file in the project root for full license information.
 */

//! Masking profiles: pluggable outer framings that make the obfuscated
//! stream look like a harmless, well-known protocol.
//!
//! A profile wraps outbound obfuscated datagrams, strips its framing from
//! inbound ones, may emit cover traffic when a handshake passes through,
//! and may run a periodic keep-alive timer. Profiles never see plaintext
//! WireGuard; they operate strictly outside the obfuscation layer.

use std::io;
use std::net::SocketAddrV4;
use std::time::Duration;

pub mod stun;

/// Packet travel direction through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// Outcome of a profile's attempt to strip its framing from a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unwrapped {
    /// The inner payload of the given length now sits at the start of the
    /// buffer and should be forwarded.
    Payload(usize),
    /// The datagram was a cover message and has been handled in full;
    /// nothing is forwarded.
    Consumed,
    /// The datagram does not belong to this profile.
    NotMine,
}

/// Send callbacks handed to profile hooks: `send_back` towards the
/// datagram's sender, `send_forward` towards the opposite side.
/// `send_forward` is absent during auto-detection, before any egress
/// socket exists for the sender.
pub struct SendCtx<'a> {
    pub send_back: &'a dyn Fn(&[u8]) -> io::Result<usize>,
    pub send_forward: Option<&'a dyn Fn(&[u8]) -> io::Result<usize>>,
}

/// A masking profile. Implementations must be stateless (session state
/// lives in the client entry); the relay pins at most one profile per
/// client session.
pub trait MaskingProfile: Sync {
    /// Short lowercase identifier used in configuration and logs.
    fn name(&self) -> &'static str;

    /// Keep-alive period, or `None` when the profile runs no timer.
    fn timer_interval(&self) -> Option<Duration>;

    /// Called when a plaintext WireGuard handshake is about to be
    /// forwarded, so the profile can emit a plausible cover burst ahead of
    /// it. Best-effort; failures are logged and ignored.
    fn on_handshake_req(
        &self,
        direction: Direction,
        src: &SocketAddrV4,
        dst: &SocketAddrV4,
        ctx: &SendCtx,
    );

    /// Wraps an obfuscated datagram in the profile's framing, in place.
    /// Returns the new length, or `None` when the envelope would not fit
    /// the buffer.
    fn wrap(
        &self,
        buffer: &mut [u8],
        length: usize,
        direction: Direction,
        src: &SocketAddrV4,
        dst: &SocketAddrV4,
        ctx: &SendCtx,
    ) -> Option<usize>;

    /// Strips the profile's framing from an inbound datagram, answering
    /// cover messages as a side effect.
    fn unwrap(
        &self,
        buffer: &mut [u8],
        length: usize,
        direction: Direction,
        src: &SocketAddrV4,
        dst: &SocketAddrV4,
        ctx: &SendCtx,
    ) -> Unwrapped;

    /// Periodic keep-alive hook; emits cover packets on whichever sides of
    /// the session currently speak the obfuscated format.
    fn on_timer(
        &self,
        client_obfuscated: bool,
        server_obfuscated: bool,
        client_addr: &SocketAddrV4,
        server_addr: &SocketAddrV4,
        to_client: &dyn Fn(&[u8]) -> io::Result<usize>,
        to_server: &dyn Fn(&[u8]) -> io::Result<usize>,
    );
}

/// All registered profiles, in auto-detection order.
pub static PROFILES: &[&dyn MaskingProfile] = &[&stun::Stun];

/// Looks a profile up by its configured name (case-insensitive).
pub fn find_profile(name: &str) -> Option<&'static dyn MaskingProfile> {
    PROFILES.iter().copied().find(|p| p.name().eq_ignore_ascii_case(name))
}

/// Asks every registered profile to unwrap an obfuscated-looking datagram
/// from an unknown sender. The first profile that recognises the framing
/// wins and is returned alongside its result so the caller can pin it on
/// the client session.
pub fn autodetect(
    buffer: &mut [u8],
    length: usize,
    src: &SocketAddrV4,
    dst: &SocketAddrV4,
    ctx: &SendCtx,
) -> (Unwrapped, Option<&'static dyn MaskingProfile>) {
    for &profile in PROFILES {
        match profile.unwrap(buffer, length, Direction::ClientToServer, src, dst, ctx) {
            Unwrapped::NotMine => continue,
            result => {
                log::trace!("Autodetected masking profile for packet from {src}: {}", profile.name());
                return (result, Some(profile));
            }
        }
    }
    (Unwrapped::NotMine, None)
}
