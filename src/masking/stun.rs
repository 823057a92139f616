/*
 * Copyright (c) 2025 sh0rch <sh0rch@iwl.dev>
 *
 * This file is part of udp_wgobfs.
 *
 * Licensed under the MIT License. See LICENSE file in the project root for full license information.
 */

//! STUN masking profile.
//!
//! Obfuscated payload travels inside RFC 5389-shaped Data Indication
//! messages (type 0x0115) carrying a single DATA attribute. Cover traffic
//! consists of Binding Requests with a FINGERPRINT attribute; received
//! Binding Requests are answered with a Binding Success Response echoing
//! the transaction ID and reporting the sender in XOR-MAPPED-ADDRESS, so
//! the relay passes for an ordinary STUN server.

use std::io;
use std::net::SocketAddrV4;
use std::time::Duration;

use log::{debug, trace, warn};
use rand::RngCore;

use crate::masking::{Direction, MaskingProfile, SendCtx, Unwrapped};
use crate::netutils::crc32;

/// RFC 5389 magic cookie, network byte order.
pub const MAGIC_COOKIE: [u8; 4] = [0x21, 0x12, 0xA4, 0x42];

const TYPE_BINDING_REQ: u16 = 0x0001;
const TYPE_BINDING_RESP: u16 = 0x0101;
const TYPE_DATA_IND: u16 = 0x0115;

const ATTR_XOR_MAPPED: u16 = 0x0020;
const ATTR_FINGERPRINT: u16 = 0x8028;
const ATTR_DATA: u16 = 0x0013;

const HEADER_LEN: usize = 20;
const ATTR_HEADER_LEN: usize = 4;
const TXID_LEN: usize = 12;

/// FINGERPRINT attribute XOR constant ("STUN").
const FINGERPRINT_XOR: u32 = 0x5354_554E;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// The profile singleton registered in [`crate::masking::PROFILES`].
pub struct Stun;

fn check_magic(buf: &[u8], len: usize) -> bool {
    len >= 8 && buf[4..8] == MAGIC_COOKIE
}

fn peek_type(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

fn write_header(buf: &mut [u8], msg_type: u16, msg_len: u16, txid: &[u8; TXID_LEN]) -> usize {
    buf[0..2].copy_from_slice(&msg_type.to_be_bytes());
    buf[2..4].copy_from_slice(&msg_len.to_be_bytes());
    buf[4..8].copy_from_slice(&MAGIC_COOKIE);
    buf[8..HEADER_LEN].copy_from_slice(txid);
    HEADER_LEN
}

/// Writes an XOR-MAPPED-ADDRESS attribute for `addr` at `at`.
fn put_xor_mapped_addr(buf: &mut [u8], at: usize, addr: &SocketAddrV4) -> usize {
    let b = &mut buf[at..at + 12];
    b[0..2].copy_from_slice(&ATTR_XOR_MAPPED.to_be_bytes());
    b[2..4].copy_from_slice(&8u16.to_be_bytes());
    b[4] = 0;
    b[5] = 0x01; // family IPv4
    let port = addr.port().to_be_bytes();
    b[6] = port[0] ^ MAGIC_COOKIE[0];
    b[7] = port[1] ^ MAGIC_COOKIE[1];
    let ip = addr.ip().octets();
    for i in 0..4 {
        b[8 + i] = ip[i] ^ MAGIC_COOKIE[i];
    }
    12
}

/// Appends a FINGERPRINT attribute covering the first `at` bytes.
fn put_fingerprint(buf: &mut [u8], at: usize) -> usize {
    let fp = crc32(&buf[..at]) ^ FINGERPRINT_XOR;
    let b = &mut buf[at..at + 8];
    b[0..2].copy_from_slice(&ATTR_FINGERPRINT.to_be_bytes());
    b[2..4].copy_from_slice(&4u16.to_be_bytes());
    b[4..8].copy_from_slice(&fp.to_be_bytes());
    8
}

fn fresh_txid() -> [u8; TXID_LEN] {
    let mut txid = [0u8; TXID_LEN];
    rand::rng().fill_bytes(&mut txid);
    txid
}

fn build_binding_request(out: &mut [u8]) -> usize {
    let txid = fresh_txid();
    write_header(out, TYPE_BINDING_REQ, 0, &txid);
    let mut msg_len = 0;
    msg_len += put_fingerprint(out, HEADER_LEN + msg_len);
    out[2..4].copy_from_slice(&(msg_len as u16).to_be_bytes());
    HEADER_LEN + msg_len
}

fn build_binding_success(out: &mut [u8], txid: &[u8; TXID_LEN], src: &SocketAddrV4) -> usize {
    write_header(out, TYPE_BINDING_RESP, 0, txid);
    let mut msg_len = 0;
    msg_len += put_xor_mapped_addr(out, HEADER_LEN + msg_len, src);
    msg_len += put_fingerprint(out, HEADER_LEN + msg_len);
    out[2..4].copy_from_slice(&(msg_len as u16).to_be_bytes());
    HEADER_LEN + msg_len
}

fn send_cover(what: &str, dst: &SocketAddrV4, send: &dyn Fn(&[u8]) -> io::Result<usize>) {
    let mut buffer = [0u8; 128];
    let len = build_binding_request(&mut buffer);
    match send(&buffer[..len]) {
        Err(e) => debug!("Can't send {what} to {dst}: {e}"),
        Ok(sent) if sent != len => {
            warn!("Partial send of {what} to {dst} ({sent} of {len} bytes)")
        }
        Ok(_) => trace!("Sent {what} ({len} bytes) to {dst}"),
    }
}

impl MaskingProfile for Stun {
    fn name(&self) -> &'static str {
        "stun"
    }

    fn timer_interval(&self) -> Option<Duration> {
        Some(KEEPALIVE_INTERVAL)
    }

    fn on_handshake_req(
        &self,
        _direction: Direction,
        _src: &SocketAddrV4,
        dst: &SocketAddrV4,
        ctx: &SendCtx,
    ) {
        if let Some(send_forward) = ctx.send_forward {
            send_cover("STUN binding request", dst, send_forward);
        }
    }

    fn wrap(
        &self,
        buffer: &mut [u8],
        length: usize,
        _direction: Direction,
        _src: &SocketAddrV4,
        _dst: &SocketAddrV4,
        _ctx: &SendCtx,
    ) -> Option<usize> {
        let total_add = HEADER_LEN + ATTR_HEADER_LEN;
        if length + total_add > buffer.len() {
            warn!("Can't wrap data in STUN, data too large ({length} bytes)");
            return None;
        }

        buffer.copy_within(0..length, total_add);

        let txid = fresh_txid();
        write_header(buffer, TYPE_DATA_IND, (ATTR_HEADER_LEN + length) as u16, &txid);
        buffer[HEADER_LEN..HEADER_LEN + 2].copy_from_slice(&ATTR_DATA.to_be_bytes());
        buffer[HEADER_LEN + 2..HEADER_LEN + 4].copy_from_slice(&(length as u16).to_be_bytes());

        Some(total_add + length)
    }

    fn unwrap(
        &self,
        buffer: &mut [u8],
        length: usize,
        _direction: Direction,
        src: &SocketAddrV4,
        _dst: &SocketAddrV4,
        ctx: &SendCtx,
    ) -> Unwrapped {
        if !check_magic(buffer, length) {
            return Unwrapped::NotMine;
        }

        match peek_type(buffer) {
            TYPE_BINDING_REQ => {
                trace!("Received STUN Binding Request from {src}");
                let mut txid = [0u8; TXID_LEN];
                txid.copy_from_slice(&buffer[8..HEADER_LEN]);
                let mut response = [0u8; 64];
                let resp_len = build_binding_success(&mut response, &txid, src);
                match (ctx.send_back)(&response[..resp_len]) {
                    Err(e) => debug!("Can't send STUN Binding Success Response to {src}: {e}"),
                    Ok(sent) if sent != resp_len => warn!(
                        "Partial send of STUN Binding Success Response to {src} ({sent} of {resp_len} bytes)"
                    ),
                    Ok(_) => trace!("Sent STUN Binding Success Response ({resp_len} bytes) to {src}"),
                }
                Unwrapped::Consumed
            }
            TYPE_BINDING_RESP => {
                trace!("Received STUN Binding Success Response from {src}, ignoring");
                Unwrapped::Consumed
            }
            TYPE_DATA_IND => {
                if length < HEADER_LEN + ATTR_HEADER_LEN {
                    debug!("Failed to unwrap STUN Data Indication from {src}");
                    return Unwrapped::NotMine;
                }
                let msg_len = u16::from_be_bytes([buffer[2], buffer[3]]) as usize;
                if msg_len + HEADER_LEN > length {
                    debug!("Failed to unwrap STUN Data Indication from {src}");
                    return Unwrapped::NotMine;
                }
                let attr_type = u16::from_be_bytes([buffer[HEADER_LEN], buffer[HEADER_LEN + 1]]);
                if attr_type != ATTR_DATA {
                    debug!("Failed to unwrap STUN Data Indication from {src}");
                    return Unwrapped::NotMine;
                }
                let data_len =
                    u16::from_be_bytes([buffer[HEADER_LEN + 2], buffer[HEADER_LEN + 3]]) as usize;
                if data_len + HEADER_LEN + ATTR_HEADER_LEN > length {
                    debug!("Failed to unwrap STUN Data Indication from {src}");
                    return Unwrapped::NotMine;
                }
                buffer.copy_within(
                    HEADER_LEN + ATTR_HEADER_LEN..HEADER_LEN + ATTR_HEADER_LEN + data_len,
                    0,
                );
                trace!("Unwrapped STUN Data Indication from {src} ({data_len} bytes)");
                Unwrapped::Payload(data_len)
            }
            other => {
                debug!("Received unknown STUN type {other:04X} from {src}, ignoring");
                Unwrapped::Consumed
            }
        }
    }

    fn on_timer(
        &self,
        client_obfuscated: bool,
        server_obfuscated: bool,
        client_addr: &SocketAddrV4,
        server_addr: &SocketAddrV4,
        to_client: &dyn Fn(&[u8]) -> io::Result<usize>,
        to_server: &dyn Fn(&[u8]) -> io::Result<usize>,
    ) {
        if client_obfuscated {
            send_cover("STUN binding request", client_addr, to_client);
        }
        if server_obfuscated {
            send_cover("STUN binding request", server_addr, to_server);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn test_addrs() -> (SocketAddrV4, SocketAddrV4) {
        ("192.0.2.1:40000".parse().unwrap(), "203.0.113.9:51820".parse().unwrap())
    }

    fn silent_ctx() -> SendCtx<'static> {
        fn reject(_: &[u8]) -> io::Result<usize> {
            panic!("nothing should be sent")
        }
        SendCtx { send_back: &reject, send_forward: None }
    }

    #[test]
    fn test_wrap_unwrap_round_trip() {
        let (src, dst) = test_addrs();
        let ctx = silent_ctx();
        let payload: Vec<u8> = (0..200u16).map(|i| (i % 251) as u8).collect();

        let mut buf = vec![0u8; 1024];
        buf[..payload.len()].copy_from_slice(&payload);

        let wrapped = Stun
            .wrap(&mut buf, payload.len(), Direction::ClientToServer, &src, &dst, &ctx)
            .expect("wrap failed");
        assert_eq!(wrapped, payload.len() + 24);
        assert_eq!(&buf[4..8], &MAGIC_COOKIE);
        assert_eq!(peek_type(&buf), TYPE_DATA_IND);
        // Message length covers the DATA attribute header plus payload.
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]) as usize, payload.len() + 4);

        let result = Stun.unwrap(&mut buf, wrapped, Direction::ClientToServer, &src, &dst, &ctx);
        assert_eq!(result, Unwrapped::Payload(payload.len()));
        assert_eq!(&buf[..payload.len()], &payload[..]);
    }

    #[test]
    fn test_wrap_refuses_oversized_payload() {
        let (src, dst) = test_addrs();
        let ctx = silent_ctx();
        let mut buf = vec![0u8; 100];
        assert!(Stun.wrap(&mut buf, 90, Direction::ClientToServer, &src, &dst, &ctx).is_none());
    }

    #[test]
    fn test_non_stun_is_not_mine() {
        let (src, dst) = test_addrs();
        let ctx = silent_ctx();
        let mut buf = vec![0xA5u8; 64];
        let result = Stun.unwrap(&mut buf, 64, Direction::ClientToServer, &src, &dst, &ctx);
        assert_eq!(result, Unwrapped::NotMine);
    }

    #[test]
    fn test_truncated_data_indication_is_not_mine() {
        let (src, dst) = test_addrs();
        let ctx = silent_ctx();
        let mut buf = vec![0u8; 64];
        let txid = [7u8; TXID_LEN];
        write_header(&mut buf, TYPE_DATA_IND, 104, &txid);
        buf[20..22].copy_from_slice(&ATTR_DATA.to_be_bytes());
        buf[22..24].copy_from_slice(&100u16.to_be_bytes());
        // Claims 100 payload bytes but only 40 are present.
        let result = Stun.unwrap(&mut buf, 40, Direction::ClientToServer, &src, &dst, &ctx);
        assert_eq!(result, Unwrapped::NotMine);
    }

    #[test]
    fn test_unknown_stun_type_is_consumed() {
        let (src, dst) = test_addrs();
        let ctx = silent_ctx();
        let mut buf = vec![0u8; 64];
        let txid = [1u8; TXID_LEN];
        write_header(&mut buf, 0x0111, 0, &txid);
        let result = Stun.unwrap(&mut buf, 20, Direction::ClientToServer, &src, &dst, &ctx);
        assert_eq!(result, Unwrapped::Consumed);
    }

    /// A Binding Request is answered with a Binding Success Response that
    /// echoes the transaction ID and reports the sender in
    /// XOR-MAPPED-ADDRESS; nothing is forwarded upstream.
    #[test]
    fn test_binding_request_gets_success_response() {
        let (src, dst) = test_addrs();
        let replies: RefCell<Vec<Vec<u8>>> = RefCell::new(Vec::new());
        let send_back = |b: &[u8]| -> io::Result<usize> {
            replies.borrow_mut().push(b.to_vec());
            Ok(b.len())
        };
        let ctx = SendCtx { send_back: &send_back, send_forward: None };

        let txid: [u8; TXID_LEN] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];
        let mut buf = vec![0u8; 128];
        write_header(&mut buf, TYPE_BINDING_REQ, 0, &txid);
        let mut msg_len = 0;
        msg_len += put_fingerprint(&mut buf, HEADER_LEN + msg_len);
        buf[2..4].copy_from_slice(&(msg_len as u16).to_be_bytes());
        let req_len = HEADER_LEN + msg_len;

        let result = Stun.unwrap(&mut buf, req_len, Direction::ClientToServer, &src, &dst, &ctx);
        assert_eq!(result, Unwrapped::Consumed);

        let replies = replies.borrow();
        assert_eq!(replies.len(), 1);
        let resp = &replies[0];
        assert_eq!(peek_type(resp), TYPE_BINDING_RESP);
        assert_eq!(&resp[4..8], &MAGIC_COOKIE);
        assert_eq!(&resp[8..20], &txid);

        // XOR-MAPPED-ADDRESS encodes 192.0.2.1:40000 XOR the cookie.
        assert_eq!(u16::from_be_bytes([resp[20], resp[21]]), ATTR_XOR_MAPPED);
        assert_eq!(resp[25], 0x01);
        let port = u16::from_be_bytes([resp[26] ^ MAGIC_COOKIE[0], resp[27] ^ MAGIC_COOKIE[1]]);
        assert_eq!(port, 40000);
        let ip = [
            resp[28] ^ MAGIC_COOKIE[0],
            resp[29] ^ MAGIC_COOKIE[1],
            resp[30] ^ MAGIC_COOKIE[2],
            resp[31] ^ MAGIC_COOKIE[3],
        ];
        assert_eq!(ip, src.ip().octets());

        // FINGERPRINT covers everything before the attribute.
        assert_eq!(u16::from_be_bytes([resp[32], resp[33]]), ATTR_FINGERPRINT);
        let fp = u32::from_be_bytes([resp[36], resp[37], resp[38], resp[39]]);
        let mut image = resp[..32].to_vec();
        // The length field is written after the fingerprint is computed.
        image[2] = 0;
        image[3] = 0;
        assert_eq!(fp, crc32(&image) ^ FINGERPRINT_XOR);
    }

    #[test]
    fn test_binding_response_is_consumed() {
        let (src, dst) = test_addrs();
        let ctx = silent_ctx();
        let mut buf = vec![0u8; 64];
        let len = build_binding_request(&mut buf);
        buf[0..2].copy_from_slice(&TYPE_BINDING_RESP.to_be_bytes());
        let result = Stun.unwrap(&mut buf, len, Direction::ClientToServer, &src, &dst, &ctx);
        assert_eq!(result, Unwrapped::Consumed);
    }

    #[test]
    fn test_binding_request_shape() {
        let mut buf = [0u8; 64];
        let len = build_binding_request(&mut buf);
        assert_eq!(len, 28);
        assert_eq!(peek_type(&buf), TYPE_BINDING_REQ);
        assert_eq!(&buf[4..8], &MAGIC_COOKIE);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 8);
    }

    #[test]
    fn test_on_timer_respects_direction_flags() {
        let (client, server) = test_addrs();
        let to_client_count = RefCell::new(0usize);
        let to_server_count = RefCell::new(0usize);
        let to_client = |b: &[u8]| -> io::Result<usize> {
            *to_client_count.borrow_mut() += 1;
            Ok(b.len())
        };
        let to_server = |b: &[u8]| -> io::Result<usize> {
            *to_server_count.borrow_mut() += 1;
            Ok(b.len())
        };

        Stun.on_timer(true, false, &client, &server, &to_client, &to_server);
        assert_eq!((*to_client_count.borrow(), *to_server_count.borrow()), (1, 0));

        Stun.on_timer(false, true, &client, &server, &to_client, &to_server);
        assert_eq!((*to_client_count.borrow(), *to_server_count.borrow()), (1, 1));
    }
}
