/*
 * Copyright (c) 2025 sh0rch <sh0rch@iwl.dev>
 *
 * This file is part of udp_wgobfs.
 *
 * Licensed under the MIT License. See LICENSE file in the project root for full license information.
 */

//! Raw socket plumbing: platform-conditional egress socket options and
//! datagram receives with `MSG_TRUNC` semantics, so oversized packets are
//! detected instead of silently truncated.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::os::fd::AsRawFd;

#[cfg(not(target_os = "linux"))]
use log::warn;

#[cfg(target_os = "linux")]
fn setsockopt_int(
    sock: &UdpSocket,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Sets the "do not fragment" hint on an egress socket.
#[cfg(target_os = "linux")]
pub fn set_dont_fragment(sock: &UdpSocket) -> io::Result<()> {
    setsockopt_int(sock, libc::IPPROTO_IP, libc::IP_MTU_DISCOVER, libc::IP_PMTUDISC_DO)
}

/// Marks egress packets for firewall routing rules.
#[cfg(target_os = "linux")]
pub fn set_fwmark(sock: &UdpSocket, mark: u32) -> io::Result<()> {
    setsockopt_int(sock, libc::SOL_SOCKET, libc::SO_MARK, mark as libc::c_int)
}

#[cfg(not(target_os = "linux"))]
static PLATFORM_WARNED: std::sync::Once = std::sync::Once::new();

#[cfg(not(target_os = "linux"))]
fn warn_unsupported() {
    PLATFORM_WARNED.call_once(|| {
        warn!("IP_MTU_DISCOVER/SO_MARK are not supported on this platform, skipping");
    });
}

#[cfg(not(target_os = "linux"))]
pub fn set_dont_fragment(_sock: &UdpSocket) -> io::Result<()> {
    warn_unsupported();
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_fwmark(_sock: &UdpSocket, _mark: u32) -> io::Result<()> {
    warn_unsupported();
    Ok(())
}

#[cfg(target_os = "linux")]
const RECV_FLAGS: libc::c_int = libc::MSG_TRUNC;
#[cfg(not(target_os = "linux"))]
const RECV_FLAGS: libc::c_int = 0;

/// `recvfrom` returning the sender and the true datagram length.
///
/// On Linux the returned length may exceed `buf.len()` for oversized
/// datagrams; the caller is expected to drop those.
pub fn recv_from_trunc(sock: &UdpSocket, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)> {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut addr_len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let n = unsafe {
        libc::recvfrom(
            sock.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            RECV_FLAGS,
            &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut addr_len,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    let sender = SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
        u16::from_be(addr.sin_port),
    );
    Ok((n as usize, sender))
}

/// `recv` on a connected socket, with the same truncation reporting as
/// [`recv_from_trunc`].
pub fn recv_trunc(sock: &UdpSocket, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe {
        libc::recv(
            sock.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            RECV_FLAGS,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}
