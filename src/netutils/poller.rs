/*
 * Copyright (c) 2025 sh0rch <sh0rch@iwl.dev>
 *
 * This file is part of udp_wgobfs.
 *
 * Licensed under the MIT License. See LICENSE file in the project root for full license information.
 */

//! Level-triggered readiness over a set of UDP sockets.
//!
//! On Linux this is a thin wrapper around `epoll` (readiness in O(1) per
//! event); elsewhere it falls back to `poll(2)` over the registered
//! descriptor set. Both backends expose the same surface: register,
//! deregister, wait. A signal interrupting the wait is reported as an
//! empty readiness set so the caller can observe its shutdown flag.

use std::io;
use std::os::fd::RawFd;

#[cfg(target_os = "linux")]
const MAX_EVENTS: usize = 64;

pub struct Poller {
    #[cfg(target_os = "linux")]
    epfd: RawFd,
    #[cfg(not(target_os = "linux"))]
    fds: Vec<RawFd>,
}

#[cfg(target_os = "linux")]
impl Poller {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Poller { epfd })
    }

    pub fn register(&mut self, fd: RawFd) -> io::Result<()> {
        let mut ev = libc::epoll_event { events: libc::EPOLLIN as u32, u64: fd as u64 };
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        let rc =
            unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Waits up to `timeout_ms` and fills `ready` with readable descriptors.
    pub fn wait(&mut self, ready: &mut Vec<RawFd>, timeout_ms: i32) -> io::Result<()> {
        ready.clear();
        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        let n = unsafe {
            libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as libc::c_int, timeout_ms)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        for ev in events.iter().take(n as usize) {
            ready.push(ev.u64 as RawFd);
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
impl Drop for Poller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

#[cfg(not(target_os = "linux"))]
impl Poller {
    pub fn new() -> io::Result<Self> {
        Ok(Poller { fds: Vec::new() })
    }

    pub fn register(&mut self, fd: RawFd) -> io::Result<()> {
        if !self.fds.contains(&fd) {
            self.fds.push(fd);
        }
        Ok(())
    }

    pub fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.fds.retain(|&f| f != fd);
        Ok(())
    }

    /// Waits up to `timeout_ms` and fills `ready` with readable descriptors.
    pub fn wait(&mut self, ready: &mut Vec<RawFd>, timeout_ms: i32) -> io::Result<()> {
        ready.clear();
        let mut pollfds: Vec<libc::pollfd> = self
            .fds
            .iter()
            .map(|&fd| libc::pollfd { fd, events: libc::POLLIN, revents: 0 })
            .collect();
        let n = unsafe {
            libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        for p in &pollfds {
            if p.revents & libc::POLLIN != 0 {
                ready.push(p.fd);
            }
        }
        Ok(())
    }
}
