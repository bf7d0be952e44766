//! `epoll(7)`-backed selector.
//!
//! Edge semantics are left at the kernel default (level-triggered), matching
//! the muduo original: the core re-reads/re-writes until `WouldBlock` and
//! relies on level-triggering to re-deliver readiness rather than arming
//! `EPOLLET`.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::interest::Interest;
use crate::token::Token;

#[derive(Debug)]
pub struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let fd = syscall(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Selector {
            ep: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: token.0 as u64,
        };
        syscall(unsafe {
            libc::epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)
        })?;
        Ok(())
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: token.0 as u64,
        };
        syscall(unsafe {
            libc::epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_MOD, fd, &mut event)
        })?;
        Ok(())
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        syscall(unsafe {
            libc::epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        })?;
        Ok(())
    }

    /// Waits up to `timeout` for events, growing `raw` to `capacity` first.
    /// Returns the events observed this call as `(token, readable, writable,
    /// error, hup)` tuples.
    pub fn select(
        &self,
        raw: &mut Vec<libc::epoll_event>,
        capacity: usize,
        timeout: Option<Duration>,
    ) -> io::Result<Vec<(Token, bool, bool, bool, bool)>> {
        raw.clear();
        raw.reserve(capacity);
        let timeout_ms = match timeout {
            Some(d) => d.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
            None => -1,
        };
        loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.ep.as_raw_fd(),
                    raw.as_mut_ptr(),
                    capacity as libc::c_int,
                    timeout_ms,
                )
            };
            if n == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            unsafe { raw.set_len(n as usize) };
            break;
        }
        Ok(raw
            .iter()
            .map(|ev| {
                let bits = ev.events as libc::c_int;
                (
                    Token(ev.u64 as usize),
                    bits & (libc::EPOLLIN | libc::EPOLLPRI) != 0,
                    bits & libc::EPOLLOUT != 0,
                    bits & libc::EPOLLERR != 0,
                    bits & libc::EPOLLHUP != 0,
                )
            })
            .collect())
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut bits = 0i32;
    if interest.is_readable() {
        bits |= libc::EPOLLIN | libc::EPOLLPRI;
    }
    if interest.is_writable() {
        bits |= libc::EPOLLOUT;
    }
    if interest.is_urgent() {
        bits |= libc::EPOLLPRI;
    }
    bits as u32
}

fn syscall(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_drop() {
        let _selector = Selector::new().unwrap();
    }
}
