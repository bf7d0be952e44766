mod epoll;
mod poll;

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::interest::Interest;
use crate::token::Token;

/// One raw readiness event: which channel, and which of the four bits the
/// dispatch order in spec §4.2 cares about (hup, error, read, write).
pub type RawReady = (Token, bool, bool, bool, bool);

/// Selects between the `epoll`-backed and `poll`-backed implementations.
///
/// `MUDUO_USE_POLL`, checked once at construction, is the sole configuration
/// switch named by spec §6; everything else about notifier choice is fixed.
pub enum SelectorImpl {
    Epoll(epoll::Selector),
    Poll(std::sync::Mutex<poll::Selector>),
}

impl SelectorImpl {
    pub fn new_default() -> io::Result<SelectorImpl> {
        if std::env::var_os("MUDUO_USE_POLL").is_some() {
            log_backend("poll");
            Ok(SelectorImpl::Poll(std::sync::Mutex::new(poll::Selector::new()?)))
        } else {
            log_backend("epoll");
            Ok(SelectorImpl::Epoll(epoll::Selector::new()?))
        }
    }

    pub fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            SelectorImpl::Epoll(s) => s.register(fd, token, interest),
            SelectorImpl::Poll(s) => s.lock().unwrap().register(fd, token, interest),
        }
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            SelectorImpl::Epoll(s) => s.reregister(fd, token, interest),
            SelectorImpl::Poll(s) => s.lock().unwrap().reregister(fd, token, interest),
        }
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        match self {
            SelectorImpl::Epoll(s) => s.deregister(fd),
            SelectorImpl::Poll(s) => s.lock().unwrap().deregister(fd),
        }
    }

    /// Waits for events, growing `capacity` as instructed by the caller
    /// (spec §4.1: starts at 16, doubles when a call fills it exactly).
    pub fn select(&self, capacity: usize, timeout: Option<Duration>) -> io::Result<Vec<RawReady>> {
        match self {
            SelectorImpl::Epoll(s) => {
                let mut raw = Vec::with_capacity(capacity);
                s.select(&mut raw, capacity, timeout)
            }
            SelectorImpl::Poll(s) => s.lock().unwrap().select(timeout),
        }
    }
}

#[cfg(feature = "log")]
fn log_backend(name: &str) {
    log::debug!("notifier backend selected: {name}");
}

#[cfg(not(feature = "log"))]
fn log_backend(_name: &str) {}
