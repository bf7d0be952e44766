//! The readiness notifier (spec §4.1): wraps the OS-level selector
//! (`epoll` or `poll`, chosen via `MUDUO_USE_POLL`) and the `fd -> channel`
//! map used to turn raw readiness events back into the channels that own
//! them.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::channel::{Channel, Membership};
use crate::interest::Interest;
use crate::sys::selector::SelectorImpl;
use crate::token::Token;

const INITIAL_EVENT_CAPACITY: usize = 16;

pub struct Notifier {
    selector: SelectorImpl,
    channels: Mutex<HashMap<RawFd, Arc<Mutex<Channel>>>>,
    capacity: Mutex<usize>,
}

impl Notifier {
    pub fn new() -> io::Result<Notifier> {
        Ok(Notifier {
            selector: SelectorImpl::new_default()?,
            channels: Mutex::new(HashMap::new()),
            capacity: Mutex::new(INITIAL_EVENT_CAPACITY),
        })
    }

    /// Waits up to `timeout` for readiness, stamps each ready channel's
    /// `revents`, and returns the poll timestamp plus the ready channels in
    /// the order the selector returned them.
    pub fn poll(&self, timeout: Option<Duration>) -> io::Result<(Instant, Vec<Arc<Mutex<Channel>>>)> {
        let capacity = *self.capacity.lock().unwrap();
        let raw = self.selector.select(capacity, timeout)?;
        let timestamp = Instant::now();

        if raw.len() >= capacity {
            *self.capacity.lock().unwrap() = capacity * 2;
        }

        let channels = self.channels.lock().unwrap();
        let mut ready = Vec::with_capacity(raw.len());
        for (token, readable, writable, error, hup) in raw {
            let fd = token.0 as RawFd;
            if let Some(channel) = channels.get(&fd) {
                channel.lock().unwrap().set_revents(readable, writable, error, hup);
                ready.push(Arc::clone(channel));
            }
        }
        Ok((timestamp, ready))
    }

    /// Adds, modifies, or removes the notifier's registration for `fd`
    /// depending on its current membership state (spec §4.1).
    pub fn update_channel(
        &self,
        fd: RawFd,
        interest: Interest,
        membership: &mut Membership,
        channel: &Arc<Mutex<Channel>>,
    ) -> io::Result<()> {
        let token = Token(fd as usize);
        match *membership {
            Membership::NeverRegistered | Membership::Removed => {
                self.selector.register(fd, token, interest)?;
                self.channels.lock().unwrap().insert(fd, Arc::clone(channel));
                *membership = Membership::Registered;
            }
            Membership::Registered => {
                if interest.is_empty() {
                    self.selector.deregister(fd)?;
                    self.channels.lock().unwrap().remove(&fd);
                    *membership = Membership::Removed;
                } else {
                    self.selector.reregister(fd, token, interest)?;
                }
            }
        }
        Ok(())
    }

    /// Erases the fd mapping and deregisters from the selector if currently
    /// registered, resetting membership to `NeverRegistered`.
    pub fn remove_channel(&self, fd: RawFd, membership: &mut Membership) -> io::Result<()> {
        self.channels.lock().unwrap().remove(&fd);
        if *membership == Membership::Registered {
            self.selector.deregister(fd)?;
        }
        *membership = Membership::NeverRegistered;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_base_capacity() {
        let notifier = Notifier::new().unwrap();
        assert_eq!(*notifier.capacity.lock().unwrap(), INITIAL_EVENT_CAPACITY);
    }
}
