//! Channel: binds one file descriptor to its interest set and its four
//! per-event callbacks, and mediates between the event loop and the
//! readiness notifier (spec §4.2).

use std::any::Any;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::event_loop::EventLoopHandle;
use crate::interest::Interest;

/// Where a channel sits with respect to the notifier's internal fd map.
/// Drives whether the next `update` is an add, a modify, or a delete (spec
/// §4.1).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Membership {
    NeverRegistered,
    Registered,
    Removed,
}

type ReadCallback = Box<dyn FnMut(Instant) + Send>;
type SimpleCallback = Box<dyn FnMut() + Send>;

/// A non-owning binding of a file descriptor to its readiness interest and
/// callbacks. A channel is touched only from its owning loop's thread
/// (spec §3 invariant); it never closes the fd it refers to.
pub struct Channel {
    self_ref: Weak<std::sync::Mutex<Channel>>,
    loop_handle: EventLoopHandle,
    fd: RawFd,
    interest: Interest,
    revents: Interest,
    membership: Membership,
    hup: bool,
    error: bool,
    tie: Option<Weak<dyn Any + Send + Sync>>,
    read_cb: Option<ReadCallback>,
    write_cb: Option<SimpleCallback>,
    close_cb: Option<SimpleCallback>,
    error_cb: Option<SimpleCallback>,
}

impl Channel {
    /// Constructs a channel behind the `Arc<Mutex<_>>` the notifier and the
    /// owning loop will share, giving it a weak self-reference so `update`
    /// and `remove` can hand the notifier a clone without the caller having
    /// to separately track "my own Arc".
    pub fn new_shared(loop_handle: EventLoopHandle, fd: RawFd) -> Arc<std::sync::Mutex<Channel>> {
        Arc::new_cyclic(|self_ref| {
            std::sync::Mutex::new(Channel {
                self_ref: self_ref.clone(),
                loop_handle,
                fd,
                interest: Interest::NONE,
                revents: Interest::NONE,
                membership: Membership::NeverRegistered,
                hup: false,
                error: false,
                tie: None,
                read_cb: None,
                write_cb: None,
                close_cb: None,
                error_cb: None,
            })
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn membership(&self) -> Membership {
        self.membership
    }

    pub fn set_membership(&mut self, m: Membership) {
        self.membership = m;
    }

    pub fn is_writing(&self) -> bool {
        self.interest.is_writable()
    }

    pub fn is_reading(&self) -> bool {
        self.interest.is_readable()
    }

    pub fn set_read_callback(&mut self, cb: impl FnMut(Instant) + Send + 'static) {
        self.read_cb = Some(Box::new(cb));
    }

    pub fn set_write_callback(&mut self, cb: impl FnMut() + Send + 'static) {
        self.write_cb = Some(Box::new(cb));
    }

    pub fn set_close_callback(&mut self, cb: impl FnMut() + Send + 'static) {
        self.close_cb = Some(Box::new(cb));
    }

    pub fn set_error_callback(&mut self, cb: impl FnMut() + Send + 'static) {
        self.error_cb = Some(Box::new(cb));
    }

    /// Ties this channel's dispatch to the lifetime of `owner`: `owner` is
    /// promoted from a weak to a strong reference for the duration of each
    /// `handle_event` call, and dispatch is skipped entirely if `owner` has
    /// already been dropped (spec §4.2, §9).
    pub fn tie(&mut self, owner: &Arc<dyn Any + Send + Sync>) {
        self.tie = Some(Arc::downgrade(owner));
    }

    /// Records the raw event bits observed this poll and requests the
    /// appropriate registry update. Called by the event loop immediately
    /// before `handle_event`.
    pub(crate) fn set_revents(&mut self, readable: bool, writable: bool, error: bool, hup: bool) {
        let mut r = Interest::NONE;
        if readable {
            r |= Interest::READABLE;
        }
        if writable {
            r |= Interest::WRITABLE;
        }
        self.revents = r;
        self.error = error;
        self.hup = hup;
    }

    pub fn enable_reading(&mut self) {
        self.interest |= Interest::READABLE;
        self.update();
    }

    pub fn disable_reading(&mut self) {
        self.interest = self.interest.remove(Interest::READABLE);
        self.update();
    }

    pub fn enable_writing(&mut self) {
        self.interest |= Interest::WRITABLE;
        self.update();
    }

    pub fn disable_writing(&mut self) {
        self.interest = self.interest.remove(Interest::WRITABLE);
        self.update();
    }

    pub fn disable_all(&mut self) {
        self.interest = Interest::NONE;
        self.update();
    }

    /// Forwards to the owning loop, which forwards to the notifier.
    fn update(&mut self) {
        let self_arc = self
            .self_ref
            .upgrade()
            .expect("Channel::update called while the channel itself is being dropped");
        self.loop_handle
            .update_channel(self.fd, self.interest, &mut self.membership, &self_arc);
    }

    /// Forwards to the owning loop, which forwards to the notifier.
    pub fn remove(&mut self) {
        self.loop_handle.remove_channel(self.fd, &mut self.membership);
    }

    /// The dispatch entry point, called by the event loop with the poll
    /// return timestamp. Order is contractual (spec §4.2): hup-without-read,
    /// then error, then read-or-urgent, then write.
    pub fn handle_event(&mut self, timestamp: Instant) {
        if let Some(tie) = &self.tie {
            if tie.upgrade().is_none() {
                // The tied owner has already been dropped; nothing to do.
                return;
            }
        }

        if self.hup && !self.revents.is_readable() {
            if let Some(cb) = self.close_cb.as_mut() {
                cb();
            }
        }
        if self.error {
            if let Some(cb) = self.error_cb.as_mut() {
                cb();
            }
        }
        if self.revents.is_readable() || self.revents.is_urgent() {
            if let Some(cb) = self.read_cb.as_mut() {
                cb(timestamp);
            }
        }
        if self.revents.is_writable() {
            if let Some(cb) = self.write_cb.as_mut() {
                cb();
            }
        }
    }
}
