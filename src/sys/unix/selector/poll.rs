//! `poll(2)`-backed selector, selected when `MUDUO_USE_POLL` is set.
//!
//! Unlike `mio`'s portable `poll` backend, this one does not need to
//! support concurrent registration from other threads while a `select` call
//! is in flight — spec invariant #1 guarantees all notifier mutation happens
//! on the loop's own thread, which is also the only thread that calls
//! `select`. That lets the implementation stay a plain `Vec` + index map.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::interest::Interest;
use crate::token::Token;

#[derive(Debug)]
pub struct Selector {
    fds: Vec<libc::pollfd>,
    tokens: Vec<Token>,
    index_of: HashMap<RawFd, usize>,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        Ok(Selector {
            fds: Vec::new(),
            tokens: Vec::new(),
            index_of: HashMap::new(),
        })
    }

    pub fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        if self.index_of.contains_key(&fd) {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        let idx = self.fds.len();
        self.fds.push(libc::pollfd {
            fd,
            events: interest_to_poll(interest),
            revents: 0,
        });
        self.tokens.push(token);
        self.index_of.insert(fd, idx);
        Ok(())
    }

    pub fn reregister(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let idx = *self
            .index_of
            .get(&fd)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        self.fds[idx].events = interest_to_poll(interest);
        self.tokens[idx] = token;
        Ok(())
    }

    pub fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        let idx = self
            .index_of
            .remove(&fd)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        self.fds.swap_remove(idx);
        self.tokens.swap_remove(idx);
        if idx < self.fds.len() {
            // The element swapped into `idx` needs its index updated.
            self.index_of.insert(self.fds[idx].fd, idx);
        }
        Ok(())
    }

    pub fn select(
        &mut self,
        timeout: Option<Duration>,
    ) -> io::Result<Vec<(Token, bool, bool, bool, bool)>> {
        let timeout_ms = match timeout {
            Some(d) => d.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
            None => -1,
        };
        loop {
            let n = unsafe {
                libc::poll(
                    self.fds.as_mut_ptr(),
                    self.fds.len() as libc::nfds_t,
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
            break;
        }
        let mut ready = Vec::new();
        for (pfd, token) in self.fds.iter().zip(self.tokens.iter()) {
            if pfd.revents == 0 {
                continue;
            }
            let bits = pfd.revents as libc::c_int;
            ready.push((
                *token,
                bits & (libc::POLLIN | libc::POLLPRI) != 0,
                bits & libc::POLLOUT != 0,
                bits & libc::POLLERR != 0,
                bits & libc::POLLHUP != 0,
            ));
        }
        Ok(ready)
    }
}

fn interest_to_poll(interest: Interest) -> libc::c_short {
    let mut bits = 0;
    if interest.is_readable() {
        bits |= libc::POLLIN;
    }
    if interest.is_writable() {
        bits |= libc::POLLOUT;
    }
    if interest.is_urgent() {
        bits |= libc::POLLPRI;
    }
    bits as libc::c_short
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_deregister() {
        let mut sel = Selector::new().unwrap();
        sel.register(0, Token(0), Interest::READABLE).unwrap();
        assert_eq!(sel.fds.len(), 1);
        sel.deregister(0).unwrap();
        assert!(sel.fds.is_empty());
    }
}
