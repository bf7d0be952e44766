//! Accepts inbound connections on a listening socket (spec §4.6).

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};

use crate::address::InetAddress;
use crate::channel::Channel;
use crate::event_loop::EventLoopHandle;
use crate::sys::net as sys_net;

type NewConnectionCallback = Box<dyn FnMut(OwnedFd, InetAddress) + Send>;

/// Owns the listening socket and its channel. `handle_read` accepts exactly
/// one connection per readiness notification and hands the fd to the
/// server's new-connection callback; a listener is edge-triggered in effect
/// because `accept` is retried on the next readable notification, not in a
/// loop here (matches muduo's one-accept-per-wakeup policy).
pub struct Acceptor {
    loop_handle: EventLoopHandle,
    listen_socket: OwnedFd,
    channel: Arc<Mutex<Channel>>,
    listening: bool,
    new_connection_cb: Option<NewConnectionCallback>,
    /// A spare fd held in reserve so an `EMFILE` can be handled gracefully:
    /// close it, accept-and-immediately-close the pending connection (so
    /// epoll/poll stop reporting it readable), then reopen the spare.
    idle_fd: Option<OwnedFd>,
}

impl Acceptor {
    /// Binds `addr`. `reuseport` controls `SO_REUSEPORT`; `SO_REUSEADDR` is
    /// always enabled so a restarted server can rebind a socket still in
    /// `TIME_WAIT` (spec's REDESIGN FLAGS: `reuseport` must actually gate the
    /// option consistently, not just on some platforms).
    pub fn new(loop_handle: EventLoopHandle, addr: InetAddress, reuseport: bool) -> Acceptor {
        let listen_socket = sys_net::new_stream_socket().unwrap_or_else(|e| {
            log_fatal(&format!("Acceptor failed to create listening socket: {e}"));
            unreachable!()
        });
        let lfd = listen_socket.as_raw_fd();

        sys_net::set_reuseaddr(lfd, true).unwrap_or_else(|e| {
            log_fatal(&format!("Acceptor failed to set SO_REUSEADDR: {e}"));
        });
        if reuseport {
            sys_net::set_reuseport(lfd, true).unwrap_or_else(|e| {
                log_fatal(&format!("Acceptor failed to set SO_REUSEPORT: {e}"));
            });
        }
        sys_net::bind(lfd, addr.as_raw()).unwrap_or_else(|e| {
            log_fatal(&format!("Acceptor failed to bind {addr}: {e}"));
        });

        let idle_fd = sys_net::new_stream_socket().ok();
        let channel = Channel::new_shared(loop_handle.clone(), lfd);

        Acceptor {
            loop_handle,
            listen_socket,
            channel,
            listening: false,
            new_connection_cb: None,
            idle_fd,
        }
    }

    pub fn set_new_connection_callback(&mut self, cb: impl FnMut(OwnedFd, InetAddress) + Send + 'static) {
        self.new_connection_cb = Some(Box::new(cb));
    }

    pub fn listening(&self) -> bool {
        self.listening
    }

    pub fn local_addr(&self) -> InetAddress {
        sys_net::local_addr(self.listen_socket.as_raw_fd())
            .map(InetAddress::from_raw)
            .expect("listening socket must have a local address once bound")
    }

    /// Enters the listening state and arms the channel for readability.
    /// Must be called from the owning loop's thread.
    pub fn listen(acceptor: &Arc<Mutex<Acceptor>>) {
        let lfd = {
            let mut guard = acceptor.lock().unwrap();
            guard.listening = true;
            sys_net::listen(guard.listen_socket.as_raw_fd()).unwrap_or_else(|e| {
                log_fatal(&format!("Acceptor failed to listen: {e}"));
            });
            guard.listen_socket.as_raw_fd()
        };

        let weak = Arc::downgrade(acceptor);
        let channel = Arc::clone(&acceptor.lock().unwrap().channel);
        channel.lock().unwrap().set_read_callback(move |_ts| {
            if let Some(acceptor) = weak.upgrade() {
                Acceptor::handle_read(&acceptor);
            }
        });
        let _ = lfd;
        channel.lock().unwrap().enable_reading();
    }

    fn handle_read(acceptor: &Arc<Mutex<Acceptor>>) {
        let mut guard = acceptor.lock().unwrap();
        let lfd = guard.listen_socket.as_raw_fd();
        match sys_net::accept(lfd) {
            Ok((conn_fd, peer)) => {
                let remote = InetAddress::from_raw(peer);
                if let Some(cb) = guard.new_connection_cb.as_mut() {
                    cb(conn_fd, remote);
                }
            }
            Err(e) if e.raw_os_error() == Some(libc::EMFILE) => {
                log_error("Acceptor ran out of file descriptors (EMFILE); dropping one pending connection");
                guard.idle_fd = None;
                if let Ok((dropped, _)) = sys_net::accept(lfd) {
                    drop(dropped);
                }
                guard.idle_fd = sys_net::new_stream_socket().ok();
            }
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted) => {}
            Err(e) => log_error(&format!("Acceptor::accept failed: {e}")),
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.lock().unwrap().disable_all();
        self.channel.lock().unwrap().remove();
        let _ = &self.loop_handle;
    }
}

#[cfg(feature = "log")]
fn log_error(msg: &str) {
    log::error!("{msg}");
}
#[cfg(not(feature = "log"))]
fn log_error(_msg: &str) {}

#[cfg(feature = "log")]
fn log_fatal(msg: &str) {
    log::error!("{msg}");
    panic!("{msg}");
}
#[cfg(not(feature = "log"))]
fn log_fatal(msg: &str) {
    panic!("{msg}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn accepts_a_connection_and_invokes_callback() {
        let (setup_tx, setup_rx) = mpsc::channel();
        let (tx, rx) = mpsc::channel();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let runner = std::thread::spawn(move || {
            let event_loop = EventLoop::new();
            let handle = event_loop.handle();
            let addr = InetAddress::loopback(0);
            let acceptor = Arc::new(Mutex::new(Acceptor::new(handle.clone(), addr, false)));
            let bound_addr = InetAddress::from_raw(
                sys_net::local_addr(acceptor.lock().unwrap().listen_socket.as_raw_fd()).unwrap(),
            );
            acceptor.lock().unwrap().set_new_connection_callback(move |fd, _peer| {
                count_clone.fetch_add(1, Ordering::SeqCst);
                tx.send(fd).unwrap();
            });
            Acceptor::listen(&acceptor);
            setup_tx.send((handle, bound_addr)).unwrap();
            event_loop.run();
        });

        let (handle, bound_addr) = setup_rx.recv().unwrap();

        let client = sys_net::new_stream_socket().unwrap();
        let _ = sys_net::connect(client.as_raw_fd(), bound_addr.as_raw());

        let accepted_fd = rx
            .recv_timeout(std::time::Duration::from_secs(2))
            .expect("acceptor should invoke the new-connection callback");
        assert!(accepted_fd.as_raw_fd() >= 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        handle.quit();
        runner.join().unwrap();
    }
}
