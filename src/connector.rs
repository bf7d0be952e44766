//! Actively connects to a remote address, with errno classification and
//! capped exponential backoff retry (spec §4.7).

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::address::InetAddress;
use crate::channel::Channel;
use crate::event_loop::EventLoopHandle;
use crate::sys::net as sys_net;

const INITIAL_RETRY_DELAY_MS: u64 = 500;
const MAX_RETRY_DELAY_MS: u64 = 30_000;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Disconnected,
    Connecting,
    Connected,
}

type NewConnectionCallback = Box<dyn FnMut(OwnedFd) + Send>;

struct Shared {
    loop_handle: EventLoopHandle,
    server_addr: InetAddress,
    state: Mutex<State>,
    channel: Mutex<Option<Arc<Mutex<Channel>>>>,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
    retry_delay_ms: AtomicU64,
    connect_enabled: AtomicBool,
}

/// Drives one outbound connection attempt at a time. Calling `start` again
/// after `stop` begins a fresh attempt at the base retry delay (spec §4.7).
pub struct Connector {
    shared: Arc<Shared>,
}

impl Connector {
    pub fn new(loop_handle: EventLoopHandle, server_addr: InetAddress) -> Connector {
        Connector {
            shared: Arc::new(Shared {
                loop_handle,
                server_addr,
                state: Mutex::new(State::Disconnected),
                channel: Mutex::new(None),
                new_connection_cb: Mutex::new(None),
                retry_delay_ms: AtomicU64::new(INITIAL_RETRY_DELAY_MS),
                connect_enabled: AtomicBool::new(false),
            }),
        }
    }

    pub fn set_new_connection_callback(&self, cb: impl FnMut(OwnedFd) + Send + 'static) {
        *self.shared.new_connection_cb.lock().unwrap() = Some(Box::new(cb));
    }

    /// Starts (or restarts) connecting. Must run on the owning loop's
    /// thread; call through `EventLoopHandle::run_in_loop` from elsewhere.
    pub fn start(&self) {
        self.shared.connect_enabled.store(true, Ordering::SeqCst);
        self.shared.retry_delay_ms.store(INITIAL_RETRY_DELAY_MS, Ordering::SeqCst);
        connect(&self.shared);
    }

    /// Disables further retries and, if a connect is in flight, detaches its
    /// channel and closes its fd. Hops to the loop thread like muduo's
    /// `stopInLoop` since the channel must only be touched there.
    pub fn stop(&self) {
        self.shared.connect_enabled.store(false, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let loop_handle = self.shared.loop_handle.clone();
        loop_handle.run_in_loop(move || stop_in_loop(&shared));
    }
}

fn stop_in_loop(shared: &Arc<Shared>) {
    let was_connecting = {
        let mut state = shared.state.lock().unwrap();
        let was_connecting = *state == State::Connecting;
        *state = State::Disconnected;
        was_connecting
    };
    if was_connecting {
        if let Some(channel) = shared.channel.lock().unwrap().take() {
            let fd = channel.lock().unwrap().fd();
            channel.lock().unwrap().disable_all();
            channel.lock().unwrap().remove();
            unsafe { libc::close(fd) };
        }
    }
}

fn connect(shared: &Arc<Shared>) {
    let socket = match sys_net::new_stream_socket() {
        Ok(s) => s,
        Err(e) => {
            log_error(&format!("Connector failed to create socket: {e}"));
            return;
        }
    };
    let fd = socket.as_raw_fd();
    *shared.state.lock().unwrap() = State::Connecting;

    match sys_net::connect(fd, shared.server_addr.as_raw()) {
        Ok(()) => connecting(shared, socket),
        Err(e) => match e.raw_os_error() {
            Some(libc::EINPROGRESS) | Some(libc::EINTR) | Some(libc::EISCONN) => connecting(shared, socket),
            Some(libc::EAGAIN)
            | Some(libc::EADDRINUSE)
            | Some(libc::EADDRNOTAVAIL)
            | Some(libc::ECONNREFUSED)
            | Some(libc::ENETUNREACH) => {
                log_debug(&format!("Connector transient connect error: {e}, retrying"));
                drop(socket);
                schedule_retry(shared);
            }
            _ => {
                log_error(&format!("Connector unexpected connect error for fd {fd}: {e}"));
                drop(socket);
            }
        },
    }
}

/// Arms a channel for write-readiness, which is how a non-blocking connect
/// reports completion (success or failure) on Unix.
fn connecting(shared: &Arc<Shared>, socket: OwnedFd) {
    let fd = socket.as_raw_fd();
    std::mem::forget(socket); // ownership now lives with the channel/fd until handle_write or handle_error closes it
    let channel = Channel::new_shared(shared.loop_handle.clone(), fd);

    let weak_channel: Weak<Mutex<Channel>> = Arc::downgrade(&channel);
    let shared_write = Arc::clone(shared);
    let weak_for_write = weak_channel.clone();
    channel.lock().unwrap().set_write_callback(move || {
        handle_write(&shared_write, fd, &weak_for_write);
    });

    let shared_error = Arc::clone(shared);
    let weak_for_error = weak_channel;
    channel.lock().unwrap().set_error_callback(move || {
        handle_error(&shared_error, fd, &weak_for_error);
    });

    channel.lock().unwrap().enable_writing();
    *shared.channel.lock().unwrap() = Some(channel);
}

fn detach_channel(weak_channel: &Weak<Mutex<Channel>>) {
    if let Some(channel) = weak_channel.upgrade() {
        channel.lock().unwrap().disable_all();
        channel.lock().unwrap().remove();
    }
}

fn handle_write(shared: &Arc<Shared>, fd: RawFd, weak_channel: &Weak<Mutex<Channel>>) {
    if *shared.state.lock().unwrap() != State::Connecting {
        return;
    }
    detach_channel(weak_channel);
    *shared.channel.lock().unwrap() = None;

    let err = sys_net::take_socket_error(fd).unwrap_or(0);
    if err != 0 {
        log_debug(&format!("Connector handleWrite SO_ERROR = {err}, retrying"));
        unsafe { libc::close(fd) };
        schedule_retry(shared);
        return;
    }

    let local = sys_net::local_addr(fd).ok();
    let peer = sys_net::peer_addr(fd).ok();
    if local.is_some() && local == peer {
        log_debug("Connector detected a self-connect, retrying");
        unsafe { libc::close(fd) };
        schedule_retry(shared);
        return;
    }

    *shared.state.lock().unwrap() = State::Connected;
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    if let Some(cb) = shared.new_connection_cb.lock().unwrap().as_mut() {
        cb(owned);
    } else {
        drop(owned);
    }
}

fn handle_error(shared: &Arc<Shared>, fd: RawFd, weak_channel: &Weak<Mutex<Channel>>) {
    detach_channel(weak_channel);
    *shared.channel.lock().unwrap() = None;
    log_debug(&format!("Connector handleError on fd {fd}, retrying"));
    unsafe { libc::close(fd) };
    schedule_retry(shared);
}

/// Sleeps on a detached thread, then re-enters `connect()` on the loop's
/// thread. The delay doubles each attempt up to a 30s cap (spec §4.7).
fn schedule_retry(shared: &Arc<Shared>) {
    if !shared.connect_enabled.load(Ordering::SeqCst) {
        return;
    }
    *shared.state.lock().unwrap() = State::Disconnected;

    let delay_ms = shared.retry_delay_ms.load(Ordering::SeqCst);
    let next_delay_ms = (delay_ms * 2).min(MAX_RETRY_DELAY_MS);
    shared.retry_delay_ms.store(next_delay_ms, Ordering::SeqCst);

    let shared = Arc::clone(shared);
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(delay_ms));
        if !shared.connect_enabled.load(Ordering::SeqCst) {
            return;
        }
        let loop_handle = shared.loop_handle.clone();
        loop_handle.run_in_loop(move || {
            if shared.connect_enabled.load(Ordering::SeqCst) {
                connect(&shared);
            }
        });
    });
}

#[cfg(feature = "log")]
fn log_debug(msg: &str) {
    log::debug!("{msg}");
}
#[cfg(not(feature = "log"))]
fn log_debug(_msg: &str) {}

#[cfg(feature = "log")]
fn log_error(msg: &str) {
    log::error!("{msg}");
}
#[cfg(not(feature = "log"))]
fn log_error(_msg: &str) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::sync::mpsc;

    #[test]
    fn connects_to_a_listening_socket() {
        let listener = sys_net::new_stream_socket().unwrap();
        let lfd = listener.as_raw_fd();
        sys_net::set_reuseaddr(lfd, true).unwrap();
        sys_net::bind(lfd, std::net::SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, 0)).unwrap();
        sys_net::listen(lfd).unwrap();
        let addr = InetAddress::from_raw(sys_net::local_addr(lfd).unwrap());

        let (tx, rx) = mpsc::channel();
        let (handle_tx, handle_rx) = mpsc::channel();
        let runner = std::thread::spawn(move || {
            let event_loop = EventLoop::new();
            let handle = event_loop.handle();
            let connector = Arc::new(Connector::new(handle.clone(), addr));
            connector.set_new_connection_callback(move |fd| {
                tx.send(fd).unwrap();
            });
            connector.start();
            handle_tx.send(handle).unwrap();
            event_loop.run();
        });
        let handle = handle_rx.recv().unwrap();

        let fd = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("connector should report a successful connect");
        assert!(fd.as_raw_fd() >= 0);

        handle.quit();
        runner.join().unwrap();
    }
}
