//! Per-connection state machine: read/write handling, send buffering,
//! high-water notification, and close sequencing (spec §4.8).

use std::any::Any;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::address::InetAddress;
use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::EventLoopHandle;
use crate::sys::net as sys_net;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

pub type ConnectionCallback = Box<dyn Fn(&Arc<Connection>) + Send + Sync>;
pub type MessageCallback = Box<dyn Fn(&Arc<Connection>, &mut Buffer, Instant) + Send + Sync>;
pub type WriteCompleteCallback = Box<dyn Fn(&Arc<Connection>) + Send + Sync>;
pub type HighWaterCallback = Box<dyn Fn(&Arc<Connection>, usize) + Send + Sync>;
pub type CloseCallback = Box<dyn Fn(&Arc<Connection>) + Send + Sync>;

struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water: Option<HighWaterCallback>,
    close: Option<CloseCallback>,
}

impl Default for Callbacks {
    fn default() -> Self {
        Callbacks {
            connection: None,
            message: None,
            write_complete: None,
            high_water: None,
            close: None,
        }
    }
}

struct Mutable {
    state: State,
    socket: Option<OwnedFd>,
    input_buffer: Buffer,
    output_buffer: Buffer,
    channel: Option<Arc<Mutex<Channel>>>,
    context: Option<Box<dyn Any + Send>>,
}

/// A single accepted or connected TCP socket, owned jointly by its server's
/// or client's connection map (strong) and its own channel (weak tie) for
/// the duration of dispatch.
pub struct Connection {
    loop_handle: EventLoopHandle,
    name: String,
    local_addr: InetAddress,
    peer_addr: InetAddress,
    high_water_mark: AtomicUsize,
    mutable: Mutex<Mutable>,
    callbacks: Mutex<Callbacks>,
    reading: AtomicBool,
}

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

impl Connection {
    /// Constructs a connection in `Connecting` state, owning `socket`. The
    /// connection is not yet registered with the loop; call
    /// `connect_established` once it has been inserted into the owner's map.
    pub fn new(
        loop_handle: EventLoopHandle,
        name: String,
        socket: OwnedFd,
        local_addr: InetAddress,
        peer_addr: InetAddress,
    ) -> Arc<Connection> {
        sys_net::set_keepalive(socket.as_raw_fd(), true).ok();

        Arc::new(Connection {
            loop_handle,
            name,
            local_addr,
            peer_addr,
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            mutable: Mutex::new(Mutable {
                state: State::Connecting,
                socket: Some(socket),
                input_buffer: Buffer::new(),
                output_buffer: Buffer::new(),
                channel: None,
                context: None,
            }),
            callbacks: Mutex::new(Callbacks::default()),
            reading: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> InetAddress {
        self.local_addr
    }

    pub fn peer_addr(&self) -> InetAddress {
        self.peer_addr
    }

    pub fn owning_loop(&self) -> EventLoopHandle {
        self.loop_handle.clone()
    }

    pub fn connected(&self) -> bool {
        self.mutable.lock().unwrap().state == State::Connected
    }

    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::SeqCst)
    }

    pub fn set_high_water_mark(&self, bytes: usize) {
        self.high_water_mark.store(bytes, Ordering::SeqCst);
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark.load(Ordering::SeqCst)
    }

    pub fn set_connection_callback(&self, cb: impl Fn(&Arc<Connection>) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().connection = Some(Box::new(cb));
    }

    pub fn set_message_callback(&self, cb: impl Fn(&Arc<Connection>, &mut Buffer, Instant) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().message = Some(Box::new(cb));
    }

    pub fn set_write_complete_callback(&self, cb: impl Fn(&Arc<Connection>) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().write_complete = Some(Box::new(cb));
    }

    pub fn set_high_water_callback(&self, cb: impl Fn(&Arc<Connection>, usize) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().high_water = Some(Box::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl Fn(&Arc<Connection>) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().close = Some(Box::new(cb));
    }

    pub fn set_context(&self, value: impl Any + Send + 'static) {
        self.mutable.lock().unwrap().context = Some(Box::new(value));
    }

    /// Runs `f` with the stashed context downcast to `T`, or `None` if no
    /// context was set or it was set with a different type. Scoped rather
    /// than returning `Option<&T>` directly since the value lives behind a
    /// mutex guard.
    pub fn with_context<T: Any, R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        let guard = self.mutable.lock().unwrap();
        f(guard.context.as_ref().and_then(|c| c.downcast_ref::<T>()))
    }

    pub fn set_tcp_nodelay(&self, on: bool) {
        if let Some(socket) = self.mutable.lock().unwrap().socket.as_ref() {
            if let Err(e) = sys_net::set_nodelay(socket.as_raw_fd(), on) {
                log_error(&format!("set_tcp_nodelay failed for {}: {e}", self.name));
            }
        }
    }

    pub fn set_keep_alive(&self, on: bool) {
        if let Some(socket) = self.mutable.lock().unwrap().socket.as_ref() {
            if let Err(e) = sys_net::set_keepalive(socket.as_raw_fd(), on) {
                log_error(&format!("set_keep_alive failed for {}: {e}", self.name));
            }
        }
    }

    /// Ties the channel to this connection, enables read interest, and
    /// fires the connection-up callback. Must run on the owning sub-loop.
    pub fn connect_established(self: &Arc<Self>) {
        {
            let mut guard = self.mutable.lock().unwrap();
            debug_assert_eq!(guard.state, State::Connecting);
            guard.state = State::Connected;
        }

        let fd = {
            let guard = self.mutable.lock().unwrap();
            guard.socket.as_ref().unwrap().as_raw_fd()
        };
        let channel = Channel::new_shared(self.loop_handle.clone(), fd);
        let owner: Arc<dyn Any + Send + Sync> = Arc::clone(self) as Arc<dyn Any + Send + Sync>;
        channel.lock().unwrap().tie(&owner);

        let self_for_read = Arc::clone(self);
        channel.lock().unwrap().set_read_callback(move |ts| {
            self_for_read.handle_read(ts);
        });
        let self_for_write = Arc::clone(self);
        channel.lock().unwrap().set_write_callback(move || {
            self_for_write.handle_write();
        });
        let self_for_close = Arc::clone(self);
        channel.lock().unwrap().set_close_callback(move || {
            self_for_close.handle_close();
        });
        let self_for_error = Arc::clone(self);
        channel.lock().unwrap().set_error_callback(move || {
            self_for_error.handle_error();
        });

        channel.lock().unwrap().enable_reading();
        self.reading.store(true, Ordering::SeqCst);
        self.mutable.lock().unwrap().channel = Some(channel);

        let cb = self.callbacks.lock().unwrap().connection.take();
        if let Some(cb) = cb {
            cb(self);
            self.callbacks.lock().unwrap().connection = Some(cb);
        }
    }

    /// Tears down the channel once the connection is fully disconnected.
    /// Must run on the owning sub-loop, after `handle_close`.
    pub fn connect_destroyed(self: &Arc<Self>) {
        let was_connected = {
            let mut guard = self.mutable.lock().unwrap();
            let was_connected = guard.state == State::Connected;
            if was_connected {
                guard.state = State::Disconnected;
                if let Some(channel) = guard.channel.as_ref() {
                    channel.lock().unwrap().disable_all();
                }
            }
            was_connected
        };

        if was_connected {
            let cb = self.callbacks.lock().unwrap().connection.take();
            if let Some(cb) = cb {
                cb(self);
                self.callbacks.lock().unwrap().connection = Some(cb);
            }
        }

        let channel = self.mutable.lock().unwrap().channel.take();
        if let Some(channel) = channel {
            channel.lock().unwrap().remove();
        }
    }

    fn handle_read(self: &Arc<Self>, timestamp: Instant) {
        let fd = {
            let guard = self.mutable.lock().unwrap();
            match guard.socket.as_ref() {
                Some(s) => s.as_raw_fd(),
                None => return,
            }
        };
        let result = {
            let mut guard = self.mutable.lock().unwrap();
            guard.input_buffer.read_fd(fd)
        };
        match result {
            Ok(0) => self.handle_close(),
            Ok(_) => {
                let cb = self.callbacks.lock().unwrap().message.take();
                if let Some(cb) = cb {
                    let mut buf = std::mem::take(&mut self.mutable.lock().unwrap().input_buffer);
                    cb(self, &mut buf, timestamp);
                    self.mutable.lock().unwrap().input_buffer = buf;
                    self.callbacks.lock().unwrap().message = Some(cb);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                log_error(&format!("Connection {} handle_read error: {e}", self.name));
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        let channel = match self.mutable.lock().unwrap().channel.clone() {
            Some(c) => c,
            None => return,
        };
        if !channel.lock().unwrap().is_writing() {
            return;
        }

        let fd = {
            let guard = self.mutable.lock().unwrap();
            match guard.socket.as_ref() {
                Some(s) => s.as_raw_fd(),
                None => return,
            }
        };

        let written = {
            let guard = self.mutable.lock().unwrap();
            guard.output_buffer.write_fd(fd)
        };

        match written {
            Ok(n) => {
                self.mutable.lock().unwrap().output_buffer.retrieve(n);
                let (remaining, disconnecting) = {
                    let guard = self.mutable.lock().unwrap();
                    (guard.output_buffer.readable_bytes(), guard.state == State::Disconnecting)
                };
                if remaining == 0 {
                    channel.lock().unwrap().disable_writing();
                    let self_clone = Arc::clone(self);
                    self.loop_handle.queue_in_loop(move || {
                        self_clone.fire_write_complete();
                    });
                    if disconnecting {
                        self.shutdown_write();
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                log_error(&format!("Connection {} handle_write error: {e}", self.name));
            }
        }
    }

    fn handle_close(self: &Arc<Self>) {
        {
            let mut guard = self.mutable.lock().unwrap();
            if guard.state == State::Disconnected {
                return;
            }
            guard.state = State::Disconnected;
        }
        if let Some(channel) = self.mutable.lock().unwrap().channel.as_ref() {
            channel.lock().unwrap().disable_all();
        }

        let connection_cb = self.callbacks.lock().unwrap().connection.take();
        if let Some(cb) = connection_cb {
            cb(self);
            self.callbacks.lock().unwrap().connection = Some(cb);
        }
        let close_cb = self.callbacks.lock().unwrap().close.take();
        if let Some(cb) = close_cb {
            cb(self);
            self.callbacks.lock().unwrap().close = Some(cb);
        }
    }

    fn handle_error(self: &Arc<Self>) {
        let fd = {
            let guard = self.mutable.lock().unwrap();
            guard.socket.as_ref().map(|s| s.as_raw_fd())
        };
        if let Some(fd) = fd {
            let err = sys_net::take_socket_error(fd).unwrap_or(0);
            log_error(&format!("Connection {} SO_ERROR = {err}", self.name));
        }
    }

    /// Queues `data` for sending. Drops the write silently once the
    /// connection is no longer `Connected` (spec §4.8).
    pub fn send(self: &Arc<Self>, data: Vec<u8>) {
        if !self.connected() {
            return;
        }
        if self.loop_handle.is_in_loop_thread() {
            self.send_in_loop(&data);
        } else {
            let self_clone = Arc::clone(self);
            self.loop_handle.run_in_loop(move || {
                self_clone.send_in_loop(&data);
            });
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        let (state, already_writing, output_empty) = {
            let guard = self.mutable.lock().unwrap();
            let channel_writing = guard
                .channel
                .as_ref()
                .map(|c| c.lock().unwrap().is_writing())
                .unwrap_or(false);
            (guard.state, channel_writing, guard.output_buffer.readable_bytes() == 0)
        };

        if state == State::Disconnected {
            log_debug(&format!("Connection {} send_in_loop called after disconnect", self.name));
            return;
        }

        let mut remaining = data;
        let mut fault = false;

        if !already_writing && output_empty {
            let fd = {
                let guard = self.mutable.lock().unwrap();
                guard.socket.as_ref().map(|s| s.as_raw_fd())
            };
            if let Some(fd) = fd {
                match sys_net::write(fd, data) {
                    Ok(n) => {
                        remaining = &data[n..];
                        if remaining.is_empty() {
                            let self_clone = Arc::clone(self);
                            self.loop_handle.queue_in_loop(move || {
                                self_clone.fire_write_complete();
                            });
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) if e.raw_os_error() == Some(libc::EPIPE) || e.raw_os_error() == Some(libc::ECONNRESET) => {
                        log_error(&format!("Connection {} send_in_loop fatal error: {e}", self.name));
                        fault = true;
                    }
                    Err(e) => {
                        log_error(&format!("Connection {} send_in_loop error: {e}", self.name));
                    }
                }
            }
        }

        if !fault && !remaining.is_empty() {
            let pre_len = self.mutable.lock().unwrap().output_buffer.readable_bytes();
            let post_len = pre_len + remaining.len();
            let high_water_mark = self.high_water_mark();
            if pre_len < high_water_mark && post_len >= high_water_mark {
                let self_clone = Arc::clone(self);
                self.loop_handle.queue_in_loop(move || {
                    self_clone.fire_high_water(post_len);
                });
            }
            self.mutable.lock().unwrap().output_buffer.append(remaining);
            if let Some(channel) = self.mutable.lock().unwrap().channel.as_ref() {
                if !channel.lock().unwrap().is_writing() {
                    channel.lock().unwrap().enable_writing();
                }
            }
        }
    }

    /// Initiates an orderly shutdown: if the output buffer is empty,
    /// shuts down the write side immediately; otherwise transitions to
    /// `Disconnecting` and lets `handle_write` perform the shutdown once
    /// drained.
    pub fn shutdown(self: &Arc<Self>) {
        if self.loop_handle.is_in_loop_thread() {
            self.shutdown_in_loop();
        } else {
            let self_clone = Arc::clone(self);
            self.loop_handle.run_in_loop(move || {
                self_clone.shutdown_in_loop();
            });
        }
    }

    fn shutdown_in_loop(self: &Arc<Self>) {
        let mut guard = self.mutable.lock().unwrap();
        if guard.state != State::Connected {
            return;
        }
        let is_writing = guard
            .channel
            .as_ref()
            .map(|c| c.lock().unwrap().is_writing())
            .unwrap_or(false);
        if !is_writing {
            drop(guard);
            self.shutdown_write();
        } else {
            guard.state = State::Disconnecting;
        }
    }

    fn shutdown_write(&self) {
        let guard = self.mutable.lock().unwrap();
        if let Some(socket) = guard.socket.as_ref() {
            if let Err(e) = sys_net::shutdown_write(socket.as_raw_fd()) {
                log_error(&format!("Connection {} shutdown_write failed: {e}", self.name));
            }
        }
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.mutable.lock().unwrap().socket.as_ref().map(|s| s.as_raw_fd())
    }

    /// Re-fetches and invokes the write-complete callback. Queued via
    /// `queue_in_loop` rather than called inline from `handle_write`, so the
    /// notification always runs as a fresh loop task (spec §4.8) instead of
    /// under whatever lock `handle_write` happened to be holding.
    fn fire_write_complete(self: &Arc<Self>) {
        let cb = self.callbacks.lock().unwrap().write_complete.take();
        if let Some(cb) = cb {
            cb(self);
            self.callbacks.lock().unwrap().write_complete = Some(cb);
        }
    }

    /// Re-fetches and invokes the high-water callback. Queued via
    /// `queue_in_loop` from `send_in_loop` (spec §4.8) rather than called
    /// inline, matching `fire_write_complete`'s deferral.
    fn fire_high_water(self: &Arc<Self>, pending: usize) {
        let cb = self.callbacks.lock().unwrap().high_water.take();
        if let Some(cb) = cb {
            cb(self, pending);
            self.callbacks.lock().unwrap().high_water = Some(cb);
        }
    }
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
    use std::net::Ipv4Addr;
    use std::sync::mpsc;

    fn loopback_pair() -> (OwnedFd, OwnedFd) {
        let listener = sys_net::new_stream_socket().unwrap();
        let lfd = listener.as_raw_fd();
        sys_net::set_reuseaddr(lfd, true).unwrap();
        sys_net::bind(lfd, std::net::SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        sys_net::listen(lfd).unwrap();
        let addr = sys_net::local_addr(lfd).unwrap();

        let client = sys_net::new_stream_socket().unwrap();
        let _ = sys_net::connect(client.as_raw_fd(), addr);
        std::thread::sleep(std::time::Duration::from_millis(50));
        let (server_side, _peer) = sys_net::accept(lfd).unwrap();
        (server_side, client)
    }

    #[test]
    fn echoes_received_bytes() {
        let (setup_tx, setup_rx) = mpsc::channel();
        let (tx, rx) = mpsc::channel();

        let runner = std::thread::spawn(move || {
            let event_loop = EventLoop::new();
            let handle = event_loop.handle();
            let (server_fd, client_fd) = loopback_pair();

            let conn = Connection::new(
                handle.clone(),
                "test-conn".to_string(),
                server_fd,
                InetAddress::loopback(0),
                InetAddress::loopback(0),
            );
            let tx2 = tx.clone();
            conn.set_message_callback(move |conn, buf, _ts| {
                let data = buf.retrieve_all_as_vec();
                conn.send(data.clone());
                tx2.send(data).unwrap();
            });
            conn.connect_established();

            setup_tx.send((handle, client_fd)).unwrap();
            event_loop.run();
        });

        let (handle, client_fd): (EventLoopHandle, OwnedFd) = setup_rx.recv().unwrap();
        sys_net::write(client_fd.as_raw_fd(), b"hello").unwrap();

        let got = rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        assert_eq!(got, b"hello");

        handle.quit();
        runner.join().unwrap();
    }
}
