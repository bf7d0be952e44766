//! Client orchestrator: owns a connector and at most one live connection
//! (spec §4.9).

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::address::InetAddress;
use crate::buffer::Buffer;
use crate::connector::Connector;
use crate::event_loop::EventLoopHandle;
use crate::sys::net as sys_net;
use crate::tcp_connection::Connection;

type ConnectionCb = dyn Fn(&Arc<Connection>) + Send + Sync;
type MessageCb = dyn Fn(&Arc<Connection>, &mut Buffer, Instant) + Send + Sync;
type WriteCompleteCb = dyn Fn(&Arc<Connection>) + Send + Sync;
type HighWaterCb = dyn Fn(&Arc<Connection>, usize) + Send + Sync;

#[derive(Default)]
struct Callbacks {
    connection: Option<Arc<ConnectionCb>>,
    message: Option<Arc<MessageCb>>,
    write_complete: Option<Arc<WriteCompleteCb>>,
    high_water: Option<Arc<HighWaterCb>>,
}

/// Connects to a single remote address and owns at most one live
/// connection at a time. Supports automatic reconnection when
/// `enable_retry` was called before `connect`.
pub struct TcpClient {
    loop_handle: EventLoopHandle,
    name: String,
    connector: Arc<Connector>,
    connection: Mutex<Option<Arc<Connection>>>,
    next_conn_id: AtomicU64,
    retry: AtomicBool,
    connect_requested: AtomicBool,
    callbacks: Mutex<Callbacks>,
}

impl TcpClient {
    pub fn new(loop_handle: EventLoopHandle, server_addr: InetAddress, name: impl Into<String>) -> Arc<TcpClient> {
        let connector = Arc::new(Connector::new(loop_handle.clone(), server_addr));

        let client = Arc::new(TcpClient {
            loop_handle,
            name: name.into(),
            connector,
            connection: Mutex::new(None),
            next_conn_id: AtomicU64::new(1),
            retry: AtomicBool::new(false),
            connect_requested: AtomicBool::new(false),
            callbacks: Mutex::new(Callbacks::default()),
        });

        let weak = Arc::downgrade(&client);
        client.connector.set_new_connection_callback(move |fd| {
            if let Some(client) = weak.upgrade() {
                client.new_connection(fd);
            }
        });

        client
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enables automatic reconnection when the current connection closes
    /// while a connect is still requested. Call before `connect`.
    pub fn enable_retry(&self) {
        self.retry.store(true, Ordering::SeqCst);
    }

    pub fn set_connection_callback(&self, cb: impl Fn(&Arc<Connection>) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().connection = Some(Arc::new(cb));
    }

    pub fn set_message_callback(&self, cb: impl Fn(&Arc<Connection>, &mut Buffer, Instant) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().message = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback(&self, cb: impl Fn(&Arc<Connection>) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().write_complete = Some(Arc::new(cb));
    }

    pub fn set_high_water_callback(&self, cb: impl Fn(&Arc<Connection>, usize) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().high_water = Some(Arc::new(cb));
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.lock().unwrap().clone()
    }

    pub fn connect(self: &Arc<Self>) {
        self.connect_requested.store(true, Ordering::SeqCst);
        let connector = Arc::clone(&self.connector);
        self.loop_handle.run_in_loop(move || connector.start());
    }

    /// Issues `shutdown` on the current connection, if any, via the loop.
    pub fn disconnect(&self) {
        self.connect_requested.store(false, Ordering::SeqCst);
        if let Some(conn) = self.connection() {
            conn.shutdown();
        }
    }

    fn new_connection(self: &Arc<Self>, fd: OwnedFd) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let conn_name = format!("{}#{}", self.name, conn_id);

        let local_addr = sys_net::local_addr(fd.as_raw_fd()).map(InetAddress::from_raw).unwrap_or(InetAddress::any(0));
        let peer_addr = sys_net::peer_addr(fd.as_raw_fd()).map(InetAddress::from_raw).unwrap_or(InetAddress::any(0));

        let connection = Connection::new(self.loop_handle.clone(), conn_name, fd, local_addr, peer_addr);
        self.install_callbacks(&connection);

        let client_weak = Arc::downgrade(self);
        connection.set_close_callback(move |conn| {
            if let Some(client) = client_weak.upgrade() {
                client.remove_connection(conn);
            }
        });

        *self.connection.lock().unwrap() = Some(Arc::clone(&connection));
        connection.connect_established();
    }

    fn install_callbacks(&self, connection: &Arc<Connection>) {
        let callbacks = self.callbacks.lock().unwrap();
        if let Some(cb) = callbacks.connection.clone() {
            connection.set_connection_callback(move |conn| cb(conn));
        }
        if let Some(cb) = callbacks.message.clone() {
            connection.set_message_callback(move |conn, buf, ts| cb(conn, buf, ts));
        }
        if let Some(cb) = callbacks.write_complete.clone() {
            connection.set_write_complete_callback(move |conn| cb(conn));
        }
        if let Some(cb) = callbacks.high_water.clone() {
            connection.set_high_water_callback(move |conn, n| cb(conn, n));
        }
    }

    /// On close: if both retry and a connect are still requested, restarts
    /// the connector; otherwise the client settles into the disconnected
    /// state (spec §4.9).
    fn remove_connection(self: &Arc<Self>, connection: &Arc<Connection>) {
        {
            let mut guard = self.connection.lock().unwrap();
            if guard.as_ref().map(Arc::as_ptr) == Some(Arc::as_ptr(connection)) {
                *guard = None;
            }
        }

        let connection = Arc::clone(connection);
        self.loop_handle.run_in_loop(move || connection.connect_destroyed());

        if self.retry.load(Ordering::SeqCst) && self.connect_requested.load(Ordering::SeqCst) {
            let connector = Arc::clone(&self.connector);
            self.loop_handle.run_in_loop(move || connector.start());
        }
    }
}

impl Drop for TcpClient {
    /// If a connection is still live, shut it down. `remove_connection`'s
    /// weak upgrade of `self` naturally fails once this drop begins (Arc's
    /// strong count already hit zero), so the close callback becomes a
    /// no-op instead of touching a half-dropped client.
    fn drop(&mut self) {
        if let Some(connection) = self.connection.lock().unwrap().take() {
            connection.shutdown();
        }
        self.connector.stop();
    }
}
