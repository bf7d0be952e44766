//! Server orchestrator: wires a base loop, an acceptor, and a sub-loop pool
//! (spec §4.9).

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::acceptor::Acceptor;
use crate::address::InetAddress;
use crate::buffer::Buffer;
use crate::event_loop::EventLoopHandle;
use crate::loop_thread::{LoopThreadPool, ThreadInitCallback};
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

/// Accepts connections on `listen_addr` and hands each one to a sub-loop
/// chosen round-robin from an internal thread pool.
pub struct TcpServer {
    base_loop: EventLoopHandle,
    name: String,
    acceptor: Arc<Mutex<Acceptor>>,
    thread_pool: Mutex<LoopThreadPool>,
    thread_num: AtomicU64,
    thread_init_cb: Mutex<Option<ThreadInitCallback>>,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    next_conn_id: AtomicU64,
    started: AtomicBool,
    callbacks: Mutex<Callbacks>,
}

impl TcpServer {
    pub fn new(
        base_loop: EventLoopHandle,
        listen_addr: InetAddress,
        name: impl Into<String>,
        reuseport: bool,
    ) -> Arc<TcpServer> {
        let name = name.into();
        let acceptor = Arc::new(Mutex::new(Acceptor::new(base_loop.clone(), listen_addr, reuseport)));
        let thread_pool = LoopThreadPool::new(base_loop.clone());

        let server = Arc::new(TcpServer {
            base_loop: base_loop.clone(),
            name,
            acceptor,
            thread_pool: Mutex::new(thread_pool),
            thread_num: AtomicU64::new(0),
            thread_init_cb: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
            callbacks: Mutex::new(Callbacks::default()),
        });

        let weak = Arc::downgrade(&server);
        server.acceptor.lock().unwrap().set_new_connection_callback(move |fd, peer| {
            if let Some(server) = weak.upgrade() {
                server.new_connection(fd, peer);
            }
        });

        server
    }

    /// Records the sub-loop count; the pool itself is spawned by `start`.
    /// Must be called before `start`.
    pub fn set_thread_num(&self, num_threads: usize) {
        assert!(!self.started.load(Ordering::SeqCst), "set_thread_num called after start");
        self.thread_num.store(num_threads as u64, Ordering::SeqCst);
    }

    /// Registers a callback run once per spawned sub-loop thread (and, if
    /// the thread count is zero, once against the base loop) right after
    /// construction. Must be called before `start`.
    pub fn set_thread_init_callback(&self, cb: impl Fn(&EventLoopHandle) + Send + Sync + 'static) {
        assert!(!self.started.load(Ordering::SeqCst), "set_thread_init_callback called after start");
        *self.thread_init_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn name(&self) -> &str {
        &self.name
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

    pub fn num_connections(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// The address the listening socket is bound to. Useful when `new` was
    /// given port `0` and the kernel picked one.
    pub fn local_addr(&self) -> InetAddress {
        self.acceptor.lock().unwrap().local_addr()
    }

    /// Idempotent: the first call starts the thread pool (if `set_thread_num`
    /// was never called, the pool just hands every connection to the base
    /// loop) and posts `acceptor.listen` to the base loop; later calls are
    /// no-ops.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let num_threads = self.thread_num.load(Ordering::SeqCst) as usize;
        let init_cb = self.thread_init_cb.lock().unwrap().clone();
        self.thread_pool.lock().unwrap().start(num_threads, init_cb);

        let acceptor = Arc::clone(&self.acceptor);
        self.base_loop.run_in_loop(move || {
            Acceptor::listen(&acceptor);
        });
    }

    fn new_connection(self: &Arc<Self>, fd: OwnedFd, peer_addr: InetAddress) {
        let sub_loop = self.thread_pool.lock().unwrap().get_next_loop();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let conn_name = format!("{}-{}#{}", self.name, peer_addr, conn_id);

        let local_addr = sys_net::local_addr(fd.as_raw_fd())
            .map(InetAddress::from_raw)
            .unwrap_or(peer_addr);

        let connection = Connection::new(sub_loop.clone(), conn_name.clone(), fd, local_addr, peer_addr);
        self.install_callbacks(&connection);

        self.connections
            .lock()
            .unwrap()
            .insert(conn_name.clone(), Arc::clone(&connection));

        let server_weak = Arc::downgrade(self);
        connection.set_close_callback(move |conn| {
            if let Some(server) = server_weak.upgrade() {
                server.remove_connection(conn);
            }
        });

        let conn_for_established = Arc::clone(&connection);
        sub_loop.run_in_loop(move || {
            conn_for_established.connect_established();
        });
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

    /// Hops to the base loop, erases the map entry, then posts
    /// `connect_destroyed` to the connection's own sub-loop (spec §4.9).
    fn remove_connection(self: &Arc<Self>, connection: &Arc<Connection>) {
        let server = Arc::clone(self);
        let connection = Arc::clone(connection);
        self.base_loop.run_in_loop(move || {
            server.connections.lock().unwrap().remove(connection.name());
            let connection_for_destroy = Arc::clone(&connection);
            connection
                .owning_loop()
                .run_in_loop(move || connection_for_destroy.connect_destroyed());
        });
    }
}
