//! A multi-reactor TCP networking core.
//!
//! This crate implements a "one loop per thread, multiple loops per
//! process" reactor: a single base [`EventLoop`](event_loop::EventLoop) runs
//! on the embedder's thread and owns an [`Acceptor`](acceptor::Acceptor),
//! while a pool of sub-loops — each on its own OS thread — own the
//! connections handed to them. A matching non-blocking client dials out
//! through a [`Connector`](connector::Connector).
//!
//! Two orchestrators sit on top of the primitives: [`TcpServer`] for the
//! accept-and-distribute server role, and [`TcpClient`] for the dial-one-peer
//! client role. Both expose a callback-based interface so application code
//! supplies protocol logic without touching the reactor internals.
//!
//! ```no_run
//! use std::sync::Arc;
//! use reactor_net::{EventLoop, InetAddress, TcpServer};
//!
//! let event_loop = Arc::new(EventLoop::new());
//! let addr = InetAddress::any(9000);
//! let server = TcpServer::new(event_loop.handle(), addr, "echo", false);
//! server.set_thread_num(4);
//! server.set_message_callback(|conn, buf, _ts| {
//!     let data = buf.retrieve_all_as_vec();
//!     conn.send(data);
//! });
//! server.start();
//! event_loop.run();
//! ```

pub mod acceptor;
pub mod address;
pub mod buffer;
pub mod channel;
pub mod connector;
pub mod current_thread;
pub mod event_loop;
pub mod interest;
pub mod loop_thread;
mod sys;
pub mod tcp_client;
pub mod tcp_connection;
pub mod tcp_server;
pub mod token;

pub use acceptor::Acceptor;
pub use address::InetAddress;
pub use buffer::Buffer;
pub use channel::{Channel, Membership};
pub use connector::Connector;
pub use event_loop::{EventLoop, EventLoopHandle};
pub use interest::Interest;
pub use loop_thread::{LoopThread, LoopThreadPool, ThreadInitCallback};
pub use tcp_client::TcpClient;
pub use tcp_connection::Connection;
pub use tcp_server::TcpServer;
pub use token::Token;
