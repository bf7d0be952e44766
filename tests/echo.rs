//! End-to-end scenario 1 (spec §8): an echo server on a kernel-assigned
//! port, a client round-trip, then a server-initiated shutdown observed by
//! the client as a connection-down callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use reactor_net::{EventLoop, InetAddress, TcpClient, TcpServer};

#[test]
fn echo_round_trip_then_server_shutdown() {
    let (server_handle_tx, server_handle_rx) = mpsc::channel();
    let server_thread = std::thread::spawn(move || {
        let event_loop = EventLoop::new();
        server_handle_tx.send(event_loop.handle()).unwrap();
        event_loop.run();
    });
    let server_handle = server_handle_rx.recv().unwrap();

    let server = TcpServer::new(server_handle.clone(), InetAddress::loopback(0), "echo", false);
    server.set_thread_num(4);
    server.set_message_callback(|conn, buf, _ts| {
        let data = buf.retrieve_all_as_vec();
        conn.send(data);
        conn.shutdown();
    });
    server.start();
    let addr = server.local_addr();

    let (client_handle_tx, client_handle_rx) = mpsc::channel();
    let client_thread = std::thread::spawn(move || {
        let event_loop = EventLoop::new();
        client_handle_tx.send(event_loop.handle()).unwrap();
        event_loop.run();
    });
    let client_handle = client_handle_rx.recv().unwrap();

    let client = TcpClient::new(client_handle.clone(), addr, "echo-client");

    let (msg_tx, msg_rx) = mpsc::channel();
    client.set_message_callback(move |_conn, buf, _ts| {
        msg_tx.send(buf.retrieve_all_as_vec()).unwrap();
    });

    let down = Arc::new(AtomicBool::new(false));
    let down_clone = Arc::clone(&down);
    client.set_connection_callback(move |conn| {
        if conn.connected() {
            conn.send(b"hello".to_vec());
        } else {
            down_clone.store(true, Ordering::SeqCst);
        }
    });

    client.connect();

    let echoed = msg_rx
        .recv_timeout(Duration::from_secs(1))
        .expect("client should receive the echoed message within 1s");
    assert_eq!(echoed, b"hello");

    let deadline = std::time::Instant::now() + Duration::from_secs(1);
    while !down.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(down.load(Ordering::SeqCst), "client should observe connection-down after server shutdown");

    server_handle.quit();
    client_handle.quit();
    server_thread.join().unwrap();
    client_thread.join().unwrap();
}
