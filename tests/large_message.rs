//! End-to-end scenario 3 (spec §8): one client sends 10 MB in a single
//! `send` call; the server's message callback eventually sees all of it,
//! byte-for-byte, and the client's write-complete callback fires exactly
//! once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use reactor_net::{EventLoop, InetAddress, TcpClient, TcpServer};

const TOTAL: usize = 10 * 1024 * 1024;

#[test]
fn large_message_arrives_byte_for_byte() {
    let (server_handle_tx, server_handle_rx) = mpsc::channel();
    let server_thread = std::thread::spawn(move || {
        let event_loop = EventLoop::new();
        server_handle_tx.send(event_loop.handle()).unwrap();
        event_loop.run();
    });
    let server_handle = server_handle_rx.recv().unwrap();

    let server = TcpServer::new(server_handle.clone(), InetAddress::loopback(0), "bulk", false);
    server.set_thread_num(2);

    let received = Arc::new(Mutex::new(Vec::with_capacity(TOTAL)));
    let (done_tx, done_rx) = mpsc::channel();
    let received_for_cb = Arc::clone(&received);
    server.set_message_callback(move |_conn, buf, _ts| {
        let mut got = received_for_cb.lock().unwrap();
        got.extend_from_slice(&buf.retrieve_all_as_vec());
        if got.len() >= TOTAL {
            done_tx.send(()).ok();
        }
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

    let client = TcpClient::new(client_handle.clone(), addr, "bulk-client");

    let write_complete_count = Arc::new(AtomicUsize::new(0));
    let wcc = Arc::clone(&write_complete_count);
    client.set_write_complete_callback(move |_conn| {
        wcc.fetch_add(1, Ordering::SeqCst);
    });

    let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
    let payload_for_send = payload.clone();
    client.set_connection_callback(move |conn| {
        if conn.connected() {
            conn.send(payload_for_send.clone());
        }
    });

    client.connect();

    done_rx
        .recv_timeout(Duration::from_secs(15))
        .expect("server should eventually observe all 10MB");
    assert_eq!(&*received.lock().unwrap(), &payload);

    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while write_complete_count.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(
        write_complete_count.load(Ordering::SeqCst),
        1,
        "write-complete should fire exactly once, after the last kernel write succeeds"
    );

    server_handle.quit();
    client_handle.quit();
    server_thread.join().unwrap();
    client_thread.join().unwrap();
}
