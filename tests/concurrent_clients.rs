//! End-to-end scenario 2 (spec §8): many concurrent clients against one
//! echo server, each seeing exactly one up/down callback pair and exactly
//! the bytes it sent.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use reactor_net::{EventLoop, InetAddress, TcpClient, TcpServer};

const CLIENTS: usize = 20;
const PAYLOAD_LEN: usize = 1024;

#[test]
fn concurrent_clients_round_trip_exactly_once() {
    let (server_handle_tx, server_handle_rx) = mpsc::channel();
    let server_thread = std::thread::spawn(move || {
        let event_loop = EventLoop::new();
        server_handle_tx.send(event_loop.handle()).unwrap();
        event_loop.run();
    });
    let server_handle = server_handle_rx.recv().unwrap();

    let server = TcpServer::new(server_handle.clone(), InetAddress::loopback(0), "echo-many", false);
    server.set_thread_num(4);
    server.set_message_callback(|conn, buf, _ts| {
        let data = buf.retrieve_all_as_vec();
        conn.send(data);
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

    let (done_tx, done_rx) = mpsc::channel();
    let mut clients = Vec::with_capacity(CLIENTS);

    for i in 0..CLIENTS {
        let payload = vec![(i % 256) as u8; PAYLOAD_LEN];
        let client = TcpClient::new(client_handle.clone(), addr, format!("client-{i}"));

        let up_count = Arc::new(AtomicUsize::new(0));
        let down_count = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));

        let up_clone = Arc::clone(&up_count);
        let down_clone = Arc::clone(&down_count);
        let payload_for_connect = payload.clone();
        client.set_connection_callback(move |conn| {
            if conn.connected() {
                up_clone.fetch_add(1, Ordering::SeqCst);
                conn.send(payload_for_connect.clone());
            } else {
                down_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        let received_clone = Arc::clone(&received);
        let done_tx_clone = done_tx.clone();
        client.set_message_callback(move |conn, buf, _ts| {
            let mut got = received_clone.lock().unwrap();
            got.extend_from_slice(&buf.retrieve_all_as_vec());
            if got.len() >= PAYLOAD_LEN {
                conn.shutdown();
                done_tx_clone.send(()).ok();
            }
        });

        client.connect();
        clients.push((client, up_count, down_count, received, payload));
    }
    drop(done_tx);

    for _ in 0..CLIENTS {
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("every client should round-trip its payload");
    }

    // Give each client's close sequence a moment to land after its shutdown.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        let all_down = clients.iter().all(|(_, _, down, _, _)| down.load(Ordering::SeqCst) == 1);
        if all_down || std::time::Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    for (_, up_count, down_count, received, payload) in &clients {
        assert_eq!(up_count.load(Ordering::SeqCst), 1, "connection-up must fire exactly once");
        assert_eq!(down_count.load(Ordering::SeqCst), 1, "connection-down must fire exactly once");
        assert_eq!(&*received.lock().unwrap(), payload, "each client must see exactly its own bytes");
    }

    server_handle.quit();
    client_handle.quit();
    server_thread.join().unwrap();
    client_thread.join().unwrap();
}
