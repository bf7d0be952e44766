//! End-to-end scenario 4 (spec §8): with the high-water mark set to 64 KB,
//! a client sending 1 MB against a peer that never reads must see the
//! high-water callback fire, and only once pending bytes actually reach the
//! mark.

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use reactor_net::{EventLoop, InetAddress, TcpClient};

const HIGH_WATER: usize = 64 * 1024;

#[test]
fn high_water_callback_fires_once_pending_crosses_the_mark() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    // Accept the connection and then never read from it: the kernel's
    // receive window fills, backpressure propagates to the client's writes,
    // and the client's own output buffer starts accumulating.
    let _stalled_peer = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        std::mem::forget(stream);
        std::thread::sleep(Duration::from_secs(5));
    });

    let target_ip = match addr.ip() {
        std::net::IpAddr::V4(v4) => v4,
        std::net::IpAddr::V6(_) => unreachable!("test listener always binds an IPv4 loopback address"),
    };
    let target = InetAddress::new(target_ip, addr.port());

    let (client_handle_tx, client_handle_rx) = mpsc::channel();
    let client_thread = std::thread::spawn(move || {
        let event_loop = EventLoop::new();
        client_handle_tx.send(event_loop.handle()).unwrap();
        event_loop.run();
    });
    let client_handle = client_handle_rx.recv().unwrap();

    let client = TcpClient::new(client_handle.clone(), target, "stalled-client");

    let fired = Arc::new(AtomicBool::new(false));
    let min_pending_seen = Arc::new(AtomicUsize::new(usize::MAX));
    let fired_clone = Arc::clone(&fired);
    let min_pending_clone = Arc::clone(&min_pending_seen);
    client.set_high_water_callback(move |_conn, pending| {
        fired_clone.store(true, Ordering::SeqCst);
        min_pending_clone.fetch_min(pending, Ordering::SeqCst);
    });

    client.set_connection_callback(move |conn| {
        if conn.connected() {
            conn.set_high_water_mark(HIGH_WATER);
            conn.send(vec![0u8; 1024 * 1024]);
        }
    });

    client.connect();

    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while !fired.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(fired.load(Ordering::SeqCst), "high-water callback should fire against a stalled peer");
    assert!(
        min_pending_seen.load(Ordering::SeqCst) >= HIGH_WATER,
        "callback must only fire once pending bytes reach the high-water mark, saw {}",
        min_pending_seen.load(Ordering::SeqCst)
    );

    client_handle.quit();
    client_thread.join().unwrap();
}
