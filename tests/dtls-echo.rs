mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use seclink::{Client, SendError, Server, Transport, WorkQueue};

#[test]
fn dtls_echo() {
    let _ = env_logger::try_init();

    let cert = self_signed();
    let pool = Arc::new(WorkQueue::new());
    pool.start(4);

    let config = server_config(Transport::Datagram, &cert, Duration::from_secs(5));
    let link_mtu = config.mtu();
    let server = Server::new(Arc::new(config), pool.clone()).unwrap();

    let server_received = Arc::new(Mutex::new(Vec::new()));
    let server_connects = Arc::new(AtomicUsize::new(0));
    let server_disconnects = Arc::new(AtomicUsize::new(0));

    let r = server_received.clone();
    server.on_receive(move |server, key, _peer, data| {
        r.lock().unwrap().extend_from_slice(&data);
        let _ = server.send(key, data);
    });
    let c = server_connects.clone();
    server.on_connect(move |_, _, _| {
        c.fetch_add(1, Ordering::SeqCst);
    });
    let d = server_disconnects.clone();
    server.on_disconnect(move |_, _, _| {
        d.fetch_add(1, Ordering::SeqCst);
    });

    server.start().unwrap();
    let port = server.local_addr().unwrap().port();
    let ticker = Ticker::new(&server);

    let config = client_config(Transport::Datagram, &cert, port);
    let client = Client::new(Arc::new(config), pool.clone()).unwrap();

    let client_received = Arc::new(Mutex::new(Vec::new()));
    let client_disconnects = Arc::new(AtomicUsize::new(0));

    let r = client_received.clone();
    client.on_receive(move |_, data| r.lock().unwrap().extend_from_slice(&data));
    let d = client_disconnects.clone();
    client.on_disconnect(move |_, _| {
        d.fetch_add(1, Ordering::SeqCst);
    });

    client.start().unwrap();
    assert!(client.is_running());
    assert!(eventually(Duration::from_secs(5), || {
        server_connects.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(server.connection_count(), 1);
    let key = server.connection_keys()[0];

    // Both ends report the payload that fits one record, which is the
    // link MTU less the cipher's record overhead.
    let client_mtu = client.mtu().unwrap();
    assert_eq!(server.mtu(key), Some(client_mtu));
    assert!(client_mtu < link_mtu);
    assert!(client_mtu > link_mtu - 100);

    assert_eq!(client.send("HELLO").wait(), Ok(5));

    assert!(eventually(Duration::from_secs(5), || {
        client.tick();
        client_received.lock().unwrap().as_slice() == b"HELLO"
    }));
    assert_eq!(server_received.lock().unwrap().as_slice(), b"HELLO");

    client.stop();
    assert!(eventually(Duration::from_secs(5), || {
        server_disconnects.load(Ordering::SeqCst) == 1
    }));

    drop(ticker);
    server.stop();

    assert_eq!(client_disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(server_disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(server.connection_count(), 0);

    assert_eq!(client.send("late").wait(), Err(SendError::NotRunning));
    pool.stop(true);
}
