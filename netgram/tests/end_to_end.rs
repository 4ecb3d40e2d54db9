//! End-to-end scenarios driving real [`Client`]/[`Server`] instances over
//! loopback UDP sockets, in the style of `flux-network`'s `tcp_roundtrip`
//! test: background threads, short sleeps, poll-until-condition loops.

use std::{
    net::{SocketAddr, UdpSocket},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use netgram::{
    Client, ClientConnectionInfo, ClientEvent, Dispatcher, Message, Server, ServerConfig,
    ServerEvent, tag,
};

fn wait_until(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

fn bind_loopback_server(dispatcher: Arc<Dispatcher>, config: ServerConfig) -> Server {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    Server::bind_with_config(addr, dispatcher, config).expect("server bind")
}

#[test]
fn handshake_assigns_id_and_fires_connected_exactly_once() {
    let server_dispatcher = Arc::new(Dispatcher::new());
    let server = bind_loopback_server(server_dispatcher, ServerConfig::default());
    let server_addr = server.local_addr().unwrap();

    let client_dispatcher = Arc::new(Dispatcher::new());
    let mut client = Client::new("alice", client_dispatcher);
    let connect_events = Arc::new(AtomicUsize::new(0));
    let connect_events2 = connect_events.clone();
    client.on_event(move |event| {
        if matches!(event, ClientEvent::Connected) {
            connect_events2.fetch_add(1, Ordering::SeqCst);
        }
    });

    client.connect_by_ip(server_addr).expect("client connect");

    assert!(wait_until(|| connect_events.load(Ordering::SeqCst) == 1, Duration::from_secs(2)));
    assert!(client.id() >= 0, "client should have adopted a non-negative assigned id");
    assert_eq!(server.client_ids().len(), 1);
}

#[test]
fn silent_client_is_evicted_while_the_responsive_one_survives() {
    let server_dispatcher = Arc::new(Dispatcher::new());
    let config = ServerConfig::default()
        .with_heartbeat_windows(Duration::from_millis(80), Duration::from_millis(80));
    let server = bind_loopback_server(server_dispatcher, config);
    let server_addr = server.local_addr().unwrap();

    let evicted = Arc::new(AtomicUsize::new(0));
    let evicted2 = evicted.clone();
    server.on_event(move |event| {
        if let ServerEvent::ClientDisconnected { local: false, .. } = event {
            evicted2.fetch_add(1, Ordering::SeqCst);
        }
    });

    // Client A replies to pings normally (handled automatically by Client's
    // receive loop).
    let dispatcher_a = Arc::new(Dispatcher::new());
    let mut client_a = Client::new("responsive", dispatcher_a);
    client_a.connect_by_ip(server_addr).expect("client a connect");
    assert!(wait_until(|| client_a.id() >= 0, Duration::from_secs(2)));

    // Client B is a raw socket that completes the handshake but never
    // answers `Ping`.
    let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
    silent.connect(server_addr).unwrap();
    silent.set_nonblocking(true).unwrap();
    let mut request = Message::outgoing(tag::CLIENT_CONNECTED);
    let info = ClientConnectionInfo::new("silent", 0, false);
    request.writer().write_serializable(&info);
    silent.send(request.as_bytes()).unwrap();

    assert!(wait_until(|| server.client_ids().len() == 2, Duration::from_secs(2)));

    // Two heartbeat cycles: one to send pings, one to evict non-responders.
    assert!(
        wait_until(|| evicted.load(Ordering::SeqCst) == 1, Duration::from_secs(3)),
        "silent client should be evicted"
    );
    assert!(wait_until(|| server.client_ids().len() == 1, Duration::from_secs(1)));
    assert_eq!(server.client_ids(), vec![client_a.id()]);
}

#[test]
fn datagram_from_unregistered_sender_gets_unknown_client_and_is_not_dispatched() {
    let server_dispatcher = Arc::new(Dispatcher::new());
    let server = bind_loopback_server(server_dispatcher.clone(), ServerConfig::default());
    let server_addr = server.local_addr().unwrap();

    let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
    raw.connect(server_addr).unwrap();
    raw.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    // Never handshaken: sender id 999, a user tag.
    let mut msg = Message::outgoing(42);
    msg.patch_sender_id(999);
    raw.send(msg.as_bytes()).unwrap();

    let mut buf = [0u8; 512];
    let n = raw.recv(&mut buf).expect("expected UnknownClient reply");
    let reply = Message::incoming(buf[..n].to_vec());
    assert_eq!(reply.tag(), tag::UNKNOWN_CLIENT);

    thread::sleep(Duration::from_millis(50));
    assert_eq!(server_dispatcher.queue_len(), 0, "unregistered sender's message must not be dispatched");
}

#[test]
fn send_others_excludes_only_the_matching_id() {
    let dispatcher = Arc::new(Dispatcher::new());
    let server = bind_loopback_server(dispatcher, ServerConfig::default());
    let server_addr = server.local_addr().unwrap();

    let raw_sockets: Vec<UdpSocket> = (0..3)
        .map(|i| {
            let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
            socket.connect(server_addr).unwrap();
            socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            let mut msg = Message::outgoing(tag::CLIENT_CONNECTED);
            let info = ClientConnectionInfo::new(format!("c{i}"), 0, false);
            msg.writer().write_serializable(&info);
            socket.send(msg.as_bytes()).unwrap();
            let mut buf = [0u8; 512];
            socket.recv(&mut buf).unwrap(); // handshake ack
            socket
        })
        .collect();

    assert!(wait_until(|| server.client_ids().len() == 3, Duration::from_secs(2)));
    let ids = server.client_ids();

    let mut broadcast = Message::outgoing(7);
    broadcast.writer().write_u8(1);
    let _ = server.send_others(ids[1], &broadcast);

    let mut received = vec![];
    for (idx, socket) in raw_sockets.iter().enumerate() {
        let mut buf = [0u8; 512];
        match socket.recv(&mut buf) {
            Ok(n) => {
                let m = Message::incoming(buf[..n].to_vec());
                if m.tag() == 7 {
                    received.push(idx);
                }
            }
            Err(_) => {}
        }
    }
    assert_eq!(received, vec![0, 2]);
}

#[test]
fn send_by_name_fans_out_to_every_id_sharing_that_name() {
    let dispatcher = Arc::new(Dispatcher::new());
    let server = bind_loopback_server(dispatcher, ServerConfig::default());
    let server_addr = server.local_addr().unwrap();

    let raw_sockets: Vec<UdpSocket> = (0..2)
        .map(|_| {
            let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
            socket.connect(server_addr).unwrap();
            socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            let mut msg = Message::outgoing(tag::CLIENT_CONNECTED);
            let info = ClientConnectionInfo::new("bob", 0, false);
            msg.writer().write_serializable(&info);
            socket.send(msg.as_bytes()).unwrap();
            let mut buf = [0u8; 512];
            socket.recv(&mut buf).unwrap();
            socket
        })
        .collect();

    assert!(wait_until(|| server.client_ids().len() == 2, Duration::from_secs(2)));

    let mut msg = Message::outgoing(11);
    msg.writer().write_u8(1);
    let results = server.send_by_name("bob", &msg);
    assert_eq!(results.len(), 2);

    for socket in &raw_sockets {
        let mut buf = [0u8; 512];
        let n = socket.recv(&mut buf).expect("expected fanned-out message");
        let m = Message::incoming(buf[..n].to_vec());
        assert_eq!(m.tag(), 11);
    }
}

#[test]
fn client_disconnect_notifies_the_server_locally() {
    let dispatcher = Arc::new(Dispatcher::new());
    let server = bind_loopback_server(dispatcher, ServerConfig::default());
    let server_addr = server.local_addr().unwrap();

    let local_disconnect = Arc::new(AtomicBool::new(false));
    let local_disconnect2 = local_disconnect.clone();
    server.on_event(move |event| {
        if let ServerEvent::ClientDisconnected { local: true, .. } = event {
            local_disconnect2.store(true, Ordering::SeqCst);
        }
    });

    let client_dispatcher = Arc::new(Dispatcher::new());
    let mut client = Client::new("leaving", client_dispatcher);
    client.connect_by_ip(server_addr).expect("connect");
    assert!(wait_until(|| client.id() >= 0, Duration::from_secs(2)));

    client.disconnect().expect("disconnect");
    assert!(wait_until(|| local_disconnect.load(Ordering::SeqCst), Duration::from_secs(2)));
    assert!(wait_until(|| server.client_ids().is_empty(), Duration::from_secs(1)));
}
