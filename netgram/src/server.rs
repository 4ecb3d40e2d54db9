//! The server half of the protocol: a roster-backed receive loop that
//! accepts handshakes, replies to heartbeats, evicts silent clients, and
//! exposes fan-out send variants by id, by name, and to everyone.
//!
//! Runs its own background thread around a [`mio::Poll`] loop, same as
//! [`crate::client::Client`] — see that module's doc comment for why a
//! background thread stands in for `flux-network`'s caller-driven
//! `poll_with`.

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicI16, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use mio::{Events, Interest, Poll, Token};
use tracing::{debug, warn};

use crate::{
    dispatcher::Dispatcher,
    heartbeat::Heartbeat,
    message::Message,
    roster::{ClientRecord, Roster},
    serializable::ClientConnectionInfo,
    socket,
    tag,
};

const SOCKET_TOKEN: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(50);
const RECV_BUF_SIZE: usize = 2048;

/// Tunable server parameters.
pub struct ServerConfig {
    pub buffer_capacity: usize,
    pub pong_window: Duration,
    pub ping_window: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: crate::buffer::default_capacity(),
            pong_window: Duration::from_secs(10),
            ping_window: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn with_heartbeat_windows(mut self, pong_window: Duration, ping_window: Duration) -> Self {
        self.pong_window = pong_window;
        self.ping_window = ping_window;
        self
    }
}

/// Events a [`Server`] emits directly, outside of `Dispatcher`-routed user
/// messages.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A handshake request arrived, before the new id is assigned.
    ClientConnected { name: String },
    /// A client left the roster, either by its own request (`local`) or
    /// by heartbeat eviction (`!local`).
    ClientDisconnected { id: i16, local: bool },
}

type EventHandler = Box<dyn Fn(ServerEvent) + Send + Sync>;

struct State {
    roster: Mutex<Roster>,
    next_id: AtomicI16,
    handlers: Mutex<Vec<EventHandler>>,
}

impl State {
    fn emit(&self, event: ServerEvent) {
        for handler in self.handlers.lock().expect("server handler mutex poisoned").iter() {
            handler(event.clone());
        }
    }
}

/// Accepts UDP connections on a bound port, tracks them in a [`Roster`],
/// and drives liveness via an internal [`Heartbeat`].
pub struct Server {
    config_capacity: usize,
    state: Arc<State>,
    socket: Option<Arc<mio::net::UdpSocket>>,
    cancel: Arc<AtomicBool>,
    receive_thread: Option<JoinHandle<()>>,
    heartbeat_thread: Option<JoinHandle<()>>,
    dispatcher: Arc<Dispatcher>,
}

impl Server {
    /// Binds `addr` with `SO_REUSEADDR` set and wires up the heartbeat.
    /// The receive loop and heartbeat driver both start immediately.
    pub fn bind(addr: SocketAddr, dispatcher: Arc<Dispatcher>) -> io::Result<Self> {
        Self::bind_with_config(addr, dispatcher, ServerConfig::default())
    }

    pub fn bind_with_config(
        addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        config: ServerConfig,
    ) -> io::Result<Self> {
        let mut mio_socket = socket::bind_reuseaddr(addr)?;
        let mut poll = Poll::new()?;
        poll.registry().register(&mut mio_socket, SOCKET_TOKEN, Interest::READABLE)?;
        let socket = Arc::new(mio_socket);

        let state = Arc::new(State {
            roster: Mutex::new(Roster::new()),
            // Starts at 1, not 0: every handshake request carries the
            // unpatched placeholder sender id (0, "before registration" per
            // the data model), so 0 must stay reserved and never be handed
            // out as a real assigned id.
            next_id: AtomicI16::new(1),
            handlers: Mutex::new(Vec::new()),
        });
        let cancel = Arc::new(AtomicBool::new(false));

        let receive_thread = {
            let socket = socket.clone();
            let state = state.clone();
            let dispatcher = dispatcher.clone();
            let cancel = cancel.clone();
            let capacity = config.buffer_capacity;
            std::thread::spawn(move || receive_loop(poll, socket, state, dispatcher, cancel, capacity))
        };

        let heartbeat_thread = {
            let socket = socket.clone();
            let state = state.clone();
            let cancel = cancel.clone();
            let capacity = config.buffer_capacity;
            let pong_window = config.pong_window;
            let ping_window = config.ping_window;
            std::thread::spawn(move || {
                heartbeat_loop(socket, state, cancel, capacity, pong_window, ping_window)
            })
        };

        Ok(Self {
            config_capacity: config.buffer_capacity,
            state,
            socket: Some(socket),
            cancel,
            receive_thread: Some(receive_thread),
            heartbeat_thread: Some(heartbeat_thread),
            dispatcher,
        })
    }

    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(ServerEvent) + Send + Sync + 'static,
    {
        self.state.handlers.lock().expect("server handler mutex poisoned").push(Box::new(handler));
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The address the server actually bound to — useful when
    /// [`Server::bind`] was given port `0`.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "server socket not bound"))?
            .local_addr()
    }

    /// Snapshot of every id currently in the roster, in registration order.
    pub fn client_ids(&self) -> Vec<i16> {
        self.state.roster.lock().expect("roster mutex poisoned").ids()
    }

    /// Sends `msg` to a single client. Returns the number of bytes sent,
    /// or `None` if `id` is not in the roster.
    pub fn send(&self, id: i16, msg: &mut Message) -> Option<io::Result<usize>> {
        let endpoint = self.state.roster.lock().expect("roster mutex poisoned").get(id)?.endpoint;
        msg.patch_sender_id(0);
        Some(self.send_to(endpoint, msg))
    }

    /// Sends `msg` to every id registered under `name`.
    pub fn send_by_name(&self, name: &str, msg: &Message) -> Vec<io::Result<usize>> {
        let ids = self.state.roster.lock().expect("roster mutex poisoned").ids_for_name(name);
        self.fan_out(&ids, msg)
    }

    /// Sends `msg` to every client in the roster.
    pub fn send_all(&self, msg: &Message) -> Vec<io::Result<usize>> {
        let ids = self.client_ids();
        self.fan_out(&ids, msg)
    }

    /// Sends `msg` to every client except `exclude_id`.
    pub fn send_others(&self, exclude_id: i16, msg: &Message) -> Vec<io::Result<usize>> {
        let ids: Vec<i16> = self.client_ids().into_iter().filter(|id| *id != exclude_id).collect();
        self.fan_out(&ids, msg)
    }

    /// Sends `msg` to every client whose name is not `exclude_name`.
    pub fn send_others_by_name(&self, exclude_name: &str, msg: &Message) -> Vec<io::Result<usize>> {
        let exclude: std::collections::HashSet<i16> =
            self.state.roster.lock().expect("roster mutex poisoned").ids_for_name(exclude_name).into_iter().collect();
        let ids: Vec<i16> = self.client_ids().into_iter().filter(|id| !exclude.contains(id)).collect();
        self.fan_out(&ids, msg)
    }

    fn fan_out(&self, ids: &[i16], msg: &Message) -> Vec<io::Result<usize>> {
        let endpoints: Vec<SocketAddr> = {
            let roster = self.state.roster.lock().expect("roster mutex poisoned");
            ids.iter().filter_map(|id| roster.get(*id)).map(|record| record.endpoint).collect()
        };
        endpoints.into_iter().map(|endpoint| self.send_to(endpoint, msg)).collect()
    }

    fn send_to(&self, endpoint: SocketAddr, msg: &Message) -> io::Result<usize> {
        let socket = self.socket.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "server socket not bound")
        })?;
        socket.send_to(msg.as_bytes(), endpoint)
    }

    /// Buffer capacity used for internally-constructed protocol messages
    /// (handshake acks, pings, eviction notices).
    pub fn buffer_capacity(&self) -> usize {
        self.config_capacity
    }

    /// Cancels the receive and heartbeat loops and closes the socket.
    pub fn shutdown(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(handle) = self.receive_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.heartbeat_thread.take() {
            let _ = handle.join();
        }
        self.socket = None;
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn receive_loop(
    mut poll: Poll,
    socket: Arc<mio::net::UdpSocket>,
    state: Arc<State>,
    dispatcher: Arc<Dispatcher>,
    cancel: Arc<AtomicBool>,
    buffer_capacity: usize,
) {
    let mut events = Events::with_capacity(32);
    let mut recv_buf = vec![0u8; RECV_BUF_SIZE];

    while !cancel.load(Ordering::SeqCst) {
        match poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!("server: transient poll error, continuing: {err}");
                continue;
            }
        }
        if cancel.load(Ordering::SeqCst) {
            break;
        }

        for event in events.iter() {
            if event.token() != SOCKET_TOKEN || !event.is_readable() {
                continue;
            }
            loop {
                match socket.recv_from(&mut recv_buf) {
                    Ok((n, from)) => handle_datagram(
                        &recv_buf[..n],
                        from,
                        &socket,
                        &state,
                        &dispatcher,
                        buffer_capacity,
                    ),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        warn!("server: transient recv error, continuing: {err}");
                        break;
                    }
                }
            }
        }
    }
    debug!("server: receive loop exiting");
}

fn handle_datagram(
    datagram: &[u8],
    from: SocketAddr,
    socket: &mio::net::UdpSocket,
    state: &Arc<State>,
    dispatcher: &Arc<Dispatcher>,
    buffer_capacity: usize,
) {
    let mut message = Message::incoming(datagram.to_vec());
    match message.tag() {
        tag::CLIENT_CONNECTED => {
            let info: ClientConnectionInfo = message.reader().read_serializable();
            state.emit(ServerEvent::ClientConnected { name: info.name.clone() });
            process_connection(message.sender_id(), info, from, socket, state, buffer_capacity);
        }
        tag::CLIENT_DISCONNECTED => {
            let info: ClientConnectionInfo = message.reader().read_serializable();
            let id = message.sender_id();
            state.roster.lock().expect("roster mutex poisoned").remove(id);
            state.emit(ServerEvent::ClientDisconnected { id, local: info.success });
        }
        tag::PONG => {
            let id = message.sender_id();
            let mut roster = state.roster.lock().expect("roster mutex poisoned");
            if let Some(record) = roster.get_mut(id) {
                record.alive = true;
            } else {
                drop(roster);
                reply_unknown_client(socket, from, buffer_capacity);
            }
        }
        other => {
            let id = message.sender_id();
            let known = state.roster.lock().expect("roster mutex poisoned").contains(id);
            if known {
                dispatcher.stage(message);
            } else {
                debug!(tag = other, sender = id, "server: dropping message from unregistered sender");
                reply_unknown_client(socket, from, buffer_capacity);
            }
        }
    }
}

/// Implements the server's five-step handshake acceptance, per the
/// protocol's `ProcessConnectionMessage`.
fn process_connection(
    submitted_id: i16,
    info: ClientConnectionInfo,
    endpoint: SocketAddr,
    socket: &mio::net::UdpSocket,
    state: &Arc<State>,
    buffer_capacity: usize,
) {
    let new_id = state.next_id.fetch_add(1, Ordering::SeqCst);
    {
        let mut roster = state.roster.lock().expect("roster mutex poisoned");
        if roster.contains(submitted_id) {
            roster.remove(submitted_id);
        }
        roster.insert(ClientRecord { id: new_id, name: info.name.clone(), endpoint, alive: true });
    }

    let ack = ClientConnectionInfo::new(info.name, new_id, true);
    let mut reply = Message::outgoing_with_capacity(tag::CLIENT_CONNECTED, buffer_capacity);
    reply.writer().write_serializable(&ack);
    reply.patch_sender_id(0);
    if let Err(err) = socket.send_to(reply.as_bytes(), endpoint) {
        warn!("server: failed to send handshake ack to {endpoint}: {err}");
    }
}

fn reply_unknown_client(socket: &mio::net::UdpSocket, endpoint: SocketAddr, buffer_capacity: usize) {
    let mut msg = Message::outgoing_with_capacity(tag::UNKNOWN_CLIENT, buffer_capacity);
    msg.patch_sender_id(0);
    if let Err(err) = socket.send_to(msg.as_bytes(), endpoint) {
        warn!("server: failed to send UnknownClient to {endpoint}: {err}");
    }
}

fn heartbeat_loop(
    socket: Arc<mio::net::UdpSocket>,
    state: Arc<State>,
    cancel: Arc<AtomicBool>,
    buffer_capacity: usize,
    pong_window: Duration,
    ping_window: Duration,
) {
    const TICK: Duration = Duration::from_millis(20);

    let pong_socket = socket.clone();
    let pong_state = state.clone();
    let ping_socket = socket;
    let ping_state = state;

    let mut heartbeat = Heartbeat::new(pong_window, ping_window)
        .with_pong_window_ended(move || on_pong_window_ended(&pong_socket, &pong_state, buffer_capacity))
        .with_ping_window_ended(move || on_ping_window_ended(&ping_socket, &ping_state, buffer_capacity));

    while !cancel.load(Ordering::SeqCst) {
        std::thread::sleep(TICK);
        heartbeat.update(TICK);
    }
    debug!("server: heartbeat loop exiting");
}

/// "Time to send pings, mark everyone suspect": clear every client's
/// `alive` flag and send an empty `Ping`.
fn on_pong_window_ended(socket: &mio::net::UdpSocket, state: &Arc<State>, buffer_capacity: usize) {
    let endpoints: Vec<SocketAddr> = {
        let mut roster = state.roster.lock().expect("roster mutex poisoned");
        for record in roster.iter_mut() {
            record.alive = false;
        }
        roster.ids().iter().filter_map(|id| roster.get(*id)).map(|r| r.endpoint).collect()
    };
    for endpoint in endpoints {
        let mut ping = Message::outgoing_with_capacity(tag::PING, buffer_capacity);
        ping.patch_sender_id(0);
        if let Err(err) = socket.send_to(ping.as_bytes(), endpoint) {
            warn!("server: failed to send ping to {endpoint}: {err}");
        }
    }
}

/// "Evict non-responders": every client still marked not-alive gets a
/// `ClientDisconnected { success: false }` notice, then is removed from
/// the roster.
fn on_ping_window_ended(socket: &mio::net::UdpSocket, state: &Arc<State>, buffer_capacity: usize) {
    let silent: Vec<ClientRecord> = {
        let roster = state.roster.lock().expect("roster mutex poisoned");
        roster.ids().iter().filter_map(|id| roster.get(*id)).filter(|r| !r.alive).cloned().collect()
    };

    for record in &silent {
        let info = ClientConnectionInfo::new(record.name.clone(), record.id, false);
        let mut notice = Message::outgoing_with_capacity(tag::CLIENT_DISCONNECTED, buffer_capacity);
        notice.writer().write_serializable(&info);
        notice.patch_sender_id(0);
        if let Err(err) = socket.send_to(notice.as_bytes(), record.endpoint) {
            warn!("server: failed to send eviction notice to {}: {err}", record.endpoint);
        }
    }

    let mut roster = state.roster.lock().expect("roster mutex poisoned");
    for record in &silent {
        roster.remove(record.id);
    }
    drop(roster);

    for record in silent {
        state.emit(ServerEvent::ClientDisconnected { id: record.id, local: false });
    }
}
