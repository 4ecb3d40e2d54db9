//! The client half of the protocol: connects to a server over a single
//! "connected" UDP socket, performs the handshake, answers heartbeat
//! `Ping`s, and forwards everything else to a [`Dispatcher`].
//!
//! The receive loop runs on a dedicated background thread driving its own
//! [`mio::Poll`], the way `flux-network`'s `TcpConnector` drives one —
//! except there is no embedder already running a main loop to drive this
//! from, so the loop owns its own thread instead of exposing a
//! caller-driven `poll_with`.

use std::{
    io,
    net::{SocketAddr, ToSocketAddrs},
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
    message::Message,
    serializable::ClientConnectionInfo,
    socket,
    tag,
};

const SOCKET_TOKEN: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const RECV_BUF_SIZE: usize = 2048;

/// Client-side connection lifecycle. `Connecting` covers the interval
/// between opening the transport socket and receiving the server's
/// handshake ack; the public [`ClientEvent::Connected`] event, and this
/// state's transition to `Connected`, both happen only once that ack
/// arrives — see the handshake resolution in `DESIGN.md`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events a [`Client`] emits directly (not staged through a
/// [`Dispatcher`]); user-tagged payloads go through the dispatcher
/// instead, via [`ClientConfig`]'s attached dispatcher.
#[derive(Debug, Clone, Copy)]
pub enum ClientEvent {
    /// The handshake ack arrived and an id was assigned.
    Connected,
    /// `local == true` if this client initiated the disconnect;
    /// `local == false` if the server evicted it.
    Disconnected { local: bool },
    /// The server replied `UnknownClient`: this client must re-register
    /// before sending anything else.
    ServerUnregistered,
}

type EventHandler = Box<dyn Fn(ClientEvent) + Send + Sync>;

/// Tunable client parameters, set before [`Client::connect`]/
/// [`Client::connect_by_ip`].
pub struct ClientConfig {
    pub buffer_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { buffer_capacity: crate::buffer::default_capacity() }
    }
}

impl ClientConfig {
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }
}

struct Shared {
    assigned_id: AtomicI16,
    state: Mutex<ConnectionState>,
    registered: AtomicBool,
    handlers: Mutex<Vec<EventHandler>>,
}

impl Shared {
    fn emit(&self, event: ClientEvent) {
        for handler in self.handlers.lock().expect("client handler mutex poisoned").iter() {
            handler(event);
        }
    }
}

/// A single connection to a [`crate::server::Server`].
///
/// `name` is fixed at construction; the server-assigned id starts at `-1`
/// ("unassigned") and is adopted from the handshake ack.
pub struct Client {
    name: String,
    config: ClientConfig,
    shared: Arc<Shared>,
    socket: Option<Arc<mio::net::UdpSocket>>,
    cancel: Arc<AtomicBool>,
    listen_thread: Option<JoinHandle<()>>,
    dispatcher: Arc<Dispatcher>,
}

impl Client {
    pub fn new(name: impl Into<String>, dispatcher: Arc<Dispatcher>) -> Self {
        Self::with_config(name, dispatcher, ClientConfig::default())
    }

    pub fn with_config(name: impl Into<String>, dispatcher: Arc<Dispatcher>, config: ClientConfig) -> Self {
        Self {
            name: name.into(),
            config,
            shared: Arc::new(Shared {
                assigned_id: AtomicI16::new(-1),
                state: Mutex::new(ConnectionState::Disconnected),
                registered: AtomicBool::new(false),
                handlers: Mutex::new(Vec::new()),
            }),
            socket: None,
            cancel: Arc::new(AtomicBool::new(false)),
            listen_thread: None,
            dispatcher,
        }
    }

    /// Registers a callback for [`ClientEvent`]s. Callbacks are invoked
    /// directly from the receive-loop thread, in registration order.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(ClientEvent) + Send + Sync + 'static,
    {
        self.shared.handlers.lock().expect("client handler mutex poisoned").push(Box::new(handler));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> i16 {
        self.shared.assigned_id.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock().expect("client state mutex poisoned")
    }

    /// Resolves `host:port`, opens a connected UDP socket, starts the
    /// receive loop, and sends the handshake request.
    pub fn connect(&mut self, host: &str, port: u16) -> io::Result<()> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address resolved"))?;
        self.connect_by_ip(addr)
    }

    /// Like [`Client::connect`] but skips DNS resolution.
    pub fn connect_by_ip(&mut self, addr: SocketAddr) -> io::Result<()> {
        let mut socket = socket::connect(addr)?;
        let mut poll = Poll::new()?;
        poll.registry().register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;
        let socket = Arc::new(socket);
        self.socket = Some(socket.clone());
        *self.shared.state.lock().expect("client state mutex poisoned") = ConnectionState::Connecting;
        self.cancel.store(false, Ordering::SeqCst);

        let shared = self.shared.clone();
        let dispatcher = self.dispatcher.clone();
        let cancel = self.cancel.clone();
        let capacity = self.config.buffer_capacity;
        self.listen_thread = Some(std::thread::spawn(move || {
            listen_loop(poll, socket, shared, dispatcher, cancel, capacity)
        }));

        self.send_connection_information()
    }

    /// Sends the handshake request: `ClientConnected` carrying this
    /// client's name, `id = 0`, `success = false`.
    pub fn send_connection_information(&self) -> io::Result<usize> {
        let mut msg = Message::outgoing_with_capacity(tag::CLIENT_CONNECTED, self.config.buffer_capacity);
        let info = ClientConnectionInfo::new(self.name.clone(), 0, false);
        msg.writer().write_serializable(&info);
        self.send_raw(&mut msg)
    }

    /// Stamps the assigned sender id into `msg` and transmits it.
    ///
    /// Callers must wait for [`ClientEvent::Connected`] before calling
    /// this with a user tag; the assigned id is only valid afterward.
    pub fn send(&self, msg: &mut Message) -> io::Result<usize> {
        msg.patch_sender_id(self.id());
        self.send_raw(msg)
    }

    fn send_raw(&self, msg: &mut Message) -> io::Result<usize> {
        let socket = self.socket.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "client socket not open")
        })?;
        socket.send(msg.as_bytes())
    }

    /// Emits a local disconnect, notifies the server, then tears down the
    /// receive loop and socket. Blocks until the receive-loop thread has
    /// exited.
    pub fn disconnect(&mut self) -> io::Result<()> {
        self.begin_disconnect()?;
        if let Some(handle) = self.listen_thread.take() {
            let _ = handle.join();
        }
        self.socket = None;
        Ok(())
    }

    /// Like [`Client::disconnect`] but does not wait for the receive-loop
    /// thread to exit — it is signalled to stop and will do so on its own.
    pub fn disconnect_async(&mut self) -> io::Result<()> {
        self.begin_disconnect()?;
        self.listen_thread = None;
        self.socket = None;
        Ok(())
    }

    fn begin_disconnect(&mut self) -> io::Result<()> {
        self.shared.emit(ClientEvent::Disconnected { local: true });
        let info = ClientConnectionInfo::new(self.name.clone(), self.id(), true);
        let mut msg = Message::outgoing_with_capacity(tag::CLIENT_DISCONNECTED, self.config.buffer_capacity);
        msg.writer().write_serializable(&info);
        let result = self.send(&mut msg);
        self.cancel.store(true, Ordering::SeqCst);
        *self.shared.state.lock().expect("client state mutex poisoned") = ConnectionState::Disconnected;
        result.map(|_| ())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(handle) = self.listen_thread.take() {
            let _ = handle.join();
        }
    }
}

fn listen_loop(
    mut poll: Poll,
    socket: Arc<mio::net::UdpSocket>,
    shared: Arc<Shared>,
    dispatcher: Arc<Dispatcher>,
    cancel: Arc<AtomicBool>,
    buffer_capacity: usize,
) {
    let mut events = Events::with_capacity(16);
    let mut recv_buf = vec![0u8; RECV_BUF_SIZE];

    while !cancel.load(Ordering::SeqCst) {
        match poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!("client: transient poll error, continuing: {err}");
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
                match socket.recv(&mut recv_buf) {
                    Ok(n) => handle_datagram(
                        &recv_buf[..n],
                        &socket,
                        &shared,
                        &dispatcher,
                        buffer_capacity,
                    ),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        warn!("client: transient recv error, continuing: {err}");
                        break;
                    }
                }
            }
        }
    }
    debug!("client: listen loop exiting");
}

fn handle_datagram(
    datagram: &[u8],
    socket: &mio::net::UdpSocket,
    shared: &Arc<Shared>,
    dispatcher: &Arc<Dispatcher>,
    buffer_capacity: usize,
) {
    let mut message = Message::incoming(datagram.to_vec());
    match message.tag() {
        tag::CLIENT_CONNECTED => {
            let info: ClientConnectionInfo = message.reader().read_serializable();
            shared.assigned_id.store(info.id, Ordering::SeqCst);
            shared.registered.store(true, Ordering::SeqCst);
            *shared.state.lock().expect("client state mutex poisoned") = ConnectionState::Connected;
            shared.emit(ClientEvent::Connected);
        }
        tag::CLIENT_DISCONNECTED => {
            let info: ClientConnectionInfo = message.reader().read_serializable();
            shared.registered.store(false, Ordering::SeqCst);
            *shared.state.lock().expect("client state mutex poisoned") = ConnectionState::Disconnected;
            shared.emit(ClientEvent::Disconnected { local: info.success });
        }
        tag::PING => {
            let mut pong = Message::outgoing_with_capacity(tag::PONG, buffer_capacity);
            pong.patch_sender_id(shared.assigned_id.load(Ordering::SeqCst));
            if let Err(err) = socket.send(pong.as_bytes()) {
                warn!("client: failed to reply to ping: {err}");
            }
        }
        tag::UNKNOWN_CLIENT => {
            shared.registered.store(false, Ordering::SeqCst);
            shared.emit(ClientEvent::ServerUnregistered);
        }
        _ => dispatcher.stage(message),
    }
}
