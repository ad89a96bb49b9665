//! The listening endpoint.
//!
//! A [`Server`] owns one listening socket and a registry of established
//! connections. The caller drives it with [`Server::tick`], which never
//! blocks: it accepts new peers, reaps closed and idle connections and
//! submits read tasks for readable ones. Handshakes, reads, writes and
//! close sequences all run on the [`WorkQueue`].
//!
//! Datagram peers go through a stateless cookie exchange on the listening
//! socket first. Only a peer that returns a valid cookie gets a socket of its
//! own and a session.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::channel::Channel;
use crate::conn::{Connection, ConnectionKey, Outcome};
use crate::pool::{Pending, WorkQueue};
use crate::provider::{CryptoProvider, Listen, OpensslProvider, Role};
use crate::resolve::{self, Intent};
use crate::wait;
use crate::{cookie, Config, Error, SendError, Transport};

type PeerHandler = Arc<dyn Fn(&Server, ConnectionKey, SocketAddr) + Send + Sync>;
type ReceiveHandler = Arc<dyn Fn(&Server, ConnectionKey, SocketAddr, Vec<u8>) + Send + Sync>;

/// A TLS or DTLS server.
///
/// Cheap to clone. All clones drive the same server.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

struct Shared {
    config: Arc<Config>,
    pool: Arc<WorkQueue>,
    provider: Box<dyn CryptoProvider>,
    running: AtomicBool,
    listener: Mutex<Option<Arc<Listener>>>,
    registry: Mutex<Registry>,
    handlers: RwLock<Handlers>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionKey, Arc<Connection>>,
    /// Keys to remove on the next tick.
    dead: VecDeque<ConnectionKey>,
}

impl Registry {
    fn mark_dead(&mut self, key: ConnectionKey) -> bool {
        if !self.connections.contains_key(&key) || self.dead.contains(&key) {
            return false;
        }
        self.dead.push_back(key);
        true
    }
}

#[derive(Default)]
struct Handlers {
    connect: Option<PeerHandler>,
    disconnect: Option<PeerHandler>,
    receive: Option<ReceiveHandler>,
}

enum Listener {
    Stream(TcpListener),
    Datagram { socket: UdpSocket, local: SocketAddr },
}

impl Listener {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Listener::Stream(l) => l.local_addr(),
            Listener::Datagram { socket, .. } => socket.local_addr(),
        }
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Listener::Stream(l) => l.as_fd(),
            Listener::Datagram { socket, .. } => socket.as_fd(),
        }
    }
}

impl Server {
    /// Create a stopped server.
    ///
    /// Fails if the credentials in `config` cannot be loaded.
    pub fn new(config: Arc<Config>, pool: Arc<WorkQueue>) -> Result<Self, Error> {
        let provider = OpensslProvider::new(&config, Role::Server)?;
        Ok(Self::with_provider(config, pool, Box::new(provider)))
    }

    pub(crate) fn with_provider(
        config: Arc<Config>,
        pool: Arc<WorkQueue>,
        provider: Box<dyn CryptoProvider>,
    ) -> Self {
        Server {
            shared: Arc::new(Shared {
                config,
                pool,
                provider,
                running: AtomicBool::new(false),
                listener: Mutex::new(None),
                registry: Mutex::new(Registry::default()),
                handlers: RwLock::new(Handlers::default()),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Called once a peer completed its handshake.
    pub fn on_connect<F>(&self, f: F)
    where
        F: Fn(&Server, ConnectionKey, SocketAddr) + Send + Sync + 'static,
    {
        self.shared.handlers.write().connect = Some(Arc::new(f));
    }

    /// Called once for every connection that leaves the registry.
    pub fn on_disconnect<F>(&self, f: F)
    where
        F: Fn(&Server, ConnectionKey, SocketAddr) + Send + Sync + 'static,
    {
        self.shared.handlers.write().disconnect = Some(Arc::new(f));
    }

    /// Called with each chunk of data read from a peer.
    pub fn on_receive<F>(&self, f: F)
    where
        F: Fn(&Server, ConnectionKey, SocketAddr, Vec<u8>) + Send + Sync + 'static,
    {
        self.shared.handlers.write().receive = Some(Arc::new(f));
    }

    /// Open the listening socket.
    ///
    /// On error the server stays stopped and can be started again.
    pub fn start(&self) -> Result<(), Error> {
        let shared = &self.shared;
        if self.is_running() {
            warn!("Server already running");
            return Ok(());
        }

        if !shared.pool.is_running() {
            error!("Work queue is not running, starting it");
            shared.pool.start(0);
        }

        let transport = shared.config.transport();
        if transport.is_datagram() {
            cookie::init();
        }

        let (socket, _) = resolve::open(&shared.config, Intent::Listen)?;
        let listener = match transport {
            Transport::Stream => {
                let listener: TcpListener = socket.into();
                listener.set_nonblocking(true)?;
                Listener::Stream(listener)
            }
            Transport::Datagram => {
                let socket: UdpSocket = socket.into();
                socket.set_nonblocking(true)?;
                let local = socket.local_addr()?;
                Listener::Datagram { socket, local }
            }
        };

        let local = listener.local_addr()?;
        *shared.listener.lock() = Some(Arc::new(listener));
        shared.running.store(true, Ordering::SeqCst);

        info!("{} server listening on {}", transport, local);
        Ok(())
    }

    /// Close the listening socket and every connection.
    ///
    /// The disconnect handler runs for each registered connection. Their
    /// close sequences run on the work queue.
    pub fn stop(&self) {
        let shared = &self.shared;
        if !shared.running.swap(false, Ordering::SeqCst) {
            return;
        }

        shared.listener.lock().take();

        let connections: Vec<Arc<Connection>> = {
            let mut registry = shared.registry.lock();
            registry.dead.clear();
            registry.connections.drain().map(|(_, c)| c).collect()
        };

        debug!("Close {} connections", connections.len());
        for conn in connections {
            self.disconnected(conn);
        }

        info!("Server stopped");
    }

    /// The bound address, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let listener = self.shared.listener.lock().clone()?;
        listener.local_addr().ok()
    }

    /// Accept new peers, reap dead connections and start reads.
    ///
    /// Never blocks. Call it periodically, for instance after
    /// [`Server::wait_events`].
    pub fn tick(&self) {
        if !self.is_running() {
            return;
        }
        let Some(listener) = self.shared.listener.lock().clone() else {
            return;
        };

        match &*listener {
            Listener::Stream(l) => self.accept_streams(l),
            Listener::Datagram { socket, local } => self.accept_datagrams(socket, *local),
        }

        self.scan();
        self.reap();
    }

    fn accept_streams(&self, listener: &TcpListener) {
        for _ in 0..self.shared.config.accept_batch() {
            let (stream, peer) = match listener.accept() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    return;
                }
            };
            debug!("Accepted {}", peer);

            let channel = match Channel::stream(stream) {
                Ok(c) => Arc::new(c),
                Err(e) => {
                    warn!("Failed to set up socket for {}: {}", peer, e);
                    continue;
                }
            };
            self.begin(channel, peer, Vec::new());
        }
    }

    fn accept_datagrams(&self, socket: &UdpSocket, local: SocketAddr) {
        let mut buf = vec![0_u8; self.shared.config.recv_buffer()];

        for _ in 0..self.shared.config.accept_batch() {
            let (n, peer) = match socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("Receive on listening socket failed: {}", e);
                    return;
                }
            };

            match self.shared.provider.listen(&buf[..n], peer) {
                Listen::Reply(reply) => {
                    if let Err(e) = socket.send_to(&reply, peer) {
                        debug!("Failed to send HelloVerifyRequest to {}: {}", peer, e);
                    }
                }
                Listen::Verified(replay) => {
                    let channel = match resolve::connected_datagram(local, peer)
                        .and_then(Channel::datagram)
                    {
                        Ok(c) => Arc::new(c),
                        Err(e) => {
                            warn!("Failed to open socket for {}: {}", peer, e);
                            continue;
                        }
                    };
                    self.begin(channel, peer, replay);
                }
                Listen::Rejected | Listen::Ignored => {}
            }
        }
    }

    /// Create the session for a new peer and hand its handshake to a worker.
    fn begin(&self, channel: Arc<Channel>, peer: SocketAddr, replay: Vec<Vec<u8>>) {
        let shared = &self.shared;
        let session = match shared
            .provider
            .new_session(Role::Server, channel.clone(), peer, replay)
        {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to create session for {}: {}", peer, e);
                return;
            }
        };

        let cookie = shared
            .config
            .transport()
            .is_datagram()
            .then(|| cookie::generate(peer));
        let conn = Connection::new(peer, shared.config.clone(), channel, session, cookie);

        let server = self.clone();
        shared.pool.submit(move || server.handshake(conn));
    }

    fn handshake(&self, conn: Connection) {
        if let Err(e) = conn.handshake() {
            warn!("Handshake with {} failed: {}", conn.peer(), e);
            return;
        }

        let conn = Arc::new(conn);
        let key = conn.key();
        let peer = conn.peer();
        {
            let mut registry = self.shared.registry.lock();
            if !self.is_running() {
                debug!("Server stopped during handshake with {}", peer);
                return;
            }
            registry.connections.insert(key, conn);
        }
        info!("Connection {} from {}", key, peer);

        let handler = self.shared.handlers.read().connect.clone();
        if let Some(handler) = handler {
            handler(self, key, peer);
        }
    }

    /// Queue removals and submit reads.
    fn scan(&self) {
        let config = &self.shared.config;
        let mut reads = Vec::new();

        {
            let mut registry = self.shared.registry.lock();
            let Registry { connections, dead } = &mut *registry;

            for (key, conn) in connections.iter() {
                if dead.contains(key) {
                    continue;
                }

                if conn.received_shutdown() {
                    debug!("Peer {} closed connection {}", conn.peer(), key);
                    dead.push_back(*key);
                    continue;
                }

                let busy = conn.is_reading() || conn.is_writing();
                if !busy && conn.idle_for() > config.timeout() {
                    conn.signal_timeout();
                    let strikes = conn.strike();
                    if strikes > config.max_idle_timeouts() {
                        info!("Connection {} to {} idle, dropping", key, conn.peer());
                        dead.push_back(*key);
                    } else {
                        debug!("Connection {} idle ({} of {})", key, strikes, config.max_idle_timeouts());
                    }
                    continue;
                }

                if !conn.is_reading() && conn.is_readable() && conn.try_begin_read() {
                    reads.push(conn.clone());
                }
            }
        }

        for conn in reads {
            let server = self.clone();
            self.shared.pool.submit(move || server.read(conn));
        }
    }

    fn read(&self, conn: Arc<Connection>) {
        let outcome = conn.read();

        // The read claim is held until the data is delivered, so chunks
        // reach the handler in order.
        match outcome {
            Outcome::Done(data) => {
                trace!("Read {} bytes from {}", data.len(), conn.peer());
                let handler = self.shared.handlers.read().receive.clone();
                if let Some(handler) = handler {
                    handler(self, conn.key(), conn.peer(), data);
                }
            }
            Outcome::PeerClosed | Outcome::Fatal(_) | Outcome::Exhausted(_) => {
                self.shared.registry.lock().mark_dead(conn.key());
            }
            Outcome::Released => {}
        }
        conn.end_read();
    }

    /// Remove queued connections and tell the application.
    fn reap(&self) {
        let removed: Vec<Arc<Connection>> = {
            let mut registry = self.shared.registry.lock();
            let Registry { connections, dead } = &mut *registry;
            dead.drain(..).filter_map(|key| connections.remove(&key)).collect()
        };

        for conn in removed {
            self.disconnected(conn);
        }
    }

    fn disconnected(&self, conn: Arc<Connection>) {
        let key = conn.key();
        let peer = conn.peer();
        info!("Connection {} to {} closed", key, peer);

        let handler = self.shared.handlers.read().disconnect.clone();
        if let Some(handler) = handler {
            handler(self, key, peer);
        }

        // The close sequence may block. It runs once the last task using the
        // connection lets go of it.
        self.shared.pool.submit(move || drop(conn));
    }

    /// Send `data` to the connection `key`.
    ///
    /// The write runs on the work queue. A second send to the same
    /// connection waits for the first.
    pub fn send(
        &self,
        key: ConnectionKey,
        data: impl Into<Vec<u8>>,
    ) -> Pending<Result<usize, SendError>> {
        if !self.is_running() {
            return Pending::ready(Err(SendError::NotRunning));
        }
        let Some(conn) = self.connection(key) else {
            return Pending::ready(Err(SendError::NoSuchConnection));
        };

        let data = data.into();
        let server = self.clone();
        self.shared.pool.submit(move || {
            let result = conn.write(&data).into_send_result();
            match result {
                Err(SendError::Dropped(_)) | Err(SendError::TimedOut(_)) => {
                    server.shared.registry.lock().mark_dead(conn.key());
                }
                _ => {}
            }
            result
        })
    }

    fn connection(&self, key: ConnectionKey) -> Option<Arc<Connection>> {
        self.shared.registry.lock().connections.get(&key).cloned()
    }

    /// Drop a connection on the next tick. False if `key` is unknown.
    pub fn kick(&self, key: ConnectionKey) -> bool {
        self.shared.registry.lock().mark_dead(key)
    }

    /// Give a connection a new random key.
    pub fn refresh_key(&self, key: ConnectionKey) -> Option<ConnectionKey> {
        let new = ConnectionKey::random();
        self.set_key(key, new).then_some(new)
    }

    /// Move a connection from `old` to `new`.
    ///
    /// False if `old` is unknown or `new` is taken.
    pub fn set_key(&self, old: ConnectionKey, new: ConnectionKey) -> bool {
        let mut registry = self.shared.registry.lock();
        if registry.connections.contains_key(&new) {
            return false;
        }
        let Some(conn) = registry.connections.remove(&old) else {
            return false;
        };
        conn.set_key(new);
        registry.connections.insert(new, conn);
        for key in registry.dead.iter_mut() {
            if *key == old {
                *key = new;
            }
        }
        true
    }

    pub fn connection_keys(&self) -> Vec<ConnectionKey> {
        self.shared.registry.lock().connections.keys().copied().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.registry.lock().connections.len()
    }

    /// Address of the peer behind `key`.
    pub fn peer_addr(&self, key: ConnectionKey) -> Option<SocketAddr> {
        self.connection(key).map(|c| c.peer())
    }

    /// Link MTU of a datagram connection.
    pub fn mtu(&self, key: ConnectionKey) -> Option<usize> {
        if !self.shared.config.transport().is_datagram() {
            return None;
        }
        self.connection(key)?.mtu()
    }

    /// Block until the listening socket or a connection is readable, or
    /// `timeout` passes. True if something is ready.
    pub fn wait_events(&self, timeout: Duration) -> bool {
        let listener = self.shared.listener.lock().clone();
        let connections: Vec<Arc<Connection>> = self
            .shared
            .registry
            .lock()
            .connections
            .values()
            .filter(|c| !c.is_reading())
            .cloned()
            .collect();

        if connections.iter().any(|c| c.channel().has_pending()) {
            return true;
        }

        let mut fds: Vec<BorrowedFd<'_>> = Vec::with_capacity(connections.len() + 1);
        if let Some(listener) = &listener {
            fds.push(listener.as_fd());
        }
        fds.extend(connections.iter().map(|c| c.channel().as_fd()));

        match wait::poll_readable(&fds, timeout) {
            Ok(ready) => !ready.is_empty(),
            Err(e) => {
                warn!("Wait for events failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::provider::plain::PlainProvider;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn server(timeout: Duration) -> (Server, Arc<WorkQueue>) {
        let config = Config::builder()
            .transport(Transport::Stream)
            .address("127.0.0.1", "0")
            .timeout(timeout)
            .min_io_timeout(Duration::from_millis(10))
            .build()
            .unwrap();
        let pool = Arc::new(WorkQueue::new());
        pool.start(2);
        let server = Server::with_provider(Arc::new(config), pool.clone(), Box::new(PlainProvider));
        (server, pool)
    }

    fn tick_until(server: &Server, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            server.wait_events(Duration::from_millis(10));
            server.tick();
            if done() {
                return true;
            }
        }
        false
    }

    #[test]
    fn send_when_stopped() {
        let (server, pool) = server(Duration::from_secs(1));
        let result = server.send(ConnectionKey::random(), b"x").wait();
        assert_eq!(result, Err(SendError::NotRunning));
        pool.stop(true);
    }

    #[test]
    fn send_to_unknown_key() {
        let _ = env_logger::try_init();
        let (server, pool) = server(Duration::from_secs(1));
        server.start().unwrap();
        let result = server.send(ConnectionKey::random(), b"x").wait();
        assert_eq!(result, Err(SendError::NoSuchConnection));
        assert_eq!(result.unwrap_err().code(), -4);
        server.stop();
        pool.stop(true);
    }

    #[test]
    fn echo_and_stop() {
        let _ = env_logger::try_init();
        let (server, pool) = server(Duration::from_secs(5));
        let connects = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));

        let c = connects.clone();
        server.on_connect(move |_, _, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let d = disconnects.clone();
        server.on_disconnect(move |_, _, _| {
            d.fetch_add(1, Ordering::SeqCst);
        });
        server.on_receive(|server, key, _, data| {
            let _ = server.send(key, data);
        });
        server.start().unwrap();

        let mut peer = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        assert!(tick_until(&server, || server.connection_count() == 1));
        assert_eq!(connects.load(Ordering::SeqCst), 1);

        peer.write_all(b"HELLO").unwrap();
        peer.set_nonblocking(true).unwrap();
        let mut buf = [0_u8; 5];
        let mut got = 0;
        assert!(tick_until(&server, || {
            if let Ok(n) = peer.read(&mut buf[got..]) {
                got += n;
            }
            got == 5
        }));
        assert_eq!(&buf, b"HELLO");

        server.stop();
        server.stop();
        assert_eq!(server.connection_count(), 0);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        pool.stop(true);
    }

    #[test]
    fn idle_connection_reaped_once() {
        let _ = env_logger::try_init();
        let (server, pool) = server(Duration::from_millis(100));
        let disconnects = Arc::new(Mutex::new(Vec::new()));

        let d = disconnects.clone();
        server.on_disconnect(move |_, key, peer| {
            d.lock().push((key, peer));
        });
        server.start().unwrap();

        let peer = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        assert!(tick_until(&server, || server.connection_count() == 1));
        let key = server.connection_keys()[0];

        assert!(tick_until(&server, || server.connection_count() == 0));

        // Keep ticking, the disconnect must not repeat.
        let until = Instant::now() + Duration::from_millis(300);
        while Instant::now() < until {
            server.tick();
        }

        let disconnects = disconnects.lock();
        assert_eq!(disconnects.len(), 1);
        assert_eq!(disconnects[0].0, key);
        assert_eq!(disconnects[0].1, peer.local_addr().unwrap());

        server.stop();
        pool.stop(true);
    }

    #[test]
    fn peer_close_reaped() {
        let _ = env_logger::try_init();
        let (server, pool) = server(Duration::from_secs(5));
        server.start().unwrap();

        let peer = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        assert!(tick_until(&server, || server.connection_count() == 1));

        drop(peer);
        assert!(tick_until(&server, || server.connection_count() == 0));

        server.stop();
        pool.stop(true);
    }

    #[test]
    fn rekey_and_kick() {
        let _ = env_logger::try_init();
        let (server, pool) = server(Duration::from_secs(5));
        server.start().unwrap();

        let _a = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        let _b = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        assert!(tick_until(&server, || server.connection_count() == 2));

        let keys = server.connection_keys();
        assert!(!server.set_key(keys[0], keys[1]));

        let fresh = server.refresh_key(keys[0]).unwrap();
        assert!(server.peer_addr(fresh).is_some());
        assert!(server.peer_addr(keys[0]).is_none());
        assert_eq!(server.refresh_key(keys[0]), None);

        assert!(server.kick(fresh));
        assert!(!server.kick(fresh));
        assert!(tick_until(&server, || server.connection_count() == 1));
        assert_eq!(server.connection_keys(), vec![keys[1]]);

        // Stream connections have no MTU.
        assert_eq!(server.mtu(keys[1]), None);

        server.stop();
        pool.stop(true);
    }

    #[test]
    fn restart_after_stop() {
        let (server, pool) = server(Duration::from_secs(1));
        server.start().unwrap();
        assert!(server.is_running());
        server.stop();
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
        server.start().unwrap();
        assert!(server.is_running());
        server.stop();
        pool.stop(true);
    }
}
