//! The connecting endpoint: one peer, one connection.

use std::net::SocketAddr;
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::channel::Channel;
use crate::conn::{Connection, Outcome};
use crate::pool::{Pending, WorkQueue};
use crate::provider::{CryptoProvider, OpensslProvider, Role};
use crate::resolve::{self, Intent};
use crate::wait::{self, Direction};
use crate::{Config, Error, SendError, Transport};

type PeerHandler = Arc<dyn Fn(&Client, SocketAddr) + Send + Sync>;
type ReceiveHandler = Arc<dyn Fn(&Client, Vec<u8>) + Send + Sync>;

/// A TLS or DTLS client.
///
/// The handshake completes inside [`Client::start`]. After that, drive the
/// client with [`Client::tick`] to notice incoming data, a closed peer or an
/// idle connection.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

struct Shared {
    config: Arc<Config>,
    pool: Arc<WorkQueue>,
    provider: Box<dyn CryptoProvider>,
    running: AtomicBool,
    connection: Mutex<Option<Arc<Connection>>>,
    handlers: RwLock<Handlers>,
}

#[derive(Default)]
struct Handlers {
    connect: Option<PeerHandler>,
    disconnect: Option<PeerHandler>,
    receive: Option<ReceiveHandler>,
}

impl Client {
    /// Create a stopped client.
    pub fn new(config: Arc<Config>, pool: Arc<WorkQueue>) -> Result<Self, Error> {
        let provider = OpensslProvider::new(&config, Role::Client)?;
        Ok(Self::with_provider(config, pool, Box::new(provider)))
    }

    pub(crate) fn with_provider(
        config: Arc<Config>,
        pool: Arc<WorkQueue>,
        provider: Box<dyn CryptoProvider>,
    ) -> Self {
        Client {
            shared: Arc::new(Shared {
                config,
                pool,
                provider,
                running: AtomicBool::new(false),
                connection: Mutex::new(None),
                handlers: RwLock::new(Handlers::default()),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Connected to the peer.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn on_connect<F>(&self, f: F)
    where
        F: Fn(&Client, SocketAddr) + Send + Sync + 'static,
    {
        self.shared.handlers.write().connect = Some(Arc::new(f));
    }

    /// Called once when the connection ends, whoever ends it.
    pub fn on_disconnect<F>(&self, f: F)
    where
        F: Fn(&Client, SocketAddr) + Send + Sync + 'static,
    {
        self.shared.handlers.write().disconnect = Some(Arc::new(f));
    }

    pub fn on_receive<F>(&self, f: F)
    where
        F: Fn(&Client, Vec<u8>) + Send + Sync + 'static,
    {
        self.shared.handlers.write().receive = Some(Arc::new(f));
    }

    /// Connect and complete the handshake on the calling thread.
    ///
    /// On error the client stays stopped and can be started again.
    pub fn start(&self) -> Result<(), Error> {
        let shared = &self.shared;
        if self.is_running() {
            warn!("Client already running");
            return Ok(());
        }

        if !shared.pool.is_running() {
            error!("Work queue is not running, starting it");
            shared.pool.start(0);
        }

        let (socket, peer) = resolve::open(&shared.config, Intent::Connect)?;
        let channel = match shared.config.transport() {
            Transport::Stream => Channel::stream(socket.into())?,
            Transport::Datagram => Channel::datagram(socket.into())?,
        };
        let channel = Arc::new(channel);

        let session = shared
            .provider
            .new_session(Role::Client, channel.clone(), peer, Vec::new())?;
        let conn = Connection::new(peer, shared.config.clone(), channel, session, None);

        conn.handshake()?;

        *shared.connection.lock() = Some(Arc::new(conn));
        shared.running.store(true, Ordering::SeqCst);
        info!("Connected to {}", peer);

        let handler = shared.handlers.read().connect.clone();
        if let Some(handler) = handler {
            handler(self, peer);
        }
        Ok(())
    }

    /// Close the connection.
    ///
    /// Runs the close sequence on the calling thread. The disconnect handler
    /// runs if the connection was still up.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let Some(conn) = self.shared.connection.lock().take() else {
            return;
        };

        self.notify_disconnect(conn.peer());
        conn.close();
        info!("Client stopped");
    }

    /// The peer's address while connected.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.connection().map(|c| c.peer())
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        self.shared.connection.lock().clone()
    }

    /// Notice a closed or idle peer, and start a read if data is waiting.
    ///
    /// Never blocks.
    pub fn tick(&self) {
        let config = &self.shared.config;
        let Some(conn) = self.connection() else {
            return;
        };

        if conn.received_shutdown() {
            debug!("Peer {} closed the connection", conn.peer());
            self.lose(&conn);
            return;
        }

        let busy = conn.is_reading() || conn.is_writing();
        if !busy && conn.idle_for() > config.timeout() {
            conn.signal_timeout();
            if conn.strike() > config.max_idle_timeouts() {
                info!("Connection to {} idle, dropping", conn.peer());
                self.lose(&conn);
            }
            return;
        }

        if !conn.is_reading() && conn.is_readable() && conn.try_begin_read() {
            let client = self.clone();
            self.shared.pool.submit(move || client.read(conn));
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
                    handler(self, data);
                }
            }
            Outcome::PeerClosed | Outcome::Fatal(_) | Outcome::Exhausted(_) => self.lose(&conn),
            Outcome::Released => {}
        }
        conn.end_read();
    }

    /// Drop the connection after a failure. Its close sequence runs on the
    /// work queue.
    fn lose(&self, conn: &Arc<Connection>) {
        let conn = {
            let mut current = self.shared.connection.lock();
            match current.as_ref() {
                Some(c) if Arc::ptr_eq(c, conn) => current.take(),
                _ => None,
            }
        };
        let Some(conn) = conn else {
            return;
        };

        self.shared.running.store(false, Ordering::SeqCst);
        self.notify_disconnect(conn.peer());
        self.shared.pool.submit(move || drop(conn));
    }

    fn notify_disconnect(&self, peer: SocketAddr) {
        info!("Disconnected from {}", peer);
        let handler = self.shared.handlers.read().disconnect.clone();
        if let Some(handler) = handler {
            handler(self, peer);
        }
    }

    /// Send `data` to the peer.
    pub fn send(&self, data: impl Into<Vec<u8>>) -> Pending<Result<usize, SendError>> {
        let Some(conn) = self.connection() else {
            return Pending::ready(Err(SendError::NotRunning));
        };

        let data = data.into();
        let client = self.clone();
        self.shared.pool.submit(move || {
            let result = conn.write(&data).into_send_result();
            if let Err(SendError::Dropped(_) | SendError::TimedOut(_)) = result {
                client.lose(&conn);
            }
            result
        })
    }

    /// Link MTU of a datagram connection.
    pub fn mtu(&self) -> Option<usize> {
        self.connection()?.mtu()
    }

    /// Block until data is readable or `timeout` passes.
    pub fn wait_events(&self, timeout: Duration) -> bool {
        let Some(conn) = self.connection() else {
            std::thread::sleep(timeout);
            return false;
        };
        if conn.is_reading() {
            std::thread::sleep(timeout);
            return false;
        }

        let channel = conn.channel();
        if channel.has_pending() {
            return true;
        }
        match wait::poll_one(channel.as_fd(), Direction::Read, timeout) {
            Ok(ready) => ready,
            Err(e) => {
                warn!("Wait for events failed: {}", e);
                false
            }
        }
    }
}
