//! One secured connection: its socket, its session and the bookkeeping
//! the engines need around them.
//!
//! Every library call goes through [`Connection::drive`], which classifies
//! the result, blocks on readiness for the retry classes and gives up after
//! the configured number of attempts. Handshake, read, write and close are
//! all instances of that loop.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::channel::Channel;
use crate::provider::{CloseState, Session};
use crate::wait::{self, Direction};
use crate::{Config, Cookie, Error, ErrorClass, SendError, Transport};

/// Identifies a connection of a server.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey(Uuid);

impl ConnectionKey {
    /// A fresh random key.
    pub fn random() -> Self {
        ConnectionKey(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for ConnectionKey {
    fn from(value: Uuid) -> Self {
        ConnectionKey(value)
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionKey({})", self.0)
    }
}

/// How a driven operation ended.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Outcome<T> {
    Done(T),
    /// The peer ended its sending direction.
    PeerClosed,
    Fatal(ErrorClass),
    /// The retry budget ran out after this many attempts.
    Exhausted(usize),
    /// The session is already released.
    Released,
}

impl<T> Outcome<T> {
    pub fn into_send_result(self) -> Result<T, SendError> {
        match self {
            Outcome::Done(v) => Ok(v),
            Outcome::PeerClosed => Err(SendError::Dropped(ErrorClass::PeerClosedWrite)),
            Outcome::Fatal(class) => Err(SendError::Dropped(class)),
            Outcome::Exhausted(n) => Err(SendError::TimedOut(n)),
            Outcome::Released => Err(SendError::NoSuchConnection),
        }
    }
}

pub(crate) struct Connection {
    key: Mutex<ConnectionKey>,
    peer: SocketAddr,
    transport: Transport,
    config: Arc<Config>,
    channel: Arc<Channel>,
    session: Mutex<Option<Box<dyn Session>>>,
    /// Cookie this datagram peer came in with.
    cookie: Mutex<Option<Cookie>>,
    reading: AtomicBool,
    writer: Mutex<()>,
    established: AtomicBool,
    last_activity: Mutex<Instant>,
    idle_strikes: AtomicUsize,
}

impl Connection {
    pub fn new(
        peer: SocketAddr,
        config: Arc<Config>,
        channel: Arc<Channel>,
        session: Box<dyn Session>,
        cookie: Option<Cookie>,
    ) -> Self {
        Connection {
            key: Mutex::new(ConnectionKey::random()),
            peer,
            transport: config.transport(),
            config,
            channel,
            session: Mutex::new(Some(session)),
            cookie: Mutex::new(cookie),
            reading: AtomicBool::new(false),
            writer: Mutex::new(()),
            established: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            idle_strikes: AtomicUsize::new(0),
        }
    }

    pub fn key(&self) -> ConnectionKey {
        *self.key.lock()
    }

    pub fn set_key(&self, key: ConnectionKey) {
        *self.key.lock() = key;
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::SeqCst)
    }

    /// Run one library step at a time until it succeeds, fails for good, or
    /// the retry budget is spent.
    ///
    /// The session lock is held for a single step, never across a wait.
    pub fn drive<T, F>(&self, what: &str, mut step: F) -> Outcome<T>
    where
        F: FnMut(&mut dyn Session) -> Result<T, ErrorClass>,
    {
        let budget = self.config.max_timeouts();

        for attempt in 1..=budget {
            let result = {
                let mut session = self.session.lock();
                let Some(session) = session.as_mut() else {
                    return Outcome::Released;
                };
                step(session.as_mut())
            };

            match result {
                Ok(v) => return Outcome::Done(v),
                Err(ErrorClass::PeerClosedWrite) => {
                    debug!("{} on {}: peer closed", what, self.peer);
                    return Outcome::PeerClosed;
                }
                Err(class) => match class.direction() {
                    Some(direction) => {
                        trace!("{} on {}: {} (attempt {})", what, self.peer, class, attempt);
                        self.wait(direction);
                    }
                    None => {
                        debug!("{} on {}: {}", what, self.peer, class);
                        // No close sequence on a session that failed.
                        self.established.store(false, Ordering::SeqCst);
                        return Outcome::Fatal(class);
                    }
                },
            }
        }

        warn!("{} on {} gave up after {} attempts", what, self.peer, budget);
        Outcome::Exhausted(budget)
    }

    /// Block until the channel is ready in `direction`.
    ///
    /// Datagram sessions bound the wait by their retransmission deadline and
    /// are told when it passes.
    pub fn wait(&self, direction: Direction) -> bool {
        let datagram = self.transport.is_datagram();

        let timeout = if datagram {
            self.session
                .lock()
                .as_mut()
                .and_then(|s| s.retransmit_timeout())
                .unwrap_or(self.config.timeout())
        } else {
            self.config.timeout()
        };
        let timeout = wait::clamp(timeout, self.config.min_io_timeout());

        match self.channel.poll(direction, timeout) {
            Ok(true) => true,
            Ok(false) => {
                if datagram {
                    self.signal_timeout();
                }
                false
            }
            Err(e) => {
                warn!("Poll on {} failed: {}", self.peer, e);
                false
            }
        }
    }

    /// Complete the handshake. The connection counts as established after.
    pub fn handshake(&self) -> Result<(), Error> {
        match self.drive("Handshake", |s| s.handshake()) {
            Outcome::Done(()) => {
                self.established.store(true, Ordering::SeqCst);
                self.touch();
                if let Some(session) = self.session.lock().as_ref() {
                    info!("Handshake with {} complete: {}", self.peer, session.summary());
                }
                Ok(())
            }
            Outcome::PeerClosed => Err(Error::HandshakeFailed(ErrorClass::PeerClosedWrite)),
            Outcome::Fatal(class) => Err(Error::HandshakeFailed(class)),
            Outcome::Exhausted(n) => Err(Error::HandshakeTimeout(n)),
            Outcome::Released => Err(Error::NotRunning),
        }
    }

    /// Claim the read direction. False if a read is already in flight.
    pub fn try_begin_read(&self) -> bool {
        self.reading
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end_read(&self) {
        self.reading.store(false, Ordering::SeqCst);
    }

    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::SeqCst)
    }

    /// Whether a write is in flight.
    pub fn is_writing(&self) -> bool {
        self.writer.is_locked()
    }

    /// Read one chunk of application data.
    pub fn read(&self) -> Outcome<Vec<u8>> {
        let mut buf = vec![0_u8; self.config.recv_buffer()];
        match self.drive("Read", |s| s.read(&mut buf)) {
            Outcome::Done(0) => Outcome::PeerClosed,
            Outcome::Done(n) => {
                self.touch();
                buf.truncate(n);
                Outcome::Done(buf)
            }
            Outcome::PeerClosed => Outcome::PeerClosed,
            Outcome::Fatal(c) => Outcome::Fatal(c),
            Outcome::Exhausted(n) => Outcome::Exhausted(n),
            Outcome::Released => Outcome::Released,
        }
    }

    /// Write all of `data`.
    ///
    /// Writes to one connection never interleave: a second writer waits
    /// until the first has finished or given up.
    pub fn write(&self, data: &[u8]) -> Outcome<usize> {
        let _writer = self.writer.lock();

        let mut written = 0;
        while written < data.len() {
            let rest = &data[written..];
            match self.drive("Write", |s| s.write(rest)) {
                Outcome::Done(n) => written += n,
                Outcome::PeerClosed => return Outcome::PeerClosed,
                Outcome::Fatal(c) => return Outcome::Fatal(c),
                Outcome::Exhausted(n) => return Outcome::Exhausted(n),
                Outcome::Released => return Outcome::Released,
            }
        }

        self.touch();
        Outcome::Done(written)
    }

    /// The peer has sent its close notification.
    pub fn received_shutdown(&self) -> bool {
        self.session
            .lock()
            .as_mut()
            .map(|s| s.received_shutdown())
            .unwrap_or(true)
    }

    /// Readable data waiting, without blocking.
    pub fn is_readable(&self) -> bool {
        self.channel.is_readable()
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Record traffic. Clears the idle strikes.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
        self.idle_strikes.store(0, Ordering::SeqCst);
    }

    /// Count one more idle timeout and restart the idle timer. Returns the
    /// new count.
    pub fn strike(&self) -> usize {
        *self.last_activity.lock() = Instant::now();
        self.idle_strikes.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Tell the session its timer expired.
    pub fn signal_timeout(&self) {
        if let Some(session) = self.session.lock().as_mut() {
            session.handle_timeout();
        }
    }

    pub fn mtu(&self) -> Option<usize> {
        self.session.lock().as_ref().and_then(|s| s.mtu())
    }

    /// Release the session and the socket.
    ///
    /// Runs the close sequence first if the handshake completed. Safe to call
    /// any number of times, and runs on drop.
    pub fn close(&self) {
        let Some(mut session) = self.session.lock().take() else {
            return;
        };

        if self.established.swap(false, Ordering::SeqCst) {
            self.close_sequence(session.as_mut());
        }
        drop(session);

        if let Some(cookie) = self.cookie.lock().take() {
            trace!("Release {:?} of {}", cookie, self.peer);
        }
        self.channel.shutdown();
        debug!("Connection {} to {} released", self.key(), self.peer);
    }

    fn close_sequence(&self, session: &mut dyn Session) {
        let budget = self.config.shutdown_retries();
        let timeout = wait::clamp(self.config.timeout(), self.config.min_io_timeout());

        for _ in 0..budget {
            match session.close() {
                Ok(CloseState::Complete) | Err(ErrorClass::PeerClosedWrite) => {
                    debug!("Close with {} complete", self.peer);
                    return;
                }
                // The next call waits for the peer's notification.
                Ok(CloseState::Sent) => {}
                Err(class) => match class.direction() {
                    Some(direction) => {
                        if let Err(e) = self.channel.poll(direction, timeout) {
                            debug!("Poll during close with {} failed: {}", self.peer, e);
                        }
                    }
                    None => {
                        debug!("Close with {} aborted: {}", self.peer, class);
                        return;
                    }
                },
            }
        }

        warn!(
            "Close with {} abandoned after {} attempts",
            self.peer, budget
        );
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key())
            .field("peer", &self.peer)
            .field("transport", &self.transport)
            .field("established", &self.is_established())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::UdpSocket;
    use std::thread;

    /// A scripted session.
    #[derive(Default)]
    struct Script {
        handshake: Vec<Result<(), ErrorClass>>,
        calls: AtomicUsize,
        closes: AtomicUsize,
        wire: Mutex<Vec<u8>>,
        /// Most bytes a single write step takes.
        write_chunk: usize,
        /// What every read step fails with. A retry when unset.
        read_error: Option<ErrorClass>,
    }

    struct Scripted(Arc<Script>);

    impl Session for Scripted {
        fn handshake(&mut self) -> Result<(), ErrorClass> {
            let n = self.0.calls.fetch_add(1, Ordering::SeqCst);
            match self.0.handshake.get(n) {
                Some(r) => *r,
                None => self.0.handshake.last().copied().unwrap_or(Ok(())),
            }
        }

        fn read(&mut self, _buf: &mut [u8]) -> Result<usize, ErrorClass> {
            self.0.calls.fetch_add(1, Ordering::SeqCst);
            Err(self.0.read_error.unwrap_or(ErrorClass::RetryWrite))
        }

        fn write(&mut self, buf: &[u8]) -> Result<usize, ErrorClass> {
            let n = buf.len().min(self.0.write_chunk.max(1));
            self.0.wire.lock().extend_from_slice(&buf[..n]);
            thread::sleep(Duration::from_millis(1));
            Ok(n)
        }

        fn close(&mut self) -> Result<CloseState, ErrorClass> {
            self.0.closes.fetch_add(1, Ordering::SeqCst);
            Ok(CloseState::Complete)
        }

        fn received_shutdown(&mut self) -> bool {
            false
        }

        fn retransmit_timeout(&mut self) -> Option<Duration> {
            None
        }

        fn handle_timeout(&mut self) {}

        fn mtu(&self) -> Option<usize> {
            Some(1150)
        }

        fn summary(&self) -> String {
            "scripted".to_string()
        }
    }

    fn config(max_timeouts: usize) -> Arc<Config> {
        Arc::new(
            Config::builder()
                .transport(Transport::Datagram)
                .max_timeouts(max_timeouts)
                .timeout(Duration::from_millis(5))
                .min_io_timeout(Duration::from_millis(1))
                .build()
                .unwrap(),
        )
    }

    fn udp_channel() -> (Arc<Channel>, SocketAddr) {
        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer = b.local_addr().unwrap();
        a.connect(peer).unwrap();
        (Arc::new(Channel::datagram(a).unwrap()), peer)
    }

    fn connection(script: &Arc<Script>, max_timeouts: usize) -> Connection {
        let (channel, peer) = udp_channel();
        Connection::new(
            peer,
            config(max_timeouts),
            channel,
            Box::new(Scripted(script.clone())),
            None,
        )
    }

    #[test]
    fn retry_budget_is_exact() {
        let script = Arc::new(Script {
            handshake: vec![Err(ErrorClass::RetryWrite)],
            ..Default::default()
        });
        let conn = connection(&script, 4);

        let err = conn.handshake().unwrap_err();
        assert!(matches!(err, Error::HandshakeTimeout(4)));
        assert_eq!(script.calls.load(Ordering::SeqCst), 4);
        assert!(!conn.is_established());
    }

    #[test]
    fn retry_then_success() {
        let script = Arc::new(Script {
            handshake: vec![
                Err(ErrorClass::RetryWrite),
                Err(ErrorClass::RetryWrite),
                Ok(()),
            ],
            ..Default::default()
        });
        let conn = connection(&script, 9);

        conn.handshake().unwrap();
        assert_eq!(script.calls.load(Ordering::SeqCst), 3);
        assert!(conn.is_established());
    }

    #[test]
    fn fatal_stops_at_once() {
        let script = Arc::new(Script {
            handshake: vec![Err(ErrorClass::FatalProtocol)],
            ..Default::default()
        });
        let conn = connection(&script, 9);

        let err = conn.handshake().unwrap_err();
        assert!(matches!(err, Error::HandshakeFailed(ErrorClass::FatalProtocol)));
        assert_eq!(script.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn read_exhausts_budget() {
        let script = Arc::new(Script::default());
        let conn = connection(&script, 3);
        assert_eq!(conn.read(), Outcome::Exhausted(3));
        assert_eq!(script.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn close_only_when_established() {
        let script = Arc::new(Script::default());
        let conn = connection(&script, 9);
        conn.close();
        assert_eq!(script.closes.load(Ordering::SeqCst), 0);

        let script = Arc::new(Script::default());
        let conn = connection(&script, 9);
        conn.handshake().unwrap();
        drop(conn);
        assert_eq!(script.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn no_close_after_fatal_read() {
        let script = Arc::new(Script {
            read_error: Some(ErrorClass::FatalProtocol),
            ..Default::default()
        });
        let conn = connection(&script, 9);
        conn.handshake().unwrap();
        assert!(conn.is_established());

        assert_eq!(conn.read(), Outcome::Fatal(ErrorClass::FatalProtocol));
        assert!(!conn.is_established());

        drop(conn);
        assert_eq!(script.closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn close_is_idempotent() {
        let script = Arc::new(Script::default());
        let conn = connection(&script, 9);
        conn.handshake().unwrap();
        conn.close();
        conn.close();
        drop(conn);
        assert_eq!(script.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn released_connection_refuses_io() {
        let script = Arc::new(Script::default());
        let conn = connection(&script, 9);
        conn.close();
        assert_eq!(conn.write(b"x"), Outcome::Released);
        assert_eq!(
            conn.write(b"x").into_send_result(),
            Err(SendError::NoSuchConnection)
        );
    }

    #[test]
    fn writes_never_interleave() {
        let script = Arc::new(Script {
            write_chunk: 2,
            ..Default::default()
        });
        let conn = Arc::new(connection(&script, 9));

        let a = vec![b'a'; 64];
        let b = vec![b'b'; 64];

        let c1 = conn.clone();
        let t1 = thread::spawn(move || c1.write(&a));
        let c2 = conn.clone();
        let t2 = thread::spawn(move || c2.write(&b));

        assert_eq!(t1.join().unwrap(), Outcome::Done(64));
        assert_eq!(t2.join().unwrap(), Outcome::Done(64));

        let wire = script.wire.lock().clone();
        assert_eq!(wire.len(), 128);
        // One whole payload, then the other.
        let first = wire[0];
        assert!(wire[..64].iter().all(|c| *c == first));
        assert!(wire[64..].iter().all(|c| *c != first));
    }

    #[test]
    fn read_claim_is_exclusive() {
        let script = Arc::new(Script::default());
        let conn = connection(&script, 9);
        assert!(conn.try_begin_read());
        assert!(!conn.try_begin_read());
        assert!(conn.is_reading());
        conn.end_read();
        assert!(conn.try_begin_read());
    }

    #[test]
    fn idle_strikes_count() {
        let script = Arc::new(Script::default());
        let conn = connection(&script, 9);
        assert_eq!(conn.strike(), 1);
        assert_eq!(conn.strike(), 2);
        assert!(conn.idle_for() < Duration::from_secs(1));
        conn.touch();
        assert_eq!(conn.strike(), 1);
    }

    #[test]
    fn keys_are_unique() {
        let a = ConnectionKey::random();
        let b = ConnectionKey::random();
        assert_ne!(a, b);
    }
}
