use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use zeroize::Zeroizing;

use crate::Error;

/// Underlying transport of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Connectionless datagrams secured with DTLS.
    Datagram,
    /// Ordered byte stream secured with TLS.
    Stream,
}

impl Transport {
    pub fn is_datagram(&self) -> bool {
        matches!(self, Transport::Datagram)
    }

    /// Protocol name as used in the services database.
    pub(crate) fn protocol_name(&self) -> &'static str {
        match self {
            Transport::Datagram => "udp",
            Transport::Stream => "tcp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Datagram => f.write_str("DTLS/UDP"),
            Transport::Stream => f.write_str("TLS/TCP"),
        }
    }
}

/// Where PEM material is read from.
#[derive(Clone)]
pub enum PemSource {
    File(PathBuf),
    Pem(Vec<u8>),
}

impl fmt::Debug for PemSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PemSource::File(p) => f.debug_tuple("File").field(p).finish(),
            PemSource::Pem(v) => write!(f, "Pem({} bytes)", v.len()),
        }
    }
}

/// Session caching mode of the crypto context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCache {
    Off,
    Client,
    Server,
    Both,
}

/// Certificate, key and trust material.
#[derive(Clone)]
pub struct Credentials {
    certificate: Option<PemSource>,
    private_key: Option<PemSource>,
    key_password: Option<Zeroizing<String>>,
    ca_file: Option<PathBuf>,
    ca_path: Option<PathBuf>,
    trusted: Vec<Vec<u8>>,
    trust_default: bool,
    verify_peer: bool,
}

impl Default for Credentials {
    fn default() -> Self {
        Credentials {
            certificate: None,
            private_key: None,
            key_password: None,
            ca_file: None,
            ca_path: None,
            trusted: Vec::new(),
            trust_default: false,
            verify_peer: true,
        }
    }
}

impl Credentials {
    /// Certificate chain presented to the peer.
    pub fn certificate(&self) -> Option<&PemSource> {
        self.certificate.as_ref()
    }

    /// Private key matching [`Credentials::certificate`].
    pub fn private_key(&self) -> Option<&PemSource> {
        self.private_key.as_ref()
    }

    /// Password of an encrypted private key.
    pub fn key_password(&self) -> Option<&str> {
        self.key_password.as_ref().map(|p| p.as_str())
    }

    /// File with trusted authority certificates.
    pub fn ca_file(&self) -> Option<&PathBuf> {
        self.ca_file.as_ref()
    }

    /// Directory with trusted authority certificates.
    pub fn ca_path(&self) -> Option<&PathBuf> {
        self.ca_path.as_ref()
    }

    /// Extra trusted authority certificates in PEM.
    pub fn trusted(&self) -> &[Vec<u8>] {
        &self.trusted
    }

    /// Whether the system default trust store is loaded too.
    pub fn trust_default(&self) -> bool {
        self.trust_default
    }

    /// Whether the peer certificate is requested and verified.
    pub fn verify_peer(&self) -> bool {
        self.verify_peer
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("certificate", &self.certificate)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("key_password", &self.key_password.as_ref().map(|_| "<redacted>"))
            .field("ca_file", &self.ca_file)
            .field("ca_path", &self.ca_path)
            .field("trusted", &self.trusted.len())
            .field("trust_default", &self.trust_default)
            .field("verify_peer", &self.verify_peer)
            .finish()
    }
}

/// Endpoint configuration.
///
/// Shared by servers and clients. Immutable once an engine holds it.
#[derive(Debug, Clone)]
pub struct Config {
    transport: Transport,
    host: String,
    port: String,
    prefer_ipv6: bool,
    timeout: Duration,
    min_io_timeout: Duration,
    max_timeouts: usize,
    max_idle_timeouts: usize,
    shutdown_retries: usize,
    recv_buffer: usize,
    listen_backlog: i32,
    mtu: usize,
    accept_batch: usize,
    session_cache: SessionCache,
    credentials: Credentials,
}

impl Config {
    /// Create a new configuration builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            transport: Transport::Stream,
            host: "any".to_string(),
            port: "3000".to_string(),
            prefer_ipv6: true,
            timeout: Duration::from_millis(1000),
            min_io_timeout: Duration::from_millis(1000),
            max_timeouts: 9,
            max_idle_timeouts: 0,
            shutdown_retries: 10,
            recv_buffer: 16384,
            listen_backlog: 8,
            mtu: 1150,
            accept_batch: 8,
            session_cache: SessionCache::Server,
            credentials: Credentials::default(),
        }
    }

    #[inline(always)]
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Host to bind (server) or connect to (client). `"any"` binds every interface.
    #[inline(always)]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port number or service name.
    #[inline(always)]
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Prefer IPv6 candidates over IPv4 ones.
    #[inline(always)]
    pub fn prefer_ipv6(&self) -> bool {
        self.prefer_ipv6
    }

    /// Timeout for a single I/O wait and for idle connections.
    #[inline(always)]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Lower bound of any readiness wait.
    #[inline(always)]
    pub fn min_io_timeout(&self) -> Duration {
        self.min_io_timeout
    }

    /// Retry budget of handshake, read and write operations.
    #[inline(always)]
    pub fn max_timeouts(&self) -> usize {
        self.max_timeouts
    }

    /// Idle timeouts tolerated before an established connection is dropped.
    ///
    /// The connection goes when the count exceeds this value, so the default
    /// of 0 drops it on the first idle timeout.
    #[inline(always)]
    pub fn max_idle_timeouts(&self) -> usize {
        self.max_idle_timeouts
    }

    /// Retry budget of the close sequence.
    #[inline(always)]
    pub fn shutdown_retries(&self) -> usize {
        self.shutdown_retries
    }

    /// Size of the buffer a single read delivers into.
    #[inline(always)]
    pub fn recv_buffer(&self) -> usize {
        self.recv_buffer
    }

    /// Backlog of the stream listener.
    #[inline(always)]
    pub fn listen_backlog(&self) -> i32 {
        self.listen_backlog
    }

    /// Link MTU of datagram sessions.
    #[inline(always)]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Max new peers greeted per server tick.
    #[inline(always)]
    pub fn accept_batch(&self) -> usize {
        self.accept_batch
    }

    #[inline(always)]
    pub fn session_cache(&self) -> SessionCache {
        self.session_cache
    }

    #[inline(always)]
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }
}

/// Builder for [`Config`].
pub struct ConfigBuilder {
    transport: Transport,
    host: String,
    port: String,
    prefer_ipv6: bool,
    timeout: Duration,
    min_io_timeout: Duration,
    max_timeouts: usize,
    max_idle_timeouts: usize,
    shutdown_retries: usize,
    recv_buffer: usize,
    listen_backlog: i32,
    mtu: usize,
    accept_batch: usize,
    session_cache: SessionCache,
    credentials: Credentials,
}

impl ConfigBuilder {
    /// Set the transport.
    ///
    /// Defaults to [`Transport::Stream`].
    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Set the address to host on (server) or connect to (client).
    ///
    /// `port` is a number like `"31415"` or a service name like `"https"`.
    /// `host` is a name, an IP literal or `"any"`.
    /// Defaults to `"any"`, `"3000"`.
    pub fn address(mut self, host: impl Into<String>, port: impl Into<String>) -> Self {
        self.host = host.into();
        self.port = port.into();
        self
    }

    /// Prefer IPv6 over IPv4 when both resolve.
    ///
    /// Defaults to true.
    pub fn prefer_ipv6(mut self, prefer: bool) -> Self {
        self.prefer_ipv6 = prefer;
        self
    }

    /// Set the I/O and idle timeout.
    ///
    /// Defaults to 1 second.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the lower bound of any readiness wait.
    ///
    /// Defaults to 1 second.
    pub fn min_io_timeout(mut self, timeout: Duration) -> Self {
        self.min_io_timeout = timeout;
        self
    }

    /// Set the retry budget for I/O operations.
    ///
    /// Defaults to 9.
    pub fn max_timeouts(mut self, max: usize) -> Self {
        self.max_timeouts = max;
        self
    }

    /// Set how many idle timeouts an established connection survives.
    ///
    /// Defaults to 0.
    pub fn max_idle_timeouts(mut self, max: usize) -> Self {
        self.max_idle_timeouts = max;
        self
    }

    /// Set the retry budget for the close sequence.
    ///
    /// Defaults to 10.
    pub fn shutdown_retries(mut self, retries: usize) -> Self {
        self.shutdown_retries = retries;
        self
    }

    /// Set the read buffer size.
    ///
    /// Defaults to 16384, the largest TLS record.
    pub fn recv_buffer(mut self, size: usize) -> Self {
        self.recv_buffer = size;
        self
    }

    /// Set the stream listen backlog.
    ///
    /// Defaults to 8.
    pub fn listen_backlog(mut self, backlog: i32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    /// Set the link MTU used by datagram sessions.
    ///
    /// Defaults to 1150.
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Set how many new peers a server greets per tick.
    ///
    /// Defaults to 8.
    pub fn accept_batch(mut self, batch: usize) -> Self {
        self.accept_batch = batch;
        self
    }

    /// Set the session cache mode.
    ///
    /// Defaults to [`SessionCache::Server`].
    pub fn session_cache(mut self, mode: SessionCache) -> Self {
        self.session_cache = mode;
        self
    }

    /// Certificate chain (PEM) presented to the peer.
    pub fn certificate(mut self, source: PemSource) -> Self {
        self.credentials.certificate = Some(source);
        self
    }

    /// Private key (PEM) for the certificate.
    pub fn private_key(mut self, source: PemSource) -> Self {
        self.credentials.private_key = Some(source);
        self
    }

    /// Password for an encrypted private key.
    pub fn key_password(mut self, password: impl Into<String>) -> Self {
        self.credentials.key_password = Some(Zeroizing::new(password.into()));
        self
    }

    /// Trust the authorities in a PEM file and/or a directory of certificates.
    pub fn cert_authority(mut self, ca_file: Option<PathBuf>, ca_path: Option<PathBuf>) -> Self {
        self.credentials.ca_file = ca_file;
        self.credentials.ca_path = ca_path;
        self
    }

    /// Trust one more authority certificate given as PEM.
    pub fn trust(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.credentials.trusted.push(pem.into());
        self
    }

    /// Also trust the system default store.
    ///
    /// Defaults to false.
    pub fn trust_default(mut self, enabled: bool) -> Self {
        self.credentials.trust_default = enabled;
        self
    }

    /// Request and verify the peer certificate.
    ///
    /// Defaults to true.
    pub fn verify_peer(mut self, enabled: bool) -> Self {
        self.credentials.verify_peer = enabled;
        self
    }

    /// Build the configuration.
    ///
    /// Returns `Error::ConfigError` if any value is out of range.
    pub fn build(self) -> Result<Config, Error> {
        if self.port.is_empty() {
            return Err(Error::ConfigError("port must not be empty".to_string()));
        }
        if self.host.is_empty() {
            return Err(Error::ConfigError("host must not be empty".to_string()));
        }
        if self.max_timeouts == 0 {
            return Err(Error::ConfigError("max_timeouts must be at least 1".to_string()));
        }
        if self.shutdown_retries == 0 {
            return Err(Error::ConfigError(
                "shutdown_retries must be at least 1".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(Error::ConfigError("timeout must be non-zero".to_string()));
        }
        if self.recv_buffer == 0 {
            return Err(Error::ConfigError("recv_buffer must be non-zero".to_string()));
        }
        if self.mtu < 256 {
            return Err(Error::ConfigError(format!(
                "mtu {} is below the 256 byte minimum",
                self.mtu
            )));
        }
        if self.accept_batch == 0 {
            return Err(Error::ConfigError("accept_batch must be at least 1".to_string()));
        }

        Ok(Config {
            transport: self.transport,
            host: self.host,
            port: self.port,
            prefer_ipv6: self.prefer_ipv6,
            timeout: self.timeout,
            min_io_timeout: self.min_io_timeout,
            max_timeouts: self.max_timeouts,
            max_idle_timeouts: self.max_idle_timeouts,
            shutdown_retries: self.shutdown_retries,
            recv_buffer: self.recv_buffer,
            listen_backlog: self.listen_backlog,
            mtu: self.mtu,
            accept_batch: self.accept_batch,
            session_cache: self.session_cache,
            credentials: self.credentials,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::builder()
            .build()
            .expect("Default config should always validate")
    }
}
