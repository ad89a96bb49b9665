use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use openssl::error::ErrorStack;
use openssl::ex_data::Index;
use openssl::pkey::PKey;
use openssl::ssl::{
    ErrorCode, ShutdownResult, ShutdownState, Ssl, SslContext, SslContextBuilder, SslFiletype,
    SslMethod, SslOptions, SslSessionCacheMode, SslStream, SslVerifyMode,
};
use openssl::x509::store::{HashDir, X509Lookup};
use openssl::x509::X509;

use super::{CloseState, CryptoProvider, Role, Session};
use crate::channel::{Channel, Link};
use crate::config::{Credentials, PemSource, SessionCache};
use crate::timer::ExponentialBackoff;
use crate::{cookie, Config, Error, ErrorClass, Transport};

const SESSION_ID_CONTEXT: &[u8] = b"seclink";

// DTLS 1.2 record header.
const RECORD_HEADER: usize = 13;

// Retransmission timer of the library.
const START_RTO: Duration = Duration::from_secs(1);
const MAX_RTO: Duration = Duration::from_secs(60);

/// Sessions backed by OpenSSL. TLS for streams, DTLS for datagrams.
pub(crate) struct OpensslProvider {
    context: SslContext,
    transport: Transport,
    mtu: usize,
    verify_host: Option<String>,
}

impl OpensslProvider {
    pub fn new(config: &Config, role: Role) -> Result<Self, Error> {
        let method = match config.transport() {
            Transport::Stream => SslMethod::tls(),
            Transport::Datagram => SslMethod::dtls(),
        };
        let mut ctx = SslContextBuilder::new(method)?;
        let credentials = config.credentials();

        if credentials.verify_peer() {
            ctx.set_verify_callback(SslVerifyMode::PEER, |ok, store| {
                let subject = store
                    .current_cert()
                    .map(|c| format!("{:?}", c.subject_name()))
                    .unwrap_or_default();
                if ok {
                    info!("Trusting certificate: {}", subject);
                } else {
                    warn!("Rejecting certificate: {}", subject);
                }
                ok
            });
        } else {
            ctx.set_verify(SslVerifyMode::NONE);
        }

        load_credentials(&mut ctx, credentials)?;

        ctx.set_session_cache_mode(match config.session_cache() {
            SessionCache::Off => SslSessionCacheMode::OFF,
            SessionCache::Client => SslSessionCacheMode::CLIENT,
            SessionCache::Server => SslSessionCacheMode::SERVER,
            SessionCache::Both => SslSessionCacheMode::BOTH,
        });
        if role == Role::Server {
            ctx.set_session_id_context(SESSION_ID_CONTEXT)?;
        }

        if config.transport().is_datagram() && role == Role::Server {
            ctx.set_options(SslOptions::COOKIE_EXCHANGE);
            ctx.set_cookie_generate_cb(|ssl, out| {
                let peer = ssl
                    .ex_data(peer_index()?)
                    .copied()
                    .ok_or_else(ErrorStack::get)?;
                let cookie = cookie::generate(peer);
                let n = cookie.len().min(out.len());
                out[..n].copy_from_slice(&cookie[..n]);
                Ok(n)
            });
            ctx.set_cookie_verify_cb(|ssl, presented| {
                let Ok(index) = peer_index() else {
                    return false;
                };
                match ssl.ex_data(index) {
                    Some(peer) => cookie::verify(*peer, presented),
                    None => false,
                }
            });
        }

        let verify_host = match (role, credentials.verify_peer()) {
            (Role::Client, true) if !config.host().eq_ignore_ascii_case("any") => {
                Some(config.host().to_string())
            }
            _ => None,
        };

        Ok(OpensslProvider {
            context: ctx.build(),
            transport: config.transport(),
            mtu: config.mtu(),
            verify_host,
        })
    }
}

fn peer_index() -> Result<Index<Ssl, SocketAddr>, ErrorStack> {
    static INDEX: OnceCell<Index<Ssl, SocketAddr>> = OnceCell::new();
    INDEX.get_or_try_init(Ssl::new_ex_index).copied()
}

fn load_credentials(ctx: &mut SslContextBuilder, credentials: &Credentials) -> Result<(), Error> {
    match credentials.certificate() {
        Some(PemSource::File(path)) => ctx.set_certificate_chain_file(path)?,
        Some(PemSource::Pem(pem)) => {
            let mut chain = X509::stack_from_pem(pem)?.into_iter();
            let leaf = chain
                .next()
                .ok_or_else(|| Error::CryptoError("No certificate in PEM".to_string()))?;
            ctx.set_certificate(&leaf)?;
            for cert in chain {
                ctx.add_extra_chain_cert(cert)?;
            }
        }
        None => {}
    }

    if let Some(source) = credentials.private_key() {
        let pem = match source {
            PemSource::File(path) => fs::read(path)?,
            PemSource::Pem(pem) => pem.clone(),
        };
        let key = match credentials.key_password() {
            Some(password) => PKey::private_key_from_pem_passphrase(&pem, password.as_bytes())?,
            None => PKey::private_key_from_pem(&pem)?,
        };
        ctx.set_private_key(&key)?;
    }

    if credentials.certificate().is_some() && credentials.private_key().is_some() {
        ctx.check_private_key().map_err(|e| {
            Error::CryptoError(format!("Private key does not match certificate: {}", e))
        })?;
    }

    if let Some(ca_file) = credentials.ca_file() {
        ctx.set_ca_file(ca_file)?;
    }
    if let Some(ca_path) = credentials.ca_path() {
        let dir = path_str(ca_path)?;
        ctx.cert_store_mut()
            .add_lookup(X509Lookup::<HashDir>::hash_dir())?
            .add_dir(dir, SslFiletype::PEM)?;
    }
    for pem in credentials.trusted() {
        let cert = X509::from_pem(pem)?;
        ctx.cert_store_mut().add_cert(cert)?;
    }
    if credentials.trust_default() {
        ctx.set_default_verify_paths()?;
    }

    Ok(())
}

fn path_str(path: &Path) -> Result<&str, Error> {
    path.to_str()
        .ok_or_else(|| Error::ConfigError(format!("Path is not UTF-8: {}", path.display())))
}

impl CryptoProvider for OpensslProvider {
    fn new_session(
        &self,
        role: Role,
        channel: Arc<Channel>,
        peer: SocketAddr,
        replay: Vec<Vec<u8>>,
    ) -> Result<Box<dyn Session>, Error> {
        let mut ssl = Ssl::new(&self.context)?;
        ssl.set_ex_data(peer_index()?, peer);

        let datagram = self.transport.is_datagram();
        if datagram {
            ssl.set_mtu(self.mtu as u32)?;
        }

        match role {
            Role::Server => ssl.set_accept_state(),
            Role::Client => {
                if let Some(host) = &self.verify_host {
                    match host.parse::<IpAddr>() {
                        Ok(ip) => ssl.param_mut().set_ip(ip)?,
                        Err(_) => {
                            ssl.set_hostname(host)?;
                            ssl.param_mut().set_host(host)?;
                        }
                    }
                }
                ssl.set_connect_state();
            }
        }

        if !replay.is_empty() {
            // The session answers the replayed cookieless hello with a
            // HelloVerifyRequest of its own, which the peer already has.
            channel.discard_next(replay.len() - 1);
            for datagram in replay {
                channel.inject(datagram);
            }
        }

        let stream = SslStream::new(ssl, Link(channel))?;

        Ok(Box::new(OpensslSession {
            stream,
            datagram,
            mtu: self.mtu,
            handshaking: true,
            backoff: ExponentialBackoff::new(START_RTO, MAX_RTO),
        }))
    }
}

struct OpensslSession {
    stream: SslStream<Link>,
    datagram: bool,
    mtu: usize,
    handshaking: bool,
    backoff: ExponentialBackoff,
}

impl Session for OpensslSession {
    fn handshake(&mut self) -> Result<(), ErrorClass> {
        match self.stream.do_handshake() {
            Ok(()) => {
                self.handshaking = false;
                self.backoff.reset();
                Ok(())
            }
            Err(e) => Err(classify(&e)),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ErrorClass> {
        self.stream.ssl_read(buf).map_err(|e| classify(&e))
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, ErrorClass> {
        self.stream.ssl_write(buf).map_err(|e| classify(&e))
    }

    fn close(&mut self) -> Result<CloseState, ErrorClass> {
        match self.stream.shutdown() {
            Ok(ShutdownResult::Sent) => Ok(CloseState::Sent),
            Ok(ShutdownResult::Received) => Ok(CloseState::Complete),
            Err(e) => Err(classify(&e)),
        }
    }

    fn received_shutdown(&mut self) -> bool {
        self.stream.get_shutdown().contains(ShutdownState::RECEIVED)
    }

    fn retransmit_timeout(&mut self) -> Option<Duration> {
        if !self.datagram || !self.handshaking {
            return None;
        }
        let now = Instant::now();
        self.backoff.arm(now);
        self.backoff.remaining(now)
    }

    fn handle_timeout(&mut self) {
        if self.datagram && self.handshaking {
            // The next step notices the expired timer and resends the flight.
            self.backoff.attempt(Instant::now());
            debug!("Retransmission timeout, next in {:?}", self.backoff.rto());
        }
    }

    fn mtu(&self) -> Option<usize> {
        if !self.datagram {
            return None;
        }
        let mtu = match self.stream.ssl().current_cipher() {
            Some(cipher) => data_mtu(self.mtu, &cipher.description()),
            None => self.mtu.saturating_sub(RECORD_HEADER),
        };
        Some(mtu)
    }

    fn summary(&self) -> String {
        let ssl = self.stream.ssl();
        let cipher = ssl.current_cipher().map(|c| c.name()).unwrap_or("none");
        format!("{} {}", ssl.version_str(), cipher)
    }
}

/// Map a failed library call onto the retry taxonomy.
fn classify(e: &openssl::ssl::Error) -> ErrorClass {
    match e.code() {
        ErrorCode::WANT_READ => ErrorClass::RetryRead,
        ErrorCode::WANT_WRITE => ErrorClass::RetryWrite,
        ErrorCode::ZERO_RETURN => ErrorClass::PeerClosedWrite,
        ErrorCode::SSL => {
            match e.ssl_error() {
                Some(stack) => error!("TLS protocol error: {}", stack),
                None => error!("TLS protocol error"),
            }
            ErrorClass::FatalProtocol
        }
        ErrorCode::SYSCALL => {
            match e.io_error() {
                Some(io) => error!("System error in TLS call: {}", io),
                None => error!("System error in TLS call: unexpected EOF"),
            }
            ErrorClass::FatalSystem
        }
        code => {
            error!("Unclassified TLS error code {}", code.as_raw());
            ErrorClass::Unclassified
        }
    }
}

/// Payload that fits one record in a datagram of `link_mtu` bytes.
///
/// `description` is the library's cipher description, which names the bulk
/// cipher (`Enc=`) and the record MAC (`Mac=`). Whether encrypt-then-MAC was
/// negotiated is not visible, so block ciphers take the smaller of both.
fn data_mtu(link_mtu: usize, description: &str) -> usize {
    let field = |name: &str| {
        description
            .split_whitespace()
            .find_map(|f| f.strip_prefix(name))
            .unwrap_or("")
    };
    let enc = field("Enc=");
    let mac = field("Mac=");
    let avail = link_mtu.saturating_sub(RECORD_HEADER);

    if mac == "AEAD" {
        let tag = if enc.contains("CCM8") { 8 } else { 16 };
        // GCM and CCM carry an explicit nonce, ChaCha20-Poly1305 does not.
        let nonce = if enc.starts_with("AESGCM") || enc.starts_with("AESCCM") {
            8
        } else {
            0
        };
        return avail.saturating_sub(nonce + tag);
    }

    let mac = match mac {
        "MD5" => 16,
        "SHA1" => 20,
        "SHA256" => 32,
        "SHA384" => 48,
        _ => 64,
    };
    let block = if enc.starts_with("3DES") || enc.starts_with("DES") {
        8
    } else if enc.starts_with("None") || enc.is_empty() {
        0
    } else {
        16
    };
    if block == 0 {
        return avail.saturating_sub(mac);
    }

    // Explicit IV, then whole blocks holding payload, padding length and
    // the MAC when it is inside the encryption.
    let avail = avail.saturating_sub(block);
    let mac_inside = (avail - avail % block).saturating_sub(1 + mac);
    let mac_outside = avail.saturating_sub(mac);
    let mac_outside = (mac_outside - mac_outside % block).saturating_sub(1);
    mac_inside.min(mac_outside)
}

#[cfg(test)]
mod test {
    use super::*;

    const GCM: &str =
        "ECDHE-ECDSA-AES128-GCM-SHA256  TLSv1.2 Kx=ECDH     Au=ECDSA Enc=AESGCM(128)            Mac=AEAD";
    const CHACHA: &str =
        "ECDHE-ECDSA-CHACHA20-POLY1305 TLSv1.2 Kx=ECDH     Au=ECDSA Enc=CHACHA20/POLY1305(256) Mac=AEAD";
    const CBC: &str =
        "ECDHE-ECDSA-AES128-SHA        TLSv1 Kx=ECDH     Au=ECDSA Enc=AES(128)               Mac=SHA1";

    #[test]
    fn aead_overhead() {
        // Header, explicit nonce and tag.
        assert_eq!(data_mtu(1150, GCM), 1150 - 13 - 8 - 16);
        assert_eq!(data_mtu(1150, CHACHA), 1150 - 13 - 16);
    }

    #[test]
    fn block_cipher_overhead() {
        let mtu = data_mtu(1150, CBC);
        assert_eq!(mtu, 1087);

        // A full payload plus padding byte and MAC fills whole blocks that
        // fit the link after header and IV.
        let encrypted = mtu + 1 + 20;
        let blocks = (encrypted + 15) / 16 * 16;
        assert!(13 + 16 + blocks <= 1150);
    }

    #[test]
    fn tiny_link_saturates() {
        assert_eq!(data_mtu(20, GCM), 0);
        assert_eq!(data_mtu(20, CBC), 0);
    }
}
