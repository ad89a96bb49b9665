#![allow(unused)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, SanType,
    PKCS_ECDSA_P256_SHA256,
};
use seclink::{Config, PemSource, Server, Transport};

/// A self-signed certificate and its key, both PEM.
pub struct TestCert {
    pub cert_pem: String,
    pub key_pem: String,
}

/// P-256 certificate valid for `localhost` and `127.0.0.1`.
pub fn self_signed() -> TestCert {
    let key_pair = KeyPair::generate(&PKCS_ECDSA_P256_SHA256).unwrap();

    let mut params = CertificateParams::new(vec!["localhost".to_string()]);
    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));

    let mut name = DistinguishedName::new();
    name.push(DnType::OrganizationName, "seclink".to_string());
    name.push(DnType::CommonName, "localhost".to_string());
    params.distinguished_name = name;
    params.is_ca = IsCa::NoCa;
    params.key_pair = Some(key_pair);

    let cert = Certificate::from_params(params).unwrap();
    TestCert {
        cert_pem: cert.serialize_pem().unwrap(),
        key_pem: cert.serialize_private_key_pem(),
    }
}

pub fn server_config(transport: Transport, cert: &TestCert, timeout: Duration) -> Config {
    Config::builder()
        .transport(transport)
        .address("127.0.0.1", "0")
        .timeout(timeout)
        .min_io_timeout(Duration::from_millis(50))
        .certificate(PemSource::Pem(cert.cert_pem.clone().into_bytes()))
        .private_key(PemSource::Pem(cert.key_pem.clone().into_bytes()))
        .verify_peer(false)
        .build()
        .unwrap()
}

/// Client that trusts `cert` and checks it against 127.0.0.1.
pub fn client_config(transport: Transport, cert: &TestCert, port: u16) -> Config {
    Config::builder()
        .transport(transport)
        .address("127.0.0.1", port.to_string())
        .timeout(Duration::from_secs(2))
        .min_io_timeout(Duration::from_millis(50))
        .trust(cert.cert_pem.clone())
        .verify_peer(true)
        .build()
        .unwrap()
}

/// Ticks a server on a thread of its own until dropped.
pub struct Ticker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn new(server: &Server) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let server = server.clone();
        let s = stop.clone();
        let handle = thread::spawn(move || {
            while !s.load(Ordering::SeqCst) {
                server.wait_events(Duration::from_millis(10));
                server.tick();
            }
        });
        Ticker {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Poll `f` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    f()
}

/// A DTLS 1.2 ClientHello record carrying `cookie`.
pub fn client_hello(cookie: &[u8], message_seq: u16) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0xFE, 0xFD]);
    body.extend_from_slice(&[7; 32]);
    body.push(0);
    body.push(cookie.len() as u8);
    body.extend_from_slice(cookie);
    // One cipher suite, null compression.
    body.extend_from_slice(&[0x00, 0x02, 0xC0, 0x2B, 0x01, 0x00]);

    let len = (body.len() as u32).to_be_bytes();
    let mut hs = vec![1];
    hs.extend_from_slice(&len[1..]);
    hs.extend_from_slice(&message_seq.to_be_bytes());
    hs.extend_from_slice(&[0, 0, 0]);
    hs.extend_from_slice(&len[1..]);
    hs.extend_from_slice(&body);

    let mut record = vec![22, 0xFE, 0xFF, 0, 0];
    record.extend_from_slice(&[0, 0, 0, 0, 0, message_seq as u8]);
    record.extend_from_slice(&(hs.len() as u16).to_be_bytes());
    record.extend_from_slice(&hs);
    record
}

/// A bound UDP socket with a receive timeout, aimed at `server`.
pub fn udp_peer(server: SocketAddr) -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.connect(server).unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    socket
}
