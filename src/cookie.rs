//! Stateless DTLS cookies bound to the peer address.
//!
//! A cookie is `HMAC-SHA256(secret, ip octets || port)`. The secret is
//! created once per process, from the OS CSPRNG, and never rotated. A server
//! can therefore check a returning ClientHello without having kept any state
//! for the first one.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::ops::Deref;

use hmac::{Hmac, Mac};
use once_cell::sync::OnceCell;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::SeededRng;

type HmacSha256 = Hmac<Sha256>;

/// Length of the secret in bytes.
pub const SECRET_LEN: usize = 16;

/// Length of a cookie in bytes.
pub const COOKIE_LEN: usize = 32;

/// A cookie for one peer.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Cookie([u8; COOKIE_LEN]);

impl Deref for Cookie {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cookie({:02x?})", &self.0[..4])
    }
}

/// Holder of the cookie secret.
///
/// The process uses one instance through [`generate`], [`verify`] and
/// [`init`]. Separate instances exist for tests.
pub struct CookieAuthority {
    secret: OnceCell<Zeroizing<[u8; SECRET_LEN]>>,
}

impl CookieAuthority {
    pub const fn new() -> Self {
        CookieAuthority {
            secret: OnceCell::new(),
        }
    }

    /// Create the secret if it does not exist yet.
    ///
    /// Concurrent callers all observe the same secret.
    pub fn init(&self) {
        self.secret();
    }

    pub fn is_initialized(&self) -> bool {
        self.secret.get().is_some()
    }

    fn secret(&self) -> &[u8; SECRET_LEN] {
        self.secret.get_or_init(|| {
            let mut secret = Zeroizing::new([0_u8; SECRET_LEN]);
            if let Err(e) = OsRng.try_fill_bytes(&mut secret[..]) {
                error!(
                    "OS random source failed ({}), cookie secret falls back to a clock seed",
                    e
                );
                SeededRng::from_clock().fill(&mut secret[..]);
            }
            debug!("Cookie secret initialized");
            secret
        })
    }

    /// Cookie for `peer`. Initializes the secret on first use.
    pub fn generate(&self, peer: SocketAddr) -> Cookie {
        compute(self.secret(), peer)
    }

    /// Check a cookie presented by `peer`.
    ///
    /// Never succeeds before the secret exists.
    pub fn verify(&self, peer: SocketAddr, cookie: &[u8]) -> bool {
        let Some(secret) = self.secret.get() else {
            return false;
        };
        if cookie.len() != COOKIE_LEN {
            return false;
        }
        mac(secret.as_slice(), peer).verify_slice(cookie).is_ok()
    }
}

impl Default for CookieAuthority {
    fn default() -> Self {
        Self::new()
    }
}

static AUTHORITY: CookieAuthority = CookieAuthority::new();

/// Initialize the process-wide secret.
pub fn init() {
    AUTHORITY.init()
}

/// Cookie for `peer` from the process-wide secret.
pub fn generate(peer: SocketAddr) -> Cookie {
    AUTHORITY.generate(peer)
}

/// Check `cookie` for `peer` against the process-wide secret.
pub fn verify(peer: SocketAddr, cookie: &[u8]) -> bool {
    AUTHORITY.verify(peer, cookie)
}

fn mac(secret: &[u8], peer: SocketAddr) -> HmacSha256 {
    // unwrap() is ok because HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(secret).unwrap();
    match peer.ip() {
        IpAddr::V4(ip) => mac.update(&ip.octets()),
        IpAddr::V6(ip) => mac.update(&ip.octets()),
    }
    mac.update(&peer.port().to_be_bytes());
    mac
}

fn compute(secret: &[u8], peer: SocketAddr) -> Cookie {
    let tag = mac(secret, peer).finalize().into_bytes();
    let mut cookie = [0_u8; COOKIE_LEN];
    cookie.copy_from_slice(&tag[..COOKIE_LEN]);
    Cookie(cookie)
}
