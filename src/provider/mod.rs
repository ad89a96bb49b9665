//! The seam between the engines and the crypto library.
//!
//! Engines never call the library directly. A [`CryptoProvider`] turns a
//! channel into a [`Session`], and every session step reports either success
//! or an [`ErrorClass`] the retry driver knows how to act on.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::channel::Channel;
use crate::hello::{self, ClientHello};
use crate::{cookie, Error, ErrorClass};

mod ossl;
pub(crate) use ossl::OpensslProvider;

/// Side of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Server,
    Client,
}

/// Progress of the close sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseState {
    /// Our close notification went out, the peer's has not arrived yet.
    Sent,
    /// Both directions are closed.
    Complete,
}

/// Outcome of a first datagram on a listening socket.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Listen {
    /// The hello carried a valid cookie. Holds the datagrams a fresh session
    /// must read to pick up the exchange.
    Verified(Vec<Vec<u8>>),
    /// Send this HelloVerifyRequest back. No state is kept.
    Reply(Vec<u8>),
    /// A cookie was present but wrong.
    Rejected,
    /// Not a ClientHello.
    Ignored,
}

/// Creates sessions from one crypto context.
pub(crate) trait CryptoProvider: Send + Sync {
    /// Bind a new session to `channel`.
    ///
    /// `replay` is the output of [`CryptoProvider::listen`] for datagram
    /// server sessions, empty otherwise.
    fn new_session(
        &self,
        role: Role,
        channel: Arc<Channel>,
        peer: SocketAddr,
        replay: Vec<Vec<u8>>,
    ) -> Result<Box<dyn Session>, Error>;

    /// Stateless cookie exchange for a datagram received by a listening socket.
    fn listen(&self, datagram: &[u8], peer: SocketAddr) -> Listen {
        listen(datagram, peer)
    }
}

/// One secure session. Every step is non-blocking.
pub(crate) trait Session: Send {
    /// Advance the handshake. `Ok` once complete.
    fn handshake(&mut self) -> Result<(), ErrorClass>;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ErrorClass>;

    fn write(&mut self, buf: &[u8]) -> Result<usize, ErrorClass>;

    /// Advance the close sequence.
    fn close(&mut self) -> Result<CloseState, ErrorClass>;

    /// The peer has sent its close notification.
    fn received_shutdown(&mut self) -> bool;

    /// Time left until the next retransmission, for datagram sessions that
    /// wait for a flight.
    fn retransmit_timeout(&mut self) -> Option<Duration>;

    /// The retransmission deadline passed.
    fn handle_timeout(&mut self);

    /// Largest payload one datagram record carries.
    fn mtu(&self) -> Option<usize>;

    /// Negotiated protocol and cipher, for logging.
    fn summary(&self) -> String;
}

/// The stateless half of the datagram cookie exchange.
pub(crate) fn listen(datagram: &[u8], peer: SocketAddr) -> Listen {
    let hello = match ClientHello::parse(datagram) {
        Ok((_, hello)) => hello,
        Err(e) => {
            trace!("Ignore datagram from {} ({} bytes): {:?}", peer, datagram.len(), e);
            return Listen::Ignored;
        }
    };

    if hello.cookie.is_empty() {
        debug!("ClientHello without cookie from {}, send HelloVerifyRequest", peer);
        return Listen::Reply(hello::hello_verify_request(&hello, &cookie::generate(peer)));
    }

    if !cookie::verify(peer, hello.cookie) {
        warn!("Reject ClientHello with invalid cookie from {}", peer);
        return Listen::Rejected;
    }

    if hello.header.message_seq != 1 {
        // The session can only continue an exchange it believes it started.
        debug!(
            "Cookie from {} on message_seq {}, send HelloVerifyRequest",
            peer, hello.header.message_seq
        );
        return Listen::Reply(hello::hello_verify_request(&hello, &cookie::generate(peer)));
    }

    debug!("Valid cookie from {}", peer);

    // The session sees the cookieless hello it would have answered itself,
    // then the hello that answers it. The record sequence of the second must
    // come after the first to pass replay protection.
    let first = hello.serialize(&[], 0, 0);
    let second = hello.serialize(hello.cookie, 1, hello.header.record_seq.max(1));

    Listen::Verified(vec![first, second])
}
