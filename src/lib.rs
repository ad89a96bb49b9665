//! seclink, a secure transport engine for TLS over TCP and DTLS over UDP.
//!
//! One connection lifecycle serves both transports and both roles. A [`Server`]
//! listens for many peers, a [`Client`] connects to one. Both are driven by a
//! periodic [`Server::tick`] / [`Client::tick`] that accepts peers and detects
//! readable data, while reads and writes run as tasks on a [`WorkQueue`].
//!
//! The handshake and record protocol come from OpenSSL. This crate owns what
//! sits around it:
//!
//! * resolving an address into socket candidates and picking one,
//! * the stateless DTLS cookie exchange, so that spoofed peers cost nothing,
//! * retrying partial I/O against a budget, with readiness waits in between,
//! * reaping idle and closed connections, and orderly teardown.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use seclink::{Config, PemSource, Server, Transport, WorkQueue};
//!
//! let config = Config::builder()
//!     .transport(Transport::Stream)
//!     .address("127.0.0.1", "3000")
//!     .certificate(PemSource::File("server.pem".into()))
//!     .private_key(PemSource::File("server.key".into()))
//!     .verify_peer(false)
//!     .build()
//!     .unwrap();
//!
//! let pool = Arc::new(WorkQueue::new());
//! pool.start(0);
//!
//! let server = Server::new(Arc::new(config), pool).unwrap();
//! server.on_receive(|server, key, _peer, data| {
//!     // Echo.
//!     let _ = server.send(key, data);
//! });
//! server.start().unwrap();
//!
//! loop {
//!     server.wait_events(std::time::Duration::from_millis(100));
//!     server.tick();
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all)]
// #![deny(missing_docs)]

#[macro_use]
extern crate log;

mod error;
pub use error::{Error, ErrorClass, SendError};

mod config;
pub use config::{Config, ConfigBuilder, Credentials, PemSource, SessionCache, Transport};

mod rng;
pub(crate) use rng::SeededRng;

mod timer;

pub mod cookie;
pub use cookie::Cookie;

pub mod hello;

mod resolve;
pub use resolve::{resolve, Candidate};

mod channel;

mod wait;
pub use wait::Direction;

mod provider;

mod pool;
pub use pool::{Pending, WorkQueue};

mod conn;
pub use conn::ConnectionKey;

mod server;
pub use server::Server;

mod client;
pub use client::Client;

/// Result with this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
