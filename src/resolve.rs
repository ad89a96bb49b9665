//! From host and port to an open socket.
//!
//! Resolution yields an ordered candidate list. Each candidate is tried in
//! turn: create, configure, then bind (and listen) or connect. The first
//! viable candidate of the preferred family wins, otherwise the first viable
//! one of any family.

use std::fs;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::os::fd::AsFd;

use socket2::{Domain, Protocol, Socket, Type};

use crate::wait::{self, Direction};
use crate::{Config, Error, Transport};

const SERVICES: &str = "/etc/services";

/// A resolved address and its position in the resolution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub index: usize,
    pub addr: SocketAddr,
}

/// What to do with a candidate socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Intent {
    /// Bind, and listen for streams.
    Listen,
    /// Connect to the candidate.
    Connect,
}

/// Resolve the configured host and port into candidates.
///
/// `"any"` means the unspecified address of both families, IPv6 first.
/// The order is the resolver's, with the preferred family moved to the front.
pub fn resolve(config: &Config) -> Result<Vec<Candidate>, Error> {
    let port = port_number(config.port(), config.transport())?;
    let host = config.host();

    let mut addrs: Vec<SocketAddr> = if host.eq_ignore_ascii_case("any") {
        vec![
            SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port),
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port),
        ]
    } else {
        (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::ResolveError(format!("{}:{}", host, config.port()), e))?
            .collect()
    };

    let prefer_v6 = config.prefer_ipv6();
    // Stable, so resolver order holds within a family.
    addrs.sort_by_key(|a| a.is_ipv6() != prefer_v6);
    addrs.dedup();

    Ok(addrs
        .into_iter()
        .enumerate()
        .map(|(index, addr)| Candidate { index, addr })
        .collect())
}

/// Resolve and open the first viable candidate.
pub(crate) fn open(config: &Config, intent: Intent) -> Result<(Socket, SocketAddr), Error> {
    let candidates = resolve(config)?;
    let prefer_v6 = config.prefer_ipv6();

    for candidate in &candidates {
        let family = if candidate.addr.is_ipv6() { 6 } else { 4 };
        info!(
            "Candidate {}: IPv{} {}",
            candidate.index, family, candidate.addr
        );

        match try_candidate(config, candidate.addr, intent) {
            Ok(socket) => {
                if candidate.addr.is_ipv6() == prefer_v6 {
                    info!(
                        "Using candidate {} because it is IPv{}",
                        candidate.index, family
                    );
                } else {
                    info!(
                        "Using candidate {}, no viable candidate of the preferred family",
                        candidate.index
                    );
                }
                return Ok((socket, candidate.addr));
            }
            Err(e) => {
                warn!("Candidate {}: {}", candidate.index, e);
            }
        }
    }

    warn!(
        "No address resolved from {}:{} can be used",
        config.host(),
        config.port()
    );
    Err(Error::NoUsableAddress(format!(
        "{}:{}",
        config.host(),
        config.port()
    )))
}

fn try_candidate(config: &Config, addr: SocketAddr, intent: Intent) -> io::Result<Socket> {
    let (ty, protocol) = match config.transport() {
        Transport::Stream => (Type::STREAM, Protocol::TCP),
        Transport::Datagram => (Type::DGRAM, Protocol::UDP),
    };

    let socket = Socket::new(Domain::for_address(addr), ty, Some(protocol))?;

    if let Err(e) = socket.set_nonblocking(true) {
        warn!("Failed to make socket non-blocking: {}", e);
    }
    if addr.is_ipv6() {
        if let Err(e) = socket.set_only_v6(true) {
            warn!("Failed to restrict socket to IPv6: {}", e);
        }
    }
    if let Err(e) = socket.set_reuse_address(true) {
        warn!("Failed to set address reuse: {}", e);
    }
    if let Err(e) = socket.set_reuse_port(true) {
        warn!("Failed to set port reuse: {}", e);
    }

    match intent {
        Intent::Listen => {
            socket.bind(&addr.into())?;
            if config.transport() == Transport::Stream {
                socket.listen(config.listen_backlog())?;
            }
        }
        Intent::Connect => connect(&socket, addr, config)?,
    }

    Ok(socket)
}

fn connect(socket: &Socket, addr: SocketAddr, config: &Config) -> io::Result<()> {
    match socket.connect(&addr.into()) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
            let timeout = wait::clamp(config.timeout(), config.min_io_timeout());
            if !wait::poll_one(socket.as_fd(), Direction::Write, timeout)? {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
            }
            match socket.take_error()? {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
        Err(e) => Err(e),
    }
}

/// A datagram socket bound to the server's `local` address and connected to `peer`.
///
/// With port reuse on both sockets, the kernel delivers the peer's datagrams
/// here instead of to the listening socket.
pub(crate) fn connected_datagram(local: SocketAddr, peer: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;
    if local.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;
    socket.connect(&peer.into())?;
    Ok(socket.into())
}

/// Port from a number or a service name.
fn port_number(port: &str, transport: Transport) -> Result<u16, Error> {
    if let Ok(n) = port.parse::<u16>() {
        return Ok(n);
    }
    let services = fs::read_to_string(SERVICES).unwrap_or_default();
    lookup_service(&services, port, transport.protocol_name())
        .ok_or_else(|| Error::UnknownService(port.to_string()))
}

/// Find `name` for `protocol` in the contents of a services database.
fn lookup_service(services: &str, name: &str, protocol: &str) -> Option<u16> {
    for line in services.lines() {
        let line = line.split('#').next().unwrap_or_default();
        let mut fields = line.split_whitespace();
        let Some(service) = fields.next() else {
            continue;
        };
        let Some((port, proto)) = fields.next().and_then(|f| f.split_once('/')) else {
            continue;
        };
        if proto != protocol {
            continue;
        }
        if service == name || fields.any(|alias| alias == name) {
            return port.parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    const SERVICES_DB: &str = "\
# comment line
http        80/tcp      www     # WorldWideWeb HTTP
https       443/tcp
https       443/udp
domain      53/udp
";

    #[test]
    fn services_lookup() {
        assert_eq!(lookup_service(SERVICES_DB, "https", "tcp"), Some(443));
        assert_eq!(lookup_service(SERVICES_DB, "www", "tcp"), Some(80));
        assert_eq!(lookup_service(SERVICES_DB, "domain", "udp"), Some(53));
        assert_eq!(lookup_service(SERVICES_DB, "domain", "tcp"), None);
        assert_eq!(lookup_service(SERVICES_DB, "comment", "tcp"), None);
    }

    #[test]
    fn numeric_port() {
        assert_eq!(port_number("3000", Transport::Stream).unwrap(), 3000);
        assert!(matches!(
            port_number("no-such-service-here", Transport::Stream),
            Err(Error::UnknownService(_))
        ));
    }

    #[test]
    fn any_prefers_family() {
        let config = Config::builder().address("any", "3000").build().unwrap();
        let c = resolve(&config).unwrap();
        assert_eq!(c.len(), 2);
        assert!(c[0].addr.is_ipv6());
        assert_eq!(c[0].addr.port(), 3000);

        let config = Config::builder()
            .address("any", "3000")
            .prefer_ipv6(false)
            .build()
            .unwrap();
        let c = resolve(&config).unwrap();
        assert!(c[0].addr.is_ipv4());
        assert!(c[1].addr.is_ipv6());
    }

    #[test]
    fn literal_address() {
        let config = Config::builder()
            .address("127.0.0.1", "4433")
            .build()
            .unwrap();
        let c = resolve(&config).unwrap();
        assert_eq!(c[0].addr, "127.0.0.1:4433".parse().unwrap());
    }

    #[test]
    fn listen_on_loopback() {
        let config = Config::builder()
            .transport(Transport::Datagram)
            .address("127.0.0.1", "0")
            .build()
            .unwrap();
        let (socket, addr) = open(&config, Intent::Listen).unwrap();
        assert!(addr.is_ipv4());
        assert!(socket.local_addr().unwrap().as_socket().is_some());
    }

    #[test]
    fn connect_refused_is_not_viable() {
        // Grab a free port, then close it again.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let config = Config::builder()
            .address("127.0.0.1", port.to_string())
            .timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        assert!(matches!(
            open(&config, Intent::Connect),
            Err(Error::NoUsableAddress(_))
        ));
    }
}
