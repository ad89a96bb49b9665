//! The one OS socket of a connection.
//!
//! A [`Channel`] is shared between the crypto session, which reads and writes
//! through a [`Link`], and the readiness waiter, which polls the same
//! descriptor. Datagram channels can additionally be fed datagrams that never
//! crossed the wire, and told to swallow outgoing ones.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, UdpSocket};
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::wait::{self, Direction};

pub(crate) enum Channel {
    Stream(TcpStream),
    Datagram(DatagramChannel),
}

pub(crate) struct DatagramChannel {
    socket: UdpSocket,
    inbound: Mutex<VecDeque<Vec<u8>>>,
    discard: AtomicUsize,
}

impl Channel {
    pub fn stream(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Channel::Stream(stream))
    }

    /// A datagram channel over a socket connected to its single peer.
    pub fn datagram(socket: UdpSocket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Channel::Datagram(DatagramChannel {
            socket,
            inbound: Mutex::new(VecDeque::new()),
            discard: AtomicUsize::new(0),
        }))
    }

    /// Queue a datagram to be read before anything from the socket.
    pub fn inject(&self, datagram: Vec<u8>) {
        if let Channel::Datagram(d) = self {
            d.inbound.lock().push_back(datagram);
        }
    }

    /// Drop the next `count` outgoing datagrams instead of sending them.
    pub fn discard_next(&self, count: usize) {
        if let Channel::Datagram(d) = self {
            d.discard.fetch_add(count, Ordering::SeqCst);
        }
    }

    /// Whether injected datagrams are still waiting to be read.
    pub fn has_pending(&self) -> bool {
        match self {
            Channel::Stream(_) => false,
            Channel::Datagram(d) => !d.inbound.lock().is_empty(),
        }
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Channel::Stream(s) => (&*s).read(buf),
            Channel::Datagram(d) => {
                if let Some(datagram) = d.inbound.lock().pop_front() {
                    let n = datagram.len().min(buf.len());
                    buf[..n].copy_from_slice(&datagram[..n]);
                    return Ok(n);
                }
                d.socket.recv(buf)
            }
        }
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Channel::Stream(s) => (&*s).write(buf),
            Channel::Datagram(d) => {
                let swallowed = d
                    .discard
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if swallowed {
                    trace!("Discard outgoing datagram of {} bytes", buf.len());
                    return Ok(buf.len());
                }
                d.socket.send(buf)
            }
        }
    }

    /// Block until ready in `direction` or `timeout`. Returns `Ok(false)` on timeout.
    pub fn poll(&self, direction: Direction, timeout: Duration) -> io::Result<bool> {
        if direction == Direction::Read && self.has_pending() {
            return Ok(true);
        }
        wait::poll_one(self.as_fd(), direction, timeout)
    }

    /// Readable right now, without blocking.
    pub fn is_readable(&self) -> bool {
        self.poll(Direction::Read, Duration::ZERO).unwrap_or(false)
    }

    pub fn shutdown(&self) {
        let result = match self {
            Channel::Stream(s) => s.shutdown(Shutdown::Both),
            // Nothing to tell the peer at the socket level.
            Channel::Datagram(_) => Ok(()),
        };
        if let Err(e) = result {
            if e.kind() != io::ErrorKind::NotConnected {
                debug!("Socket shutdown failed: {}", e);
            }
        }
    }
}

impl AsFd for Channel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Channel::Stream(s) => s.as_fd(),
            Channel::Datagram(d) => d.socket.as_fd(),
        }
    }
}

/// Read/Write adapter handed to the crypto session.
pub(crate) struct Link(pub Arc<Channel>);

impl Read for Link {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.recv(buf)
    }
}

impl Write for Link {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.send(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn pair() -> (Arc<Channel>, UdpSocket) {
        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").unwrap();
        a.connect(b.local_addr().unwrap()).unwrap();
        b.connect(a.local_addr().unwrap()).unwrap();
        (Arc::new(Channel::datagram(a).unwrap()), b)
    }

    #[test]
    fn injected_before_socket() {
        let (channel, peer) = pair();
        peer.send(b"wire").unwrap();
        channel.inject(b"first".to_vec());

        assert!(channel.has_pending());
        assert!(channel.is_readable());

        let mut link = Link(channel.clone());
        let mut buf = [0_u8; 64];
        let n = link.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"first");
        assert!(!channel.has_pending());

        assert!(channel.poll(Direction::Read, Duration::from_secs(2)).unwrap());
        let n = link.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"wire");
    }

    #[test]
    fn discards_outgoing() {
        let (channel, peer) = pair();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        channel.discard_next(1);

        let mut link = Link(channel);
        assert_eq!(link.write(b"gone").unwrap(), 4);
        assert_eq!(link.write(b"kept").unwrap(), 4);

        let mut buf = [0_u8; 64];
        let n = peer.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"kept");
    }

    #[test]
    fn empty_socket_would_block() {
        let (channel, _peer) = pair();
        let mut link = Link(channel);
        let mut buf = [0_u8; 64];
        let err = link.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
