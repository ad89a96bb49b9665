//! Just enough DTLS wire format for a stateless cookie exchange.
//!
//! The listening socket of a datagram server sees the first flight of every
//! peer. It parses the ClientHello, answers a missing or stale cookie with a
//! HelloVerifyRequest, and only when a hello carries a valid cookie does it
//! allocate a session. That session then needs to see the exchange as if it
//! had taken part in it, which is what [`ClientHello::serialize`] is for.

use nom::bytes::complete::take;
use nom::error::{Error, ErrorKind};
use nom::number::complete::{be_u16, be_u24, be_u8};
use nom::{Err, IResult};

/// DTLS record header length: content_type(1) + version(2) + epoch(2) + seq(6) + length(2)
pub const RECORD_HEADER_LEN: usize = 13;

/// DTLS handshake header length: type(1) + length(3) + seq(2) + offset(3) + fragment length(3)
pub const HANDSHAKE_HEADER_LEN: usize = 12;

const CONTENT_HANDSHAKE: u8 = 22;
const CLIENT_HELLO: u8 = 1;
const HELLO_VERIFY_REQUEST: u8 = 3;

pub const DTLS1_0: u16 = 0xFEFF;
pub const DTLS1_2: u16 = 0xFEFD;

const MAX_COOKIE_LEN: usize = 255;

/// The record and handshake headers of a ClientHello.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub record_version: u16,
    pub epoch: u16,
    pub record_seq: u64,
    pub message_seq: u16,
}

/// An unfragmented DTLS ClientHello, borrowed from the datagram it came in.
#[derive(Debug, PartialEq, Eq)]
pub struct ClientHello<'a> {
    pub header: Header,
    pub client_version: u16,
    pub random: &'a [u8],
    pub session_id: &'a [u8],
    pub cookie: &'a [u8],
    /// Cipher suites, compression methods and extensions, as sent.
    pub tail: &'a [u8],
}

impl<'a> ClientHello<'a> {
    /// Parse the first record of a datagram as a ClientHello.
    ///
    /// Anything else, including a fragmented ClientHello, is an error.
    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], ClientHello<'a>> {
        let (input, content_type) = be_u8(input)?;
        if content_type != CONTENT_HANDSHAKE {
            return Err(Err::Error(Error::new(input, ErrorKind::Tag)));
        }

        let (input, record_version) = be_u16(input)?;
        if record_version != DTLS1_0 && record_version != DTLS1_2 {
            return Err(Err::Error(Error::new(input, ErrorKind::Tag)));
        }

        let (input, epoch) = be_u16(input)?;
        if epoch != 0 {
            return Err(Err::Error(Error::new(input, ErrorKind::Verify)));
        }

        let (input, record_seq) = be_u48(input)?;
        let (input, record_length) = be_u16(input)?;
        let (rest, fragment) = take(record_length as usize)(input)?;

        let (fragment, msg_type) = be_u8(fragment)?;
        if msg_type != CLIENT_HELLO {
            return Err(Err::Error(Error::new(fragment, ErrorKind::Tag)));
        }
        let (fragment, length) = be_u24(fragment)?;
        let (fragment, message_seq) = be_u16(fragment)?;
        let (fragment, fragment_offset) = be_u24(fragment)?;
        let (fragment, fragment_length) = be_u24(fragment)?;
        if fragment_offset != 0 || fragment_length != length {
            return Err(Err::Error(Error::new(fragment, ErrorKind::LengthValue)));
        }

        let (_, body) = take(length as usize)(fragment)?;

        let (body, client_version) = be_u16(body)?;
        let (body, random) = take(32_usize)(body)?;
        let (body, session_id_len) = be_u8(body)?;
        if session_id_len > 32 {
            return Err(Err::Failure(Error::new(body, ErrorKind::LengthValue)));
        }
        let (body, session_id) = take(session_id_len as usize)(body)?;
        let (body, cookie_len) = be_u8(body)?;
        let (tail, cookie) = take(cookie_len as usize)(body)?;

        // At least one cipher suite and one compression method.
        if tail.len() < 4 {
            return Err(Err::Failure(Error::new(tail, ErrorKind::Eof)));
        }

        Ok((
            rest,
            ClientHello {
                header: Header {
                    record_version,
                    epoch,
                    record_seq,
                    message_seq,
                },
                client_version,
                random,
                session_id,
                cookie,
                tail,
            },
        ))
    }

    /// Write this hello as a complete record, with a different cookie and
    /// sequence numbers.
    pub fn serialize(&self, cookie: &[u8], message_seq: u16, record_seq: u64) -> Vec<u8> {
        assert!(cookie.len() <= MAX_COOKIE_LEN);

        let mut body = Vec::with_capacity(
            2 + 32 + 2 + self.session_id.len() + cookie.len() + self.tail.len(),
        );
        body.extend_from_slice(&self.client_version.to_be_bytes());
        body.extend_from_slice(self.random);
        body.push(self.session_id.len() as u8);
        body.extend_from_slice(self.session_id);
        body.push(cookie.len() as u8);
        body.extend_from_slice(cookie);
        body.extend_from_slice(self.tail);

        let mut out = Vec::with_capacity(RECORD_HEADER_LEN + HANDSHAKE_HEADER_LEN + body.len());
        record_header(
            &mut out,
            self.header.record_version,
            record_seq,
            HANDSHAKE_HEADER_LEN + body.len(),
        );
        handshake_header(&mut out, CLIENT_HELLO, message_seq, body.len());
        out.extend_from_slice(&body);
        out
    }
}

/// A HelloVerifyRequest answering `hello`, as a complete record.
///
/// The record and message sequence numbers mirror the hello so the reply
/// needs no state.
pub fn hello_verify_request(hello: &ClientHello, cookie: &[u8]) -> Vec<u8> {
    assert!(cookie.len() <= MAX_COOKIE_LEN);

    let body_len = 2 + 1 + cookie.len();
    let mut out = Vec::with_capacity(RECORD_HEADER_LEN + HANDSHAKE_HEADER_LEN + body_len);
    record_header(
        &mut out,
        DTLS1_0,
        hello.header.record_seq,
        HANDSHAKE_HEADER_LEN + body_len,
    );
    handshake_header(&mut out, HELLO_VERIFY_REQUEST, hello.header.message_seq, body_len);
    // Always DTLS 1.0 here, whatever version gets negotiated later.
    out.extend_from_slice(&DTLS1_0.to_be_bytes());
    out.push(cookie.len() as u8);
    out.extend_from_slice(cookie);
    out
}

fn record_header(out: &mut Vec<u8>, version: u16, seq: u64, length: usize) {
    out.push(CONTENT_HANDSHAKE);
    out.extend_from_slice(&version.to_be_bytes());
    // epoch
    out.extend_from_slice(&0_u16.to_be_bytes());
    out.extend_from_slice(&seq.to_be_bytes()[2..]);
    out.extend_from_slice(&(length as u16).to_be_bytes());
}

fn handshake_header(out: &mut Vec<u8>, msg_type: u8, message_seq: u16, length: usize) {
    let length = (length as u32).to_be_bytes();
    out.push(msg_type);
    out.extend_from_slice(&length[1..]);
    out.extend_from_slice(&message_seq.to_be_bytes());
    // fragment offset
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&length[1..]);
}

fn be_u48(input: &[u8]) -> IResult<&[u8], u64> {
    let (input, bytes) = take(6_usize)(input)?;
    let value = bytes.iter().fold(0_u64, |acc, b| (acc << 8) | *b as u64);
    Ok((input, value))
}
