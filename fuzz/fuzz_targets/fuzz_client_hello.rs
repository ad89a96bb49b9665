#![no_main]

//! Fuzz target for the ClientHello parser on the listening socket.
//!
//! Any datagram can reach it from an unauthenticated peer. Whatever parses
//! must also survive being rebuilt with a cookie and answered with a
//! HelloVerifyRequest.

use libfuzzer_sys::fuzz_target;

use seclink::cookie;
use seclink::hello::{self, ClientHello, RECORD_HEADER_LEN};

/// Largest plaintext record.
const MAX_RECORD: usize = 16384;

fuzz_target!(|data: &[u8]| {
    // A rebuilt hello with a longer cookie must still fit a record.
    if data.len() > MAX_RECORD {
        return;
    }

    let Ok((_, hello)) = ClientHello::parse(data) else {
        return;
    };

    let peer = "192.0.2.1:4433".parse().unwrap();
    let token = cookie::generate(peer);

    let reply = hello::hello_verify_request(&hello, &token);
    assert!(reply.len() > RECORD_HEADER_LEN);

    // Rebuilt with a cookie, it parses again to the same hello.
    let rebuilt = hello.serialize(&token, 1, 1);
    let (_, again) = ClientHello::parse(&rebuilt).expect("rebuilt hello parses");
    assert_eq!(again.cookie, &token[..]);
    assert_eq!(again.random, hello.random);
    assert_eq!(again.tail, hello.tail);
    assert!(cookie::verify(peer, again.cookie));
});
