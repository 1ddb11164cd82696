//! The `exp-base-auth-stream` preset: address delivery, HMAC authentication,
//! and stream encryption folded into the first forward chunk.
//!
//! Wire semantics live in `tunnel_proto::handshake`; this module only adapts
//! that header codec to the `Preset` contract — buffering fragmented
//! handshakes on the server side, and building the one-shot hello frame on
//! the client side.

use bytes::{Bytes, BytesMut};
use tracing::debug;
use tunnel_core::pipeline::{Preset, PresetOutcome};
use tunnel_proto::{decode_header, Address, CipherMethod, CipherPair, ClientHello, HeaderDecode, ProtoError};

enum ClientState {
    AwaitingFirstChunk { dst: Address },
    Streaming { cipher_pair: CipherPair },
}

/// Client-side half: wraps the first forward chunk as a `ClientHello` frame,
/// encrypts everything after.
pub struct ExpBaseAuthStreamClient {
    method: CipherMethod,
    passphrase: Vec<u8>,
    state: ClientState,
}

impl ExpBaseAuthStreamClient {
    pub fn new(method: CipherMethod, passphrase: impl Into<Vec<u8>>, dst: Address) -> Self {
        ExpBaseAuthStreamClient {
            method,
            passphrase: passphrase.into(),
            state: ClientState::AwaitingFirstChunk { dst },
        }
    }
}

impl Preset for ExpBaseAuthStreamClient {
    fn client_out(&mut self, chunk: Bytes) -> PresetOutcome {
        match &mut self.state {
            ClientState::AwaitingFirstChunk { dst } => {
                match ClientHello::build(self.method, &self.passphrase, dst, &chunk) {
                    Ok(hello) => {
                        self.state = ClientState::Streaming {
                            cipher_pair: hello.cipher_pair,
                        };
                        PresetOutcome::Continue(hello.frame)
                    }
                    Err(e) => PresetOutcome::Fail(e.to_string()),
                }
            }
            ClientState::Streaming { cipher_pair } => {
                PresetOutcome::Continue(Bytes::from(cipher_pair.encrypt_to_vec(&chunk)))
            }
        }
    }

    fn client_in(&mut self, chunk: Bytes) -> PresetOutcome {
        match &mut self.state {
            ClientState::Streaming { cipher_pair } => {
                PresetOutcome::Continue(Bytes::from(cipher_pair.decrypt_to_vec(&chunk)))
            }
            ClientState::AwaitingFirstChunk { .. } => {
                PresetOutcome::Fail("received server bytes before handshake was sent".to_owned())
            }
        }
    }

    fn handshake_done(&self) -> bool {
        matches!(self.state, ClientState::Streaming { .. })
    }
}

enum ServerState {
    Buffering(BytesMut),
    Streaming {
        cipher_pair: CipherPair,
        pending_release: Option<Bytes>,
    },
}

/// Server-side half: buffers inbound bytes until a full handshake header is
/// available, then emits `ConnectToDst` and switches to plain stream
/// decryption for everything after.
pub struct ExpBaseAuthStreamServer {
    method: CipherMethod,
    passphrase: Vec<u8>,
    state: ServerState,
}

impl ExpBaseAuthStreamServer {
    pub fn new(method: CipherMethod, passphrase: impl Into<Vec<u8>>) -> Self {
        ExpBaseAuthStreamServer {
            method,
            passphrase: passphrase.into(),
            state: ServerState::Buffering(BytesMut::new()),
        }
    }
}

impl Preset for ExpBaseAuthStreamServer {
    fn server_in(&mut self, chunk: Bytes) -> PresetOutcome {
        match &mut self.state {
            ServerState::Buffering(buf) => {
                buf.extend_from_slice(&chunk);
                match decode_header(self.method, &self.passphrase, &buf[..]) {
                    Ok(HeaderDecode::NeedMore) => PresetOutcome::Swallow,
                    Ok(HeaderDecode::Parsed {
                        dst,
                        trailing,
                        cipher_pair,
                        ..
                    }) => {
                        debug!(dst = %dst, "handshake parsed");
                        self.state = ServerState::Streaming {
                            cipher_pair,
                            pending_release: Some(trailing),
                        };
                        PresetOutcome::ConnectToDst(dst)
                    }
                    Err(ProtoError::BadHmac) => PresetOutcome::Fail("bad HMAC".to_owned()),
                    Err(e) => PresetOutcome::Fail(e.to_string()),
                }
            }
            ServerState::Streaming { cipher_pair, .. } => {
                PresetOutcome::Continue(Bytes::from(cipher_pair.decrypt_to_vec(&chunk)))
            }
        }
    }

    fn server_out(&mut self, chunk: Bytes) -> PresetOutcome {
        match &mut self.state {
            ServerState::Streaming { cipher_pair, .. } => {
                PresetOutcome::Continue(Bytes::from(cipher_pair.encrypt_to_vec(&chunk)))
            }
            ServerState::Buffering(_) => {
                PresetOutcome::Fail("attempted to reply before handshake completed".to_owned())
            }
        }
    }

    fn on_connected(&mut self) -> Bytes {
        match &mut self.state {
            ServerState::Streaming { pending_release, .. } => {
                pending_release.take().unwrap_or_default()
            }
            ServerState::Buffering(_) => Bytes::new(),
        }
    }

    fn handshake_done(&self) -> bool {
        matches!(self.state, ServerState::Streaming { .. })
    }
}

/// The two roles this preset can be constructed as, kept as one enum so a
/// single config-driven factory can build either side.
pub enum ExpBaseAuthStream {
    Client(ExpBaseAuthStreamClient),
    Server(ExpBaseAuthStreamServer),
}

impl ExpBaseAuthStream {
    pub fn client(method: CipherMethod, passphrase: impl Into<Vec<u8>>, dst: Address) -> Self {
        ExpBaseAuthStream::Client(ExpBaseAuthStreamClient::new(method, passphrase, dst))
    }

    pub fn server(method: CipherMethod, passphrase: impl Into<Vec<u8>>) -> Self {
        ExpBaseAuthStream::Server(ExpBaseAuthStreamServer::new(method, passphrase))
    }
}

impl Preset for ExpBaseAuthStream {
    fn client_out(&mut self, chunk: Bytes) -> PresetOutcome {
        match self {
            ExpBaseAuthStream::Client(c) => c.client_out(chunk),
            ExpBaseAuthStream::Server(_) => PresetOutcome::Continue(chunk),
        }
    }

    fn client_in(&mut self, chunk: Bytes) -> PresetOutcome {
        match self {
            ExpBaseAuthStream::Client(c) => c.client_in(chunk),
            ExpBaseAuthStream::Server(_) => PresetOutcome::Continue(chunk),
        }
    }

    fn server_in(&mut self, chunk: Bytes) -> PresetOutcome {
        match self {
            ExpBaseAuthStream::Server(s) => s.server_in(chunk),
            ExpBaseAuthStream::Client(_) => PresetOutcome::Continue(chunk),
        }
    }

    fn server_out(&mut self, chunk: Bytes) -> PresetOutcome {
        match self {
            ExpBaseAuthStream::Server(s) => s.server_out(chunk),
            ExpBaseAuthStream::Client(_) => PresetOutcome::Continue(chunk),
        }
    }

    fn on_connected(&mut self) -> Bytes {
        match self {
            ExpBaseAuthStream::Server(s) => s.on_connected(),
            ExpBaseAuthStream::Client(c) => c.on_connected(),
        }
    }

    fn handshake_done(&self) -> bool {
        match self {
            ExpBaseAuthStream::Client(c) => c.handshake_done(),
            ExpBaseAuthStream::Server(s) => s.handshake_done(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tunnel_core::pipeline::{Pipeline, Role};

    const KEY: &[u8] = b"shared secret";

    #[test]
    fn client_then_server_round_trip_handshake_and_payload() {
        let dst = Address::v4(Ipv4Addr::new(93, 184, 216, 34), 80);
        let mut client = Pipeline::new(
            Role::Client,
            vec![Box::new(ExpBaseAuthStream::client(
                CipherMethod::Aes256Ctr,
                KEY,
                dst.clone(),
            ))],
        );
        let mut server = Pipeline::new(
            Role::Server,
            vec![Box::new(ExpBaseAuthStream::server(CipherMethod::Aes256Ctr, KEY))],
        );

        let hello = match client.forward(Bytes::from_static(b"GET / HTTP/1.1\r\n")) {
            PresetOutcome::Continue(b) => b,
            _ => panic!("expected continue"),
        };

        match server.forward(hello) {
            PresetOutcome::ConnectToDst(addr) => assert_eq!(addr, dst),
            _ => panic!("expected connect-to-dst"),
        }
        let released = server.on_connected();
        assert_eq!(&released[..], b"GET / HTTP/1.1\r\n");

        let more_client = match client.forward(Bytes::from_static(b"more request bytes")) {
            PresetOutcome::Continue(b) => b,
            _ => panic!("expected continue"),
        };
        match server.forward(more_client) {
            PresetOutcome::Continue(b) => assert_eq!(&b[..], b"more request bytes"),
            _ => panic!("expected continue"),
        }

        let server_reply = match server.backward(Bytes::from_static(b"HTTP/1.1 200 OK\r\n")) {
            PresetOutcome::Continue(b) => b,
            _ => panic!("expected continue"),
        };
        match client.backward(server_reply) {
            PresetOutcome::Continue(b) => assert_eq!(&b[..], b"HTTP/1.1 200 OK\r\n"),
            _ => panic!("expected continue"),
        }
    }

    #[test]
    fn server_buffers_fragmented_handshake() {
        let dst = Address::domain("example.com", 443);
        let mut client = Pipeline::new(
            Role::Client,
            vec![Box::new(ExpBaseAuthStream::client(
                CipherMethod::Aes128Cfb,
                KEY,
                dst.clone(),
            ))],
        );
        let mut server = Pipeline::new(
            Role::Server,
            vec![Box::new(ExpBaseAuthStream::server(CipherMethod::Aes128Cfb, KEY))],
        );

        let hello = match client.forward(Bytes::from_static(b"payload")) {
            PresetOutcome::Continue(b) => b,
            _ => panic!("expected continue"),
        };

        let (first, second) = hello.split_at(hello.len() / 2);
        match server.forward(Bytes::copy_from_slice(first)) {
            PresetOutcome::Swallow => {}
            _ => panic!("expected swallow on partial header"),
        }
        match server.forward(Bytes::copy_from_slice(second)) {
            PresetOutcome::ConnectToDst(addr) => assert_eq!(addr, dst),
            _ => panic!("expected connect-to-dst after full header arrives"),
        }
    }

    #[test]
    fn server_rejects_tampered_mac() {
        let dst = Address::domain("example.com", 443);
        let mut client = Pipeline::new(
            Role::Client,
            vec![Box::new(ExpBaseAuthStream::client(
                CipherMethod::Aes256Ctr,
                KEY,
                dst,
            ))],
        );
        let mut server = Pipeline::new(
            Role::Server,
            vec![Box::new(ExpBaseAuthStream::server(CipherMethod::Aes256Ctr, KEY))],
        );

        let hello = match client.forward(Bytes::from_static(b"x")) {
            PresetOutcome::Continue(b) => b,
            _ => panic!("expected continue"),
        };
        let mut tampered = hello.to_vec();
        tampered[20] ^= 0xff;

        match server.forward(Bytes::from(tampered)) {
            PresetOutcome::Fail(reason) => assert!(reason.contains("HMAC")),
            _ => panic!("expected fail on tampered MAC"),
        }
    }
}
