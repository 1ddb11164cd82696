//! Wire-level building blocks shared by the tunnel presets: destination
//! addresses, stream cipher methods, and the `exp-base-auth-stream`
//! handshake header.

pub mod address;
pub mod cipher;
pub mod handshake;

pub use address::{Address, AddressKind};
pub use cipher::{evp_bytes_to_key, CipherMethod, CipherPair};
pub use handshake::{decode_header, ClientHello, HeaderDecode};

use thiserror::Error;

/// Errors produced while encoding or decoding wire structures in this crate.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("invalid address: {0}")]
    InvalidAddress(&'static str),

    #[error("buffer too short to contain an address")]
    ShortAddress,

    #[error("unknown cipher method: {0}")]
    UnknownMethod(String),

    #[error("handshake HMAC verification failed")]
    BadHmac,

    #[error("handshake frame must carry at least one byte of leading application data")]
    HandshakeNeedsData,
}
