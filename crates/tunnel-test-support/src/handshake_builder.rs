//! Helpers for building raw `exp-base-auth-stream` handshake frames, for
//! tests that drive a relay over a real TCP socket rather than through the
//! preset API directly.

use bytes::Bytes;
use tunnel_proto::{Address, CipherMethod, ClientHello};

/// Build the bytes a client would send as its first write: handshake header
/// plus `leading_data`, encrypted and authenticated under `method`/`key`.
pub fn build_handshake_frame(
    method: CipherMethod,
    key: &[u8],
    dst: &Address,
    leading_data: &[u8],
) -> Bytes {
    ClientHello::build(method, key, dst, leading_data)
        .expect("test-provided handshake parameters should always be valid")
        .frame
}
