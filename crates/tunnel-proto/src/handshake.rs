//! The `exp-base-auth-stream` first-chunk frame: address delivery, HMAC
//! authentication, and stream cipher handshake folded into one write.
//!
//! Wire form of the frame header (everything before free-running ciphertext):
//!
//! ```text
//! IV(16) || HMAC-SHA1(16) || ALEN(1) || DST.ADDR(ALEN) || DST.PORT(2)
//! ```
//!
//! The HMAC authenticates the header only (`IV` plus the encrypted
//! `ALEN||ADDR||PORT` region), not the application bytes that may follow in
//! the same write — those are ordinary stream-cipher payload, decrypted with
//! the continuing keystream rather than carried under this frame's MAC. This
//! keeps the header's size bounded and decodable from a prefix of the
//! connection's bytes regardless of how much application data happened to be
//! buffered in the client's first write.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use subtle::ConstantTimeEq;

use crate::address::Address;
use crate::cipher::{evp_bytes_to_key, CipherMethod, CipherPair, StreamState, IV_LEN};
use crate::ProtoError;

type HmacSha1 = Hmac<Sha1>;

const MAC_LEN: usize = 16;

/// Smallest possible full handshake chunk: IV + MAC + ALEN + 1-byte host +
/// PORT + at least 1 byte of leading application data.
const MIN_HEADER_LEN: usize = IV_LEN + MAC_LEN + 1 + 1 + 2 + 1;

/// `HMAC-SHA1(k, ciphertext)[0..16]` — the tag covers the encrypted address
/// header only, not the IV that precedes it on the wire.
fn truncated_mac(key: &[u8], ciphertext: &[u8]) -> [u8; MAC_LEN] {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(ciphertext);
    let full = mac.finalize().into_bytes();
    let mut out = [0u8; MAC_LEN];
    out.copy_from_slice(&full[..MAC_LEN]);
    out
}

/// Builds the first forward chunk on the client side: address delivery,
/// authentication, and the opening bytes of application data in one frame.
pub struct ClientHello {
    pub frame: Bytes,
    /// Cipher pair seeded with the same `(method, key, iv)` used for the
    /// header, ready to continue encrypting/decrypting this connection's
    /// ongoing stream.
    pub cipher_pair: CipherPair,
}

impl ClientHello {
    pub fn build(
        method: CipherMethod,
        passphrase: &[u8],
        dst: &Address,
        leading_data: &[u8],
    ) -> Result<Self, ProtoError> {
        if leading_data.is_empty() {
            return Err(ProtoError::HandshakeNeedsData);
        }

        let mut iv = vec![0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let key = evp_bytes_to_key(passphrase, method.key_len(), IV_LEN);

        let mut header_plain = BytesMut::new();
        dst.encode_to(&mut header_plain)?;
        let mut header_cipher = header_plain.to_vec();

        let mut header_state = StreamState::new_encrypt(method, &key, &iv);
        header_state.apply(&mut header_cipher);

        let mac = truncated_mac(&key, &header_cipher);

        let mut cipher_pair = CipherPair::new(method, &key, &iv);
        // Re-derive the header's position in the shared keystream: the pair
        // above starts a fresh encryptor, but the header was already
        // consumed from `header_state`. Replace the pair's encryptor with
        // the one that has advanced past the header so the keystream used
        // for `leading_data` and beyond continues seamlessly.
        let mut leading_cipher = leading_data.to_vec();
        header_state.apply(&mut leading_cipher);
        cipher_pair.replace_encryptor(header_state);

        let mut frame = BytesMut::with_capacity(
            IV_LEN + MAC_LEN + header_cipher.len() + leading_cipher.len(),
        );
        frame.extend_from_slice(&iv);
        frame.extend_from_slice(&mac);
        frame.extend_from_slice(&header_cipher);
        frame.extend_from_slice(&leading_cipher);

        Ok(ClientHello {
            frame: frame.freeze(),
            cipher_pair,
        })
    }
}

/// Outcome of attempting to decode a handshake header from buffered bytes.
pub enum HeaderDecode {
    /// Not enough bytes yet; buffer and wait for more.
    NeedMore,
    /// Header parsed and authenticated. `trailing` is any application bytes
    /// that followed the header in the same buffered chunk, already
    /// decrypted. `cipher_pair` continues the keystream for later reads.
    Parsed {
        dst: Address,
        trailing: Bytes,
        cipher_pair: CipherPair,
        consumed: usize,
    },
}

/// Server-side reception of a `ClientHello` frame from a growing buffer.
///
/// Buffer semantics: `buf` is not consumed on `NeedMore`; the caller should
/// keep appending newly read bytes and retry. On `Parsed`, `consumed` bytes
/// should be dropped from the front of `buf`.
pub fn decode_header(
    method: CipherMethod,
    passphrase: &[u8],
    buf: &[u8],
) -> Result<HeaderDecode, ProtoError> {
    if buf.len() < MIN_HEADER_LEN {
        return Ok(HeaderDecode::NeedMore);
    }

    let iv = &buf[..IV_LEN];
    let received_mac = &buf[IV_LEN..IV_LEN + MAC_LEN];
    let rest = &buf[IV_LEN + MAC_LEN..];

    let alen = rest[0] as usize;
    if alen == 0 {
        return Err(ProtoError::InvalidAddress("ALEN = 0 is not allowed"));
    }
    let header_ciphertext_len = 1 + alen + 2;
    // Require at least one trailing byte of application data past the
    // header, per the protocol's handshake-frame minimum.
    if rest.len() < header_ciphertext_len + 1 {
        return Ok(HeaderDecode::NeedMore);
    }

    let key = evp_bytes_to_key(passphrase, method.key_len(), IV_LEN);
    let header_ciphertext = &rest[..header_ciphertext_len];

    let expected_mac = truncated_mac(&key, header_ciphertext);
    if expected_mac.ct_eq(received_mac).unwrap_u8() != 1 {
        return Err(ProtoError::BadHmac);
    }

    let mut header_state = StreamState::new_decrypt(method, &key, iv);
    let mut header_plain = header_ciphertext.to_vec();
    header_state.apply(&mut header_plain);

    let mut header_plain_buf = header_plain.as_slice();
    let dst = Address::decode_from(&mut header_plain_buf)?;

    let consumed_header = IV_LEN + MAC_LEN + header_ciphertext_len;
    let trailing_ciphertext = &buf[consumed_header..];
    let mut trailing_plain = trailing_ciphertext.to_vec();
    header_state.apply(&mut trailing_plain);

    let mut cipher_pair = CipherPair::new(method, &key, iv);
    cipher_pair.replace_decryptor(header_state);

    Ok(HeaderDecode::Parsed {
        dst,
        trailing: Bytes::from(trailing_plain),
        cipher_pair,
        consumed: buf.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const KEY: &[u8] = b"correct horse battery staple";

    #[test]
    fn round_trips_address_and_leading_data() {
        let dst = Address::v4(Ipv4Addr::new(10, 0, 0, 1), 8080);
        let hello = ClientHello::build(CipherMethod::Aes256Ctr, KEY, &dst, b"GET / HTTP/1.1\r\n")
            .unwrap();

        match decode_header(CipherMethod::Aes256Ctr, KEY, &hello.frame).unwrap() {
            HeaderDecode::Parsed { dst: got, trailing, .. } => {
                assert_eq!(got.host(), "10.0.0.1");
                assert_eq!(got.port(), 8080);
                assert_eq!(&trailing[..], b"GET / HTTP/1.1\r\n");
            }
            HeaderDecode::NeedMore => panic!("expected a parsed header"),
        }
    }

    #[test]
    fn keystream_continues_from_handshake_into_later_reads() {
        let dst = Address::domain("example.com", 443);
        let mut hello = ClientHello::build(CipherMethod::Aes128Cfb, KEY, &dst, b"abc").unwrap();

        let next_plain = b"more-client-bytes";
        let next_cipher = hello.cipher_pair.encrypt_to_vec(next_plain);

        match decode_header(CipherMethod::Aes128Cfb, KEY, &hello.frame).unwrap() {
            HeaderDecode::Parsed { mut cipher_pair, .. } => {
                let decoded = cipher_pair.decrypt_to_vec(&next_cipher);
                assert_eq!(decoded, next_plain);
            }
            HeaderDecode::NeedMore => panic!("expected a parsed header"),
        }
    }

    #[test]
    fn needs_more_on_truncated_frame() {
        let dst = Address::domain("example.com", 443);
        let hello = ClientHello::build(CipherMethod::Aes256Ctr, KEY, &dst, b"x").unwrap();
        let partial = &hello.frame[..MIN_HEADER_LEN - 1];
        matches!(
            decode_header(CipherMethod::Aes256Ctr, KEY, partial).unwrap(),
            HeaderDecode::NeedMore
        );
    }

    #[test]
    fn fragmented_reads_eventually_parse() {
        let dst = Address::domain("example.com", 443);
        let hello = ClientHello::build(CipherMethod::Aes256Ctr, KEY, &dst, b"payload").unwrap();

        let mut buffered = Vec::new();
        for byte in hello.frame.iter() {
            buffered.push(*byte);
            match decode_header(CipherMethod::Aes256Ctr, KEY, &buffered).unwrap() {
                HeaderDecode::NeedMore => continue,
                HeaderDecode::Parsed { trailing, .. } => {
                    assert_eq!(&trailing[..], b"payload");
                    return;
                }
            }
        }
        panic!("never parsed a full header");
    }

    #[test]
    fn rejects_flipped_mac_bit() {
        let dst = Address::domain("example.com", 443);
        let hello = ClientHello::build(CipherMethod::Aes256Ctr, KEY, &dst, b"x").unwrap();
        let mut tampered = hello.frame.to_vec();
        tampered[IV_LEN] ^= 0x01; // flip a bit inside the MAC
        let err = decode_header(CipherMethod::Aes256Ctr, KEY, &tampered).unwrap_err();
        assert!(matches!(err, ProtoError::BadHmac));
    }

    #[test]
    fn rejects_alen_zero_in_header() {
        let dst = Address::domain("example.com", 443);
        let hello = ClientHello::build(CipherMethod::Aes256Ctr, KEY, &dst, b"x").unwrap();
        let mut tampered = hello.frame.to_vec();
        // Corrupting ALEN invalidates the MAC first; confirm that failure
        // mode is BadHmac, not a panic, even though ALEN itself is also bad.
        tampered[IV_LEN + MAC_LEN] = 0;
        let err = decode_header(CipherMethod::Aes256Ctr, KEY, &tampered).unwrap_err();
        assert!(matches!(err, ProtoError::BadHmac));
    }

    #[test]
    fn rejects_empty_leading_data() {
        let dst = Address::domain("example.com", 443);
        let err = ClientHello::build(CipherMethod::Aes256Ctr, KEY, &dst, b"").unwrap_err();
        assert!(matches!(err, ProtoError::HandshakeNeedsData));
    }
}
