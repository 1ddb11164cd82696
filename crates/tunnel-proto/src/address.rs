//! Destination address type and its wire encoding.
//!
//! Wire form: `ALEN(1) || HOST(ALEN) || PORT(2 big-endian)`. For `IPv4`/`IPv6`
//! variants `HOST` is the textual presentation form of the address, not a
//! packed numeric form — the address kind is a construction-time hint used by
//! callers to decide how to dial, not a byte placed on the wire (there is no
//! `ATYP` field here, unlike SOCKS5/shadowsocks-style address headers).

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::ProtoError;

/// Discriminates the presentation form of [`Address::host`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    V4,
    V6,
    Domain,
}

/// A destination address: host text plus port, with a kind hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    kind: AddressKind,
    host: String,
    port: u16,
}

impl Address {
    pub fn domain(host: impl Into<String>, port: u16) -> Self {
        Address {
            kind: AddressKind::Domain,
            host: host.into(),
            port,
        }
    }

    pub fn ip(addr: IpAddr, port: u16) -> Self {
        let kind = match addr {
            IpAddr::V4(_) => AddressKind::V4,
            IpAddr::V6(_) => AddressKind::V6,
        };
        Address {
            kind,
            host: addr.to_string(),
            port,
        }
    }

    pub fn v4(addr: Ipv4Addr, port: u16) -> Self {
        Address::ip(IpAddr::V4(addr), port)
    }

    pub fn v6(addr: Ipv6Addr, port: u16) -> Self {
        Address::ip(IpAddr::V6(addr), port)
    }

    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Best-effort socket address string for dialing (`host:port`).
    pub fn socket_addr_string(&self) -> String {
        match self.kind {
            AddressKind::V6 => format!("[{}]:{}", self.host, self.port),
            AddressKind::V4 | AddressKind::Domain => format!("{}:{}", self.host, self.port),
        }
    }

    /// Parse the kind from a host string by attempting IP parses, falling
    /// back to `Domain`. Used when reconstructing an `Address` from the wire,
    /// where the kind byte is not present.
    pub fn from_host_port(host: String, port: u16) -> Self {
        let kind = if host.parse::<Ipv4Addr>().is_ok() {
            AddressKind::V4
        } else if host.parse::<Ipv6Addr>().is_ok() {
            AddressKind::V6
        } else {
            AddressKind::Domain
        };
        Address { kind, host, port }
    }

    /// Encode as `ALEN || HOST || PORT` and append to `out`.
    pub fn encode_to(&self, out: &mut BytesMut) -> Result<(), ProtoError> {
        let host_bytes = self.host.as_bytes();
        if host_bytes.is_empty() {
            return Err(ProtoError::InvalidAddress("ALEN = 0 is not allowed"));
        }
        let alen = u8::try_from(host_bytes.len())
            .map_err(|_| ProtoError::InvalidAddress("host text exceeds 255 bytes"))?;
        out.put_u8(alen);
        out.extend_from_slice(host_bytes);
        out.put_u16(self.port);
        Ok(())
    }

    /// Encode as a standalone `Bytes` value.
    pub fn encode(&self) -> Result<Bytes, ProtoError> {
        let mut buf = BytesMut::with_capacity(1 + self.host.len() + 2);
        self.encode_to(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Parse `ALEN || HOST || PORT` from the front of `buf`, advancing it
    /// past the consumed bytes. `buf` may contain trailing payload bytes.
    pub fn decode_from(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        if !buf.has_remaining() {
            return Err(ProtoError::ShortAddress);
        }
        let alen = buf.get_u8();
        if alen == 0 {
            return Err(ProtoError::InvalidAddress("ALEN = 0 is not allowed"));
        }
        let alen = alen as usize;
        if buf.remaining() < alen + 2 {
            return Err(ProtoError::ShortAddress);
        }
        let mut host_bytes = vec![0u8; alen];
        buf.copy_to_slice(&mut host_bytes);
        let host = String::from_utf8(host_bytes)
            .map_err(|_| ProtoError::InvalidAddress("host is not valid UTF-8"))?;
        let port = buf.get_u16();
        Ok(Address::from_host_port(host, port))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr_string())
    }
}
