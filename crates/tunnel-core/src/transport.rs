//! Transport endpoints: the byte pipe underneath a relay direction.
//!
//! Two concrete endpoints exist: a plain TCP stream, and an outbound-only
//! HTTP/2 stream used when the client is configured to reach the server
//! through an `h2` session instead of raw TCP. Both are driven through the
//! same small operation set (`read_some`/`write`/`close`) rather than a
//! trait object — there are exactly two concrete shapes and matching on an
//! enum keeps the relay's hot loop allocation-free.

use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use h2::client::SendRequest;
use h2::{RecvStream, SendStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::error::CoreError;

const READ_CHUNK: usize = 16 * 1024;

/// Load a PEM-encoded CA bundle from disk into a `RootCertStore`, for pinning
/// the peer the HTTP/2 transport is willing to trust.
pub fn load_root_store(path: &str) -> Result<RootCertStore, CoreError> {
    let file = std::fs::File::open(path)
        .map_err(|e| CoreError::Transport(format!("reading CA bundle '{path}': {e}")))?;
    let mut reader = std::io::BufReader::new(file);
    let mut store = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| CoreError::Transport(format!("parsing CA bundle '{path}': {e}")))?;
        store
            .add(cert)
            .map_err(|e| CoreError::Transport(format!("invalid CA certificate in '{path}': {e}")))?;
    }
    if store.len() == 0 {
        return Err(CoreError::Transport(format!(
            "CA bundle '{path}' contained no usable certificates"
        )));
    }
    Ok(store)
}

/// Outcome of one `read_some` call.
pub enum ReadOutcome {
    Chunk(Bytes),
    Eof,
}

/// A plain TCP byte pipe. Used for every inbound endpoint, and for outbound
/// endpoints when the peer is reached directly over TCP.
pub struct TcpTransport {
    stream: TcpStream,
    last_io: Instant,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        TcpTransport {
            stream,
            last_io: Instant::now(),
        }
    }

    pub async fn connect(addr: &str) -> Result<Self, CoreError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(TcpTransport::new(stream))
    }

    pub async fn read_some(&mut self) -> Result<ReadOutcome, CoreError> {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let n = self.stream.read_buf(&mut buf).await?;
        self.last_io = Instant::now();
        if n == 0 {
            Ok(ReadOutcome::Eof)
        } else {
            Ok(ReadOutcome::Chunk(buf.freeze()))
        }
    }

    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), CoreError> {
        self.stream.write_all(chunk).await?;
        self.last_io = Instant::now();
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), CoreError> {
        let _ = self.stream.shutdown().await;
        Ok(())
    }

    pub fn last_io(&self) -> Instant {
        self.last_io
    }
}

/// A single HTTP/2 stream over TLS, treated as a TCP-equivalent byte pipe.
/// Outbound only: the client dials the server this way when configured with
/// `transport = "http2"`; ALPN must negotiate `h2` and peer verification
/// uses the pinned root store supplied at construction.
pub struct Http2Transport {
    send: SendStream<Bytes>,
    recv: RecvStream,
    last_io: Instant,
}

impl Http2Transport {
    /// Connect to `host:port` over TLS, negotiate `h2`, open one bidirectional
    /// stream, and return a transport wrapping it. `roots` is the pinned CA
    /// bundle; failure to verify the peer or negotiate `h2` is fatal.
    pub async fn connect(
        host: &str,
        port: u16,
        roots: Arc<RootCertStore>,
    ) -> Result<Self, CoreError> {
        let mut tls_config = ClientConfig::builder()
            .with_root_certificates((*roots).clone())
            .with_no_client_auth();
        tls_config.alpn_protocols = vec![b"h2".to_vec()];
        let connector = TlsConnector::from(Arc::new(tls_config));

        let tcp = TcpStream::connect((host, port)).await?;
        let server_name = ServerName::try_from(host.to_owned())
            .map_err(|_| CoreError::Transport(format!("invalid server name '{host}'")))?;
        let tls: TlsStream<TcpStream> = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| CoreError::Transport(format!("TLS handshake failed: {e}")))?;

        let negotiated_h2 = tls
            .get_ref()
            .1
            .alpn_protocol()
            .map(|p| p == b"h2")
            .unwrap_or(false);
        if !negotiated_h2 {
            return Err(CoreError::Transport(
                "peer did not negotiate h2 over ALPN".to_owned(),
            ));
        }

        let (mut client, connection) = h2::client::handshake(tls)
            .await
            .map_err(|e| CoreError::Transport(format!("h2 handshake failed: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, "h2 connection task ended");
            }
        });

        let request = http::Request::builder()
            .method("CONNECT")
            .uri(format!("https://{host}:{port}/"))
            .body(())
            .map_err(|e| CoreError::Transport(format!("building h2 request: {e}")))?;

        let (response_fut, send) = client
            .ready()
            .await
            .map_err(|e| CoreError::Transport(format!("h2 client not ready: {e}")))
            .and_then(|_| {
                client
                    .send_request(request, false)
                    .map_err(|e| CoreError::Transport(format!("sending h2 request: {e}")))
            })?;

        let response = response_fut
            .await
            .map_err(|e| CoreError::Transport(format!("h2 response failed: {e}")))?;
        let recv = response.into_body();

        Ok(Http2Transport {
            send,
            recv,
            last_io: Instant::now(),
        })
    }

    pub async fn read_some(&mut self) -> Result<ReadOutcome, CoreError> {
        match self.recv.data().await {
            Some(Ok(bytes)) => {
                let _ = self.recv.flow_control().release_capacity(bytes.len());
                self.last_io = Instant::now();
                Ok(ReadOutcome::Chunk(bytes))
            }
            Some(Err(e)) => Err(CoreError::Transport(format!("h2 read error: {e}"))),
            None => Ok(ReadOutcome::Eof),
        }
    }

    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), CoreError> {
        self.send
            .send_data(Bytes::copy_from_slice(chunk), false)
            .map_err(|e| CoreError::Transport(format!("h2 write error: {e}")))?;
        self.last_io = Instant::now();
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), CoreError> {
        self.send
            .send_data(Bytes::new(), true)
            .map_err(|e| CoreError::Transport(format!("h2 close error: {e}")))
    }

    pub fn last_io(&self) -> Instant {
        self.last_io
    }
}

/// Which concrete transport a client instance uses to reach its configured
/// remote server, selected once from `CoreConfig` rather than per-connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Http2,
}

impl TransportKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "tcp" => Some(TransportKind::Tcp),
            "http2" => Some(TransportKind::Http2),
            _ => None,
        }
    }
}

/// Which concrete transport an outbound endpoint uses. Inbound endpoints are
/// always `Tcp` (the Hub only ever accepts plain TCP from local applications).
pub enum Outbound {
    Tcp(TcpTransport),
    Http2(Http2Transport),
}

impl Outbound {
    pub async fn read_some(&mut self) -> Result<ReadOutcome, CoreError> {
        match self {
            Outbound::Tcp(t) => t.read_some().await,
            Outbound::Http2(t) => t.read_some().await,
        }
    }

    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), CoreError> {
        match self {
            Outbound::Tcp(t) => t.write(chunk).await,
            Outbound::Http2(t) => t.write(chunk).await,
        }
    }

    pub async fn close(&mut self) -> Result<(), CoreError> {
        match self {
            Outbound::Tcp(t) => t.close().await,
            Outbound::Http2(t) => t.close().await,
        }
    }

    pub fn last_io(&self) -> Instant {
        match self {
            Outbound::Tcp(t) => t.last_io(),
            Outbound::Http2(t) => t.last_io(),
        }
    }
}
