//! A plain TCP server that echoes back whatever it receives, used as the
//! stand-in "destination" a relay connects to in integration tests.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, warn};

/// A running mock destination. Dropping this does not stop the listener;
/// call [`MockEchoServer::shutdown`] explicitly.
pub struct MockEchoServer {
    addr: SocketAddr,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
}

impl MockEchoServer {
    /// Bind on an OS-assigned loopback port and start echoing connections.
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() { break; }
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                debug!(?peer, "mock echo server accepted connection");
                                tokio::spawn(echo(stream));
                            }
                            Err(e) => warn!(error = %e, "mock echo server accept error"),
                        }
                    }
                }
            }
        });

        Ok(MockEchoServer { addr, shutdown_tx })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn echo(mut stream: tokio::net::TcpStream) {
    let mut buf = vec![0u8; 8192];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if stream.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn echoes_bytes_back() {
        let server = MockEchoServer::start().await.unwrap();
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client.write_all(b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        server.shutdown();
    }
}
