//! End-to-end scenarios against a real `Hub` bound to `127.0.0.1:0`: echo
//! through a handshake, redirect-on-fail, idle timeout, and a short
//! handshake that never reaches a destination. Bit-flip and fragmented
//! handshake coverage lives at the wire-codec level in `tunnel-proto`'s own
//! test module, where they don't need a live socket.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use tunnel_core::config::CoreConfig;
use tunnel_core::hub::Hub;
use tunnel_core::metrics::Metrics;
use tunnel_core::pipeline::{Pipeline, Role};
use tunnel_core::transport::TransportKind;
use tunnel_presets::ExpBaseAuthStream;
use tunnel_proto::{Address, CipherMethod, ClientHello};
use tunnel_test_support::{build_handshake_frame, MockEchoServer};

const METHOD: CipherMethod = CipherMethod::Aes256Ctr;
const KEY: &[u8] = b"integration test secret";

fn base_config() -> CoreConfig {
    CoreConfig {
        host: "127.0.0.1".to_owned(),
        port: 0,
        key: String::from_utf8(KEY.to_vec()).unwrap(),
        method: METHOD,
        redirect: None,
        target: None,
        servers: Vec::new(),
        transport: TransportKind::Tcp,
        ca_bundle: None,
        log_level: "error".to_owned(),
        quiet: true,
        idle_timeout_secs: 1,
        watch: false,
        profile: false,
    }
}

/// Spawn a server-role hub bound to an OS-assigned loopback port and return
/// it (already running) plus the port it bound.
async fn spawn_server_hub(config: CoreConfig) -> (Arc<Hub>, u16) {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut config = config;
    config.port = port;

    let config = Arc::new(ArcSwap::from_pointee(config));
    let metrics = Arc::new(Metrics::new());
    let factory_config = Arc::clone(&config);
    let hub = Arc::new(Hub::new(
        config,
        metrics,
        Box::new(move || {
            let cfg = factory_config.load();
            let preset = ExpBaseAuthStream::server(cfg.method, cfg.key.as_bytes());
            Pipeline::new(Role::Server, vec![Box::new(preset)])
        }),
    ));

    let run_hub = Arc::clone(&hub);
    tokio::spawn(async move {
        let _ = run_hub.run().await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    (hub, port)
}

#[tokio::test]
async fn echo_through_handshake() {
    let echo = MockEchoServer::start().await.unwrap();
    let (hub, port) = spawn_server_hub(base_config()).await;

    let dst = Address::ip(echo.local_addr().ip(), echo.local_addr().port());
    let hello = ClientHello::build(METHOD, KEY, &dst, b"hello").unwrap();
    let mut cipher_pair = hello.cipher_pair;

    let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
    client.write_all(&hello.frame).await.unwrap();

    let mut reply = vec![0u8; 5];
    client.read_exact(&mut reply).await.unwrap();
    let plain = cipher_pair.decrypt_to_vec(&reply);
    assert_eq!(&plain, b"hello");

    echo.shutdown();
    hub.close().await;
}

#[tokio::test]
async fn redirect_on_fail() {
    let redirect_echo = MockEchoServer::start().await.unwrap();
    let mut config = base_config();
    config.redirect = Some(Address::ip(
        redirect_echo.local_addr().ip(),
        redirect_echo.local_addr().port(),
    ));
    let (hub, port) = spawn_server_hub(config).await;

    let garbage = vec![0x42u8; 1024];
    let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
    client.write_all(&garbage).await.unwrap();

    let mut reply = vec![0u8; garbage.len()];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, garbage);

    redirect_echo.shutdown();
    hub.close().await;
}

#[tokio::test]
async fn idle_timeout_closes_relay() {
    let echo = MockEchoServer::start().await.unwrap();
    let (hub, port) = spawn_server_hub(base_config()).await;

    let dst = Address::ip(echo.local_addr().ip(), echo.local_addr().port());
    let frame = build_handshake_frame(METHOD, KEY, &dst, b"x");

    let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
    client.write_all(&frame).await.unwrap();
    assert_eq!(hub.active_relays(), 1);

    // base_config's idle_timeout_secs is 1; give the relay time to observe
    // it and close without any further traffic in either direction.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(hub.active_relays(), 0);

    echo.shutdown();
    hub.close().await;
}

/// The client-role counterpart to the scenarios above:
/// a client `Hub` (eager-dial, `Relay::new_established`) in front of a
/// server `Hub` (lazy-dial, `Relay::new`) in front of the echo destination,
/// exercising the full client→server→destination chain end to end.
#[tokio::test]
async fn client_and_server_hub_relay_end_to_end() {
    let echo = MockEchoServer::start().await.unwrap();
    let dst = Address::ip(echo.local_addr().ip(), echo.local_addr().port());

    let mut server_config = base_config();
    server_config.idle_timeout_secs = 5;
    let (server_hub, server_port) = spawn_server_hub(server_config).await;

    let client_listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let client_port = client_listener.local_addr().unwrap().port();
    drop(client_listener);

    let mut client_config = base_config();
    client_config.port = client_port;
    client_config.idle_timeout_secs = 5;
    client_config.target = Some(dst);
    client_config.servers = vec![Address::ip(Ipv4Addr::LOCALHOST.into(), server_port)];

    let client_config = Arc::new(ArcSwap::from_pointee(client_config));
    let client_metrics = Arc::new(Metrics::new());
    let factory_config = Arc::clone(&client_config);
    let client_hub = Arc::new(Hub::new(
        client_config,
        client_metrics,
        Box::new(move || {
            let cfg = factory_config.load();
            let target = cfg.target.clone().unwrap();
            let preset = ExpBaseAuthStream::client(cfg.method, cfg.key.as_bytes(), target);
            Pipeline::new(Role::Client, vec![Box::new(preset)])
        }),
    ));
    let run_client_hub = Arc::clone(&client_hub);
    tokio::spawn(async move {
        let _ = run_client_hub.run_client().await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut app = TcpStream::connect((Ipv4Addr::LOCALHOST, client_port))
        .await
        .unwrap();
    app.write_all(b"hello through the tunnel").await.unwrap();

    let mut reply = vec![0u8; "hello through the tunnel".len()];
    app.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"hello through the tunnel");

    echo.shutdown();
    client_hub.close().await;
    server_hub.close().await;
}

#[tokio::test]
async fn short_handshake_closes_without_connect() {
    let (hub, port) = spawn_server_hub(base_config()).await;

    let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
    // 36 bytes is one short of MIN_HEADER_LEN, so the server preset buffers
    // and waits for more (`NeedMore`). Closing the write half surfaces the
    // short handshake: the relay observes inbound EOF, the pipeline's
    // `drain()` sees the preset's handshake never completed and turns it
    // into `Fail`, and the relay closes without ever reaching
    // `CONNECT_TO_DST`.
    client.write_all(&[0u8; 36]).await.unwrap();
    client.shutdown().await.unwrap();

    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hub.active_relays(), 0);

    hub.close().await;
}

#[tokio::test]
async fn redirect_on_short_handshake() {
    let redirect_echo = MockEchoServer::start().await.unwrap();
    let mut config = base_config();
    config.redirect = Some(Address::ip(
        redirect_echo.local_addr().ip(),
        redirect_echo.local_addr().port(),
    ));
    let (hub, port) = spawn_server_hub(config).await;

    // Well under MIN_HEADER_LEN: the server preset never reaches
    // handshake_done, so closing the write half here must still trigger the
    // redirect-on-fail splice via the pipeline's `drain()`, not just a silent
    // close.
    let short = vec![0x11u8; 20];
    let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
    client.write_all(&short).await.unwrap();
    client.shutdown().await.unwrap();

    let mut reply = vec![0u8; short.len()];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, short);

    redirect_echo.shutdown();
    hub.close().await;
}
