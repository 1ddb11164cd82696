//! The accept loop: binds the listening socket, spawns one [`Relay`] per
//! inbound connection, and owns the shutdown broadcast that drains them.
//!
//! A fresh [`Pipeline`] is required per connection (each preset instance
//! carries per-connection handshake state), so the hub is parameterized over
//! a pipeline factory rather than a single shared pipeline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::metrics::Metrics;
use crate::pipeline::Pipeline;
use crate::relay::{next_relay_id, Relay};
use crate::transport::{Http2Transport, Outbound, TcpTransport, TransportKind};

/// Longest the hub will wait, once asked to stop, for in-flight relays to
/// drain before returning anyway.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Builds a fresh [`Pipeline`] for one new connection. Boxed so `tunnel-core`
/// doesn't need to know which presets `tunnel-presets` actually provides.
pub type PipelineFactory = Box<dyn Fn() -> Pipeline + Send + Sync>;

/// Owns the listening socket and the set of relays spawned from it.
pub struct Hub {
    config: Arc<ArcSwap<CoreConfig>>,
    metrics: Arc<Metrics>,
    pipeline_factory: PipelineFactory,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    active: Arc<AtomicUsize>,
}

impl Hub {
    pub fn new(config: Arc<ArcSwap<CoreConfig>>, metrics: Arc<Metrics>, pipeline_factory: PipelineFactory) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Hub {
            config,
            metrics,
            pipeline_factory,
            shutdown_tx,
            shutdown_rx,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Install a new validated configuration. Relays already running keep
    /// whichever snapshot they captured at spawn time; only relays spawned
    /// after this call observe the update.
    pub fn install_config(&self, snapshot: CoreConfig) {
        info!("installing reloaded configuration");
        self.config.store(Arc::new(snapshot));
    }

    /// Number of relays currently in flight.
    pub fn active_relays(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Ask every relay to close and stop accepting new connections. Returns
    /// once all relays observed it or `SHUTDOWN_GRACE` elapses, whichever
    /// comes first.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while self.active_relays() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if self.active_relays() > 0 {
            warn!(
                remaining = self.active_relays(),
                "shutdown grace period elapsed with relays still active"
            );
        }
    }

    /// Bind `host:port` from the current config snapshot and accept
    /// connections until [`Hub::close`] is called.
    pub async fn run(&self) -> Result<(), CoreError> {
        let (host, port) = {
            let cfg = self.config.load();
            (cfg.host.clone(), cfg.port)
        };
        let listener = TcpListener::bind((host.as_str(), port)).await?;
        info!(%host, port, "tunnel hub listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("hub stopping accept loop");
                        return Ok(());
                    }
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let relay_id = next_relay_id();
                            info!(relay_id, %peer, "accepted connection");
                            let inbound = TcpTransport::new(stream);
                            let pipeline = (self.pipeline_factory)();
                            let config = self.config.load_full();
                            let metrics = Arc::clone(&self.metrics);
                            let relay = Relay::new(inbound, pipeline, config, metrics);
                            let active = Arc::clone(&self.active);
                            let relay_shutdown = shutdown_rx.clone();
                            active.fetch_add(1, Ordering::Relaxed);
                            tokio::spawn(async move {
                                relay.run(relay_shutdown).await;
                                active.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept error");
                        }
                    }
                }
            }
        }
    }

    /// Client-role accept loop: every accepted local application connection
    /// eagerly dials the first enabled configured server and starts an
    /// already-`Established` relay, instead of waiting on `ConnectToDst`
    /// from the pipeline (the client preset never emits one — see
    /// `relay::Relay::new_established`).
    pub async fn run_client(&self) -> Result<(), CoreError> {
        let (host, port, tls_roots) = {
            let cfg = self.config.load();
            let roots = match (cfg.transport, cfg.ca_bundle.as_deref()) {
                (TransportKind::Http2, Some(path)) => Some(Arc::new(crate::transport::load_root_store(path)?)),
                _ => None,
            };
            (cfg.host.clone(), cfg.port, roots)
        };
        let listener = TcpListener::bind((host.as_str(), port)).await?;
        info!(%host, port, "tunnel client listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("hub stopping accept loop");
                        return Ok(());
                    }
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let config = self.config.load_full();
                            let Some(server) = config.servers.first().cloned() else {
                                warn!("no enabled server configured, dropping connection");
                                continue;
                            };
                            debug!(%peer, remote = %server, "accepted local connection");

                            let outbound = match config.transport {
                                TransportKind::Tcp => {
                                    match TcpTransport::connect(&server.socket_addr_string()).await {
                                        Ok(t) => Outbound::Tcp(t),
                                        Err(e) => {
                                            warn!(error = %e, "failed to dial remote server");
                                            continue;
                                        }
                                    }
                                }
                                TransportKind::Http2 => {
                                    let roots = tls_roots.clone().expect("validated by CoreConfig::validate");
                                    match Http2Transport::connect(server.host(), server.port(), roots).await {
                                        Ok(t) => Outbound::Http2(t),
                                        Err(e) => {
                                            warn!(error = %e, "failed to dial remote server over http2");
                                            continue;
                                        }
                                    }
                                }
                            };

                            let inbound = TcpTransport::new(stream);
                            let pipeline = (self.pipeline_factory)();
                            let metrics = Arc::clone(&self.metrics);
                            let relay = Relay::new_established(inbound, outbound, pipeline, config, metrics);
                            let active = Arc::clone(&self.active);
                            let relay_shutdown = shutdown_rx.clone();
                            active.fetch_add(1, Ordering::Relaxed);
                            tokio::spawn(async move {
                                relay.run(relay_shutdown).await;
                                active.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept error");
                        }
                    }
                }
            }
        }
    }
}
