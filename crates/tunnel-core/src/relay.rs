//! One logical client-to-destination connection: an inbound endpoint, a
//! lazily-created outbound endpoint, the pipeline between them, and the
//! lifecycle state machine that ties it all together.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::metrics::Metrics;
use crate::pipeline::{Pipeline, PresetOutcome};
use crate::transport::{Outbound, ReadOutcome, TcpTransport};

static NEXT_RELAY_ID: AtomicU64 = AtomicU64::new(1);

/// Generates a process-unique relay id for log correlation.
pub fn next_relay_id() -> u64 {
    NEXT_RELAY_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Connecting,
    Established,
    Closing,
    Closed,
}

/// Bounded wait for in-flight reads/writes to settle before a relay is
/// forcibly dropped on shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

pub struct Relay {
    id: u64,
    inbound: TcpTransport,
    outbound: Option<Outbound>,
    pipeline: Pipeline,
    state: RelayState,
    config: Arc<CoreConfig>,
    metrics: Arc<Metrics>,
    /// Raw inbound bytes received before the outbound connects, kept so a
    /// preset failure can be spliced verbatim to `config.redirect` (the
    /// relay itself does not otherwise buffer).
    pending_raw: BytesMut,
    /// Transformed forward bytes queued because the outbound wasn't open
    /// yet when they were produced.
    pending_forward: BytesMut,
}

impl Relay {
    pub fn new(
        inbound: TcpTransport,
        pipeline: Pipeline,
        config: Arc<CoreConfig>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Relay {
            id: next_relay_id(),
            inbound,
            outbound: None,
            pipeline,
            state: RelayState::Connecting,
            config,
            metrics,
            pending_raw: BytesMut::new(),
            pending_forward: BytesMut::new(),
        }
    }

    /// Build a relay whose outbound is already connected — the client role's
    /// shape, where the remote tunnel server is dialed once up front rather
    /// than lazily via a `ConnectToDst` control event from the pipeline.
    pub fn new_established(
        inbound: TcpTransport,
        outbound: Outbound,
        pipeline: Pipeline,
        config: Arc<CoreConfig>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Relay {
            id: next_relay_id(),
            inbound,
            outbound: Some(outbound),
            pipeline,
            state: RelayState::Established,
            config,
            metrics,
            pending_raw: BytesMut::new(),
            pending_forward: BytesMut::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Drive the relay to completion: pumps bytes in both directions,
    /// handles `CONNECT_TO_DST`/`FAIL` control events, enforces the idle
    /// timeout, and reacts to the shutdown signal.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(relay_id = self.id, "relay started");
        self.metrics.record_relay_opened();

        let result = self.pump(&mut shutdown).await;
        if let Err(e) = result {
            warn!(relay_id = self.id, error = %e, "relay ended with error");
        }

        self.state = RelayState::Closed;
        self.metrics.record_relay_closed();
        let _ = self.inbound.close().await;
        if let Some(ob) = self.outbound.as_mut() {
            let _ = ob.close().await;
        }
        info!(relay_id = self.id, "relay closed");
    }

    async fn pump(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), CoreError> {
        loop {
            if *shutdown.borrow() {
                self.state = RelayState::Closing;
                return self.drain_on_shutdown().await;
            }

            let idle_deadline = sleep(Duration::from_secs(self.config.idle_timeout_secs));
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    self.state = RelayState::Closing;
                    return self.drain_on_shutdown().await;
                }

                _ = idle_deadline => {
                    debug!(relay_id = self.id, "idle timeout reached");
                    self.state = RelayState::Closing;
                    return Ok(());
                }

                inbound_result = self.inbound.read_some() => {
                    match inbound_result? {
                        ReadOutcome::Eof => {
                            debug!(relay_id = self.id, "inbound EOF");
                            return self.handle_inbound_eof().await;
                        }
                        ReadOutcome::Chunk(chunk) => {
                            self.metrics.record_client_to_server(chunk.len());
                            if self.outbound.is_none() {
                                self.pending_raw.extend_from_slice(&chunk);
                            }
                            if self.handle_forward(chunk).await? {
                                // Preset failed and the rest of the connection
                                // was spliced raw to the redirect target.
                                return Ok(());
                            }
                        }
                    }
                }

                outbound_result = read_outbound(&mut self.outbound), if self.outbound.is_some() => {
                    match outbound_result? {
                        ReadOutcome::Eof => {
                            debug!(relay_id = self.id, "outbound EOF");
                            return Ok(());
                        }
                        ReadOutcome::Chunk(chunk) => {
                            self.metrics.record_server_to_client(chunk.len());
                            self.handle_backward(chunk).await?;
                        }
                    }
                }
            }
        }
    }

    /// Gives the pipeline a chance to flush or fail on inbound EOF. A preset
    /// still mid-handshake (e.g. a short or never-completed handshake frame)
    /// reports `Fail` here, which is routed through the same `handle_fail`
    /// path a mid-stream preset rejection would take — including the
    /// redirect-on-fail splice of whatever raw bytes were buffered.
    async fn handle_inbound_eof(&mut self) -> Result<(), CoreError> {
        if let PresetOutcome::Fail(reason) = self.pipeline.drain() {
            self.handle_fail(reason).await?;
        }
        Ok(())
    }

    /// Returns `Ok(true)` if the relay's lifetime was already fully driven
    /// to completion as a side effect (the redirect-on-fail raw splice).
    async fn handle_forward(&mut self, chunk: Bytes) -> Result<bool, CoreError> {
        match self.pipeline.forward(chunk) {
            PresetOutcome::Continue(bytes) => {
                self.send_forward(bytes).await?;
                Ok(false)
            }
            PresetOutcome::Swallow => Ok(false),
            PresetOutcome::ConnectToDst(addr) => {
                self.connect_outbound(addr).await?;
                Ok(false)
            }
            PresetOutcome::Fail(reason) => self.handle_fail(reason).await,
        }
    }

    async fn handle_backward(&mut self, chunk: Bytes) -> Result<(), CoreError> {
        match self.pipeline.backward(chunk) {
            PresetOutcome::Continue(bytes) => {
                self.inbound.write(&bytes).await?;
                Ok(())
            }
            PresetOutcome::Swallow => Ok(()),
            PresetOutcome::ConnectToDst(_) => {
                // Backward direction never opens a new outbound.
                Ok(())
            }
            PresetOutcome::Fail(reason) => {
                warn!(relay_id = self.id, reason, "backward direction failed");
                self.state = RelayState::Closing;
                Ok(())
            }
        }
    }

    async fn send_forward(&mut self, bytes: Bytes) -> Result<(), CoreError> {
        match self.outbound.as_mut() {
            Some(ob) => ob.write(&bytes).await,
            None => {
                self.pending_forward.extend_from_slice(&bytes);
                Ok(())
            }
        }
    }

    async fn connect_outbound(&mut self, addr: tunnel_proto::Address) -> Result<(), CoreError> {
        if self.outbound.is_some() {
            return Ok(());
        }
        info!(relay_id = self.id, dst = %addr, "connecting to destination");
        match TcpTransport::connect(&addr.socket_addr_string()).await {
            Ok(t) => {
                self.outbound = Some(Outbound::Tcp(t));
                self.state = RelayState::Established;
                let released = self.pipeline.on_connected();
                let mut flush = BytesMut::new();
                flush.extend_from_slice(&released);
                flush.extend_from_slice(&self.pending_forward);
                self.pending_forward.clear();
                if !flush.is_empty() {
                    if let Some(ob) = self.outbound.as_mut() {
                        ob.write(&flush).await?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                warn!(relay_id = self.id, error = %e, "failed to connect to destination");
                self.state = RelayState::Closing;
                Ok(())
            }
        }
    }

    async fn handle_fail(&mut self, reason: String) -> Result<bool, CoreError> {
        warn!(relay_id = self.id, reason = %reason, "preset rejected connection");
        self.metrics.record_handshake_failure();

        if self.outbound.is_none() {
            if let Some(redirect) = self.config.redirect.clone() {
                info!(relay_id = self.id, redirect = %redirect, "splicing raw to redirect target");
                if let Ok(mut t) = TcpTransport::connect(&redirect.socket_addr_string()).await {
                    let buffered = std::mem::take(&mut self.pending_raw);
                    if !buffered.is_empty() {
                        let _ = t.write(&buffered).await;
                    }
                    self.outbound = Some(Outbound::Tcp(t));
                    self.state = RelayState::Established;
                    self.raw_splice().await?;
                    return Ok(true);
                }
            }
        }
        self.state = RelayState::Closing;
        Ok(true)
    }

    /// Once a preset has failed and a redirect target has been spliced in,
    /// the relay stops driving the pipeline entirely and just copies bytes
    /// verbatim in both directions, per the "redirect on fail" contract.
    async fn raw_splice(&mut self) -> Result<(), CoreError> {
        loop {
            tokio::select! {
                inbound_result = self.inbound.read_some() => {
                    match inbound_result? {
                        ReadOutcome::Eof => return Ok(()),
                        ReadOutcome::Chunk(chunk) => {
                            if let Some(ob) = self.outbound.as_mut() {
                                ob.write(&chunk).await?;
                            }
                        }
                    }
                }
                outbound_result = read_outbound(&mut self.outbound), if self.outbound.is_some() => {
                    match outbound_result? {
                        ReadOutcome::Eof => return Ok(()),
                        ReadOutcome::Chunk(chunk) => {
                            self.inbound.write(&chunk).await?;
                        }
                    }
                }
            }
        }
    }

    async fn drain_on_shutdown(&mut self) -> Result<(), CoreError> {
        let deadline = Instant::now() + SHUTDOWN_DRAIN;
        let _ = self.inbound.close().await;
        if let Some(ob) = self.outbound.as_mut() {
            let _ = tokio::time::timeout_at(deadline, ob.close()).await;
        }
        Ok(())
    }
}

async fn read_outbound(outbound: &mut Option<Outbound>) -> Result<ReadOutcome, CoreError> {
    match outbound {
        Some(ob) => ob.read_some().await,
        None => std::future::pending().await,
    }
}
