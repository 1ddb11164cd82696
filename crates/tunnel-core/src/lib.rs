//! Transport, pipeline, relay, and hub runtime for the tunneling proxy.
//!
//! This crate is protocol-agnostic: it knows how to move bytes through a
//! chain of [`pipeline::Preset`]s and how to manage a connection's lifecycle,
//! but the wire format itself (`exp-base-auth-stream`) lives in
//! `tunnel-proto` and the preset that speaks it lives in `tunnel-presets`.

pub mod config;
pub mod error;
pub mod hub;
pub mod metrics;
pub mod pipeline;
pub mod relay;
pub mod transport;

pub use config::{ConfigRole, CoreConfig, RawConfig};
pub use error::{ConfigError, CoreError};
pub use hub::{Hub, PipelineFactory};
pub use metrics::{Metrics, MetricsSnapshot};
pub use pipeline::{Pipeline, Preset, PresetOutcome, Role};
pub use relay::{Relay, RelayState};
pub use transport::{Http2Transport, Outbound, ReadOutcome, TcpTransport, TransportKind};
