//! Wires the config/hub/pipeline layers from `tunnel-core` together with the
//! `exp-base-auth-stream` preset from `tunnel-presets` into a runnable
//! client or server process, plus the ambient concerns (`--profile` output,
//! hot reload, graceful shutdown) the core itself stays agnostic to.

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tunnel_core::config::{ConfigRole, CoreConfig, RawConfig};
use tunnel_core::error::CoreError;
use tunnel_core::hub::{Hub, PipelineFactory};
use tunnel_core::metrics::Metrics;
use tunnel_core::pipeline::{Pipeline, Role};
use tunnel_presets::ExpBaseAuthStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl From<Side> for ConfigRole {
    fn from(side: Side) -> Self {
        match side {
            Side::Client => ConfigRole::Client,
            Side::Server => ConfigRole::Server,
        }
    }
}

/// Build the single-preset pipeline factory for `side`. The config schema
/// allows an ordered `presets` list; this repo ships exactly one preset
/// (`exp-base-auth-stream`), so the factory always builds a one-element
/// chain, config-driven only in `method`/`key`/`target`.
fn pipeline_factory(side: Side, config: &Arc<ArcSwap<CoreConfig>>) -> PipelineFactory {
    let config = Arc::clone(config);
    match side {
        Side::Client => Box::new(move || {
            let cfg = config.load();
            let target = cfg
                .target
                .clone()
                .expect("CoreConfig::validate requires `target` for the client role");
            let preset = ExpBaseAuthStream::client(cfg.method, cfg.key.as_bytes(), target);
            Pipeline::new(Role::Client, vec![Box::new(preset)])
        }),
        Side::Server => Box::new(move || {
            let cfg = config.load();
            let preset = ExpBaseAuthStream::server(cfg.method, cfg.key.as_bytes());
            Pipeline::new(Role::Server, vec![Box::new(preset)])
        }),
    }
}

/// Load, validate, run to completion, and tear down one role of the proxy.
/// Returns the exit code the CLI should use.
pub async fn run(side: Side, config_path: Option<PathBuf>, cli_overlay: RawConfig) -> i32 {
    let raw = match &config_path {
        Some(path) => match RawConfig::from_path(path) {
            Ok(raw) => raw,
            Err(e) => {
                error!(error = %e, path = %path.display(), "failed to load config file");
                return 1;
            }
        },
        None => RawConfig::default(),
    };
    let raw = raw.merge(cli_overlay);

    let config = match raw.validate(side.into()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return 1;
        }
    };

    init_logging(&config);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.host,
        port = config.port,
        "portwarden starting"
    );

    let watch = config.watch;
    let profile = config.profile;
    let config = Arc::new(ArcSwap::from_pointee(config));
    let metrics = Arc::new(Metrics::new());
    let factory = pipeline_factory(side, &config);
    let hub = Arc::new(Hub::new(Arc::clone(&config), Arc::clone(&metrics), factory));

    let _watcher = if watch {
        config_path
            .as_ref()
            .map(|path| spawn_config_watcher(path.clone(), side, Arc::clone(&hub)))
    } else {
        None
    };

    let hub_run = Arc::clone(&hub);
    let run_result = tokio::spawn(async move {
        match side {
            Side::Client => hub_run.run_client().await,
            Side::Server => hub_run.run().await,
        }
    });

    let shutdown = shutdown_signal();
    tokio::select! {
        result = run_result => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "hub exited with error");
                    return bind_exit_code(&e);
                }
                Err(e) => {
                    error!(error = %e, "hub task panicked");
                    return 1;
                }
            }
        }
        () = shutdown => {
            info!("shutdown requested");
            hub.close().await;
        }
    }

    if profile {
        let snapshot = metrics.snapshot();
        match snapshot.to_json() {
            Ok(json) => println!("{json}"),
            Err(e) => warn!(error = %e, "failed to serialize profile counters"),
        }
    }

    info!("portwarden shut down gracefully");
    0
}

fn bind_exit_code(_e: &CoreError) -> i32 {
    1
}

/// Compose `--log-level`/`-q` into one `EnvFilter`, falling back to the
/// process environment when neither is set, the same way
/// `services/forwarder`'s `main.rs` builds its filter.
fn init_logging(config: &CoreConfig) {
    let level = config.effective_log_level().to_owned();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();
}

/// Waits for SIGTERM or Ctrl-C (SIGINT), mirroring `services/server`'s
/// `shutdown_signal` helper.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C"); },
        _ = terminate => { info!("received SIGTERM"); },
    }
}

/// Watches `path` for writes and hot-reloads the config on change. A failed
/// reload is logged and the previous snapshot stays in service, per
/// `CoreConfig`'s hot-reload contract.
fn spawn_config_watcher(path: PathBuf, side: Side, hub: Arc<Hub>) -> notify::RecommendedWatcher {
    use notify::{Event, RecursiveMode, Watcher};

    let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    })
    .expect("failed to construct config file watcher");
    if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
        warn!(error = %e, path = %path.display(), "failed to watch config file, hot reload disabled");
        return watcher;
    }

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                Ok(event) if event.kind.is_modify() => {
                    debug!(path = %path.display(), "config file changed, reloading");
                    match RawConfig::from_path(&path).and_then(|raw| raw.validate(side.into())) {
                        Ok(new_config) => hub.install_config(new_config),
                        Err(e) => {
                            warn!(error = %e, "config reload failed, keeping previous configuration");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "config watcher error"),
            }
        }
    });

    watcher
}
