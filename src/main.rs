use std::path::PathBuf;

use clap::{Parser, Subcommand};
use portwarden::Side;
use tunnel_core::config::RawConfig;

/// A pluggable tunneling proxy: address delivery, auth, and stream
/// encryption wired through a preset-chained relay.
#[derive(Debug, Parser)]
#[command(name = "portwarden", version, about)]
struct Cli {
    #[command(subcommand)]
    role: Role,
}

#[derive(Debug, Subcommand)]
enum Role {
    /// Run as the client: accept local connections and forward them,
    /// tunneled, to a configured remote server.
    Client(RoleArgs),
    /// Run as the server: accept tunneled connections and relay them to the
    /// destination the client's handshake names.
    Server(RoleArgs),
}

#[derive(Debug, Parser)]
struct RoleArgs {
    /// Local address to bind to.
    #[arg(long)]
    host: Option<String>,

    /// Local port to bind to.
    #[arg(long)]
    port: Option<u16>,

    /// Shared secret used to derive the cipher key.
    #[arg(long)]
    key: Option<String>,

    /// Path to a TOML config file.
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    config: Option<PathBuf>,

    /// host:port to splice raw bytes to when the preset chain rejects a
    /// connection before the destination is known (server only).
    #[arg(long)]
    redirect: Option<String>,

    /// Tracing filter directive, e.g. `info`, `debug`, `portwarden=trace`.
    #[arg(long)]
    log_level: Option<String>,

    /// Idle timeout in seconds before an established relay is closed.
    #[arg(long)]
    timeout: Option<u64>,

    /// Suppress all but error-level logging.
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Hot-reload the config file on change.
    #[arg(short = 'w', long)]
    watch: Option<bool>,

    /// Write per-process byte/connection counters as JSON on exit.
    #[arg(long)]
    profile: bool,
}

impl RoleArgs {
    fn into_overlay(self) -> (Option<PathBuf>, RawConfig) {
        let overlay = RawConfig {
            host: self.host,
            port: self.port,
            key: self.key,
            redirect: self.redirect,
            log_level: self.log_level,
            quiet: if self.quiet { Some(true) } else { None },
            timeout: self.timeout,
            watch: self.watch,
            profile: if self.profile { Some(true) } else { None },
            ..RawConfig::default()
        };
        (self.config, overlay)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let (side, args) = match cli.role {
        Role::Client(args) => (Side::Client, args),
        Role::Server(args) => (Side::Server, args),
    };
    let (config_path, overlay) = args.into_overlay();

    let code = portwarden::run(side, config_path, overlay).await;
    std::process::exit(code);
}
