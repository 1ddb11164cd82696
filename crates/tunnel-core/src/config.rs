//! Configuration loading for the tunnel runtime.
//!
//! TOML is the sole config file format. Loading is a two-stage pipeline: an
//! all-`Option` [`RawConfig`] deserializes whatever the file or CLI supplies,
//! then [`RawConfig::validate`] fills in defaults and rejects anything
//! incomplete or malformed, producing a [`CoreConfig`] snapshot. This mirrors
//! `services/forwarder/src/config.rs`'s `RawConfig` → `ForwarderConfig` shape.

use std::path::Path;

use serde::Deserialize;
use tunnel_proto::{Address, CipherMethod};

use crate::error::ConfigError;
use crate::transport::TransportKind;

/// Which side of the proxy a `CoreConfig` is validated for. Required fields
/// differ: a client needs `target`/`servers`, a server accepts `redirect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigRole {
    Client,
    Server,
}

/// Default idle timeout for an established relay with no traffic in either
/// direction, per `--timeout`.
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_PORT: u16 = 1080;
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// A validated, immutable configuration snapshot. Hot reload installs a new
/// `Arc<CoreConfig>`; relays already in flight keep whichever snapshot they
/// captured at spawn time.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub host: String,
    pub port: u16,
    pub key: String,
    pub method: CipherMethod,
    /// Raw destination to splice to verbatim when the preset chain fails
    /// the connection instead of tearing it down (redirect-on-fail).
    pub redirect: Option<Address>,
    /// Client only: the real destination the server should dial on this
    /// client's behalf. Fixed at config time rather than negotiated
    /// per-connection — this crate has no SOCKS5 (or similar) front end to
    /// parse a destination out of each inbound connection, and the client
    /// preset never emits `ConnectToDst` the way the server preset does.
    pub target: Option<Address>,
    /// Client only: candidate remote tunnel endpoints, in priority order.
    /// Entries prefixed `-` in the raw list are disabled and filtered out.
    pub servers: Vec<Address>,
    /// Client only: how to reach the selected server.
    pub transport: TransportKind,
    /// Client + `transport = "http2"` only: path to the PEM-encoded CA
    /// bundle used to verify the remote server's certificate.
    pub ca_bundle: Option<String>,
    pub log_level: String,
    pub quiet: bool,
    pub idle_timeout_secs: u64,
    pub watch: bool,
    pub profile: bool,
}

impl CoreConfig {
    /// The effective log level after `-q/--quiet` forces `error`.
    pub fn effective_log_level(&self) -> &str {
        if self.quiet {
            "error"
        } else {
            &self.log_level
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RawConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub key: Option<String>,
    pub method: Option<String>,
    pub redirect: Option<String>,
    pub target: Option<String>,
    pub servers: Option<Vec<String>>,
    pub transport: Option<String>,
    pub ca_bundle: Option<String>,
    pub log_level: Option<String>,
    pub quiet: Option<bool>,
    pub timeout: Option<u64>,
    pub watch: Option<bool>,
    pub profile: Option<bool>,
}

impl RawConfig {
    /// Parse a `RawConfig` from a TOML document.
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Parse a `RawConfig` from a TOML file on disk.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let toml_str = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_str(&toml_str)
    }

    /// Overlay `other`'s present fields onto `self`, with `other` winning.
    /// Used to apply CLI flags over a loaded config file.
    pub fn merge(mut self, other: RawConfig) -> Self {
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field;
                }
            };
        }
        take!(host);
        take!(port);
        take!(key);
        take!(method);
        take!(redirect);
        take!(target);
        take!(servers);
        take!(transport);
        take!(ca_bundle);
        take!(log_level);
        take!(quiet);
        take!(timeout);
        take!(watch);
        take!(profile);
        self
    }

    /// Validate and fill defaults, producing a ready-to-use [`CoreConfig`].
    /// `role` determines which fields are required: a client needs `target`
    /// and at least one enabled entry in `servers`; a server accepts the
    /// optional `redirect` fallback instead.
    pub fn validate(self, role: ConfigRole) -> Result<CoreConfig, ConfigError> {
        let host = self.host.unwrap_or_else(|| "0.0.0.0".to_owned());
        let port = self.port.unwrap_or(DEFAULT_PORT);

        let key = self
            .key
            .ok_or_else(|| ConfigError::MissingField("key".to_owned()))?;
        if key.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "key".to_owned(),
                reason: "must not be empty".to_owned(),
            });
        }

        let method_str = self
            .method
            .ok_or_else(|| ConfigError::MissingField("method".to_owned()))?;
        let method = CipherMethod::parse(&method_str).map_err(|e| ConfigError::InvalidValue {
            field: "method".to_owned(),
            reason: e.to_string(),
        })?;

        let redirect = match self.redirect {
            Some(s) => Some(parse_host_port(&s)?),
            None => None,
        };

        let (target, servers) = match role {
            ConfigRole::Client => {
                let target_str = self
                    .target
                    .ok_or_else(|| ConfigError::MissingField("target".to_owned()))?;
                let target = parse_host_port(&target_str)?;

                let raw_servers = self
                    .servers
                    .ok_or_else(|| ConfigError::MissingField("servers".to_owned()))?;
                let servers = raw_servers
                    .iter()
                    .filter(|s| !s.starts_with('-'))
                    .map(|s| parse_host_port(s))
                    .collect::<Result<Vec<_>, _>>()?;
                if servers.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        field: "servers".to_owned(),
                        reason: "at least one enabled server entry is required".to_owned(),
                    });
                }
                (Some(target), servers)
            }
            ConfigRole::Server => (None, Vec::new()),
        };

        let transport = match self.transport {
            Some(s) => TransportKind::parse(&s).ok_or_else(|| ConfigError::InvalidValue {
                field: "transport".to_owned(),
                reason: format!("unknown transport '{s}'"),
            })?,
            None => TransportKind::Tcp,
        };

        if role == ConfigRole::Client && transport == TransportKind::Http2 && self.ca_bundle.is_none() {
            return Err(ConfigError::MissingField("ca_bundle".to_owned()));
        }
        let ca_bundle = self.ca_bundle;

        let log_level = self.log_level.unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_owned());
        let quiet = self.quiet.unwrap_or(false);
        let idle_timeout_secs = self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS);
        let watch = self.watch.unwrap_or(true);
        let profile = self.profile.unwrap_or(false);

        Ok(CoreConfig {
            host,
            port,
            key,
            method,
            redirect,
            target,
            servers,
            transport,
            ca_bundle,
            log_level,
            quiet,
            idle_timeout_secs,
            watch,
            profile,
        })
    }
}

fn parse_host_port(s: &str) -> Result<Address, ConfigError> {
    let (host, port_str) = s.rsplit_once(':').ok_or_else(|| ConfigError::InvalidValue {
        field: "host:port".to_owned(),
        reason: format!("expected host:port, got '{s}'"),
    })?;
    let port: u16 = port_str.parse().map_err(|_| ConfigError::InvalidValue {
        field: "host:port".to_owned(),
        reason: format!("invalid port in '{s}'"),
    })?;
    Ok(Address::from_host_port(host.to_owned(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_minimal_server_config() {
        let raw = RawConfig::from_str("key = \"secret\"\nmethod = \"aes-256-ctr\"\n").unwrap();
        let cfg = raw.validate(ConfigRole::Server).unwrap();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.idle_timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert!(cfg.watch);
        assert!(!cfg.profile);
        assert_eq!(cfg.transport, TransportKind::Tcp);
    }

    #[test]
    fn rejects_missing_key() {
        let raw = RawConfig::from_str("method = \"aes-256-ctr\"\n").unwrap();
        let err = raw.validate(ConfigRole::Server).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(f) if f == "key"));
    }

    #[test]
    fn rejects_unknown_method() {
        let raw = RawConfig::from_str("key = \"secret\"\nmethod = \"rc4\"\n").unwrap();
        let err = raw.validate(ConfigRole::Server).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field, .. } if field == "method"));
    }

    #[test]
    fn quiet_forces_error_level() {
        let mut raw = RawConfig::from_str("key = \"secret\"\nmethod = \"aes-256-ctr\"\n").unwrap();
        raw.quiet = Some(true);
        let cfg = raw.validate(ConfigRole::Server).unwrap();
        assert_eq!(cfg.effective_log_level(), "error");
    }

    #[test]
    fn cli_overlay_wins_over_file() {
        let file = RawConfig::from_str("key = \"file-key\"\nmethod = \"aes-256-ctr\"\nport = 9000\n").unwrap();
        let cli = RawConfig {
            port: Some(1080),
            ..RawConfig::default()
        };
        let merged = file.merge(cli);
        let cfg = merged.validate(ConfigRole::Server).unwrap();
        assert_eq!(cfg.port, 1080);
        assert_eq!(cfg.key, "file-key");
    }

    #[test]
    fn parses_redirect_host_port() {
        let raw = RawConfig::from_str(
            "key = \"secret\"\nmethod = \"aes-256-ctr\"\nredirect = \"10.0.0.5:80\"\n",
        )
        .unwrap();
        let cfg = raw.validate(ConfigRole::Server).unwrap();
        let redirect = cfg.redirect.unwrap();
        assert_eq!(redirect.host(), "10.0.0.5");
        assert_eq!(redirect.port(), 80);
    }

    #[test]
    fn client_requires_target_and_servers() {
        let raw = RawConfig::from_str("key = \"secret\"\nmethod = \"aes-256-ctr\"\n").unwrap();
        let err = raw.validate(ConfigRole::Client).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(f) if f == "target"));
    }

    #[test]
    fn client_filters_disabled_server_entries() {
        let raw = RawConfig::from_str(
            "key = \"secret\"\nmethod = \"aes-256-ctr\"\ntarget = \"example.com:80\"\nservers = [\"-10.0.0.1:1080\", \"10.0.0.2:1080\"]\n",
        )
        .unwrap();
        let cfg = raw.validate(ConfigRole::Client).unwrap();
        assert_eq!(cfg.servers.len(), 1);
        assert_eq!(cfg.servers[0].host(), "10.0.0.2");
    }

    #[test]
    fn client_rejects_transport_unknown() {
        let raw = RawConfig::from_str(
            "key = \"secret\"\nmethod = \"aes-256-ctr\"\ntarget = \"example.com:80\"\nservers = [\"10.0.0.2:1080\"]\ntransport = \"quic\"\n",
        )
        .unwrap();
        let err = raw.validate(ConfigRole::Client).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field, .. } if field == "transport"));
    }

    #[test]
    fn from_path_loads_a_real_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"key = \"secret\"\nmethod = \"aes-256-ctr\"\nport = 1234\n").unwrap();
        let raw = RawConfig::from_path(file.path()).unwrap();
        let cfg = raw.validate(ConfigRole::Server).unwrap();
        assert_eq!(cfg.port, 1234);
    }

    #[test]
    fn from_path_missing_file_is_an_io_error() {
        let err = RawConfig::from_path(Path::new("/nonexistent/portwarden.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
