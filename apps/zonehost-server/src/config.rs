use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use zonehost_kernel::CoreConfig;

/// Errors while loading the server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Where partition state lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    Memory {
        #[serde(default)]
        zones: Vec<String>,
    },
    File {
        path: PathBuf,
        #[serde(default)]
        zones: Vec<String>,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory {
            zones: vec!["lobby".to_string()],
        }
    }
}

impl StoreConfig {
    /// Zones created at startup if missing.
    pub fn zones(&self) -> &[String] {
        match self {
            Self::Memory { zones } | Self::File { zones, .. } => zones,
        }
    }
}

/// Top-level server configuration, read from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// `tracing` filter directive; `--verbose` and `RUST_LOG` take precedence.
    pub log_filter: Option<String>,
    /// Name of a built-in plugin; none broadcasts raw snapshots.
    pub plugin: Option<String>,
    /// Passed verbatim to the plugin factory.
    pub plugin_settings: Value,
    pub core: CoreConfig,
    pub store: StoreConfig,
    /// Access token → player id.
    pub tokens: BTreeMap<String, String>,
    /// Outbound queue length per connection.
    pub client_queue: usize,
    /// Longest accepted inbound line, in bytes.
    pub max_frame_bytes: usize,
    /// Time allowed for the authentication handshake.
    pub handshake_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 7400)),
            log_filter: None,
            plugin: None,
            plugin_settings: Value::Null,
            core: CoreConfig::default(),
            store: StoreConfig::default(),
            tokens: BTreeMap::new(),
            client_queue: 64,
            max_frame_bytes: 64 * 1024,
            handshake_timeout_ms: 5_000,
        }
    }
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.core.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("core.tick_interval_ms must be positive".into()));
        }
        if self.client_queue == 0 {
            return Err(ConfigError::Invalid("client_queue must be positive".into()));
        }
        if self.max_frame_bytes < 64 {
            return Err(ConfigError::Invalid("max_frame_bytes is too small".into()));
        }
        if let Some((token, _)) = self
            .tokens
            .iter()
            .find(|(token, player)| token.is_empty() || player.trim().is_empty())
        {
            return Err(ConfigError::Invalid(format!(
                "token entry {token:?} needs a non-empty token and player id"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_document_uses_defaults() {
        let config = ServerConfig::from_yaml("{}").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.store.zones(), ["lobby".to_string()]);
    }

    #[test]
    fn full_document() {
        let yaml = r#"
bind: 0.0.0.0:9000
log_filter: zonehost=debug
plugin: arena
plugin_settings:
  view_radius: 12.5
  zones: [lobby, pit]
core:
  tick_interval_ms: 50
store:
  kind: file
  path: /var/lib/zonehost
  zones: [lobby]
tokens:
  s3cret: alice
  hunter2: bob
"#;
        let config = ServerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.bind.port(), 9000);
        assert_eq!(config.plugin.as_deref(), Some("arena"));
        assert_eq!(config.plugin_settings["view_radius"], json!(12.5));
        assert_eq!(config.core.tick_interval_ms, 50);
        assert_eq!(config.core.stop_grace_ms, CoreConfig::default().stop_grace_ms);
        assert_eq!(
            config.store,
            StoreConfig::File {
                path: PathBuf::from("/var/lib/zonehost"),
                zones: vec!["lobby".into()],
            }
        );
        assert_eq!(config.tokens.get("s3cret").map(String::as_str), Some("alice"));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            ServerConfig::from_yaml("core: {tick_interval_ms: 0}"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ServerConfig::from_yaml("tokens: {abc: '  '}"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ServerConfig::from_yaml("colour: blue"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_reports_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let err = ServerConfig::load(tmp.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
