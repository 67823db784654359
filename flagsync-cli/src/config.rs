use std::env;

use serde::Deserialize;
use tracing::warn;

/// Top-level flagsync.toml configuration
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct FlagsyncConfig {
    #[serde(default = "default_document")]
    pub document: String,
    #[serde(default = "default_actor")]
    pub actor: String,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    #[serde(default = "default_path")]
    pub path: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Sled,
    Memory,
}

impl StorageBackend {
    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "sqlite" => Some(Self::Sqlite),
            "sled" => Some(Self::Sled),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

// ── Default value functions ──────────────────────────

fn default_document() -> String {
    "flags.yaml".to_string()
}

fn default_actor() -> String {
    flagsync_lib::DEFAULT_ACTOR.to_string()
}

fn default_backend() -> StorageBackend {
    StorageBackend::Sqlite
}

fn default_path() -> String {
    "./flagsync.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_path(),
        }
    }
}

impl Default for FlagsyncConfig {
    fn default() -> Self {
        Self {
            document: default_document(),
            actor: default_actor(),
            store: StoreConfig::default(),
        }
    }
}

impl FlagsyncConfig {
    /// Load configuration from a TOML file, falling back to defaults if the file
    /// doesn't exist or cannot be parsed.
    pub fn load(path: &str) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(path, &content),
            Err(_) => Self::default(),
        }
    }

    fn parse(path: &str, content: &str) -> Self {
        match toml::from_str(content) {
            Ok(config) => config,
            Err(e) => {
                warn!("failed to parse {}: {}", path, e);
                Self::default()
            }
        }
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("FLAGSYNC_DOCUMENT") {
            self.document = val;
        }

        if let Some(val) = lookup("FLAGSYNC_ACTOR") {
            self.actor = val;
        }

        // FLAGSYNC_STORAGE: sqlite, sled or memory
        if let Some(val) = lookup("FLAGSYNC_STORAGE") {
            match StorageBackend::parse(&val) {
                Some(backend) => self.store.backend = backend,
                None => warn!("unknown FLAGSYNC_STORAGE value: {}", val),
            }
        }

        if let Some(val) = lookup("FLAGSYNC_DB_PATH") {
            self.store.path = val;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = FlagsyncConfig::load(path.to_str().unwrap());
        assert_eq!(config, FlagsyncConfig::default());
        assert_eq!(config.store.backend, StorageBackend::Sqlite);
        assert_eq!(config.actor, "flagsync");
    }

    #[test]
    fn test_load_full_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
document = "deploy/flags.yaml"
actor = "ci"

[store]
backend = "sled"
path = "/var/lib/flagsync"
"#
        )
        .unwrap();
        let config = FlagsyncConfig::load(file.path().to_str().unwrap());
        assert_eq!(config.document, "deploy/flags.yaml");
        assert_eq!(config.actor, "ci");
        assert_eq!(config.store.backend, StorageBackend::Sled);
        assert_eq!(config.store.path, "/var/lib/flagsync");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config = FlagsyncConfig::parse("t.toml", "[store]\nbackend = \"memory\"\n");
        assert_eq!(config.store.backend, StorageBackend::Memory);
        assert_eq!(config.store.path, "./flagsync.db");
        assert_eq!(config.document, "flags.yaml");
    }

    #[test]
    fn test_invalid_file_falls_back_to_defaults() {
        let config = FlagsyncConfig::parse("t.toml", "[store]\nbackend = \"postgres\"\n");
        assert_eq!(config, FlagsyncConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let vars = HashMap::from([
            ("FLAGSYNC_DOCUMENT", "other.yaml"),
            ("FLAGSYNC_ACTOR", "deploy-bot"),
            ("FLAGSYNC_STORAGE", "MEMORY"),
            ("FLAGSYNC_DB_PATH", "/tmp/x.db"),
        ]);
        let mut config = FlagsyncConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.document, "other.yaml");
        assert_eq!(config.actor, "deploy-bot");
        assert_eq!(config.store.backend, StorageBackend::Memory);
        assert_eq!(config.store.path, "/tmp/x.db");
    }

    #[test]
    fn test_unknown_storage_override_is_ignored() {
        let mut config = FlagsyncConfig::default();
        config.apply_overrides(|key| (key == "FLAGSYNC_STORAGE").then(|| "etcd".to_string()));
        assert_eq!(config.store.backend, StorageBackend::Sqlite);
    }
}
