//! Engine configuration
//!
//! Loaded once at startup from `angel.toml` in the data directory (or the
//! path named by `ANGEL_CONFIG`), with individual fields overridable from
//! the environment.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AngelError, AngelResult};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the catalog DB, session DBs, and sandboxes
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Model used when a session does not name one
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Provider backends, keyed by name
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    /// Hours of inactivity before a temporary session is swept
    #[serde(default = "default_temp_ttl_hours")]
    pub temp_session_ttl_hours: u64,

    /// Skip OS-level subprocess isolation (hosts without namespace
    /// support); path containment is still enforced
    #[serde(default)]
    pub disable_os_sandbox: bool,
}

/// One provider backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    /// `gemini` or `openai` wire protocol
    pub kind: ProviderKind,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable consulted when `api_key` is absent
    #[serde(default)]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gemini,
    OpenAi,
}

impl ProviderConfig {
    /// Resolve the API key from config or environment
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = &self.api_key {
            return Some(key.clone());
        }
        self.api_key_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("angel")
}

fn default_port() -> u16 {
    8080
}

fn default_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_temp_ttl_hours() -> u64 {
    48
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            port: default_port(),
            default_model: default_model(),
            providers: Vec::new(),
            temp_session_ttl_hours: default_temp_ttl_hours(),
            disable_os_sandbox: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file does not exist
    pub fn load(path: &Path) -> AngelResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| AngelError::config(format!("{}: {e}", path.display())))
    }

    /// Path of the catalog database
    pub fn main_db_path(&self) -> PathBuf {
        self.data_dir.join("angel.db")
    }

    /// Directory of per-session databases
    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    /// Directory of per-session sandboxes
    pub fn sandbox_dir(&self) -> PathBuf {
        self.data_dir.join("sandbox")
    }

    /// Find a provider by name
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.temp_session_ttl_hours, 48);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("angel.toml")).unwrap();
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn test_load_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("angel.toml");
        std::fs::write(
            &path,
            r#"
            data_dir = "/tmp/angel-test"
            port = 9090

            [[providers]]
            name = "local"
            kind = "openai"
            base_url = "http://localhost:11434"
            "#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].kind, ProviderKind::OpenAi);
        assert_eq!(config.main_db_path(), PathBuf::from("/tmp/angel-test/angel.db"));
    }
}
