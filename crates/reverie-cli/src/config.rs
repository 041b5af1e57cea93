//! Configuration Vault – reads/writes `~/.reverie/config.toml`.
//!
//! The top-level keys configure the CLI itself; the `[engine]` table (and its
//! `[engine.cluster]`, `[engine.insight]`, `[engine.sweep]` and
//! `[engine.retry]` sub-tables) is handed to the runtime unchanged.  Every
//! key is optional.

use reverie_runtime::EngineConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Persisted user configuration stored in `~/.reverie/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// SQLite file holding memories and clusters.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// TCP port of the HTTP / WebSocket gateway.
    #[serde(default = "default_gateway_port")]
    pub gateway_port: u16,

    /// Base URL of the Ollama instance that embeds raw records.
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    /// Embedding model name (must produce `engine.dimensions` floats).
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_database_path() -> String {
    reverie_dir(&home_dir()).join("reverie.db").display().to_string()
}
fn default_gateway_port() -> u16 {
    reverie_gateway::DEFAULT_PORT
}
fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            gateway_port: default_gateway_port(),
            ollama_url: default_ollama_url(),
            embedding_model: default_embedding_model(),
            engine: EngineConfig::default(),
        }
    }
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

fn reverie_dir(home: &str) -> PathBuf {
    PathBuf::from(home).join(".reverie")
}

/// Return the path to `~/.reverie/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    reverie_dir(home).join("config.toml")
}

/// Load the config from disk with `REVERIE_*` overrides applied.  Returns
/// `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    let Some(mut cfg) = load_from(&config_path())? else {
        return Ok(None);
    };
    apply_env_overrides(&mut cfg);
    validate(&cfg)?;
    Ok(Some(cfg))
}

/// Load the file at `path` as written, without environment overrides.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    validate(&cfg)?;
    Ok(Some(cfg))
}

fn validate(cfg: &Config) -> Result<(), String> {
    cfg.engine
        .validate()
        .map_err(|e| format!("Invalid [engine] settings: {}", e))
}

/// Apply `REVERIE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `REVERIE_DATABASE_PATH` | `database_path` |
/// | `REVERIE_OLLAMA_URL` | `ollama_url` |
/// | `REVERIE_EMBEDDING_MODEL` | `embedding_model` |
/// | `REVERIE_GATEWAY_PORT` | `gateway_port` |
/// | `REVERIE_DIMENSIONS` | `engine.dimensions` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("REVERIE_DATABASE_PATH") {
        cfg.database_path = v;
    }
    if let Ok(v) = std::env::var("REVERIE_OLLAMA_URL") {
        cfg.ollama_url = v;
    }
    if let Ok(v) = std::env::var("REVERIE_EMBEDDING_MODEL") {
        cfg.embedding_model = v;
    }
    if let Ok(v) = std::env::var("REVERIE_GATEWAY_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.gateway_port = port;
    }
    if let Ok(v) = std::env::var("REVERIE_DIMENSIONS")
        && let Ok(dims) = v.parse::<usize>()
    {
        cfg.engine.dimensions = dims;
    }
}

/// Save the config to disk, creating `~/.reverie/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create config directory: {}", e))?;
        // The directory also holds the database.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

/// Create the parent directory of the database file if it is missing.
pub fn ensure_database_dir(cfg: &Config) -> Result<(), String> {
    match Path::new(&cfg.database_path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create database directory {}: {}", parent.display(), e)),
        _ => Ok(()),
    }
}
