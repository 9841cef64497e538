//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Client configuration. File: ~/.config/tunnel/config.toml or /etc/tunnel/config.toml.
/// Env overrides: TUNNEL_SIGNAL_ADDR, TUNNEL_LISTEN_PORT, TUNNEL_DB_PATH.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Signalling server (default 127.0.0.1:45680).
    #[serde(default = "default_signal_addr")]
    pub signal_addr: String,
    /// Local TCP port for inbound peer channels (default 45681; 0 picks a free port).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// SQLite database (default ~/.local/share/tunnel/tunnel.db).
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_signal_addr() -> String {
    "127.0.0.1:45680".to_string()
}
fn default_listen_port() -> u16 {
    45681
}
fn default_db_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".local/share/tunnel/tunnel.db"),
        None => PathBuf::from("tunnel.db"),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signal_addr: default_signal_addr(),
            listen_port: default_listen_port(),
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load config: default, then config file, then env vars. An explicit path must exist;
/// the default locations are optional.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(p) => read_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => read_file(&p)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

/// Overlay TUNNEL_* variables. Unparseable values are ignored.
pub fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("TUNNEL_SIGNAL_ADDR") {
        if !s.trim().is_empty() {
            c.signal_addr = s.trim().to_string();
        }
    }
    if let Some(s) = var("TUNNEL_LISTEN_PORT") {
        match s.trim().parse::<u16>() {
            Ok(p) => c.listen_port = p,
            Err(_) => tracing::warn!(value = %s, "ignoring TUNNEL_LISTEN_PORT"),
        }
    }
    if let Some(s) = var("TUNNEL_DB_PATH") {
        if !s.is_empty() {
            c.db_path = PathBuf::from(s);
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/tunnel/config.toml"));
    }
    out.push(PathBuf::from("/etc/tunnel/config.toml"));
    out
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
