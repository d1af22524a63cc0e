use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

use crate::broadcast::DEFAULT_CAPACITY;

/// Command line options for the chat server.
#[derive(Parser, Debug, Default)]
#[command(name = "chat_server", version, about = "Multi-user chat backend")]
pub struct Cli {
    /// Override bind address (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Override server port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Directory holding the database and generated secrets.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

/// Runtime configuration for the server resolved from file, env and CLI.
#[derive(Clone)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    /// Directory for the database and the generated JWT secret.
    pub data_dir: PathBuf,
    /// Whether verbose logging is enabled.
    pub logging_enabled: bool,
    /// Lifetime of issued bearer tokens.
    pub token_ttl_hours: i64,
    /// Signing secret; generated and persisted in `data_dir` when unset.
    pub jwt_secret: Option<String>,
    /// Per-conversation delivery queue length before the oldest is dropped.
    pub queue_capacity: usize,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind", &self.bind)
            .field("data_dir", &self.data_dir)
            .field("logging_enabled", &self.logging_enabled)
            .field("token_ttl_hours", &self.token_ttl_hours)
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

impl Config {
    /// Defaults rooted at `data_dir`, used by tests and embedders.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            bind: format!("127.0.0.1:{}", default_port()),
            data_dir: data_dir.into(),
            logging_enabled: default_logging(),
            token_ttl_hours: default_token_ttl(),
            jwt_secret: None,
            queue_capacity: DEFAULT_CAPACITY,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chat.db")
    }

    pub fn secret_path(&self) -> PathBuf {
        self.data_dir.join("jwt_secret")
    }
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    logging: FileLogging,
    #[serde(default)]
    auth: FileAuth,
    #[serde(default)]
    realtime: FileRealtime,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_port")]
    port: u16,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_logging")]
    enabled: bool,
}

#[derive(Deserialize)]
struct FileAuth {
    #[serde(default = "default_token_ttl")]
    token_ttl_hours: i64,
    #[serde(default)]
    jwt_secret: Option<String>,
}

#[derive(Deserialize)]
struct FileRealtime {
    #[serde(default = "default_queue_capacity")]
    queue_capacity: usize,
}

fn default_port() -> u16 {
    8787
}

fn default_logging() -> bool {
    true
}

fn default_token_ttl() -> i64 {
    24 * 30
}

fn default_queue_capacity() -> usize {
    DEFAULT_CAPACITY
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: default_logging(),
        }
    }
}

impl Default for FileAuth {
    fn default() -> Self {
        Self {
            token_ttl_hours: default_token_ttl(),
            jwt_secret: None,
        }
    }
}

impl Default for FileRealtime {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Config {
    /// Resolve configuration from CLI, environment variables, config file and defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut port = default_port();
        let mut logging = default_logging();
        let mut file_auth = FileAuth::default();
        let mut queue_capacity = default_queue_capacity();

        // config file path precedence: CLI -> ENV -> default
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("CHAT_SERVER_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/chat_server.toml"));

        if let Ok(bytes) = fs::read(&config_path) {
            let contents = String::from_utf8_lossy(&bytes);
            let file_cfg: FileConfig = toml::from_str(&contents)
                .with_context(|| format!("invalid config file {}", config_path.display()))?;
            port = file_cfg.server.port;
            logging = file_cfg.logging.enabled;
            file_auth = file_cfg.auth;
            queue_capacity = file_cfg.realtime.queue_capacity;
        }

        if let Ok(p) = std::env::var("CHAT_SERVER_PORT") {
            if let Ok(p) = p.parse::<u16>() {
                port = p;
            }
        }
        if let Ok(l) = std::env::var("CHAT_SERVER_LOGGING") {
            if let Ok(l) = l.parse::<bool>() {
                logging = l;
            }
        }
        let jwt_secret = std::env::var("CHAT_SERVER_JWT_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .or(file_auth.jwt_secret);

        if let Some(p) = cli.port {
            port = p;
        }
        if let Some(l) = cli.logging {
            logging = l;
        }

        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port");
        }
        if file_auth.token_ttl_hours <= 0 {
            anyhow::bail!("token_ttl_hours must be positive");
        }
        if queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be positive");
        }

        let bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Ok(b) = std::env::var("BIND") {
            b
        } else {
            format!("127.0.0.1:{}", port)
        };

        let data_dir = cli
            .data_dir
            .clone()
            .or_else(|| std::env::var("DATA_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(default_data_dir);

        Ok(Self {
            bind,
            data_dir,
            logging_enabled: logging,
            token_ttl_hours: file_auth.token_ttl_hours,
            jwt_secret,
            queue_capacity,
        })
    }
}

/// Determine the default data directory.
pub fn default_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".local/share/chat_server");
        p
    } else {
        PathBuf::from("./chat_server_data")
    }
}
