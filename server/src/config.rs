use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rideline coordination server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "rideline-server", version, about = "Rideline dispatch and support-chat server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "RIDELINE_PORT", default_value = "8420")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "RIDELINE_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./rideline.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "RIDELINE_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for persistent state (DB, signing key)
    #[arg(long, env = "RIDELINE_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Ride dispatch tuning (loaded from [dispatch] section in TOML)
    #[arg(skip)]
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Support chat tuning (loaded from [chat] section in TOML)
    #[arg(skip)]
    #[serde(default)]
    pub chat: ChatConfig,

    /// WebSocket keepalive (loaded from [connection] section in TOML)
    #[arg(skip)]
    #[serde(default)]
    pub connection: ConnectionConfig,
}

/// Ride request dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Seconds after creation before an unanswered request expires (default: 300)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Interval between expiry sweeps (default: 5)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl DispatchConfig {
    pub fn request_timeout_millis(&self) -> i64 {
        (self.request_timeout_secs as i64) * 1000
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Support chat settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Inactivity after which a typing indicator clears (default: 3000)
    #[serde(default = "default_typing_timeout")]
    pub typing_timeout_ms: u64,

    /// Consecutive unanswered bot turns before auto-escalation (default: 2)
    #[serde(default = "default_bot_max_misses")]
    pub bot_max_misses: u32,

    /// Idle seconds after which an active session is closed (default: 1800)
    #[serde(default = "default_idle_close")]
    pub idle_close_secs: u64,

    /// Interval between idle-session sweeps (default: 60)
    #[serde(default = "default_idle_sweep_interval")]
    pub idle_sweep_interval_secs: u64,
}

impl ChatConfig {
    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            typing_timeout_ms: default_typing_timeout(),
            bot_max_misses: default_bot_max_misses(),
            idle_close_secs: default_idle_close(),
            idle_sweep_interval_secs: default_idle_sweep_interval(),
        }
    }
}

/// Server-side keepalive for WebSocket connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Ping interval in seconds (default: 30)
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Seconds to wait for a pong before closing (default: 10)
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            pong_timeout_secs: default_pong_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    5
}

fn default_typing_timeout() -> u64 {
    3000
}

fn default_bot_max_misses() -> u32 {
    2
}

fn default_idle_close() -> u64 {
    1800
}

fn default_idle_sweep_interval() -> u64 {
    60
}

fn default_ping_interval() -> u64 {
    30
}

fn default_pong_timeout() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8420,
            bind_address: "0.0.0.0".to_string(),
            config: "./rideline.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            dispatch: DispatchConfig::default(),
            chat: ChatConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (RIDELINE_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("RIDELINE_").split("__"))
            .merge(Serialized::defaults(cli))
            .extract()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Rideline Server Configuration
# Place this file at ./rideline.toml or specify with --config <path>
# All settings can be overridden via environment variables (RIDELINE_PORT,
# RIDELINE_DISPATCH__REQUEST_TIMEOUT_SECS, etc.) or CLI flags (--port, etc.)

# Server port (default: 8420)
# port = 8420

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the SQLite database and JWT signing key
# data_dir = "./data"

# ---- Ride Dispatch ----
# [dispatch]

# Seconds from creation until an unanswered ride request expires
# request_timeout_secs = 300

# Seconds between expiry sweeps
# sweep_interval_secs = 5

# ---- Support Chat ----
# [chat]

# Milliseconds of inactivity before a typing indicator clears
# typing_timeout_ms = 3000

# Unanswered bot turns before the session is escalated to a human
# bot_max_misses = 2

# Idle seconds before an active session is closed
# idle_close_secs = 1800
# idle_sweep_interval_secs = 60

# ---- WebSocket Keepalive ----
# [connection]
# ping_interval_secs = 30
# pong_timeout_secs = 10
"#
    .to_string()
}
