use std::time::Duration;

use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::state::Settings;

/// Effective server configuration after every layer has been merged.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub bind_address: String,
    pub config: String,
    pub json_logs: bool,
    #[serde(default)]
    pub generate_config: bool,
    pub data_dir: String,
    pub store_timeout_ms: u64,
    pub ping_interval_secs: u64,
    pub pong_timeout_secs: u64,
}

/// Chatverse realtime server
///
/// Only flags given on the command line end up in the top layer; anything
/// left out falls through to env, the TOML file, then the defaults.
#[derive(Parser, Serialize, Debug)]
#[command(name = "chatverse-server", version, about = "Chatverse realtime presence and delivery server")]
struct CliArgs {
    /// Port to listen on [default: 5000]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,

    /// Bind address [default: 0.0.0.0]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    bind_address: Option<String>,

    /// Path to TOML config file [default: ./chatverse.toml]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<String>,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long)]
    #[serde(skip_serializing_if = "is_false")]
    json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    #[serde(skip_serializing_if = "is_false")]
    generate_config: bool,

    /// Data directory for persistent state (DB, JWT secret) [default: ./data]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    data_dir: Option<String>,

    /// Deadline in milliseconds for every store call [default: 5000]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    store_timeout_ms: Option<u64>,

    /// Seconds between keepalive pings [default: 30]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    ping_interval_secs: Option<u64>,

    /// Seconds to wait for a pong before closing [default: 10]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pong_timeout_secs: Option<u64>,
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5000,
            bind_address: "0.0.0.0".to_string(),
            config: "./chatverse.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            store_timeout_ms: 5000,
            ping_interval_secs: 30,
            pong_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (CHATVERSE_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(std::env::args_os())
    }

    /// Same as `load`, with an explicit argument list (first item is the
    /// binary name).
    pub fn load_from<I, T>(args: I) -> Result<Self, figment::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli = CliArgs::parse_from(args);
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(|| Config::default().config);

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("CHATVERSE_"))
            .merge(Serialized::defaults(cli))
            .extract()
    }

    pub fn settings(&self) -> Settings {
        Settings {
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            ping_interval: Duration::from_secs(self.ping_interval_secs.max(1)),
            pong_timeout: Duration::from_secs(self.pong_timeout_secs.max(1)),
        }
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Chatverse Realtime Server Configuration
# Place this file at ./chatverse.toml or specify with --config <path>
# All settings can be overridden via environment variables (CHATVERSE_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 5000)
# port = 5000

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the SQLite database and JWT secret
# data_dir = "./data"

# ---- Store ----

# Deadline for every database call; a call that misses it is reported to the
# client as a failed write (default: 5000)
# store_timeout_ms = 5000

# ---- Keepalive ----

# Seconds between server pings (default: 30)
# ping_interval_secs = 30

# Seconds to wait for a pong before closing with 1001 (default: 10)
# pong_timeout_secs = 10
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_parses_as_toml_defaults() {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(&generate_config_template()))
            .extract()
            .unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.settings().store_timeout, Duration::from_millis(5000));
    }

    fn write_toml(dir: &tempfile::TempDir, body: &str) -> String {
        let path = dir.path().join("chatverse.toml");
        std::fs::write(&path, body).unwrap();
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn load_from_reads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_toml(
            &dir,
            "port = 6123\ndata_dir = \"/srv/chatverse\"\njson_logs = true\n",
        );

        let config = Config::load_from(["chatverse-server", "--config", &path]).unwrap();

        assert_eq!(config.port, 6123);
        assert_eq!(config.data_dir, "/srv/chatverse");
        assert!(config.json_logs);
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.config, path);
    }

    #[test]
    fn cli_flags_beat_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_toml(&dir, "port = 6123\npong_timeout_secs = 4\n");

        let config =
            Config::load_from(["chatverse-server", "--config", &path, "--port", "7001"]).unwrap();

        assert_eq!(config.port, 7001);
        assert_eq!(config.pong_timeout_secs, 4);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config =
            Config::load_from(["chatverse-server", "--config", "/nonexistent/chatverse.toml"])
                .unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.data_dir, "./data");
        assert!(!config.json_logs);
    }

    #[test]
    fn toml_overrides_defaults() {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string("port = 6000\npong_timeout_secs = 3"))
            .extract()
            .unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.settings().pong_timeout, Duration::from_secs(3));
        assert_eq!(config.settings().ping_interval, Duration::from_secs(30));
    }
}
