use clap::Parser;
use figment::{
    providers::{Data, Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::state::DEFAULT_ROOM;

/// Default location of the TOML config file.
pub const DEFAULT_CONFIG_PATH: &str = "./huddle.toml";

/// Command-line flags. Only flags the user actually passed are serialized,
/// so unset flags never mask values from the TOML file or environment.
#[derive(Parser, Serialize, Clone, Debug, Default)]
#[command(name = "huddle-server", version, about = "Room-based WebRTC signaling relay")]
pub struct Args {
    /// Port to listen on [default: 8000]
    #[arg(long, env = "HUDDLE_PORT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Bind address [default: 0.0.0.0]
    #[arg(long, env = "HUDDLE_BIND_ADDRESS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,

    /// Path to TOML config file [default: ./huddle.toml]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "HUDDLE_JSON_LOGS")]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub generate_config: bool,

    /// Room used when a join request omits room_id [default: default]
    #[arg(long, env = "HUDDLE_DEFAULT_ROOM")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_room: Option<String>,

    /// Largest inbound WebSocket message accepted, in KiB [default: 64]
    #[arg(long, env = "HUDDLE_MAX_MESSAGE_SIZE_KB")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_message_size_kb: Option<usize>,
}

/// Resolved server configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub bind_address: String,
    pub config: String,
    pub json_logs: bool,
    pub generate_config: bool,
    pub default_room: String,
    pub max_message_size_kb: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            bind_address: "0.0.0.0".to_string(),
            config: DEFAULT_CONFIG_PATH.to_string(),
            json_logs: false,
            generate_config: false,
            default_room: DEFAULT_ROOM.to_string(),
            max_message_size_kb: 64,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (HUDDLE_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let args = Args::parse();
        let config_path = args
            .config
            .clone()
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        Self::load_from(args, Toml::file(config_path))
    }

    /// Resolve config from already-parsed flags and a TOML source.
    pub fn load_from(args: Args, toml: Data<Toml>) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(toml)
            .merge(Env::prefixed("HUDDLE_"))
            .merge(Serialized::defaults(args))
            .extract()
    }

    /// Address the listener binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Huddle Signaling Relay Configuration
# Place this file at ./huddle.toml or specify with --config <path>
# All settings can be overridden via environment variables (HUDDLE_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 8000)
# port = 8000

# Bind address (default: 0.0.0.0 — all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Room assigned to clients whose join request has no room_id
# default_room = "default"

# Largest inbound WebSocket message, in KiB (default: 64)
# Signaling payloads (SDP offers, ICE candidates) are a few KiB at most.
# max_message_size_kb = 64
"#
    .to_string()
}
