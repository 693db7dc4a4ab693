use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::info;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

/// Production CCS endpoint port.
pub const CCS_PORT: u16 = 5235;
/// Pre-production CCS endpoint port.
pub const CCS_PREPROD_PORT: u16 = 5236;

const DEFAULT_HOST: &str = "fcm-xmpp.googleapis.com";

/// Connection and retry configuration for the gateway.
///
/// The connection surface is the four relay parameters; the rest is the
/// capped retry/backoff/queue-depth policy the delivery manager applies.
#[derive(Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub sender_id: String,
    // Base64-encoded at rest, same scheme the rest of the backend uses for
    // stored secrets. Use api_key() to read it.
    api_key: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    500
}

fn default_ack_timeout_ms() -> u64 {
    10_000
}

fn default_max_pending() -> usize {
    512
}

impl GatewayConfig {
    pub fn new(host: &str, port: u16, sender_id: &str, api_key: &str) -> Self {
        GatewayConfig {
            host: host.to_string(),
            port,
            sender_id: sender_id.to_string(),
            api_key: BASE64.encode(api_key),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            max_pending: default_max_pending(),
        }
    }

    /// Configuration for the production relay endpoint.
    pub fn for_sender(sender_id: &str, api_key: &str) -> Self {
        Self::new(DEFAULT_HOST, CCS_PORT, sender_id, api_key)
    }

    pub fn api_key(&self) -> String {
        String::from_utf8(BASE64.decode(&self.api_key).unwrap_or_default()).unwrap_or_default()
    }

    /// The relay only listens on two well-known ports, so anything else is
    /// a configuration mistake rather than a connectivity problem.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow!("relay host must not be empty"));
        }
        if self.port != CCS_PORT && self.port != CCS_PREPROD_PORT {
            return Err(anyhow!(
                "relay port {} is not a CCS endpoint (expected {} or {})",
                self.port,
                CCS_PORT,
                CCS_PREPROD_PORT
            ));
        }
        if self.sender_id.trim().is_empty() {
            return Err(anyhow!("sender id must not be empty"));
        }
        if self.api_key().trim().is_empty() {
            return Err(anyhow!("API key must not be empty"));
        }
        Ok(())
    }

    /// Apply `PUSHGATE_*` environment overrides on top of the loaded values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("PUSHGATE_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("PUSHGATE_PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
        if let Ok(sender_id) = std::env::var("PUSHGATE_SENDER_ID") {
            self.sender_id = sender_id;
        }
        if let Ok(api_key) = std::env::var("PUSHGATE_API_KEY") {
            self.api_key = BASE64.encode(api_key);
        }
    }
}

static CONFIG_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Point config persistence at an explicit path. Used by tests and by hosts
/// that keep gateway credentials next to their own configuration.
pub fn set_config_path(path: PathBuf) {
    let _ = CONFIG_PATH_OVERRIDE.set(path);
}

fn get_config_path() -> Result<PathBuf> {
    CONFIG_PATH_OVERRIDE
        .get()
        .cloned()
        .ok_or_else(|| anyhow!("no gateway config path set"))
}

pub fn save_config(config: &GatewayConfig) -> Result<()> {
    let config_path = get_config_path()?;
    let file = File::create(config_path)?;
    serde_json::to_writer_pretty(file, config)?;

    info!("Gateway config saved for sender {}", config.sender_id);
    Ok(())
}

pub fn load_config() -> Result<Option<GatewayConfig>> {
    let config_path = get_config_path()?;

    if !config_path.exists() {
        return Ok(None);
    }

    let config_path_str = config_path.display().to_string();

    let mut file = File::open(config_path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let mut config: GatewayConfig = serde_json::from_str(&contents)?;
    config.apply_env_overrides();
    info!(
        "Loaded gateway config for sender {} from {}",
        config.sender_id, config_path_str
    );

    Ok(Some(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_round_trip() {
        let config = GatewayConfig::new("relay.example.net", CCS_PORT, "1234567890", "s3cret-key");
        assert_eq!(config.api_key(), "s3cret-key");
        // The raw field must not hold the plain key
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("s3cret-key"));
    }

    #[test]
    fn test_validate_rejects_unknown_port() {
        let config = GatewayConfig::new("relay.example.net", 5222, "1234567890", "key");
        assert!(config.validate().is_err());

        let config = GatewayConfig::new("relay.example.net", CCS_PREPROD_PORT, "1234567890", "key");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_credentials() {
        let config = GatewayConfig::new("relay.example.net", CCS_PORT, "", "key");
        assert!(config.validate().is_err());

        let config = GatewayConfig::new("relay.example.net", CCS_PORT, "1234567890", "");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        set_config_path(dir.path().join("gateway.json"));

        let config = GatewayConfig::new("relay.example.net", CCS_PORT, "777", "round-trip-key");
        save_config(&config).unwrap();

        let loaded = load_config().unwrap().unwrap();
        assert_eq!(loaded.sender_id, "777");
        assert_eq!(loaded.api_key(), "round-trip-key");
    }

    #[test]
    fn test_env_overrides_apply() {
        std::env::set_var("PUSHGATE_HOST", "override.example.net");
        let mut config = GatewayConfig::for_sender("111", "key");
        config.apply_env_overrides();
        assert_eq!(config.host, "override.example.net");
        std::env::remove_var("PUSHGATE_HOST");
    }

    #[test]
    fn test_serialized_round_trip_keeps_policy_fields() {
        let mut config = GatewayConfig::for_sender("1234567890", "key");
        config.max_retries = 5;
        config.ack_timeout_ms = 2_500;

        let json = serde_json::to_string(&config).unwrap();
        let parsed: GatewayConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.max_retries, 5);
        assert_eq!(parsed.ack_timeout_ms, 2_500);
        assert_eq!(parsed.api_key(), "key");
    }
}
