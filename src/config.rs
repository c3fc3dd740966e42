//! Configuration management for trap-relay
//!
//! The configuration is a JSON document. `${VAR}` and `${VAR:default}`
//! references are expanded from the environment before parsing.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub script_handler: ScriptHandlerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    pub address: String,
    /// Expected community; empty accepts all
    #[serde(default)]
    pub community: String,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Datagrams being dispatched at once; the receive loop waits beyond this
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub enabled: bool,
    pub address: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub database: i64,
    pub channel: String,
    /// Give up on the startup connection after this long; unset waits forever
    #[serde(default)]
    pub connect_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptHandlerConfig {
    pub enabled: bool,
    pub command: String,
    pub count_handlers: usize,
    pub queue_size: usize,
    #[serde(default = "default_shell")]
    pub shell: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub console_output: bool,
    #[serde(default)]
    pub file_output: Option<String>,
    #[serde(default = "default_rotation_strategy")]
    pub rotation_strategy: String,
}

fn default_max_packet_size() -> usize { 8192 }
fn default_max_in_flight() -> usize { 1024 }
fn default_shell() -> String { "/bin/bash".to_string() }
fn default_rotation_strategy() -> String { "daily".to_string() }

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:162".to_string(),
            community: "public".to_string(),
            max_packet_size: default_max_packet_size(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "127.0.0.1:6379".to_string(),
            password: String::new(),
            database: 0,
            channel: "snmp-traps".to_string(),
            connect_timeout_seconds: None,
        }
    }
}

impl Default for ScriptHandlerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: "cat >> /tmp/traps.jsonl".to_string(),
            count_handlers: 4,
            queue_size: 1000,
            shell: default_shell(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console_output: true,
            file_output: None,
            rotation_strategy: default_rotation_strategy(),
        }
    }
}

impl RedisConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_seconds.map(Duration::from_secs)
    }
}

impl Config {
    /// Load configuration from a JSON file, expanding environment references
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .context("Failed to read configuration file")?;

        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let expanded = expand_env(content);
        serde_json::from_str(&expanded).context("Failed to parse configuration JSON")
    }

    /// Save configuration to a JSON file
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .context("Failed to serialise configuration")?;

        tokio::fs::write(path.as_ref(), content)
            .await
            .context("Failed to write configuration file")?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.listen
            .address
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid listen address: {}", self.listen.address))?;

        if self.listen.max_packet_size == 0 {
            anyhow::bail!("max_packet_size must be greater than zero");
        }

        if self.listen.max_in_flight == 0 {
            anyhow::bail!("max_in_flight must be greater than zero");
        }

        if self.redis.enabled {
            if self.redis.address.trim().is_empty() {
                anyhow::bail!("Redis address cannot be empty");
            }
            if self.redis.channel.trim().is_empty() {
                anyhow::bail!("Redis channel cannot be empty");
            }
            if self.redis.database < 0 {
                anyhow::bail!("Invalid Redis database index: {}", self.redis.database);
            }
        }

        if self.script_handler.enabled {
            if self.script_handler.command.trim().is_empty() {
                anyhow::bail!("Script handler command cannot be empty");
            }
            if self.script_handler.shell.trim().is_empty() {
                anyhow::bail!("Script handler shell cannot be empty");
            }
            if self.script_handler.queue_size == 0 {
                anyhow::bail!("Script handler queue_size must be greater than zero");
            }
            if self.script_handler.count_handlers == 0 {
                anyhow::bail!("Script handler count_handlers must be greater than zero");
            }
        }

        if !matches!(
            self.logging.level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            anyhow::bail!("Invalid log level: {}", self.logging.level);
        }

        if !self.redis.enabled && !self.script_handler.enabled {
            debug!("No publishers enabled, traps will only be logged");
        }

        Ok(())
    }
}

/// Expand `${VAR}`, `${VAR:default}` and `$VAR` from the process environment
pub fn expand_env(input: &str) -> String {
    expand_with(input, |key| std::env::var(key).ok())
}

fn expand_with<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(body) = after.strip_prefix('{') {
            match body.find('}') {
                Some(end) => {
                    let expr = &body[..end];
                    let value = match expr.split_once(':') {
                        Some((key, default)) => lookup(key).unwrap_or_else(|| default.to_string()),
                        None => lookup(expr).unwrap_or_default(),
                    };
                    out.push_str(&value);
                    rest = &body[end + 1..];
                }
                None => {
                    out.push_str(&rest[pos..]);
                    rest = "";
                }
            }
            continue;
        }

        let name_len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        if name_len == 0 {
            out.push('$');
        } else {
            out.push_str(&lookup(&after[..name_len]).unwrap_or_default());
        }
        rest = &after[name_len..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env() -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<&str, &str> =
            [("REDIS_HOST", "cache.internal"), ("EMPTY", "")].into_iter().collect();
        move |key| vars.get(key).map(|v| v.to_string())
    }

    #[test]
    fn test_expand_braced_and_defaults() {
        let lookup = env();
        assert_eq!(expand_with("${REDIS_HOST}:6379", &lookup), "cache.internal:6379");
        assert_eq!(expand_with("${MISSING:localhost}", &lookup), "localhost");
        assert_eq!(expand_with("${REDIS_HOST:other}", &lookup), "cache.internal");
        assert_eq!(expand_with("${EMPTY:fallback}", &lookup), "");
        assert_eq!(expand_with("${MISSING}", &lookup), "");
        assert_eq!(expand_with("${MISSING:a:b}", &lookup), "a:b");
    }

    #[test]
    fn test_expand_bare_and_literal_dollars() {
        let lookup = env();
        assert_eq!(expand_with("$REDIS_HOST/0", &lookup), "cache.internal/0");
        assert_eq!(expand_with("cost: $5", &lookup), "cost: ");
        assert_eq!(expand_with("a $ b", &lookup), "a $ b");
        assert_eq!(expand_with("trailing $", &lookup), "trailing $");
        assert_eq!(expand_with("open ${brace", &lookup), "open ${brace");
    }

    #[test]
    fn test_defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = Config::from_json(
            r#"{
                "listen": {"address": "127.0.0.1:1162"},
                "redis": {"enabled": true, "address": "localhost:6379", "channel": "traps"},
                "script_handler": {"enabled": true, "command": "cat", "count_handlers": 2, "queue_size": 10},
                "logging": {"level": "debug", "console_output": true}
            }"#,
        )
        .unwrap();

        assert_eq!(config.listen.community, "");
        assert_eq!(config.listen.max_packet_size, 8192);
        assert_eq!(config.listen.max_in_flight, 1024);
        assert_eq!(config.redis.database, 0);
        assert_eq!(config.redis.connect_timeout(), None);
        assert_eq!(config.script_handler.shell, "/bin/bash");
        assert_eq!(config.logging.rotation_strategy, "daily");
        config.validate().unwrap();
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::default();
        config.listen.address = "not-an-address".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.listen.max_in_flight = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.redis.enabled = true;
        config.redis.channel = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.script_handler.enabled = true;
        config.script_handler.queue_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.redis.connect_timeout_seconds = Some(30);
        config.save_to_file(&path).await.unwrap();

        let loaded = Config::load_from_file(&path).await.unwrap();
        assert_eq!(loaded.listen.address, config.listen.address);
        assert_eq!(loaded.redis.connect_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(loaded.script_handler.command, config.script_handler.command);
    }
}
