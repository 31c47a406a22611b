//! Gateway configuration from environment variables.

use crate::error::{GatewayError, Result};
use crate::relay::RelayConfig;
use common::{UpstreamConfig, WsManagerConfig};
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub http_port: u16,
    pub metrics_port: u16,
    pub coinbase_ws_url: String,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_attempts: u32,
    pub resubscribe_on_reconnect: bool,
    pub ping_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_port: 8082,
            metrics_port: 9093,
            coinbase_ws_url: coinbase::WS_URL.to_string(),
            reconnect_base_delay: Duration::from_millis(5000),
            reconnect_max_attempts: 5,
            resubscribe_on_reconnect: true,
            ping_interval: Duration::from_secs(30),
        }
    }
}

impl GatewayConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read configuration through `lookup`; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let ping_secs = parse(&lookup, "PING_INTERVAL_SECS", defaults.ping_interval.as_secs())?;
        if ping_secs == 0 {
            return Err(GatewayError::Config(
                "PING_INTERVAL_SECS must be greater than zero".to_string(),
            ));
        }
        let base_delay_ms = parse(
            &lookup,
            "RECONNECT_BASE_DELAY_MS",
            defaults.reconnect_base_delay.as_millis() as u64,
        )?;

        Ok(Self {
            http_port: parse(&lookup, "HTTP_PORT", defaults.http_port)?,
            metrics_port: parse(&lookup, "METRICS_PORT", defaults.metrics_port)?,
            coinbase_ws_url: lookup("COINBASE_WS_URL").unwrap_or(defaults.coinbase_ws_url),
            reconnect_base_delay: Duration::from_millis(base_delay_ms),
            reconnect_max_attempts: parse(
                &lookup,
                "RECONNECT_MAX_ATTEMPTS",
                defaults.reconnect_max_attempts,
            )?,
            resubscribe_on_reconnect: parse_bool(
                &lookup,
                "RESUBSCRIBE_ON_RECONNECT",
                defaults.resubscribe_on_reconnect,
            )?,
            ping_interval: Duration::from_secs(ping_secs),
        })
    }

    pub fn upstream_config(&self) -> UpstreamConfig {
        UpstreamConfig {
            base_delay: self.reconnect_base_delay,
            max_attempts: self.reconnect_max_attempts,
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            resubscribe_on_reconnect: self.resubscribe_on_reconnect,
        }
    }

    pub fn ws_manager_config(&self) -> WsManagerConfig {
        WsManagerConfig {
            ping_interval: self.ping_interval,
            platform_label: "coinbase".to_string(),
            ..WsManagerConfig::default()
        }
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| GatewayError::Config(format!("{} must be a number: {}", key, e))),
        None => Ok(default),
    }
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> Result<bool> {
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(GatewayError::Config(format!(
            "{} must be a boolean, got {:?}",
            key, other
        ))),
    }
}
