use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Broker connection options
///
/// Every field has a default so a partial `[broker]` table in the config file is
/// enough. `ssl` selects TLS instead of plain TCP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl: bool,
    pub keep_alive_secs: u64,
    pub client_id_prefix: String,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            ssl: false,
            keep_alive_secs: 30,
            client_id_prefix: "web-client".to_string(),
        }
    }
}

impl ConnectOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_ssl(mut self, ssl: bool) -> Self {
        self.ssl = ssl;
        self
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    /// `mqtt://host:port` or `mqtts://host:port`, used for logging only
    pub fn broker_url(&self) -> String {
        let scheme = if self.ssl { "mqtts" } else { "mqtt" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    /// Fresh client id: the configured prefix plus eight hex digits
    pub fn client_id(&self) -> String {
        let nanos = Utc::now().timestamp_subsec_nanos();
        let salt = nanos ^ std::process::id().rotate_left(16);
        format!("{}-{:08x}", self.client_id_prefix, salt)
    }
}

/// Exponential backoff for automatic reconnection
///
/// The delay before retry `n` (zero based) is `base_delay * 2^n`. No retry is
/// scheduled once `max_attempts` retries have been made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 5_000,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the retry following `attempts` earlier retries, or `None`
    /// once the budget is spent
    pub fn delay_for(&self, attempts: u32) -> Option<Duration> {
        if attempts >= self.max_attempts {
            return None;
        }
        let factor = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
        Some(Duration::from_millis(
            self.base_delay_ms.saturating_mul(factor),
        ))
    }
}
