use std::path::{Path, PathBuf};

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use tokio::fs::{create_dir_all, read_to_string, try_exists, write};
use tracing::{debug, info, warn};

use crate::bridge::BridgeSettings;
use crate::mqtt::{ConnectOptions, ReconnectPolicy};

const CONFIG_DIR: &str = "accontrol";
const CONFIG_FILE: &str = "config.toml";
/// Points at a config file to use instead of the default location
pub const CONFIG_PATH_VAR: &str = "ACCONTROL_CONFIG";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub broker: ConnectOptions,
    pub reconnect: ReconnectPolicy,
    pub bridge: BridgeSettings,
}

impl AppConfig {
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_PATH_VAR) {
            return PathBuf::from(path);
        }
        let mut path = dirs::config_dir().unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            create_dir_all(dir)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file: {}", e))?;
        Ok(())
    }

    /// Applies `MQTT_HOST`, `MQTT_PORT`, `MQTT_USERNAME`, `MQTT_PASSWORD` and `MQTT_SSL`
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MQTT_HOST") {
            self.broker.host = host;
        }
        if let Some(port) = lookup("MQTT_PORT") {
            self.broker.port = port
                .trim()
                .parse()
                .map_err(|e| eyre!("Invalid MQTT_PORT '{}': {}", port, e))?;
        }
        if let Some(username) = lookup("MQTT_USERNAME") {
            self.broker.username = Some(username).filter(|u| !u.is_empty());
        }
        if let Some(password) = lookup("MQTT_PASSWORD") {
            self.broker.password = Some(password).filter(|p| !p.is_empty());
        }
        if let Some(ssl) = lookup("MQTT_SSL") {
            self.broker.ssl = parse_flag(&ssl)
                .ok_or_else(|| eyre!("Invalid MQTT_SSL '{}': expected true or false", ssl))?;
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Writes a default config file if none exists yet and returns the loaded config
pub async fn ensure_default_config(path: &Path) -> Result<AppConfig> {
    let exists = try_exists(path)
        .await
        .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?;

    if !exists {
        info!("Creating default configuration at {}", path.display());
        let config = AppConfig::default();
        config.save(path).await?;
        return Ok(config);
    }

    AppConfig::load(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn scratch_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("accontrol-test-{}-{}", std::process::id(), name));
        path.push(CONFIG_FILE);
        path
    }

    #[test]
    fn defaults_cover_every_section() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.bridge.sweep_interval_secs, 60);
        assert_eq!(config.bridge.staleness_window_secs, 300);
        assert_eq!(config.bridge.status_pattern, "ac-control/+/+/status");
        assert_eq!(config.reconnect.max_attempts, 5);
    }

    #[test]
    fn sections_override_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [broker]
            host = "broker.lan"
            ssl = true

            [reconnect]
            base_delay_ms = 1000
            "#,
        )
        .unwrap();
        assert_eq!(config.broker.host, "broker.lan");
        assert_eq!(config.broker.port, 1883);
        assert!(config.broker.ssl);
        assert_eq!(config.reconnect.base_delay_ms, 1000);
        assert_eq!(config.reconnect.max_attempts, 5);
    }

    #[test]
    fn environment_overrides_broker_settings() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("MQTT_HOST", "10.0.0.5"),
            ("MQTT_PORT", "8883"),
            ("MQTT_USERNAME", "panel"),
            ("MQTT_PASSWORD", ""),
            ("MQTT_SSL", "true"),
        ]);
        let mut config = AppConfig::default();
        config
            .apply_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.broker.host, "10.0.0.5");
        assert_eq!(config.broker.port, 8883);
        assert_eq!(config.broker.username.as_deref(), Some("panel"));
        assert_eq!(config.broker.password, None);
        assert!(config.broker.ssl);
    }

    #[test]
    fn invalid_port_is_reported() {
        let mut config = AppConfig::default();
        let result = config.apply_env_overrides(|key| {
            (key == "MQTT_PORT").then(|| "eighteen".to_string())
        });
        assert!(result.is_err());
        assert_eq!(config.broker.port, 1883);
    }

    #[test]
    fn ssl_flag_accepts_common_spellings_and_rejects_the_rest() {
        for (value, expected) in [("on", true), ("YES", true), ("1", true), ("off", false), ("0", false)] {
            let mut config = AppConfig::default();
            config
                .apply_env_overrides(|key| (key == "MQTT_SSL").then(|| value.to_string()))
                .unwrap();
            assert_eq!(config.broker.ssl, expected, "MQTT_SSL={value}");
        }

        let mut config = AppConfig::default();
        config.broker.ssl = true;
        let result =
            config.apply_env_overrides(|key| (key == "MQTT_SSL").then(|| "enabled".to_string()));
        assert!(result.is_err());
        assert!(config.broker.ssl);
    }

    #[tokio::test]
    async fn default_config_is_written_once_and_reloaded() {
        let path = scratch_path("ensure");
        let _ = tokio::fs::remove_file(&path).await;

        let created = ensure_default_config(&path).await.unwrap();
        assert_eq!(created, AppConfig::default());
        assert!(try_exists(&path).await.unwrap());

        let mut edited = created.clone();
        edited.broker.host = "edited".to_string();
        edited.save(&path).await.unwrap();
        assert_eq!(ensure_default_config(&path).await.unwrap(), edited);

        if let Some(dir) = path.parent() {
            let _ = tokio::fs::remove_dir_all(dir).await;
        }
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let path = scratch_path("malformed");
        if let Some(dir) = path.parent() {
            create_dir_all(dir).await.unwrap();
        }
        write(&path, "[broker\nhost = ").await.unwrap();
        assert!(AppConfig::load(&path).await.is_err());
        if let Some(dir) = path.parent() {
            let _ = tokio::fs::remove_dir_all(dir).await;
        }
    }
}
