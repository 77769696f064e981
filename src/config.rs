// Конфигурация приложения
// Логирование можно отключить только в режиме разработки

use crate::error::{CallError, Result};
use crate::peer::types::ServerConfig;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене логирование отключено

// Дополнительные настройки для режима разработки
#[cfg(debug_assertions)]
pub mod dev {
    // Для полного отключения логирования в режиме разработки
    // измените эту константу на false
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const ENABLE_LOGGING: bool = false;
}

/// Пауза между двумя замерами входящих байт
pub const HEALTH_RECHECK_INTERVAL: Duration = Duration::from_secs(2);

/// Период опроса при состоянии `disconnected`
pub const RECONNECT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Дефолтные STUN серверы
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub health_recheck_ms: u64,
    /// Grace window after an ICE restart before the final liveness check.
    pub ice_restart_grace_ms: u64,
    pub reconnect_poll_ms: u64,
    pub ice_servers: Vec<ServerConfig>,
    pub log_level: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            health_recheck_ms: HEALTH_RECHECK_INTERVAL.as_millis() as u64,
            ice_restart_grace_ms: HEALTH_RECHECK_INTERVAL.as_millis() as u64,
            reconnect_poll_ms: RECONNECT_POLL_INTERVAL.as_millis() as u64,
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            log_level: "info".into(),
        }
    }
}

impl SessionConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: SessionConfig =
            toml::from_str(content).map_err(|e| CallError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(SessionConfig::default());
        }
        let content =
            std::fs::read_to_string(path).map_err(|e| CallError::Config(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.health_recheck_ms == 0 || self.reconnect_poll_ms == 0 {
            return Err(CallError::Config("timer intervals must be non-zero".into()));
        }

        // Валидация серверов
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(CallError::Config(format!(
                    "server `{}`: URL cannot be empty",
                    server.id
                )));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(CallError::Config(format!(
                    "server `{}`: TURN servers require username and credential",
                    server.id
                )));
            }
        }
        Ok(())
    }

    /// Installs the global logger at `log_level`.
    pub fn init_logging(&self) {
        crate::logger::init_logger(&self.log_level);
    }

    pub fn health_recheck_interval(&self) -> Duration {
        Duration::from_millis(self.health_recheck_ms)
    }

    pub fn ice_restart_grace(&self) -> Duration {
        Duration::from_millis(self.ice_restart_grace_ms)
    }

    pub fn reconnect_poll_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_timings() {
        let config = SessionConfig::default();
        assert_eq!(config.health_recheck_interval(), Duration::from_secs(2));
        assert_eq!(config.reconnect_poll_interval(), Duration::from_secs(10));
        assert_eq!(config.ice_servers.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = SessionConfig::from_toml_str("reconnect_poll_ms = 5000\n").unwrap();
        assert_eq!(config.reconnect_poll_interval(), Duration::from_secs(5));
        assert_eq!(config.health_recheck_ms, 2000);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn configured_log_level_reaches_logger() {
        let config = SessionConfig::from_toml_str("log_level = \"debug\"\n").unwrap();
        assert_eq!(config.log_level, "debug");
        config.init_logging();
        config.init_logging();
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let toml = r#"
            [[ice_servers]]
            id = "relay"
            type = "turn"
            url = "turn.example.org:3478"
        "#;
        let err = SessionConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, CallError::Config(msg) if msg.contains("TURN")));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = SessionConfig::from_toml_str("health_recheck_ms = 0").unwrap_err();
        assert!(matches!(err, CallError::Config(_)));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = SessionConfig::load(std::path::Path::new("/nonexistent/roomcall.toml")).unwrap();
        assert_eq!(config, SessionConfig::default());
    }
}
