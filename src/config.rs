// Конфигурация ядра сигналинга.
// Собирается один раз при старте сервиса и передаётся вниз явно,
// никаких глобальных настроек.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Алфавит кодов сессий: URL-safe, без похожих символов (0/O, 1/I)
pub const CODE_ALPHABET: &str = "23456789ABCDEFGHJKLMNPQRSTUVWXYZ";

/// Конфигурация ICE сервера
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IceServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Длина выдаваемого кода сессии
    pub code_length: usize,
    /// Время жизни невостребованного кода
    pub code_ttl: Duration,
    /// Сколько случайных попыток генерации до RegistryExhausted
    pub max_issue_attempts: usize,
    /// Период фоновой чистки реестра
    pub sweep_interval: Duration,
    /// Общий дедлайн на весь handshake
    pub handshake_timeout: Duration,
    /// Таймаут одной попытки проверки достижимости
    pub attempt_timeout: Duration,
    /// Потолок попыток соединения
    pub max_connect_attempts: u32,
    /// Базовая задержка между попытками (удваивается)
    pub connect_backoff: Duration,
    /// Окно первичного сбора кандидатов перед отправкой bundle
    pub candidate_window: Duration,
    /// ICE серверы; при пустом списке берутся дефолтные STUN
    pub ice_servers: Vec<IceServerConfig>,
    /// Хост, на который указывает share-ссылка
    pub share_host: String,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            code_length: 4,
            code_ttl: Duration::from_secs(10 * 60),
            max_issue_attempts: 32,
            sweep_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(60),
            attempt_timeout: Duration::from_secs(10),
            max_connect_attempts: 5,
            connect_backoff: Duration::from_millis(250),
            candidate_window: Duration::from_secs(2),
            ice_servers: Vec::new(),
            share_host: "zippy-two.vercel.app".into(),
        }
    }
}

impl SignalingConfig {
    /// Дефолтные публичные STUN серверы
    pub fn default_ice_servers() -> Vec<IceServerConfig> {
        vec![
            IceServerConfig {
                id: "default-stun".into(),
                r#type: "stun".into(),
                url: "stun:stun.l.google.com:19302".into(),
                username: None,
                credential: None,
            },
            IceServerConfig {
                id: "default-stun-1".into(),
                r#type: "stun".into(),
                url: "stun:stun1.l.google.com:19302".into(),
                username: None,
                credential: None,
            },
        ]
    }

    pub fn ice_servers_or_default(&self) -> Vec<IceServerConfig> {
        if self.ice_servers.is_empty() {
            Self::default_ice_servers()
        } else {
            self.ice_servers.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alphabet_has_no_ambiguous_chars() {
        for c in ['0', 'O', '1', 'I', 'l'] {
            assert!(!CODE_ALPHABET.contains(c));
        }
    }

    #[test]
    fn empty_ice_list_falls_back_to_stun() {
        let cfg = SignalingConfig::default();
        let servers = cfg.ice_servers_or_default();
        assert!(!servers.is_empty());
        assert!(servers.iter().all(|s| s.r#type == "stun"));
    }
}
