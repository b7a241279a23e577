use crate::config::IceServerConfig;
use rand::Rng;
use sha2::{Digest, Sha256};

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Короткий отпечаток полезной нагрузки (для логов и метаданных канала)
pub fn payload_fingerprint(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(&digest[..6]) // 48 бит достаточно для сверки на глаз
}

// Функция для добавления схемы протокола к URL ICE сервера, если она отсутствует
pub fn add_ice_url_scheme(config: &IceServerConfig) -> String {
    // Если url уже начинается с "turn:" или "stun:", возвращаем как есть
    if config.url.starts_with("turn:") || config.url.starts_with("stun:") {
        config.url.clone()
    } else {
        // В зависимости от типа сервера добавляем нужную схему
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_id_is_16_hex_chars() {
        let id = random_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let a = payload_fingerprint(b"bundle");
        let b = payload_fingerprint(b"bundle");
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert_ne!(a, payload_fingerprint(b"other"));
    }

    #[test]
    fn ice_url_scheme_added_only_when_missing() {
        let stun = IceServerConfig {
            id: "s".into(),
            r#type: "stun".into(),
            url: "stun.example.org:3478".into(),
            username: None,
            credential: None,
        };
        assert_eq!(add_ice_url_scheme(&stun), "stun:stun.example.org:3478");

        let already = IceServerConfig {
            url: "turn:turn.example.org".into(),
            r#type: "turn".into(),
            ..stun
        };
        assert_eq!(add_ice_url_scheme(&already), "turn:turn.example.org");
    }
}
