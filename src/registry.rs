use crate::config::{SignalingConfig, CODE_ALPHABET};
use crate::error::SignalingError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Короткий непрозрачный код сессии: фиксированный алфавит, фиксированная длина
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionCode(String);

impl SessionCode {
    fn generate(length: usize) -> Self {
        let alphabet = CODE_ALPHABET.as_bytes();
        let mut rng = rand::rng();
        let code = (0..length)
            .map(|_| alphabet[rng.random_range(0..alphabet.len())] as char)
            .collect();
        SessionCode(code)
    }

    /// Нормализует и проверяет пользовательский ввод; невалидный код
    /// неотличим от несуществующего
    pub fn parse(input: &str, expected_length: usize) -> Option<Self> {
        let code = input.trim().to_ascii_uppercase();
        if code.len() != expected_length {
            return None;
        }
        if !code.chars().all(|c| CODE_ALPHABET.contains(c)) {
            return None;
        }
        Some(SessionCode(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Запись реестра: оффер инициатора + слот для отвечающего
struct PendingSession {
    initiator_payload: String,
    responder_payload: Option<String>,
    issued_at: Instant,
}

/// Реестр кодов: единственный источник правды о том, «жив ли ещё код».
/// Блокировка карты держится только на поиск/вставку/удаление; мутация
/// записи идёт под её собственным мьютексом, чужие сессии не ждут.
pub struct CodeRegistry {
    config: Arc<SignalingConfig>,
    entries: Mutex<HashMap<SessionCode, Arc<Mutex<PendingSession>>>>,
}

impl CodeRegistry {
    pub fn new(config: Arc<SignalingConfig>) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Выдаёт свежий код и запоминает PendingSession с TTL
    pub fn issue(&self, initiator_payload: String) -> Result<SessionCode, SignalingError> {
        let max_attempts = self.config.max_issue_attempts;
        for _ in 0..max_attempts {
            let code = SessionCode::generate(self.config.code_length);
            let mut entries = self.entries.lock().unwrap();
            if entries.contains_key(&code) {
                continue; // коллизия, пробуем другой
            }
            entries.insert(
                code.clone(),
                Arc::new(Mutex::new(PendingSession {
                    initiator_payload,
                    responder_payload: None,
                    issued_at: Instant::now(),
                })),
            );
            debug!(target: "signaling", code = %code, "issued session code");
            return Ok(code);
        }
        Err(SignalingError::RegistryExhausted(max_attempts))
    }

    /// Атомарно занимает слот отвечающего (первый победил) и
    /// возвращает полезную нагрузку инициатора
    pub fn join(
        &self,
        code: &SessionCode,
        responder_payload: String,
    ) -> Result<String, SignalingError> {
        let entry = {
            let entries = self.entries.lock().unwrap();
            entries.get(code).cloned()
        }
        .ok_or(SignalingError::CodeNotFound)?;

        let expired = {
            let mut session = entry.lock().unwrap();
            if session.issued_at.elapsed() >= self.config.code_ttl {
                true
            } else if session.responder_payload.is_some() {
                return Err(SignalingError::CodeAlreadyClaimed);
            } else {
                session.responder_payload = Some(responder_payload);
                return Ok(session.initiator_payload.clone());
            }
        };

        // просроченную запись убираем уже без её мьютекса
        if expired {
            self.expire(code);
        }
        Err(SignalingError::CodeNotFound)
    }

    /// Идемпотентное удаление; зовётся и фоновой чисткой, и негоциатором
    /// на терминальном исходе
    pub fn expire(&self, code: &SessionCode) -> bool {
        let removed = self.entries.lock().unwrap().remove(code).is_some();
        if removed {
            debug!(target: "signaling", code = %code, "session code removed");
        }
        removed
    }

    /// Фоновая чистка просроченных записей; возвращает сколько убрано
    pub fn sweep(&self) -> usize {
        self.sweep_with(|_| {})
    }

    /// Чистка с обратным вызовом на каждый убранный код (снос смежных
    /// ресурсов вроде сессии реле)
    pub fn sweep_with(&self, mut on_expired: impl FnMut(&SessionCode)) -> usize {
        let snapshot: Vec<(SessionCode, Arc<Mutex<PendingSession>>)> = {
            let entries = self.entries.lock().unwrap();
            entries
                .iter()
                .map(|(code, entry)| (code.clone(), entry.clone()))
                .collect()
        };

        let ttl = self.config.code_ttl;
        let expired: Vec<SessionCode> = snapshot
            .into_iter()
            .filter(|(_, entry)| entry.lock().unwrap().issued_at.elapsed() >= ttl)
            .map(|(code, _)| code)
            .collect();

        let mut removed = 0;
        for code in expired {
            if self.expire(&code) {
                on_expired(&code);
                removed += 1;
            }
        }
        if removed > 0 {
            trace!(target: "signaling", removed, "sweep evicted expired codes");
        }
        removed
    }

    pub fn active_codes(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    fn registry() -> CodeRegistry {
        CodeRegistry::new(Arc::new(SignalingConfig::default()))
    }

    #[test]
    fn parse_normalizes_case_and_rejects_garbage() {
        assert_eq!(
            SessionCode::parse("k7qx", 4),
            Some(SessionCode("K7QX".into()))
        );
        assert_eq!(SessionCode::parse(" K7QX \n", 4).unwrap().as_str(), "K7QX");
        assert!(SessionCode::parse("K7Q", 4).is_none()); // короткий
        assert!(SessionCode::parse("K7Q0", 4).is_none()); // '0' вне алфавита
    }

    #[tokio::test]
    async fn issued_codes_are_unique_while_active() {
        let registry = registry();
        let mut seen = HashSet::new();
        for _ in 0..200 {
            let code = registry.issue("payload".into()).unwrap();
            assert!(seen.insert(code), "registry returned an active code twice");
        }
        assert_eq!(registry.active_codes(), 200);
    }

    #[tokio::test]
    async fn join_is_first_writer_wins() {
        let registry = registry();
        let code = registry.issue("offer".into()).unwrap();

        assert_eq!(registry.join(&code, "hello-b".into()).unwrap(), "offer");
        assert!(matches!(
            registry.join(&code, "hello-c".into()),
            Err(SignalingError::CodeAlreadyClaimed)
        ));
    }

    #[tokio::test]
    async fn unknown_code_is_not_found_and_leaves_no_trace() {
        let registry = registry();
        let code = SessionCode::parse("ZZZZ", 4).unwrap();
        assert!(matches!(
            registry.join(&code, "hello".into()),
            Err(SignalingError::CodeNotFound)
        ));
        assert_eq!(registry.active_codes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn code_expires_after_ttl_even_without_sweep() {
        let registry = registry();
        let code = registry.issue("offer".into()).unwrap();

        tokio::time::advance(Duration::from_secs(10 * 60 + 1)).await;

        assert!(matches!(
            registry.join(&code, "hello".into()),
            Err(SignalingError::CodeNotFound)
        ));
        // ленивое истечение тоже убирает запись
        assert_eq!(registry.active_codes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_only_expired() {
        let config = Arc::new(SignalingConfig {
            code_ttl: Duration::from_secs(60),
            ..SignalingConfig::default()
        });
        let registry = CodeRegistry::new(config);

        let old = registry.issue("a".into()).unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        let fresh = registry.issue("b".into()).unwrap();

        assert_eq!(registry.sweep(), 1);
        assert!(matches!(
            registry.join(&old, "x".into()),
            Err(SignalingError::CodeNotFound)
        ));
        assert_eq!(registry.join(&fresh, "x".into()).unwrap(), "b");
    }

    #[tokio::test]
    async fn expire_is_idempotent() {
        let registry = registry();
        let code = registry.issue("offer".into()).unwrap();
        assert!(registry.expire(&code));
        assert!(!registry.expire(&code));
    }

    #[test]
    fn concurrent_issue_never_collides() {
        let registry = Arc::new(registry());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                (0..50)
                    .map(|_| registry.issue("p".into()).unwrap())
                    .collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            for code in handle.join().unwrap() {
                assert!(seen.insert(code));
            }
        }
        assert_eq!(seen.len(), 400);
    }
}
