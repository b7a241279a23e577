use crate::error::SignalingError;
use crate::peer::types::PeerRole;
use crate::registry::SessionCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, trace};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Offer,
    Answer,
    Candidate,
    Abort,
}

/// Конверт сообщения сигналинга. Содержимое payload для реле непрозрачно —
/// оно только маршрутизирует конверт противоположной роли.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RelayMessage {
    pub code: SessionCode,
    pub sender: PeerRole,
    pub kind: PayloadKind,
    pub payload: String,
}

/// Почтовый ящик одной роли: tx живёт в реле, rx выдаётся подписчику
struct Mailbox {
    tx: mpsc::UnboundedSender<RelayMessage>,
    rx: Option<mpsc::UnboundedReceiver<RelayMessage>>,
}

impl Mailbox {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

struct RelaySession {
    initiator: Mailbox,
    responder: Mailbox,
}

impl RelaySession {
    fn mailbox_mut(&mut self, role: PeerRole) -> &mut Mailbox {
        match role {
            PeerRole::Initiator => &mut self.initiator,
            PeerRole::Responder => &mut self.responder,
        }
    }
}

/// Реле: типизированный pub/sub на два конца, по одному на роль,
/// в рамках одного кода сессии. Полезные нагрузки не интерпретирует
/// и после доставки ничего не хранит.
pub struct SignalingRelay {
    sessions: Mutex<HashMap<SessionCode, RelaySession>>,
}

impl SignalingRelay {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Создаёт сессию реле под только что выданный код
    pub fn open(&self, code: &SessionCode) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.entry(code.clone()).or_insert_with(|| RelaySession {
            initiator: Mailbox::new(),
            responder: Mailbox::new(),
        });
        trace!(target: "signaling", code = %code, "relay session opened");
    }

    /// Идемпотентный снос: недоставленные сообщения пропадают вместе с ящиками
    pub fn close(&self, code: &SessionCode) {
        if self.sessions.lock().unwrap().remove(code).is_some() {
            debug!(target: "signaling", code = %code, "relay session closed");
        }
    }

    pub fn session_exists(&self, code: &SessionCode) -> bool {
        self.sessions.lock().unwrap().contains_key(code)
    }

    /// Доставка противоположной роли; FIFO в рамках отправителя
    pub fn send(&self, message: RelayMessage) -> Result<(), SignalingError> {
        let sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get(&message.code)
            .ok_or(SignalingError::CodeNotFound)?;
        let mailbox = match message.sender.opposite() {
            PeerRole::Initiator => &session.initiator,
            PeerRole::Responder => &session.responder,
        };
        trace!(
            target: "signaling",
            code = %message.code,
            sender = ?message.sender,
            kind = ?message.kind,
            "relaying message"
        );
        // rx не может быть уничтожен, пока сессия существует
        mailbox
            .tx
            .send(message)
            .map_err(|_| SignalingError::CodeNotFound)
    }

    /// Подписка роли на входящие. На (код, роль) — не больше одной живой
    /// подписки; drop подписки возвращает ящик, и пока сессия существует,
    /// можно подписаться заново.
    pub fn subscribe(
        self: &Arc<Self>,
        code: &SessionCode,
        role: PeerRole,
    ) -> Result<RelaySubscription, SignalingError> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(code).ok_or(SignalingError::CodeNotFound)?;
        let rx = session
            .mailbox_mut(role)
            .rx
            .take()
            .ok_or(SignalingError::SessionFull)?;
        Ok(RelaySubscription {
            relay: Arc::clone(self),
            code: code.clone(),
            role,
            rx: Some(rx),
        })
    }

    fn restore(&self, code: &SessionCode, role: PeerRole, rx: mpsc::UnboundedReceiver<RelayMessage>) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get_mut(code) {
            session.mailbox_mut(role).rx = Some(rx);
        }
        // сессии уже нет — ящик умирает вместе с очередью
    }
}

/// Отменяемый поток входящих конвертов одной роли
pub struct RelaySubscription {
    relay: Arc<SignalingRelay>,
    code: SessionCode,
    role: PeerRole,
    rx: Option<mpsc::UnboundedReceiver<RelayMessage>>,
}

impl RelaySubscription {
    /// `None` — сессия снесена и очередь исчерпана
    pub async fn recv(&mut self) -> Option<RelayMessage> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }
}

impl Drop for RelaySubscription {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.take() {
            self.relay.restore(&self.code, self.role, rx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(s: &str) -> SessionCode {
        SessionCode::parse(s, s.len()).unwrap()
    }

    fn envelope(code_: &SessionCode, sender: PeerRole, n: u32) -> RelayMessage {
        RelayMessage {
            code: code_.clone(),
            sender,
            kind: PayloadKind::Candidate,
            payload: format!("payload-{n}"),
        }
    }

    #[tokio::test]
    async fn routes_to_opposite_role_in_fifo_order() {
        let relay = Arc::new(SignalingRelay::new());
        let code = code("K7QX");
        relay.open(&code);

        let mut responder = relay.subscribe(&code, PeerRole::Responder).unwrap();
        for n in 0..3 {
            relay.send(envelope(&code, PeerRole::Initiator, n)).unwrap();
        }
        for n in 0..3 {
            let msg = responder.recv().await.unwrap();
            assert_eq!(msg.payload, format!("payload-{n}"));
            assert_eq!(msg.sender, PeerRole::Initiator);
        }
    }

    #[tokio::test]
    async fn second_live_subscription_is_rejected() {
        let relay = Arc::new(SignalingRelay::new());
        let code = code("K7QX");
        relay.open(&code);

        let first = relay.subscribe(&code, PeerRole::Initiator).unwrap();
        assert!(matches!(
            relay.subscribe(&code, PeerRole::Initiator),
            Err(SignalingError::SessionFull)
        ));
        // другая роль — свой ящик
        let _responder = relay.subscribe(&code, PeerRole::Responder).unwrap();

        // после drop подписка той же роли снова возможна
        drop(first);
        assert!(relay.subscribe(&code, PeerRole::Initiator).is_ok());
    }

    #[tokio::test]
    async fn send_to_unknown_session_fails() {
        let relay = Arc::new(SignalingRelay::new());
        let code = code("K7QX");
        assert!(matches!(
            relay.send(envelope(&code, PeerRole::Initiator, 0)),
            Err(SignalingError::CodeNotFound)
        ));
    }

    #[tokio::test]
    async fn teardown_ends_streams_and_drops_undelivered() {
        let relay = Arc::new(SignalingRelay::new());
        let code = code("K7QX");
        relay.open(&code);

        let mut responder = relay.subscribe(&code, PeerRole::Responder).unwrap();
        relay.send(envelope(&code, PeerRole::Initiator, 0)).unwrap();
        relay.close(&code);
        relay.close(&code); // идемпотентно

        // что успело попасть в очередь — дочитывается, дальше конец потока
        assert!(responder.recv().await.is_some());
        assert!(responder.recv().await.is_none());
        assert!(!relay.session_exists(&code));
    }

    #[tokio::test]
    async fn resubscribe_after_drop_keeps_queued_messages() {
        let relay = Arc::new(SignalingRelay::new());
        let code = code("K7QX");
        relay.open(&code);

        let sub = relay.subscribe(&code, PeerRole::Responder).unwrap();
        drop(sub);
        relay.send(envelope(&code, PeerRole::Initiator, 7)).unwrap();

        let mut again = relay.subscribe(&code, PeerRole::Responder).unwrap();
        assert_eq!(again.recv().await.unwrap().payload, "payload-7");
    }
}
