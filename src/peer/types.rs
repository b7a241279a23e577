use serde::{Deserialize, Serialize};

/// Сторона сессии
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    Initiator,
    Responder,
}

impl PeerRole {
    pub fn opposite(self) -> PeerRole {
        match self {
            PeerRole::Initiator => PeerRole::Responder,
            PeerRole::Responder => PeerRole::Initiator,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// Описание соединения с метаданными
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DescriptionPayload {
    pub kind: DescriptionKind,
    pub sdp: String,
    pub id: String,
    pub ts: i64,
}

/// ICE кандидат для соединения
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
    pub connection_id: String, // ID соединения для сопоставления
}

/// Полный пакет соединения: описание + собранные кандидаты
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConnectionBundle {
    pub description: DescriptionPayload,
    pub candidates: Vec<IceCandidate>,
}

/// Заявка отвечающей стороны: ответ она сможет построить только
/// после оффера, поэтому слот занимается одной идентичностью
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PeerHello {
    pub id: String,
    pub ts: i64,
}

impl PeerHello {
    pub fn new(id: String) -> Self {
        Self {
            id,
            ts: chrono::Utc::now().timestamp(),
        }
    }
}
