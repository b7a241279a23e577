use crate::peer::transport::{EstablishedChannel, PeerTransport, TransportError};
use crate::peer::types::{
    ConnectionBundle, DescriptionKind, DescriptionPayload, IceCandidate, PeerRole,
};
use crate::utils::random_id;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// Общее состояние пары: линк готов, когда обе стороны применили
/// описание противоположной
#[derive(Default)]
struct MemoryLink {
    initiator_applied: AtomicBool,
    responder_applied: AtomicBool,
    closed: AtomicBool,
    notify: Notify,
}

impl MemoryLink {
    fn mark_applied(&self, role: PeerRole) {
        match role {
            PeerRole::Initiator => self.initiator_applied.store(true, Ordering::SeqCst),
            PeerRole::Responder => self.responder_applied.store(true, Ordering::SeqCst),
        }
        self.notify.notify_waiters();
    }

    fn both_applied(&self) -> bool {
        self.initiator_applied.load(Ordering::SeqCst)
            && self.responder_applied.load(Ordering::SeqCst)
    }
}

/// Внутрипроцессный транспорт-петля: те же контракты, что у боевого,
/// но линк — пара mpsc-каналов. Используется тестами и локальными
/// демками; умеет имитировать временные сбои соединения.
pub struct MemoryTransport {
    role: PeerRole,
    link: Arc<MemoryLink>,
    connection_id: Mutex<String>,
    /// (наш tx к пиру, наш rx от пира); забирается при первом connect
    endpoints: Mutex<Option<(mpsc::UnboundedSender<Bytes>, mpsc::UnboundedReceiver<Bytes>)>>,
    trickle_tx: mpsc::UnboundedSender<IceCandidate>,
    trickle_rx: Mutex<Option<mpsc::UnboundedReceiver<IceCandidate>>>,
    remote_description: Mutex<Option<DescriptionPayload>>,
    remote_candidates: Mutex<Vec<IceCandidate>>,
    /// Сколько ближайших connect-ов должно сорваться
    fail_budget: AtomicU32,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let link = Arc::new(MemoryLink::default());
        let (initiator_tx, responder_rx) = mpsc::unbounded_channel();
        let (responder_tx, initiator_rx) = mpsc::unbounded_channel();
        (
            Self::side(PeerRole::Initiator, link.clone(), initiator_tx, initiator_rx),
            Self::side(PeerRole::Responder, link, responder_tx, responder_rx),
        )
    }

    fn side(
        role: PeerRole,
        link: Arc<MemoryLink>,
        tx: mpsc::UnboundedSender<Bytes>,
        rx: mpsc::UnboundedReceiver<Bytes>,
    ) -> MemoryTransport {
        let (trickle_tx, trickle_rx) = mpsc::unbounded_channel();
        MemoryTransport {
            role,
            link,
            connection_id: Mutex::new(random_id()),
            endpoints: Mutex::new(Some((tx, rx))),
            trickle_tx,
            trickle_rx: Mutex::new(Some(trickle_rx)),
            remote_description: Mutex::new(None),
            remote_candidates: Mutex::new(Vec::new()),
            fail_budget: AtomicU32::new(0),
        }
    }

    /// Следующие `n` попыток connect завершатся временным сбоем
    pub fn fail_connects(&self, n: u32) {
        self.fail_budget.store(n, Ordering::SeqCst);
    }

    pub fn remote_candidate_count(&self) -> usize {
        self.remote_candidates.lock().unwrap().len()
    }

    fn host_candidate(&self, id: &str) -> IceCandidate {
        IceCandidate {
            candidate: "candidate:0 1 UDP 2122252543 127.0.0.1 9 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            connection_id: id.to_string(),
        }
    }

    async fn wait_both_applied(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.link.notify.notified();
                if self.link.both_applied() {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    fn role(&self) -> PeerRole {
        self.role
    }

    async fn create_local_description(&self) -> Result<ConnectionBundle, TransportError> {
        let kind = match self.role {
            PeerRole::Initiator => DescriptionKind::Offer,
            PeerRole::Responder => {
                if self.remote_description.lock().unwrap().is_none() {
                    return Err(TransportError::Setup(
                        "answer requested before remote offer".into(),
                    ));
                }
                DescriptionKind::Answer
            }
        };
        let id = self.connection_id.lock().unwrap().clone();

        // один кандидат в bundle и один trickle-ом, как в жизни
        let _ = self.trickle_tx.send(self.host_candidate(&id));

        Ok(ConnectionBundle {
            description: DescriptionPayload {
                kind,
                sdp: format!("v=0 zippy-memory {}", id),
                id: id.clone(),
                ts: chrono::Utc::now().timestamp(),
            },
            candidates: vec![self.host_candidate(&id)],
        })
    }

    async fn apply_remote_description(
        &self,
        description: DescriptionPayload,
    ) -> Result<(), TransportError> {
        if self.role == PeerRole::Responder {
            *self.connection_id.lock().unwrap() = description.id.clone();
        }
        *self.remote_description.lock().unwrap() = Some(description);
        self.link.mark_applied(self.role);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.remote_candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn take_candidate_stream(&self) -> Option<mpsc::UnboundedReceiver<IceCandidate>> {
        self.trickle_rx.lock().unwrap().take()
    }

    async fn connect(
        &self,
        attempt_timeout: Duration,
    ) -> Result<EstablishedChannel, TransportError> {
        if self.link.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.fail_budget.load(Ordering::SeqCst) > 0 {
            self.fail_budget.fetch_sub(1, Ordering::SeqCst);
            return Err(TransportError::Unreachable("injected failure".into()));
        }
        if !self.wait_both_applied(attempt_timeout).await {
            return Err(TransportError::Unreachable(
                "peer has not applied a description yet".into(),
            ));
        }

        let (tx, rx) = self
            .endpoints
            .lock()
            .unwrap()
            .take()
            .ok_or(TransportError::Closed)?;

        let shutdown = Arc::new(Notify::new());
        {
            let shutdown = shutdown.clone();
            let link = self.link.clone();
            tokio::spawn(async move {
                shutdown.notified().await;
                link.closed.store(true, Ordering::SeqCst);
                link.notify.notify_waiters();
            });
        }

        Ok(EstablishedChannel {
            outbound: tx,
            inbound: rx,
            shutdown,
        })
    }

    async fn shutdown(&self) {
        self.link.closed.store(true, Ordering::SeqCst);
        self.link.notify.notify_waiters();
        // наш конец умирает вместе с отправителем
        self.endpoints.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_echoes_bytes_once_both_applied() {
        let (a, b) = MemoryTransport::pair();
        let offer = a.create_local_description().await.unwrap();
        b.apply_remote_description(offer.description).await.unwrap();
        let answer = b.create_local_description().await.unwrap();
        a.apply_remote_description(answer.description).await.unwrap();

        let mut ea = a.connect(Duration::from_secs(1)).await.unwrap();
        let eb = b.connect(Duration::from_secs(1)).await.unwrap();

        eb.outbound.send(Bytes::from_static(b"hi")).unwrap();
        assert_eq!(ea.inbound.recv().await.unwrap(), Bytes::from_static(b"hi"));
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let (a, b) = MemoryTransport::pair();
        let offer = a.create_local_description().await.unwrap();
        b.apply_remote_description(offer.description).await.unwrap();
        let answer = b.create_local_description().await.unwrap();
        a.apply_remote_description(answer.description).await.unwrap();

        a.fail_connects(2);
        for _ in 0..2 {
            assert!(matches!(
                a.connect(Duration::from_millis(100)).await,
                Err(TransportError::Unreachable(_))
            ));
        }
        assert!(a.connect(Duration::from_millis(100)).await.is_ok());
    }

    #[tokio::test]
    async fn answer_before_offer_is_a_setup_error() {
        let (_a, b) = MemoryTransport::pair();
        assert!(matches!(
            b.create_local_description().await,
            Err(TransportError::Setup(_))
        ));
    }

    #[tokio::test]
    async fn connect_times_out_until_peer_applies() {
        let (a, b) = MemoryTransport::pair();
        let offer = a.create_local_description().await.unwrap();
        b.apply_remote_description(offer.description).await.unwrap();
        // инициатор ещё не применил ответ
        assert!(matches!(
            b.connect(Duration::from_millis(50)).await,
            Err(TransportError::Unreachable(_))
        ));
    }
}
