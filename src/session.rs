use crate::channel::{ChannelHandle, ChannelMetadata};
use crate::config::SignalingConfig;
use crate::error::SignalingError;
use crate::peer::codec;
use crate::peer::transport::{EstablishedChannel, PeerTransport, TransportError};
use crate::peer::types::{
    ConnectionBundle, DescriptionKind, DescriptionPayload, IceCandidate, PeerRole,
};
use crate::registry::{CodeRegistry, SessionCode};
use crate::relay::{PayloadKind, RelayMessage, RelaySubscription, SignalingRelay};
use crate::utils::payload_fingerprint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace, warn};

/// Состояния handshake. Переходы только вперёд; Aborted достижим
/// из любого нетерминального состояния.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NegotiationState {
    Created,
    CodeReady,
    Negotiating,
    Connected,
    Closed,
    Aborted,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Closed | NegotiationState::Aborted)
    }
}

/// Локальное состояние одного handshake; принадлежит ровно одному
/// негоциатору и между пирами не разделяется
pub struct NegotiationContext {
    role: PeerRole,
    local_id: String,
    remote_description: Option<DescriptionPayload>,
    remote_candidates: Vec<IceCandidate>,
    state: NegotiationState,
}

impl NegotiationContext {
    fn new(role: PeerRole, local_id: String) -> Self {
        Self {
            role,
            local_id,
            remote_description: None,
            remote_candidates: Vec::new(),
            state: NegotiationState::Created,
        }
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    fn advance(&mut self, next: NegotiationState) -> Result<(), SignalingError> {
        let current = self.state;
        let allowed = if next == NegotiationState::Aborted {
            !current.is_terminal()
        } else {
            !current.is_terminal() && next > current
        };
        if !allowed {
            return Err(SignalingError::violation(format!(
                "illegal state transition {current:?} -> {next:?}"
            )));
        }
        trace!(target: "signaling", role = ?self.role, from = ?current, to = ?next, "state");
        self.state = next;
        Ok(())
    }
}

#[derive(Default)]
struct AbortSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    fn trigger(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    async fn aborted(&self) {
        loop {
            let notified = self.notify.notified();
            if self.flag.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// Ручка локального аборта: снимает негоциатор с любого ожидания
#[derive(Clone)]
pub struct AbortHandle {
    signal: Arc<AbortSignal>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.signal.trigger();
    }

    pub fn is_aborted(&self) -> bool {
        self.signal.flag.load(Ordering::SeqCst)
    }
}

enum ConnectOutcome {
    /// Временный сбой, имеет смысл повторить
    Retry(String),
    Fatal(SignalingError),
}

/// Машина handshake одного пира: доводит обмен до готового канала
/// либо до единственной терминальной ошибки.
pub struct SessionNegotiator {
    code: SessionCode,
    context: NegotiationContext,
    transport: Arc<dyn PeerTransport>,
    registry: Arc<CodeRegistry>,
    relay: Arc<SignalingRelay>,
    subscription: Option<RelaySubscription>,
    local_candidates: Option<mpsc::UnboundedReceiver<IceCandidate>>,
    /// Оффер инициатора (только у отвечающей стороны)
    remote_bundle: Option<ConnectionBundle>,
    abort: Arc<AbortSignal>,
    config: Arc<SignalingConfig>,
    released: bool,
}

impl SessionNegotiator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        code: SessionCode,
        role: PeerRole,
        local_id: String,
        remote_bundle: Option<ConnectionBundle>,
        transport: Arc<dyn PeerTransport>,
        registry: Arc<CodeRegistry>,
        relay: Arc<SignalingRelay>,
        subscription: RelaySubscription,
        local_candidates: Option<mpsc::UnboundedReceiver<IceCandidate>>,
        config: Arc<SignalingConfig>,
    ) -> Result<Self, SignalingError> {
        let mut context = NegotiationContext::new(role, local_id);
        context.advance(NegotiationState::CodeReady)?;
        Ok(Self {
            code,
            context,
            transport,
            registry,
            relay,
            subscription: Some(subscription),
            local_candidates,
            remote_bundle,
            abort: Arc::new(AbortSignal::default()),
            config,
            released: false,
        })
    }

    pub fn code(&self) -> &SessionCode {
        &self.code
    }

    pub fn state(&self) -> NegotiationState {
        self.context.state()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            signal: self.abort.clone(),
        }
    }

    /// Доводит handshake до конца. Канал отдаётся ровно один раз;
    /// любой другой исход — одна терминальная ошибка, ресурсы
    /// в обоих случаях освобождены.
    pub async fn negotiate(mut self) -> Result<ChannelHandle, SignalingError> {
        let abort = self.abort.clone();
        let deadline = tokio::time::sleep(self.config.handshake_timeout);
        tokio::pin!(deadline);

        let result = tokio::select! {
            res = self.drive() => res,
            _ = &mut deadline => Err(SignalingError::HandshakeTimeout),
            _ = abort.aborted() => Err(SignalingError::PeerAborted),
        };
        self.finish(result).await
    }

    async fn drive(&mut self) -> Result<ChannelHandle, SignalingError> {
        self.context.advance(NegotiationState::Negotiating)?;
        match self.context.role {
            PeerRole::Responder => self.send_answer().await?,
            PeerRole::Initiator => self.await_answer().await?,
        }
        self.establish().await
    }

    /// B-сторона: применяем оффер, строим ответ, шлём его через реле
    async fn send_answer(&mut self) -> Result<(), SignalingError> {
        let bundle = self
            .remote_bundle
            .take()
            .ok_or_else(|| SignalingError::violation("responder started without an offer"))?;
        self.apply_remote_bundle(bundle, DescriptionKind::Offer)
            .await?;

        let local = self.transport.create_local_description().await?;
        if local.description.kind != DescriptionKind::Answer {
            return Err(SignalingError::violation(
                "transport produced a non-answer description for the responder",
            ));
        }
        let payload = codec::enc(&local)
            .map_err(|err| SignalingError::violation(format!("encode answer: {err}")))?;
        self.relay
            .send(RelayMessage {
                code: self.code.clone(),
                sender: PeerRole::Responder,
                kind: PayloadKind::Answer,
                payload,
            })
            // сессии реле уже нет — инициатор ушёл, пока мы собирали ответ
            .map_err(|_| SignalingError::PeerAborted)?;
        debug!(target: "signaling", code = %self.code, "answer sent");
        Ok(())
    }

    /// A-сторона: ждём ответ, по пути применяя кандидатов
    async fn await_answer(&mut self) -> Result<(), SignalingError> {
        loop {
            tokio::select! {
                message = Self::next_message(&mut self.subscription) => {
                    let Some(message) = message else {
                        // реле снесли до ответа — пир ушёл
                        return Err(SignalingError::PeerAborted);
                    };
                    self.check_sender(&message)?;
                    match message.kind {
                        PayloadKind::Answer => {
                            let bundle: ConnectionBundle = codec::dec(&message.payload).map_err(
                                |err| SignalingError::violation(format!("decode answer: {err}")),
                            )?;
                            self.apply_remote_bundle(bundle, DescriptionKind::Answer).await?;
                            return Ok(());
                        }
                        PayloadKind::Candidate => self.accept_candidate_message(&message)?,
                        PayloadKind::Abort => return Err(SignalingError::PeerAborted),
                        PayloadKind::Offer => {
                            return Err(SignalingError::violation("initiator received an offer"));
                        }
                    }
                }
                candidate = Self::next_candidate(&mut self.local_candidates) => {
                    if let Some(candidate) = candidate {
                        self.forward_candidate(candidate);
                    }
                }
            }
        }
    }

    /// Попытки соединения с экспоненциальным бэкоффом до потолка
    async fn establish(&mut self) -> Result<ChannelHandle, SignalingError> {
        let max_attempts = self.config.max_connect_attempts;
        let mut backoff = self.config.connect_backoff;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.attempt_connect().await {
                Ok(parts) => {
                    self.context.advance(NegotiationState::Connected)?;
                    let description =
                        self.context.remote_description.as_ref().ok_or_else(|| {
                            SignalingError::violation("connected without a remote description")
                        })?;
                    let metadata = ChannelMetadata {
                        peer_token: description.id.clone(),
                        fingerprint: payload_fingerprint(description.sdp.as_bytes()),
                        established_at: chrono::Utc::now(),
                    };
                    info!(
                        target: "signaling",
                        code = %self.code,
                        role = ?self.context.role,
                        local = %self.context.local_id,
                        peer = %metadata.peer_token,
                        remote_candidates = self.context.remote_candidates.len(),
                        attempt,
                        "peer link established"
                    );
                    return Ok(ChannelHandle::new(parts, metadata));
                }
                Err(ConnectOutcome::Fatal(err)) => return Err(err),
                Err(ConnectOutcome::Retry(reason)) => {
                    if attempt >= max_attempts {
                        warn!(
                            target: "signaling",
                            code = %self.code,
                            attempts = attempt,
                            "connect attempt ceiling reached"
                        );
                        return Err(SignalingError::HandshakeTimeout);
                    }
                    debug!(
                        target: "signaling",
                        code = %self.code,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        reason = %reason,
                        "connect attempt failed, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
    }

    /// Одна попытка: соединяемся, параллельно принимая trickle-кандидатов
    async fn attempt_connect(&mut self) -> Result<EstablishedChannel, ConnectOutcome> {
        let transport = self.transport.clone();
        let connect = transport.connect(self.config.attempt_timeout);
        tokio::pin!(connect);
        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok(parts) => Ok(parts),
                        Err(TransportError::Unreachable(reason)) => {
                            Err(ConnectOutcome::Retry(reason))
                        }
                        Err(other) => Err(ConnectOutcome::Fatal(other.into())),
                    };
                }
                message = Self::next_message(&mut self.subscription) => {
                    // None: реле уже снесено, кандидаты больше не придут —
                    // попытка продолжается на том, что есть
                    if let Some(message) = message {
                        if let Err(err) = self.handle_negotiating_message(&message).await {
                            return Err(ConnectOutcome::Fatal(err));
                        }
                    }
                }
                candidate = Self::next_candidate(&mut self.local_candidates) => {
                    if let Some(candidate) = candidate {
                        self.forward_candidate(candidate);
                    }
                }
            }
        }
    }

    async fn handle_negotiating_message(
        &mut self,
        message: &RelayMessage,
    ) -> Result<(), SignalingError> {
        self.check_sender(message)?;
        match message.kind {
            PayloadKind::Candidate => self.accept_candidate_message(message),
            PayloadKind::Abort => Err(SignalingError::PeerAborted),
            PayloadKind::Answer | PayloadKind::Offer => Err(SignalingError::violation(format!(
                "unexpected {:?} while negotiating",
                message.kind
            ))),
        }
    }

    /// Конверт от «своей» роли — подделка или ошибка маршрутизации
    fn check_sender(&self, message: &RelayMessage) -> Result<(), SignalingError> {
        if message.sender != self.context.role.opposite() {
            return Err(SignalingError::violation(format!(
                "envelope from wrong sender {:?}",
                message.sender
            )));
        }
        Ok(())
    }

    fn accept_candidate_message(&mut self, message: &RelayMessage) -> Result<(), SignalingError> {
        let candidate: IceCandidate = serde_json::from_str(&message.payload)
            .map_err(|err| SignalingError::violation(format!("decode candidate: {err}")))?;
        self.context.remote_candidates.push(candidate.clone());
        let transport = self.transport.clone();
        tokio::spawn(async move {
            // неподходящий кандидат не валит сессию
            if let Err(err) = transport.add_remote_candidate(candidate).await {
                warn!(target: "signaling", error = %err, "failed to apply remote candidate");
            }
        });
        Ok(())
    }

    async fn apply_remote_bundle(
        &mut self,
        bundle: ConnectionBundle,
        expected: DescriptionKind,
    ) -> Result<(), SignalingError> {
        if bundle.description.kind != expected {
            return Err(SignalingError::violation(format!(
                "expected {:?}, got {:?}",
                expected, bundle.description.kind
            )));
        }
        self.transport
            .apply_remote_description(bundle.description.clone())
            .await?;
        debug!(
            target: "signaling",
            code = %self.code,
            peer = %bundle.description.id,
            fingerprint = %payload_fingerprint(bundle.description.sdp.as_bytes()),
            candidates = bundle.candidates.len(),
            "remote description applied"
        );
        self.context.remote_description = Some(bundle.description);
        for candidate in bundle.candidates {
            self.context.remote_candidates.push(candidate.clone());
            if let Err(err) = self.transport.add_remote_candidate(candidate).await {
                warn!(target: "signaling", error = %err, "failed to apply bundled candidate");
            }
        }
        Ok(())
    }

    fn forward_candidate(&mut self, candidate: IceCandidate) {
        let payload = match serde_json::to_string(&candidate) {
            Ok(payload) => payload,
            Err(_) => return,
        };
        let envelope = RelayMessage {
            code: self.code.clone(),
            sender: self.context.role,
            kind: PayloadKind::Candidate,
            payload,
        };
        if let Err(err) = self.relay.send(envelope) {
            // сессии реле уже нет — пир либо подключился, либо ушёл
            trace!(target: "signaling", error = %err, "local candidate not forwarded");
        }
    }

    async fn finish(
        mut self,
        result: Result<ChannelHandle, SignalingError>,
    ) -> Result<ChannelHandle, SignalingError> {
        match result {
            Ok(handle) => {
                let _ = self.context.advance(NegotiationState::Closed);
                self.release(false).await;
                Ok(handle)
            }
            Err(err) => {
                // fail closed: уведомляем пира и сносим всё своё
                let _ = self.relay.send(RelayMessage {
                    code: self.code.clone(),
                    sender: self.context.role,
                    kind: PayloadKind::Abort,
                    payload: String::new(),
                });
                let _ = self.context.advance(NegotiationState::Aborted);
                warn!(
                    target: "signaling",
                    code = %self.code,
                    role = ?self.context.role,
                    error = %err,
                    "negotiation aborted"
                );
                self.release(true).await;
                Err(err)
            }
        }
    }

    /// Освобождение ресурсов: ровно один раз, идемпотентно по составным частям
    async fn release(&mut self, shutdown_transport: bool) {
        if self.released {
            return;
        }
        self.released = true;
        self.registry.expire(&self.code);
        self.subscription = None;
        self.relay.close(&self.code);
        if shutdown_transport {
            self.transport.shutdown().await;
        }
        debug!(target: "signaling", code = %self.code, "session resources released");
    }

    async fn next_message(
        subscription: &mut Option<RelaySubscription>,
    ) -> Option<RelayMessage> {
        match subscription {
            Some(sub) => match sub.recv().await {
                Some(message) => Some(message),
                None => {
                    *subscription = None;
                    None
                }
            },
            None => std::future::pending().await,
        }
    }

    async fn next_candidate(
        stream: &mut Option<mpsc::UnboundedReceiver<IceCandidate>>,
    ) -> Option<IceCandidate> {
        match stream {
            Some(rx) => match rx.recv().await {
                Some(candidate) => Some(candidate),
                None => {
                    *stream = None;
                    None
                }
            },
            None => std::future::pending().await,
        }
    }
}

impl Drop for SessionNegotiator {
    fn drop(&mut self) {
        // на случай отмены negotiate: синхронная часть освобождения
        if !self.released {
            self.released = true;
            self.registry.expire(&self.code);
            self.relay.close(&self.code);
        }
    }
}
