use crate::config::SignalingConfig;
use crate::error::SignalingError;
use crate::peer::codec;
use crate::peer::transport::PeerTransport;
use crate::peer::types::{ConnectionBundle, DescriptionKind, PeerHello, PeerRole};
use crate::registry::{CodeRegistry, SessionCode};
use crate::relay::SignalingRelay;
use crate::session::SessionNegotiator;
use crate::share::ShareLink;
use crate::utils::random_id;
use std::sync::Arc;
use tracing::{debug, info};

/// Сервис сигналинга: реестр кодов + реле, собранные на старте процесса
/// и живущие до его остановки. Никаких глобалов — тесты поднимают
/// по независимому сервису на кейс.
pub struct SignalingService {
    config: Arc<SignalingConfig>,
    registry: Arc<CodeRegistry>,
    relay: Arc<SignalingRelay>,
    sweeper: tokio::task::JoinHandle<()>,
}

impl SignalingService {
    pub fn new(config: SignalingConfig) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(CodeRegistry::new(config.clone()));
        let relay = Arc::new(SignalingRelay::new());

        // фоновая чистка просроченных кодов
        let sweeper = {
            let registry = registry.clone();
            let relay = relay.clone();
            let interval = config.sweep_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let swept = registry.sweep_with(|code| relay.close(code));
                    if swept > 0 {
                        debug!(target: "signaling", swept, "expired codes evicted");
                    }
                }
            })
        };

        info!(target: "signaling", host = %config.share_host, "signaling service started");
        Self {
            config,
            registry,
            relay,
            sweeper,
        }
    }

    pub fn config(&self) -> &SignalingConfig {
        &self.config
    }

    /// Сторона A: выдаёт код и негоциатор под него.
    /// Код — непрозрачный URL-safe токен; ссылку для шаринга строит
    /// `share_link`, структуру внутри кода клиенту разбирать нельзя.
    pub async fn create_session(
        &self,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<(SessionCode, SessionNegotiator), SignalingError> {
        if transport.role() != PeerRole::Initiator {
            return Err(SignalingError::violation(
                "create_session needs an initiator transport",
            ));
        }

        let bundle = transport.create_local_description().await?;
        if bundle.description.kind != DescriptionKind::Offer {
            return Err(SignalingError::violation(
                "transport produced a non-offer description for the initiator",
            ));
        }
        let local_id = bundle.description.id.clone();
        let payload = codec::enc(&bundle)
            .map_err(|err| SignalingError::violation(format!("encode offer: {err}")))?;

        let code = self.registry.issue(payload)?;
        self.relay.open(&code);
        let subscription = self.relay.subscribe(&code, PeerRole::Initiator)?;
        let local_candidates = transport.take_candidate_stream().await;

        let negotiator = SessionNegotiator::new(
            code.clone(),
            PeerRole::Initiator,
            local_id,
            None,
            transport,
            self.registry.clone(),
            self.relay.clone(),
            subscription,
            local_candidates,
            self.config.clone(),
        )?;
        Ok((code, negotiator))
    }

    /// Сторона B: занимает код (первый победил) и получает оффер инициатора
    pub async fn join_session(
        &self,
        code: &str,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<SessionNegotiator, SignalingError> {
        if transport.role() != PeerRole::Responder {
            return Err(SignalingError::violation(
                "join_session needs a responder transport",
            ));
        }

        // кривой ввод неотличим от несуществующего кода
        let code = SessionCode::parse(code, self.config.code_length)
            .ok_or(SignalingError::CodeNotFound)?;

        let hello = PeerHello::new(random_id());
        let local_id = hello.id.clone();
        let claim = codec::enc(&hello)
            .map_err(|err| SignalingError::violation(format!("encode hello: {err}")))?;

        let initiator_payload = self.registry.join(&code, claim)?;
        let bundle: ConnectionBundle = codec::dec(&initiator_payload)
            .map_err(|err| SignalingError::violation(format!("decode offer: {err}")))?;

        let subscription = self.relay.subscribe(&code, PeerRole::Responder)?;
        let local_candidates = transport.take_candidate_stream().await;

        SessionNegotiator::new(
            code,
            PeerRole::Responder,
            local_id,
            Some(bundle),
            transport,
            self.registry.clone(),
            self.relay.clone(),
            subscription,
            local_candidates,
            self.config.clone(),
        )
    }

    /// Ссылка вида https://<host>/share?code=<code> — ровно то, что
    /// показывает share-диалог
    pub fn share_link(&self, code: &SessionCode) -> ShareLink {
        ShareLink::new(self.config.share_host.clone(), code.clone())
    }

    /// Сколько кодов сейчас живо (для диагностики и проверок на утечки)
    pub fn active_codes(&self) -> usize {
        self.registry.active_codes()
    }
}

impl Drop for SignalingService {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}
