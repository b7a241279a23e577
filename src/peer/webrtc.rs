use crate::config::SignalingConfig;
use crate::peer::transport::{EstablishedChannel, PeerTransport, TransportError};
use crate::peer::types::{
    ConnectionBundle, DescriptionKind, DescriptionPayload, IceCandidate, PeerRole,
};
use crate::utils::{add_ice_url_scheme, random_id};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::sleep;
use tracing::{debug, trace, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

const DATA_CHANNEL_LABEL: &str = "zippy-data";

fn setup_err(err: impl std::fmt::Display) -> TransportError {
    TransportError::Setup(err.to_string())
}

/// Транспорт поверх RTCPeerConnection: trickle ICE, отложенные
/// кандидаты до remote description, data channel как байтовый линк
pub struct WebrtcTransport {
    role: PeerRole,
    pc: Arc<RTCPeerConnection>,
    candidate_window: Duration,
    /// id соединения; у ответа — наследуется из оффера
    connection_id: Mutex<String>,
    state_rx: watch::Receiver<RTCPeerConnectionState>,
    dc_slot: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    dc_open: Arc<AtomicBool>,
    dc_ready: Arc<Notify>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    local_candidates: Arc<Mutex<Vec<IceCandidate>>>,
    gathering_complete: Arc<AtomicBool>,
    trickle_rx: Mutex<Option<mpsc::UnboundedReceiver<IceCandidate>>>,
    /// Кандидаты, полученные до установки remote description
    pending_remote: Mutex<Vec<IceCandidate>>,
    remote_set: AtomicBool,
}

impl WebrtcTransport {
    pub async fn new(config: &SignalingConfig, role: PeerRole) -> Result<Self, TransportError> {
        let api = APIBuilder::new().build();
        let pc = Arc::new(
            api.new_peer_connection(Self::rtc_config(config))
                .await
                .map_err(setup_err)?,
        );

        let connection_id = random_id();

        let (state_tx, state_rx) = watch::channel(RTCPeerConnectionState::New);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            trace!(target: "transport", ?state, "peer connection state");
            let _ = state_tx.send(state);
            Box::pin(async {})
        }));

        // сбор локальных кандидатов: снимок для bundle + trickle-поток
        let local_candidates = Arc::new(Mutex::new(Vec::new()));
        let gathering_complete = Arc::new(AtomicBool::new(false));
        let (trickle_tx, trickle_rx) = mpsc::unbounded_channel();
        {
            let local_candidates = local_candidates.clone();
            let gathering_complete = gathering_complete.clone();
            let conn_id = connection_id.clone();
            pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
                if let Some(c) = cand {
                    if let Ok(init) = c.to_json() {
                        let candidate = IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            connection_id: conn_id.clone(),
                        };
                        local_candidates.lock().unwrap().push(candidate.clone());
                        let _ = trickle_tx.send(candidate);
                    }
                } else {
                    // None означает конец сбора
                    gathering_complete.store(true, Ordering::SeqCst);
                }
                Box::pin(async {})
            }));
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let inbound_slot = Arc::new(Mutex::new(Some(inbound_tx)));
        let dc_slot: Arc<Mutex<Option<Arc<RTCDataChannel>>>> = Arc::new(Mutex::new(None));
        let dc_open = Arc::new(AtomicBool::new(false));
        let dc_ready = Arc::new(Notify::new());

        match role {
            PeerRole::Initiator => {
                // инициатор сам открывает data channel
                let dc = pc
                    .create_data_channel(DATA_CHANNEL_LABEL, Some(RTCDataChannelInit::default()))
                    .await
                    .map_err(setup_err)?;
                Self::attach_data_channel(&dc, &inbound_slot, &dc_open, &dc_ready);
                *dc_slot.lock().unwrap() = Some(dc);
            }
            PeerRole::Responder => {
                let dc_slot = dc_slot.clone();
                let inbound_slot = inbound_slot.clone();
                let dc_open = dc_open.clone();
                let dc_ready = dc_ready.clone();
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    debug!(target: "transport", label = %dc.label(), "data channel announced");
                    Self::attach_data_channel(&dc, &inbound_slot, &dc_open, &dc_ready);
                    *dc_slot.lock().unwrap() = Some(dc);
                    Box::pin(async {})
                }));
            }
        }

        Ok(Self {
            role,
            pc,
            candidate_window: config.candidate_window,
            connection_id: Mutex::new(connection_id),
            state_rx,
            dc_slot,
            dc_open,
            dc_ready,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            local_candidates,
            gathering_complete,
            trickle_rx: Mutex::new(Some(trickle_rx)),
            pending_remote: Mutex::new(Vec::new()),
            remote_set: AtomicBool::new(false),
        })
    }

    fn rtc_config(config: &SignalingConfig) -> RTCConfiguration {
        let ice_servers = config
            .ice_servers_or_default()
            .into_iter()
            .map(|server| {
                let url = add_ice_url_scheme(&server);
                RTCIceServer {
                    urls: vec![url],
                    username: server.username.unwrap_or_default(),
                    credential: server.credential.unwrap_or_default(),
                }
            })
            .collect();

        RTCConfiguration {
            ice_servers,
            ice_candidate_pool_size: 10,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }

    fn attach_data_channel(
        dc: &Arc<RTCDataChannel>,
        inbound: &Arc<Mutex<Option<mpsc::UnboundedSender<Bytes>>>>,
        open: &Arc<AtomicBool>,
        ready: &Arc<Notify>,
    ) {
        {
            let open = open.clone();
            let ready = ready.clone();
            dc.on_open(Box::new(move || {
                open.store(true, Ordering::SeqCst);
                ready.notify_waiters();
                Box::pin(async {})
            }));
        }
        {
            let inbound = inbound.clone();
            dc.on_message(Box::new(move |msg: DataChannelMessage| {
                if let Some(tx) = inbound.lock().unwrap().as_ref() {
                    let _ = tx.send(msg.data);
                }
                Box::pin(async {})
            }));
        }
        {
            let inbound = inbound.clone();
            let open = open.clone();
            dc.on_close(Box::new(move || {
                open.store(false, Ordering::SeqCst);
                // конец входящего потока для хэндла
                inbound.lock().unwrap().take();
                Box::pin(async {})
            }));
        }
    }

    /// Окно первичного сбора: bundle уходит с тем, что успело собраться,
    /// остальное дойдёт trickle-ом
    async fn wait_for_candidates(&self, window: Duration) {
        let start = tokio::time::Instant::now();
        while !self.gathering_complete.load(Ordering::SeqCst) && start.elapsed() < window {
            sleep(Duration::from_millis(100)).await;
        }
        debug!(
            target: "transport",
            count = self.local_candidates.lock().unwrap().len(),
            complete = self.gathering_complete.load(Ordering::SeqCst),
            "initial candidate window elapsed"
        );
    }

    fn build_channel(&self) -> Result<EstablishedChannel, TransportError> {
        let dc = self
            .dc_slot
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| TransportError::Setup("data channel missing".into()))?;
        // канал отдаётся один раз
        let inbound = self
            .inbound_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(TransportError::Closed)?;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
        {
            let dc = dc.clone();
            tokio::spawn(async move {
                while let Some(data) = outbound_rx.recv().await {
                    if dc.send(&data).await.is_err() {
                        break;
                    }
                }
            });
        }

        let shutdown = Arc::new(Notify::new());
        {
            let shutdown = shutdown.clone();
            let pc = self.pc.clone();
            let dc = dc.clone();
            tokio::spawn(async move {
                shutdown.notified().await;
                let _ = dc.close().await;
                let _ = pc.close().await;
            });
        }

        Ok(EstablishedChannel {
            outbound: outbound_tx,
            inbound,
            shutdown,
        })
    }
}

#[async_trait]
impl PeerTransport for WebrtcTransport {
    fn role(&self) -> PeerRole {
        self.role
    }

    async fn create_local_description(&self) -> Result<ConnectionBundle, TransportError> {
        match self.role {
            PeerRole::Initiator => {
                let offer = self.pc.create_offer(None).await.map_err(setup_err)?;
                self.pc.set_local_description(offer).await.map_err(setup_err)?;
            }
            PeerRole::Responder => {
                // ответ можно строить только после оффера
                if self.pc.remote_description().await.is_none() {
                    return Err(TransportError::Setup(
                        "answer requested before remote offer".into(),
                    ));
                }
                let answer = self.pc.create_answer(None).await.map_err(setup_err)?;
                self.pc
                    .set_local_description(answer)
                    .await
                    .map_err(setup_err)?;
            }
        }

        self.wait_for_candidates(self.candidate_window).await;

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::Setup("no local description".into()))?;
        let kind = match self.role {
            PeerRole::Initiator => DescriptionKind::Offer,
            PeerRole::Responder => DescriptionKind::Answer,
        };
        Ok(ConnectionBundle {
            description: DescriptionPayload {
                kind,
                sdp: local.sdp,
                id: self.connection_id.lock().unwrap().clone(),
                ts: chrono::Utc::now().timestamp(),
            },
            candidates: self.local_candidates.lock().unwrap().clone(),
        })
    }

    async fn apply_remote_description(
        &self,
        description: DescriptionPayload,
    ) -> Result<(), TransportError> {
        let remote = match description.kind {
            DescriptionKind::Offer => RTCSessionDescription::offer(description.sdp),
            DescriptionKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(setup_err)?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(setup_err)?;

        if self.role == PeerRole::Responder {
            // ответ наследует id соединения из оффера
            *self.connection_id.lock().unwrap() = description.id;
        }
        self.remote_set.store(true, Ordering::SeqCst);

        // применяем всё, что накопилось до remote description
        let pending: Vec<IceCandidate> = {
            let mut queue = self.pending_remote.lock().unwrap();
            queue.drain(..).collect()
        };
        for candidate in pending {
            if let Err(err) = self.add_remote_candidate(candidate).await {
                warn!(target: "transport", error = %err, "failed to apply pending candidate");
            }
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        if !self.remote_set.load(Ordering::SeqCst) {
            // remote description ещё не установлен — откладываем
            self.pending_remote.lock().unwrap().push(candidate);
            return Ok(());
        }
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| TransportError::Ice(err.to_string()))
    }

    async fn take_candidate_stream(&self) -> Option<mpsc::UnboundedReceiver<IceCandidate>> {
        self.trickle_rx.lock().unwrap().take()
    }

    async fn connect(
        &self,
        attempt_timeout: Duration,
    ) -> Result<EstablishedChannel, TransportError> {
        let deadline = sleep(attempt_timeout);
        tokio::pin!(deadline);
        let mut state_rx = self.state_rx.clone();
        loop {
            let state = *state_rx.borrow();
            match state {
                RTCPeerConnectionState::Connected if self.dc_open.load(Ordering::SeqCst) => break,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                    return Err(TransportError::Unreachable(format!(
                        "peer connection {state:?}"
                    )));
                }
                _ => {}
            }
            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return Err(TransportError::Closed);
                    }
                }
                _ = self.dc_ready.notified() => {}
                _ = &mut deadline => {
                    return Err(TransportError::Unreachable(
                        "reachability check timed out".into(),
                    ));
                }
            }
        }
        self.build_channel()
    }

    async fn shutdown(&self) {
        let dc = self.dc_slot.lock().unwrap().take();
        if let Some(dc) = dc {
            let _ = dc.close().await;
        }
        let _ = self.pc.close().await;
    }
}
