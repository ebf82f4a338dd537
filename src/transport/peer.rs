//! WebRTC media calls and data links
//!
//! One `RTCPeerConnection` per call or link. Offers and answers travel over
//! the rendezvous service; ICE candidates trickle after them on the same
//! signaling path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use super::rendezvous::SignalSender;
use super::signaling::{ChannelKind, IceCandidate, SignalPayload};
use super::track::{receive_remote_track, TrackBridge};
use super::{
    CallEvent, DataConnection, IncomingCall, LinkEvent, MediaConnection, OutboundSender,
};
use crate::config::WebRtcConfig;
use crate::error::{Result, SessionError};
use crate::identity::EndpointId;
use crate::media::{MediaStream, MediaTrack, TrackKind};

/// Create a peer connection with the default codecs and interceptors
pub(crate) async fn new_peer_connection(config: &WebRtcConfig) -> Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().map_err(|e| {
        SessionError::NegotiationFailed(format!("Failed to register codecs: {}", e))
    })?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
        SessionError::NegotiationFailed(format!("Failed to register interceptors: {}", e))
    })?;

    let api = APIBuilder::new()
        .with_setting_engine(SettingEngine::default())
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let mut ice_servers = vec![];
    for stun_url in &config.stun_servers {
        ice_servers.push(RTCIceServer {
            urls: vec![stun_url.clone()],
            ..Default::default()
        });
    }
    for turn in &config.turn_servers {
        ice_servers.push(RTCIceServer {
            urls: turn.urls.clone(),
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        });
    }

    let rtc_config = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };

    let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
        SessionError::NegotiationFailed(format!("Failed to create peer connection: {}", e))
    })?;

    Ok(Arc::new(pc))
}

/// Where a peer connection reports closure and failure
pub(crate) trait PeerEvents: Clone + Send + Sync + 'static {
    fn closed(&self);
    fn failed(&self, error: SessionError);
}

impl PeerEvents for mpsc::UnboundedSender<CallEvent> {
    fn closed(&self) {
        let _ = self.send(CallEvent::Closed);
    }

    fn failed(&self, error: SessionError) {
        let _ = self.send(CallEvent::Error(error));
    }
}

impl PeerEvents for mpsc::UnboundedSender<LinkEvent> {
    fn closed(&self) {
        let _ = self.send(LinkEvent::Closed);
    }

    fn failed(&self, error: SessionError) {
        let _ = self.send(LinkEvent::Error(error));
    }
}

fn watch_state<E: PeerEvents>(pc: &RTCPeerConnection, peer: EndpointId, events: E) {
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let events = events.clone();
        let peer = peer.clone();

        Box::pin(async move {
            info!("Peer {} connection state: {}", peer, s);
            match s {
                RTCPeerConnectionState::Failed => events.failed(SessionError::NegotiationFailed(
                    format!("Connection to {} failed", peer),
                )),
                RTCPeerConnectionState::Closed => events.closed(),
                _ => {}
            }
        })
    }));
}

/// Queue local ICE candidates until the signaling task forwards them
///
/// Candidates must not reach the peer before the offer or answer does.
fn gather_candidates(pc: &RTCPeerConnection) -> mpsc::UnboundedReceiver<IceCandidate> {
    let (tx, rx) = mpsc::unbounded_channel();

    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();

        Box::pin(async move {
            let Some(c) = candidate else {
                return;
            };
            match c.to_json() {
                Ok(init) => {
                    debug!("ICE candidate: {}", init.candidate);
                    let _ = tx.send(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    });
                }
                Err(e) => debug!("Failed to encode ICE candidate: {}", e),
            }
        })
    }));

    rx
}

async fn add_candidate(pc: &RTCPeerConnection, candidate: IceCandidate) {
    let init = RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    };

    if let Err(e) = pc.add_ice_candidate(init).await {
        debug!("Failed to add ICE candidate: {}", e);
    }
}

/// Drive one connection's signaling until the peer closes it or the route
/// is dropped
async fn run_signaling<E: PeerEvents>(
    pc: Arc<RTCPeerConnection>,
    signal: SignalSender,
    mut signals: mpsc::UnboundedReceiver<SignalPayload>,
    mut local: mpsc::UnboundedReceiver<IceCandidate>,
    events: E,
    mut remote_set: bool,
) {
    let mut pending: Vec<IceCandidate> = Vec::new();

    loop {
        tokio::select! {
            Some(candidate) = local.recv() => {
                if let Err(e) = signal.send(SignalPayload::Candidate(candidate)) {
                    debug!("Dropping local candidate for {}: {}", signal.peer(), e);
                }
            }
            payload = signals.recv() => match payload {
                Some(SignalPayload::Answer { sdp }) => {
                    if remote_set {
                        debug!("Ignoring repeated answer from {}", signal.peer());
                        continue;
                    }
                    let applied = match RTCSessionDescription::answer(sdp) {
                        Ok(answer) => pc.set_remote_description(answer).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = applied {
                        warn!("Invalid answer from {}: {}", signal.peer(), e);
                        events.failed(SessionError::NegotiationFailed(e.to_string()));
                        break;
                    }
                    remote_set = true;
                    for candidate in pending.drain(..) {
                        add_candidate(&pc, candidate).await;
                    }
                }
                Some(SignalPayload::Candidate(candidate)) => {
                    if remote_set {
                        add_candidate(&pc, candidate).await;
                    } else {
                        pending.push(candidate);
                    }
                }
                Some(SignalPayload::Close) => {
                    info!("Peer {} closed the connection", signal.peer());
                    events.closed();
                    break;
                }
                Some(SignalPayload::Offer { .. }) => {
                    debug!("Ignoring renegotiation offer from {}", signal.peer());
                }
                None => break,
            },
        }
    }
}

async fn apply_offer(pc: &RTCPeerConnection, sdp: String) -> Result<String> {
    let offer = RTCSessionDescription::offer(sdp)
        .map_err(|e| SessionError::NegotiationFailed(format!("Invalid SDP offer: {}", e)))?;
    pc.set_remote_description(offer).await.map_err(|e| {
        SessionError::NegotiationFailed(format!("Failed to set remote description: {}", e))
    })?;

    let answer = pc
        .create_answer(None)
        .await
        .map_err(|e| SessionError::NegotiationFailed(format!("Failed to create answer: {}", e)))?;
    pc.set_local_description(answer.clone()).await.map_err(|e| {
        SessionError::NegotiationFailed(format!("Failed to set local description: {}", e))
    })?;

    Ok(answer.sdp)
}

async fn create_offer(pc: &RTCPeerConnection) -> Result<String> {
    let offer = pc
        .create_offer(None)
        .await
        .map_err(|e| SessionError::NegotiationFailed(format!("Failed to create offer: {}", e)))?;
    pc.set_local_description(offer.clone()).await.map_err(|e| {
        SessionError::NegotiationFailed(format!("Failed to set local description: {}", e))
    })?;

    Ok(offer.sdp)
}

async fn close_on_error<T>(pc: &RTCPeerConnection, result: Result<T>) -> Result<T> {
    if result.is_err() {
        if let Err(e) = pc.close().await {
            debug!("Failed to close peer connection: {}", e);
        }
    }
    result
}

/// Outbound track slot of a media call
///
/// The negotiated local track stays bound to the RTP sender; replacing
/// the track re-points the sample feed instead.
pub(crate) struct WebRtcSender {
    bridge: Mutex<TrackBridge>,
}

impl WebRtcSender {
    fn stop(&self) {
        self.bridge.lock().stop();
    }
}

#[async_trait]
impl OutboundSender for WebRtcSender {
    async fn track_kind(&self) -> Option<TrackKind> {
        let bridge = self.bridge.lock();
        bridge.source_id().map(|_| bridge.kind())
    }

    fn lane(&self) -> Option<TrackKind> {
        Some(self.bridge.lock().kind())
    }

    async fn replace_track(&self, track: Option<MediaTrack>) -> Result<()> {
        self.bridge.lock().retarget(track.as_ref())
    }
}

/// Publish every track of `stream` on `pc`
async fn attach_stream(
    pc: &Arc<RTCPeerConnection>,
    stream: &MediaStream,
) -> Result<Vec<Arc<WebRtcSender>>> {
    let mut senders = Vec::with_capacity(stream.tracks().len());

    for track in stream.tracks() {
        let bridge = TrackBridge::new(track, stream.id())?;
        let rtp = pc.add_track(bridge.local()).await.map_err(|e| {
            SessionError::NegotiationFailed(format!(
                "Failed to add {} track: {}",
                track.kind(),
                e
            ))
        })?;

        // Incoming RTCP has to be read for the interceptors to run
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtp.read(&mut buf).await.is_ok() {}
        });

        senders.push(Arc::new(WebRtcSender {
            bridge: Mutex::new(bridge),
        }));
    }

    Ok(senders)
}

/// Collect remote tracks into one stream, re-announced on every arrival
fn receive_remote(pc: &RTCPeerConnection, events: mpsc::UnboundedSender<CallEvent>) {
    let remote = Arc::new(Mutex::new(MediaStream::new(vec![])));

    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let remote = remote.clone();
            let events = events.clone();

            Box::pin(async move {
                let track = receive_remote_track(track);
                let stream = {
                    let mut stream = remote.lock();
                    stream.add_track(track);
                    stream.clone()
                };
                let _ = events.send(CallEvent::RemoteStream(stream));
            })
        },
    ));
}

/// Negotiated media call
pub struct WebRtcCall {
    peer: EndpointId,
    pc: Arc<RTCPeerConnection>,
    signal: SignalSender,
    senders: Vec<Arc<WebRtcSender>>,
    events: Option<mpsc::UnboundedReceiver<CallEvent>>,
    signal_task: JoinHandle<()>,
}

impl WebRtcCall {
    /// Offer a call carrying `stream`
    pub(crate) async fn dial(
        config: &WebRtcConfig,
        signal: SignalSender,
        signals: mpsc::UnboundedReceiver<SignalPayload>,
        stream: &MediaStream,
    ) -> Result<Self> {
        let pc = new_peer_connection(config).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        watch_state(&pc, signal.peer().clone(), tx.clone());
        receive_remote(&pc, tx.clone());
        let local = gather_candidates(&pc);

        let offered = async {
            let senders = attach_stream(&pc, stream).await?;
            let sdp = create_offer(&pc).await?;
            signal.send(SignalPayload::Offer {
                sdp,
                channel: ChannelKind::Media,
            })?;
            Ok::<_, SessionError>(senders)
        }
        .await;
        let senders = close_on_error(&pc, offered).await?;
        info!("Calling {}", signal.peer());

        let signal_task = tokio::spawn(run_signaling(
            pc.clone(),
            signal.clone(),
            signals,
            local,
            tx,
            false,
        ));

        Ok(Self {
            peer: signal.peer().clone(),
            pc,
            signal,
            senders,
            events: Some(rx),
            signal_task,
        })
    }
}

#[async_trait]
impl MediaConnection for WebRtcCall {
    fn peer(&self) -> &EndpointId {
        &self.peer
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<CallEvent>> {
        self.events.take()
    }

    fn senders(&self) -> Vec<Arc<dyn OutboundSender>> {
        self.senders
            .iter()
            .map(|s| s.clone() as Arc<dyn OutboundSender>)
            .collect()
    }

    async fn close(&self) {
        self.signal.close();
        self.signal_task.abort();
        for sender in &self.senders {
            sender.stop();
        }
        if let Err(e) = self.pc.close().await {
            debug!("Failed to close call with {}: {}", self.peer, e);
        }
    }
}

/// Call offer waiting for a decision
pub struct WebRtcIncomingCall {
    config: WebRtcConfig,
    signal: SignalSender,
    signals: mpsc::UnboundedReceiver<SignalPayload>,
    offer_sdp: String,
}

impl WebRtcIncomingCall {
    pub(crate) fn new(
        config: WebRtcConfig,
        signal: SignalSender,
        signals: mpsc::UnboundedReceiver<SignalPayload>,
        offer_sdp: String,
    ) -> Self {
        Self {
            config,
            signal,
            signals,
            offer_sdp,
        }
    }
}

#[async_trait]
impl IncomingCall for WebRtcIncomingCall {
    fn peer(&self) -> &EndpointId {
        self.signal.peer()
    }

    async fn answer(self: Box<Self>, stream: &MediaStream) -> Result<Box<dyn MediaConnection>> {
        let Self {
            config,
            signal,
            signals,
            offer_sdp,
        } = *self;

        let pc = new_peer_connection(&config).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        watch_state(&pc, signal.peer().clone(), tx.clone());
        receive_remote(&pc, tx.clone());
        let local = gather_candidates(&pc);

        let answered = async {
            let senders = attach_stream(&pc, stream).await?;
            let sdp = apply_offer(&pc, offer_sdp).await?;
            signal.send(SignalPayload::Answer { sdp })?;
            Ok::<_, SessionError>(senders)
        }
        .await;
        let senders = match close_on_error(&pc, answered).await {
            Ok(senders) => senders,
            Err(e) => {
                signal.close();
                return Err(e);
            }
        };
        info!("Answered call from {}", signal.peer());

        let signal_task = tokio::spawn(run_signaling(
            pc.clone(),
            signal.clone(),
            signals,
            local,
            tx,
            true,
        ));

        Ok(Box::new(WebRtcCall {
            peer: signal.peer().clone(),
            pc,
            signal,
            senders,
            events: Some(rx),
            signal_task,
        }))
    }

    async fn reject(self: Box<Self>) {
        info!("Rejecting call from {}", self.signal.peer());
        self.signal.close();
    }
}

fn wire_channel(
    dc: &Arc<RTCDataChannel>,
    open: &Arc<AtomicBool>,
    events: &mpsc::UnboundedSender<LinkEvent>,
) {
    let label = dc.label().to_string();

    {
        let open = open.clone();
        let events = events.clone();
        let label = label.clone();
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                info!("Data channel '{}' open", label);
                if !open.swap(true, Ordering::SeqCst) {
                    let _ = events.send(LinkEvent::Open);
                }
            })
        }));
    }

    {
        let events = events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let _ = events.send(LinkEvent::Data(msg.data));
            Box::pin(async {})
        }));
    }

    {
        let open = open.clone();
        let events = events.clone();
        let label = label.clone();
        dc.on_close(Box::new(move || {
            info!("Data channel '{}' closed", label);
            open.store(false, Ordering::SeqCst);
            let _ = events.send(LinkEvent::Closed);
            Box::pin(async {})
        }));
    }

    {
        let events = events.clone();
        dc.on_error(Box::new(move |e: webrtc::Error| {
            warn!("Data channel '{}' error: {}", label, e);
            let _ = events.send(LinkEvent::Error(SessionError::NegotiationFailed(
                e.to_string(),
            )));
            Box::pin(async {})
        }));
    }

    // The channel may already be open when handed over by the remote side
    if dc.ready_state() == RTCDataChannelState::Open && !open.swap(true, Ordering::SeqCst) {
        let _ = events.send(LinkEvent::Open);
    }
}

/// Reliable, ordered data channel on its own peer connection
pub struct WebRtcLink {
    peer: EndpointId,
    pc: Arc<RTCPeerConnection>,
    signal: SignalSender,
    channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    open: Arc<AtomicBool>,
    events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    signal_task: JoinHandle<()>,
}

impl WebRtcLink {
    /// Offer a new data link
    pub(crate) async fn open(
        config: &WebRtcConfig,
        signal: SignalSender,
        signals: mpsc::UnboundedReceiver<SignalPayload>,
    ) -> Result<Self> {
        let pc = new_peer_connection(config).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        watch_state(&pc, signal.peer().clone(), tx.clone());
        let local = gather_candidates(&pc);
        let open = Arc::new(AtomicBool::new(false));

        let offered = async {
            let dc = pc
                .create_data_channel(&config.data_channel_label, None)
                .await
                .map_err(|e| {
                    SessionError::NegotiationFailed(format!(
                        "Failed to create data channel: {}",
                        e
                    ))
                })?;
            wire_channel(&dc, &open, &tx);
            let sdp = create_offer(&pc).await?;
            signal.send(SignalPayload::Offer {
                sdp,
                channel: ChannelKind::Data,
            })?;
            Ok::<_, SessionError>(dc)
        }
        .await;
        let dc = close_on_error(&pc, offered).await?;
        info!("Data channel '{}' offered to {}", dc.label(), signal.peer());

        let signal_task = tokio::spawn(run_signaling(
            pc.clone(),
            signal.clone(),
            signals,
            local,
            tx,
            false,
        ));

        Ok(Self {
            peer: signal.peer().clone(),
            pc,
            signal,
            channel: Arc::new(RwLock::new(Some(dc))),
            open,
            events: Some(rx),
            signal_task,
        })
    }

    /// Accept a data link offered by the peer
    pub(crate) async fn answer(
        config: &WebRtcConfig,
        signal: SignalSender,
        signals: mpsc::UnboundedReceiver<SignalPayload>,
        offer_sdp: String,
    ) -> Result<Self> {
        let pc = new_peer_connection(config).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        watch_state(&pc, signal.peer().clone(), tx.clone());
        let local = gather_candidates(&pc);
        let open = Arc::new(AtomicBool::new(false));
        let channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>> = Arc::new(RwLock::new(None));

        {
            let channel = channel.clone();
            let open = open.clone();
            let events = tx.clone();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let channel = channel.clone();
                let open = open.clone();
                let events = events.clone();

                Box::pin(async move {
                    info!("Data channel '{}' received", dc.label());
                    wire_channel(&dc, &open, &events);
                    *channel.write() = Some(dc);
                })
            }));
        }

        let answered = async {
            let sdp = apply_offer(&pc, offer_sdp).await?;
            signal.send(SignalPayload::Answer { sdp })
        }
        .await;
        close_on_error(&pc, answered).await?;

        let signal_task = tokio::spawn(run_signaling(
            pc.clone(),
            signal.clone(),
            signals,
            local,
            tx,
            true,
        ));

        Ok(Self {
            peer: signal.peer().clone(),
            pc,
            signal,
            channel,
            open,
            events: Some(rx),
            signal_task,
        })
    }
}

#[async_trait]
impl DataConnection for WebRtcLink {
    fn peer(&self) -> &EndpointId {
        &self.peer
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
        self.events.take()
    }

    async fn send(&self, data: bytes::Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(SessionError::SendOnClosedLink);
        }
        let dc = self
            .channel
            .read()
            .clone()
            .ok_or(SessionError::SendOnClosedLink)?;

        dc.send(&data)
            .await
            .map_err(|e| SessionError::Io(format!("Failed to send on data link: {}", e)))?;
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.signal.close();
        self.signal_task.abort();

        let dc = self.channel.write().take();
        if let Some(dc) = dc {
            if let Err(e) = dc.close().await {
                debug!("Failed to close data channel: {}", e);
            }
        }
        if let Err(e) = self.pc.close().await {
            debug!("Failed to close data link with {}: {}", self.peer, e);
        }
    }
}
