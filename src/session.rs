//! Session orchestrator
//!
//! A session is driven by a single actor task that exclusively owns the call
//! channel, the data link channel and the local captures. Everything else
//! (transport notifications, finished acquisitions, debounce timers,
//! reconnect attempts) reaches the actor as a message, so no state is ever
//! mutated from a callback.
//!
//! [`SessionManager`] is the cheap, clonable control surface handed to the
//! surrounding UI.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::call::{CallChannel, CallState, CallTransition};
use crate::config::{AppConfig, SessionConfig};
use crate::datalink::{DataLinkChannel, LinkState, LinkTransition};
use crate::error::{Result, SessionError};
use crate::events::{EventBus, SessionEvent};
use crate::identity::{self, EndpointId, Role};
use crate::measure::{self, MeasurementSource};
use crate::media::{
    CaptureProfile, LensFacing, MediaAcquirer, MediaStream, MediaTrack, TrackKind, TrackState,
};
use crate::payload::Payload;
use crate::transport::{CallEvent, IncomingCall, LinkEvent, Rendezvous, RendezvousEvent};
use crate::utils::Debouncer;

const COMMAND_CAPACITY: usize = 32;

/// Top-level session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Initializing,
    /// Registering with the rendezvous service
    Connecting,
    Ready,
    InCall,
    /// Lost the rendezvous service; retrying with the same identity
    Reconnecting,
    Ended,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Initializing => write!(f, "initializing"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Ready => write!(f, "ready"),
            SessionState::InCall => write!(f, "in_call"),
            SessionState::Reconnecting => write!(f, "reconnecting"),
            SessionState::Ended => write!(f, "ended"),
        }
    }
}

/// Point-in-time view of the session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    /// Human-readable status line
    pub status: String,
    pub role: Role,
    pub own_id: EndpointId,
    pub target_id: EndpointId,
    pub call_state: CallState,
    pub link_state: LinkState,
    pub data_link_open: bool,
    pub muted: bool,
    pub facing: LensFacing,
    pub screen_sharing: bool,
    pub has_remote_stream: bool,
}

/// Outcome of a user action that can fail without ending the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

enum Command {
    SendPayload(Payload, oneshot::Sender<bool>),
    SyncPayload(Payload, oneshot::Sender<()>),
    ToggleMute(oneshot::Sender<bool>),
    ToggleCamera(oneshot::Sender<LensFacing>),
    StartScreenShare(oneshot::Sender<ActionResult>),
    ReplaceVideoSource(MediaTrack, oneshot::Sender<bool>),
    End(oneshot::Sender<()>),
}

/// Results of work the actor spawned
enum Internal {
    Connected(Result<mpsc::UnboundedReceiver<RendezvousEvent>>),
    Reconnected(Result<()>),
    Acquired {
        purpose: AcquirePurpose,
        result: Result<MediaStream>,
    },
    DisplayAcquired(Result<MediaStream>, oneshot::Sender<ActionResult>),
    DisplayEnded { stream_id: String },
    Call { generation: u64, event: CallEvent },
    Link { generation: u64, event: LinkEvent },
    FlushPayload(u64),
    Redial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcquirePurpose {
    /// First capture, or a capture for the next call
    Initial,
    /// Lens switch requested by the user
    Toggle,
}

impl AcquirePurpose {
    fn merge(self, other: AcquirePurpose) -> AcquirePurpose {
        if self == AcquirePurpose::Toggle || other == AcquirePurpose::Toggle {
            AcquirePurpose::Toggle
        } else {
            AcquirePurpose::Initial
        }
    }
}

/// At most one acquisition runs; a newer request waits in a single slot
#[derive(Default)]
struct Acquisitions {
    in_flight: bool,
    queued: Option<AcquirePurpose>,
}

struct Shared {
    remote: RwLock<Option<MediaStream>>,
    last_payload: RwLock<Option<Payload>>,
    events: EventBus,
}

/// Handle to a running session
#[derive(Clone)]
pub struct SessionManager {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    shared: Arc<Shared>,
    measurement_poll: Duration,
}

impl SessionManager {
    /// Resolve identities and start the session actor
    ///
    /// Fails with `MissingCode` before anything connects when `code` is
    /// empty. Must be called from within a tokio runtime.
    pub fn start(
        role: Role,
        code: &str,
        config: AppConfig,
        rendezvous: Arc<dyn Rendezvous>,
        acquirer: Arc<dyn MediaAcquirer>,
    ) -> Result<Self> {
        let (own_id, target_id) = identity::resolve(role, code)?;
        info!("Starting {} session as {} -> {}", role, own_id, target_id);

        let profile = CaptureProfile::new(
            config.capture.default_facing,
            config.capture.quality,
            config.capture.constrained,
        );
        let initial = SessionSnapshot {
            state: SessionState::Initializing,
            status: "Initializing...".to_string(),
            role,
            own_id: own_id.clone(),
            target_id: target_id.clone(),
            call_state: CallState::Idle,
            link_state: LinkState::Disconnected,
            data_link_open: false,
            muted: false,
            facing: profile.facing,
            screen_sharing: false,
            has_remote_stream: false,
        };

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            remote: RwLock::new(None),
            last_payload: RwLock::new(None),
            events: EventBus::new(),
        });

        let session = Session {
            role,
            own_id,
            target_id,
            config: config.session.clone(),
            profile,
            rendezvous,
            acquirer,
            shared: shared.clone(),
            snapshot_tx,
            commands: command_rx,
            internal_tx,
            internal_rx,
            rendezvous_rx: None,
            state: SessionState::Initializing,
            status: "Initializing...".to_string(),
            call: CallChannel::new(),
            link: DataLinkChannel::new(),
            debouncer: Debouncer::new(Duration::from_millis(config.session.debounce_ms)),
            capture: None,
            display: None,
            external: None,
            pending_incoming: None,
            acquisitions: Acquisitions::default(),
            capture_failed: false,
            muted: false,
            facing: profile.facing,
            installed_facing: profile.facing,
            resume: None,
            reconnect_attempt: 0,
            redial_pending: false,
            toggle_waiters: Vec::new(),
            tasks: Vec::new(),
            ended: false,
        };
        tokio::spawn(session.run());

        Ok(Self {
            commands: command_tx,
            snapshot: snapshot_rx,
            shared,
            measurement_poll: Duration::from_millis(config.session.measurement_poll_ms),
        })
    }

    pub fn status(&self) -> String {
        self.snapshot.borrow().status.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that sees every snapshot change
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Remote media, present while in a call
    pub fn remote_media_stream(&self) -> Option<MediaStream> {
        self.shared.remote.read().clone()
    }

    pub fn last_received_payload(&self) -> Option<Payload> {
        self.shared.last_payload.read().clone()
    }

    pub fn is_data_link_open(&self) -> bool {
        self.snapshot.borrow().data_link_open
    }

    pub fn is_muted(&self) -> bool {
        self.snapshot.borrow().muted
    }

    pub fn facing_mode(&self) -> LensFacing {
        self.snapshot.borrow().facing
    }

    /// Send a payload now
    ///
    /// Best-effort: returns `false` when the link is absent or closed. A
    /// coalesced update still waiting in the debounce window goes out first.
    pub async fn send_payload(&self, payload: Payload) -> bool {
        self.request(|tx| Command::SendPayload(payload, tx))
            .await
            .unwrap_or(false)
    }

    /// Queue a high-frequency update for coalesced delivery
    ///
    /// Updates within the debounce window collapse into one send of the
    /// latest value.
    pub async fn sync_payload(&self, payload: Payload) {
        let _ = self.request(|tx| Command::SyncPayload(payload, tx)).await;
    }

    /// Flip the local mute flag; returns the new value
    pub async fn toggle_mute(&self) -> bool {
        match self.request(Command::ToggleMute).await {
            Some(muted) => muted,
            None => self.is_muted(),
        }
    }

    /// Switch to the other camera; returns the facing in effect afterwards
    pub async fn toggle_camera_facing(&self) -> LensFacing {
        match self.request(Command::ToggleCamera).await {
            Some(facing) => facing,
            None => self.facing_mode(),
        }
    }

    /// Offer a screen capture instead of the camera
    pub async fn start_screen_share(&self) -> ActionResult {
        self.request(Command::StartScreenShare)
            .await
            .unwrap_or_else(|| ActionResult::failed("Session has ended"))
    }

    /// Offer an externally produced video track instead of the camera
    ///
    /// Returns `false`, leaving everything untouched, without an active call.
    pub async fn replace_video_source(&self, track: MediaTrack) -> bool {
        self.request(|tx| Command::ReplaceVideoSource(track, tx))
            .await
            .unwrap_or(false)
    }

    /// Forward measurement snapshots from `source` while the session lives
    pub fn attach_measurements<S: MeasurementSource>(&self, source: S) -> JoinHandle<()> {
        measure::spawn_feed(self.clone(), source, self.measurement_poll)
    }

    /// Tear everything down; idempotent
    pub async fn end_session(&self) {
        let _ = self.request(Command::End).await;
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(make(tx)).await.is_err() {
            debug!("Session has ended; command ignored");
            return None;
        }
        rx.await.ok()
    }
}

struct Session {
    role: Role,
    own_id: EndpointId,
    target_id: EndpointId,
    config: SessionConfig,
    profile: CaptureProfile,
    rendezvous: Arc<dyn Rendezvous>,
    acquirer: Arc<dyn MediaAcquirer>,
    shared: Arc<Shared>,
    snapshot_tx: watch::Sender<SessionSnapshot>,

    commands: mpsc::Receiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    rendezvous_rx: Option<mpsc::UnboundedReceiver<RendezvousEvent>>,

    state: SessionState,
    status: String,
    call: CallChannel,
    link: DataLinkChannel,
    debouncer: Debouncer<Payload>,

    /// The one held camera capture
    capture: Option<MediaStream>,
    /// Screen capture currently offered instead of the camera video
    display: Option<MediaStream>,
    /// External track currently offered instead of the camera video
    external: Option<MediaTrack>,
    /// Inbound call waiting for a capture
    pending_incoming: Option<Box<dyn IncomingCall>>,
    acquisitions: Acquisitions,
    /// Last automatic acquisition failed; don't retry until something changes
    capture_failed: bool,

    muted: bool,
    facing: LensFacing,
    /// Facing of the capture last installed successfully
    installed_facing: LensFacing,

    /// State and status to restore once the rendezvous service is back
    resume: Option<(SessionState, String)>,
    reconnect_attempt: u32,
    redial_pending: bool,
    toggle_waiters: Vec<oneshot::Sender<LensFacing>>,
    tasks: Vec<JoinHandle<()>>,
    ended: bool,
}

async fn next_rendezvous_event(
    rx: &mut Option<mpsc::UnboundedReceiver<RendezvousEvent>>,
) -> Option<RendezvousEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Session {
    async fn run(mut self) {
        self.set_status(SessionState::Connecting, "Connecting to server...");
        self.spawn_connect(Duration::ZERO);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All session handles dropped");
                        self.end_session().await;
                    }
                },
                Some(message) = self.internal_rx.recv() => {
                    self.handle_internal(message).await;
                }
                event = next_rendezvous_event(&mut self.rendezvous_rx) => match event {
                    Some(event) => self.handle_rendezvous(event).await,
                    None => {
                        warn!("Rendezvous event channel closed");
                        self.rendezvous_rx = None;
                        self.enter_reconnecting("Connection closed.");
                    }
                },
            }

            if self.ended {
                break;
            }
        }

        info!("Session {} finished", self.own_id);
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SendPayload(payload, reply) => {
                self.flush_pending_payload().await;
                let sent = self.link.send(&payload).await;
                let _ = reply.send(sent);
            }
            Command::SyncPayload(payload, reply) => {
                self.schedule_payload(payload).await;
                let _ = reply.send(());
            }
            Command::ToggleMute(reply) => {
                self.muted = !self.muted;
                info!("Microphone {}", if self.muted { "muted" } else { "unmuted" });
                self.call.set_muted(self.muted);
                if let Some(capture) = &self.capture {
                    capture.set_enabled(TrackKind::Audio, !self.muted);
                }
                self.refresh();
                let _ = reply.send(self.muted);
            }
            Command::ToggleCamera(reply) => self.toggle_camera(reply),
            Command::StartScreenShare(reply) => self.spawn_display_capture(reply),
            Command::ReplaceVideoSource(track, reply) => {
                let replaced = self.replace_video_source(track).await;
                let _ = reply.send(replaced);
            }
            Command::End(reply) => {
                self.end_session().await;
                let _ = reply.send(());
            }
        }
    }

    async fn flush_pending_payload(&mut self) {
        if let Some(pending) = self.debouncer.flush() {
            self.link.send(&pending).await;
        }
    }

    async fn schedule_payload(&mut self, payload: Payload) {
        let tag_changed = self
            .debouncer
            .pending()
            .is_some_and(|pending| pending.tag() != payload.tag());
        if tag_changed {
            self.flush_pending_payload().await;
        }

        let tx = self.internal_tx.clone();
        self.debouncer.schedule(payload, move |token| {
            let _ = tx.send(Internal::FlushPayload(token));
        });
    }

    fn toggle_camera(&mut self, reply: oneshot::Sender<LensFacing>) {
        self.facing = self.facing.opposite();
        info!("Switching to {} camera", self.facing);
        self.toggle_waiters.push(reply);

        // Free the hardware before opening the other camera
        if let Some(old) = self.capture.take() {
            self.acquirer.release(&old);
        }
        self.request_capture(AcquirePurpose::Toggle);
        self.refresh();
    }

    async fn replace_video_source(&mut self, track: MediaTrack) -> bool {
        if track.kind() != TrackKind::Video {
            warn!("Ignoring {} track offered as video source", track.kind());
            return false;
        }
        if !self.call.replace_outgoing_video(&track).await {
            return false;
        }

        info!("Streaming external video source {}", track.label());
        if let Some(display) = self.display.take() {
            self.acquirer.release(&display);
        }
        self.external = Some(track);
        self.refresh();
        true
    }

    // ------------------------------------------------------------------
    // Rendezvous
    // ------------------------------------------------------------------

    async fn handle_rendezvous(&mut self, event: RendezvousEvent) {
        debug!("Rendezvous event: {:?}", event);
        match event {
            RendezvousEvent::Open => self.on_registered().await,
            RendezvousEvent::IncomingCall(incoming) => self.on_incoming_call(incoming).await,
            RendezvousEvent::IncomingLink(connection) => {
                let started = self.link.accept(connection).await;
                self.forward_link_events(started.generation, started.events);
                self.refresh();
            }
            RendezvousEvent::Disconnected => {
                self.enter_reconnecting("Disconnected from server. Retrying...");
            }
            RendezvousEvent::Closed => self.enter_reconnecting("Connection closed."),
            RendezvousEvent::Error(SessionError::TargetUnreachable(peer)) => {
                self.on_target_unreachable(&peer).await;
            }
            RendezvousEvent::Error(e) => {
                warn!("Rendezvous error: {}", e);
                self.set_status(self.state, format!("Error: {}", e));
            }
        }
    }

    async fn on_registered(&mut self) {
        info!("Registered as {}", self.own_id);
        self.reconnect_attempt = 0;

        match self.resume.take() {
            Some((SessionState::InCall, status)) if self.call.state() == CallState::Active => {
                self.set_status(SessionState::InCall, status);
            }
            Some((SessionState::Ready, status)) => self.set_status(SessionState::Ready, status),
            _ => {
                let status = match self.role {
                    Role::Initiator => "Ready to call...",
                    Role::Responder => "Waiting for someone to join...",
                };
                self.set_status(SessionState::Ready, status);
            }
        }

        self.progress().await;
    }

    async fn on_incoming_call(&mut self, incoming: Box<dyn IncomingCall>) {
        info!("Incoming call from {}", incoming.peer());
        if let Some(previous) = self.pending_incoming.take() {
            debug!("Rejecting superseded call from {}", previous.peer());
            previous.reject().await;
        }
        if self.call.has_call() {
            // The counterpart re-dialed; keep the capture for the new call
            self.call.hang_up().await;
        }

        self.call.mark_ringing();
        self.capture_failed = false;
        self.pending_incoming = Some(incoming);
        self.refresh();
        self.progress().await;
    }

    async fn on_target_unreachable(&mut self, peer: &str) {
        info!("{} is not connected yet", peer);
        let status = match self.role {
            Role::Initiator => "Responder not online yet...",
            Role::Responder => "Initiator not online yet...",
        };
        self.set_status(self.state, status);

        if self.role == Role::Initiator {
            self.call.hang_up().await;
            self.link.close().await;
            self.debouncer.cancel();
            self.schedule_redial();
            self.refresh();
        }
    }

    fn enter_reconnecting(&mut self, status: &str) {
        if self.state == SessionState::Reconnecting {
            self.set_status(SessionState::Reconnecting, status);
            return;
        }
        if matches!(self.state, SessionState::Ready | SessionState::InCall) {
            self.resume = Some((self.state, self.status.clone()));
        }
        warn!("Lost rendezvous service: {}", status);
        self.set_status(SessionState::Reconnecting, status);
        self.reconnect_attempt = 0;
        self.spawn_reconnect();
    }

    fn backoff(&mut self) -> Duration {
        let base = self.config.reconnect_delay_ms;
        let max = self.config.reconnect_max_delay_ms;
        let exp = self.reconnect_attempt.min(16);
        let delay = base.saturating_mul(1u64 << exp).min(max);
        let jitter = rand::thread_rng().gen_range(0..=base / 4);
        self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
        Duration::from_millis(delay + jitter)
    }

    fn spawn_connect(&mut self, delay: Duration) {
        let rendezvous = self.rendezvous.clone();
        let own_id = self.own_id.clone();
        let tx = self.internal_tx.clone();
        self.track_task(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = rendezvous.connect(&own_id).await;
            let _ = tx.send(Internal::Connected(result));
        }));
    }

    fn spawn_reconnect(&mut self) {
        let delay = self.backoff();
        if self.rendezvous_rx.is_none() {
            self.spawn_connect(delay);
            return;
        }

        debug!("Reconnecting in {:?}", delay);
        let rendezvous = self.rendezvous.clone();
        let tx = self.internal_tx.clone();
        self.track_task(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let result = rendezvous.reconnect().await;
            let _ = tx.send(Internal::Reconnected(result));
        }));
    }

    fn schedule_redial(&mut self) {
        if self.redial_pending {
            return;
        }
        self.redial_pending = true;
        let delay = Duration::from_secs(self.config.redial_secs);
        let tx = self.internal_tx.clone();
        self.track_task(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::Redial);
        }));
    }

    // ------------------------------------------------------------------
    // Internal results
    // ------------------------------------------------------------------

    async fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Connected(Ok(rx)) => {
                debug!("Rendezvous connection established");
                self.rendezvous_rx = Some(rx);
            }
            Internal::Connected(Err(e)) => {
                warn!("Failed to reach rendezvous service: {}", e);
                self.set_status(self.state, format!("Error: {}", e));
                self.spawn_reconnect();
            }
            Internal::Reconnected(Ok(())) => debug!("Rendezvous reconnected, awaiting registration"),
            Internal::Reconnected(Err(e)) => {
                warn!("Reconnect attempt {} failed: {}", self.reconnect_attempt, e);
                if self.state == SessionState::Reconnecting {
                    self.spawn_reconnect();
                }
            }
            Internal::Acquired { purpose, result } => self.on_acquired(purpose, result).await,
            Internal::DisplayAcquired(result, reply) => {
                let outcome = self.on_display_acquired(result).await;
                let _ = reply.send(outcome);
            }
            Internal::DisplayEnded { stream_id } => {
                let current = self
                    .display
                    .as_ref()
                    .is_some_and(|display| display.id() == stream_id);
                if current {
                    if let Some(display) = self.display.take() {
                        info!("Screen sharing stopped by the user");
                        self.acquirer.release(&display);
                        self.shared.events.publish(SessionEvent::ScreenShareEnded);
                        self.set_status(self.state, "Screen sharing ended");
                    }
                }
            }
            Internal::Call { generation, event } => {
                if let Some(transition) = self.call.on_event(generation, event).await {
                    self.on_call_transition(transition).await;
                }
            }
            Internal::Link { generation, event } => {
                if let Some(transition) = self.link.on_event(generation, event).await {
                    self.on_link_transition(transition).await;
                }
            }
            Internal::FlushPayload(token) => {
                if let Some(payload) = self.debouncer.take_if_current(token) {
                    self.link.send(&payload).await;
                }
            }
            Internal::Redial => {
                self.redial_pending = false;
                self.capture_failed = false;
                debug!("Redialing {}", self.target_id);
                self.progress().await;
            }
        }
    }

    async fn on_call_transition(&mut self, transition: CallTransition) {
        match transition {
            CallTransition::Connected { peer, .. } => {
                let status = match self.role {
                    Role::Initiator => format!("Connected - Streaming to {}", peer),
                    Role::Responder => format!("Connected - Receiving stream from {}", peer),
                };
                self.set_call_status(SessionState::InCall, status);
            }
            CallTransition::Closed { .. } => {
                self.set_call_status(SessionState::Ready, "Call ended");
                self.after_call_lost();
            }
            CallTransition::Failed { error, .. } => {
                if let SessionError::TargetUnreachable(peer) = &error {
                    let peer = peer.clone();
                    self.set_call_status(SessionState::Ready, "Call ended");
                    self.on_target_unreachable(&peer).await;
                    return;
                }
                self.set_call_status(SessionState::Ready, format!("Call error: {}", error));
                self.after_call_lost();
            }
        }
    }

    /// Apply a call-driven status, or keep it for after re-registration
    /// while the rendezvous service is down
    fn set_call_status(&mut self, state: SessionState, status: impl Into<String>) {
        if self.state == SessionState::Reconnecting {
            self.resume = Some((state, status.into()));
            self.refresh();
            return;
        }
        self.set_status(state, status);
    }

    fn after_call_lost(&mut self) {
        // Registration runs `progress` again, which dials
        if self.role == Role::Initiator && self.state != SessionState::Reconnecting {
            self.schedule_redial();
        }
    }

    async fn on_link_transition(&mut self, transition: LinkTransition) {
        match transition {
            LinkTransition::Opened { .. } => {}
            LinkTransition::Received(payload) => {
                *self.shared.last_payload.write() = Some(payload.clone());
                self.shared.events.publish(SessionEvent::PayloadReceived {
                    payload,
                    received_at: chrono::Utc::now(),
                });
            }
            LinkTransition::Closed { .. } | LinkTransition::Failed { .. } => {
                if self.debouncer.cancel() {
                    debug!("Dropped pending payload on link close");
                }
                self.after_call_lost();
            }
        }
        self.refresh();
    }

    // ------------------------------------------------------------------
    // Media
    // ------------------------------------------------------------------

    /// Ask for a camera capture with the current facing
    fn request_capture(&mut self, purpose: AcquirePurpose) {
        if self.acquisitions.in_flight {
            // Initial requests are satisfied by whatever is already running
            if purpose == AcquirePurpose::Toggle || self.acquisitions.queued.is_some() {
                let merged = self
                    .acquisitions
                    .queued
                    .map_or(purpose, |queued| queued.merge(purpose));
                self.acquisitions.queued = Some(merged);
            }
            return;
        }

        self.acquisitions.in_flight = true;
        let profile = self.profile.with_facing(self.facing);
        let acquirer = self.acquirer.clone();
        let tx = self.internal_tx.clone();
        debug!("Acquiring {} capture ({:?})", profile.facing, purpose);
        tokio::spawn(async move {
            let result = acquirer.acquire(&profile).await;
            if let Err(mpsc::error::SendError(Internal::Acquired {
                result: Ok(stream),
                ..
            })) = tx.send(Internal::Acquired { purpose, result })
            {
                acquirer.release(&stream);
            }
        });
    }

    async fn on_acquired(&mut self, purpose: AcquirePurpose, result: Result<MediaStream>) {
        self.acquisitions.in_flight = false;

        if let Some(queued) = self.acquisitions.queued.take() {
            // Superseded while in flight
            if let Ok(stream) = result {
                debug!("Releasing superseded capture {}", stream.id());
                self.acquirer.release(&stream);
            }
            self.request_capture(queued.merge(purpose));
            return;
        }

        match result {
            Ok(stream) => self.install_capture(stream, purpose).await,
            Err(e) => {
                warn!("Capture failed: {}", e);
                match purpose {
                    AcquirePurpose::Toggle => {
                        self.facing = self.installed_facing;
                        self.set_status(self.state, format!("Camera switch error: {}", e));
                    }
                    AcquirePurpose::Initial => {
                        self.capture_failed = true;
                        if let Some(incoming) = self.pending_incoming.take() {
                            incoming.reject().await;
                            self.set_status(self.state, format!("Error answering call: {}", e));
                        } else {
                            self.set_status(self.state, format!("Media error: {}", e));
                        }
                    }
                }
                self.reply_toggle_waiters();
            }
        }
    }

    async fn install_capture(&mut self, stream: MediaStream, purpose: AcquirePurpose) {
        stream.set_enabled(TrackKind::Audio, !self.muted);
        self.capture_failed = false;

        if purpose == AcquirePurpose::Toggle {
            self.clear_video_overrides();
        }
        if self.call.has_call() {
            if self.display.is_none() && self.external.is_none() {
                if let Some(video) = stream.track(TrackKind::Video) {
                    if !self.call.replace_outgoing_video(video).await {
                        warn!("New camera video could not be attached to the call");
                    }
                }
            }
            if let Some(audio) = stream.track(TrackKind::Audio) {
                if !self.call.replace_outgoing(audio).await {
                    warn!("New microphone audio could not be attached to the call");
                }
            }
        }

        if let Some(old) = self.capture.replace(stream) {
            self.acquirer.release(&old);
        }
        self.installed_facing = self.facing;

        if purpose == AcquirePurpose::Toggle {
            info!("Switched to {} camera", self.facing);
            self.set_status(self.state, format!("Switched to {} camera", self.facing));
            self.reply_toggle_waiters();
        } else {
            self.refresh();
        }
        self.progress().await;
    }

    fn clear_video_overrides(&mut self) {
        if let Some(display) = self.display.take() {
            self.acquirer.release(&display);
        }
        self.external = None;
    }

    fn reply_toggle_waiters(&mut self) {
        for waiter in self.toggle_waiters.drain(..) {
            let _ = waiter.send(self.facing);
        }
        self.refresh();
    }

    /// Tracks to offer on a new call
    fn outgoing_stream(&self) -> Option<MediaStream> {
        let capture = self.capture.as_ref()?;
        let video = self
            .external
            .clone()
            .filter(MediaTrack::is_live)
            .or_else(|| {
                self.display
                    .as_ref()
                    .and_then(|d| d.track(TrackKind::Video).cloned())
                    .filter(MediaTrack::is_live)
            })
            .or_else(|| capture.track(TrackKind::Video).cloned());

        let tracks = capture
            .track(TrackKind::Audio)
            .cloned()
            .into_iter()
            .chain(video)
            .collect();
        Some(MediaStream::new(tracks))
    }

    fn spawn_display_capture(&mut self, reply: oneshot::Sender<ActionResult>) {
        let profile = self.profile.with_facing(self.facing);
        let acquirer = self.acquirer.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = acquirer.acquire_display(&profile).await;
            if let Err(mpsc::error::SendError(Internal::DisplayAcquired(Ok(stream), _))) =
                tx.send(Internal::DisplayAcquired(result, reply))
            {
                acquirer.release(&stream);
            }
        });
    }

    async fn on_display_acquired(&mut self, result: Result<MediaStream>) -> ActionResult {
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Screen share failed: {}", e);
                self.set_status(self.state, format!("Screen share error: {}", e));
                return ActionResult::failed(e.to_string());
            }
        };

        let Some(video) = stream.track(TrackKind::Video).cloned() else {
            self.acquirer.release(&stream);
            return ActionResult::failed("Display capture has no video track");
        };
        if self.call.has_call() && !self.call.replace_outgoing_video(&video).await {
            self.acquirer.release(&stream);
            self.set_status(self.state, "Screen share error: no video sender");
            return ActionResult::failed("No video sender on the current call");
        }

        if let Some(old) = self.display.replace(stream.clone()) {
            self.acquirer.release(&old);
        }
        self.external = None;

        let tx = self.internal_tx.clone();
        let stream_id = stream.id().to_string();
        self.track_task(tokio::spawn(async move {
            if video.ended().await == TrackState::SourceEnded {
                let _ = tx.send(Internal::DisplayEnded { stream_id });
            }
        }));

        info!("Sharing screen");
        self.set_status(self.state, "Sharing screen");
        ActionResult::ok()
    }

    // ------------------------------------------------------------------
    // Calls and links
    // ------------------------------------------------------------------

    /// Move toward a full session: capture held, call up, link up
    ///
    /// Call and link are independent; a failure of one never aborts the
    /// other.
    async fn progress(&mut self) {
        if !matches!(self.state, SessionState::Ready | SessionState::InCall) {
            return;
        }
        let dialing = self.role == Role::Initiator && !self.redial_pending;

        if dialing && !self.link.has_link() {
            match self.link.open(self.rendezvous.as_ref(), &self.target_id).await {
                Ok(started) => self.forward_link_events(started.generation, started.events),
                Err(SessionError::TargetUnreachable(peer)) => {
                    self.on_target_unreachable(&peer).await;
                    return;
                }
                Err(e) => warn!("Failed to open data link: {}", e),
            }
        }

        let Some(stream) = self.outgoing_stream() else {
            let wants_call = self.pending_incoming.is_some()
                || (dialing && !self.call.has_call() && !self.capture_failed);
            if wants_call {
                self.request_capture(AcquirePurpose::Initial);
            }
            return;
        };

        if let Some(incoming) = self.pending_incoming.take() {
            let peer = incoming.peer().clone();
            match self.call.answer_call(incoming, stream).await {
                Ok(started) => {
                    self.forward_call_events(started.generation, started.events);
                    self.set_status(self.state, format!("Call connected with {}", peer));
                }
                Err(e) => {
                    warn!("Failed to answer {}: {}", peer, e);
                    self.set_status(self.state, format!("Error answering call: {}", e));
                }
            }
        } else if dialing && !self.call.has_call() {
            self.set_status(self.state, format!("Calling {}...", self.target_id));
            match self
                .call
                .start_call(self.rendezvous.as_ref(), &self.target_id, stream)
                .await
            {
                Ok(started) => {
                    self.forward_call_events(started.generation, started.events);
                    self.refresh();
                }
                Err(SessionError::TargetUnreachable(peer)) => {
                    self.on_target_unreachable(&peer).await;
                }
                Err(e) => {
                    warn!("Failed to call {}: {}", self.target_id, e);
                    self.set_status(self.state, format!("Call error: {}", e));
                    self.schedule_redial();
                }
            }
        }
    }

    fn forward_call_events(
        &mut self,
        generation: u64,
        events: Option<mpsc::UnboundedReceiver<CallEvent>>,
    ) {
        let Some(mut events) = events else {
            return;
        };
        let tx = self.internal_tx.clone();
        self.track_task(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send(Internal::Call { generation, event }).is_err() {
                    break;
                }
            }
        }));
    }

    fn forward_link_events(
        &mut self,
        generation: u64,
        events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    ) {
        let Some(mut events) = events else {
            return;
        };
        let tx = self.internal_tx.clone();
        self.track_task(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send(Internal::Link { generation, event }).is_err() {
                    break;
                }
            }
        }));
    }

    fn track_task(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    fn set_status(&mut self, state: SessionState, status: impl Into<String>) {
        self.state = state;
        self.status = status.into();
        self.refresh();
    }

    /// Publish the current snapshot and an event for every field that changed
    fn refresh(&mut self) {
        let remote = self.call.remote_stream().cloned();
        let next = SessionSnapshot {
            state: self.state,
            status: self.status.clone(),
            role: self.role,
            own_id: self.own_id.clone(),
            target_id: self.target_id.clone(),
            call_state: self.call.state(),
            link_state: self.link.state(),
            data_link_open: self.link.is_open(),
            muted: self.muted,
            facing: self.facing,
            screen_sharing: self.display.is_some(),
            has_remote_stream: remote.is_some(),
        };
        *self.shared.remote.write() = remote;

        let prev = self.snapshot_tx.borrow().clone();
        if next == prev {
            return;
        }

        let events = &self.shared.events;
        if next.state != prev.state || next.status != prev.status {
            info!("Status: {}", next.status);
            events.publish(SessionEvent::StatusChanged {
                state: next.state,
                status: next.status.clone(),
            });
        }
        if next.call_state != prev.call_state {
            events.publish(SessionEvent::CallStateChanged {
                state: next.call_state,
                peer: self.call.handle().map(|h| h.peer().to_string()),
            });
        }
        if next.has_remote_stream != prev.has_remote_stream {
            events.publish(SessionEvent::RemoteStreamChanged {
                available: next.has_remote_stream,
            });
        }
        if next.link_state != prev.link_state {
            events.publish(SessionEvent::DataLinkChanged {
                state: next.link_state,
            });
        }
        if next.muted != prev.muted {
            events.publish(SessionEvent::MuteChanged { muted: next.muted });
        }
        if next.facing != prev.facing {
            events.publish(SessionEvent::FacingChanged {
                facing: next.facing,
            });
        }

        self.snapshot_tx.send_replace(next);
    }

    /// Tear down calls, links, captures and the rendezvous connection
    async fn end_session(&mut self) {
        if self.ended {
            return;
        }
        info!("Ending session {}", self.own_id);

        self.flush_pending_payload().await;
        self.call.end().await;
        self.link.close().await;
        if let Some(incoming) = self.pending_incoming.take() {
            incoming.reject().await;
        }

        if let Some(capture) = self.capture.take() {
            self.acquirer.release(&capture);
        }
        if let Some(display) = self.display.take() {
            self.acquirer.release(&display);
        }
        self.external = None;
        self.acquisitions.queued = None;

        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.rendezvous.destroy().await;
        self.rendezvous_rx = None;

        self.ended = true;
        self.reply_toggle_waiters();
        self.set_status(SessionState::Ended, "Call ended manually");
        self.shared.events.publish(SessionEvent::SessionEnded);
    }
}
