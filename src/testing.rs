//! In-memory fakes for the transport and media ports
//!
//! Every fake records what was done to it so tests can assert on calls,
//! sent payloads, replaced tracks and live captures.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Result, SessionError};
use crate::identity::EndpointId;
use crate::media::{CaptureProfile, LensFacing, MediaAcquirer, MediaStream, MediaTrack, TrackKind};
use crate::payload::Payload;
use crate::transport::{
    CallEvent, DataConnection, IncomingCall, LinkEvent, MediaConnection, OutboundSender,
    Rendezvous, RendezvousEvent,
};

/// Audio + video stream with fresh live tracks
pub fn camera_stream() -> MediaStream {
    MediaStream::new(vec![
        MediaTrack::new(TrackKind::Audio, "mic", "audio/opus"),
        MediaTrack::new(TrackKind::Video, "camera", "video/H264"),
    ])
}

// ----------------------------------------------------------------------------
// Calls
// ----------------------------------------------------------------------------

pub struct FakeSender {
    lane: Option<TrackKind>,
    track: Mutex<Option<MediaTrack>>,
    replaced: AtomicUsize,
}

impl FakeSender {
    fn new(lane: Option<TrackKind>, track: Option<MediaTrack>) -> Arc<Self> {
        Arc::new(Self {
            lane,
            track: Mutex::new(track),
            replaced: AtomicUsize::new(0),
        })
    }

    pub fn track(&self) -> Option<MediaTrack> {
        self.track.lock().clone()
    }
}

#[async_trait]
impl OutboundSender for FakeSender {
    async fn track_kind(&self) -> Option<TrackKind> {
        self.track.lock().as_ref().map(|t| t.kind())
    }

    fn lane(&self) -> Option<TrackKind> {
        self.lane
    }

    async fn replace_track(&self, track: Option<MediaTrack>) -> Result<()> {
        *self.track.lock() = track;
        self.replaced.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeCallControl {
    peer: EndpointId,
    offered: MediaStream,
    senders: Vec<Arc<FakeSender>>,
    events: mpsc::UnboundedSender<CallEvent>,
    closed: AtomicBool,
}

impl FakeCallControl {
    fn new(peer: EndpointId, stream: &MediaStream) -> (Arc<Self>, FakeCall) {
        let senders = [TrackKind::Audio, TrackKind::Video]
            .into_iter()
            .map(|kind| FakeSender::new(Some(kind), stream.track(kind).cloned()))
            .collect();
        let (tx, rx) = mpsc::unbounded_channel();
        let control = Arc::new(Self {
            peer,
            offered: stream.clone(),
            senders,
            events: tx,
            closed: AtomicBool::new(false),
        });
        let call = FakeCall {
            control: control.clone(),
            events: Some(rx),
        };
        (control, call)
    }

    pub fn peer(&self) -> &EndpointId {
        &self.peer
    }

    /// Stream the call was placed or answered with
    pub fn offered(&self) -> &MediaStream {
        &self.offered
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Track currently attached to the sender negotiated for `kind`
    pub fn sent_track(&self, kind: TrackKind) -> Option<MediaTrack> {
        self.senders
            .iter()
            .find(|s| s.lane == Some(kind))
            .and_then(|s| s.track())
    }

    pub fn replace_count(&self) -> usize {
        self.senders
            .iter()
            .map(|s| s.replaced.load(Ordering::SeqCst))
            .sum()
    }

    /// Empty the sender of `kind`, as after its track was stopped and removed
    pub fn detach(&self, kind: TrackKind) {
        for sender in self.senders.iter().filter(|s| s.lane == Some(kind)) {
            *sender.track.lock() = None;
        }
    }

    /// Remote media arrives
    pub fn connect(&self, remote: MediaStream) {
        let _ = self.events.send(CallEvent::RemoteStream(remote));
    }

    pub fn remote_close(&self) {
        let _ = self.events.send(CallEvent::Closed);
    }

    pub fn fail(&self, error: SessionError) {
        let _ = self.events.send(CallEvent::Error(error));
    }
}

pub struct FakeCall {
    control: Arc<FakeCallControl>,
    events: Option<mpsc::UnboundedReceiver<CallEvent>>,
}

#[async_trait]
impl MediaConnection for FakeCall {
    fn peer(&self) -> &EndpointId {
        &self.control.peer
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<CallEvent>> {
        self.events.take()
    }

    fn senders(&self) -> Vec<Arc<dyn OutboundSender>> {
        self.control
            .senders
            .iter()
            .map(|s| s.clone() as Arc<dyn OutboundSender>)
            .collect()
    }

    async fn close(&self) {
        self.control.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeIncomingCall {
    peer: EndpointId,
    registry: Arc<Registry>,
}

impl FakeIncomingCall {
    pub fn new(rendezvous: &FakeRendezvous, peer: &str) -> Self {
        Self {
            peer: EndpointId::from(peer),
            registry: rendezvous.registry.clone(),
        }
    }
}

#[async_trait]
impl IncomingCall for FakeIncomingCall {
    fn peer(&self) -> &EndpointId {
        &self.peer
    }

    async fn answer(self: Box<Self>, stream: &MediaStream) -> Result<Box<dyn MediaConnection>> {
        let (control, call) = FakeCallControl::new(self.peer.clone(), stream);
        self.registry.calls.lock().push(control);
        Ok(Box::new(call))
    }

    async fn reject(self: Box<Self>) {
        self.registry.rejected.fetch_add(1, Ordering::SeqCst);
    }
}

// ----------------------------------------------------------------------------
// Links
// ----------------------------------------------------------------------------

pub struct FakeLinkControl {
    peer: EndpointId,
    open: AtomicBool,
    closed: AtomicBool,
    sent: Mutex<Vec<Bytes>>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl FakeLinkControl {
    pub fn peer(&self) -> &EndpointId {
        &self.peer
    }

    /// Link becomes usable
    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        let _ = self.events.send(LinkEvent::Open);
    }

    pub fn deliver(&self, payload: &Payload) {
        if let Ok(data) = payload.encode() {
            self.deliver_raw(data);
        }
    }

    pub fn deliver_raw(&self, data: Bytes) {
        let _ = self.events.send(LinkEvent::Data(data));
    }

    pub fn remote_close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.events.send(LinkEvent::Closed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn sent_payloads(&self) -> Vec<Payload> {
        self.sent
            .lock()
            .iter()
            .filter_map(|data| Payload::decode(data).ok().flatten())
            .collect()
    }
}

pub struct FakeLink {
    control: Arc<FakeLinkControl>,
    events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
}

impl FakeLink {
    pub fn new(peer: &str) -> (Self, Arc<FakeLinkControl>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let control = Arc::new(FakeLinkControl {
            peer: EndpointId::from(peer),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            events: tx,
        });
        (
            Self {
                control: control.clone(),
                events: Some(rx),
            },
            control,
        )
    }

    /// A link that is already open when handed over
    pub fn opened(peer: &str) -> (Self, Arc<FakeLinkControl>) {
        let (link, control) = Self::new(peer);
        control.open.store(true, Ordering::SeqCst);
        (link, control)
    }
}

#[async_trait]
impl DataConnection for FakeLink {
    fn peer(&self) -> &EndpointId {
        &self.control.peer
    }

    fn is_open(&self) -> bool {
        self.control.open.load(Ordering::SeqCst) && !self.control.is_closed()
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
        self.events.take()
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(SessionError::SendOnClosedLink);
        }
        self.control.sent.lock().push(data);
        Ok(())
    }

    async fn close(&self) {
        self.control.open.store(false, Ordering::SeqCst);
        self.control.closed.store(true, Ordering::SeqCst);
    }
}

// ----------------------------------------------------------------------------
// Rendezvous
// ----------------------------------------------------------------------------

#[derive(Default)]
struct Registry {
    calls: Mutex<Vec<Arc<FakeCallControl>>>,
    links: Mutex<Vec<Arc<FakeLinkControl>>>,
    rejected: AtomicUsize,
}

pub struct FakeRendezvous {
    registry: Arc<Registry>,
    events: Mutex<Option<mpsc::UnboundedSender<RendezvousEvent>>>,
    own: Mutex<Option<EndpointId>>,
    auto_open: AtomicBool,
    reconnect_failures: AtomicUsize,
    connects: AtomicUsize,
    reconnects: AtomicUsize,
    destroyed: AtomicBool,
    call_error: Mutex<Option<SessionError>>,
}

impl FakeRendezvous {
    /// Rendezvous that registers immediately on connect and reconnect
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            events: Mutex::new(None),
            own: Mutex::new(None),
            auto_open: AtomicBool::new(true),
            reconnect_failures: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            reconnects: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
            call_error: Mutex::new(None),
        }
    }

    /// Rendezvous that waits for [`Self::emit`] of `Open`
    pub fn manual() -> Self {
        let rendezvous = Self::new();
        rendezvous.auto_open.store(false, Ordering::SeqCst);
        rendezvous
    }

    pub fn emit(&self, event: RendezvousEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn disconnect(&self) {
        self.emit(RendezvousEvent::Disconnected);
    }

    pub fn incoming_call(&self, peer: &str) {
        self.emit(RendezvousEvent::IncomingCall(Box::new(FakeIncomingCall::new(
            self, peer,
        ))));
    }

    pub fn incoming_link(&self, peer: &str) -> Arc<FakeLinkControl> {
        let (link, control) = FakeLink::new(peer);
        self.registry.links.lock().push(control.clone());
        self.emit(RendezvousEvent::IncomingLink(Box::new(link)));
        control
    }

    /// The next `count` reconnect attempts fail
    pub fn fail_reconnects(&self, count: usize) {
        self.reconnect_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_calls_with(&self, error: SessionError) {
        *self.call_error.lock() = Some(error);
    }

    pub fn calls(&self) -> Vec<Arc<FakeCallControl>> {
        self.registry.calls.lock().clone()
    }

    pub fn links(&self) -> Vec<Arc<FakeLinkControl>> {
        self.registry.links.lock().clone()
    }

    pub fn rejected_count(&self) -> usize {
        self.registry.rejected.load(Ordering::SeqCst)
    }

    pub fn own_id(&self) -> Option<EndpointId> {
        self.own.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn reconnect_count(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl Default for FakeRendezvous {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Rendezvous for FakeRendezvous {
    async fn connect(&self, own: &EndpointId) -> Result<mpsc::UnboundedReceiver<RendezvousEvent>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.own.lock() = Some(own.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        if self.auto_open.load(Ordering::SeqCst) {
            let _ = tx.send(RendezvousEvent::Open);
        }
        *self.events.lock() = Some(tx);
        Ok(rx)
    }

    async fn reconnect(&self) -> Result<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .reconnect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(SessionError::TransportDisconnected);
        }
        if self.auto_open.load(Ordering::SeqCst) {
            self.emit(RendezvousEvent::Open);
        }
        Ok(())
    }

    async fn call(
        &self,
        target: &EndpointId,
        stream: &MediaStream,
    ) -> Result<Box<dyn MediaConnection>> {
        if let Some(error) = self.call_error.lock().clone() {
            return Err(error);
        }
        let (control, call) = FakeCallControl::new(target.clone(), stream);
        self.registry.calls.lock().push(control);
        Ok(Box::new(call))
    }

    async fn open_link(&self, target: &EndpointId) -> Result<Box<dyn DataConnection>> {
        let (link, control) = FakeLink::new(target.as_str());
        self.registry.links.lock().push(control);
        Ok(Box::new(link))
    }

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.emit(RendezvousEvent::Closed);
    }
}

// ----------------------------------------------------------------------------
// Media
// ----------------------------------------------------------------------------

pub struct FakeAcquirer {
    captures: Mutex<Vec<MediaStream>>,
    displays: Mutex<Vec<MediaStream>>,
    facings: Mutex<Vec<LensFacing>>,
    max_live: AtomicUsize,
    delay: Mutex<Duration>,
    fail_next: Mutex<Option<SessionError>>,
    display_supported: AtomicBool,
}

impl FakeAcquirer {
    /// Camera capture only; display capture is unsupported
    pub fn new() -> Self {
        Self {
            captures: Mutex::new(Vec::new()),
            displays: Mutex::new(Vec::new()),
            facings: Mutex::new(Vec::new()),
            max_live: AtomicUsize::new(0),
            delay: Mutex::new(Duration::ZERO),
            fail_next: Mutex::new(None),
            display_supported: AtomicBool::new(false),
        }
    }

    pub fn with_display() -> Self {
        let acquirer = Self::new();
        acquirer.display_supported.store(true, Ordering::SeqCst);
        acquirer
    }

    /// Every camera acquisition takes `delay`
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn fail_next(&self, error: SessionError) {
        *self.fail_next.lock() = Some(error);
    }

    pub fn acquire_count(&self) -> usize {
        self.captures.lock().len()
    }

    /// Camera captures with at least one live track
    pub fn live_captures(&self) -> usize {
        self.captures
            .lock()
            .iter()
            .filter(|s| s.has_live_tracks())
            .count()
    }

    /// Highest number of simultaneously live camera captures observed
    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn captures(&self) -> Vec<MediaStream> {
        self.captures.lock().clone()
    }

    pub fn displays(&self) -> Vec<MediaStream> {
        self.displays.lock().clone()
    }

    pub fn facings(&self) -> Vec<LensFacing> {
        self.facings.lock().clone()
    }
}

impl Default for FakeAcquirer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaAcquirer for FakeAcquirer {
    async fn acquire(&self, profile: &CaptureProfile) -> Result<MediaStream> {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.fail_next.lock().take() {
            return Err(error);
        }

        let stream = camera_stream();
        let mut captures = self.captures.lock();
        let live = captures.iter().filter(|s| s.has_live_tracks()).count() + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
        captures.push(stream.clone());
        self.facings.lock().push(profile.facing);
        Ok(stream)
    }

    async fn acquire_display(&self, _profile: &CaptureProfile) -> Result<MediaStream> {
        if !self.display_supported.load(Ordering::SeqCst) {
            return Err(SessionError::Unsupported(
                "Screen sharing not supported".to_string(),
            ));
        }
        let stream = MediaStream::new(vec![MediaTrack::new(
            TrackKind::Video,
            "screen",
            "video/H264",
        )]);
        self.displays.lock().push(stream.clone());
        Ok(stream)
    }
}
