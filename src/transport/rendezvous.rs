//! WebSocket rendezvous client
//!
//! Registers the local identifier with a rendezvous server and relays
//! per-connection signaling for the WebRTC peers. Every media call and data
//! link is its own peer connection, addressed by a `connection_id`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::peer::{WebRtcCall, WebRtcIncomingCall, WebRtcLink};
use super::signaling::{ChannelKind, ClientMessage, ServerMessage, SignalPayload};
use super::{DataConnection, MediaConnection, Rendezvous, RendezvousEvent};
use crate::config::{AppConfig, RendezvousConfig, WebRtcConfig};
use crate::error::{Result, SessionError};
use crate::identity::EndpointId;
use crate::media::MediaStream;

/// Rendezvous service reached over a WebSocket
pub struct WsRendezvous {
    hub: Arc<Hub>,
}

impl WsRendezvous {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            hub: Arc::new(Hub::new(config.rendezvous.clone(), config.webrtc.clone())),
        }
    }
}

/// Shared state of the client: socket writer, routes and event sink
struct Hub {
    config: RendezvousConfig,
    webrtc: WebRtcConfig,
    own: Mutex<Option<EndpointId>>,
    events: Mutex<Option<mpsc::UnboundedSender<RendezvousEvent>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>,
    /// Signal sinks of live peer connections, by connection id
    routes: Mutex<HashMap<String, mpsc::UnboundedSender<SignalPayload>>>,
    socket_tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Hub {
    fn new(config: RendezvousConfig, webrtc: WebRtcConfig) -> Self {
        Self {
            config,
            webrtc,
            own: Mutex::new(None),
            events: Mutex::new(None),
            outbound: Mutex::new(None),
            routes: Mutex::new(HashMap::new()),
            socket_tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn emit(&self, event: RendezvousEvent) {
        if let Some(events) = self.events.lock().as_ref() {
            let _ = events.send(event);
        }
    }

    fn send(&self, message: ClientMessage) -> Result<()> {
        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or(SessionError::TransportDisconnected)?;
        tx.send(message)
            .map_err(|_| SessionError::TransportDisconnected)
    }

    fn route(&self, connection_id: &str) -> mpsc::UnboundedReceiver<SignalPayload> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().insert(connection_id.to_string(), tx);
        rx
    }

    fn unroute(&self, connection_id: &str) {
        self.routes.lock().remove(connection_id);
    }

    fn stop_socket(&self) {
        *self.outbound.lock() = None;
        for task in self.socket_tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Open the socket and register under the stored identifier
    async fn open_socket(self: &Arc<Self>) -> Result<()> {
        let own = self
            .own
            .lock()
            .clone()
            .ok_or_else(|| SessionError::Internal("not registered".to_string()))?;
        self.stop_socket();

        let url = self.config.server_url.as_str();
        debug!("Connecting to rendezvous service at {}", url);
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let (ws, _) = match tokio::time::timeout(timeout, connect_async(url)).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => {
                warn!("Failed to connect to {}: {}", url, e);
                return Err(SessionError::TransportDisconnected);
            }
            Err(_) => {
                warn!("Timed out connecting to {}", url);
                return Err(SessionError::TransportDisconnected);
            }
        };
        info!("Connected to rendezvous service at {}", url);

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let _ = out_tx.send(ClientMessage::Register {
            id: own.to_string(),
        });

        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let leaving = message == ClientMessage::Leave;
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode rendezvous message: {}", e);
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
                if leaving {
                    let _ = sink.close().await;
                    break;
                }
            }
        });

        let hub = self.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => hub.on_text(text.as_str()),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Rendezvous socket error: {}", e);
                        break;
                    }
                }
            }
            hub.on_socket_lost();
        });

        let heartbeat_tx = out_tx.clone();
        let period = Duration::from_secs(self.config.heartbeat_secs.max(1));
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(ClientMessage::Heartbeat).is_err() {
                    break;
                }
            }
        });

        *self.outbound.lock() = Some(out_tx);
        *self.socket_tasks.lock() = vec![writer, reader, heartbeat];
        Ok(())
    }

    fn on_socket_lost(&self) {
        *self.outbound.lock() = None;
        if !self.closed.load(Ordering::SeqCst) {
            warn!("Lost connection to rendezvous service");
            self.emit(RendezvousEvent::Disconnected);
        }
    }

    fn on_text(self: &Arc<Self>, text: &str) {
        let message: ServerMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Invalid rendezvous message: {}", e);
                return;
            }
        };

        match message {
            ServerMessage::Open { id } => {
                info!("Registered with rendezvous service as {}", id);
                self.emit(RendezvousEvent::Open);
            }
            ServerMessage::Signal {
                from,
                connection_id,
                payload,
            } => self.on_signal(EndpointId::from(from.as_str()), connection_id, payload),
            ServerMessage::Error {
                kind,
                message,
                peer,
            } => {
                let error = kind.into_error(message, peer);
                warn!("Rendezvous service error: {}", error);
                self.emit(RendezvousEvent::Error(error));
            }
        }
    }

    fn on_signal(self: &Arc<Self>, from: EndpointId, connection_id: String, payload: SignalPayload) {
        let route = self.routes.lock().get(&connection_id).cloned();
        if let Some(route) = route {
            if route.send(payload).is_err() {
                self.unroute(&connection_id);
            }
            return;
        }

        match payload {
            SignalPayload::Offer {
                sdp,
                channel: ChannelKind::Media,
            } => {
                debug!("Call offer from {} ({})", from, connection_id);
                let signals = self.route(&connection_id);
                let signal = SignalSender::new(self.clone(), from, connection_id);
                let incoming = WebRtcIncomingCall::new(self.webrtc.clone(), signal, signals, sdp);
                self.emit(RendezvousEvent::IncomingCall(Box::new(incoming)));
            }
            SignalPayload::Offer {
                sdp,
                channel: ChannelKind::Data,
            } => {
                debug!("Data link offer from {} ({})", from, connection_id);
                let signals = self.route(&connection_id);
                let signal = SignalSender::new(self.clone(), from, connection_id);
                let hub = self.clone();
                tokio::spawn(async move {
                    match WebRtcLink::answer(&hub.webrtc, signal.clone(), signals, sdp).await {
                        Ok(link) => hub.emit(RendezvousEvent::IncomingLink(Box::new(link))),
                        Err(e) => {
                            warn!("Failed to accept data link from {}: {}", signal.peer(), e);
                            signal.close();
                        }
                    }
                });
            }
            other => debug!(
                "Ignoring {} from {} for unknown connection {}",
                other.kind(),
                from,
                connection_id
            ),
        }
    }
}

/// Signaling path of one peer connection
#[derive(Clone)]
pub(crate) struct SignalSender {
    hub: Arc<Hub>,
    to: EndpointId,
    connection_id: String,
}

impl SignalSender {
    fn new(hub: Arc<Hub>, to: EndpointId, connection_id: String) -> Self {
        Self {
            hub,
            to,
            connection_id,
        }
    }

    /// Sender without a service connection; every send fails
    #[cfg(test)]
    pub(crate) fn detached(to: EndpointId) -> Self {
        let hub = Hub::new(RendezvousConfig::default(), WebRtcConfig::default());
        Self::new(Arc::new(hub), to, "detached".to_string())
    }

    pub fn peer(&self) -> &EndpointId {
        &self.to
    }

    pub fn send(&self, payload: SignalPayload) -> Result<()> {
        self.hub.send(ClientMessage::Signal {
            to: self.to.to_string(),
            connection_id: self.connection_id.clone(),
            payload,
        })
    }

    /// Tell the peer the connection is gone and stop routing its signals
    pub fn close(&self) {
        let _ = self.send(SignalPayload::Close);
        self.hub.unroute(&self.connection_id);
    }
}

#[async_trait]
impl Rendezvous for WsRendezvous {
    async fn connect(&self, own: &EndpointId) -> Result<mpsc::UnboundedReceiver<RendezvousEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.hub.own.lock() = Some(own.clone());
        *self.hub.events.lock() = Some(tx);
        self.hub.closed.store(false, Ordering::SeqCst);
        self.hub.open_socket().await?;
        Ok(rx)
    }

    async fn reconnect(&self) -> Result<()> {
        if self.hub.closed.load(Ordering::SeqCst) {
            return Err(SessionError::TransportDisconnected);
        }
        self.hub.open_socket().await
    }

    async fn call(
        &self,
        target: &EndpointId,
        stream: &MediaStream,
    ) -> Result<Box<dyn MediaConnection>> {
        let connection_id = uuid::Uuid::new_v4().to_string();
        let signals = self.hub.route(&connection_id);
        let signal = SignalSender::new(self.hub.clone(), target.clone(), connection_id.clone());

        match WebRtcCall::dial(&self.hub.webrtc, signal, signals, stream).await {
            Ok(call) => Ok(Box::new(call)),
            Err(e) => {
                self.hub.unroute(&connection_id);
                Err(e)
            }
        }
    }

    async fn open_link(&self, target: &EndpointId) -> Result<Box<dyn DataConnection>> {
        let connection_id = uuid::Uuid::new_v4().to_string();
        let signals = self.hub.route(&connection_id);
        let signal = SignalSender::new(self.hub.clone(), target.clone(), connection_id.clone());

        match WebRtcLink::open(&self.hub.webrtc, signal, signals).await {
            Ok(link) => Ok(Box::new(link)),
            Err(e) => {
                self.hub.unroute(&connection_id);
                Err(e)
            }
        }
    }

    async fn destroy(&self) {
        if self.hub.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Leaving rendezvous service");

        let _ = self.hub.send(ClientMessage::Leave);
        // The writer drains `Leave` and closes the socket on its own
        *self.hub.outbound.lock() = None;
        let mut tasks = self.hub.socket_tasks.lock();
        for task in tasks.iter().skip(1) {
            task.abort();
        }
        tasks.clear();
        drop(tasks);

        self.hub.routes.lock().clear();
        self.hub.emit(RendezvousEvent::Closed);
        *self.hub.events.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn hub_with_events() -> (Arc<Hub>, mpsc::UnboundedReceiver<RendezvousEvent>) {
        let hub = Arc::new(Hub::new(
            RendezvousConfig::default(),
            WebRtcConfig::default(),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        *hub.events.lock() = Some(tx);
        (hub, rx)
    }

    #[tokio::test]
    async fn test_open_and_errors_become_events() {
        let (hub, mut events) = hub_with_events();

        hub.on_text(r#"{"type":"open","id":"ABCD-initiator"}"#);
        assert!(matches!(events.try_recv(), Ok(RendezvousEvent::Open)));

        hub.on_text(
            r#"{"type":"error","kind":"peer-unavailable","message":"gone","peer":"ABCD-responder"}"#,
        );
        match events.try_recv() {
            Ok(RendezvousEvent::Error(SessionError::TargetUnreachable(peer))) => {
                assert_eq!(peer, "ABCD-responder")
            }
            other => panic!("unexpected event: {:?}", other),
        }

        hub.on_text("not json");
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_signals_follow_routes() {
        let (hub, mut events) = hub_with_events();
        let mut signals = hub.route("c1");

        hub.on_text(
            r#"{"type":"signal","from":"ABCD-responder","connection_id":"c1","payload":{"type":"answer","sdp":"v=0"}}"#,
        );
        assert_eq!(
            signals.try_recv().unwrap(),
            SignalPayload::Answer {
                sdp: "v=0".to_string()
            }
        );

        // Signals for unknown connections are dropped
        hub.on_text(
            r#"{"type":"signal","from":"ABCD-responder","connection_id":"c9","payload":{"type":"close"}}"#,
        );
        assert!(events.try_recv().is_err());

        hub.unroute("c1");
        hub.on_text(
            r#"{"type":"signal","from":"ABCD-responder","connection_id":"c1","payload":{"type":"close"}}"#,
        );
        assert!(signals.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_without_socket() {
        let (hub, _events) = hub_with_events();
        let signal = SignalSender::new(hub, EndpointId::from("x"), "c1".to_string());
        assert_eq!(
            signal.send(SignalPayload::Close),
            Err(SessionError::TransportDisconnected)
        );
    }

    #[tokio::test]
    async fn test_register_over_websocket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let first = ws.next().await.unwrap().unwrap();
            let register: ClientMessage = serde_json::from_str(first.to_text().unwrap()).unwrap();
            let ClientMessage::Register { id } = register else {
                panic!("expected register");
            };
            let open = serde_json::to_string(&ServerMessage::Open { id: id.clone() }).unwrap();
            ws.send(Message::Text(open.into())).await.unwrap();

            // Wait for leave
            while let Some(Ok(frame)) = ws.next().await {
                if let Ok(text) = frame.to_text() {
                    if serde_json::from_str::<ClientMessage>(text).ok() == Some(ClientMessage::Leave) {
                        return id;
                    }
                }
            }
            id
        });

        let mut config = AppConfig::default();
        config.rendezvous.server_url = format!("ws://{}", addr);
        let rendezvous = WsRendezvous::new(&config);
        let mut events = rendezvous
            .connect(&EndpointId::from("ABCD-initiator"))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(RendezvousEvent::Open)));

        rendezvous.destroy().await;
        let registered = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(registered, "ABCD-initiator");
        assert!(matches!(events.recv().await, Some(RendezvousEvent::Closed)));
        assert!(rendezvous.reconnect().await.is_err());
    }
}
