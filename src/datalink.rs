//! Data link channel
//!
//! Owns the single reliable, ordered payload link of a session. Delivery is
//! best-effort: sending on an absent or closed link is logged and dropped.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::identity::EndpointId;
use crate::payload::Payload;
use crate::transport::{DataConnection, LinkEvent, Rendezvous};
use crate::utils::LogThrottler;
use crate::warn_throttled;

const CLOSED_LINK_KEY: &str = "send_on_closed_link";

/// Data link lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Open,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Open => write!(f, "open"),
            LinkState::Closed => write!(f, "closed"),
        }
    }
}

/// The one live data link
pub struct DataLinkHandle {
    peer: EndpointId,
    connection: Box<dyn DataConnection>,
    generation: u64,
}

/// A freshly installed link: its generation and event channel
pub struct LinkStarted {
    pub generation: u64,
    pub events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
}

/// Outcome of a link event, for the session to act on
#[derive(Debug)]
pub enum LinkTransition {
    Opened { peer: EndpointId },
    Received(Payload),
    Closed { peer: EndpointId },
    Failed { peer: EndpointId, error: SessionError },
}

pub struct DataLinkChannel {
    state: LinkState,
    handle: Option<DataLinkHandle>,
    generation: u64,
    throttler: LogThrottler,
}

impl DataLinkChannel {
    pub fn new() -> Self {
        Self {
            state: LinkState::Disconnected,
            handle: None,
            generation: 0,
            throttler: LogThrottler::default(),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn has_link(&self) -> bool {
        self.handle.is_some()
    }

    pub fn is_open(&self) -> bool {
        self.state == LinkState::Open && self.handle.is_some()
    }

    /// Open a link to `target`
    pub async fn open(
        &mut self,
        rendezvous: &dyn Rendezvous,
        target: &EndpointId,
    ) -> Result<LinkStarted> {
        self.close().await;
        info!("Opening data link to {}", target);
        self.state = LinkState::Connecting;
        match rendezvous.open_link(target).await {
            Ok(connection) => Ok(self.install(connection)),
            Err(e) => {
                self.state = LinkState::Closed;
                Err(e)
            }
        }
    }

    /// Take over an inbound link, replacing any current one
    pub async fn accept(&mut self, connection: Box<dyn DataConnection>) -> LinkStarted {
        if let Some(old) = self.handle.take() {
            debug!("Replacing data link with {}", old.peer);
            old.connection.close().await;
        }
        info!("Accepted data link from {}", connection.peer());
        self.install(connection)
    }

    fn install(&mut self, mut connection: Box<dyn DataConnection>) -> LinkStarted {
        self.generation += 1;
        self.state = if connection.is_open() {
            LinkState::Open
        } else {
            LinkState::Connecting
        };
        let events = connection.take_events();
        self.handle = Some(DataLinkHandle {
            peer: connection.peer().clone(),
            connection,
            generation: self.generation,
        });
        LinkStarted {
            generation: self.generation,
            events,
        }
    }

    /// Send a payload if the link is open
    ///
    /// Never fails: returns whether the payload was handed to the link.
    pub async fn send(&self, payload: &Payload) -> bool {
        let handle = match &self.handle {
            Some(handle) if self.state == LinkState::Open => handle,
            _ => {
                warn_throttled!(
                    self.throttler,
                    CLOSED_LINK_KEY,
                    "Cannot send {} payload: {}",
                    payload.tag(),
                    SessionError::SendOnClosedLink
                );
                return false;
            }
        };

        let data = match payload.encode() {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to encode {} payload: {}", payload.tag(), e);
                return false;
            }
        };

        match handle.connection.send(data).await {
            Ok(()) => {
                debug!("Sent {} payload to {}", payload.tag(), handle.peer);
                true
            }
            Err(e) => {
                warn!("Failed to send {} payload: {}", payload.tag(), e);
                false
            }
        }
    }

    /// Apply a transport event
    ///
    /// Events from a replaced link are ignored, as are payloads with unknown
    /// tags.
    pub async fn on_event(&mut self, generation: u64, event: LinkEvent) -> Option<LinkTransition> {
        let peer = self
            .handle
            .as_ref()
            .filter(|h| h.generation == generation)?
            .peer
            .clone();

        match event {
            LinkEvent::Open => {
                info!("Data link open with {}", peer);
                self.state = LinkState::Open;
                self.throttler.clear(CLOSED_LINK_KEY);
                Some(LinkTransition::Opened { peer })
            }
            LinkEvent::Data(data) => match Payload::decode(&data) {
                Ok(Some(payload)) => {
                    debug!("Received {} payload from {}", payload.tag(), peer);
                    Some(LinkTransition::Received(payload))
                }
                Ok(None) => {
                    debug!("Ignoring payload with unknown tag from {}", peer);
                    None
                }
                Err(e) => {
                    warn!("Dropping malformed payload from {}: {}", peer, e);
                    None
                }
            },
            LinkEvent::Closed => {
                info!("Data link with {} closed", peer);
                if let Some(handle) = self.handle.take() {
                    handle.connection.close().await;
                }
                self.state = LinkState::Closed;
                Some(LinkTransition::Closed { peer })
            }
            LinkEvent::Error(error) => {
                warn!("Data link with {} failed: {}", peer, error);
                if let Some(handle) = self.handle.take() {
                    handle.connection.close().await;
                }
                self.state = LinkState::Closed;
                Some(LinkTransition::Failed { peer, error })
            }
        }
    }

    /// Close the link; idempotent
    pub async fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            info!("Closing data link with {}", handle.peer);
            handle.connection.close().await;
            self.state = LinkState::Closed;
        }
    }
}

impl Default for DataLinkChannel {
    fn default() -> Self {
        Self::new()
    }
}
