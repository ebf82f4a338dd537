//! Media call channel
//!
//! Owns the single call of a session. Transitions:
//! `Idle -> Dialing -> Active -> Ended` for outgoing calls and
//! `Idle -> Ringing -> Active -> Ended` for answered ones.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::identity::EndpointId;
use crate::media::{MediaStream, MediaTrack, TrackKind};
use crate::transport::{
    select_sender, CallEvent, IncomingCall, MediaConnection, Rendezvous, SenderInfo,
};

/// Call lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Idle,
    Dialing,
    Ringing,
    Active,
    Ended,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallState::Idle => write!(f, "idle"),
            CallState::Dialing => write!(f, "dialing"),
            CallState::Ringing => write!(f, "ringing"),
            CallState::Active => write!(f, "active"),
            CallState::Ended => write!(f, "ended"),
        }
    }
}

/// The one live call
pub struct CallHandle {
    peer: EndpointId,
    connection: Box<dyn MediaConnection>,
    /// Tracks currently offered to the peer
    local: MediaStream,
    remote: Option<MediaStream>,
    generation: u64,
}

impl CallHandle {
    pub fn peer(&self) -> &EndpointId {
        &self.peer
    }

    pub fn local(&self) -> &MediaStream {
        &self.local
    }

    pub fn remote(&self) -> Option<&MediaStream> {
        self.remote.as_ref()
    }
}

/// A freshly created call: its generation and event channel
pub struct CallStarted {
    pub generation: u64,
    pub events: Option<mpsc::UnboundedReceiver<CallEvent>>,
}

/// Outcome of a call event, for the session to act on
#[derive(Debug)]
pub enum CallTransition {
    /// Remote media arrived
    Connected { peer: EndpointId, remote: MediaStream },
    Closed { peer: EndpointId },
    Failed { peer: EndpointId, error: SessionError },
}

pub struct CallChannel {
    state: CallState,
    handle: Option<CallHandle>,
    generation: u64,
}

impl CallChannel {
    pub fn new() -> Self {
        Self {
            state: CallState::Idle,
            handle: None,
            generation: 0,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn has_call(&self) -> bool {
        self.handle.is_some()
    }

    pub fn handle(&self) -> Option<&CallHandle> {
        self.handle.as_ref()
    }

    pub fn remote_stream(&self) -> Option<&MediaStream> {
        self.handle.as_ref().and_then(|h| h.remote())
    }

    /// An inbound call is waiting for local media
    pub fn mark_ringing(&mut self) {
        if self.handle.is_none() {
            self.state = CallState::Ringing;
        }
    }

    /// Place an outgoing call; `Idle -> Dialing`
    pub async fn start_call(
        &mut self,
        rendezvous: &dyn Rendezvous,
        target: &EndpointId,
        stream: MediaStream,
    ) -> Result<CallStarted> {
        if self.handle.is_some() {
            return Err(SessionError::Internal("a call is already in progress".to_string()));
        }

        info!("Calling {}", target);
        let connection = rendezvous.call(target, &stream).await?;
        self.state = CallState::Dialing;
        Ok(self.install(target.clone(), connection, stream))
    }

    /// Answer an inbound call; stays `Ringing` until remote media arrives
    pub async fn answer_call(
        &mut self,
        incoming: Box<dyn IncomingCall>,
        stream: MediaStream,
    ) -> Result<CallStarted> {
        if self.handle.is_some() {
            incoming.reject().await;
            return Err(SessionError::Internal("a call is already in progress".to_string()));
        }

        let peer = incoming.peer().clone();
        info!("Answering call from {}", peer);
        self.state = CallState::Ringing;
        match incoming.answer(&stream).await {
            Ok(connection) => Ok(self.install(peer, connection, stream)),
            Err(e) => {
                self.state = CallState::Ended;
                Err(e)
            }
        }
    }

    fn install(
        &mut self,
        peer: EndpointId,
        mut connection: Box<dyn MediaConnection>,
        local: MediaStream,
    ) -> CallStarted {
        self.generation += 1;
        let events = connection.take_events();
        self.handle = Some(CallHandle {
            peer,
            connection,
            local,
            remote: None,
            generation: self.generation,
        });
        CallStarted {
            generation: self.generation,
            events,
        }
    }

    /// Apply a transport event
    ///
    /// Events from a call that has since been replaced or ended are ignored.
    pub async fn on_event(&mut self, generation: u64, event: CallEvent) -> Option<CallTransition> {
        if self.handle.as_ref().map(|h| h.generation) != Some(generation) {
            debug!("Ignoring event from stale call generation {}", generation);
            return None;
        }

        match event {
            CallEvent::RemoteStream(remote) => {
                let handle = self.handle.as_mut()?;
                info!("Remote stream received from {}", handle.peer);
                handle.remote = Some(remote.clone());
                self.state = CallState::Active;
                Some(CallTransition::Connected {
                    peer: handle.peer.clone(),
                    remote,
                })
            }
            CallEvent::Closed => {
                let handle = self.clear()?;
                info!("Call with {} closed", handle.peer);
                handle.connection.close().await;
                Some(CallTransition::Closed { peer: handle.peer })
            }
            CallEvent::Error(error) => {
                let handle = self.clear()?;
                warn!("Call with {} failed: {}", handle.peer, error);
                handle.connection.close().await;
                Some(CallTransition::Failed {
                    peer: handle.peer,
                    error,
                })
            }
        }
    }

    /// Drop the handle and its track references; state becomes `Ended`
    fn clear(&mut self) -> Option<CallHandle> {
        let mut handle = self.handle.take()?;
        self.state = CallState::Ended;
        handle.remote = None;
        Some(handle)
    }

    /// Swap the outgoing track of `track.kind()` in place
    ///
    /// Returns `false`, leaving the call untouched, when there is no call or
    /// no eligible sender.
    pub async fn replace_outgoing(&mut self, track: &MediaTrack) -> bool {
        let Some(handle) = self.handle.as_mut() else {
            debug!("No call; nothing to replace");
            return false;
        };
        let kind = track.kind();

        let senders = handle.connection.senders();
        let mut infos = Vec::with_capacity(senders.len());
        for sender in &senders {
            infos.push(SenderInfo {
                track: sender.track_kind().await,
                lane: sender.lane(),
            });
        }

        let Some(index) = select_sender(&infos, kind) else {
            warn!("No {} sender on call with {}", kind, handle.peer);
            return false;
        };

        if let Err(e) = senders[index].replace_track(Some(track.clone())).await {
            warn!("Failed to replace {} track: {}", kind, e);
            return false;
        }

        let mut tracks: Vec<MediaTrack> = handle
            .local
            .tracks()
            .iter()
            .filter(|t| t.kind() != kind)
            .cloned()
            .collect();
        tracks.push(track.clone());
        handle.local = MediaStream::with_id(handle.local.id().to_string(), tracks);

        debug!("Replaced outgoing {} track with {}", kind, track.label());
        true
    }

    /// Swap the outgoing video track; `false` for non-video tracks
    pub async fn replace_outgoing_video(&mut self, track: &MediaTrack) -> bool {
        if track.kind() != TrackKind::Video {
            return false;
        }
        self.replace_outgoing(track).await
    }

    /// Enable or disable the outgoing audio in place
    pub fn set_muted(&self, muted: bool) {
        if let Some(handle) = &self.handle {
            handle.local.set_enabled(TrackKind::Audio, !muted);
        }
    }

    /// Stop local tracks and close the call; idempotent
    pub async fn end(&mut self) {
        if let Some(handle) = self.handle.take() {
            info!("Ending call with {}", handle.peer);
            handle.local.stop_all();
            handle.connection.close().await;
        }
        if self.state != CallState::Idle {
            self.state = CallState::Ended;
        }
    }

    /// Close the call but keep local tracks running
    ///
    /// Used when the call is discarded to be placed again with the same
    /// capture.
    pub async fn hang_up(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("Hanging up call with {}", handle.peer);
            handle.connection.close().await;
            self.state = CallState::Ended;
        }
    }
}

impl Default for CallChannel {
    fn default() -> Self {
        Self::new()
    }
}
