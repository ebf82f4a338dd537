//! Transport ports
//!
//! The session talks to the rendezvous service, the media call and the data
//! link only through these traits. Every asynchronous notification arrives
//! as a typed event on a channel owned by the session, never as a callback
//! that mutates session state directly.

pub mod peer;
pub mod rendezvous;
pub mod signaling;
pub mod track;

pub use rendezvous::WsRendezvous;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{Result, SessionError};
use crate::identity::EndpointId;
use crate::media::{MediaStream, MediaTrack, TrackKind};

/// Notification from the rendezvous service
pub enum RendezvousEvent {
    /// Registered under our identifier; ready to call and be called
    Open,
    /// Counterpart is calling us
    IncomingCall(Box<dyn IncomingCall>),
    /// Counterpart opened a data link to us
    IncomingLink(Box<dyn DataConnection>),
    /// Lost the service; established calls and links stay up
    Disconnected,
    /// Service connection closed for good
    Closed,
    Error(SessionError),
}

impl std::fmt::Debug for RendezvousEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::IncomingCall(call) => write!(f, "IncomingCall({})", call.peer()),
            Self::IncomingLink(link) => write!(f, "IncomingLink({})", link.peer()),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Closed => write!(f, "Closed"),
            Self::Error(e) => write!(f, "Error({})", e),
        }
    }
}

/// Connection to the rendezvous service
#[async_trait]
pub trait Rendezvous: Send + Sync + 'static {
    /// Register under `own` and return the event channel
    ///
    /// `Open` is delivered on the channel once registration completes. The
    /// same channel keeps receiving events across `reconnect`.
    async fn connect(&self, own: &EndpointId) -> Result<mpsc::UnboundedReceiver<RendezvousEvent>>;

    /// Re-register under the same identifier after `Disconnected`
    async fn reconnect(&self) -> Result<()>;

    /// Place a media call carrying `stream`
    async fn call(&self, target: &EndpointId, stream: &MediaStream)
        -> Result<Box<dyn MediaConnection>>;

    /// Open a reliable, ordered data link
    async fn open_link(&self, target: &EndpointId) -> Result<Box<dyn DataConnection>>;

    /// Leave the service and stop all background work
    async fn destroy(&self);
}

/// Inbound call waiting to be answered
#[async_trait]
pub trait IncomingCall: Send + Sync {
    fn peer(&self) -> &EndpointId;

    async fn answer(self: Box<Self>, stream: &MediaStream) -> Result<Box<dyn MediaConnection>>;

    async fn reject(self: Box<Self>);
}

/// Media call notification
#[derive(Debug)]
pub enum CallEvent {
    /// Remote media arrived; the call is live
    RemoteStream(MediaStream),
    Closed,
    Error(SessionError),
}

/// One negotiated media call
#[async_trait]
pub trait MediaConnection: Send + Sync {
    fn peer(&self) -> &EndpointId;

    /// Event channel; can be taken once
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<CallEvent>>;

    /// Outbound track senders of the negotiation
    fn senders(&self) -> Vec<Arc<dyn OutboundSender>>;

    async fn close(&self);
}

/// Outbound sender on a live negotiation
#[async_trait]
pub trait OutboundSender: Send + Sync {
    /// Kind of the track currently attached, `None` if the slot is empty
    async fn track_kind(&self) -> Option<TrackKind>;

    /// Media kind the sender was negotiated for, when known
    fn lane(&self) -> Option<TrackKind>;

    /// Swap the attached track in place, without renegotiation
    async fn replace_track(&self, track: Option<MediaTrack>) -> Result<()>;
}

/// What a sender lookup knows about one sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderInfo {
    pub track: Option<TrackKind>,
    pub lane: Option<TrackKind>,
}

/// Pick the sender that should carry a new track of `kind`
///
/// Tried in order:
/// 1. a sender whose current track is of `kind`;
/// 2. an empty sender negotiated for `kind` (its track was stopped and
///    detached);
/// 3. the first sender not identified as the other kind, by elimination.
pub fn select_sender(senders: &[SenderInfo], kind: TrackKind) -> Option<usize> {
    let other = match kind {
        TrackKind::Audio => TrackKind::Video,
        TrackKind::Video => TrackKind::Audio,
    };

    senders
        .iter()
        .position(|s| s.track == Some(kind))
        .or_else(|| {
            senders
                .iter()
                .position(|s| s.track.is_none() && s.lane == Some(kind))
        })
        .or_else(|| {
            senders
                .iter()
                .position(|s| s.track != Some(other) && s.lane != Some(other))
        })
}

/// Data link notification
#[derive(Debug)]
pub enum LinkEvent {
    Open,
    Data(Bytes),
    Closed,
    Error(SessionError),
}

/// One reliable, ordered data link
#[async_trait]
pub trait DataConnection: Send + Sync {
    fn peer(&self) -> &EndpointId;

    fn is_open(&self) -> bool;

    /// Event channel; can be taken once
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<LinkEvent>>;

    async fn send(&self, data: Bytes) -> Result<()>;

    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(track: Option<TrackKind>, lane: Option<TrackKind>) -> SenderInfo {
        SenderInfo { track, lane }
    }

    #[test]
    fn test_select_by_current_track() {
        let senders = [
            info(Some(TrackKind::Audio), Some(TrackKind::Audio)),
            info(Some(TrackKind::Video), Some(TrackKind::Video)),
        ];
        assert_eq!(select_sender(&senders, TrackKind::Video), Some(1));
        assert_eq!(select_sender(&senders, TrackKind::Audio), Some(0));
    }

    #[test]
    fn test_select_empty_slot_of_right_lane() {
        let senders = [
            info(None, Some(TrackKind::Audio)),
            info(None, None),
            info(None, Some(TrackKind::Video)),
        ];
        assert_eq!(select_sender(&senders, TrackKind::Video), Some(2));
    }

    #[test]
    fn test_select_by_elimination() {
        let senders = [
            info(Some(TrackKind::Audio), None),
            info(None, Some(TrackKind::Audio)),
            info(None, None),
        ];
        assert_eq!(select_sender(&senders, TrackKind::Video), Some(2));
    }

    #[test]
    fn test_select_none_eligible() {
        let senders = [
            info(Some(TrackKind::Audio), Some(TrackKind::Audio)),
            info(None, Some(TrackKind::Audio)),
        ];
        assert_eq!(select_sender(&senders, TrackKind::Video), None);
        assert_eq!(select_sender(&[], TrackKind::Video), None);
    }
}
