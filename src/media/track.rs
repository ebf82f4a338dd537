//! Media tracks and streams
//!
//! A track is a shared handle: the producer (a capture pump, a renderer)
//! pushes encoded samples into it and any number of consumers (transport
//! bridges) subscribe. Stopping a track is what releases the producer.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

/// Sample channel capacity per track
const SAMPLE_CHANNEL_CAPACITY: usize = 64;

/// Track media kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Track lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    Live,
    /// Stopped by the application
    Stopped,
    /// Ended by the source itself (user stopped sharing, device unplugged)
    SourceEnded,
}

/// One encoded media sample
#[derive(Debug, Clone)]
pub struct MediaSample {
    pub data: Bytes,
    pub duration: Duration,
}

impl MediaSample {
    pub fn new(data: Bytes, duration: Duration) -> Self {
        Self { data, duration }
    }
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    mime_type: String,
    enabled: AtomicBool,
    state: watch::Sender<TrackState>,
    samples: broadcast::Sender<MediaSample>,
}

/// Shared media track handle
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    /// Create a live track
    ///
    /// `mime_type` names the codec of the samples pushed into it
    /// (e.g. `video/H264`, `audio/opus`).
    pub fn new(kind: TrackKind, label: impl Into<String>, mime_type: impl Into<String>) -> Self {
        let (state, _) = watch::channel(TrackState::Live);
        let (samples, _) = broadcast::channel(SAMPLE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(TrackInner {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                label: label.into(),
                mime_type: mime_type.into(),
                enabled: AtomicBool::new(true),
                state,
                samples,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn mime_type(&self) -> &str {
        &self.inner.mime_type
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Enable or disable the track in place
    ///
    /// A disabled track stays live but drops every pushed sample.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    pub fn state(&self) -> TrackState {
        *self.inner.state.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.state() == TrackState::Live
    }

    pub fn state_watch(&self) -> watch::Receiver<TrackState> {
        self.inner.state.subscribe()
    }

    /// Stop the track; idempotent
    pub fn stop(&self) {
        self.finish(TrackState::Stopped);
    }

    /// Mark the track as ended by its source; idempotent
    pub fn end_from_source(&self) {
        self.finish(TrackState::SourceEnded);
    }

    fn finish(&self, state: TrackState) {
        self.inner.state.send_if_modified(|current| {
            if *current == TrackState::Live {
                *current = state;
                true
            } else {
                false
            }
        });
    }

    /// Wait until the track leaves `Live` and return the final state
    pub async fn ended(&self) -> TrackState {
        let mut rx = self.state_watch();
        let ended = rx.wait_for(|s| *s != TrackState::Live).await.map(|s| *s);
        // Sender lives in `inner`, which `self` keeps alive
        ended.unwrap_or_else(|_| self.state())
    }

    /// Push one sample to the consumers
    ///
    /// Returns `false` if the sample was dropped (track disabled or no
    /// longer live).
    pub fn push_sample(&self, sample: MediaSample) -> bool {
        if !self.is_live() || !self.is_enabled() {
            return false;
        }
        let _ = self.inner.samples.send(sample);
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediaSample> {
        self.inner.samples.subscribe()
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for MediaTrack {}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("enabled", &self.is_enabled())
            .field("state", &self.state())
            .finish()
    }
}

/// Ordered set of tracks captured or received together
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), tracks)
    }

    pub fn with_id(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn add_track(&mut self, track: MediaTrack) {
        self.tracks.push(track);
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks_of(TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks_of(TrackKind::Video)
    }

    /// First track of `kind`
    pub fn track(&self, kind: TrackKind) -> Option<&MediaTrack> {
        self.tracks_of(kind).next()
    }

    pub fn has_live_tracks(&self) -> bool {
        self.tracks.iter().any(|t| t.is_live())
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn stop_kind(&self, kind: TrackKind) {
        for track in self.tracks_of(kind) {
            track.stop();
        }
    }

    /// Enable or disable every track of `kind`
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks_of(kind) {
            track.set_enabled(enabled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MediaSample {
        MediaSample::new(Bytes::from_static(b"frame"), Duration::from_millis(33))
    }

    #[tokio::test]
    async fn test_push_and_subscribe() {
        let track = MediaTrack::new(TrackKind::Video, "cam", "video/H264");
        let mut rx = track.subscribe();

        assert!(track.push_sample(sample()));
        assert_eq!(rx.recv().await.unwrap().data, Bytes::from_static(b"frame"));
    }

    #[test]
    fn test_disabled_track_drops_samples() {
        let track = MediaTrack::new(TrackKind::Audio, "mic", "audio/opus");
        let mut rx = track.subscribe();

        track.set_enabled(false);
        assert!(!track.push_sample(sample()));
        assert!(rx.try_recv().is_err());
        assert!(track.is_live());
    }

    #[test]
    fn test_stop_is_final() {
        let track = MediaTrack::new(TrackKind::Video, "screen", "video/H264");
        track.stop();
        track.end_from_source();
        assert_eq!(track.state(), TrackState::Stopped);
        assert!(!track.push_sample(sample()));
    }

    #[tokio::test]
    async fn test_ended_reports_source_end() {
        let track = MediaTrack::new(TrackKind::Video, "screen", "video/H264");
        let waiter = {
            let track = track.clone();
            tokio::spawn(async move { track.ended().await })
        };

        track.end_from_source();
        assert_eq!(waiter.await.unwrap(), TrackState::SourceEnded);
    }

    #[test]
    fn test_stream_helpers() {
        let audio = MediaTrack::new(TrackKind::Audio, "mic", "audio/opus");
        let video = MediaTrack::new(TrackKind::Video, "cam", "video/H264");
        let stream = MediaStream::new(vec![audio.clone(), video.clone()]);

        assert_eq!(stream.track(TrackKind::Video), Some(&video));
        assert_eq!(stream.audio_tracks().count(), 1);

        stream.set_enabled(TrackKind::Audio, false);
        assert!(!audio.is_enabled());
        assert!(video.is_enabled());

        stream.stop_kind(TrackKind::Video);
        assert!(!video.is_live());
        assert!(stream.has_live_tracks());

        stream.stop_all();
        assert!(!stream.has_live_tracks());
    }
}
