//! Bridges between session media tracks and WebRTC tracks

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Result, SessionError};
use crate::media::{MediaSample, MediaTrack, TrackKind};

/// Video codec type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodecType {
    H264,
    VP8,
}

impl VideoCodecType {
    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodecType::H264 => "video/H264",
            VideoCodecType::VP8 => "video/VP8",
        }
    }

    pub fn sdp_fmtp(&self) -> &'static str {
        match self {
            VideoCodecType::H264 => {
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
            }
            VideoCodecType::VP8 => "",
        }
    }
}

/// Create RTP codec capability for video
pub fn video_codec_capability(codec: VideoCodecType) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: codec.mime_type().to_string(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: codec.sdp_fmtp().to_string(),
        rtcp_feedback: vec![],
    }
}

/// Create RTP codec capability for audio (Opus)
pub fn audio_codec_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

/// Codec capability for the samples a track carries
pub fn codec_capability(mime_type: &str) -> Result<RTCRtpCodecCapability> {
    match mime_type.to_ascii_lowercase().as_str() {
        "video/h264" => Ok(video_codec_capability(VideoCodecType::H264)),
        "video/vp8" => Ok(video_codec_capability(VideoCodecType::VP8)),
        "audio/opus" => Ok(audio_codec_capability()),
        other => Err(SessionError::Unsupported(format!(
            "Unsupported codec: {}",
            other
        ))),
    }
}

/// A local track published on a peer connection
///
/// Copies every sample of the source track into a `TrackLocalStaticSample`
/// until the source stops or the bridge is dropped. The local track is kept
/// for the life of the bridge; only its source changes.
pub struct TrackBridge {
    kind: TrackKind,
    mime_type: String,
    local: Arc<TrackLocalStaticSample>,
    source_id: Option<String>,
    pump: Option<JoinHandle<()>>,
}

impl TrackBridge {
    pub fn new(track: &MediaTrack, stream_id: &str) -> Result<Self> {
        let capability = codec_capability(track.mime_type())?;
        let mime_type = capability.mime_type.clone();
        let local = Arc::new(TrackLocalStaticSample::new(
            capability,
            track.id().to_string(),
            stream_id.to_string(),
        ));

        let mut bridge = Self {
            kind: track.kind(),
            mime_type,
            local,
            source_id: None,
            pump: None,
        };
        bridge.retarget(Some(track))?;
        Ok(bridge)
    }

    /// Media kind of the local track
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Id of the session track feeding this bridge, if any
    pub fn source_id(&self) -> Option<&str> {
        self.source_id.as_deref()
    }

    pub fn local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.local.clone()
    }

    /// Feed the local track from `track`, or from nothing
    ///
    /// The new source must carry the codec the local track was created
    /// with.
    pub fn retarget(&mut self, track: Option<&MediaTrack>) -> Result<()> {
        if let Some(track) = track {
            if track.kind() != self.kind || !track.mime_type().eq_ignore_ascii_case(&self.mime_type)
            {
                return Err(SessionError::Unsupported(format!(
                    "Cannot feed {} {} sender from {} track",
                    self.mime_type,
                    self.kind,
                    track.mime_type()
                )));
            }
        }

        self.stop();
        if let Some(track) = track {
            self.source_id = Some(track.id().to_string());
            self.pump = Some(tokio::spawn(pump_samples(track.clone(), self.local.clone())));
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.source_id = None;
    }
}

impl Drop for TrackBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn pump_samples(track: MediaTrack, local: Arc<TrackLocalStaticSample>) {
    let mut samples = track.subscribe();
    debug!("Publishing {} track {}", track.kind(), track.label());

    loop {
        tokio::select! {
            result = samples.recv() => match result {
                Ok(sample) => {
                    let sample = Sample {
                        data: sample.data,
                        duration: sample.duration,
                        ..Default::default()
                    };
                    if let Err(e) = local.write_sample(&sample).await {
                        debug!("Failed to write sample: {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("{} track lagged by {} samples", track.kind(), n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = track.ended() => break,
        }
    }

    debug!("Stopped publishing {} track {}", track.kind(), track.label());
}

/// Expose a remote WebRTC track as a session track
///
/// Received RTP payloads are pushed as samples; the track ends from its
/// source when the remote stops sending.
pub fn receive_remote_track(remote: Arc<TrackRemote>) -> MediaTrack {
    let kind = match remote.kind() {
        RTPCodecType::Audio => TrackKind::Audio,
        _ => TrackKind::Video,
    };
    let mime_type = remote.codec().capability.mime_type;
    let track = MediaTrack::new(kind, remote.id(), mime_type);
    info!("Receiving remote {} track {}", kind, track.label());

    let sink = track.clone();
    tokio::spawn(async move {
        loop {
            match remote.read_rtp().await {
                Ok((packet, _)) => {
                    if !sink.is_live() {
                        break;
                    }
                    sink.push_sample(MediaSample::new(packet.payload, Duration::ZERO));
                }
                Err(e) => {
                    debug!("Remote {} track ended: {}", sink.kind(), e);
                    sink.end_from_source();
                    break;
                }
            }
        }
    });

    track
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_codec_capability_by_mime() {
        let h264 = codec_capability("video/H264").unwrap();
        assert_eq!(h264.clock_rate, 90000);
        assert!(h264.sdp_fmtp_line.contains("packetization-mode=1"));

        let opus = codec_capability("audio/opus").unwrap();
        assert_eq!(opus.channels, 2);
        assert_eq!(opus.clock_rate, 48000);

        assert!(codec_capability("video/vp8").is_ok());
        assert!(matches!(
            codec_capability("video/AV1"),
            Err(SessionError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_bridge_follows_source() {
        let track = MediaTrack::new(TrackKind::Video, "camera", "video/H264");
        let bridge = TrackBridge::new(&track, "stream").unwrap();
        assert_eq!(bridge.kind(), TrackKind::Video);
        assert_eq!(bridge.source_id(), Some(track.id()));
        assert_eq!(bridge.local().kind(), RTPCodecType::Video);

        // Unbound local tracks accept and discard samples
        track.push_sample(MediaSample::new(
            Bytes::from_static(&[0, 0, 0, 1]),
            Duration::from_millis(33),
        ));
        track.stop();
        let pump = bridge.pump.as_ref().unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !pump.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_retarget_keeps_local_track() {
        let camera = MediaTrack::new(TrackKind::Video, "camera", "video/H264");
        let screen = MediaTrack::new(TrackKind::Video, "screen", "video/h264");
        let mut bridge = TrackBridge::new(&camera, "stream").unwrap();
        let local = bridge.local();

        bridge.retarget(None).unwrap();
        assert_eq!(bridge.source_id(), None);
        assert!(bridge.pump.is_none());

        bridge.retarget(Some(&screen)).unwrap();
        assert_eq!(bridge.source_id(), Some(screen.id()));
        assert!(Arc::ptr_eq(&local, &bridge.local()));

        let vp8 = MediaTrack::new(TrackKind::Video, "other", "video/VP8");
        let mic = MediaTrack::new(TrackKind::Audio, "mic", "audio/opus");
        assert!(matches!(
            bridge.retarget(Some(&vp8)),
            Err(SessionError::Unsupported(_))
        ));
        assert!(bridge.retarget(Some(&mic)).is_err());
        assert_eq!(bridge.source_id(), Some(screen.id()));
    }

    #[test]
    fn test_unsupported_track_rejected() {
        let track = MediaTrack::new(TrackKind::Video, "raw", "video/raw");
        tokio_test::block_on(async {
            assert!(TrackBridge::new(&track, "stream").is_err());
        });
    }
}
