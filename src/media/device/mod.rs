//! Hardware-backed media acquirer (V4L2 camera + ALSA microphone)

mod audio;
mod video;

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{CaptureProfile, LensFacing, MediaAcquirer, MediaStream};
use crate::config::CaptureConfig;
use crate::error::{Result, SessionError};

/// Acquires captures from local Linux devices
pub struct DeviceAcquirer {
    config: CaptureConfig,
}

impl DeviceAcquirer {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config }
    }

    fn camera_path(&self, facing: LensFacing) -> PathBuf {
        match facing {
            LensFacing::Front => PathBuf::from(&self.config.front_device),
            LensFacing::Back => PathBuf::from(&self.config.back_device),
        }
    }
}

#[async_trait]
impl MediaAcquirer for DeviceAcquirer {
    async fn acquire(&self, profile: &CaptureProfile) -> Result<MediaStream> {
        let path = self.camera_path(profile.facing);
        debug!("Acquiring {} camera at {}", profile.facing, path.display());

        let video = video::open_camera(path, *profile).await?;
        let audio = match audio::open_microphone(
            self.config.audio_device.clone(),
            self.config.audio_bitrate,
        )
        .await
        {
            Ok(track) => track,
            Err(e) => {
                video.stop();
                return Err(e);
            }
        };

        info!(
            "Capture acquired: {} @ {} ({} camera)",
            profile.resolution(),
            profile.frame_rate().ideal,
            profile.facing
        );
        Ok(MediaStream::new(vec![audio, video]))
    }

    async fn acquire_display(&self, _profile: &CaptureProfile) -> Result<MediaStream> {
        Err(SessionError::Unsupported(
            "Screen sharing not supported".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_display_capture_unsupported() {
        let acquirer = DeviceAcquirer::new(CaptureConfig::default());
        let err = acquirer
            .acquire_display(&CaptureProfile::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Screen sharing not supported");
    }

    #[test]
    fn test_camera_path_follows_facing() {
        let acquirer = DeviceAcquirer::new(CaptureConfig::default());
        assert_eq!(acquirer.camera_path(LensFacing::Back), PathBuf::from("/dev/video0"));
        assert_eq!(acquirer.camera_path(LensFacing::Front), PathBuf::from("/dev/video1"));
    }

    #[tokio::test]
    async fn test_missing_camera_is_unavailable() {
        let config = CaptureConfig {
            back_device: "/nonexistent/video9".to_string(),
            ..Default::default()
        };
        let acquirer = DeviceAcquirer::new(config);
        let err = acquirer.acquire(&CaptureProfile::default()).await.unwrap_err();
        assert!(matches!(err, SessionError::DeviceUnavailable(_)));
    }
}
