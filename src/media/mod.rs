//! Local media capture
//!
//! The session never touches camera or microphone hardware directly; it goes
//! through a [`MediaAcquirer`], which lets tests substitute a fake.

pub mod device;
pub mod profile;
pub mod track;

pub use device::DeviceAcquirer;
pub use profile::{CaptureProfile, FrameRate, LensFacing, QualityTier, Resolution};
pub use track::{MediaSample, MediaStream, MediaTrack, TrackKind, TrackState};

use async_trait::async_trait;

use crate::error::Result;

/// Source of local captures
///
/// Implementations must not hold on to a stream after `release`; the
/// session calls it before (or right after) acquiring a replacement so that
/// at most one capture holds the hardware.
#[async_trait]
pub trait MediaAcquirer: Send + Sync + 'static {
    /// Acquire one audio + video camera capture matching `profile`
    ///
    /// Fails with `PermissionDenied` or `DeviceUnavailable`.
    async fn acquire(&self, profile: &CaptureProfile) -> Result<MediaStream>;

    /// Acquire a screen/window capture (video only)
    ///
    /// The video track moves to [`TrackState::SourceEnded`] when the user
    /// stops sharing; that is the end-of-capture signal. Fails with
    /// `Unsupported` where display capture is not available.
    async fn acquire_display(&self, profile: &CaptureProfile) -> Result<MediaStream>;

    /// Stop every track of a previously acquired stream
    fn release(&self, stream: &MediaStream) {
        stream.stop_all();
    }
}
