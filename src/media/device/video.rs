//! V4L2 camera capture
//!
//! Cameras are opened in H.264 mode so frames can be forwarded without a
//! software encoder. The capture loop runs on a blocking thread and exits as
//! soon as its track is stopped, which closes the device.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::framesize::FrameSizeEnum;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Format, FourCC};

use crate::error::{Result, SessionError};
use crate::media::{CaptureProfile, MediaSample, MediaTrack, Resolution, TrackKind};

const H264_FOURCC: &[u8; 4] = b"H264";
const BUFFER_COUNT: u32 = 4;

/// Classify a device open/configure failure
pub(super) fn classify_io_error(what: &str, e: &io::Error) -> SessionError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => {
            SessionError::PermissionDenied(format!("{}: {}", what, e))
        }
        _ => SessionError::DeviceUnavailable(format!("{}: {}", what, e)),
    }
}

/// Largest candidate within `ceiling`, or the smallest one if none fits
pub(super) fn pick_frame_size(candidates: &[Resolution], ceiling: Resolution) -> Option<Resolution> {
    candidates
        .iter()
        .filter(|r| r.fits_within(ceiling))
        .max_by_key(|r| r.pixels())
        .or_else(|| candidates.iter().min_by_key(|r| r.pixels()))
        .copied()
}

/// Opened and configured camera
struct Camera {
    device: Device,
    resolution: Resolution,
    fps: u32,
}

fn frame_sizes(device: &Device, fourcc: FourCC, ceiling: Resolution) -> Vec<Resolution> {
    let sizes = match device.enum_framesizes(fourcc) {
        Ok(sizes) => sizes,
        Err(e) => {
            debug!("Failed to enumerate frame sizes: {}", e);
            return vec![ceiling];
        }
    };

    let mut out = Vec::new();
    for size in sizes {
        match size.size {
            FrameSizeEnum::Discrete(d) => out.push(Resolution::new(d.width, d.height)),
            FrameSizeEnum::Stepwise(s) => {
                out.push(Resolution::new(
                    ceiling.width.clamp(s.min_width, s.max_width),
                    ceiling.height.clamp(s.min_height, s.max_height),
                ));
            }
        }
    }
    out
}

fn open_camera_blocking(path: &Path, profile: &CaptureProfile) -> Result<Camera> {
    let what = path.display().to_string();
    let device = Device::with_path(path).map_err(|e| classify_io_error(&what, &e))?;

    let fourcc = FourCC::new(H264_FOURCC);
    let formats = device
        .enum_formats()
        .map_err(|e| classify_io_error(&what, &e))?;
    if !formats.iter().any(|f| f.fourcc == fourcc) {
        return Err(SessionError::DeviceUnavailable(format!(
            "{} does not provide H.264 output",
            what
        )));
    }

    let ceiling = profile.resolution();
    let resolution = pick_frame_size(&frame_sizes(&device, fourcc, ceiling), ceiling)
        .ok_or_else(|| SessionError::DeviceUnavailable(format!("{} reports no frame sizes", what)))?;

    let applied = device
        .set_format(&Format::new(resolution.width, resolution.height, fourcc))
        .map_err(|e| classify_io_error(&what, &e))?;
    if applied.fourcc != fourcc {
        return Err(SessionError::DeviceUnavailable(format!(
            "{} refused H.264 output",
            what
        )));
    }

    let rate = profile.frame_rate();
    let fps = match device.set_params(&Parameters::with_fps(rate.ideal)) {
        Ok(params) if params.interval.numerator > 0 => {
            (params.interval.denominator / params.interval.numerator).clamp(1, rate.max)
        }
        Ok(_) => rate.ideal,
        Err(e) => {
            warn!("Failed to set frame rate on {}: {}", what, e);
            rate.ideal
        }
    };

    Ok(Camera {
        device,
        resolution: Resolution::new(applied.width, applied.height),
        fps,
    })
}

fn run_capture(camera: Camera, track: &MediaTrack) {
    let frame_duration = Duration::from_secs(1) / camera.fps;
    let mut stream = match Stream::with_buffers(&camera.device, Type::VideoCapture, BUFFER_COUNT) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Failed to start camera stream: {}", e);
            track.end_from_source();
            return;
        }
    };

    while track.is_live() {
        match stream.next() {
            Ok((buf, meta)) => {
                let used = (meta.bytesused as usize).min(buf.len());
                if used == 0 {
                    continue;
                }
                track.push_sample(MediaSample::new(
                    Bytes::copy_from_slice(&buf[..used]),
                    frame_duration,
                ));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Camera capture failed: {}", e);
                track.end_from_source();
                break;
            }
        }
    }

    debug!("Camera capture loop exited");
}

/// Open the camera at `path` and start pumping frames into a new track
pub(super) async fn open_camera(path: PathBuf, profile: CaptureProfile) -> Result<MediaTrack> {
    let label = format!("{} camera ({})", profile.facing, path.display());
    let track = MediaTrack::new(TrackKind::Video, label, "video/H264");
    let (ready_tx, ready_rx) = oneshot::channel();

    let pump_track = track.clone();
    tokio::task::spawn_blocking(move || {
        let camera = match open_camera_blocking(&path, &profile) {
            Ok(camera) => camera,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };
        info!(
            "Camera {} capturing {} @ {}fps",
            path.display(),
            camera.resolution,
            camera.fps
        );
        let _ = ready_tx.send(Ok(()));
        run_capture(camera, &pump_track);
    });

    ready_rx
        .await
        .map_err(|_| SessionError::Internal("camera thread exited".to_string()))??;
    Ok(track)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_frame_size_within_ceiling() {
        let sizes = [
            Resolution::new(640, 480),
            Resolution::new(1280, 720),
            Resolution::new(1920, 1080),
        ];
        assert_eq!(
            pick_frame_size(&sizes, Resolution::new(1280, 720)),
            Some(Resolution::new(1280, 720))
        );
        assert_eq!(
            pick_frame_size(&sizes, Resolution::new(640, 480)),
            Some(Resolution::new(640, 480))
        );
    }

    #[test]
    fn test_pick_frame_size_falls_back_to_smallest() {
        let sizes = [Resolution::new(3840, 2160), Resolution::new(1920, 1080)];
        assert_eq!(
            pick_frame_size(&sizes, Resolution::new(640, 360)),
            Some(Resolution::new(1920, 1080))
        );
        assert_eq!(pick_frame_size(&[], Resolution::new(640, 360)), None);
    }

    #[test]
    fn test_classify_io_error() {
        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(matches!(
            classify_io_error("/dev/video0", &denied),
            SessionError::PermissionDenied(_)
        ));

        let missing = io::Error::from(io::ErrorKind::NotFound);
        assert!(matches!(
            classify_io_error("/dev/video0", &missing),
            SessionError::DeviceUnavailable(_)
        ));
    }
}
