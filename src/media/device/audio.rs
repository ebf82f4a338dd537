//! ALSA microphone capture with Opus encoding

use std::io;
use std::time::Duration;

use alsa::pcm::{Access, Format, HwParams, State, IO};
use alsa::{Direction, ValueOr, PCM};
use audiopus::coder::Encoder;
use audiopus::{Application, Bitrate, Channels, SampleRate};
use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::media::{MediaSample, MediaTrack, TrackKind};

const SAMPLE_RATE: u32 = 48_000;
const CHANNELS: u32 = 2;
/// 20ms Opus frames
const FRAME_SAMPLES_PER_CHANNEL: usize = (SAMPLE_RATE / 50) as usize;
const FRAME_SAMPLES: usize = FRAME_SAMPLES_PER_CHANNEL * CHANNELS as usize;
const FRAME_DURATION: Duration = Duration::from_millis(20);
const MAX_OPUS_FRAME: usize = 4000;
/// Linux EPIPE; signals an overrun on read
const EPIPE: i32 = 32;

fn classify_alsa_error(what: &str, e: alsa::Error) -> SessionError {
    let io = io::Error::from_raw_os_error(e.errno());
    super::video::classify_io_error(what, &io)
}

fn open_pcm(device: &str) -> Result<PCM> {
    let pcm = PCM::new(device, Direction::Capture, false)
        .map_err(|e| classify_alsa_error(device, e))?;

    {
        let hwp = HwParams::any(&pcm).map_err(|e| classify_alsa_error(device, e))?;
        hwp.set_channels(CHANNELS)
            .and_then(|_| hwp.set_rate(SAMPLE_RATE, ValueOr::Nearest))
            .and_then(|_| hwp.set_format(Format::s16()))
            .and_then(|_| hwp.set_access(Access::RWInterleaved))
            .and_then(|_| {
                hwp.set_period_size_near(FRAME_SAMPLES_PER_CHANNEL as alsa::pcm::Frames, ValueOr::Nearest)
            })
            .map_err(|e| classify_alsa_error(device, e))?;
        pcm.hw_params(&hwp)
            .map_err(|e| classify_alsa_error(device, e))?;
    }

    pcm.prepare().map_err(|e| classify_alsa_error(device, e))?;
    Ok(pcm)
}

fn new_encoder(bitrate: i32) -> Result<Encoder> {
    let mut encoder = Encoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Voip)
        .map_err(|e| SessionError::DeviceUnavailable(format!("Opus encoder: {:?}", e)))?;
    encoder
        .set_bitrate(Bitrate::BitsPerSecond(bitrate))
        .map_err(|e| SessionError::DeviceUnavailable(format!("Opus bitrate: {:?}", e)))?;
    Ok(encoder)
}

fn run_capture(pcm: PCM, mut encoder: Encoder, track: &MediaTrack) {
    let mut read_buf = vec![0i16; FRAME_SAMPLES];
    let mut pending: Vec<i16> = Vec::with_capacity(FRAME_SAMPLES * 2);
    let mut opus_buf = vec![0u8; MAX_OPUS_FRAME];

    while track.is_live() {
        match pcm.state() {
            State::XRun => {
                warn!("Audio buffer overrun, recovering");
                let _ = pcm.prepare();
                continue;
            }
            State::Suspended => {
                let _ = pcm.resume();
                continue;
            }
            State::Disconnected => {
                warn!("Audio device disconnected");
                track.end_from_source();
                break;
            }
            _ => {}
        }

        let io: IO<u8> = pcm.io_bytes();
        let frames = match io.readi(bytemuck::cast_slice_mut(&mut read_buf)) {
            Ok(frames) => frames,
            Err(e) if e.errno() == EPIPE => {
                let _ = pcm.prepare();
                continue;
            }
            Err(e) => {
                warn!("Audio read error: {}", e);
                track.end_from_source();
                break;
            }
        };

        pending.extend_from_slice(&read_buf[..frames * CHANNELS as usize]);
        while pending.len() >= FRAME_SAMPLES {
            match encoder.encode(&pending[..FRAME_SAMPLES], &mut opus_buf) {
                Ok(len) => {
                    track.push_sample(MediaSample::new(
                        Bytes::copy_from_slice(&opus_buf[..len]),
                        FRAME_DURATION,
                    ));
                }
                Err(e) => debug!("Opus encode failed: {:?}", e),
            }
            pending.drain(..FRAME_SAMPLES);
        }
    }

    debug!("Microphone capture loop exited");
}

/// Open the ALSA capture device and start pumping Opus frames into a new track
pub(super) async fn open_microphone(device: String, bitrate: i32) -> Result<MediaTrack> {
    let track = MediaTrack::new(TrackKind::Audio, format!("microphone ({})", device), "audio/opus");
    let (ready_tx, ready_rx) = oneshot::channel();

    let pump_track = track.clone();
    tokio::task::spawn_blocking(move || {
        let opened = open_pcm(&device).and_then(|pcm| Ok((pcm, new_encoder(bitrate)?)));
        let (pcm, encoder) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };
        info!("Microphone {} capturing {}Hz {}ch", device, SAMPLE_RATE, CHANNELS);
        let _ = ready_tx.send(Ok(()));
        run_capture(pcm, encoder, &pump_track);
    });

    ready_rx
        .await
        .map_err(|_| SessionError::Internal("microphone thread exited".to_string()))??;
    Ok(track)
}
