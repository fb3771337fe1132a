//! Capture device access

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};
use webrtc::media::Sample;

use super::track::{LocalStream, LocalTrack, TrackKind};
use crate::config::CaptureRequest;
use crate::{Error, Result};

/// Source of local capture streams
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire a stream with every kind in `request`
    ///
    /// No partial fallback: either every requested kind is captured or the
    /// call fails with [`Error::CaptureError`].
    async fn get_user_media(&self, request: &CaptureRequest) -> Result<LocalStream>;
}

/// Single Opus frame encoding 20ms of silence
const OPUS_SILENCE: [u8; 3] = [0xF8, 0xFF, 0xFE];

/// Devices that synthesise media instead of opening hardware
///
/// Audio tracks are fed Opus silence until stopped; video tracks stay idle.
#[derive(Debug, Clone)]
pub struct SyntheticDevices {
    frame_interval: Duration,
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(20),
        }
    }
}

impl SyntheticDevices {
    /// Create synthetic devices with the default 20ms audio frame interval
    pub fn new() -> Self {
        Self::default()
    }

    fn spawn_silence(&self, track: LocalTrack) {
        let interval = self.frame_interval;
        tokio::spawn(async move {
            let sample = Sample {
                data: Bytes::from_static(&OPUS_SILENCE),
                duration: interval,
                ..Default::default()
            };
            let mut ticker = tokio::time::interval(interval);
            while track.is_live() {
                ticker.tick().await;
                if let Err(e) = track.write_sample(&sample).await {
                    debug!(track_id = track.id(), "Silence writer stopped: {}", e);
                    break;
                }
            }
            debug!(track_id = track.id(), "Synthetic audio track ended");
        });
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(&self, request: &CaptureRequest) -> Result<LocalStream> {
        if !request.audio && !request.video {
            return Err(Error::CaptureError(
                "capture request names no media kind".to_string(),
            ));
        }

        let stream = LocalStream::capture(request);
        for track in stream.tracks_of(TrackKind::Audio) {
            self.spawn_silence(track.clone());
        }

        info!(stream_id = stream.id(), "Synthetic capture stream opened");
        Ok(stream)
    }
}
