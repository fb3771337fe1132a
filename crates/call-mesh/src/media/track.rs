//! Local and remote media track types

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::CaptureRequest;
use crate::{Error, Result};

/// Kind of media a track carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrackKind {
    /// Microphone audio
    Audio,
    /// Camera video
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

impl TrackKind {
    fn codec(self) -> RTCRtpCodecCapability {
        match self {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        }
    }
}

/// Ready state of a local track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackReadyState {
    /// Producing media
    Live,
    /// Stopped; never produces media again
    Ended,
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    rtp: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    ended: AtomicBool,
}

/// One captured track
///
/// Cheap to clone; clones share enabled and ended state.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    /// Create a live, enabled track belonging to `stream_id`
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let id = format!("{}-{}", kind, uuid::Uuid::new_v4());
        let rtp = Arc::new(TrackLocalStaticSample::new(
            kind.codec(),
            id.clone(),
            stream_id.to_string(),
        ));
        Self {
            inner: Arc::new(TrackInner {
                id,
                kind,
                rtp,
                enabled: AtomicBool::new(true),
                ended: AtomicBool::new(false),
            }),
        }
    }

    /// Track id
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Track kind
    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    /// Whether media is currently being sent
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Mute or unmute without stopping
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    /// Current ready state
    pub fn ready_state(&self) -> TrackReadyState {
        if self.inner.ended.load(Ordering::Acquire) {
            TrackReadyState::Ended
        } else {
            TrackReadyState::Live
        }
    }

    /// Whether the track is still live
    pub fn is_live(&self) -> bool {
        self.ready_state() == TrackReadyState::Live
    }

    /// End the track; idempotent
    pub fn stop(&self) {
        self.inner.ended.store(true, Ordering::Release);
    }

    /// RTP track handed to peer connection senders
    pub fn rtp_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.inner.rtp) as Arc<dyn TrackLocal + Send + Sync>
    }

    /// Write one media sample
    ///
    /// Samples are discarded while the track is disabled or ended.
    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        if !self.is_enabled() || !self.is_live() {
            return Ok(());
        }
        self.inner
            .rtp
            .write_sample(sample)
            .await
            .map_err(|e| Error::MediaTrackError(format!("write on {} failed: {}", self.id(), e)))
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("enabled", &self.is_enabled())
            .field("ready_state", &self.ready_state())
            .finish()
    }
}

impl PartialEq for LocalTrack {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// The local capture stream
#[derive(Debug, Clone, PartialEq)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    /// Assemble a stream from tracks
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    /// Create a stream with fresh tracks for every requested kind
    pub fn capture(request: &CaptureRequest) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let mut tracks = Vec::new();
        if request.audio {
            tracks.push(LocalTrack::new(TrackKind::Audio, &id));
        }
        if request.video {
            tracks.push(LocalTrack::new(TrackKind::Video, &id));
        }
        Self { id, tracks }
    }

    /// Stream id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All tracks
    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    /// First track of `kind`
    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    /// Tracks of `kind`
    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    /// A stream is stale when a requested kind is missing or any track ended
    pub fn is_stale(&self, request: &CaptureRequest) -> bool {
        let missing = (request.audio && self.track(TrackKind::Audio).is_none())
            || (request.video && self.track(TrackKind::Video).is_none());
        missing || self.tracks.iter().any(|t| !t.is_live())
    }

    /// Stop every track
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// One track received from a remote participant
#[derive(Clone)]
pub struct RemoteTrack {
    /// Track id
    pub id: String,
    /// Media kind
    pub kind: TrackKind,
    /// Stream the track belongs to
    pub stream_id: String,
    /// Native handle, absent for non-RTP backends
    pub handle: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

/// Media received from one remote participant
#[derive(Debug, Clone)]
pub struct RemoteStream {
    /// Remote stream id
    pub stream_id: String,
    /// Tracks received so far
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    /// Start a stream from its first track
    pub fn from_track(track: RemoteTrack) -> Self {
        Self {
            stream_id: track.stream_id.clone(),
            tracks: vec![track],
        }
    }

    /// Whether any track has arrived
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Whether a track of `kind` has arrived
    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_creates_requested_kinds() {
        let stream = LocalStream::capture(&CaptureRequest::default());
        assert!(stream.track(TrackKind::Audio).is_some());
        assert!(stream.track(TrackKind::Video).is_some());
        assert!(!stream.is_stale(&CaptureRequest::default()));
    }

    #[test]
    fn test_stale_when_track_missing_or_ended() {
        let audio_only = LocalStream::capture(&CaptureRequest {
            audio: true,
            video: false,
        });
        assert!(audio_only.is_stale(&CaptureRequest::default()));

        let stream = LocalStream::capture(&CaptureRequest::default());
        stream.tracks()[1].stop();
        assert!(stream.is_stale(&CaptureRequest::default()));
    }

    #[test]
    fn test_clones_share_state() {
        let track = LocalTrack::new(TrackKind::Audio, "s1");
        let clone = track.clone();
        clone.set_enabled(false);
        clone.stop();
        assert!(!track.is_enabled());
        assert_eq!(track.ready_state(), TrackReadyState::Ended);
        assert_eq!(track, clone);
    }

    #[tokio::test]
    async fn test_write_ignored_when_disabled() {
        let track = LocalTrack::new(TrackKind::Audio, "s1");
        track.set_enabled(false);
        let sample = Sample {
            data: bytes::Bytes::from_static(&[0xF8, 0xFF, 0xFE]),
            duration: std::time::Duration::from_millis(20),
            ..Default::default()
        };
        assert!(track.write_sample(&sample).await.is_ok());
    }
}
