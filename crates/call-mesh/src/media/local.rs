//! Local capture stream ownership, health checks and replacement

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::track::{LocalStream, TrackKind};
use crate::config::CaptureRequest;
use crate::Error;

/// Moves every outbound sender onto the tracks of a new stream
#[async_trait]
pub trait TrackSwitch: Send + Sync {
    /// Replace each sender's track with the same-kind track of `next`
    async fn switch_tracks(&self, next: &LocalStream);
}

/// Observable view of the local media state
#[derive(Debug, Clone, PartialEq)]
pub struct LocalMediaSnapshot {
    /// Current stream, `None` until capture succeeds
    pub stream: Option<LocalStream>,
    /// Microphone flag
    pub mic_enabled: bool,
    /// Camera flag
    pub camera_enabled: bool,
    /// Last capture failure, cleared by the next successful capture
    pub capture_error: Option<String>,
}

impl Default for LocalMediaSnapshot {
    fn default() -> Self {
        Self {
            stream: None,
            mic_enabled: true,
            camera_enabled: true,
            capture_error: None,
        }
    }
}

/// Proof that the caller owns the single in-flight capture slot
///
/// Releases the slot on drop.
#[derive(Debug)]
pub struct ReinitGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for ReinitGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// What happened when a captured stream was adopted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adoption {
    /// There was no stream before: local media just became ready
    Ready,
    /// An existing stream was replaced
    Replaced,
}

/// Owner of the one local capture stream
pub struct LocalMediaManager {
    request: CaptureRequest,
    current: Option<LocalStream>,
    mic_enabled: bool,
    camera_enabled: bool,
    capture_error: Option<String>,
    in_flight: Arc<AtomicBool>,
    snapshot: watch::Sender<LocalMediaSnapshot>,
}

impl LocalMediaManager {
    /// Create a manager with no stream
    pub fn new(request: CaptureRequest) -> Self {
        let (snapshot, _) = watch::channel(LocalMediaSnapshot::default());
        Self {
            request,
            current: None,
            mic_enabled: true,
            camera_enabled: true,
            capture_error: None,
            in_flight: Arc::new(AtomicBool::new(false)),
            snapshot,
        }
    }

    /// Capture request used for every acquisition
    pub fn request(&self) -> CaptureRequest {
        self.request
    }

    /// Current stream
    pub fn current(&self) -> Option<&LocalStream> {
        self.current.as_ref()
    }

    /// Subscribe to snapshot updates
    pub fn subscribe(&self) -> watch::Receiver<LocalMediaSnapshot> {
        self.snapshot.subscribe()
    }

    /// Whether a capture is in progress
    pub fn is_capturing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Health check: no stream, a missing kind, or an ended track
    pub fn needs_reinit(&self) -> bool {
        match &self.current {
            None => true,
            Some(stream) => stream.is_stale(&self.request),
        }
    }

    /// Claim the capture slot
    ///
    /// Returns `None` while another capture is in flight.
    pub fn try_begin_reinit(&self) -> Option<ReinitGuard> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ReinitGuard {
                flag: Arc::clone(&self.in_flight),
            })
    }

    /// Make `next` the current stream
    ///
    /// With a previous stream, every sender is switched to `next` first, then
    /// the old tracks are stopped, then `next` is published.
    pub async fn adopt<S: TrackSwitch + ?Sized>(
        &mut self,
        next: LocalStream,
        senders: &S,
        _guard: &ReinitGuard,
    ) -> Adoption {
        self.apply_flags(&next);
        self.capture_error = None;

        let adoption = match self.current.take() {
            None => {
                info!(stream_id = next.id(), "Local media ready");
                Adoption::Ready
            }
            Some(previous) => {
                senders.switch_tracks(&next).await;
                previous.stop();
                info!(
                    old_stream = previous.id(),
                    new_stream = next.id(),
                    "Local stream replaced"
                );
                Adoption::Replaced
            }
        };

        self.current = Some(next);
        self.publish();
        adoption
    }

    /// Record a failed capture; the existing stream stays in place
    pub fn capture_failed(&mut self, err: &Error) {
        warn!("Capture failed: {}", err);
        self.capture_error = Some(err.to_string());
        self.publish();
    }

    /// Flip the microphone flag; no-op without a stream
    pub fn toggle_mic(&mut self) -> bool {
        if self.current.is_some() {
            self.mic_enabled = !self.mic_enabled;
            self.set_kind_enabled(TrackKind::Audio, self.mic_enabled);
        }
        self.mic_enabled
    }

    /// Flip the camera flag; no-op without a stream
    pub fn toggle_camera(&mut self) -> bool {
        if self.current.is_some() {
            self.camera_enabled = !self.camera_enabled;
            self.set_kind_enabled(TrackKind::Video, self.camera_enabled);
        }
        self.camera_enabled
    }

    /// Stop every track and forget the stream
    pub fn stop_all(&mut self) {
        if let Some(stream) = self.current.take() {
            debug!(stream_id = stream.id(), "Stopping local stream");
            stream.stop();
            self.publish();
        }
    }

    fn set_kind_enabled(&mut self, kind: TrackKind, enabled: bool) {
        if let Some(stream) = &self.current {
            for track in stream.tracks_of(kind) {
                track.set_enabled(enabled);
            }
        }
        self.publish();
    }

    fn apply_flags(&self, stream: &LocalStream) {
        for track in stream.tracks() {
            match track.kind() {
                TrackKind::Audio => track.set_enabled(self.mic_enabled),
                TrackKind::Video => track.set_enabled(self.camera_enabled),
            }
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(LocalMediaSnapshot {
            stream: self.current.clone(),
            mic_enabled: self.mic_enabled,
            camera_enabled: self.camera_enabled,
            capture_error: self.capture_error.clone(),
        });
    }
}

impl Drop for LocalMediaManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}
