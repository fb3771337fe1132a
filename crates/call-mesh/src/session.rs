//! One call: room membership, local media and the mesh on a single event loop

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CaptureRequest;
use crate::media::{Adoption, LocalMediaManager, LocalMediaSnapshot, LocalStream, MediaDevices, ReinitGuard};
use crate::peer::{LinkEnvelope, MeshManager, PeerInfo, PeerLinkFactory, RemoteStreams};
use crate::room::{RosterChange, RoomTracker};
use crate::signaling::{ChannelEvent, ChannelEvents, InboundEvent, SignalingChannel};
use crate::Result;

/// Who is joining which room
#[derive(Debug, Clone)]
pub struct CallParams {
    /// Room key
    pub room_id: String,
    /// Local participant id
    pub user_id: String,
    /// Devices to capture
    pub capture: CaptureRequest,
}

impl CallParams {
    /// Params with the default audio+video capture request
    pub fn new(room_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            user_id: user_id.into(),
            capture: CaptureRequest::default(),
        }
    }
}

/// Lifecycle of a call session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    /// Waiting for the signaling channel
    Joining,
    /// Joined the room
    Active,
    /// Torn down
    Ended,
}

enum CallCommand {
    ToggleMic,
    ToggleCamera,
    VisibilityResumed,
    EndCall,
    Leave(oneshot::Sender<()>),
    ListPeers(oneshot::Sender<Vec<PeerInfo>>),
}

type CaptureResult = (ReinitGuard, Result<LocalStream>);

/// Control and observation handle for a running call
///
/// Dropping every clone leaves the call.
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::UnboundedSender<CallCommand>,
    participants: watch::Receiver<Vec<String>>,
    remote_streams: watch::Receiver<RemoteStreams>,
    local_media: watch::Receiver<LocalMediaSnapshot>,
    status: watch::Receiver<CallStatus>,
}

impl CallHandle {
    /// Participant ids, self included
    pub fn participants(&self) -> watch::Receiver<Vec<String>> {
        self.participants.clone()
    }

    /// Remote streams keyed by participant id
    pub fn remote_streams(&self) -> watch::Receiver<RemoteStreams> {
        self.remote_streams.clone()
    }

    /// Local stream and mute flags
    pub fn local_media(&self) -> watch::Receiver<LocalMediaSnapshot> {
        self.local_media.clone()
    }

    /// Session status
    pub fn status(&self) -> watch::Receiver<CallStatus> {
        self.status.clone()
    }

    /// Flip the microphone
    pub fn toggle_mic(&self) {
        self.command(CallCommand::ToggleMic);
    }

    /// Flip the camera
    pub fn toggle_camera(&self) {
        self.command(CallCommand::ToggleCamera);
    }

    /// The host became visible again: check local media health
    pub fn visibility_resumed(&self) {
        self.command(CallCommand::VisibilityResumed);
    }

    /// End the call for everyone, then tear down
    pub fn end_call(&self) {
        self.command(CallCommand::EndCall);
    }

    /// Current connections; empty once the session has ended
    pub async fn list_peers(&self) -> Vec<PeerInfo> {
        let (tx, rx) = oneshot::channel();
        self.command(CallCommand::ListPeers(tx));
        rx.await.unwrap_or_default()
    }

    /// Leave the call and wait for teardown to finish; idempotent
    pub async fn leave(&self) {
        let (tx, rx) = oneshot::channel();
        self.command(CallCommand::Leave(tx));
        let _ = rx.await;
    }

    fn command(&self, command: CallCommand) {
        if self.commands.send(command).is_err() {
            debug!("Call session already ended");
        }
    }
}

/// Event loop owning everything one call needs
pub struct CallSession {
    params: CallParams,
    room: RoomTracker,
    media: LocalMediaManager,
    mesh: MeshManager,
    devices: Arc<dyn MediaDevices>,
    channel_events: ChannelEvents,
    link_events: mpsc::UnboundedReceiver<LinkEnvelope>,
    commands: mpsc::UnboundedReceiver<CallCommand>,
    capture_tx: mpsc::UnboundedSender<CaptureResult>,
    capture_rx: mpsc::UnboundedReceiver<CaptureResult>,
    status: watch::Sender<CallStatus>,
}

impl CallSession {
    /// Start a call on the current runtime
    ///
    /// Capture starts immediately; the room is joined once the channel
    /// reports `Connected`.
    pub fn spawn(
        params: CallParams,
        channel: SignalingChannel,
        channel_events: ChannelEvents,
        devices: Arc<dyn MediaDevices>,
        links: Arc<dyn PeerLinkFactory>,
    ) -> (CallHandle, JoinHandle<()>) {
        let channel = Arc::new(channel);
        let room = RoomTracker::new(&params.room_id, &params.user_id, Arc::clone(&channel));
        let media = LocalMediaManager::new(params.capture);
        let (mesh, link_events) =
            MeshManager::new(&params.user_id, &params.room_id, links, channel);
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(CallStatus::Joining);

        let handle = CallHandle {
            commands: commands_tx,
            participants: room.subscribe(),
            remote_streams: mesh.remote_streams(),
            local_media: media.subscribe(),
            status: status_rx,
        };

        let session = Self {
            params,
            room,
            media,
            mesh,
            devices,
            channel_events,
            link_events,
            commands,
            capture_tx,
            capture_rx,
            status,
        };
        let task = tokio::spawn(session.run());

        (handle, task)
    }

    async fn run(mut self) {
        info!(
            room_id = %self.params.room_id,
            user_id = %self.params.user_id,
            "Call session started"
        );
        if let Some(guard) = self.media.try_begin_reinit() {
            self.start_capture(guard);
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None => {
                        debug!("Every call handle dropped");
                        break;
                    }
                    Some(CallCommand::Leave(ack)) => {
                        self.teardown().await;
                        let _ = ack.send(());
                        return;
                    }
                    Some(CallCommand::EndCall) => {
                        self.room.end_call();
                        break;
                    }
                    Some(command) => self.on_command(command),
                },
                Some(event) = self.channel_events.recv() => {
                    if self.on_channel_event(event).await {
                        break;
                    }
                }
                Some(envelope) = self.link_events.recv() => self.mesh.on_link_event(envelope),
                Some((guard, result)) = self.capture_rx.recv() => self.on_capture(guard, result).await,
            }
        }

        self.teardown().await;
    }

    fn on_command(&mut self, command: CallCommand) {
        match command {
            CallCommand::ToggleMic => {
                let on = self.media.toggle_mic();
                debug!(mic_enabled = on, "Microphone toggled");
            }
            CallCommand::ToggleCamera => {
                let on = self.media.toggle_camera();
                debug!(camera_enabled = on, "Camera toggled");
            }
            CallCommand::VisibilityResumed => {
                if !self.media.needs_reinit() {
                    debug!("Local media healthy");
                    return;
                }
                match self.media.try_begin_reinit() {
                    Some(guard) => {
                        info!("Local media stale, reacquiring");
                        self.start_capture(guard);
                    }
                    None => debug!("Capture already in flight"),
                }
            }
            CallCommand::ListPeers(reply) => {
                let _ = reply.send(self.mesh.list_peers());
            }
            CallCommand::EndCall | CallCommand::Leave(_) => {}
        }
    }

    /// Returns `true` when the session must end
    async fn on_channel_event(&mut self, event: ChannelEvent) -> bool {
        let event = match event {
            ChannelEvent::Connected => {
                self.room.on_connected();
                self.status.send_replace(CallStatus::Active);
                return false;
            }
            ChannelEvent::Disconnected(reason) => {
                warn!(
                    room_id = %self.params.room_id,
                    reason = reason.as_deref().unwrap_or("none"),
                    "Signaling channel lost"
                );
                return false;
            }
            ChannelEvent::Event(event) => event,
        };

        match event {
            InboundEvent::CallParticipants(_) | InboundEvent::CallJoined(_) => {
                if self.room.apply(&event) != RosterChange::Updated {
                    return false;
                }
                let roster = self.room.participants();
                if let Some(local) = self.media.current() {
                    // offers whose answer failed earlier get another attempt
                    self.mesh.drain_offers(local).await;
                }
                if matches!(event, InboundEvent::CallParticipants(_)) {
                    self.mesh.resend_stalled_offers(&roster).await;
                }
                self.mesh.sync_roster(&roster, self.media.current()).await;
            }
            InboundEvent::CallLeft(_) => {
                if let RosterChange::Left(user_id) = self.room.apply(&event) {
                    self.mesh.remove_peer(&user_id).await;
                }
            }
            InboundEvent::CallEnded(_) => {
                self.room.apply(&event);
                return true;
            }
            InboundEvent::WebrtcOffer(signal) => {
                self.mesh.handle_offer(signal, self.media.current()).await;
            }
            InboundEvent::WebrtcAnswer(signal) => self.mesh.handle_answer(signal).await,
            InboundEvent::WebrtcIceCandidate(signal) => self.mesh.handle_candidate(signal).await,
            InboundEvent::IncomingCall(_) => debug!("Ignoring ring on the call channel"),
        }
        false
    }

    fn start_capture(&self, guard: ReinitGuard) {
        let devices = Arc::clone(&self.devices);
        let request = self.media.request();
        let results = self.capture_tx.clone();
        tokio::spawn(async move {
            let result = devices.get_user_media(&request).await;
            if let Err(mpsc::error::SendError((_, Ok(stream)))) = results.send((guard, result)) {
                debug!("Session gone before capture finished, releasing stream");
                stream.stop();
            }
        });
    }

    async fn on_capture(&mut self, guard: ReinitGuard, result: Result<LocalStream>) {
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                self.media.capture_failed(&e);
                return;
            }
        };

        let adoption = self.media.adopt(stream, &self.mesh, &guard).await;
        drop(guard);

        if adoption == Adoption::Ready {
            if let Some(local) = self.media.current() {
                self.mesh.drain_offers(local).await;
                let roster = self.room.participants();
                self.mesh.sync_roster(&roster, Some(local)).await;
            }
        }
    }

    /// Leave, close every connection, stop local media, in that order
    async fn teardown(&mut self) {
        self.room.teardown();
        self.mesh.close_all().await;
        self.media.stop_all();
        self.status.send_replace(CallStatus::Ended);
        info!(room_id = %self.params.room_id, "Call session ended");
    }
}
