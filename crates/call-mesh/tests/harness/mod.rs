//! In-process call test harness
//!
//! Provides:
//! - [`LoopbackNetwork`]: peer links that "connect" once both ends hold a
//!   local and a remote description, without any ICE or RTP
//! - [`ScriptedDevices`]: capture devices that can be held back or made to fail
//! - [`TestPeer`]: one participant wired to a shared [`MemoryRelay`]
//!
//! Basic usage pattern:
//!
//! 1. Create a `MemoryRelay` and a `LoopbackNetwork`
//! 2. Join participants with `TestPeer::join()`
//! 3. Wait on the participant observables with `wait_for()`
//! 4. Inspect `relay.history()` and the network for what went over the wire

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use call_mesh::peer::{LinkEvent, LinkEventSink, OutboundSender, PeerLink, PeerLinkFactory};
use call_mesh::signaling::{IceCandidate, OutboundEvent, SessionDescription};
use call_mesh::media::RemoteTrack;
use call_mesh::{
    CallHandle, CallParams, CallSession, CaptureRequest, ConnectionState, Error, LocalStream,
    LocalTrack, MediaDevices, MemoryRelay, Result, TrackKind,
};
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

/// Default wait for anything asynchronous in a test
pub const WAIT: Duration = Duration::from_secs(5);

/// Initialize test logging (safe to call from every test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,call_mesh=debug")
        .with_test_writer()
        .try_init();
}

/// Wait until `pred` holds for the value behind `rx`, panicking on timeout
pub async fn wait_for<T, F>(rx: &mut watch::Receiver<T>, what: &str, pred: F)
where
    F: FnMut(&T) -> bool,
{
    match tokio::time::timeout(WAIT, rx.wait_for(pred)).await {
        Ok(Ok(_)) => {}
        Ok(Err(_)) => panic!("{}: sender dropped", what),
        Err(_) => panic!("{}: timed out", what),
    }
}

/// Poll `cond` until it holds, panicking on timeout
pub async fn wait_until<F>(what: &str, mut cond: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("{}: timed out", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Count relay records sent by `user_id` that satisfy `pred`
pub fn count_sent<F>(relay: &MemoryRelay, user_id: &str, pred: F) -> usize
where
    F: Fn(&OutboundEvent) -> bool,
{
    relay
        .history()
        .iter()
        .filter(|r| r.user_id == user_id && pred(&r.event))
        .count()
}

pub fn is_offer(event: &OutboundEvent) -> bool {
    matches!(event, OutboundEvent::WebrtcOffer(_))
}

pub fn is_answer(event: &OutboundEvent) -> bool {
    matches!(event, OutboundEvent::WebrtcAnswer(_))
}

// ============================================================================
// Loopback peer links
// ============================================================================

/// Shared fabric for every loopback link in a test
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    links: Arc<Mutex<Vec<Arc<LoopbackLink>>>>,
    /// owner -> number of upcoming answers to refuse
    answer_failures: Arc<Mutex<HashMap<String, usize>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Link factory for the participant `owner`
    pub fn factory(&self, owner: &str) -> Arc<LoopbackFactory> {
        Arc::new(LoopbackFactory {
            owner: owner.to_string(),
            network: self.clone(),
        })
    }

    /// Every link `owner` created towards `remote`, oldest first
    pub fn links(&self, owner: &str, remote: &str) -> Vec<Arc<LoopbackLink>> {
        self.links
            .lock()
            .iter()
            .filter(|l| l.owner == owner && l.remote == remote)
            .cloned()
            .collect()
    }

    /// Latest link `owner` created towards `remote`
    pub fn link(&self, owner: &str, remote: &str) -> Option<Arc<LoopbackLink>> {
        self.links(owner, remote).pop()
    }

    /// Make the next `n` answers created by `owner` fail
    pub fn fail_answers(&self, owner: &str, n: usize) {
        self.answer_failures.lock().insert(owner.to_string(), n);
    }

    fn take_answer_failure(&self, owner: &str) -> bool {
        let mut failures = self.answer_failures.lock();
        match failures.get_mut(owner) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }

    /// Number of links not yet closed
    pub fn open_links(&self) -> usize {
        self.links.lock().iter().filter(|l| !l.is_closed()).count()
    }

    fn register(&self, link: Arc<LoopbackLink>) {
        self.links.lock().push(link);
    }

    /// Latest open counterpart of `link`
    fn counterpart(&self, link: &LoopbackLink) -> Option<Arc<LoopbackLink>> {
        self.links
            .lock()
            .iter()
            .rev()
            .find(|l| l.owner == link.remote && l.remote == link.owner && !l.is_closed())
            .cloned()
    }

    /// Connect both ends once each holds a local and a remote description
    fn try_connect(&self, link: &Arc<LoopbackLink>) {
        let Some(other) = self.counterpart(link) else {
            return;
        };
        if !link.is_negotiated() || !other.is_negotiated() {
            return;
        }
        link.connect();
        other.connect();
    }
}

pub struct LoopbackFactory {
    owner: String,
    network: LoopbackNetwork,
}

#[async_trait]
impl PeerLinkFactory for LoopbackFactory {
    async fn create(&self, remote_id: &str, events: LinkEventSink) -> Result<Arc<dyn PeerLink>> {
        let link = Arc::new(LoopbackLink {
            owner: self.owner.clone(),
            remote: remote_id.to_string(),
            network: self.network.clone(),
            events,
            local: Mutex::new(None),
            remote_desc: Mutex::new(None),
            applied: Mutex::new(Vec::new()),
            senders: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.network.register(Arc::clone(&link));
        Ok(link)
    }
}

/// Link whose SDP is a label and whose transport is the [`LoopbackNetwork`]
pub struct LoopbackLink {
    pub owner: String,
    pub remote: String,
    network: LoopbackNetwork,
    events: LinkEventSink,
    local: Mutex<Option<SessionDescription>>,
    remote_desc: Mutex<Option<SessionDescription>>,
    applied: Mutex<Vec<String>>,
    senders: Mutex<Vec<Arc<LoopbackSender>>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl LoopbackLink {
    /// Remote candidates accepted so far, in order
    pub fn applied_candidates(&self) -> Vec<String> {
        self.applied.lock().clone()
    }

    /// Track id each sender currently carries
    pub fn sender_track_ids(&self) -> Vec<String> {
        self.senders
            .lock()
            .iter()
            .map(|s| s.current.lock().id().to_string())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_negotiated(&self) -> bool {
        self.local.lock().is_some() && self.remote_desc.lock().is_some()
    }

    fn connect(&self) {
        if self.is_closed() || self.connected.swap(true, Ordering::SeqCst) {
            return;
        }
        let stream_id = format!("{}-stream", self.remote);
        for kind in [TrackKind::Audio, TrackKind::Video] {
            self.events.emit(LinkEvent::RemoteTrack(RemoteTrack {
                id: format!("{}-{}", self.remote, kind),
                kind,
                stream_id: stream_id.clone(),
                handle: None,
            }));
        }
        self.events
            .emit(LinkEvent::StateChanged(ConnectionState::Connected));
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::PeerConnectionError("link closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerLink for LoopbackLink {
    async fn add_track(&self, track: &LocalTrack) -> Result<Arc<dyn OutboundSender>> {
        self.ensure_open()?;
        let sender = Arc::new(LoopbackSender {
            kind: track.kind(),
            current: Mutex::new(track.clone()),
        });
        self.senders.lock().push(Arc::clone(&sender));
        Ok(sender)
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        Ok(SessionDescription::offer(format!(
            "offer:{}->{}",
            self.owner, self.remote
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        if self.remote_desc.lock().is_none() {
            return Err(Error::SdpError("no remote offer".to_string()));
        }
        if self.network.take_answer_failure(&self.owner) {
            return Err(Error::SdpError("answer refused".to_string()));
        }
        Ok(SessionDescription::answer(format!(
            "answer:{}->{}",
            self.owner, self.remote
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        *self.local.lock() = Some(desc);
        self.events.emit(LinkEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:{}", self.owner),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        let me = self.network.link(&self.owner, &self.remote);
        if let Some(me) = me {
            self.network.try_connect(&me);
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        *self.remote_desc.lock() = Some(desc);
        let me = self.network.link(&self.owner, &self.remote);
        if let Some(me) = me {
            self.network.try_connect(&me);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;
        if self.remote_desc.lock().is_none() {
            return Err(Error::IceCandidateError(
                "remote description not set".to_string(),
            ));
        }
        if candidate.candidate == "bad" {
            return Err(Error::IceCandidateError("malformed candidate".to_string()));
        }
        self.applied.lock().push(candidate.candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.events.emit(LinkEvent::StateChanged(ConnectionState::Closed));
        }
        Ok(())
    }
}

pub struct LoopbackSender {
    kind: TrackKind,
    current: Mutex<LocalTrack>,
}

#[async_trait]
impl OutboundSender for LoopbackSender {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<()> {
        *self.current.lock() = track.clone();
        Ok(())
    }
}

// ============================================================================
// Scripted capture devices
// ============================================================================

/// Capture devices a test can hold back or make fail
pub struct ScriptedDevices {
    calls: AtomicUsize,
    gated: AtomicBool,
    failing: AtomicBool,
    gate: Semaphore,
}

impl ScriptedDevices {
    fn with(gated: bool, failing: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            gated: AtomicBool::new(gated),
            failing: AtomicBool::new(failing),
            gate: Semaphore::new(0),
        })
    }

    /// Devices that capture immediately
    pub fn ready() -> Arc<Self> {
        Self::with(false, false)
    }

    /// Devices that block every capture until [`release`](Self::release)
    pub fn gated() -> Arc<Self> {
        Self::with(true, false)
    }

    /// Devices that reject every capture
    pub fn failing() -> Arc<Self> {
        Self::with(false, true)
    }

    /// Number of `get_user_media` calls so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_gated(&self, gated: bool) {
        self.gated.store(gated, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Let `n` held-back captures complete
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait]
impl MediaDevices for ScriptedDevices {
    async fn get_user_media(&self, request: &CaptureRequest) -> Result<LocalStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.gated.load(Ordering::SeqCst) {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| Error::CaptureError(e.to_string()))?;
            permit.forget();
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::CaptureError("permission denied".to_string()));
        }
        Ok(LocalStream::capture(request))
    }
}

// ============================================================================
// Participants
// ============================================================================

/// One participant in a test call
pub struct TestPeer {
    pub user_id: String,
    pub call: CallHandle,
    pub devices: Arc<ScriptedDevices>,
    task: Option<JoinHandle<()>>,
}

impl TestPeer {
    /// Connect `user_id` to the relay and start its call session in `room_id`
    pub fn join(
        relay: &MemoryRelay,
        network: &LoopbackNetwork,
        room_id: &str,
        user_id: &str,
        devices: Arc<ScriptedDevices>,
    ) -> Self {
        let (channel, events) = relay.connect(user_id);
        let (call, task) = CallSession::spawn(
            CallParams::new(room_id, user_id),
            channel,
            events,
            devices.clone(),
            network.factory(user_id),
        );
        Self {
            user_id: user_id.to_string(),
            call,
            devices,
            task: Some(task),
        }
    }

    /// Wait until the remote stream of every id in `remotes` is present
    pub async fn wait_for_streams(&self, remotes: &[&str]) {
        let mut rx = self.call.remote_streams();
        let what = format!("{} streams from {:?}", self.user_id, remotes);
        wait_for(&mut rx, &what, |streams| {
            remotes.iter().all(|id| streams.contains_key(*id))
        })
        .await;
    }

    /// Wait until the roster equals `expected` in any order
    pub async fn wait_for_roster(&self, expected: &[&str]) {
        let mut rx = self.call.participants();
        let what = format!("{} roster {:?}", self.user_id, expected);
        wait_for(&mut rx, &what, |roster| {
            roster.len() == expected.len() && expected.iter().all(|id| roster.iter().any(|r| r == id))
        })
        .await;
    }

    /// Wait until local media is published
    pub async fn wait_for_local_media(&self) -> LocalStream {
        let mut rx = self.call.local_media();
        let what = format!("{} local media", self.user_id);
        wait_for(&mut rx, &what, |snapshot| snapshot.stream.is_some()).await;
        let stream = rx.borrow().stream.clone();
        stream.unwrap_or_else(|| panic!("{}", what))
    }

    /// Leave and wait for the session task to finish
    pub async fn leave(&mut self) {
        self.call.leave().await;
        self.join_task().await;
    }

    /// Wait for the session task to finish on its own
    pub async fn join_task(&mut self) {
        if let Some(task) = self.task.take() {
            tokio::time::timeout(WAIT, task)
                .await
                .expect("session task did not finish")
                .expect("session task panicked");
        }
    }
}

/// Map of stream ids currently visible at `peer`, keyed by remote id
pub fn stream_ids(peer: &TestPeer) -> HashMap<String, String> {
    let rx = peer.call.remote_streams();
    let ids: HashMap<String, String> = rx
        .borrow()
        .iter()
        .map(|(id, stream)| (id.clone(), stream.stream_id.clone()))
        .collect();
    ids
}
