//! Full-mesh peer connection management
//!
//! One [`MeshManager`] per call. It owns the table of connections keyed by
//! remote participant, the per-participant negotiation state and the
//! pending signal buffers. All methods take `&mut self`, so handlers for the
//! same connection never run concurrently.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, trace, warn};

use super::link::{
    ConnectionState, LinkEnvelope, LinkEvent, LinkEventSink, OutboundSender, PeerLink,
    PeerLinkFactory,
};
use super::negotiation::{is_initiator, InitiatorPhase, Negotiation};
use super::pending::PendingSignals;
use crate::media::{LocalStream, RemoteStream, RemoteTrack, TrackSwitch};
use crate::signaling::{
    CandidateSignal, DescriptionSignal, IceCandidate, OutboundEvent, SdpType, SessionDescription,
    SignalSink,
};
use crate::{Error, Result};

/// Remote streams keyed by participant id
pub type RemoteStreams = BTreeMap<String, RemoteStream>;

/// Information about one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Remote participant
    pub remote_id: String,

    /// Transport state
    pub state: ConnectionState,

    /// Negotiation state
    pub negotiation: Option<Negotiation>,

    /// Whether media from the remote side has arrived
    pub has_remote_stream: bool,
}

struct PeerEntry {
    link_id: u64,
    link: Arc<dyn PeerLink>,
    senders: Vec<Arc<dyn OutboundSender>>,
    remote_stream: Option<RemoteStream>,
    state: ConnectionState,
    /// Offer still waiting for its answer
    local_offer: Option<SessionDescription>,
}

/// Manages one connection per remote participant
pub struct MeshManager {
    local_id: String,
    room_id: String,
    factory: Arc<dyn PeerLinkFactory>,
    signals: Arc<dyn SignalSink>,
    link_tx: mpsc::UnboundedSender<LinkEnvelope>,
    peers: HashMap<String, PeerEntry>,
    negotiations: HashMap<String, Negotiation>,
    pending: PendingSignals,
    next_link_id: u64,
    remote_streams: watch::Sender<RemoteStreams>,
}

impl MeshManager {
    /// Create a manager for `local_id` in `room_id`
    ///
    /// Link events from every connection arrive on the returned receiver and
    /// must be fed back through [`MeshManager::on_link_event`].
    pub fn new(
        local_id: &str,
        room_id: &str,
        factory: Arc<dyn PeerLinkFactory>,
        signals: Arc<dyn SignalSink>,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEnvelope>) {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (remote_streams, _) = watch::channel(RemoteStreams::new());
        (
            Self {
                local_id: local_id.to_string(),
                room_id: room_id.to_string(),
                factory,
                signals,
                link_tx,
                peers: HashMap::new(),
                negotiations: HashMap::new(),
                pending: PendingSignals::new(),
                next_link_id: 0,
                remote_streams,
            },
            link_rx,
        )
    }

    /// Local participant id
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Subscribe to remote stream updates
    pub fn remote_streams(&self) -> watch::Receiver<RemoteStreams> {
        self.remote_streams.subscribe()
    }

    /// Number of open connections
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Whether a connection to `remote_id` exists
    pub fn has_peer(&self, remote_id: &str) -> bool {
        self.peers.contains_key(remote_id)
    }

    /// Negotiation state with `remote_id`
    pub fn negotiation(&self, remote_id: &str) -> Option<Negotiation> {
        self.negotiations.get(remote_id).copied()
    }

    /// Buffered signals
    pub fn pending(&self) -> &PendingSignals {
        &self.pending
    }

    /// Every connection, ordered by participant id
    pub fn list_peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .peers
            .iter()
            .map(|(remote_id, entry)| PeerInfo {
                remote_id: remote_id.clone(),
                state: entry.state,
                negotiation: self.negotiations.get(remote_id).copied(),
                has_remote_stream: entry.remote_stream.is_some(),
            })
            .collect();
        peers.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));
        peers
    }

    /// Get or create the connection to `remote_id`
    ///
    /// Returns `None` without creating anything while there is no local
    /// stream. A new connection gets every local track attached, and buffered
    /// candidates are replayed once the remote description allows it.
    #[instrument(skip(self, local), fields(room_id = %self.room_id, remote_id = %remote_id))]
    pub async fn ensure_connection(
        &mut self,
        remote_id: &str,
        local: Option<&LocalStream>,
    ) -> Result<Option<Arc<dyn PeerLink>>> {
        if let Some(entry) = self.peers.get(remote_id) {
            return Ok(Some(Arc::clone(&entry.link)));
        }
        let Some(local) = local else {
            debug!("Local media not ready, deferring connection");
            return Ok(None);
        };

        self.next_link_id += 1;
        let link_id = self.next_link_id;
        let sink = LinkEventSink::new(remote_id, link_id, self.link_tx.clone());
        let link = self.factory.create(remote_id, sink).await?;

        let mut senders = Vec::with_capacity(local.tracks().len());
        for track in local.tracks() {
            match link.add_track(track).await {
                Ok(sender) => senders.push(sender),
                Err(e) => {
                    if let Err(close_err) = link.close().await {
                        debug!("Error closing half-built connection: {}", close_err);
                    }
                    return Err(e);
                }
            }
        }

        info!(tracks = senders.len(), "Peer connection ready");
        self.peers.insert(
            remote_id.to_string(),
            PeerEntry {
                link_id,
                link: Arc::clone(&link),
                senders,
                remote_stream: None,
                state: ConnectionState::New,
                local_offer: None,
            },
        );
        self.flush_candidates(remote_id).await;

        Ok(Some(link))
    }

    /// Initiator path: offer to every participant this side initiates to
    ///
    /// Only participants whose negotiation is still idle get an offer.
    pub async fn sync_roster(&mut self, participants: &[String], local: Option<&LocalStream>) {
        let Some(local) = local else {
            return;
        };

        for remote_id in participants {
            if *remote_id == self.local_id || !is_initiator(&self.local_id, remote_id) {
                continue;
            }
            if !self.negotiation_mut(remote_id).can_offer() {
                continue;
            }
            if let Err(e) = self.initiate(remote_id, local).await {
                warn!(remote_id = %remote_id, "Failed to send offer: {}", e);
            }
        }
    }

    async fn initiate(&mut self, remote_id: &str, local: &LocalStream) -> Result<()> {
        let Some(link) = self.ensure_connection(remote_id, Some(local)).await? else {
            return Ok(());
        };
        self.negotiation_mut(remote_id).begin_offer()?;

        let offer = async {
            let offer = link.create_offer().await?;
            link.set_local_description(offer.clone()).await?;
            Ok::<SessionDescription, Error>(offer)
        }
        .await;

        match offer {
            Ok(sdp) => {
                info!(remote_id, "Sending offer");
                if let Some(entry) = self.peers.get_mut(remote_id) {
                    entry.local_offer = Some(sdp.clone());
                }
                self.send_offer(remote_id, sdp)
            }
            Err(e) => {
                self.negotiation_mut(remote_id).reset_after_failure();
                self.remove_link(remote_id).await;
                Err(e)
            }
        }
    }

    /// Re-send the outstanding offer to every listed participant whose answer
    /// never arrived
    ///
    /// The offer goes out again unchanged on the existing connection, so a
    /// responder that did answer treats it as a renegotiation. Returns the
    /// number of offers re-sent.
    pub async fn resend_stalled_offers(&mut self, participants: &[String]) -> usize {
        let offering = Negotiation::Initiator(InitiatorPhase::Offering);
        let mut resent = 0;

        for remote_id in participants {
            if self.negotiations.get(remote_id) != Some(&offering) {
                continue;
            }
            let Some(sdp) = self.peers.get(remote_id).and_then(|e| e.local_offer.clone()) else {
                continue;
            };
            info!(remote_id = %remote_id, "Re-sending unanswered offer");
            match self.send_offer(remote_id, sdp) {
                Ok(()) => resent += 1,
                Err(e) => warn!(remote_id = %remote_id, "Failed to re-send offer: {}", e),
            }
        }
        resent
    }

    fn send_offer(&self, remote_id: &str, sdp: SessionDescription) -> Result<()> {
        self.signals.send(OutboundEvent::WebrtcOffer(DescriptionSignal {
            room_id: self.room_id.clone(),
            target_user_id: remote_id.to_string(),
            from_user_id: self.local_id.clone(),
            sdp,
        }))
    }

    /// Responder path: queue the offer, then answer it if media is ready
    pub async fn handle_offer(&mut self, signal: DescriptionSignal, local: Option<&LocalStream>) {
        if !self.addressed_to_us(&signal.room_id, &signal.target_user_id) {
            trace!(target = %signal.target_user_id, "Ignoring offer for someone else");
            return;
        }
        let from = signal.from_user_id;
        if from == self.local_id || is_initiator(&self.local_id, &from) {
            warn!(remote_id = %from, "Ignoring offer from a participant we initiate to");
            return;
        }
        if signal.sdp.kind != SdpType::Offer {
            warn!(remote_id = %from, "Ignoring webrtc_offer carrying an answer");
            return;
        }

        if self.pending.put_offer(&from, signal.sdp) {
            debug!(remote_id = %from, "Buffered offer superseded by a newer one");
        }
        if let Err(e) = self.negotiation_mut(&from).offer_buffered() {
            warn!(remote_id = %from, "Unexpected offer: {}", e);
            return;
        }

        match local {
            Some(local) => self.drain_offers(local).await,
            None => debug!(remote_id = %from, "Local media not ready, offer buffered"),
        }
    }

    /// Answer every buffered offer in receipt order
    ///
    /// An offer whose answer fails stays queued for the next opportunity.
    pub async fn drain_offers(&mut self, local: &LocalStream) {
        for (from, sdp) in self.pending.offers() {
            let existed = self.peers.contains_key(&from);
            let mut flushed = Vec::new();

            match self.answer_offer(&from, sdp, local, &mut flushed).await {
                Ok(()) => {
                    self.pending.remove_offer(&from);
                    info!(remote_id = %from, "Answered offer");
                }
                Err(e) => {
                    warn!(remote_id = %from, "Answering failed, offer stays queued: {}", e);
                    self.pending.restore_candidates(&from, flushed);
                    self.negotiation_mut(&from).reset_after_failure();
                    if !existed {
                        self.remove_link(&from).await;
                    }
                }
            }
        }
    }

    async fn answer_offer(
        &mut self,
        from: &str,
        offer: SessionDescription,
        local: &LocalStream,
        flushed: &mut Vec<IceCandidate>,
    ) -> Result<()> {
        let link = self
            .ensure_connection(from, Some(local))
            .await?
            .ok_or_else(|| Error::PeerConnectionError("no local media".to_string()))?;
        self.negotiation_mut(from).begin_answer()?;

        link.set_remote_description(offer).await?;
        *flushed = self.apply_buffered(from, &link).await;

        let answer = link.create_answer().await?;
        link.set_local_description(answer.clone()).await?;
        self.signals.send(OutboundEvent::WebrtcAnswer(DescriptionSignal {
            room_id: self.room_id.clone(),
            target_user_id: from.to_string(),
            from_user_id: self.local_id.clone(),
            sdp: answer,
        }))?;

        self.negotiation_mut(from).answer_sent()
    }

    /// Apply an answer to our outstanding offer
    ///
    /// Answers for unknown connections or without an outstanding offer are
    /// dropped.
    pub async fn handle_answer(&mut self, signal: DescriptionSignal) {
        if !self.addressed_to_us(&signal.room_id, &signal.target_user_id) {
            trace!(target = %signal.target_user_id, "Ignoring answer for someone else");
            return;
        }
        let from = signal.from_user_id;
        let Some(link) = self.peers.get(&from).map(|entry| Arc::clone(&entry.link)) else {
            debug!(remote_id = %from, "Dropping answer for unknown connection");
            return;
        };
        if self.negotiations.get(&from) != Some(&Negotiation::Initiator(InitiatorPhase::Offering)) {
            debug!(remote_id = %from, "Dropping answer without an outstanding offer");
            return;
        }

        match link.set_remote_description(signal.sdp).await {
            Ok(()) => {
                if let Err(e) = self.negotiation_mut(&from).answer_applied() {
                    warn!(remote_id = %from, "{}", e);
                }
                if let Some(entry) = self.peers.get_mut(&from) {
                    entry.local_offer = None;
                }
                info!(remote_id = %from, "Answer applied");
                self.flush_candidates(&from).await;
            }
            Err(e) => {
                warn!(remote_id = %from, "Failed to apply answer: {}", e);
                self.negotiation_mut(&from).reset_after_failure();
                self.remove_link(&from).await;
            }
        }
    }

    /// Apply a remote candidate now, or buffer it until the connection has a
    /// remote description
    pub async fn handle_candidate(&mut self, signal: CandidateSignal) {
        if !self.addressed_to_us(&signal.room_id, &signal.target_user_id) {
            trace!(target = %signal.target_user_id, "Ignoring candidate for someone else");
            return;
        }
        let from = signal.from_user_id;

        let ready = self
            .negotiations
            .get(&from)
            .is_some_and(Negotiation::accepts_candidates);
        match self.peers.get(&from) {
            Some(entry) if ready => {
                let link = Arc::clone(&entry.link);
                if let Err(e) = link.add_ice_candidate(signal.candidate).await {
                    debug!(remote_id = %from, "Discarding rejected candidate: {}", e);
                }
            }
            _ => {
                self.pending.push_candidate(&from, signal.candidate);
                trace!(
                    remote_id = %from,
                    buffered = self.pending.candidate_count(&from),
                    "Candidate buffered"
                );
            }
        }
    }

    async fn flush_candidates(&mut self, remote_id: &str) {
        let ready = self
            .negotiations
            .get(remote_id)
            .is_some_and(Negotiation::accepts_candidates);
        let Some(link) = self.peers.get(remote_id).map(|e| Arc::clone(&e.link)) else {
            return;
        };
        if ready {
            self.apply_buffered(remote_id, &link).await;
        }
    }

    /// Replay buffered candidates in order; returns the ones the link accepted
    async fn apply_buffered(&mut self, remote_id: &str, link: &Arc<dyn PeerLink>) -> Vec<IceCandidate> {
        let buffered = self.pending.take_candidates(remote_id);
        if buffered.is_empty() {
            return buffered;
        }
        debug!(remote_id, count = buffered.len(), "Replaying buffered candidates");

        let mut applied = Vec::with_capacity(buffered.len());
        for candidate in buffered {
            match link.add_ice_candidate(candidate.clone()).await {
                Ok(()) => applied.push(candidate),
                Err(e) => debug!(remote_id, "Discarding rejected candidate: {}", e),
            }
        }
        applied
    }

    /// Handle an event reported by a connection
    pub fn on_link_event(&mut self, envelope: LinkEnvelope) {
        let LinkEnvelope {
            remote_id,
            link_id,
            event,
        } = envelope;
        let Some(entry) = self.peers.get_mut(&remote_id) else {
            trace!(remote_id = %remote_id, "Event for a closed connection");
            return;
        };
        if entry.link_id != link_id {
            debug!(remote_id = %remote_id, "Ignoring event from a replaced connection");
            return;
        }

        match event {
            LinkEvent::LocalCandidate(candidate) => {
                let sent = self.signals.send(OutboundEvent::WebrtcIceCandidate(CandidateSignal {
                    room_id: self.room_id.clone(),
                    target_user_id: remote_id.clone(),
                    from_user_id: self.local_id.clone(),
                    candidate,
                }));
                if let Err(e) = sent {
                    debug!(remote_id = %remote_id, "Local candidate not sent: {}", e);
                }
            }
            LinkEvent::RemoteTrack(track) => {
                if attach_remote_track(&mut entry.remote_stream, track) {
                    info!(remote_id = %remote_id, "Remote stream updated");
                    self.publish_streams();
                }
            }
            LinkEvent::StateChanged(state) => {
                if entry.state != state {
                    debug!(
                        "Peer {} state transition: {:?} -> {:?}",
                        remote_id, entry.state, state
                    );
                    entry.state = state;
                }
            }
        }
    }

    /// Close and forget everything about one participant
    pub async fn remove_peer(&mut self, remote_id: &str) {
        self.negotiations.remove(remote_id);
        self.pending.clear_peer(remote_id);
        if self.remove_link(remote_id).await {
            info!(remote_id, "Removed peer");
        }
    }

    /// Close every connection and clear all buffers
    pub async fn close_all(&mut self) {
        let peers: Vec<(String, PeerEntry)> = self.peers.drain().collect();
        for (remote_id, entry) in peers {
            if let Err(e) = entry.link.close().await {
                warn!("Error closing peer connection for {}: {}", remote_id, e);
            }
        }
        self.negotiations.clear();
        self.pending.clear();
        self.publish_streams();
        info!(room_id = %self.room_id, "All peer connections closed");
    }

    async fn remove_link(&mut self, remote_id: &str) -> bool {
        let Some(entry) = self.peers.remove(remote_id) else {
            return false;
        };
        if let Err(e) = entry.link.close().await {
            warn!("Error closing peer connection for {}: {}", remote_id, e);
        }
        if entry.remote_stream.is_some() {
            self.publish_streams();
        }
        true
    }

    fn negotiation_mut(&mut self, remote_id: &str) -> &mut Negotiation {
        let local_id = &self.local_id;
        self.negotiations
            .entry(remote_id.to_string())
            .or_insert_with(|| Negotiation::for_pair(local_id, remote_id))
    }

    fn addressed_to_us(&self, room_id: &str, target: &str) -> bool {
        room_id == self.room_id && target == self.local_id
    }

    fn publish_streams(&self) {
        let streams: RemoteStreams = self
            .peers
            .iter()
            .filter_map(|(id, entry)| {
                entry
                    .remote_stream
                    .as_ref()
                    .map(|stream| (id.clone(), stream.clone()))
            })
            .collect();
        self.remote_streams.send_replace(streams);
    }
}

/// Keep the first remote stream; later tracks join it only if they share its id
fn attach_remote_track(slot: &mut Option<RemoteStream>, track: RemoteTrack) -> bool {
    match slot {
        None => {
            *slot = Some(RemoteStream::from_track(track));
            true
        }
        Some(stream) if stream.stream_id == track.stream_id => {
            if stream.tracks.iter().any(|t| t.id == track.id) {
                return false;
            }
            stream.tracks.push(track);
            true
        }
        Some(_) => {
            debug!(stream_id = %track.stream_id, "Ignoring track from a second remote stream");
            false
        }
    }
}

#[async_trait]
impl TrackSwitch for MeshManager {
    async fn switch_tracks(&self, next: &LocalStream) {
        for (remote_id, entry) in &self.peers {
            for sender in &entry.senders {
                let Some(track) = next.track(sender.kind()) else {
                    warn!(remote_id = %remote_id, "New stream has no {} track", sender.kind());
                    continue;
                };
                if let Err(e) = sender.replace_track(track).await {
                    warn!(remote_id = %remote_id, "Failed to switch {} sender: {}", sender.kind(), e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureRequest;
    use crate::media::{LocalTrack, TrackKind};
    use crate::signaling::OutboundEvent;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Link that records every call and never produces events
    #[derive(Default)]
    struct RecordingLink {
        calls: Mutex<Vec<String>>,
        senders: Mutex<Vec<Arc<RecordingSender>>>,
        remote_set: AtomicBool,
        fail_answer: bool,
    }

    struct RecordingSender {
        kind: TrackKind,
        current: Mutex<String>,
    }

    #[async_trait]
    impl OutboundSender for RecordingSender {
        fn kind(&self) -> TrackKind {
            self.kind
        }

        async fn replace_track(&self, track: &LocalTrack) -> Result<()> {
            *self.current.lock() = track.id().to_string();
            Ok(())
        }
    }

    #[async_trait]
    impl PeerLink for RecordingLink {
        async fn add_track(&self, track: &LocalTrack) -> Result<Arc<dyn OutboundSender>> {
            self.calls.lock().push(format!("add_track:{}", track.kind()));
            let sender = Arc::new(RecordingSender {
                kind: track.kind(),
                current: Mutex::new(track.id().to_string()),
            });
            self.senders.lock().push(Arc::clone(&sender));
            Ok(sender)
        }

        async fn create_offer(&self) -> Result<SessionDescription> {
            self.calls.lock().push("create_offer".to_string());
            Ok(SessionDescription::offer("offer-sdp"))
        }

        async fn create_answer(&self) -> Result<SessionDescription> {
            self.calls.lock().push("create_answer".to_string());
            if self.fail_answer {
                return Err(Error::SdpError("answer refused".to_string()));
            }
            Ok(SessionDescription::answer("answer-sdp"))
        }

        async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
            self.calls.lock().push(format!("set_local:{:?}", desc.kind));
            Ok(())
        }

        async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
            self.calls.lock().push(format!("set_remote:{:?}", desc.kind));
            self.remote_set.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
            if !self.remote_set.load(Ordering::SeqCst) || candidate.candidate == "bad" {
                return Err(Error::IceCandidateError("rejected".to_string()));
            }
            self.calls.lock().push(format!("candidate:{}", candidate.candidate));
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.calls.lock().push("close".to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingFactory {
        links: Mutex<Vec<(String, Arc<RecordingLink>)>>,
        fail_answers: AtomicBool,
    }

    impl RecordingFactory {
        fn link(&self, index: usize) -> Arc<RecordingLink> {
            Arc::clone(&self.links.lock()[index].1)
        }

        fn calls(&self, index: usize) -> Vec<String> {
            self.link(index).calls.lock().clone()
        }
    }

    #[async_trait]
    impl PeerLinkFactory for RecordingFactory {
        async fn create(&self, remote_id: &str, _events: LinkEventSink) -> Result<Arc<dyn PeerLink>> {
            let link = Arc::new(RecordingLink {
                fail_answer: self.fail_answers.load(Ordering::SeqCst),
                ..Default::default()
            });
            self.links
                .lock()
                .push((remote_id.to_string(), Arc::clone(&link)));
            Ok(link)
        }
    }

    struct Fixture {
        mesh: MeshManager,
        factory: Arc<RecordingFactory>,
        sent: mpsc::UnboundedReceiver<OutboundEvent>,
        stream: LocalStream,
    }

    fn fixture(local_id: &str) -> Fixture {
        let factory = Arc::new(RecordingFactory::default());
        let (tx, sent) = mpsc::unbounded_channel::<OutboundEvent>();
        let (mesh, _links) = MeshManager::new(local_id, "r1", factory.clone(), Arc::new(tx));
        Fixture {
            mesh,
            factory,
            sent,
            stream: LocalStream::capture(&CaptureRequest::default()),
        }
    }

    fn offer_from(from: &str, to: &str) -> DescriptionSignal {
        DescriptionSignal {
            room_id: "r1".to_string(),
            target_user_id: to.to_string(),
            from_user_id: from.to_string(),
            sdp: SessionDescription::offer("remote-offer"),
        }
    }

    fn candidate_from(from: &str, to: &str, line: &str) -> CandidateSignal {
        CandidateSignal {
            room_id: "r1".to_string(),
            target_user_id: to.to_string(),
            from_user_id: from.to_string(),
            candidate: IceCandidate {
                candidate: line.to_string(),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_ensure_connection_is_idempotent() {
        let mut f = fixture("a1");
        assert!(f.mesh.ensure_connection("b2", None).await.unwrap().is_none());
        assert_eq!(f.mesh.peer_count(), 0);

        f.mesh.ensure_connection("b2", Some(&f.stream)).await.unwrap();
        f.mesh.ensure_connection("b2", Some(&f.stream)).await.unwrap();
        assert_eq!(f.mesh.peer_count(), 1);
        assert_eq!(f.factory.links.lock().len(), 1);
        assert_eq!(
            f.factory.calls(0),
            vec!["add_track:audio".to_string(), "add_track:video".to_string()]
        );
    }

    #[tokio::test]
    async fn test_sync_roster_offers_only_to_higher_ids() {
        let mut f = fixture("b2");
        let roster = vec!["a1".to_string(), "b2".to_string(), "c3".to_string()];

        f.mesh.sync_roster(&roster, None).await;
        assert_eq!(f.mesh.peer_count(), 0);

        f.mesh.sync_roster(&roster, Some(&f.stream)).await;
        f.mesh.sync_roster(&roster, Some(&f.stream)).await;

        let offers: Vec<OutboundEvent> = std::iter::from_fn(|| f.sent.try_recv().ok()).collect();
        assert_eq!(offers.len(), 1);
        let OutboundEvent::WebrtcOffer(signal) = &offers[0] else {
            panic!("expected offer, got {:?}", offers[0]);
        };
        assert_eq!(signal.target_user_id, "c3");
        assert_eq!(signal.from_user_id, "b2");
        assert!(!f.mesh.has_peer("a1"));
    }

    #[tokio::test]
    async fn test_offer_buffered_until_media_ready() {
        let mut f = fixture("b2");
        f.mesh.handle_offer(offer_from("a1", "b2"), None).await;
        assert_eq!(f.mesh.peer_count(), 0);
        assert!(f.mesh.pending().has_offer("a1"));

        f.mesh.drain_offers(&f.stream.clone()).await;
        assert!(!f.mesh.pending().has_offer("a1"));
        let OutboundEvent::WebrtcAnswer(answer) = f.sent.try_recv().unwrap() else {
            panic!("expected answer");
        };
        assert_eq!(answer.target_user_id, "a1");

        f.mesh.drain_offers(&f.stream.clone()).await;
        assert!(f.sent.try_recv().is_err(), "answered exactly once");
    }

    #[tokio::test]
    async fn test_misdirected_and_wrong_role_offers_are_ignored() {
        let mut f = fixture("b2");
        let stream = f.stream.clone();
        f.mesh.handle_offer(offer_from("a1", "zz"), Some(&stream)).await;
        f.mesh.handle_offer(offer_from("c3", "b2"), Some(&stream)).await;
        assert_eq!(f.mesh.peer_count(), 0);
        assert!(f.mesh.pending().is_empty());
        assert!(f.sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_candidates_buffer_until_remote_description() {
        let mut f = fixture("b2");
        let stream = f.stream.clone();
        f.mesh.handle_candidate(candidate_from("c3", "b2", "one")).await;
        f.mesh.handle_candidate(candidate_from("c3", "b2", "bad")).await;
        f.mesh.handle_candidate(candidate_from("c3", "b2", "two")).await;
        assert_eq!(f.mesh.pending().candidate_count("c3"), 3);

        // c3 only ever answers b2, so its offer is refused and nothing is flushed.
        f.mesh.handle_offer(offer_from("c3", "b2"), Some(&stream)).await;
        assert!(!f.mesh.has_peer("c3"));
        assert_eq!(f.mesh.pending().candidate_count("c3"), 3);

        f.mesh.handle_candidate(candidate_from("a1", "b2", "one")).await;
        f.mesh.handle_candidate(candidate_from("a1", "b2", "bad")).await;
        f.mesh.handle_candidate(candidate_from("a1", "b2", "two")).await;
        f.mesh.handle_offer(offer_from("a1", "b2"), Some(&stream)).await;

        assert_eq!(f.mesh.pending().candidate_count("a1"), 0);
        let calls = f.factory.calls(0);
        let remote = calls.iter().position(|c| c == "set_remote:Offer").unwrap();
        let first = calls.iter().position(|c| c == "candidate:one").unwrap();
        let second = calls.iter().position(|c| c == "candidate:two").unwrap();
        assert!(remote < first && first < second);

        f.mesh.handle_candidate(candidate_from("a1", "b2", "three")).await;
        assert_eq!(f.factory.calls(0).last().map(String::as_str), Some("candidate:three"));
    }

    #[tokio::test]
    async fn test_failed_drain_keeps_offer_and_closes_connection() {
        let mut f = fixture("b2");
        let stream = f.stream.clone();
        f.factory.fail_answers.store(true, Ordering::SeqCst);
        f.mesh.handle_candidate(candidate_from("a1", "b2", "one")).await;
        f.mesh.handle_offer(offer_from("a1", "b2"), Some(&stream)).await;

        assert!(f.mesh.pending().has_offer("a1"));
        assert_eq!(f.mesh.pending().candidate_count("a1"), 1);
        assert!(!f.mesh.has_peer("a1"));
        assert_eq!(f.factory.calls(0).last().map(String::as_str), Some("close"));

        f.factory.fail_answers.store(false, Ordering::SeqCst);
        f.mesh.drain_offers(&stream).await;
        assert!(!f.mesh.pending().has_offer("a1"));
        assert!(f.mesh.has_peer("a1"));
        assert!(f.factory.calls(1).contains(&"candidate:one".to_string()));
    }

    #[tokio::test]
    async fn test_unmatched_answer_is_dropped() {
        let mut f = fixture("a1");
        let answer = DescriptionSignal {
            sdp: SessionDescription::answer("late"),
            ..offer_from("b2", "a1")
        };
        f.mesh.handle_answer(answer.clone()).await;
        assert_eq!(f.mesh.peer_count(), 0);

        f.mesh.ensure_connection("b2", Some(&f.stream.clone())).await.unwrap();
        f.mesh.handle_answer(answer).await;
        assert!(!f.factory.calls(0).iter().any(|c| c.starts_with("set_remote")));
    }

    #[tokio::test]
    async fn test_answer_completes_initiator() {
        let mut f = fixture("a1");
        let stream = f.stream.clone();
        f.mesh.sync_roster(&["a1".to_string(), "b2".to_string()], Some(&stream)).await;
        assert_eq!(
            f.mesh.negotiation("b2"),
            Some(Negotiation::Initiator(InitiatorPhase::Offering))
        );
        f.mesh.handle_candidate(candidate_from("b2", "a1", "early")).await;
        assert_eq!(f.mesh.pending().candidate_count("b2"), 1);

        f.mesh
            .handle_answer(DescriptionSignal {
                sdp: SessionDescription::answer("answer"),
                ..offer_from("b2", "a1")
            })
            .await;
        assert_eq!(
            f.mesh.negotiation("b2"),
            Some(Negotiation::Initiator(InitiatorPhase::Connected))
        );
        assert!(f.factory.calls(0).contains(&"candidate:early".to_string()));
    }

    #[tokio::test]
    async fn test_unanswered_offer_is_resent() {
        let mut f = fixture("a1");
        let stream = f.stream.clone();
        let roster = vec!["a1".to_string(), "b2".to_string()];
        f.mesh.sync_roster(&roster, Some(&stream)).await;
        let OutboundEvent::WebrtcOffer(first) = f.sent.try_recv().unwrap() else {
            panic!("expected an offer");
        };

        assert_eq!(f.mesh.resend_stalled_offers(&roster).await, 1);
        let OutboundEvent::WebrtcOffer(again) = f.sent.try_recv().unwrap() else {
            panic!("expected a re-sent offer");
        };
        assert_eq!(again, first);
        assert_eq!(f.factory.links.lock().len(), 1);
        assert_eq!(
            f.factory.calls(0).iter().filter(|c| *c == "create_offer").count(),
            1
        );

        f.mesh
            .handle_answer(DescriptionSignal {
                sdp: SessionDescription::answer("answer"),
                ..offer_from("b2", "a1")
            })
            .await;
        assert_eq!(f.mesh.resend_stalled_offers(&roster).await, 0);
        assert!(f.sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_link_events_forward_candidates_and_streams() {
        let mut f = fixture("a1");
        let stream = f.stream.clone();
        f.mesh.ensure_connection("b2", Some(&stream)).await.unwrap();
        let mut streams = f.mesh.remote_streams();

        f.mesh.on_link_event(LinkEnvelope {
            remote_id: "b2".to_string(),
            link_id: 1,
            event: LinkEvent::LocalCandidate(IceCandidate {
                candidate: "local".to_string(),
                ..Default::default()
            }),
        });
        let OutboundEvent::WebrtcIceCandidate(sent) = f.sent.try_recv().unwrap() else {
            panic!("expected candidate");
        };
        assert_eq!(sent.target_user_id, "b2");

        f.mesh.on_link_event(LinkEnvelope {
            remote_id: "b2".to_string(),
            link_id: 1,
            event: LinkEvent::RemoteTrack(RemoteTrack {
                id: "t1".to_string(),
                kind: TrackKind::Audio,
                stream_id: "s-b2".to_string(),
                handle: None,
            }),
        });
        assert!(streams.has_changed().unwrap());
        assert!(streams.borrow_and_update().contains_key("b2"));

        f.mesh.on_link_event(LinkEnvelope {
            remote_id: "b2".to_string(),
            link_id: 99,
            event: LinkEvent::StateChanged(ConnectionState::Failed),
        });
        assert_eq!(f.mesh.list_peers()[0].state, ConnectionState::New);

        f.mesh.on_link_event(LinkEnvelope {
            remote_id: "b2".to_string(),
            link_id: 1,
            event: LinkEvent::StateChanged(ConnectionState::Connected),
        });
        assert_eq!(f.mesh.list_peers()[0].state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_switch_tracks_and_close_all() {
        let mut f = fixture("a1");
        let stream = f.stream.clone();
        f.mesh.ensure_connection("b2", Some(&stream)).await.unwrap();
        f.mesh.ensure_connection("c3", Some(&stream)).await.unwrap();

        let next = LocalStream::capture(&CaptureRequest::default());
        f.mesh.switch_tracks(&next).await;
        for index in 0..2 {
            for sender in f.factory.link(index).senders.lock().iter() {
                let expected = next.track(sender.kind).unwrap().id().to_string();
                assert_eq!(*sender.current.lock(), expected);
            }
        }

        f.mesh.close_all().await;
        assert_eq!(f.mesh.peer_count(), 0);
        assert!(f.factory.calls(0).contains(&"close".to_string()));
        assert!(f.factory.calls(1).contains(&"close".to_string()));
    }
}
