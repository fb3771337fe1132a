//! Seam between the mesh manager and a native peer-connection backend

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::signaling::{IceCandidate, SessionDescription};
use crate::Result;

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, negotiation not finished
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media can flow
    Connected,
    /// Transport failed
    Failed,
    /// Closed locally or by the remote side
    Closed,
}

/// Something a connection reports asynchronously
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A local candidate was gathered and must be trickled to the remote side
    LocalCandidate(IceCandidate),
    /// A remote track arrived
    RemoteTrack(RemoteTrack),
    /// Transport state changed
    StateChanged(ConnectionState),
}

/// Link event tagged with the connection it came from
#[derive(Debug, Clone)]
pub struct LinkEnvelope {
    /// Remote participant
    pub remote_id: String,
    /// Identity of the connection instance
    pub link_id: u64,
    /// Event
    pub event: LinkEvent,
}

/// Where a connection posts its events
///
/// Events from a connection that has since been replaced are recognised by
/// their `link_id` and discarded by the receiver.
#[derive(Debug, Clone)]
pub struct LinkEventSink {
    remote_id: String,
    link_id: u64,
    tx: mpsc::UnboundedSender<LinkEnvelope>,
}

impl LinkEventSink {
    /// Create a sink for one connection
    pub fn new(remote_id: &str, link_id: u64, tx: mpsc::UnboundedSender<LinkEnvelope>) -> Self {
        Self {
            remote_id: remote_id.to_string(),
            link_id,
            tx,
        }
    }

    /// Remote participant this sink reports for
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// Post an event; silently dropped once the receiver is gone
    pub fn emit(&self, event: LinkEvent) {
        let _ = self.tx.send(LinkEnvelope {
            remote_id: self.remote_id.clone(),
            link_id: self.link_id,
            event,
        });
    }
}

/// One outbound media sender attached to a connection
#[async_trait]
pub trait OutboundSender: Send + Sync {
    /// Kind of track this sender carries
    fn kind(&self) -> TrackKind;

    /// Swap the track without renegotiating
    async fn replace_track(&self, track: &LocalTrack) -> Result<()>;
}

/// One native peer connection
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Attach a local track, returning its sender
    async fn add_track(&self, track: &LocalTrack) -> Result<Arc<dyn OutboundSender>>;

    /// Create an offer
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply a local description
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    /// Apply a remote description
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    /// Apply a remote candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Close the connection and release native resources
    async fn close(&self) -> Result<()>;
}

/// Creates connections for the mesh manager
#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    /// Create a connection to `remote_id` reporting into `events`
    async fn create(&self, remote_id: &str, events: LinkEventSink) -> Result<Arc<dyn PeerLink>>;
}
