//! Peer connection mesh: connection seam, negotiation and buffering

pub mod link;
pub mod manager;
pub mod negotiation;
pub mod pending;
pub mod rtc;

pub use link::{
    ConnectionState, LinkEnvelope, LinkEvent, LinkEventSink, OutboundSender, PeerLink,
    PeerLinkFactory,
};
pub use manager::{MeshManager, PeerInfo, RemoteStreams};
pub use negotiation::{is_initiator, InitiatorPhase, Negotiation, ResponderPhase};
pub use pending::PendingSignals;
pub use rtc::RtcLinkFactory;
