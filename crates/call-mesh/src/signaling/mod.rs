//! Room signaling: wire protocol, channel handle and transports

pub mod channel;
pub mod memory;
pub mod protocol;
pub mod websocket;

pub use channel::{ChannelEvent, ChannelEvents, SignalSink, SignalingChannel};
pub use memory::{MemoryRelay, RelayRecord};
pub use protocol::{
    CandidateSignal, DescriptionSignal, IceCandidate, InboundEvent, OutboundEvent, RoomRef,
    SdpType, SessionDescription,
};
