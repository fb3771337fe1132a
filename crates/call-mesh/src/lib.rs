//! Room-based WebRTC call negotiation
//!
//! Turns a set of users joining a named call room into a full mesh of
//! audio/video peer connections: every participant connects directly to
//! every other one.
//!
//! # Features
//!
//! - **Room membership**: roster snapshot plus incremental join/leave/end
//! - **Glare-free negotiation**: the lower participant id always offers
//! - **Pending signal queue**: offers and candidates that arrive early are
//!   buffered and replayed in order
//! - **Local media health**: stale capture streams are replaced without
//!   renegotiating, senders switch before old tracks stop
//! - **Transports**: WebSocket signaling and an in-process relay
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  CallHandle (commands + watch observables)              │
//! │  ↓                                                      │
//! │  CallSession (one event loop per call)                  │
//! │  ├─ RoomTracker ──── SignalingChannel (ws / memory)     │
//! │  ├─ LocalMediaManager ── MediaDevices                   │
//! │  └─ MeshManager                                         │
//! │      ├─ Negotiation state per participant               │
//! │      ├─ PendingSignals (offers, candidates)             │
//! │      └─ PeerLink per participant (webrtc-rs)            │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use call_mesh::{CallConfig, TurnConfig};
//!
//! let config = CallConfig::default().with_turn(TurnConfig {
//!     urls: vec!["turn:relay.example.com:3478".to_string()],
//!     username: Some("user".to_string()),
//!     credential: Some("secret".to_string()),
//! });
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.ice_servers().len(), 2);
//! ```
//!
//! ## Joining a call
//!
//! ```no_run
//! use std::sync::Arc;
//! use call_mesh::{signaling, CallConfig, CallParams, CallSession, RtcLinkFactory, SyntheticDevices};
//!
//! # async fn example() -> call_mesh::Result<()> {
//! let config = CallConfig::from_env();
//! let (channel, events) =
//!     signaling::websocket::connect(&config.signaling_url, config.auth_token.as_deref()).await?;
//!
//! let (call, _task) = CallSession::spawn(
//!     CallParams::new("r1", "a1"),
//!     channel,
//!     events,
//!     Arc::new(SyntheticDevices::new()),
//!     Arc::new(RtcLinkFactory::new(&config)?),
//! );
//!
//! call.toggle_mic();
//! call.leave().await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod controls;
pub mod error;
pub mod layout;
pub mod media;
pub mod peer;
pub mod ring;
pub mod room;
pub mod session;
pub mod signaling;

pub use config::{CallConfig, CaptureRequest, TurnConfig};
pub use controls::ControlState;
pub use error::{Error, Result};
pub use layout::{compose_layout, Badge, LayoutInput, TilePlacement, VideoTile};
pub use media::{
    LocalMediaManager, LocalMediaSnapshot, LocalStream, LocalTrack, MediaDevices, RemoteStream,
    SyntheticDevices, TrackKind,
};
pub use peer::{
    is_initiator, ConnectionState, MeshManager, Negotiation, PeerInfo, RemoteStreams,
    RtcLinkFactory,
};
pub use ring::{PendingInvite, RingListener};
pub use room::{RoomTracker, RosterChange};
pub use session::{CallHandle, CallParams, CallSession, CallStatus};
pub use signaling::{ChannelEvent, MemoryRelay, SignalingChannel};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
