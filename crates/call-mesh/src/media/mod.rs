//! Local capture and remote media types

pub mod devices;
pub mod local;
pub mod track;

pub use devices::{MediaDevices, SyntheticDevices};
pub use local::{Adoption, LocalMediaManager, LocalMediaSnapshot, ReinitGuard, TrackSwitch};
pub use track::{LocalStream, LocalTrack, RemoteStream, RemoteTrack, TrackKind, TrackReadyState};
