//! webrtc-rs backed peer connections

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use super::link::{
    ConnectionState, LinkEvent, LinkEventSink, OutboundSender, PeerLink, PeerLinkFactory,
};
use crate::config::CallConfig;
use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::{Error, Result};

/// Factory producing real peer connections
pub struct RtcLinkFactory {
    api: API,
    rtc_config: RTCConfiguration,
}

impl RtcLinkFactory {
    /// Build the media engine and ICE configuration once per call
    pub fn new(config: &CallConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| Error::WebRtcError(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            rtc_config: RTCConfiguration {
                ice_servers: config.ice_servers(),
                ..Default::default()
            },
        })
    }
}

#[async_trait]
impl PeerLinkFactory for RtcLinkFactory {
    #[instrument(skip(self, events), fields(remote_id = %remote_id))]
    async fn create(&self, remote_id: &str, events: LinkEventSink) -> Result<Arc<dyn PeerLink>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_config.clone())
                .await
                .map_err(|e| {
                    Error::PeerConnectionError(format!("Failed to create peer connection: {}", e))
                })?,
        );

        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => sink.emit(LinkEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let sink = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = sink.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        RTPCodecType::Video => TrackKind::Video,
                        other => {
                            debug!("Ignoring remote track of kind {:?}", other);
                            return;
                        }
                    };
                    info!(
                        remote_id = sink.remote_id(),
                        "Remote {} track received", kind
                    );
                    sink.emit(LinkEvent::RemoteTrack(RemoteTrack {
                        id: track.id().to_string(),
                        kind,
                        stream_id: track.stream_id().to_string(),
                        handle: Some(track),
                    }));
                })
            },
        ));

        let sink = events;
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let sink = sink.clone();
            Box::pin(async move {
                let state = match s {
                    RTCPeerConnectionState::New => ConnectionState::New,
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
                        ConnectionState::Closed
                    }
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    _ => return,
                };
                sink.emit(LinkEvent::StateChanged(state));
            })
        }));

        info!(remote_id, "Peer connection created");
        Ok(Arc::new(RtcLink {
            remote_id: remote_id.to_string(),
            pc,
        }))
    }
}

/// One webrtc-rs peer connection
pub struct RtcLink {
    remote_id: String,
    pc: Arc<RTCPeerConnection>,
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(|e| Error::SdpError(format!("Failed to parse description: {}", e)))
}

#[async_trait]
impl PeerLink for RtcLink {
    async fn add_track(&self, track: &LocalTrack) -> Result<Arc<dyn OutboundSender>> {
        let sender = self
            .pc
            .add_track(track.rtp_track())
            .await
            .map_err(|e| {
                Error::MediaTrackError(format!("Failed to add {} track: {}", track.kind(), e))
            })?;

        // RTCP must be drained for interceptors (NACK, reports) to work.
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        debug!(remote_id = %self.remote_id, "{} track attached", track.kind());
        Ok(Arc::new(RtcSender {
            kind: track.kind(),
            sender,
        }))
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        info!("Closing peer connection for peer {}", self.remote_id);
        self.pc.close().await.map_err(|e| {
            Error::PeerConnectionError(format!("Failed to close connection: {}", e))
        })
    }
}

/// webrtc-rs RTP sender
pub struct RtcSender {
    kind: TrackKind,
    sender: Arc<RTCRtpSender>,
}

#[async_trait]
impl OutboundSender for RtcSender {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<()> {
        self.sender
            .replace_track(Some(track.rtp_track()))
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to replace track: {}", e)))
    }
}
