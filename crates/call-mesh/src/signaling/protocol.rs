//! Wire format for the room signaling channel
//!
//! Every frame is a JSON text message `{"event": "<name>", "data": <payload>}`.
//! Payload field names are camelCase.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::{Error, Result};

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Initiating description
    Offer,
    /// Reply to an offer
    Answer,
}

/// Session description as exchanged over the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// offer or answer
    #[serde(rename = "type")]
    pub kind: SdpType,
    /// Raw SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Network candidate in its JSON init form
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,
    /// Media stream identification tag
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Media line index
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Payload carrying only the room key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    /// Room key
    pub room_id: String,
}

/// Offer or answer routed to one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptionSignal {
    /// Room key
    pub room_id: String,
    /// Intended recipient
    pub target_user_id: String,
    /// Sender
    #[serde(default)]
    pub from_user_id: String,
    /// Session description
    pub sdp: SessionDescription,
}

/// Candidate routed to one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateSignal {
    /// Room key
    pub room_id: String,
    /// Intended recipient
    pub target_user_id: String,
    /// Sender
    #[serde(default)]
    pub from_user_id: String,
    /// Candidate
    pub candidate: IceCandidate,
}

/// Caller identity attached to an incoming ring
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    /// Caller user id
    #[serde(default)]
    pub id: Option<String>,
    /// Caller display name
    #[serde(default)]
    pub username: Option<String>,
}

/// Events emitted by this side
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    /// Generic room membership; data is the bare room id
    JoinRoom(String),
    /// Enter the call context of a room
    CallJoin(RoomRef),
    /// Leave the call context
    CallLeave(RoomRef),
    /// End the call for everyone
    CallEnd(RoomRef),
    /// Session offer
    WebrtcOffer(DescriptionSignal),
    /// Session answer
    WebrtcAnswer(DescriptionSignal),
    /// Trickled candidate
    WebrtcIceCandidate(CandidateSignal),
    /// Accept a ring
    CallAccept(RoomRef),
    /// Reject a ring
    CallReject(RoomRef),
    /// Ring the other members of a room
    CallInvite(RoomRef),
}

impl OutboundEvent {
    /// Event name as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::JoinRoom(_) => "join_room",
            OutboundEvent::CallJoin(_) => "call_join",
            OutboundEvent::CallLeave(_) => "call_leave",
            OutboundEvent::CallEnd(_) => "call_end",
            OutboundEvent::WebrtcOffer(_) => "webrtc_offer",
            OutboundEvent::WebrtcAnswer(_) => "webrtc_answer",
            OutboundEvent::WebrtcIceCandidate(_) => "webrtc_ice_candidate",
            OutboundEvent::CallAccept(_) => "call_accept",
            OutboundEvent::CallReject(_) => "call_reject",
            OutboundEvent::CallInvite(_) => "call_invite",
        }
    }

    /// Serialize to a wire frame
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::SerializationError(e.to_string()))
    }

    /// Parse a frame written by a client (used by relays)
    pub fn from_json(json: &str) -> Result<Option<Self>> {
        let envelope = RawEnvelope::parse(json)?;
        let event = match envelope.event.as_str() {
            "join_room" => OutboundEvent::JoinRoom(envelope.payload()?),
            "call_join" => OutboundEvent::CallJoin(envelope.payload()?),
            "call_leave" => OutboundEvent::CallLeave(envelope.payload()?),
            "call_end" => OutboundEvent::CallEnd(envelope.payload()?),
            "webrtc_offer" => OutboundEvent::WebrtcOffer(envelope.payload()?),
            "webrtc_answer" => OutboundEvent::WebrtcAnswer(envelope.payload()?),
            "webrtc_ice_candidate" => OutboundEvent::WebrtcIceCandidate(envelope.payload()?),
            "call_accept" => OutboundEvent::CallAccept(envelope.payload()?),
            "call_reject" => OutboundEvent::CallReject(envelope.payload()?),
            "call_invite" => OutboundEvent::CallInvite(envelope.payload()?),
            other => {
                warn!(event = other, "Ignoring unknown client event");
                return Ok(None);
            }
        };
        Ok(Some(event))
    }
}

/// Authoritative roster snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantsPayload {
    /// Participant ids
    #[serde(default)]
    pub participants: Vec<String>,
}

/// Single participant join/leave
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    /// Participant id, may be absent on malformed frames
    #[serde(default)]
    pub user_id: Option<String>,
}

/// End of call; the room id is only present on the ring channel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndedPayload {
    /// Ended room
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
}

/// Ring for a call in another room
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCallPayload {
    /// Room being called
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    /// Who is calling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Caller>,
}

/// Events delivered by the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
    /// Full roster snapshot
    CallParticipants(ParticipantsPayload),
    /// Someone joined the call
    CallJoined(UserRef),
    /// Someone left the call
    CallLeft(UserRef),
    /// Call ended for everyone
    CallEnded(EndedPayload),
    /// Offer from a remote participant
    WebrtcOffer(DescriptionSignal),
    /// Answer from a remote participant
    WebrtcAnswer(DescriptionSignal),
    /// Candidate from a remote participant
    WebrtcIceCandidate(CandidateSignal),
    /// Ring from the notification channel
    IncomingCall(IncomingCallPayload),
}

impl InboundEvent {
    /// Serialize to a wire frame (used by relays)
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::SerializationError(e.to_string()))
    }

    /// Parse a frame from the relay
    ///
    /// Unknown events yield `Ok(None)`.
    pub fn from_json(json: &str) -> Result<Option<Self>> {
        let envelope = RawEnvelope::parse(json)?;
        let event = match envelope.event.as_str() {
            "call_participants" => InboundEvent::CallParticipants(envelope.payload_or_default()?),
            "call_joined" => InboundEvent::CallJoined(envelope.payload_or_default()?),
            "call_left" => InboundEvent::CallLeft(envelope.payload_or_default()?),
            "call_ended" => InboundEvent::CallEnded(envelope.payload_or_default()?),
            "webrtc_offer" => InboundEvent::WebrtcOffer(envelope.payload()?),
            "webrtc_answer" => InboundEvent::WebrtcAnswer(envelope.payload()?),
            "webrtc_ice_candidate" => InboundEvent::WebrtcIceCandidate(envelope.payload()?),
            "incoming_call" => InboundEvent::IncomingCall(envelope.payload_or_default()?),
            other => {
                warn!(event = other, "Ignoring unknown signaling event");
                return Ok(None);
            }
        };
        Ok(Some(event))
    }
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    event: String,
    #[serde(default)]
    data: Value,
}

impl RawEnvelope {
    fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::SerializationError(e.to_string()))
    }

    fn payload<T: serde::de::DeserializeOwned>(self) -> Result<T> {
        serde_json::from_value(self.data).map_err(|e| {
            Error::SerializationError(format!("invalid {} payload: {}", self.event, e))
        })
    }

    fn payload_or_default<T: serde::de::DeserializeOwned + Default>(self) -> Result<T> {
        if self.data.is_null() {
            return Ok(T::default());
        }
        self.payload()
    }
}
