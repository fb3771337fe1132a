//! Room membership tracking

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::signaling::protocol::{InboundEvent, RoomRef};
use crate::signaling::{OutboundEvent, SignalSink, SignalingChannel};

/// How a roster event changed the participant set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterChange {
    /// Nothing changed
    Unchanged,
    /// Participants were added or the snapshot was replaced
    Updated,
    /// One participant left
    Left(String),
    /// The call ended and the set was cleared
    Ended,
}

/// Joins a call room and tracks who is in it
///
/// Owns the signaling channel: teardown emits `call_leave` and closes it.
pub struct RoomTracker {
    room_id: String,
    user_id: String,
    channel: Arc<SignalingChannel>,
    participants: watch::Sender<Vec<String>>,
    torn_down: bool,
}

impl RoomTracker {
    /// Create a tracker; nothing is sent until the channel reports `Connected`
    pub fn new(room_id: &str, user_id: &str, channel: Arc<SignalingChannel>) -> Self {
        let (participants, _) = watch::channel(Vec::new());
        Self {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            channel,
            participants,
            torn_down: false,
        }
    }

    /// Room key
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Shared signaling channel
    pub fn channel(&self) -> Arc<SignalingChannel> {
        Arc::clone(&self.channel)
    }

    /// Current participant ids
    pub fn participants(&self) -> Vec<String> {
        self.participants.borrow().clone()
    }

    /// Subscribe to participant updates
    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.participants.subscribe()
    }

    /// Emit `join_room` and `call_join`; called on every (re)connect
    pub fn on_connected(&self) {
        if self.torn_down {
            return;
        }
        info!(room_id = %self.room_id, user_id = %self.user_id, "Joining call room");
        self.emit(OutboundEvent::JoinRoom(self.room_id.clone()));
        self.emit(OutboundEvent::CallJoin(self.room_ref()));
    }

    /// Apply a roster event; other events are left untouched
    pub fn apply(&self, event: &InboundEvent) -> RosterChange {
        match event {
            InboundEvent::CallParticipants(payload) => {
                let mut roster: Vec<String> = Vec::with_capacity(payload.participants.len());
                for id in &payload.participants {
                    if !roster.contains(id) {
                        roster.push(id.clone());
                    }
                }
                debug!(room_id = %self.room_id, count = roster.len(), "Roster snapshot");
                self.participants.send_replace(roster);
                RosterChange::Updated
            }
            InboundEvent::CallJoined(user) => {
                let Some(user_id) = user.user_id.as_deref() else {
                    return RosterChange::Unchanged;
                };
                let added = self.participants.send_if_modified(|roster| {
                    if roster.iter().any(|id| id == user_id) {
                        return false;
                    }
                    roster.push(user_id.to_string());
                    true
                });
                if added {
                    info!(room_id = %self.room_id, user_id, "Participant joined");
                    RosterChange::Updated
                } else {
                    RosterChange::Unchanged
                }
            }
            InboundEvent::CallLeft(user) => {
                let Some(user_id) = user.user_id.as_deref() else {
                    return RosterChange::Unchanged;
                };
                let removed = self.participants.send_if_modified(|roster| {
                    let before = roster.len();
                    roster.retain(|id| id != user_id);
                    roster.len() != before
                });
                if removed {
                    info!(room_id = %self.room_id, user_id, "Participant left");
                    RosterChange::Left(user_id.to_string())
                } else {
                    RosterChange::Unchanged
                }
            }
            InboundEvent::CallEnded(_) => {
                info!(room_id = %self.room_id, "Call ended");
                self.participants.send_replace(Vec::new());
                RosterChange::Ended
            }
            _ => RosterChange::Unchanged,
        }
    }

    /// Ask the relay to end the call for everyone
    pub fn end_call(&self) {
        if !self.torn_down {
            self.emit(OutboundEvent::CallEnd(self.room_ref()));
        }
    }

    /// Leave the room, close the channel and clear the roster; idempotent
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.emit(OutboundEvent::CallLeave(self.room_ref()));
        self.channel.close();
        self.participants.send_replace(Vec::new());
        debug!(room_id = %self.room_id, "Room tracker torn down");
    }

    fn room_ref(&self) -> RoomRef {
        RoomRef {
            room_id: self.room_id.clone(),
        }
    }

    fn emit(&self, event: OutboundEvent) {
        if let Err(e) = self.channel.send(event) {
            warn!(room_id = %self.room_id, "{}", e);
        }
    }
}

impl Drop for RoomTracker {
    fn drop(&mut self) {
        self.teardown();
    }
}
