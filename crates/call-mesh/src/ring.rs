//! Call invitations from the long-lived notification channel

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::signaling::protocol::{Caller, InboundEvent, RoomRef};
use crate::signaling::{OutboundEvent, SignalSink};
use crate::Result;

/// An invitation waiting for accept or reject
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInvite {
    /// Room being called
    pub room_id: String,
    /// Who is calling, when the relay says
    pub from: Option<Caller>,
}

/// Consumes `incoming_call` / `call_ended` and emits ring responses
pub struct RingListener {
    user_id: String,
    sink: Arc<dyn SignalSink>,
    in_call: bool,
    pending: watch::Sender<Option<PendingInvite>>,
}

impl RingListener {
    /// Create a listener for `user_id` sending through `sink`
    pub fn new(user_id: &str, sink: Arc<dyn SignalSink>) -> Self {
        let (pending, _) = watch::channel(None);
        Self {
            user_id: user_id.to_string(),
            sink,
            in_call: false,
            pending,
        }
    }

    /// Invitations are ignored while a call view is open
    pub fn set_in_call(&mut self, in_call: bool) {
        self.in_call = in_call;
    }

    /// Current invitation
    pub fn pending(&self) -> Option<PendingInvite> {
        self.pending.borrow().clone()
    }

    /// Subscribe to invitation changes
    pub fn subscribe(&self) -> watch::Receiver<Option<PendingInvite>> {
        self.pending.subscribe()
    }

    /// Feed one notification-channel event
    pub fn handle(&self, event: &InboundEvent) {
        match event {
            InboundEvent::IncomingCall(payload) => {
                let Some(room_id) = payload.room_id.clone() else {
                    return;
                };
                let from_self = payload
                    .from
                    .as_ref()
                    .and_then(|c| c.id.as_deref())
                    .is_some_and(|id| id == self.user_id);
                if from_self || self.in_call {
                    debug!(room_id = %room_id, from_self, in_call = self.in_call, "Ignoring ring");
                    return;
                }
                info!(room_id = %room_id, "Incoming call");
                self.pending.send_replace(Some(PendingInvite {
                    room_id,
                    from: payload.from.clone(),
                }));
            }
            InboundEvent::CallEnded(payload) => {
                let Some(room_id) = payload.room_id.as_deref() else {
                    return;
                };
                self.pending.send_if_modified(|pending| {
                    if pending.as_ref().is_some_and(|p| p.room_id == room_id) {
                        *pending = None;
                        true
                    } else {
                        false
                    }
                });
            }
            _ => {}
        }
    }

    /// Accept the pending invitation; returns the room to join
    pub fn accept(&self) -> Result<Option<String>> {
        let Some(invite) = self.pending.send_replace(None) else {
            return Ok(None);
        };
        self.sink.send(OutboundEvent::CallAccept(RoomRef {
            room_id: invite.room_id.clone(),
        }))?;
        Ok(Some(invite.room_id))
    }

    /// Reject the pending invitation
    pub fn reject(&self) -> Result<()> {
        let Some(invite) = self.pending.send_replace(None) else {
            return Ok(());
        };
        self.sink.send(OutboundEvent::CallReject(RoomRef {
            room_id: invite.room_id,
        }))
    }

    /// Ring the other members of `room_id`
    pub fn invite(&self, room_id: &str) -> Result<()> {
        if room_id.is_empty() {
            return Ok(());
        }
        self.sink.send(OutboundEvent::CallInvite(RoomRef {
            room_id: room_id.to_string(),
        }))
    }
}
