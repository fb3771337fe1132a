//! In-process relay that behaves like the room signaling server
//!
//! Used by tests and local demos. Every connected client gets a
//! [`SignalingChannel`]; the relay broadcasts negotiation events to every
//! other member of the room and stamps `fromUserId` from the identity the
//! client connected with, so receivers must filter on `targetUserId`.
//!
//! # Example
//!
//! ```
//! use call_mesh::signaling::{
//!     ChannelEvent, InboundEvent, MemoryRelay, OutboundEvent, RoomRef, SignalSink,
//! };
//!
//! # tokio_test::block_on(async {
//! let relay = MemoryRelay::new();
//! let (channel, mut events) = relay.connect("a1");
//! assert!(matches!(events.recv().await, Some(ChannelEvent::Connected)));
//!
//! channel
//!     .send(OutboundEvent::CallJoin(RoomRef { room_id: "r1".to_string() }))
//!     .unwrap();
//! match events.recv().await {
//!     Some(ChannelEvent::Event(InboundEvent::CallParticipants(payload))) => {
//!         assert_eq!(payload.participants, vec!["a1".to_string()]);
//!     }
//!     other => panic!("unexpected {:?}", other),
//! }
//! # });
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::channel::{ChannelEvent, ChannelEvents, SignalingChannel};
use super::protocol::{
    Caller, CandidateSignal, DescriptionSignal, EndedPayload, InboundEvent, IncomingCallPayload,
    OutboundEvent, ParticipantsPayload, UserRef,
};

type ClientId = u64;

/// One event received by the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRecord {
    /// Authenticated sender
    pub user_id: String,
    /// What it sent
    pub event: OutboundEvent,
}

struct Client {
    user_id: String,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

#[derive(Default)]
struct RelayState {
    next_id: ClientId,
    clients: HashMap<ClientId, Client>,
    /// room key -> clients that sent join_room
    rooms: HashMap<String, Vec<ClientId>>,
    /// room key -> call roster in join order
    calls: HashMap<String, Vec<(ClientId, String)>>,
    history: Vec<RelayRecord>,
    /// (sender, event name) pairs to swallow once
    drops: Vec<(String, &'static str)>,
}

/// Broadcast relay shared by every in-process client
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    /// Create an empty relay
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a client authenticated as `user_id`
    ///
    /// Must be called inside a tokio runtime.
    pub fn connect(&self, user_id: &str) -> (SignalingChannel, ChannelEvents) {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundEvent>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let _ = event_tx.send(ChannelEvent::Connected);

        let client_id = {
            let mut state = self.state.lock();
            state.next_id += 1;
            let id = state.next_id;
            state.clients.insert(
                id,
                Client {
                    user_id: user_id.to_string(),
                    events: event_tx,
                },
            );
            id
        };
        debug!(user_id, client_id, "Relay client connected");

        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                relay.handle(client_id, event);
            }
            relay.disconnect(client_id);
        });

        (SignalingChannel::new(out_tx, None), event_rx)
    }

    /// Every event received so far, in arrival order
    pub fn history(&self) -> Vec<RelayRecord> {
        self.state.lock().history.clone()
    }

    /// Current call roster of a room
    pub fn call_roster(&self, room_id: &str) -> Vec<String> {
        self.state
            .lock()
            .calls
            .get(room_id)
            .map(|members| members.iter().map(|(_, user)| user.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of clients whose channel is still open
    pub fn connected_clients(&self) -> usize {
        self.state.lock().clients.len()
    }

    /// Push an arbitrary event to every client of `user_id`
    ///
    /// Lets tests inject frames a real server might produce.
    pub fn inject(&self, user_id: &str, event: InboundEvent) {
        let state = self.state.lock();
        for client in state.clients.values().filter(|c| c.user_id == user_id) {
            let _ = client.events.send(ChannelEvent::Event(event.clone()));
        }
    }

    /// Swallow the next `event` (wire name) sent by `user_id`
    ///
    /// The event is still recorded in the history. Lets tests simulate a
    /// message lost in transit.
    pub fn drop_next(&self, user_id: &str, event: &'static str) {
        self.state.lock().drops.push((user_id.to_string(), event));
    }

    fn handle(&self, client_id: ClientId, event: OutboundEvent) {
        let mut state = self.state.lock();
        let Some(user_id) = state.clients.get(&client_id).map(|c| c.user_id.clone()) else {
            return;
        };
        state.history.push(RelayRecord {
            user_id: user_id.clone(),
            event: event.clone(),
        });
        if let Some(pos) = state
            .drops
            .iter()
            .position(|(user, name)| *user == user_id && *name == event.name())
        {
            state.drops.remove(pos);
            debug!(user_id = %user_id, event = event.name(), "Relay dropped event");
            return;
        }

        match event {
            OutboundEvent::JoinRoom(room_id) => {
                let members = state.rooms.entry(room_id).or_default();
                if !members.contains(&client_id) {
                    members.push(client_id);
                }
            }
            OutboundEvent::CallJoin(room) => {
                let roster = state.calls.entry(room.room_id.clone()).or_default();
                if !roster.iter().any(|(id, _)| *id == client_id) {
                    roster.push((client_id, user_id.clone()));
                }
                let participants = unique_users(roster);
                info!(room_id = %room.room_id, user_id = %user_id, "Relay: call join");

                state.send_to(
                    client_id,
                    InboundEvent::CallParticipants(ParticipantsPayload { participants }),
                );
                state.broadcast(
                    &room.room_id,
                    Some(client_id),
                    InboundEvent::CallJoined(UserRef {
                        user_id: Some(user_id),
                    }),
                );
            }
            OutboundEvent::CallLeave(room) => {
                state.leave_call(&room.room_id, client_id, &user_id);
            }
            OutboundEvent::CallEnd(room) => {
                state.calls.remove(&room.room_id);
                state.broadcast(
                    &room.room_id,
                    None,
                    InboundEvent::CallEnded(EndedPayload {
                        room_id: Some(room.room_id.clone()),
                    }),
                );
            }
            OutboundEvent::WebrtcOffer(signal) => {
                let room_id = signal.room_id.clone();
                let stamped = stamp_description(signal, &user_id);
                state.broadcast(&room_id, Some(client_id), InboundEvent::WebrtcOffer(stamped));
            }
            OutboundEvent::WebrtcAnswer(signal) => {
                let room_id = signal.room_id.clone();
                let stamped = stamp_description(signal, &user_id);
                state.broadcast(&room_id, Some(client_id), InboundEvent::WebrtcAnswer(stamped));
            }
            OutboundEvent::WebrtcIceCandidate(signal) => {
                let room_id = signal.room_id.clone();
                let stamped = CandidateSignal {
                    from_user_id: user_id,
                    ..signal
                };
                state.broadcast(
                    &room_id,
                    Some(client_id),
                    InboundEvent::WebrtcIceCandidate(stamped),
                );
            }
            OutboundEvent::CallInvite(room) => {
                state.broadcast(
                    &room.room_id,
                    Some(client_id),
                    InboundEvent::IncomingCall(IncomingCallPayload {
                        room_id: Some(room.room_id.clone()),
                        from: Some(Caller {
                            id: Some(user_id),
                            username: None,
                        }),
                    }),
                );
            }
            OutboundEvent::CallAccept(_) | OutboundEvent::CallReject(_) => {}
        }
    }

    fn disconnect(&self, client_id: ClientId) {
        let mut state = self.state.lock();
        let Some(client) = state.clients.remove(&client_id) else {
            return;
        };
        debug!(user_id = %client.user_id, client_id, "Relay client disconnected");

        let calls: Vec<String> = state
            .calls
            .iter()
            .filter(|(_, roster)| roster.iter().any(|(id, _)| *id == client_id))
            .map(|(room, _)| room.clone())
            .collect();
        for room_id in calls {
            state.leave_call(&room_id, client_id, &client.user_id);
        }
        for members in state.rooms.values_mut() {
            members.retain(|id| *id != client_id);
        }
    }
}

impl RelayState {
    fn send_to(&self, client_id: ClientId, event: InboundEvent) {
        if let Some(client) = self.clients.get(&client_id) {
            let _ = client.events.send(ChannelEvent::Event(event));
        }
    }

    fn broadcast(&self, room_id: &str, except: Option<ClientId>, event: InboundEvent) {
        let Some(members) = self.rooms.get(room_id) else {
            return;
        };
        for id in members.iter().filter(|id| Some(**id) != except) {
            self.send_to(*id, event.clone());
        }
    }

    fn leave_call(&mut self, room_id: &str, client_id: ClientId, user_id: &str) {
        let Some(roster) = self.calls.get_mut(room_id) else {
            return;
        };
        let before = roster.len();
        roster.retain(|(id, _)| *id != client_id);
        if roster.len() == before {
            return;
        }
        let still_present = roster.iter().any(|(_, user)| user == user_id);
        if roster.is_empty() {
            self.calls.remove(room_id);
        }
        if !still_present {
            self.broadcast(
                room_id,
                Some(client_id),
                InboundEvent::CallLeft(UserRef {
                    user_id: Some(user_id.to_string()),
                }),
            );
        }
    }
}

fn unique_users(roster: &[(ClientId, String)]) -> Vec<String> {
    let mut users: Vec<String> = Vec::with_capacity(roster.len());
    for (_, user) in roster {
        if !users.contains(user) {
            users.push(user.clone());
        }
    }
    users
}

fn stamp_description(signal: DescriptionSignal, user_id: &str) -> DescriptionSignal {
    DescriptionSignal {
        from_user_id: user_id.to_string(),
        ..signal
    }
}
