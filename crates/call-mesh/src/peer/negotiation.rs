//! Per-participant negotiation state

use crate::{Error, Result};

/// Whether `local_id` sends the offer to `remote_id`
///
/// The strictly lower id initiates; for any distinct pair exactly one side
/// gets `true`.
pub fn is_initiator(local_id: &str, remote_id: &str) -> bool {
    local_id < remote_id
}

/// Phases on the side that sends the offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatorPhase {
    /// Nothing sent yet
    Idle,
    /// Offer sent, waiting for the answer
    Offering,
    /// Answer applied
    Connected,
}

/// Phases on the side that only answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderPhase {
    /// No offer seen
    Idle,
    /// Offer queued, waiting for local media or a retry
    Buffered,
    /// Offer applied, answer being produced
    Answering,
    /// Answer sent
    Connected,
}

/// Negotiation with one remote participant
///
/// The role is fixed by the tie-break when the state is created, so an
/// offering responder cannot be represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    /// We send the offer
    Initiator(InitiatorPhase),
    /// We answer
    Responder(ResponderPhase),
}

impl Negotiation {
    /// Fresh state for a pair
    pub fn for_pair(local_id: &str, remote_id: &str) -> Self {
        if is_initiator(local_id, remote_id) {
            Negotiation::Initiator(InitiatorPhase::Idle)
        } else {
            Negotiation::Responder(ResponderPhase::Idle)
        }
    }

    /// Whether an offer may be sent now
    pub fn can_offer(&self) -> bool {
        matches!(self, Negotiation::Initiator(InitiatorPhase::Idle))
    }

    /// Whether remote candidates can be applied (remote description is set)
    pub fn accepts_candidates(&self) -> bool {
        matches!(
            self,
            Negotiation::Initiator(InitiatorPhase::Connected)
                | Negotiation::Responder(ResponderPhase::Answering)
                | Negotiation::Responder(ResponderPhase::Connected)
        )
    }

    /// Idle -> Offering
    pub fn begin_offer(&mut self) -> Result<()> {
        match self {
            Negotiation::Initiator(phase @ InitiatorPhase::Idle) => {
                *phase = InitiatorPhase::Offering;
                Ok(())
            }
            other => Err(illegal("begin_offer", other)),
        }
    }

    /// Offering -> Connected
    pub fn answer_applied(&mut self) -> Result<()> {
        match self {
            Negotiation::Initiator(phase @ InitiatorPhase::Offering) => {
                *phase = InitiatorPhase::Connected;
                Ok(())
            }
            other => Err(illegal("answer_applied", other)),
        }
    }

    /// Any responder phase -> Buffered
    pub fn offer_buffered(&mut self) -> Result<()> {
        match self {
            Negotiation::Responder(phase) => {
                *phase = ResponderPhase::Buffered;
                Ok(())
            }
            other => Err(illegal("offer_buffered", other)),
        }
    }

    /// Buffered -> Answering
    pub fn begin_answer(&mut self) -> Result<()> {
        match self {
            Negotiation::Responder(phase @ ResponderPhase::Buffered) => {
                *phase = ResponderPhase::Answering;
                Ok(())
            }
            other => Err(illegal("begin_answer", other)),
        }
    }

    /// Answering -> Connected
    pub fn answer_sent(&mut self) -> Result<()> {
        match self {
            Negotiation::Responder(phase @ ResponderPhase::Answering) => {
                *phase = ResponderPhase::Connected;
                Ok(())
            }
            other => Err(illegal("answer_sent", other)),
        }
    }

    /// Back to the phase that lets the next opportunity retry
    pub fn reset_after_failure(&mut self) {
        match self {
            Negotiation::Initiator(phase) => *phase = InitiatorPhase::Idle,
            Negotiation::Responder(phase) => *phase = ResponderPhase::Buffered,
        }
    }
}

fn illegal(transition: &str, state: &Negotiation) -> Error {
    Error::NegotiationError(format!("{} from {:?}", transition, state))
}
