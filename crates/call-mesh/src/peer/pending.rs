//! Offers and candidates that arrived before they could be processed

use std::collections::HashMap;

use crate::signaling::{IceCandidate, SessionDescription};

#[derive(Debug, Clone)]
struct PendingOffer {
    seq: u64,
    sdp: SessionDescription,
}

/// Per-sender buffers
///
/// At most one offer per sender is held; a newer offer overwrites an
/// unconsumed older one. Candidates are kept in receipt order without a cap.
#[derive(Debug, Default)]
pub struct PendingSignals {
    offers: HashMap<String, PendingOffer>,
    candidates: HashMap<String, Vec<IceCandidate>>,
    next_seq: u64,
}

impl PendingSignals {
    /// Create empty buffers
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer an offer; returns `true` if it superseded an older one
    pub fn put_offer(&mut self, from: &str, sdp: SessionDescription) -> bool {
        self.next_seq += 1;
        self.offers
            .insert(
                from.to_string(),
                PendingOffer {
                    seq: self.next_seq,
                    sdp,
                },
            )
            .is_some()
    }

    /// Buffered offers in receipt order
    pub fn offers(&self) -> Vec<(String, SessionDescription)> {
        let mut offers: Vec<(&String, &PendingOffer)> = self.offers.iter().collect();
        offers.sort_by_key(|(_, offer)| offer.seq);
        offers
            .into_iter()
            .map(|(from, offer)| (from.clone(), offer.sdp.clone()))
            .collect()
    }

    /// Whether an offer from `from` is waiting
    pub fn has_offer(&self, from: &str) -> bool {
        self.offers.contains_key(from)
    }

    /// Discard a consumed offer
    pub fn remove_offer(&mut self, from: &str) {
        self.offers.remove(from);
    }

    /// Append a candidate to `from`'s buffer
    pub fn push_candidate(&mut self, from: &str, candidate: IceCandidate) {
        self.candidates
            .entry(from.to_string())
            .or_default()
            .push(candidate);
    }

    /// Take every buffered candidate for `from`, oldest first
    pub fn take_candidates(&mut self, from: &str) -> Vec<IceCandidate> {
        self.candidates.remove(from).unwrap_or_default()
    }

    /// Put candidates back in front of anything buffered since they were taken
    pub fn restore_candidates(&mut self, from: &str, mut taken: Vec<IceCandidate>) {
        if taken.is_empty() {
            return;
        }
        if let Some(newer) = self.candidates.remove(from) {
            taken.extend(newer);
        }
        self.candidates.insert(from.to_string(), taken);
    }

    /// Number of candidates buffered for `from`
    pub fn candidate_count(&self, from: &str) -> usize {
        self.candidates.get(from).map_or(0, Vec::len)
    }

    /// Drop everything buffered for one sender
    pub fn clear_peer(&mut self, from: &str) {
        self.offers.remove(from);
        self.candidates.remove(from);
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.offers.clear();
        self.candidates.clear();
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.offers.is_empty() && self.candidates.is_empty()
    }
}
