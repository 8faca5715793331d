//! Sliding send window

use std::collections::BTreeMap;
use std::time::Duration;

use crate::messages::Envelope;

#[derive(Debug)]
struct InFlight {
    envelope: Envelope,
    sent_at: Duration,
    retransmits: u32,
}

/// Unacknowledged envelopes of one session, keyed by sequence number
#[derive(Debug)]
pub struct SendWindow {
    capacity: usize,
    in_flight: BTreeMap<u64, InFlight>,
    retransmissions: u64,
}

impl SendWindow {
    /// Empty window holding at most `capacity` entries (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            in_flight: BTreeMap::new(),
            retransmissions: 0,
        }
    }

    /// Maximum entries in flight
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries awaiting acknowledgment
    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether nothing is awaiting acknowledgment
    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Whether another entry would exceed the window
    pub fn is_full(&self) -> bool {
        self.in_flight.len() >= self.capacity
    }

    /// Track a just-sent envelope
    ///
    /// Callers must check [`is_full`](Self::is_full) first.
    pub fn insert(&mut self, seq: u64, envelope: Envelope, now: Duration) {
        debug_assert!(!self.is_full(), "send window overrun");
        self.in_flight.insert(
            seq,
            InFlight {
                envelope,
                sent_at: now,
                retransmits: 0,
            },
        );
    }

    /// Acknowledge `seq`; `false` for duplicates and unknown numbers
    pub fn ack(&mut self, seq: u64) -> bool {
        self.in_flight.remove(&seq).is_some()
    }

    /// Earliest time an unacknowledged entry times out
    pub fn next_deadline(&self, ack_timeout: Duration) -> Option<Duration> {
        self.in_flight
            .values()
            .map(|f| f.sent_at + ack_timeout)
            .min()
    }

    /// Envelopes to resend because an acknowledgment is overdue
    ///
    /// Returns every unacknowledged entry from the oldest overdue one onward,
    /// in sequence order, and marks them resent at `now`. Fails with the
    /// sequence number of an entry that would exceed `max_retransmits`.
    pub fn take_overdue(
        &mut self,
        now: Duration,
        ack_timeout: Duration,
        max_retransmits: u32,
    ) -> Result<Vec<Envelope>, u64> {
        let Some(first_overdue) = self
            .in_flight
            .iter()
            .find(|(_, f)| f.sent_at + ack_timeout <= now)
            .map(|(seq, _)| *seq)
        else {
            return Ok(Vec::new());
        };

        let mut resend = Vec::new();
        for (seq, flight) in self.in_flight.range_mut(first_overdue..) {
            if flight.retransmits >= max_retransmits {
                return Err(*seq);
            }
            flight.retransmits += 1;
            flight.sent_at = now;
            resend.push(flight.envelope.clone());
        }
        self.retransmissions += resend.len() as u64;
        Ok(resend)
    }

    /// Total envelopes resent over the session
    pub fn retransmissions(&self) -> u64 {
        self.retransmissions
    }
}
