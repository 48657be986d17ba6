//! Queue of outbound stanzas the server has not acknowledged yet.
//!
//! Entries carry the sequence number they were assigned when handed to the
//! transport. Sequence numbers wrap at 2^32, so every comparison goes
//! through [`sequence_lte`].

use std::collections::VecDeque;

use tokio::time::Instant;

use crate::error::StreamManagementError;
use crate::stanza::Stanza;

/// An outbound stanza waiting for the server's acknowledgment.
#[derive(Debug, Clone, PartialEq)]
pub struct UnackedStanza {
    pub sequence: u32,
    pub stanza: Stanza,
    pub sent_at: Instant,
}

#[derive(Debug)]
pub struct UnackedQueue {
    stanzas: VecDeque<UnackedStanza>,
    capacity: usize,
}

impl UnackedQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            stanzas: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append a stanza. A full queue rejects the stanza instead of dropping
    /// the oldest entry, since dropping would break `h` accounting.
    pub fn push(
        &mut self,
        sequence: u32,
        stanza: Stanza,
        sent_at: Instant,
    ) -> Result<(), StreamManagementError> {
        if self.is_full() {
            return Err(StreamManagementError::QueueFull {
                capacity: self.capacity,
            });
        }

        self.stanzas.push_back(UnackedStanza {
            sequence,
            stanza,
            sent_at,
        });
        Ok(())
    }

    /// Remove and return every entry with sequence <= `h`, oldest first.
    pub fn acknowledge(&mut self, h: u32) -> Vec<UnackedStanza> {
        let mut acked = Vec::new();
        while let Some(front) = self.stanzas.front() {
            if !sequence_lte(front.sequence, h) {
                break;
            }
            if let Some(entry) = self.stanzas.pop_front() {
                acked.push(entry);
            }
        }
        acked
    }

    pub fn unacked_after(&self, h: u32) -> impl Iterator<Item = &UnackedStanza> {
        self.stanzas
            .iter()
            .filter(move |entry| sequence_gt(entry.sequence, h))
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.stanzas
            .iter()
            .any(|entry| entry.stanza.id() == Some(id))
    }

    pub fn drain(&mut self) -> Vec<UnackedStanza> {
        self.stanzas.drain(..).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UnackedStanza> {
        self.stanzas.iter()
    }

    pub fn len(&self) -> usize {
        self.stanzas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stanzas.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.stanzas.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Half the capacity. Crossing it forces an ack request so the queue
    /// drains before it fills.
    pub fn high_water_mark(&self) -> usize {
        (self.capacity / 2).max(1)
    }

    pub fn clear(&mut self) {
        self.stanzas.clear();
    }

    pub fn oldest_sequence(&self) -> Option<u32> {
        self.stanzas.front().map(|s| s.sequence)
    }

    pub fn newest_sequence(&self) -> Option<u32> {
        self.stanzas.back().map(|s| s.sequence)
    }
}

/// Check if sequence a <= b, handling wrap-around.
///
/// `a` is at or before `b` when the forward distance from `a` to `b` is
/// less than 2^31.
pub(crate) fn sequence_lte(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) < 0x8000_0000
}

pub(crate) fn sequence_gt(a: u32, b: u32) -> bool {
    !sequence_lte(a, b)
}
