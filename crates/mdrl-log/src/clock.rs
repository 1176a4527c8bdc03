//! Hybrid Lamport clock used to order entries.
//!
//! A [`Timestamp`] pairs wall time with a logical counter. A [`LamportClock`]
//! tags the timestamp with the public key of the writer that produced it, so
//! concurrent writes from different identities still have a total order.

use crate::identity::PublicSignKey;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall time in nanoseconds plus a logical counter.
///
/// The derived ordering compares `wall_time` first and `logical` second.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub wall_time: u64,
    pub logical: u32,
}

impl Timestamp {
    pub fn new(wall_time: u64, logical: u32) -> Self {
        Timestamp { wall_time, logical }
    }

    /// Current wall time with a zero logical counter.
    pub fn now() -> Self {
        Timestamp::new(now_nanos(), 0)
    }
}

/// Nanoseconds since the Unix epoch, saturating on clock errors.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}

/// A timestamp owned by a writer identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LamportClock {
    pub id: PublicSignKey,
    pub timestamp: Timestamp,
}

impl LamportClock {
    /// Fresh clock for `id` at the current wall time.
    pub fn new(id: PublicSignKey) -> Self {
        LamportClock {
            id,
            timestamp: Timestamp::now(),
        }
    }

    pub fn with_timestamp(id: PublicSignKey, timestamp: Timestamp) -> Self {
        LamportClock { id, timestamp }
    }

    /// Moves past `from`: the logical counter becomes `from.logical + 1` and
    /// wall time never drops below what `from` has already seen.
    pub fn advance(&self, from: &LamportClock) -> LamportClock {
        self.advance_at(from, now_nanos())
    }

    /// [`advance`](Self::advance) with an injected wall time.
    pub fn advance_at(&self, from: &LamportClock, now: u64) -> LamportClock {
        LamportClock {
            id: self.id,
            timestamp: Timestamp {
                wall_time: now.max(from.timestamp.wall_time),
                logical: from.timestamp.logical.saturating_add(1),
            },
        }
    }
}

impl Ord for LamportClock {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for LamportClock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> PublicSignKey {
        PublicSignKey::from_bytes([byte; 32])
    }

    #[test]
    fn test_timestamp_order() {
        assert!(Timestamp::new(1, 5) < Timestamp::new(2, 0));
        assert!(Timestamp::new(2, 0) < Timestamp::new(2, 1));
        assert_eq!(Timestamp::new(3, 3).cmp(&Timestamp::new(3, 3)), Ordering::Equal);
    }

    #[test]
    fn test_advance_increments_logical() {
        let from = LamportClock::with_timestamp(key(1), Timestamp::new(100, 7));
        let mine = LamportClock::with_timestamp(key(2), Timestamp::new(0, 0));
        let next = mine.advance_at(&from, 50);
        assert_eq!(next.id, key(2));
        assert_eq!(next.timestamp.logical, 8);
        // wall time never regresses below the observed clock
        assert_eq!(next.timestamp.wall_time, 100);
        assert!(next > from);
    }

    #[test]
    fn test_advance_takes_newer_wall_time() {
        let from = LamportClock::with_timestamp(key(1), Timestamp::new(100, 0));
        let next = from.advance_at(&from, 500);
        assert_eq!(next.timestamp, Timestamp::new(500, 1));
    }

    #[test]
    fn test_ties_broken_by_id() {
        let a = LamportClock::with_timestamp(key(1), Timestamp::new(10, 1));
        let b = LamportClock::with_timestamp(key(2), Timestamp::new(10, 1));
        assert!(a < b);
    }

    #[test]
    fn test_chained_advance_is_strictly_increasing() {
        let mut clock = LamportClock::with_timestamp(key(9), Timestamp::new(1_000, 0));
        for now in [900, 800, 2_000, 1_500] {
            let next = clock.advance_at(&clock, now);
            assert!(next > clock);
            clock = next;
        }
        assert_eq!(clock.timestamp.logical, 4);
    }
}
