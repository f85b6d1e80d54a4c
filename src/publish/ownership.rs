//! Liveliness tracking and owner arbitration
//!
//! Pure state machine, fed with (publisher, strength, time) observations by
//! the subscriber side. A publisher is live while its last observed emission
//! is within the liveliness timeout; the live publisher with the highest
//! strength owns the channel. Every method takes the clock as a parameter so
//! failover timing is testable without sleeping.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Instance id as carried in the unit header
pub type PublisherId = [u8; 16];

#[derive(Debug, Clone)]
struct PublisherRecord {
    strength: i32,
    last_seen: Instant,
    last_sequence: u64,
}

/// Tracks the publishers observed on one channel and arbitrates ownership.
#[derive(Debug)]
pub struct OwnerTable {
    liveliness_timeout: Duration,
    records: HashMap<PublisherId, PublisherRecord>,
}

impl OwnerTable {
    pub fn new(liveliness_timeout: Duration) -> Self {
        Self {
            liveliness_timeout,
            records: HashMap::new(),
        }
    }

    /// Record an emission from a publisher.
    pub fn observe(&mut self, id: PublisherId, strength: i32, sequence: u64, now: Instant) {
        let record = self.records.entry(id).or_insert(PublisherRecord {
            strength,
            last_seen: now,
            last_sequence: sequence,
        });
        record.strength = strength;
        record.last_seen = now;
        record.last_sequence = sequence;
    }

    fn is_live(&self, record: &PublisherRecord, now: Instant) -> bool {
        now.duration_since(record.last_seen) <= self.liveliness_timeout
    }

    /// The highest-strength publisher observed within the liveliness window.
    ///
    /// When two live publishers share the top strength (a misconfiguration —
    /// see [`strength_conflict`](Self::strength_conflict)) the id ordering
    /// keeps the result deterministic rather than flapping per call.
    pub fn current_owner(&self, now: Instant) -> Option<(PublisherId, i32)> {
        self.records
            .iter()
            .filter(|(_, record)| self.is_live(record, now))
            .max_by_key(|(id, record)| (record.strength, std::cmp::Reverse(**id)))
            .map(|(id, record)| (*id, record.strength))
    }

    /// Returns a strength value claimed by more than one live publisher,
    /// if any. Redundant publishers must use distinct strengths.
    pub fn strength_conflict(&self, now: Instant) -> Option<i32> {
        let mut seen: HashMap<i32, u32> = HashMap::new();
        for record in self.records.values() {
            if self.is_live(record, now) {
                *seen.entry(record.strength).or_default() += 1;
            }
        }
        seen.into_iter()
            .find(|(_, count)| *count > 1)
            .map(|(strength, _)| strength)
    }

    /// Last sequence number observed from a publisher.
    pub fn last_sequence(&self, id: &PublisherId) -> Option<u64> {
        self.records.get(id).map(|r| r.last_sequence)
    }

    /// Drop records dead for several liveliness windows, so a channel that
    /// cycles through many restarts does not accumulate state forever.
    pub fn prune(&mut self, now: Instant) {
        let horizon = self.liveliness_timeout * 8;
        self.records
            .retain(|_, record| now.duration_since(record.last_seen) <= horizon);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(1000);

    fn id(byte: u8) -> PublisherId {
        [byte; 16]
    }

    #[test]
    fn strongest_live_publisher_owns_the_channel() {
        let mut table = OwnerTable::new(TIMEOUT);
        let t0 = Instant::now();

        table.observe(id(1), 10, 0, t0);
        table.observe(id(2), 5, 0, t0);

        let (owner, strength) = table.current_owner(t0 + Duration::from_millis(500)).unwrap();
        assert_eq!(owner, id(1));
        assert_eq!(strength, 10);
    }

    #[test]
    fn ownership_passes_when_the_owner_goes_silent() {
        let mut table = OwnerTable::new(TIMEOUT);
        let t0 = Instant::now();

        table.observe(id(1), 10, 100, t0);
        table.observe(id(2), 5, 40, t0);

        // strength 5 keeps emitting, strength 10 stops after t0
        let t1 = t0 + Duration::from_millis(1400);
        table.observe(id(2), 5, 80, t1);

        let (owner, strength) = table.current_owner(t1).unwrap();
        assert_eq!(owner, id(2));
        assert_eq!(strength, 5);
    }

    #[test]
    fn owner_returns_when_it_resumes_emitting() {
        let mut table = OwnerTable::new(TIMEOUT);
        let t0 = Instant::now();

        table.observe(id(1), 10, 0, t0);
        table.observe(id(2), 5, 0, t0);

        let t1 = t0 + Duration::from_millis(2000);
        table.observe(id(2), 5, 1, t1);
        assert_eq!(table.current_owner(t1).unwrap().0, id(2));

        let t2 = t1 + Duration::from_millis(100);
        table.observe(id(1), 10, 1, t2);
        assert_eq!(table.current_owner(t2).unwrap().0, id(1));
    }

    #[test]
    fn no_live_publisher_means_no_owner() {
        let mut table = OwnerTable::new(TIMEOUT);
        let t0 = Instant::now();

        table.observe(id(1), 10, 0, t0);
        assert!(table.current_owner(t0 + Duration::from_secs(5)).is_none());
    }

    #[test]
    fn silence_exactly_at_the_timeout_is_still_live() {
        let mut table = OwnerTable::new(TIMEOUT);
        let t0 = Instant::now();

        table.observe(id(1), 10, 0, t0);
        assert!(table.current_owner(t0 + TIMEOUT).is_some());
    }

    #[test]
    fn duplicate_strengths_are_reported() {
        let mut table = OwnerTable::new(TIMEOUT);
        let t0 = Instant::now();

        table.observe(id(1), 10, 0, t0);
        table.observe(id(2), 10, 0, t0);
        assert_eq!(table.strength_conflict(t0), Some(10));

        // once one of them dies, the conflict clears
        let t1 = t0 + Duration::from_millis(1500);
        table.observe(id(2), 10, 1, t1);
        assert_eq!(table.strength_conflict(t1), None);
    }

    #[test]
    fn prune_drops_long_dead_publishers() {
        let mut table = OwnerTable::new(TIMEOUT);
        let t0 = Instant::now();

        table.observe(id(1), 10, 7, t0);
        table.prune(t0 + Duration::from_secs(60));
        assert!(table.last_sequence(&id(1)).is_none());
    }
}
