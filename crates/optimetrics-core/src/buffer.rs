//! Delta-filtering snapshot buffer.
//!
//! A snapshot is kept only if at least one numeric field moved by the
//! configured relative threshold since the last *kept* snapshot, or became
//! non-zero. Retention is all-or-nothing per snapshot. Text fields never
//! take part in the comparison.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::model::Snapshot;

pub const DEFAULT_THRESHOLD_PERCENT: f64 = 2.0;
pub const DEFAULT_BATCH_SIZE: usize = 60;

#[derive(Default)]
struct Inner {
    retained: Vec<Snapshot>,
    /// Numeric fields of the last retained snapshot.
    last: Option<BTreeMap<String, f64>>,
    dropped: u64,
}

/// Shared between the collection loop (producer) and the flush path
/// (consumer); one lock guards every operation.
pub struct DeltaBuffer {
    threshold_percent: f64,
    batch_size: usize,
    inner: Mutex<Inner>,
}

impl DeltaBuffer {
    pub fn new(threshold_percent: f64, batch_size: usize) -> Self {
        Self {
            threshold_percent,
            batch_size: batch_size.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain data behind; keep going
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds a snapshot. Returns `true` if it was retained.
    pub fn add(&self, snapshot: Snapshot) -> bool {
        let mut inner = self.lock();
        let significant = match &inner.last {
            None => true,
            Some(last) => self.is_significant(last, &snapshot),
        };
        if !significant {
            inner.dropped += 1;
            return false;
        }

        inner.last = Some(
            snapshot
                .numeric_fields()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        );
        inner.retained.push(snapshot);
        true
    }

    fn is_significant(&self, last: &BTreeMap<String, f64>, snapshot: &Snapshot) -> bool {
        snapshot.numeric_fields().any(|(key, new)| match last.get(key) {
            Some(&old) if old != 0.0 => {
                (new - old).abs() / old.abs() * 100.0 >= self.threshold_percent
            }
            // Zero or absent before: only a non-zero value counts
            _ => new != 0.0,
        })
    }

    /// Drains every retained snapshot.
    pub fn get_batch(&self) -> Vec<Snapshot> {
        std::mem::take(&mut self.lock().retained)
    }

    pub fn is_full(&self) -> bool {
        self.lock().retained.len() >= self.batch_size
    }

    pub fn len(&self) -> usize {
        self.lock().retained.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshots rejected as insignificant since creation.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Forgets the comparison baseline; the next snapshot is always kept.
    pub fn reset(&self) {
        self.lock().last = None;
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl Default for DeltaBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD_PERCENT, DEFAULT_BATCH_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Arc;

    fn snap(seq: i64, fields: &[(&str, f64)]) -> Snapshot {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(seq);
        let mut s = Snapshot::new("dev", ts);
        for (k, v) in fields {
            s.insert(*k, *v);
        }
        s
    }

    #[test]
    fn test_first_snapshot_always_retained() {
        let buffer = DeltaBuffer::default();
        assert!(buffer.add(snap(0, &[])));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_small_change_is_dropped() {
        let buffer = DeltaBuffer::default();
        let s1 = snap(0, &[("cpu", 50.0), ("ram", 1000.0)]);
        assert!(buffer.add(s1.clone()));
        assert!(!buffer.add(snap(1, &[("cpu", 50.9), ("ram", 1010.0)])));

        assert_eq!(buffer.get_batch(), vec![s1]);
        assert!(buffer.is_empty());
        assert_eq!(buffer.dropped(), 1);
    }

    #[test]
    fn test_change_at_threshold_is_retained() {
        let buffer = DeltaBuffer::default();
        let s1 = snap(0, &[("cpu", 50.0), ("ram", 1000.0)]);
        let s2 = snap(1, &[("cpu", 51.0), ("ram", 1000.0)]);
        assert!(buffer.add(s1.clone()));
        assert!(buffer.add(s2.clone()));
        assert_eq!(buffer.get_batch(), vec![s1, s2]);
    }

    #[test]
    fn test_compares_against_last_retained() {
        let buffer = DeltaBuffer::default();
        buffer.add(snap(0, &[("cpu", 100.0)]));
        // Drift of 1% per tick: each step is small but the third crosses 2%
        assert!(!buffer.add(snap(1, &[("cpu", 101.0)])));
        assert!(!buffer.add(snap(2, &[("cpu", 101.5)])));
        assert!(buffer.add(snap(3, &[("cpu", 102.0)])));
    }

    #[test]
    fn test_newly_non_zero_and_new_fields() {
        let buffer = DeltaBuffer::default();
        buffer.add(snap(0, &[("io", 0.0)]));
        assert!(!buffer.add(snap(1, &[("io", 0.0)])));
        assert!(buffer.add(snap(2, &[("io", 0.1)])));
        assert!(buffer.add(snap(3, &[("io", 0.1), ("gpu", 5.0)])));
        // A new field that is zero is not a change
        assert!(!buffer.add(snap(4, &[("io", 0.1), ("gpu", 5.0), ("fan", 0.0)])));
    }

    #[test]
    fn test_text_fields_are_ignored() {
        let buffer = DeltaBuffer::default();
        let mut s1 = snap(0, &[("cpu", 10.0)]);
        s1.set_label("session_category", "idle");
        buffer.add(s1);
        let mut s2 = snap(1, &[("cpu", 10.0)]);
        s2.set_label("session_category", "gaming");
        assert!(!buffer.add(s2));
    }

    #[test]
    fn test_negative_values_use_magnitude() {
        let buffer = DeltaBuffer::default();
        buffer.add(snap(0, &[("delta", -100.0)]));
        assert!(!buffer.add(snap(1, &[("delta", -101.0)])));
        assert!(buffer.add(snap(2, &[("delta", -97.0)])));
    }

    #[test]
    fn test_is_full_and_reset() {
        let buffer = DeltaBuffer::new(2.0, 2);
        buffer.add(snap(0, &[("cpu", 1.0)]));
        assert!(!buffer.is_full());
        buffer.add(snap(1, &[("cpu", 2.0)]));
        assert!(buffer.is_full());
        assert_eq!(buffer.get_batch().len(), 2);
        assert!(!buffer.is_full());

        buffer.reset();
        assert!(buffer.add(snap(2, &[("cpu", 2.0)])));
    }

    #[test]
    fn test_concurrent_producer_and_consumer_never_lose_snapshots() {
        let buffer = Arc::new(DeltaBuffer::new(0.0, 10));
        let producer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                for i in 0..500 {
                    buffer.add(snap(i, &[("seq", i as f64 + 1.0)]));
                }
            })
        };

        let mut drained = 0;
        while drained < 500 {
            drained += buffer.get_batch().len();
            std::thread::yield_now();
        }
        producer.join().unwrap();
        assert_eq!(drained, 500);
        assert!(buffer.is_empty());
    }
}
