//! Workload classification from a sliding window of snapshots.
//!
//! Only hardware metrics are used; nothing about processes or windows is
//! read.

pub mod features;
pub mod thresholds;

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::ClassificationConfig;
use crate::model::Snapshot;

pub use thresholds::{Band, CategoryRule, Features, ScoringFunction, ThresholdTable};

/// Snapshot label column carrying the current category.
pub const CATEGORY_LABEL: &str = "session_category";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionCategory {
    pub name: &'static str,
    /// Rounded to three decimals.
    pub confidence: f64,
    pub detected_at: DateTime<Utc>,
    /// Window averages the decision was made on.
    pub metrics: Features,
}

struct Window {
    samples: VecDeque<Features>,
    current: Option<SessionCategory>,
}

pub struct WorkloadClassifier {
    window_size: usize,
    min_samples: usize,
    confidence_threshold: f64,
    scorer: Box<dyn ScoringFunction>,
    window: Mutex<Window>,
}

impl WorkloadClassifier {
    pub fn new(config: &ClassificationConfig) -> Self {
        Self::with_scorer(config, Box::new(ThresholdTable::default()))
    }

    pub fn with_scorer(config: &ClassificationConfig, scorer: Box<dyn ScoringFunction>) -> Self {
        Self {
            window_size: config.window_size.max(1),
            min_samples: config.min_samples.max(1),
            confidence_threshold: config.confidence_threshold,
            scorer,
            window: Mutex::new(Window {
                samples: VecDeque::with_capacity(config.window_size),
                current: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds `snapshot` to the window and classifies the window.
    ///
    /// Returns `None` until the window holds enough samples, or when the
    /// best score is below the confidence threshold. The last confident
    /// category stays available through [`current`](Self::current).
    pub fn update(&self, snapshot: &Snapshot) -> Option<SessionCategory> {
        let sample = features::extract(snapshot);
        let mut window = self.lock();
        if window.samples.len() == self.window_size {
            window.samples.pop_front();
        }
        window.samples.push_back(sample);
        if window.samples.len() < self.min_samples {
            return None;
        }

        let averages = average(&window.samples);
        let (name, score) = self
            .scorer
            .score(&averages)
            .into_iter()
            .fold(None, |best: Option<(&'static str, f64)>, (name, score)| match best {
                Some((_, top)) if top >= score => best,
                _ => Some((name, score)),
            })?;

        if score < self.confidence_threshold {
            debug!(category = name, score, "classification below threshold");
            return None;
        }

        let category = SessionCategory {
            name,
            confidence: (score * 1000.0).round() / 1000.0,
            detected_at: Utc::now(),
            metrics: averages,
        };
        if window.current.as_ref().map(|c| c.name) != Some(name) {
            debug!(category = name, confidence = category.confidence, "session category changed");
        }
        window.current = Some(category.clone());
        Some(category)
    }

    pub fn current(&self) -> Option<SessionCategory> {
        self.lock().current.clone()
    }

    /// Clears the window. The current category is kept.
    pub fn reset(&self) {
        self.lock().samples.clear();
    }
}

/// Per-feature mean over the samples that have the feature.
fn average(samples: &VecDeque<Features>) -> Features {
    let mut sums: Features = Features::new();
    let mut counts = std::collections::BTreeMap::<&'static str, usize>::new();
    for sample in samples {
        for (name, value) in sample {
            *sums.entry(*name).or_default() += value;
            *counts.entry(*name).or_default() += 1;
        }
    }
    for (name, sum) in sums.iter_mut() {
        *sum /= counts[name] as f64;
    }
    sums
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(pairs: &[(&str, f64)]) -> Snapshot {
        let mut s = Snapshot::new("dev", Utc::now());
        for (k, v) in pairs {
            s.insert(*k, *v);
        }
        s
    }

    fn classifier() -> WorkloadClassifier {
        WorkloadClassifier::new(&ClassificationConfig::default())
    }

    #[test]
    fn test_needs_min_samples() {
        let c = classifier();
        let idle = snapshot(&[
            ("total_utilization", 2.0),
            ("gpu0_utilization", 2.0),
            ("disk_read_rate_mbps", 0.0),
            ("disk_write_rate_mbps", 0.0),
        ]);
        for _ in 0..4 {
            assert!(c.update(&idle).is_none());
        }
        let category = c.update(&idle).unwrap();
        assert_eq!(category.name, "idle");
        assert!(category.confidence >= 0.6);
        assert_eq!(c.current().unwrap().name, "idle");
    }

    #[test]
    fn test_gaming_beats_ai_training() {
        let c = classifier();
        let gaming = snapshot(&[
            ("gpu0_utilization", 85.0),
            ("total_utilization", 55.0),
            ("gpu0_vram_percent", 70.0),
            ("gpu0_power_watts", 225.0),
            ("gpu0_power_limit_watts", 300.0),
        ]);
        let mut last = None;
        for _ in 0..5 {
            last = c.update(&gaming);
        }
        let category = last.unwrap();
        assert_eq!(category.name, "gaming");
        assert_eq!(category.metrics.get(features::GPU_UTILIZATION), Some(&85.0));
    }

    #[test]
    fn test_low_confidence_keeps_previous_category() {
        let c = classifier();
        let idle = snapshot(&[("total_utilization", 2.0), ("gpu0_utilization", 2.0)]);
        for _ in 0..5 {
            c.update(&idle);
        }
        assert_eq!(c.current().unwrap().name, "idle");

        c.reset();
        let saturated = snapshot(&[
            ("total_utilization", 100.0),
            ("gpu0_utilization", 100.0),
            ("ram_percent", 100.0),
        ]);
        for _ in 0..5 {
            assert!(c.update(&saturated).is_none());
        }
        assert_eq!(c.current().unwrap().name, "idle");
    }

    #[test]
    fn test_window_is_bounded() {
        let config = ClassificationConfig {
            window_size: 5,
            ..ClassificationConfig::default()
        };
        let c = WorkloadClassifier::new(&config);
        let busy = snapshot(&[("total_utilization", 100.0), ("gpu0_utilization", 100.0), ("ram_percent", 100.0)]);
        for _ in 0..5 {
            c.update(&busy);
        }
        // Five idle samples push every busy one out of the window
        let idle = snapshot(&[("total_utilization", 2.0), ("gpu0_utilization", 2.0), ("ram_percent", 25.0)]);
        let mut last = None;
        for _ in 0..5 {
            last = c.update(&idle);
        }
        let category = last.unwrap();
        assert_eq!(category.metrics.get(features::CPU_UTILIZATION), Some(&2.0));
    }

    #[test]
    fn test_average_skips_missing() {
        let mut samples = VecDeque::new();
        samples.push_back(Features::from([("a", 1.0)]));
        samples.push_back(Features::from([("a", 3.0), ("b", 10.0)]));
        let avg = average(&samples);
        assert_eq!(avg.get("a"), Some(&2.0));
        assert_eq!(avg.get("b"), Some(&10.0));
    }
}
