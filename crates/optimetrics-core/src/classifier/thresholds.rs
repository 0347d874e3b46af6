use std::collections::BTreeMap;

/// Averaged classifier inputs, keyed by feature name.
pub type Features = BTreeMap<&'static str, f64>;

/// Scores how well averaged features match each category.
pub trait ScoringFunction: Send + Sync {
    /// Scores in `[0, 1]`, in a fixed category order. Ties go to the
    /// earlier category.
    fn score(&self, features: &Features) -> Vec<(&'static str, f64)>;
}

/// Inclusive band `[min, max]` for one feature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    pub feature: &'static str,
    pub min: f64,
    pub max: f64,
}

const fn band(feature: &'static str, min: f64, max: f64) -> Band {
    Band { feature, min, max }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CategoryRule {
    pub name: &'static str,
    pub bands: Vec<Band>,
}

/// Range-based scoring. A feature inside its band earns
/// `1 - 0.3 * distance_from_center / half_width`, outside it earns nothing.
/// The category score is the mean over the bands whose feature is present.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdTable {
    rules: Vec<CategoryRule>,
}

impl ThresholdTable {
    pub fn new(rules: Vec<CategoryRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[CategoryRule] {
        &self.rules
    }

    fn score_rule(rule: &CategoryRule, features: &Features) -> f64 {
        let mut matched = 0.0;
        let mut total = 0usize;
        for band in &rule.bands {
            let Some(&value) = features.get(band.feature) else {
                continue;
            };
            total += 1;
            if value < band.min || value > band.max {
                continue;
            }
            let half = (band.max - band.min) / 2.0;
            if half > 0.0 {
                let center = band.min + half;
                matched += 1.0 - 0.3 * (value - center).abs() / half;
            } else {
                matched += 1.0;
            }
        }
        if total == 0 { 0.0 } else { matched / total as f64 }
    }
}

impl Default for ThresholdTable {
    fn default() -> Self {
        use super::features::*;
        let rule = |name, bands: &[Band]| CategoryRule {
            name,
            bands: bands.to_vec(),
        };
        Self::new(vec![
            rule("gaming", &[
                band(GPU_UTILIZATION, 60.0, 100.0),
                band(CPU_UTILIZATION, 30.0, 90.0),
                band(VRAM_PERCENT, 40.0, 100.0),
                band(GPU_POWER_RATIO, 0.5, 1.0),
            ]),
            rule("ai_training", &[
                band(GPU_UTILIZATION, 80.0, 100.0),
                band(VRAM_PERCENT, 60.0, 100.0),
                band(CPU_UTILIZATION, 20.0, 80.0),
                band(GPU_COMPUTE_PROCESSES, 1.0, 100.0),
            ]),
            rule("cad_3d_modeling", &[
                band(GPU_UTILIZATION, 30.0, 90.0),
                band(CPU_UTILIZATION, 40.0, 90.0),
                band(RAM_PERCENT, 40.0, 90.0),
            ]),
            rule("graphics_design", &[
                band(GPU_UTILIZATION, 20.0, 70.0),
                band(CPU_UTILIZATION, 30.0, 80.0),
                band(RAM_PERCENT, 40.0, 85.0),
            ]),
            rule("video_editing", &[
                band(GPU_ENCODER_UTILIZATION, 10.0, 100.0),
                band(DISK_WRITE_RATE, 5.0, 500.0),
                band(CPU_UTILIZATION, 40.0, 95.0),
            ]),
            rule("coding_development", &[
                band(GPU_UTILIZATION, 0.0, 30.0),
                band(CPU_UTILIZATION, 10.0, 60.0),
                band(RAM_PERCENT, 30.0, 80.0),
            ]),
            rule("document_editing", &[
                band(GPU_UTILIZATION, 0.0, 20.0),
                band(CPU_UTILIZATION, 5.0, 40.0),
                band(RAM_PERCENT, 20.0, 60.0),
            ]),
            rule("web_browsing", &[
                band(GPU_UTILIZATION, 0.0, 40.0),
                band(CPU_UTILIZATION, 5.0, 50.0),
                band(NET_ACTIVITY, 1.0, 1000.0),
            ]),
            rule("idle", &[
                band(GPU_UTILIZATION, 0.0, 10.0),
                band(CPU_UTILIZATION, 0.0, 10.0),
                band(DISK_IO_RATE, 0.0, 1.0),
            ]),
            rule("system_maintenance", &[
                band(DISK_WRITE_RATE, 10.0, 500.0),
                band(CPU_UTILIZATION, 30.0, 100.0),
                band(GPU_UTILIZATION, 0.0, 30.0),
            ]),
        ])
    }
}

impl ScoringFunction for ThresholdTable {
    fn score(&self, features: &Features) -> Vec<(&'static str, f64)> {
        self.rules
            .iter()
            .map(|rule| (rule.name, Self::score_rule(rule, features)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(pairs: &[(&'static str, f64)]) -> Features {
        pairs.iter().copied().collect()
    }

    fn score_of(table: &ThresholdTable, name: &str, f: &Features) -> f64 {
        table
            .score(f)
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, s)| s)
            .unwrap()
    }

    #[test]
    fn test_partial_credit_by_distance_from_center() {
        let table = ThresholdTable::new(vec![CategoryRule {
            name: "x",
            bands: vec![band("a", 0.0, 100.0)],
        }]);
        assert!((score_of(&table, "x", &features(&[("a", 50.0)])) - 1.0).abs() < 1e-9);
        assert!((score_of(&table, "x", &features(&[("a", 100.0)])) - 0.7).abs() < 1e-9);
        assert!((score_of(&table, "x", &features(&[("a", 75.0)])) - 0.85).abs() < 1e-9);
        assert_eq!(score_of(&table, "x", &features(&[("a", 101.0)])), 0.0);
    }

    #[test]
    fn test_absent_features_are_not_counted() {
        let table = ThresholdTable::default();
        // Only cpu present: idle is judged on cpu alone
        let f = features(&[("cpu_utilization", 5.0)]);
        assert!((score_of(&table, "idle", &f) - 1.0).abs() < 1e-9);
        assert_eq!(score_of(&table, "idle", &Features::new()), 0.0);
    }

    #[test]
    fn test_default_table_order() {
        let names: Vec<&str> = ThresholdTable::default()
            .rules()
            .iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names.len(), 10);
        assert_eq!(names[0], "gaming");
        assert_eq!(names[9], "system_maintenance");
    }
}
