//! Spend anomaly detection.
//!
//! Each bucket is compared to the median of the trailing baseline window that
//! precedes it (the bucket itself never contributes to its own baseline). The
//! relative deviation is tested against a base threshold scaled by a fixed
//! three-point sensitivity table.

use crate::aggregator::CostSeries;
use crate::config::ThresholdConfig;
use crate::error::{CostError, Result};
use crate::stats::{median, median_abs_deviation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Deviation reported when the baseline is zero but the bucket is not.
pub const SATURATED_DEVIATION: f64 = 1_000.0;

/// Fewest baseline points needed before a bucket is evaluated.
const MIN_HISTORY: usize = 3;

/// Scale factor from MAD to a normal-consistent spread.
const MAD_SCALE: f64 = 0.6745;

/// Detection sensitivity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    /// Fewer flags.
    Low,
    /// Default.
    #[default]
    Medium,
    /// More flags.
    High,
}

impl Sensitivity {
    /// Multiplier applied to the base threshold.
    #[must_use]
    pub const fn factor(&self) -> f64 {
        match self {
            Self::Low => 2.0,
            Self::Medium => 1.2,
            Self::High => 0.8,
        }
    }

    /// Threshold actually compared against `|deviation_ratio|`.
    #[must_use]
    pub fn effective_threshold(&self, base: f64) -> f64 {
        base * self.factor()
    }
}

impl fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(name)
    }
}

impl FromStr for Sensitivity {
    type Err = CostError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(CostError::invalid_parameter("sensitivity", s)),
        }
    }
}

/// Severity of a finding, derived from the size of its deviation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// |deviation| below 0.3.
    Low,
    /// |deviation| below 0.6.
    Medium,
    /// |deviation| below 1.0.
    High,
    /// Anything larger.
    Critical,
}

impl Severity {
    /// Classifies a deviation ratio.
    #[must_use]
    pub fn from_deviation(deviation_ratio: f64) -> Self {
        let magnitude = deviation_ratio.abs();
        if magnitude < 0.3 {
            Self::Low
        } else if magnitude < 0.6 {
            Self::Medium
        } else if magnitude < 1.0 {
            Self::High
        } else {
            Self::Critical
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

/// One flagged bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyFinding {
    /// Dimension key of the series the bucket belongs to.
    pub series_reference: String,
    /// Start of the flagged bucket.
    pub period: DateTime<Utc>,
    /// Actual spend.
    pub observed_value: f64,
    /// Baseline median.
    pub expected_value: f64,
    /// `(observed - expected) / expected`, saturated when expected is zero.
    pub deviation_ratio: f64,
    /// Derived from `deviation_ratio`.
    pub severity: Severity,
    /// Robust z-score against the baseline spread, when the spread is non-zero.
    pub robust_z: Option<f64>,
}

impl AnomalyFinding {
    /// Spend above the baseline (zero for drops).
    #[must_use]
    pub fn excess_cost(&self) -> f64 {
        (self.observed_value - self.expected_value).max(0.0)
    }
}

/// Relative deviation of `observed` from `expected`.
///
/// Zero when both are zero; [`SATURATED_DEVIATION`] (signed) when only the
/// expectation is zero.
#[must_use]
pub fn deviation_ratio(observed: f64, expected: f64) -> f64 {
    if expected == 0.0 {
        if observed == 0.0 { 0.0 } else { SATURATED_DEVIATION.copysign(observed) }
    } else {
        ((observed - expected) / expected.abs()).clamp(-SATURATED_DEVIATION, SATURATED_DEVIATION)
    }
}

/// Stateless anomaly detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnomalyDetector {
    baseline_window: usize,
    min_history: usize,
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(7)
    }
}

impl AnomalyDetector {
    /// Uses the trailing `baseline_window` buckets as the baseline.
    #[must_use]
    pub fn new(baseline_window: usize) -> Self {
        let baseline_window = baseline_window.max(2);
        Self { baseline_window, min_history: baseline_window.min(MIN_HISTORY) }
    }

    /// Builds a detector from the threshold section of the configuration.
    #[must_use]
    pub fn from_config(config: &ThresholdConfig) -> Self {
        Self::new(config.baseline_window)
    }

    /// Points a series needs before anything can be evaluated.
    #[must_use]
    pub fn required_points(&self) -> usize {
        self.min_history + 1
    }

    /// Flags buckets of `series` whose deviation reaches the scaled threshold.
    ///
    /// Findings are ordered by `deviation_ratio` descending, ties by period.
    /// Non-finite values are neither flagged nor used in baselines.
    ///
    /// # Errors
    /// Returns `InsufficientData` when the series is too short to build any
    /// baseline and `InvalidParameter` for a non-positive threshold.
    pub fn detect(
        &self,
        series: &CostSeries,
        sensitivity: Sensitivity,
        threshold: f64,
    ) -> Result<Vec<AnomalyFinding>> {
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(CostError::invalid_parameter("threshold", threshold));
        }
        if series.len() < self.required_points() {
            return Err(CostError::InsufficientData {
                series: series.dimension_key.clone(),
                points: series.len(),
                required: self.required_points(),
            });
        }

        let effective = sensitivity.effective_threshold(threshold);
        let values = series.values();
        let mut findings = Vec::new();

        for (i, bucket) in series.buckets.iter().enumerate().skip(self.min_history) {
            let observed = bucket.total_cost_usd;
            if !observed.is_finite() {
                continue;
            }
            let baseline: Vec<f64> = values[i.saturating_sub(self.baseline_window)..i]
                .iter()
                .copied()
                .filter(|v| v.is_finite())
                .collect();
            let Some(expected) = median(&baseline) else { continue };
            let deviation = deviation_ratio(observed, expected);
            if deviation.abs() < effective {
                continue;
            }

            let robust_z = median_abs_deviation(&baseline, expected)
                .filter(|mad| *mad > 0.0)
                .map(|mad| MAD_SCALE * (observed - expected) / mad);

            findings.push(AnomalyFinding {
                series_reference: series.dimension_key.clone(),
                period: bucket.period_start,
                observed_value: observed,
                expected_value: expected,
                deviation_ratio: deviation,
                severity: Severity::from_deviation(deviation),
                robust_z,
            });
        }

        sort_findings(&mut findings);
        debug!(
            series = %series.dimension_key,
            sensitivity = %sensitivity,
            threshold = effective,
            flagged = findings.len(),
            "Anomaly detection complete"
        );
        Ok(findings)
    }

    /// Runs [`AnomalyDetector::detect`] over several series and merges the findings.
    ///
    /// Series too short to evaluate are skipped; if every series is too short
    /// the first `InsufficientData` error is returned.
    ///
    /// # Errors
    /// See [`AnomalyDetector::detect`].
    pub fn detect_all(
        &self,
        series: &[CostSeries],
        sensitivity: Sensitivity,
        threshold: f64,
    ) -> Result<Vec<AnomalyFinding>> {
        let mut findings = Vec::new();
        let mut first_shortfall = None;
        let mut evaluated = 0usize;

        for s in series {
            match self.detect(s, sensitivity, threshold) {
                Ok(mut found) => {
                    evaluated += 1;
                    findings.append(&mut found);
                }
                Err(err @ CostError::InsufficientData { .. }) => {
                    debug!(series = %s.dimension_key, "Skipping short series");
                    first_shortfall.get_or_insert(err);
                }
                Err(err) => return Err(err),
            }
        }

        if evaluated == 0 {
            return Err(first_shortfall.unwrap_or(CostError::InsufficientData {
                series: "<none>".to_string(),
                points: 0,
                required: self.required_points(),
            }));
        }

        sort_findings(&mut findings);
        Ok(findings)
    }
}

fn sort_findings(findings: &mut [AnomalyFinding]) {
    findings.sort_by(|a, b| {
        b.deviation_ratio
            .total_cmp(&a.deviation_ratio)
            .then_with(|| a.period.cmp(&b.period))
            .then_with(|| a.series_reference.cmp(&b.series_reference))
    });
}

/// Roll-up of a set of findings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalySummary {
    /// Number of findings.
    pub total: usize,
    /// Findings with `LOW` severity.
    pub low: usize,
    /// Findings with `MEDIUM` severity.
    pub medium: usize,
    /// Findings with `HIGH` severity.
    pub high: usize,
    /// Findings with `CRITICAL` severity.
    pub critical: usize,
    /// Spend above baseline across all findings.
    pub excess_cost_usd: f64,
    /// The most severe finding (largest |deviation| among equals).
    pub worst: Option<AnomalyFinding>,
}

impl AnomalySummary {
    /// Summarizes `findings`.
    #[must_use]
    pub fn from_findings(findings: &[AnomalyFinding]) -> Self {
        let mut summary = Self { total: findings.len(), ..Self::default() };
        for finding in findings {
            match finding.severity {
                Severity::Low => summary.low += 1,
                Severity::Medium => summary.medium += 1,
                Severity::High => summary.high += 1,
                Severity::Critical => summary.critical += 1,
            }
            summary.excess_cost_usd += finding.excess_cost();
        }
        summary.worst = findings
            .iter()
            .max_by(|a, b| {
                a.severity
                    .cmp(&b.severity)
                    .then_with(|| a.deviation_ratio.abs().total_cmp(&b.deviation_ratio.abs()))
            })
            .cloned();
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn series(values: &[f64]) -> CostSeries {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        CostSeries::from_daily_values("total", start, values)
    }

    #[test]
    fn test_deviation_ratio_edges() {
        assert_eq!(deviation_ratio(0.0, 0.0), 0.0);
        assert_eq!(deviation_ratio(5.0, 0.0), SATURATED_DEVIATION);
        assert_eq!(deviation_ratio(125.0, 100.0), 0.25);
        assert_eq!(deviation_ratio(50.0, 100.0), -0.5);
    }

    #[test]
    fn test_sensitivity_table() {
        assert!((Sensitivity::Low.effective_threshold(0.25) - 0.5).abs() < 1e-12);
        assert!((Sensitivity::Medium.effective_threshold(0.25) - 0.3).abs() < 1e-12);
        assert!((Sensitivity::High.effective_threshold(0.25) - 0.2).abs() < 1e-12);
        assert_eq!("HIGH".parse::<Sensitivity>().unwrap(), Sensitivity::High);
        assert!("extreme".parse::<Sensitivity>().is_err());
    }

    #[test]
    fn test_severity_table() {
        assert_eq!(Severity::from_deviation(0.25), Severity::Low);
        assert_eq!(Severity::from_deviation(-0.45), Severity::Medium);
        assert_eq!(Severity::from_deviation(0.9), Severity::High);
        assert_eq!(Severity::from_deviation(3.0), Severity::Critical);
    }

    #[test]
    fn test_flat_series_has_no_findings() {
        let findings = AnomalyDetector::default()
            .detect(&series(&[100.0; 14]), Sensitivity::High, 0.25)
            .unwrap();
        assert!(findings.is_empty());
    }

    #[test]
    fn test_spike_is_flagged_with_expected_fields() {
        let mut values = vec![100.0; 10];
        values.push(300.0);
        let findings =
            AnomalyDetector::default().detect(&series(&values), Sensitivity::Medium, 0.25).unwrap();

        assert_eq!(findings.len(), 1);
        let finding = &findings[0];
        assert_eq!(finding.expected_value, 100.0);
        assert_eq!(finding.observed_value, 300.0);
        assert_eq!(finding.deviation_ratio, 2.0);
        assert_eq!(finding.severity, Severity::Critical);
        assert_eq!(finding.robust_z, None);
        assert_eq!(finding.period, Utc.with_ymd_and_hms(2024, 5, 11, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_point_is_excluded_from_its_own_baseline() {
        // A single spike after three quiet days; if the spike were part of its
        // own baseline the median would move and the ratio would shrink.
        let findings = AnomalyDetector::new(3)
            .detect(&series(&[10.0, 10.0, 10.0, 40.0]), Sensitivity::Medium, 0.25)
            .unwrap();
        assert_eq!(findings[0].expected_value, 10.0);
        assert_eq!(findings[0].deviation_ratio, 3.0);
    }

    #[test]
    fn test_non_finite_values_are_skipped() {
        let mut values = vec![100.0; 10];
        values[8] = f64::NAN;
        values.push(f64::INFINITY);
        values.push(100.0);
        let findings =
            AnomalyDetector::default().detect(&series(&values), Sensitivity::High, 0.25).unwrap();
        assert!(findings.is_empty(), "{findings:?}");
    }

    #[test]
    fn test_findings_sorted_by_deviation_descending() {
        let values = [100.0, 100.0, 100.0, 100.0, 150.0, 100.0, 100.0, 400.0, 100.0, 20.0];
        let findings =
            AnomalyDetector::default().detect(&series(&values), Sensitivity::High, 0.25).unwrap();
        let ratios: Vec<f64> = findings.iter().map(|f| f.deviation_ratio).collect();
        assert_eq!(ratios, vec![3.0, 0.5, -0.8]);
    }

    #[test]
    fn test_zero_baseline_saturates() {
        let findings = AnomalyDetector::default()
            .detect(&series(&[0.0, 0.0, 0.0, 0.0, 12.0]), Sensitivity::Low, 0.25)
            .unwrap();
        assert_eq!(findings[0].deviation_ratio, SATURATED_DEVIATION);
    }

    #[test]
    fn test_short_series_is_insufficient() {
        let err = AnomalyDetector::default()
            .detect(&series(&[1.0, 2.0]), Sensitivity::Medium, 0.25)
            .unwrap_err();
        assert_eq!(
            err,
            CostError::InsufficientData { series: "total".to_string(), points: 2, required: 4 }
        );
        assert!(AnomalyDetector::default().detect(&series(&[]), Sensitivity::Medium, 0.25).is_err());
    }

    #[test]
    fn test_non_positive_threshold_is_rejected() {
        let result = AnomalyDetector::default().detect(&series(&[1.0; 8]), Sensitivity::High, 0.0);
        assert!(matches!(result, Err(CostError::InvalidParameter { .. })));
    }

    #[test]
    fn test_detect_all_skips_short_series() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let long = CostSeries::from_daily_values("user=a", start, &[10.0, 10.0, 10.0, 10.0, 50.0]);
        let short = CostSeries::from_daily_values("user=b", start, &[10.0]);
        let findings = AnomalyDetector::default()
            .detect_all(&[short.clone(), long], Sensitivity::Medium, 0.25)
            .unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].series_reference, "user=a");

        let err =
            AnomalyDetector::default().detect_all(&[short], Sensitivity::Medium, 0.25).unwrap_err();
        assert!(matches!(err, CostError::InsufficientData { .. }));
    }

    #[test]
    fn test_summary() {
        let mut values = vec![100.0; 8];
        values.extend([140.0, 100.0, 400.0]);
        let findings =
            AnomalyDetector::default().detect(&series(&values), Sensitivity::High, 0.25).unwrap();
        let summary = AnomalySummary::from_findings(&findings);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.medium, 1);
        assert_eq!(summary.critical, 1);
        assert!((summary.excess_cost_usd - 340.0).abs() < 1e-9);
        assert_eq!(summary.worst.unwrap().observed_value, 400.0);
    }
}
