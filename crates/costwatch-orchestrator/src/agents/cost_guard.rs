//! Anomalous spend watcher.

use super::AgentContext;
use crate::error::Result;
use crate::insight::AgentInsight;
use costwatch_core::{AnomalyFinding, Dimension, trailing_days_window};
use serde_json::json;
use tracing::debug;

pub(super) const NAME: &str = "cost_guard";

pub(super) async fn run(ctx: &AgentContext) -> Result<Vec<AgentInsight>> {
    let thresholds = &ctx.engine.config().thresholds;
    let range = trailing_days_window(ctx.now, thresholds.detection_window_days);
    let report = ctx.engine.anomalies(&range, None, &[Dimension::Date]).await?;

    debug!(findings = report.findings.len(), range = %range, "Cost guard scan complete");
    Ok(report.findings.iter().map(insight).collect())
}

fn insight(finding: &AnomalyFinding) -> AgentInsight {
    let day = finding.period.date_naive();
    let direction = if finding.deviation_ratio >= 0.0 { "above" } else { "below" };
    let summary = format!(
        "{} spend on {} was ${:.2}, {:.0}% {} the expected ${:.2}",
        finding.series_reference,
        day,
        finding.observed_value,
        finding.deviation_ratio.abs() * 100.0,
        direction,
        finding.expected_value,
    );

    AgentInsight::new(
        NAME,
        finding.severity.into(),
        format!("anomaly:{}:{}", finding.series_reference, day),
        summary,
    )
    .with_detail(json!({
        "series": finding.series_reference,
        "period": finding.period,
        "observed_usd": finding.observed_value,
        "expected_usd": finding.expected_value,
        "deviation_ratio": finding.deviation_ratio,
        "severity": finding.severity,
        "robust_z": finding.robust_z,
        "excess_usd": finding.excess_cost(),
    }))
}
