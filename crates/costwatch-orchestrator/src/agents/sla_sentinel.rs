//! Budget SLA watcher.

use super::AgentContext;
use crate::error::Result;
use crate::insight::{AgentInsight, InsightPriority};
use costwatch_core::{Dimension, trailing_days_window};
use serde_json::json;
use tracing::debug;

pub(super) const NAME: &str = "sla_sentinel";

/// Below this compliance a breach is critical.
const CRITICAL_COMPLIANCE: f64 = 0.5;

pub(super) async fn run(
    ctx: &AgentContext,
    sla_threshold: f64,
    horizon_days: u32,
) -> Result<Vec<AgentInsight>> {
    let thresholds = &ctx.engine.config().thresholds;
    let budget = thresholds.daily_cost_alert;
    let lookback = trailing_days_window(ctx.now, thresholds.detection_window_days);
    let forecast = ctx.engine.forecast(&lookback, horizon_days, &[Dimension::Date], false).await?;

    let compliance = forecast.compliance(budget);
    debug!(compliance, sla_threshold, horizon_days, "SLA check complete");
    if compliance >= sla_threshold {
        return Ok(Vec::new());
    }

    let priority = if compliance < CRITICAL_COMPLIANCE {
        InsightPriority::Critical
    } else {
        InsightPriority::High
    };
    let summary = format!(
        "Forecast keeps daily spend within ${:.2} on {:.0}% of the next {} days (SLA {:.0}%)",
        budget,
        compliance * 100.0,
        horizon_days,
        sla_threshold * 100.0,
    );

    Ok(vec![AgentInsight::new(NAME, priority, "sla:daily_budget", summary).with_detail(json!({
        "compliance": compliance,
        "sla_threshold": sla_threshold,
        "daily_budget_usd": budget,
        "horizon_days": horizon_days,
        "total_projected_cost_usd": forecast.total_projected_cost_usd,
        "first_breach": forecast.budget_breach.as_ref().map(|b| b.first_breach),
        "trend": forecast.trend,
    }))])
}
