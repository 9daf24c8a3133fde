//! Watched query optimizer.

use super::{AgentContext, optimize_watched};
use crate::error::Result;
use crate::insight::{AgentInsight, InsightPriority};
use costwatch_core::{CostError, OptimizationCandidate, QueryEstimate, RiskLevel, WatchedQuery};
use serde_json::json;
use tracing::{debug, warn};

pub(super) const NAME: &str = "query_optimizer";

pub(super) async fn run(ctx: &AgentContext, queries: &[WatchedQuery]) -> Result<Vec<AgentInsight>> {
    let warning_usd = ctx.engine.config().thresholds.query_cost_warning;
    let mut insights = Vec::new();

    for (query, outcome) in optimize_watched(&ctx.engine, queries, RiskLevel::High).await {
        match outcome {
            Ok((estimate, Some(outcome))) => match outcome.best() {
                Some(best) => insights.push(insight(query, estimate.risk_level, best)),
                None => {
                    debug!(query = %query.name, ?outcome, "No surfaced rewrite");
                    insights.extend(cost_warning(query, &estimate, warning_usd));
                }
            },
            Ok((estimate, None)) => {
                debug!(query = %query.name, risk = %estimate.risk_level, "Below optimization risk");
                insights.extend(cost_warning(query, &estimate, warning_usd));
            }
            Err(CostError::QuerySyntaxError { message }) => {
                warn!(query = %query.name, error = %message, "Watched query no longer parses");
                insights.push(
                    AgentInsight::new(
                        NAME,
                        InsightPriority::Medium,
                        format!("invalid_query:{}", query.name),
                        format!("Watched query '{}' is rejected by the backend", query.name),
                    )
                    .with_detail(json!({ "query": query.name, "error": message })),
                );
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(insights)
}

/// Flags a watched query at or above the per-query warning cost that has no
/// verified rewrite.
fn cost_warning(query: &WatchedQuery, estimate: &QueryEstimate, warning_usd: f64) -> Option<AgentInsight> {
    if estimate.cost_estimated_usd < warning_usd {
        return None;
    }
    let summary = format!(
        "Watched query '{}' costs ${:.2} per run (warning at ${:.2}) and has no verified rewrite",
        query.name, estimate.cost_estimated_usd, warning_usd,
    );
    Some(
        AgentInsight::new(
            NAME,
            estimate.risk_level.into(),
            format!("cost_warning:{}", query.name),
            summary,
        )
        .with_detail(json!({
            "query": query.name,
            "path": query.path,
            "risk_level": estimate.risk_level,
            "cost_usd": estimate.cost_estimated_usd,
            "bytes_estimated": estimate.bytes_estimated,
            "warning_usd": warning_usd,
        })),
    )
}

fn insight(query: &WatchedQuery, risk: RiskLevel, best: &OptimizationCandidate) -> AgentInsight {
    let summary = format!(
        "{} query '{}' (${:.2}/run) has a verified rewrite saving ${:.2} ({:.1}%)",
        risk, query.name, best.base_estimate.cost_estimated_usd, best.savings_usd, best.savings_pct,
    );

    AgentInsight::new(NAME, risk.into(), format!("query:{}", query.name), summary).with_detail(json!({
        "query": query.name,
        "path": query.path,
        "risk_level": risk,
        "base_cost_usd": best.base_estimate.cost_estimated_usd,
        "rewritten_cost_usd": best.rewritten_estimate.cost_estimated_usd,
        "savings_usd": best.savings_usd,
        "savings_pct": best.savings_pct,
        "below_target": best.below_target,
        "rewritten_sql": best.rewritten_text,
    }))
}
