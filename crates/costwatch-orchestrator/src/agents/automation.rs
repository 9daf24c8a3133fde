//! Pull request proposals for verified rewrites.
//!
//! The agent only proposes: each insight carries the pull request in its
//! detail, and opening it is a separate, permission-gated action.

use super::{AgentContext, optimize_watched};
use crate::error::Result;
use crate::insight::{AgentInsight, InsightPriority};
use costwatch_abstraction::PullRequest;
use costwatch_core::config::AutomationConfig;
use costwatch_core::{CostError, RiskLevel, WatchedQuery};
use serde_json::json;
use similar::{Algorithm, TextDiff};
use tracing::debug;

pub(super) const NAME: &str = "automation";

/// Renders the replacement of `original` by `rewritten` in `path` as a
/// unified diff with three lines of context.
pub fn replacement_diff(path: &str, original: &str, rewritten: &str) -> String {
    let old = with_trailing_newline(original);
    let new = with_trailing_newline(rewritten);
    let diff = TextDiff::configure().algorithm(Algorithm::Patience).diff_lines(&old, &new);
    diff.unified_diff().context_radius(3).header(&format!("a/{path}"), &format!("b/{path}")).to_string()
}

fn with_trailing_newline(text: &str) -> String {
    let trimmed = text.trim_end();
    if trimmed.is_empty() { String::new() } else { format!("{trimmed}\n") }
}

pub(super) async fn run(
    ctx: &AgentContext,
    queries: &[WatchedQuery],
    target: &AutomationConfig,
    min_savings_usd: f64,
) -> Result<Vec<AgentInsight>> {
    let mut insights = Vec::new();

    for (query, outcome) in optimize_watched(&ctx.engine, queries, RiskLevel::Low).await {
        let outcome = match outcome {
            Ok((_, Some(outcome))) => outcome,
            Ok((_, None)) => continue,
            Err(CostError::QuerySyntaxError { .. }) => continue,
            Err(err) => return Err(err.into()),
        };
        let Some(best) = outcome.best().filter(|c| c.savings_usd >= min_savings_usd) else {
            debug!(query = %query.name, min_savings_usd, "No rewrite worth a pull request");
            continue;
        };

        let path = query.path.clone().unwrap_or_else(|| format!("queries/{}.sql", query.name));
        let request = PullRequest {
            repository: target.repository.clone(),
            base_branch: target.base_branch.clone(),
            title: format!(
                "Optimize {}: save ${:.2} per run ({:.1}%)",
                query.name, best.savings_usd, best.savings_pct
            ),
            diff: replacement_diff(&path, &query.sql, &best.rewritten_text),
            reviewers: target.reviewers.clone(),
        };

        insights.push(
            AgentInsight::new(
                NAME,
                InsightPriority::Medium,
                format!("pr:{}", query.name),
                format!("Pull request proposed for '{}': {}", query.name, request.title),
            )
            .with_detail(json!({
                "query": query.name,
                "savings_usd": best.savings_usd,
                "savings_pct": best.savings_pct,
                "pull_request": request,
            })),
        );
    }

    Ok(insights)
}
