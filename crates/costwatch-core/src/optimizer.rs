//! Query rewrite optimization.
//!
//! The rewrite oracle is advisory only: every suggestion is re-estimated
//! against the backend and must pass the structural equivalence pre-check
//! before it is surfaced. Suggestions the backend cannot parse, that fail the
//! pre-check, or that save nothing are dropped.

use crate::equivalence::check_equivalence;
use crate::error::{CostError, Result};
use crate::estimator::{DetailedEstimate, QueryEstimate, QueryEstimator};
use crate::ledger::query_fingerprint;
use costwatch_abstraction::{OptimizationGoal, RewriteOracle};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// A verified rewrite with its estimated effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationCandidate {
    /// Estimate of the original query.
    pub base_estimate: QueryEstimate,
    /// Rewritten query text.
    pub rewritten_text: String,
    /// Estimate of the rewrite.
    pub rewritten_estimate: QueryEstimate,
    /// Cost saved per run, in USD.
    pub savings_usd: f64,
    /// Cost saved per run, as a percentage of the original.
    pub savings_pct: f64,
    /// Passed the equivalence pre-check. Always `true` for surfaced candidates.
    pub preserves_results: bool,
    /// Savings fall short of the requested target.
    pub below_target: bool,
}

/// Result of an optimization request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OptimizationOutcome {
    /// Ranked candidates (savings descending, then lower risk).
    Candidates {
        /// The candidates.
        candidates: Vec<OptimizationCandidate>,
    },
    /// The oracle produced nothing the backend could parse.
    NoValidRewrites {
        /// Suggestions received from the oracle.
        suggested: usize,
    },
    /// Valid rewrites existed but none both preserved results and saved money.
    NoSavingsFound {
        /// Valid rewrites that were rejected.
        rejected: usize,
    },
}

impl OptimizationOutcome {
    /// Surfaced candidates (empty for the other outcomes).
    #[must_use]
    pub fn candidates(&self) -> &[OptimizationCandidate] {
        match self {
            Self::Candidates { candidates } => candidates,
            _ => &[],
        }
    }

    /// Best candidate, if any.
    #[must_use]
    pub fn best(&self) -> Option<&OptimizationCandidate> {
        self.candidates().first()
    }
}

/// Produces verified rewrite candidates.
#[derive(Clone)]
pub struct QueryOptimizer {
    estimator: QueryEstimator,
    oracle: Arc<dyn RewriteOracle>,
}

impl std::fmt::Debug for QueryOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOptimizer").field("estimator", &self.estimator).finish_non_exhaustive()
    }
}

impl QueryOptimizer {
    /// Creates an optimizer.
    #[must_use]
    pub fn new(estimator: QueryEstimator, oracle: Arc<dyn RewriteOracle>) -> Self {
        Self { estimator, oracle }
    }

    /// Asks the oracle for rewrites of `query_text` and keeps the verified ones.
    ///
    /// Candidates reaching `target_savings_pct` are returned ranked; if none
    /// does, only the best candidate is returned, flagged `below_target`.
    ///
    /// # Errors
    /// Returns `InvalidParameter` if `base_estimate` does not belong to
    /// `query_text` or the target is outside `0..=100`, `Oracle` if the oracle
    /// fails, and `BackendUnavailable` if re-estimation cannot reach the backend.
    pub async fn optimize(
        &self,
        query_text: &str,
        base_estimate: &QueryEstimate,
        goal: OptimizationGoal,
        target_savings_pct: f64,
    ) -> Result<OptimizationOutcome> {
        if !(0.0..=100.0).contains(&target_savings_pct) {
            return Err(CostError::invalid_parameter("target_savings_pct", target_savings_pct));
        }
        let fingerprint = query_fingerprint(query_text);
        if base_estimate.query_text_hash != fingerprint {
            return Err(CostError::invalid_parameter(
                "base_estimate",
                "estimate does not belong to the given query text",
            ));
        }

        let base = self.estimator.estimate_detailed(query_text).await?;
        let suggestions = self.oracle.suggest_rewrite(query_text, goal).await?;
        let suggested = suggestions.len();

        let mut identical = 0usize;
        let mut seen = HashSet::new();
        let mut rewrites = Vec::new();
        for text in suggestions {
            if text.trim().is_empty() {
                continue;
            }
            let rewrite_fingerprint = query_fingerprint(&text);
            if rewrite_fingerprint == fingerprint {
                identical += 1;
            } else if seen.insert(rewrite_fingerprint) {
                rewrites.push(text);
            }
        }

        let estimates =
            join_all(rewrites.iter().map(|text| self.estimator.estimate_detailed(text))).await;

        let mut valid = 0usize;
        let mut rejected = 0usize;
        let mut candidates = Vec::new();
        for (text, estimate) in rewrites.into_iter().zip(estimates) {
            let detail = match estimate {
                Ok(detail) => detail,
                Err(CostError::QuerySyntaxError { message }) => {
                    debug!(error = %message, "Discarding rewrite the backend cannot parse");
                    continue;
                }
                Err(err) => return Err(err),
            };
            valid += 1;
            match verify(query_text, &base, text, detail, target_savings_pct) {
                Some(candidate) => candidates.push(candidate),
                None => rejected += 1,
            }
        }

        if valid == 0 && identical == 0 {
            info!(suggested, "Oracle produced no valid rewrites");
            return Ok(OptimizationOutcome::NoValidRewrites { suggested });
        }
        if candidates.is_empty() {
            info!(valid, rejected = rejected + identical, "No rewrite saved anything");
            return Ok(OptimizationOutcome::NoSavingsFound { rejected: rejected + identical });
        }

        candidates.sort_by(|a, b| {
            b.savings_usd
                .total_cmp(&a.savings_usd)
                .then_with(|| a.rewritten_estimate.risk_level.cmp(&b.rewritten_estimate.risk_level))
        });
        let on_target: Vec<_> = candidates.iter().filter(|c| !c.below_target).cloned().collect();
        let surfaced = if on_target.is_empty() {
            candidates.truncate(1);
            candidates
        } else {
            on_target
        };

        info!(
            surfaced = surfaced.len(),
            rejected,
            best_savings_pct = surfaced[0].savings_pct,
            below_target = surfaced[0].below_target,
            "Optimization complete"
        );
        Ok(OptimizationOutcome::Candidates { candidates: surfaced })
    }
}

fn verify(
    original: &str,
    base: &DetailedEstimate,
    rewritten_text: String,
    rewritten: DetailedEstimate,
    target_savings_pct: f64,
) -> Option<OptimizationCandidate> {
    if let Err(violation) =
        check_equivalence(original, &base.schema, &rewritten_text, &rewritten.schema)
    {
        debug!(%violation, "Discarding rewrite that fails the equivalence pre-check");
        return None;
    }

    let base_cost = base.estimate.cost_estimated_usd;
    let savings_usd = base_cost - rewritten.estimate.cost_estimated_usd;
    if savings_usd <= 0.0 || base_cost <= 0.0 {
        debug!(savings_usd, "Discarding rewrite without savings");
        return None;
    }
    let savings_pct = savings_usd / base_cost * 100.0;

    Some(OptimizationCandidate {
        base_estimate: base.estimate.clone(),
        rewritten_text,
        rewritten_estimate: rewritten.estimate,
        savings_usd,
        savings_pct,
        preserves_results: true,
        below_target: savings_pct < target_savings_pct,
    })
}
