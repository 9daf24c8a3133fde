//! Cost agents.
//!
//! Every built-in agent is a [`CostAgent`]: the same stateless unit configured
//! with one [`AgentKind`], which decides what it reads and how it turns
//! results into insights. Anything implementing [`Agent`] can be registered
//! next to them.

mod automation;
mod cost_guard;
mod query_optimizer;
mod sla_sentinel;

use crate::error::Result;
use crate::insight::AgentInsight;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use costwatch_abstraction::OptimizationGoal;
use costwatch_core::config::AutomationConfig;
use costwatch_core::{
    CostIntelligence, CostwatchConfig, OptimizationOutcome, QueryEstimate, RiskLevel, WatchedQuery,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};

pub use automation::replacement_diff;

/// Inputs handed to an agent run.
#[derive(Debug, Clone)]
pub struct AgentContext {
    /// Cost engine to read from.
    pub engine: CostIntelligence,
    /// Cycle start; agents derive their time windows from it.
    pub now: DateTime<Utc>,
}

impl AgentContext {
    /// Creates a context for a cycle starting at `now`.
    #[must_use]
    pub fn new(engine: CostIntelligence, now: DateTime<Utc>) -> Self {
        Self { engine, now }
    }
}

/// A named, stateless analysis unit.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Unique agent name.
    fn name(&self) -> &str;

    /// What the agent watches.
    fn description(&self) -> &str;

    /// Produces this cycle's insights.
    ///
    /// # Errors
    /// Any error; the orchestrator turns it into a degraded insight.
    async fn run(&self, ctx: &AgentContext) -> Result<Vec<AgentInsight>>;
}

/// What a [`CostAgent`] does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentKind {
    /// Anomalous daily spend; priority follows severity.
    CostGuard,
    /// Optimizes watched queries estimated HIGH or CRITICAL.
    QueryOptimizer {
        /// Queries to watch.
        watched_queries: Vec<WatchedQuery>,
    },
    /// Forecast budget compliance against an SLA.
    SlaSentinel {
        /// Fraction of forecast days that must stay within budget.
        sla_threshold: f64,
        /// Forecast horizon in days.
        horizon_days: u32,
    },
    /// Proposes pull requests for rewrites saving at least `min_savings_usd`.
    Automation {
        /// Queries to watch.
        watched_queries: Vec<WatchedQuery>,
        /// Where pull requests go.
        target: AutomationConfig,
        /// Savings per run below which nothing is proposed.
        min_savings_usd: f64,
    },
}

impl AgentKind {
    /// Fixed name of the agent of this kind.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CostGuard => cost_guard::NAME,
            Self::QueryOptimizer { .. } => query_optimizer::NAME,
            Self::SlaSentinel { .. } => sla_sentinel::NAME,
            Self::Automation { .. } => automation::NAME,
        }
    }

    fn description(&self) -> &'static str {
        match self {
            Self::CostGuard => "Flags anomalous daily spend",
            Self::QueryOptimizer { .. } => "Finds cheaper rewrites of expensive watched queries",
            Self::SlaSentinel { .. } => "Checks forecast spend against the daily budget SLA",
            Self::Automation { .. } => "Proposes pull requests for verified rewrites",
        }
    }
}

/// Built-in agent.
#[derive(Debug, Clone, PartialEq)]
pub struct CostAgent {
    kind: AgentKind,
}

impl CostAgent {
    /// Creates an agent of `kind`.
    #[must_use]
    pub fn new(kind: AgentKind) -> Self {
        Self { kind }
    }

    /// The agent's kind.
    #[must_use]
    pub fn kind(&self) -> &AgentKind {
        &self.kind
    }

    /// The agents enabled in `config`, in a fixed order.
    #[must_use]
    pub fn from_config(config: &CostwatchConfig) -> Vec<Self> {
        let agents = &config.agents;
        let mut kinds = Vec::new();
        if agents.cost_guard.enabled {
            kinds.push(AgentKind::CostGuard);
        }
        if agents.query_optimizer.enabled {
            kinds.push(AgentKind::QueryOptimizer {
                watched_queries: agents.query_optimizer.watched_queries.clone(),
            });
        }
        if agents.sla_sentinel.enabled {
            kinds.push(AgentKind::SlaSentinel {
                sla_threshold: agents.sla_sentinel.sla_threshold,
                horizon_days: agents.sla_sentinel.horizon_days,
            });
        }
        if agents.automation.enabled {
            kinds.push(AgentKind::Automation {
                watched_queries: agents.query_optimizer.watched_queries.clone(),
                target: agents.automation.clone(),
                min_savings_usd: config.optimization.min_savings_for_pr,
            });
        }
        kinds.into_iter().map(Self::new).collect()
    }
}

#[async_trait]
impl Agent for CostAgent {
    fn name(&self) -> &str {
        self.kind.name()
    }

    fn description(&self) -> &str {
        self.kind.description()
    }

    async fn run(&self, ctx: &AgentContext) -> Result<Vec<AgentInsight>> {
        match &self.kind {
            AgentKind::CostGuard => cost_guard::run(ctx).await,
            AgentKind::QueryOptimizer { watched_queries } => {
                query_optimizer::run(ctx, watched_queries).await
            }
            AgentKind::SlaSentinel { sla_threshold, horizon_days } => {
                sla_sentinel::run(ctx, *sla_threshold, *horizon_days).await
            }
            AgentKind::Automation { watched_queries, target, min_savings_usd } => {
                automation::run(ctx, watched_queries, target, *min_savings_usd).await
            }
        }
    }
}

type WatchedOutcome = costwatch_core::Result<(QueryEstimate, Option<OptimizationOutcome>)>;

/// Estimates every watched query and optimizes those at or above `min_risk`.
async fn optimize_watched<'a>(
    engine: &CostIntelligence,
    queries: &'a [WatchedQuery],
    min_risk: RiskLevel,
) -> Vec<(&'a WatchedQuery, WatchedOutcome)> {
    let outcomes = join_all(
        queries.iter().map(|q| engine.estimate_and_optimize(&q.sql, OptimizationGoal::Cost, min_risk)),
    )
    .await;
    queries.iter().zip(outcomes).collect()
}
