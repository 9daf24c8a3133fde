//! Agent orchestrator for costwatch.
//!
//! Runs the registered agents against the cost engine, ranks what they find,
//! and routes every mutating action through the permission gate.

pub mod agents;
pub mod error;
pub mod gate;
pub mod insight;
pub mod registry;

use chrono::{DateTime, Utc};
use costwatch_abstraction::{AlertSeverity, DeliveryAck, Notification, Notifier, PullRequest, PullRequestCreator};
use costwatch_core::{CostIntelligence, StatusSnapshot};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

pub use agents::{Agent, AgentContext, AgentKind, CostAgent};
pub use error::{OrchestrationError, Result};
pub use gate::{ActionGate, ActionReceipt, ActionRequest};
pub use insight::{AgentInsight, InsightPriority, rank_insights};
pub use registry::{AgentMetadata, AgentRegistry};

/// Result of the most recent cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleSnapshot {
    /// When the cycle finished.
    pub completed_at: Option<DateTime<Utc>>,
    /// Ranked insights.
    pub insights: Vec<AgentInsight>,
    /// Agents that failed during the cycle.
    pub degraded_agents: Vec<String>,
}

/// Orchestrator health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestratorStatus {
    /// Cost engine snapshot.
    pub engine: StatusSnapshot,
    /// Registered agents.
    pub agents: Vec<AgentMetadata>,
    /// Completion time of the last cycle.
    pub last_cycle_at: Option<DateTime<Utc>>,
    /// Insights held from the last cycle.
    pub latest_insights: usize,
}

/// Orchestrator for running agents and acting on their insights.
#[derive(Debug)]
pub struct Orchestrator {
    engine: CostIntelligence,
    gate: ActionGate,
    registry: AgentRegistry,
    latest: RwLock<CycleSnapshot>,
}

impl Orchestrator {
    /// Creates an orchestrator with no agents registered.
    ///
    /// The gate enforces the engine's permission state.
    #[must_use]
    pub fn new(
        engine: CostIntelligence,
        pull_requests: Arc<dyn PullRequestCreator>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let gate = ActionGate::new(engine.permissions(), pull_requests, notifier);
        Self { engine, gate, registry: AgentRegistry::new(), latest: RwLock::new(CycleSnapshot::default()) }
    }

    /// Creates an orchestrator with the agents enabled in the engine's configuration.
    pub async fn from_config(
        engine: CostIntelligence,
        pull_requests: Arc<dyn PullRequestCreator>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let orchestrator = Self::new(engine, pull_requests, notifier);
        for agent in CostAgent::from_config(orchestrator.engine.config()) {
            orchestrator.registry.register(Arc::new(agent)).await;
        }
        info!(agents = orchestrator.registry.count().await, "Orchestrator configured");
        orchestrator
    }

    /// Cost engine the agents read from.
    #[must_use]
    pub fn engine(&self) -> &CostIntelligence {
        &self.engine
    }

    /// Registers an agent; returns `false` if it replaced one of the same name.
    pub async fn register_agent(&self, agent: Arc<dyn Agent>) -> bool {
        self.registry.register(agent).await
    }

    /// Unregisters an agent; returns `false` if it was not registered.
    pub async fn unregister_agent(&self, name: &str) -> bool {
        self.registry.unregister(name).await
    }

    /// Registered agents, ordered by name.
    pub async fn list_agents(&self) -> Vec<AgentMetadata> {
        self.registry.list().await
    }

    /// Runs the named agents (all registered agents when `agent_names` is
    /// empty) and returns their ranked insights.
    ///
    /// Agents run concurrently and independently. An agent that fails or
    /// panics contributes a degraded insight instead of aborting the cycle.
    /// The result replaces the stored snapshot.
    ///
    /// # Errors
    /// `UnknownAgent` if a name is not registered; nothing runs in that case.
    pub async fn run_cycle<S: AsRef<str>>(&self, agent_names: &[S]) -> Result<Vec<AgentInsight>> {
        let agents = if agent_names.is_empty() {
            self.registry.all().await
        } else {
            let mut seen = HashSet::new();
            let mut agents = Vec::new();
            for name in agent_names.iter().map(|n| n.as_ref()).filter(|n| seen.insert(*n)) {
                let agent = self
                    .registry
                    .get(name)
                    .await
                    .ok_or_else(|| OrchestrationError::UnknownAgent(name.to_string()))?;
                agents.push(agent);
            }
            agents
        };

        let ctx = AgentContext::new(self.engine.clone(), Utc::now());
        info!(agents = agents.len(), "Starting agent cycle");

        let runs = agents.into_iter().map(|agent| {
            let name = agent.name().to_string();
            let ctx = ctx.clone();
            let handle = tokio::spawn(async move { agent.run(&ctx).await });
            async move { (name, handle.await) }
        });

        let mut insights = Vec::new();
        let mut degraded_agents = Vec::new();
        for (name, joined) in join_all(runs).await {
            let failure = match joined {
                Ok(Ok(found)) => {
                    debug!(agent = %name, insights = found.len(), "Agent finished");
                    insights.extend(found);
                    continue;
                }
                Ok(Err(err)) => err.to_string(),
                Err(join_err) => join_err.to_string(),
            };
            warn!(agent = %name, error = %failure, "Agent degraded");
            insights.push(AgentInsight::degraded(&name, &failure));
            degraded_agents.push(name);
        }

        let ranked = rank_insights(insights);
        self.auto_alert(&ranked).await;

        info!(
            insights = ranked.len(),
            degraded = degraded_agents.len(),
            "Agent cycle complete"
        );
        *self.latest.write().await =
            CycleSnapshot { completed_at: Some(Utc::now()), insights: ranked.clone(), degraded_agents };
        Ok(ranked)
    }

    /// Insights of the last cycle at or above `min_priority`, in ranked order.
    pub async fn insights(&self, min_priority: InsightPriority) -> Vec<AgentInsight> {
        self.latest.read().await.insights.iter().filter(|i| i.priority >= min_priority).cloned().collect()
    }

    /// The last cycle's snapshot.
    pub async fn latest_cycle(&self) -> CycleSnapshot {
        self.latest.read().await.clone()
    }

    /// Performs a mutating action through the permission gate.
    ///
    /// # Errors
    /// See [`ActionGate::request_action`].
    pub async fn request_action(&self, action: ActionRequest) -> Result<ActionReceipt> {
        self.gate.request_action(action).await
    }

    /// Sends one notification per non-degraded HIGH or CRITICAL insight.
    ///
    /// Critical insights go to the critical channel, the rest to the alert
    /// channel. Nothing is sent unless writes are enabled.
    ///
    /// # Errors
    /// `PermissionDenied` before any delivery when writes are disabled;
    /// `ActionFailed` if a delivery fails (earlier deliveries stand).
    pub async fn dispatch_alerts(&self, insights: &[AgentInsight]) -> Result<Vec<DeliveryAck>> {
        let alertable: Vec<&AgentInsight> =
            insights.iter().filter(|i| !i.degraded && i.priority >= InsightPriority::High).collect();
        if alertable.is_empty() {
            return Ok(Vec::new());
        }
        self.gate.permissions().require_write("send_alert")?;

        let integrations = &self.engine.config().integrations;
        let mut acks = Vec::with_capacity(alertable.len());
        for insight in alertable {
            let (channel, severity) = if insight.priority == InsightPriority::Critical {
                (&integrations.critical_channel, AlertSeverity::Critical)
            } else {
                (&integrations.alert_channel, AlertSeverity::Warning)
            };
            let notification = Notification {
                channel: channel.clone(),
                message: format!("[{}] {}: {}", insight.priority, insight.agent_name, insight.summary),
                severity,
                mentions: Vec::new(),
            };
            if let ActionReceipt::AlertDelivered(ack) =
                self.gate.request_action(ActionRequest::SendAlert(notification)).await?
            {
                acks.push(ack);
            }
        }
        Ok(acks)
    }

    /// Opens the pull request proposed by `insight`.
    ///
    /// # Errors
    /// `NoProposedAction` if the insight carries no pull request, otherwise
    /// see [`ActionGate::request_action`].
    pub async fn apply_insight(&self, insight: &AgentInsight) -> Result<ActionReceipt> {
        let request: PullRequest = insight
            .detail
            .get("pull_request")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .ok_or_else(|| OrchestrationError::NoProposedAction(insight.payload_reference.clone()))?;
        self.gate.request_action(ActionRequest::OpenPullRequest(request)).await
    }

    /// Engine, registry and last-cycle health.
    pub async fn status(&self) -> OrchestratorStatus {
        let latest = self.latest.read().await;
        OrchestratorStatus {
            engine: self.engine.status(),
            agents: self.registry.list().await,
            last_cycle_at: latest.completed_at,
            latest_insights: latest.insights.len(),
        }
    }

    async fn auto_alert(&self, ranked: &[AgentInsight]) {
        if !self.engine.config().agents.cost_guard.auto_alert {
            return;
        }
        let cost_guard = AgentKind::CostGuard.name();
        let critical: Vec<AgentInsight> = ranked
            .iter()
            .filter(|i| i.agent_name == cost_guard && i.priority == InsightPriority::Critical)
            .cloned()
            .collect();
        if critical.is_empty() {
            return;
        }
        if !self.gate.permissions().write_enabled() {
            debug!(critical = critical.len(), "Auto-alert skipped: write access disabled");
            return;
        }
        match self.dispatch_alerts(&critical).await {
            Ok(acks) => info!(sent = acks.len(), "Critical anomalies alerted"),
            Err(err) => error!(error = %err, "Auto-alert failed"),
        }
    }
}
