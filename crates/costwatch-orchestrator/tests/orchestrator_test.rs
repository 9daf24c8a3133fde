//! Agent cycles against in-memory collaborators.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use costwatch_abstraction::mock::{InMemoryLedger, RecordingActions, ScriptedOracle};
use costwatch_abstraction::{
    AlertSeverity, CostRecord, DryRunResult, LedgerError, Notification, TimeRange,
};
use costwatch_core::{CostError, CostIntelligence, CostwatchConfig, PermissionState, WatchedQuery, trailing_days_window};
use costwatch_orchestrator::{
    ActionReceipt, ActionRequest, Agent, AgentContext, AgentInsight, InsightPriority,
    OrchestrationError, Orchestrator,
};
use std::sync::Arc;

const WINDOW_DAYS: i64 = 11;

const ORIGINAL: &str = "SELECT order_id, customer_id, amount
FROM sales.orders
WHERE region = 'EU'";

const PARTITIONED: &str = "SELECT order_id, customer_id, amount
FROM sales.orders
WHERE order_date >= '2024-01-01' AND region = 'EU'";

fn window() -> TimeRange {
    trailing_days_window(Utc::now(), WINDOW_DAYS)
}

/// One record per day of the detection window, `costs[i]` on day `i`.
fn daily_records(costs: &[f64]) -> Vec<CostRecord> {
    let start = window().start;
    costs
        .iter()
        .enumerate()
        .map(|(i, cost)| CostRecord {
            timestamp: start + Duration::days(i as i64) + Duration::hours(12),
            project: "analytics".to_string(),
            dataset: "sales".to_string(),
            user: "ana@example.com".to_string(),
            query_id: format!("job-{}", i),
            bytes_processed: 1 << 30,
            cost_usd: *cost,
            query_class: "select".to_string(),
        })
        .collect()
}

fn spike() -> Vec<CostRecord> {
    let mut costs = vec![100.0; WINDOW_DAYS as usize - 1];
    costs.push(400.0);
    daily_records(&costs)
}

fn config(write_enabled: bool) -> CostwatchConfig {
    let mut config = CostwatchConfig::default();
    config.thresholds.detection_window_days = WINDOW_DAYS;
    config.permissions.write_enabled = write_enabled;
    config
}

fn dry(bytes: u64, cost: f64) -> Result<DryRunResult, LedgerError> {
    Ok(DryRunResult { bytes_processed: bytes, cost_estimate_usd: cost, schema: vec![] })
}

async fn orchestrator(
    config: CostwatchConfig,
    ledger: InMemoryLedger,
    oracle: ScriptedOracle,
    actions: &Arc<RecordingActions>,
) -> Orchestrator {
    let permissions = PermissionState::from_config(&config);
    let engine = CostIntelligence::new(config, permissions, Arc::new(ledger), Arc::new(oracle));
    Orchestrator::from_config(engine, Arc::clone(actions) as _, Arc::clone(actions) as _).await
}

struct FailingAgent;

#[async_trait]
impl Agent for FailingAgent {
    fn name(&self) -> &str {
        "failing"
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    async fn run(&self, _ctx: &AgentContext) -> costwatch_orchestrator::Result<Vec<AgentInsight>> {
        Err(CostError::InsufficientData { series: "total".to_string(), points: 0, required: 4 }.into())
    }
}

struct PanickingAgent;

#[async_trait]
impl Agent for PanickingAgent {
    fn name(&self) -> &str {
        "panicking"
    }

    fn description(&self) -> &str {
        "Always panics"
    }

    async fn run(&self, _ctx: &AgentContext) -> costwatch_orchestrator::Result<Vec<AgentInsight>> {
        panic!("agent bug");
    }
}

struct RepeatingAgent;

#[async_trait]
impl Agent for RepeatingAgent {
    fn name(&self) -> &str {
        "repeating"
    }

    fn description(&self) -> &str {
        "Reports the same thing twice"
    }

    async fn run(&self, _ctx: &AgentContext) -> costwatch_orchestrator::Result<Vec<AgentInsight>> {
        Ok(vec![
            AgentInsight::new("repeating", InsightPriority::Medium, "dup", "first"),
            AgentInsight::new("repeating", InsightPriority::Medium, "dup", "second"),
            AgentInsight::new("repeating", InsightPriority::Low, "other", "third"),
        ])
    }
}

#[tokio::test]
async fn critical_spike_is_reported_and_alerted_when_writes_are_enabled() {
    let actions = Arc::new(RecordingActions::new());
    let orchestrator =
        orchestrator(config(true), InMemoryLedger::new(spike()), ScriptedOracle::default(), &actions).await;

    let insights = orchestrator.run_cycle::<&str>(&[]).await.unwrap();

    assert_eq!(insights.len(), 1);
    let insight = &insights[0];
    assert_eq!(insight.agent_name, "cost_guard");
    assert_eq!(insight.priority, InsightPriority::Critical);
    assert!(insight.payload_reference.starts_with("anomaly:total:"));

    let sent = actions.notifications();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].channel, "#data-ops-critical");
    assert_eq!(sent[0].severity, AlertSeverity::Critical);
}

#[tokio::test]
async fn nothing_leaves_the_process_when_writes_are_disabled() {
    let actions = Arc::new(RecordingActions::new());
    let mut config = config(false);
    config.agents.automation.enabled = true;
    config.agents.query_optimizer.watched_queries.push(WatchedQuery {
        name: "eu_orders".to_string(),
        sql: ORIGINAL.to_string(),
        path: None,
    });
    let ledger = InMemoryLedger::new(spike())
        .with_dry_run(ORIGINAL, dry(2_300_000_000_000, 127.0))
        .with_dry_run(PARTITIONED, dry(400_000_000_000, 23.0));
    let orchestrator = orchestrator(
        config,
        ledger,
        ScriptedOracle::new(vec![PARTITIONED.to_string()]),
        &actions,
    )
    .await;

    let insights = orchestrator.run_cycle::<&str>(&[]).await.unwrap();
    assert!(insights.iter().any(|i| i.priority == InsightPriority::Critical));

    let err = orchestrator.dispatch_alerts(&insights).await.unwrap_err();
    assert!(err.is_permission_denied());

    let proposal = insights.iter().find(|i| i.agent_name == "automation").unwrap();
    assert!(orchestrator.apply_insight(proposal).await.unwrap_err().is_permission_denied());

    let alert = ActionRequest::SendAlert(Notification {
        channel: "#data-ops-alerts".to_string(),
        message: "manual".to_string(),
        severity: AlertSeverity::Info,
        mentions: vec![],
    });
    assert!(orchestrator.request_action(alert).await.unwrap_err().is_permission_denied());

    assert_eq!(actions.total_calls(), 0);
}

#[tokio::test]
async fn failing_and_panicking_agents_do_not_abort_the_cycle() {
    let actions = Arc::new(RecordingActions::new());
    let orchestrator =
        orchestrator(config(false), InMemoryLedger::new(spike()), ScriptedOracle::default(), &actions).await;
    orchestrator.register_agent(Arc::new(FailingAgent)).await;
    orchestrator.register_agent(Arc::new(PanickingAgent)).await;

    let insights = orchestrator.run_cycle(&["failing", "cost_guard", "panicking"]).await.unwrap();

    assert_eq!(insights.len(), 3);
    assert_eq!(insights[0].agent_name, "cost_guard");
    let degraded: Vec<&str> =
        insights.iter().filter(|i| i.degraded).map(|i| i.payload_reference.as_str()).collect();
    assert_eq!(degraded.len(), 2);
    assert!(degraded.contains(&"degraded:failing"));
    assert!(degraded.contains(&"degraded:panicking"));
    assert!(insights[1..].iter().all(|i| i.priority == InsightPriority::Low));

    let snapshot = orchestrator.latest_cycle().await;
    assert_eq!(snapshot.degraded_agents.len(), 2);
}

#[tokio::test]
async fn unknown_agent_fails_before_anything_runs() {
    let actions = Arc::new(RecordingActions::new());
    let ledger = InMemoryLedger::new(spike());
    let orchestrator = orchestrator(config(true), ledger, ScriptedOracle::default(), &actions).await;

    let err = orchestrator.run_cycle(&["cost_guard", "budget_bot"]).await.unwrap_err();

    assert!(matches!(err, OrchestrationError::UnknownAgent(name) if name == "budget_bot"));
    assert!(orchestrator.latest_cycle().await.completed_at.is_none());
    assert_eq!(actions.total_calls(), 0);
}

#[tokio::test]
async fn insights_are_deduplicated() {
    let actions = Arc::new(RecordingActions::new());
    let orchestrator =
        orchestrator(config(false), InMemoryLedger::default(), ScriptedOracle::default(), &actions).await;
    orchestrator.register_agent(Arc::new(RepeatingAgent)).await;

    let insights = orchestrator.run_cycle(&["repeating"]).await.unwrap();

    let summaries: Vec<&str> = insights.iter().map(|i| i.summary.as_str()).collect();
    assert_eq!(summaries, vec!["first", "third"]);
}

#[tokio::test]
async fn snapshot_is_replaced_and_filtered_by_priority() {
    let actions = Arc::new(RecordingActions::new());
    let orchestrator =
        orchestrator(config(false), InMemoryLedger::new(spike()), ScriptedOracle::default(), &actions).await;
    orchestrator.register_agent(Arc::new(RepeatingAgent)).await;

    orchestrator.run_cycle::<&str>(&[]).await.unwrap();
    assert_eq!(orchestrator.insights(InsightPriority::Low).await.len(), 3);
    assert_eq!(orchestrator.insights(InsightPriority::High).await.len(), 1);

    orchestrator.run_cycle(&["repeating"]).await.unwrap();
    let remaining = orchestrator.insights(InsightPriority::Low).await;
    assert_eq!(remaining.len(), 2);
    assert!(remaining.iter().all(|i| i.agent_name == "repeating"));
    assert!(orchestrator.insights(InsightPriority::High).await.is_empty());
}

#[tokio::test]
async fn sla_sentinel_flags_a_forecast_over_budget() {
    let actions = Arc::new(RecordingActions::new());
    let ledger = InMemoryLedger::new(daily_records(&[1_200.0; WINDOW_DAYS as usize]));
    let orchestrator = orchestrator(config(false), ledger, ScriptedOracle::default(), &actions).await;

    let insights = orchestrator.run_cycle(&["sla_sentinel"]).await.unwrap();

    assert_eq!(insights.len(), 1);
    assert_eq!(insights[0].priority, InsightPriority::Critical);
    assert_eq!(insights[0].payload_reference, "sla:daily_budget");
    assert_eq!(insights[0].detail["compliance"], 0.0);
}

#[tokio::test]
async fn automation_proposal_opens_a_pull_request_through_the_gate() -> anyhow::Result<()> {
    let actions = Arc::new(RecordingActions::new());
    let mut config = config(true);
    config.agents.automation.enabled = true;
    config.agents.query_optimizer.watched_queries.push(WatchedQuery {
        name: "eu_orders".to_string(),
        sql: ORIGINAL.to_string(),
        path: Some("models/eu_orders.sql".to_string()),
    });
    let ledger = InMemoryLedger::default()
        .with_dry_run(ORIGINAL, dry(2_300_000_000_000, 127.0))
        .with_dry_run(PARTITIONED, dry(400_000_000_000, 23.0));
    let orchestrator = orchestrator(
        config,
        ledger,
        ScriptedOracle::new(vec![PARTITIONED.to_string()]),
        &actions,
    )
    .await;

    let insights = orchestrator.run_cycle(&["query_optimizer", "automation"]).await?;

    let optimized = insights.iter().find(|i| i.agent_name == "query_optimizer").unwrap();
    assert_eq!(optimized.priority, InsightPriority::Critical);
    assert_eq!(optimized.payload_reference, "query:eu_orders");

    let proposal = insights.iter().find(|i| i.agent_name == "automation").unwrap();
    assert_eq!(proposal.payload_reference, "pr:eu_orders");
    assert_eq!(actions.total_calls(), 0);

    let receipt = orchestrator.apply_insight(proposal).await?;
    assert!(matches!(receipt, ActionReceipt::PullRequestOpened { .. }));

    let opened = actions.pull_requests();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].repository, "data-platform/warehouse");
    assert_eq!(opened[0].reviewers, vec!["data-engineering-team".to_string()]);
    assert!(opened[0].diff.starts_with("--- a/models/eu_orders.sql"));
    assert!(opened[0].diff.contains("+WHERE order_date >= '2024-01-01' AND region = 'EU'"));

    let err = orchestrator.apply_insight(optimized).await.unwrap_err();
    assert!(matches!(err, OrchestrationError::NoProposedAction(_)));
    Ok(())
}

#[tokio::test]
async fn watched_query_over_the_warning_cost_without_a_rewrite_is_flagged() {
    let cheap = "SELECT order_id FROM sales.orders WHERE order_date = CURRENT_DATE()";
    let actions = Arc::new(RecordingActions::new());
    let mut config = config(false);
    for (name, sql) in [("eu_orders", ORIGINAL), ("todays_orders", cheap)] {
        config.agents.query_optimizer.watched_queries.push(WatchedQuery {
            name: name.to_string(),
            sql: sql.to_string(),
            path: None,
        });
    }
    let ledger = InMemoryLedger::default()
        .with_dry_run(ORIGINAL, dry(200_000_000_000, 80.0))
        .with_dry_run(cheap, dry(1_000_000_000, 5.0));
    let orchestrator = orchestrator(config, ledger, ScriptedOracle::default(), &actions).await;

    let insights = orchestrator.run_cycle(&["query_optimizer"]).await.unwrap();

    assert_eq!(insights.len(), 1);
    assert_eq!(insights[0].payload_reference, "cost_warning:eu_orders");
    assert_eq!(insights[0].priority, InsightPriority::Critical);
    assert_eq!(insights[0].detail["cost_usd"], 80.0);
    assert_eq!(insights[0].detail["warning_usd"], 50.0);
}

#[tokio::test]
async fn status_reports_agents_and_last_cycle() {
    let actions = Arc::new(RecordingActions::new());
    let orchestrator =
        orchestrator(config(false), InMemoryLedger::new(spike()), ScriptedOracle::default(), &actions).await;

    let before = orchestrator.status().await;
    assert!(before.last_cycle_at.is_none());
    let names: Vec<String> = before.agents.into_iter().map(|a| a.name).collect();
    assert_eq!(names, vec!["cost_guard", "query_optimizer", "sla_sentinel"]);

    orchestrator.run_cycle::<&str>(&[]).await.unwrap();
    let after = orchestrator.status().await;
    assert!(after.last_cycle_at.is_some());
    assert_eq!(after.latest_insights, 1);
    assert!(!after.engine.write_enabled);
}
