//! Agent registry for managing registered agents.

use crate::agents::Agent;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Metadata about a registered agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentMetadata {
    /// The agent's unique name.
    pub name: String,
    /// The agent's description.
    pub description: String,
}

/// Registry of agents keyed by name.
pub struct AgentRegistry {
    agents: RwLock<BTreeMap<String, Arc<dyn Agent>>>,
}

impl fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agent_count", &self.agents.try_read().map(|a| a.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl AgentRegistry {
    /// Creates a new empty agent registry.
    #[must_use]
    pub fn new() -> Self {
        Self { agents: RwLock::new(BTreeMap::new()) }
    }

    /// Registers an agent.
    ///
    /// Returns `true` if the agent was newly registered, `false` if it replaced
    /// an agent of the same name.
    pub async fn register(&self, agent: Arc<dyn Agent>) -> bool {
        let name = agent.name().to_string();
        debug!(agent = %name, "Registering agent");

        let replaced = self.agents.write().await.insert(name.clone(), agent).is_some();
        if replaced {
            warn!(agent = %name, "Agent replaced in registry");
        }
        !replaced
    }

    /// Retrieves an agent by name.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.read().await.get(name).cloned()
    }

    /// All registered agents, ordered by name.
    pub async fn all(&self) -> Vec<Arc<dyn Agent>> {
        self.agents.read().await.values().cloned().collect()
    }

    /// Metadata of every registered agent, ordered by name.
    pub async fn list(&self) -> Vec<AgentMetadata> {
        self.agents
            .read()
            .await
            .values()
            .map(|agent| AgentMetadata {
                name: agent.name().to_string(),
                description: agent.description().to_string(),
            })
            .collect()
    }

    /// Unregisters an agent.
    ///
    /// Returns `true` if the agent was found and removed.
    pub async fn unregister(&self, name: &str) -> bool {
        debug!(agent = %name, "Unregistering agent");

        let removed = self.agents.write().await.remove(name).is_some();
        if !removed {
            warn!(agent = %name, "Attempted to unregister non-existent agent");
        }
        removed
    }

    /// Returns the number of registered agents.
    pub async fn count(&self) -> usize {
        self.agents.read().await.len()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
