//! Topic to agent routing table
//!
//! Lookups hand out `Arc<[Arc<Agent>]>` snapshots. Mutations replace the
//! per-topic slice instead of editing it in place, so a dispatch that already
//! holds a snapshot never observes a half-applied change.

use super::{Agent, AgentId};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use tracing::debug;

/// Immutable snapshot of the agents bound to one topic
pub type AgentList = Arc<[Arc<Agent>]>;

fn empty_list() -> AgentList {
    static EMPTY: OnceLock<AgentList> = OnceLock::new();
    EMPTY.get_or_init(|| Arc::from(Vec::new())).clone()
}

#[derive(Default)]
struct RegistryInner {
    by_topic: HashMap<String, AgentList>,
    /// First-registration order of topics, for enumeration
    topic_order: Vec<String>,
}

/// Registered agents keyed by topic, insertion order preserved per topic
#[derive(Default)]
pub struct AgentRegistry {
    inner: RwLock<RegistryInner>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an agent to its topic's sequence
    ///
    /// Registering the same agent twice is accepted and makes it run twice
    /// per matching record.
    pub fn register(&self, agent: Arc<Agent>) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let topic = agent.topic().to_string();

        let updated: AgentList = match inner.by_topic.get(&topic) {
            Some(existing) => {
                let mut agents = existing.to_vec();
                agents.push(agent.clone());
                Arc::from(agents)
            }
            None => {
                inner.topic_order.push(topic.clone());
                Arc::from(vec![agent.clone()])
            }
        };

        debug!(
            topic = %topic,
            agent = %agent.label(),
            agents_on_topic = updated.len(),
            "Registered agent"
        );
        inner.by_topic.insert(topic, updated);
    }

    /// Agents subscribed to `topic`; empty when none are registered
    pub fn lookup(&self, topic: &str) -> AgentList {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .by_topic
            .get(topic)
            .cloned()
            .unwrap_or_else(empty_list)
    }

    /// Remove every registration of the agent with `id`
    ///
    /// Returns whether anything was removed. Snapshots already handed out by
    /// [`AgentRegistry::lookup`] are unaffected.
    pub fn remove(&self, id: &AgentId) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        let Some(topic) = inner
            .by_topic
            .iter()
            .find(|(_, agents)| agents.iter().any(|a| a.id() == *id))
            .map(|(topic, _)| topic.clone())
        else {
            return false;
        };

        let remaining: Vec<Arc<Agent>> = inner.by_topic[&topic]
            .iter()
            .filter(|a| a.id() != *id)
            .cloned()
            .collect();

        if remaining.is_empty() {
            inner.by_topic.remove(&topic);
            inner.topic_order.retain(|t| t != &topic);
        } else {
            inner.by_topic.insert(topic.clone(), Arc::from(remaining));
        }

        debug!(topic = %topic, agent_id = %id, "Removed agent");
        true
    }

    /// Topics with at least one agent, in first-registration order
    pub fn topics(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.topic_order.clone()
    }

    /// Every registration, grouped by topic in first-registration order
    pub fn agents(&self) -> Vec<Arc<Agent>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .topic_order
            .iter()
            .filter_map(|topic| inner.by_topic.get(topic))
            .flat_map(|agents| agents.iter().cloned())
            .collect()
    }

    /// Total number of registrations
    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_topic.values().map(|agents| agents.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("topics", &self.topics())
            .field("agents", &self.len())
            .finish()
    }
}
