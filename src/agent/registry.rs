//! Explicit agent registration.
//!
//! A registry is an owned collection: callers build one, register agents
//! into it, and take the resulting map. Nothing is shared between registries.

use std::collections::BTreeMap;

use crate::agent::model::Agent;

#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<String, Agent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent. A duplicate name replaces the earlier one.
    pub fn register(&mut self, agent: Agent) -> &mut Self {
        if let Some(previous) = self.agents.get(&agent.name) {
            tracing::warn!(
                name = %agent.name,
                replacing = ?previous,
                "duplicate_agent_name"
            );
        }
        self.agents.insert(agent.name.clone(), agent);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Agent> {
        self.agents.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn into_agents(self) -> BTreeMap<String, Agent> {
        self.agents
    }
}

impl FromIterator<Agent> for AgentRegistry {
    fn from_iter<I: IntoIterator<Item = Agent>>(iter: I) -> Self {
        let mut registry = Self::new();
        for agent in iter {
            registry.register(agent);
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(name: &str, retries: u32) -> Agent {
        Agent::from_fn(name, |_ctx| Box::pin(async { Ok(None) })).with_retries(retries)
    }

    #[test]
    fn duplicate_name_last_wins() {
        let mut registry = AgentRegistry::new();
        registry.register(agent("a", 1)).register(agent("a", 3));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a").unwrap().retries, 3);
    }

    #[test]
    fn registries_are_independent() {
        let first: AgentRegistry = [agent("a", 0), agent("b", 0)].into_iter().collect();
        let second: AgentRegistry = [agent("c", 0)].into_iter().collect();

        let first = first.into_agents();
        assert_eq!(first.keys().collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(second.len(), 1);
        assert!(second.get("a").is_none());
    }
}
