use parking_lot::RwLock;
use std::collections::HashMap;
use switchboard_core::{
    AgentDescriptor, AgentId, HealthObservation, HealthStatus, SkillRequest, SwitchboardError,
    SwitchboardResult,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Change notifications emitted by the [`AgentRegistry`].
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// A descriptor was added or replaced.
    Registered(AgentId),
    /// A descriptor was removed; tasks assigned to it need a new agent.
    Deregistered(AgentId),
    /// An accepted health observation changed the agent's status.
    HealthChanged {
        id: AgentId,
        from: HealthStatus,
        to: HealthStatus,
    },
}

/// Directory of known agents and their last-known health.
///
/// Lookups take a read lock for the duration of a scan; registration and
/// health updates take the write lock only to swap a single entry. The
/// registry never talks to agents itself.
pub struct AgentRegistry {
    agents: RwLock<HashMap<AgentId, AgentDescriptor>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            agents: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Adds a descriptor.
    ///
    /// Fails with `Conflict` if an agent with the same id is registered and
    /// not `unreachable`. Use [`register_or_replace`](Self::register_or_replace)
    /// to overwrite unconditionally.
    pub fn register(&self, descriptor: AgentDescriptor) -> SwitchboardResult<()> {
        self.insert(descriptor, false).map(|_| ())
    }

    /// Adds or overwrites a descriptor, returning the previous one.
    pub fn register_or_replace(&self, descriptor: AgentDescriptor) -> Option<AgentDescriptor> {
        // Cannot conflict when replacement is requested.
        self.insert(descriptor, true).unwrap_or_default()
    }

    fn insert(
        &self,
        descriptor: AgentDescriptor,
        replace: bool,
    ) -> SwitchboardResult<Option<AgentDescriptor>> {
        let id = descriptor.id.clone();
        let previous = {
            let mut agents = self.agents.write();
            if let Some(existing) = agents.get(&id) {
                if !replace && existing.health != HealthStatus::Unreachable {
                    return Err(SwitchboardError::Conflict(format!(
                        "agent '{id}' is already registered"
                    )));
                }
            }
            agents.insert(id.clone(), descriptor)
        };
        info!(
            agent_id = %id,
            replaced = previous.is_some(),
            "Agent registered"
        );
        let _ = self.events.send(RegistryEvent::Registered(id));
        Ok(previous)
    }

    /// Removes a descriptor.
    pub fn deregister(&self, id: &AgentId) -> SwitchboardResult<AgentDescriptor> {
        let removed = self
            .agents
            .write()
            .remove(id)
            .ok_or_else(|| SwitchboardError::NotFound(format!("agent '{id}'")))?;
        info!(agent_id = %id, "Agent deregistered");
        let _ = self.events.send(RegistryEvent::Deregistered(id.clone()));
        Ok(removed)
    }

    /// Dispatchable agents that can serve `request`, best candidate first.
    ///
    /// Ordered by ascending heartbeat latency (agents without a sample last),
    /// then by id, so the result is a pure function of the registry contents.
    /// Never queues behind a waiting writer while other readers hold the map.
    pub fn lookup_by_skill(&self, request: &SkillRequest) -> Vec<AgentDescriptor> {
        let mut eligible: Vec<AgentDescriptor> = self
            .agents
            .read_recursive()
            .values()
            .filter(|a| a.is_dispatchable() && a.serves(request))
            .cloned()
            .collect();
        eligible.sort_by(|a, b| {
            let key_a = (a.heartbeat_latency.is_none(), a.heartbeat_latency);
            let key_b = (b.heartbeat_latency.is_none(), b.heartbeat_latency);
            key_a.cmp(&key_b).then_with(|| a.id.cmp(&b.id))
        });
        eligible
    }

    /// Applies a health observation.
    ///
    /// Returns `Ok(false)` without touching anything when the observation is
    /// older than the stored heartbeat.
    pub fn set_health(
        &self,
        id: &AgentId,
        observation: HealthObservation,
    ) -> SwitchboardResult<bool> {
        let previous = {
            let mut agents = self.agents.write();
            let agent = agents
                .get_mut(id)
                .ok_or_else(|| SwitchboardError::NotFound(format!("agent '{id}'")))?;
            if agent
                .last_heartbeat
                .is_some_and(|stored| observation.observed_at < stored)
            {
                debug!(
                    agent_id = %id,
                    observed_at = %observation.observed_at,
                    "Ignoring stale health observation"
                );
                return Ok(false);
            }
            let previous = agent.health;
            agent.health = observation.status;
            agent.last_heartbeat = Some(observation.observed_at);
            agent.heartbeat_latency = observation.latency;
            previous
        };

        if previous != observation.status {
            if observation.status == HealthStatus::Unreachable {
                warn!(agent_id = %id, from = %previous, "Agent became unreachable");
            } else {
                info!(agent_id = %id, from = %previous, to = %observation.status, "Agent health changed");
            }
            let _ = self.events.send(RegistryEvent::HealthChanged {
                id: id.clone(),
                from: previous,
                to: observation.status,
            });
        }
        Ok(true)
    }

    pub fn get(&self, id: &AgentId) -> Option<AgentDescriptor> {
        self.agents.read().get(id).cloned()
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.agents.read().contains_key(id)
    }

    /// Health of an agent, or `None` if it is not registered.
    pub fn health_of(&self, id: &AgentId) -> Option<HealthStatus> {
        self.agents.read().get(id).map(|a| a.health)
    }

    /// All descriptors, sorted by id.
    pub fn list(&self) -> Vec<AgentDescriptor> {
        let mut all: Vec<AgentDescriptor> = self.agents.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// Registry change events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;
    use switchboard_core::Skill;

    fn agent(id: &str, skills: &[&str]) -> AgentDescriptor {
        AgentDescriptor::new(id, skills.iter().map(|s| Skill::new(*s)).collect())
    }

    #[test]
    fn test_register_and_get() {
        let registry = AgentRegistry::new();
        registry.register(agent("a1", &["summarize"])).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&AgentId::new("a1")));
        assert_eq!(
            registry.health_of(&AgentId::new("a1")),
            Some(HealthStatus::Unknown)
        );
    }

    #[test]
    fn test_duplicate_registration_conflicts() {
        let registry = AgentRegistry::new();
        registry.register(agent("a1", &["summarize"])).unwrap();
        let err = registry.register(agent("a1", &["translate"])).unwrap_err();
        assert!(matches!(err, SwitchboardError::Conflict(_)));
        // The original descriptor is untouched.
        let stored = registry.get(&AgentId::new("a1")).unwrap();
        assert_eq!(stored.skills[0].id, "summarize");
    }

    #[test]
    fn test_explicit_replace() {
        let registry = AgentRegistry::new();
        registry.register(agent("a1", &["summarize"])).unwrap();
        let previous = registry.register_or_replace(agent("a1", &["translate"]));
        assert_eq!(previous.unwrap().skills[0].id, "summarize");
        assert_eq!(registry.get(&AgentId::new("a1")).unwrap().skills[0].id, "translate");
    }

    #[test]
    fn test_unreachable_agent_can_be_reregistered() {
        let registry = AgentRegistry::new();
        registry.register(agent("a1", &["summarize"])).unwrap();
        registry
            .set_health(&AgentId::new("a1"), HealthObservation::now(HealthStatus::Unreachable))
            .unwrap();
        registry.register(agent("a1", &["summarize"])).unwrap();
        assert_eq!(
            registry.health_of(&AgentId::new("a1")),
            Some(HealthStatus::Unknown)
        );
    }

    #[test]
    fn test_deregister_unknown_is_not_found() {
        let registry = AgentRegistry::new();
        let err = registry.deregister(&AgentId::new("ghost")).unwrap_err();
        assert!(matches!(err, SwitchboardError::NotFound(_)));
    }

    #[test]
    fn test_lookup_excludes_unreachable_and_non_matching() {
        let registry = AgentRegistry::new();
        registry.register(agent("a1", &["summarize"])).unwrap();
        registry.register(agent("a2", &["summarize"])).unwrap();
        registry.register(agent("a3", &["translate"])).unwrap();
        registry
            .set_health(&AgentId::new("a1"), HealthObservation::now(HealthStatus::Unreachable))
            .unwrap();

        let found = registry.lookup_by_skill(&SkillRequest::new("summarize"));
        let ids: Vec<&str> = found.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["a2"]);
    }

    #[test]
    fn test_lookup_orders_by_latency_then_id() {
        let registry = AgentRegistry::new();
        for id in ["c", "b", "a", "d"] {
            registry.register(agent(id, &["summarize"])).unwrap();
        }
        let obs = |ms| HealthObservation::now(HealthStatus::Healthy).with_latency(Duration::from_millis(ms));
        registry.set_health(&AgentId::new("c"), obs(10)).unwrap();
        registry.set_health(&AgentId::new("d"), obs(10)).unwrap();
        registry.set_health(&AgentId::new("b"), obs(50)).unwrap();
        // "a" has no latency sample and sorts last.

        let found = registry.lookup_by_skill(&SkillRequest::new("summarize"));
        let ids: Vec<&str> = found.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "d", "b", "a"]);
    }

    #[test]
    fn test_stale_health_is_ignored() {
        let registry = AgentRegistry::new();
        let id = AgentId::new("a1");
        registry.register(agent("a1", &["summarize"])).unwrap();

        let now = Utc::now();
        let fresh = HealthObservation {
            status: HealthStatus::Healthy,
            observed_at: now,
            latency: Some(Duration::from_millis(5)),
        };
        assert!(registry.set_health(&id, fresh).unwrap());

        let stale = HealthObservation {
            status: HealthStatus::Unreachable,
            observed_at: now - ChronoDuration::seconds(10),
            latency: None,
        };
        assert!(!registry.set_health(&id, stale).unwrap());

        let stored = registry.get(&id).unwrap();
        assert_eq!(stored.health, HealthStatus::Healthy);
        assert_eq!(stored.last_heartbeat, Some(now));
        assert_eq!(stored.heartbeat_latency, Some(Duration::from_millis(5)));
    }

    #[test]
    fn test_set_health_unknown_agent() {
        let registry = AgentRegistry::new();
        let err = registry
            .set_health(&AgentId::new("ghost"), HealthObservation::now(HealthStatus::Healthy))
            .unwrap_err();
        assert!(matches!(err, SwitchboardError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let registry = AgentRegistry::new();
        let mut rx = registry.subscribe();
        let id = AgentId::new("a1");

        registry.register(agent("a1", &["summarize"])).unwrap();
        registry
            .set_health(&id, HealthObservation::now(HealthStatus::Healthy))
            .unwrap();
        // Same status again: no event.
        registry
            .set_health(&id, HealthObservation::now(HealthStatus::Healthy))
            .unwrap();
        registry.deregister(&id).unwrap();

        assert_eq!(rx.recv().await.unwrap(), RegistryEvent::Registered(id.clone()));
        assert_eq!(
            rx.recv().await.unwrap(),
            RegistryEvent::HealthChanged {
                id: id.clone(),
                from: HealthStatus::Unknown,
                to: HealthStatus::Healthy,
            }
        );
        assert_eq!(rx.recv().await.unwrap(), RegistryEvent::Deregistered(id));
    }

    #[test]
    fn test_lookup_does_not_wait_behind_pending_writer() {
        let registry = std::sync::Arc::new(AgentRegistry::new());
        registry.register(agent("a1", &["summarize"])).unwrap();

        let held = registry.agents.read();
        let writer = {
            let registry = registry.clone();
            std::thread::spawn(move || registry.register(agent("a2", &["summarize"])))
        };
        // Give the writer time to park on the lock.
        std::thread::sleep(Duration::from_millis(50));

        let found = registry.lookup_by_skill(&SkillRequest::new("summarize"));
        assert_eq!(found.len(), 1);

        drop(held);
        writer.join().unwrap().unwrap();
        assert_eq!(registry.len(), 2);
    }
}
