use crate::skill::{Skill, SkillRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Stable identifier of an agent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Wraps a raw id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for AgentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Last-known liveness of an agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Never probed.
    #[default]
    Unknown,
    /// Responding normally.
    Healthy,
    /// Responding, but slowly or partially.
    Degraded,
    /// Not responding; never selected for dispatch.
    Unreachable,
}

impl HealthStatus {
    /// Whether an agent in this state may receive new tasks.
    pub fn is_dispatchable(self) -> bool {
        self != HealthStatus::Unreachable
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Unknown => write!(f, "unknown"),
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// One health report about an agent, as produced by a probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthObservation {
    /// Observed status.
    pub status: HealthStatus,
    /// When the observation was taken. Older observations than the stored
    /// heartbeat are discarded.
    pub observed_at: DateTime<Utc>,
    /// Probe round-trip time, when one was measured.
    #[serde(default, with = "duration_ms")]
    pub latency: Option<Duration>,
}

impl HealthObservation {
    /// An observation taken now without a latency sample.
    pub fn now(status: HealthStatus) -> Self {
        Self {
            status,
            observed_at: Utc::now(),
            latency: None,
        }
    }

    /// Attaches a latency sample.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

/// Everything the registry knows about one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Stable id.
    pub id: AgentId,
    /// Declared skills, in declaration order.
    pub skills: Vec<Skill>,
    /// Current health.
    #[serde(default)]
    pub health: HealthStatus,
    /// Timestamp of the newest accepted health observation.
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Latency of the newest accepted health observation.
    #[serde(default, with = "duration_ms")]
    pub heartbeat_latency: Option<Duration>,
}

impl AgentDescriptor {
    /// A fresh descriptor in the `unknown` health state.
    pub fn new(id: impl Into<AgentId>, skills: Vec<Skill>) -> Self {
        Self {
            id: id.into(),
            skills,
            health: HealthStatus::Unknown,
            last_heartbeat: None,
            heartbeat_latency: None,
        }
    }

    /// Whether any declared skill serves `request`.
    pub fn serves(&self, request: &SkillRequest) -> bool {
        self.skills.iter().any(|s| s.satisfies(request))
    }

    /// Whether the agent may currently receive tasks.
    pub fn is_dispatchable(&self) -> bool {
        self.health.is_dispatchable()
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        value.map(|d| d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_new_descriptor_is_unknown_and_dispatchable() {
        let agent = AgentDescriptor::new("a1", vec![Skill::new("summarize")]);
        assert_eq!(agent.health, HealthStatus::Unknown);
        assert!(agent.is_dispatchable());
        assert!(agent.last_heartbeat.is_none());
    }

    #[test]
    fn test_unreachable_not_dispatchable() {
        assert!(!HealthStatus::Unreachable.is_dispatchable());
        assert!(HealthStatus::Degraded.is_dispatchable());
    }

    #[test]
    fn test_serves_any_declared_skill() {
        let agent = AgentDescriptor::new(
            "a1",
            vec![Skill::new("summarize"), Skill::new("translate")],
        );
        assert!(agent.serves(&SkillRequest::new("translate")));
        assert!(!agent.serves(&SkillRequest::new("classify")));
    }

    #[test]
    fn test_descriptor_latency_serializes_as_millis() {
        let mut agent = AgentDescriptor::new("a1", vec![]);
        agent.heartbeat_latency = Some(Duration::from_millis(42));
        let json = serde_json::to_value(&agent).unwrap();
        assert_eq!(json["heartbeat_latency"], 42);
        let back: AgentDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(back.heartbeat_latency, Some(Duration::from_millis(42)));
    }

    #[test]
    fn test_health_display() {
        assert_eq!(HealthStatus::Unreachable.to_string(), "unreachable");
        assert_eq!(AgentId::new("a1").to_string(), "a1");
    }
}
