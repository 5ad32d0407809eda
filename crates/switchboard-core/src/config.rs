//! Fully-resolved Switchboard configuration.
//!
//! The engine only consumes [`SwitchboardConfig`]; [`SwitchboardConfig::load`]
//! is a convenience for binaries that keep their settings in a TOML file.

use crate::agent::AgentDescriptor;
use crate::error::{SwitchboardError, SwitchboardResult};
use crate::skill::{Skill, SkillRequest};
use crate::task::TaskRequest;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwitchboardConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Agents registered at startup.
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    /// Tasks submitted once when the orchestrator starts.
    #[serde(default)]
    pub bootstrap: Vec<TaskTemplate>,
    /// Recurring tasks.
    #[serde(default)]
    pub schedules: Vec<ScheduledJob>,
}

/// Tunables of the orchestration engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Period of the health-check cycle.
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// A probe that takes longer than this marks the agent unreachable.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// A probe slower than this marks the agent degraded.
    #[serde(default = "default_degraded_latency_ms")]
    pub degraded_latency_ms: u64,
    /// Re-route attempts allowed per task before it fails with `RoutingExhausted`.
    #[serde(default = "default_max_reroutes")]
    pub max_reroutes: u32,
    /// Per-subscriber event buffer; the oldest events are dropped on overflow.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    /// Prefer the previous agent for tasks sharing an affinity key.
    #[serde(default = "default_sticky_routing")]
    pub sticky_routing: bool,
    /// Capacity of the dead-letter queue.
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}
fn default_probe_timeout_ms() -> u64 {
    5_000
}
fn default_degraded_latency_ms() -> u64 {
    2_000
}
fn default_max_reroutes() -> u32 {
    3
}
fn default_subscriber_buffer() -> usize {
    64
}
fn default_sticky_routing() -> bool {
    true
}
fn default_dead_letter_capacity() -> usize {
    1_000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: default_health_check_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            degraded_latency_ms: default_degraded_latency_ms(),
            max_reroutes: default_max_reroutes(),
            subscriber_buffer: default_subscriber_buffer(),
            sticky_routing: default_sticky_routing(),
            dead_letter_capacity: default_dead_letter_capacity(),
        }
    }
}

impl OrchestratorConfig {
    /// Health-check period as a `Duration`.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Probe timeout as a `Duration`.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Degraded threshold as a `Duration`.
    pub fn degraded_latency(&self) -> Duration {
        Duration::from_millis(self.degraded_latency_ms)
    }
}

/// An agent declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub skills: Vec<Skill>,
}

impl AgentConfig {
    /// The registry descriptor for this agent.
    pub fn descriptor(&self) -> AgentDescriptor {
        AgentDescriptor::new(self.id.as_str(), self.skills.clone())
    }
}

/// A task described in configuration (bootstrap or scheduled).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub skill: String,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub affinity: Option<String>,
}

impl TaskTemplate {
    /// Builds the submission for this template.
    pub fn to_request(&self) -> TaskRequest {
        TaskRequest {
            skill: SkillRequest {
                id: self.skill.clone(),
                params: self.params.clone(),
            },
            payload: self.payload.clone(),
            affinity: self.affinity.clone(),
        }
    }
}

/// A single scheduled job definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub name: String,
    /// 7-field cron expression: sec min hour day-of-month month day-of-week year.
    #[serde(rename = "cron")]
    pub cron_expression: String,
    #[serde(flatten)]
    pub task: TaskTemplate,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl SwitchboardConfig {
    /// Parses a TOML document and validates it.
    pub fn from_toml_str(s: &str) -> SwitchboardResult<Self> {
        let config: SwitchboardConfig = toml::from_str(s)
            .map_err(|e| SwitchboardError::Config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> SwitchboardResult<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            SwitchboardError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Checks invariants serde cannot express.
    pub fn validate(&self) -> SwitchboardResult<()> {
        let o = &self.orchestrator;
        if o.health_check_interval_ms == 0 {
            return Err(SwitchboardError::Config(
                "orchestrator.health_check_interval_ms must be greater than zero".into(),
            ));
        }
        if o.probe_timeout_ms == 0 {
            return Err(SwitchboardError::Config(
                "orchestrator.probe_timeout_ms must be greater than zero".into(),
            ));
        }
        if o.subscriber_buffer == 0 {
            return Err(SwitchboardError::Config(
                "orchestrator.subscriber_buffer must be greater than zero".into(),
            ));
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                return Err(SwitchboardError::Config("agent id must not be empty".into()));
            }
            if !seen.insert(agent.id.as_str()) {
                return Err(SwitchboardError::Config(format!(
                    "duplicate agent id '{}'",
                    agent.id
                )));
            }
            if let Some(skill) = agent.skills.iter().find(|s| s.id.trim().is_empty()) {
                return Err(SwitchboardError::Config(format!(
                    "agent '{}' declares a skill with an empty id ({skill:?})",
                    agent.id
                )));
            }
        }

        for template in self.bootstrap.iter().chain(self.schedules.iter().map(|j| &j.task)) {
            if template.skill.trim().is_empty() {
                return Err(SwitchboardError::Config(
                    "task templates must name a skill".into(),
                ));
            }
        }

        for job in &self.schedules {
            cron::Schedule::from_str(&job.cron_expression).map_err(|e| {
                SwitchboardError::Config(format!(
                    "Invalid cron expression '{}' for job '{}': {e}",
                    job.cron_expression, job.name
                ))
            })?;
        }
        Ok(())
    }
}
