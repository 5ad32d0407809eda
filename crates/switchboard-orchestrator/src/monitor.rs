use crate::transport::HealthProbe;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{AgentDescriptor, AgentId, HealthObservation, HealthStatus, OrchestratorConfig};
use tokio::time::Instant;
use tracing::debug;

/// Turns probe results into health observations.
///
/// A probe that errors or outlives the timeout yields `unreachable`. A
/// healthy answer slower than the degraded threshold yields `degraded`.
/// The measured round trip is recorded as the observation's latency.
pub struct HealthMonitor {
    probe: Arc<dyn HealthProbe>,
    timeout: Duration,
    degraded_latency: Duration,
}

impl HealthMonitor {
    pub fn new(probe: Arc<dyn HealthProbe>, config: &OrchestratorConfig) -> Self {
        Self::with_limits(probe, config.probe_timeout(), config.degraded_latency())
    }

    pub fn with_limits(
        probe: Arc<dyn HealthProbe>,
        timeout: Duration,
        degraded_latency: Duration,
    ) -> Self {
        Self {
            probe,
            timeout,
            degraded_latency,
        }
    }

    /// Probes one agent.
    pub async fn check(&self, agent: &AgentDescriptor) -> HealthObservation {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.probe.probe(agent)).await;
        let latency = started.elapsed();
        match outcome {
            Ok(Ok(status)) => {
                let status = if status == HealthStatus::Healthy && latency > self.degraded_latency {
                    HealthStatus::Degraded
                } else {
                    status
                };
                HealthObservation::now(status).with_latency(latency)
            }
            Ok(Err(err)) => {
                debug!(agent_id = %agent.id, error = %err, "Health probe failed");
                HealthObservation::now(HealthStatus::Unreachable)
            }
            Err(_) => {
                debug!(agent_id = %agent.id, timeout = ?self.timeout, "Health probe timed out");
                HealthObservation::now(HealthStatus::Unreachable)
            }
        }
    }

    /// Probes all agents concurrently.
    pub async fn check_all(&self, agents: &[AgentDescriptor]) -> Vec<(AgentId, HealthObservation)> {
        join_all(
            agents
                .iter()
                .map(|agent| async move { (agent.id.clone(), self.check(agent).await) }),
        )
        .await
    }
}
