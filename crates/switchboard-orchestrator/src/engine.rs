use crate::manager::TaskManager;
use crate::monitor::HealthMonitor;
use crate::registry::{AgentRegistry, RegistryEvent};
use crate::scheduler::Scheduler;
use crate::store::TaskFilter;
use crate::transport::HealthProbe;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{
    AgentConfig, AgentId, HealthStatus, SwitchboardConfig, SwitchboardResult, TaskId, TaskState,
    TaskTemplate,
};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// What one supervision cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// Agents probed.
    pub probed: usize,
    /// Observations that changed an agent's status.
    pub health_changes: usize,
    /// Tasks taken away from an unreachable or missing agent.
    pub rerouted: Vec<TaskId>,
    /// `Rerouting` tasks given another placement attempt.
    pub retried: Vec<TaskId>,
    /// Tasks submitted by due scheduled jobs.
    pub scheduled: Vec<TaskId>,
}

/// The supervision loop.
///
/// Holds no task or agent state of its own: each cycle probes the agents in
/// the registry, records the results there, hands tasks stranded on lost
/// agents back to the task manager for re-routing, and submits due
/// scheduled jobs. [`run_cycle`](Self::run_cycle) single-steps the loop;
/// [`start`](Self::start) runs it periodically until stopped.
pub struct Orchestrator {
    manager: TaskManager,
    registry: Arc<AgentRegistry>,
    monitor: HealthMonitor,
    scheduler: Mutex<Scheduler>,
    bootstrap: Vec<TaskTemplate>,
    bootstrapped: AtomicBool,
    interval: Duration,
}

impl Orchestrator {
    /// Builds the loop from a resolved configuration.
    ///
    /// Fails if a scheduled job has an invalid cron expression.
    pub fn new(
        manager: TaskManager,
        probe: Arc<dyn HealthProbe>,
        config: &SwitchboardConfig,
    ) -> SwitchboardResult<Self> {
        let registry = manager.registry().clone();
        Ok(Self {
            monitor: HealthMonitor::new(probe, &config.orchestrator),
            scheduler: Mutex::new(Scheduler::new(config.schedules.clone())?),
            bootstrap: config.bootstrap.clone(),
            bootstrapped: AtomicBool::new(false),
            interval: config.orchestrator.health_check_interval(),
            manager,
            registry,
        })
    }

    pub fn manager(&self) -> &TaskManager {
        &self.manager
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Registers the agents declared in configuration.
    pub fn register_agents(&self, agents: &[AgentConfig]) -> SwitchboardResult<()> {
        for agent in agents {
            self.registry.register(agent.descriptor())?;
        }
        Ok(())
    }

    /// Submits the configured bootstrap tasks. Only the first call, from
    /// here or from [`start`](Self::start), submits anything.
    pub async fn submit_bootstrap(&self) -> Vec<TaskId> {
        if self.bootstrapped.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        let mut ids = Vec::with_capacity(self.bootstrap.len());
        for template in &self.bootstrap {
            let id = self.manager.submit(template.to_request()).await;
            info!(task_id = %id, skill = %template.skill, "Bootstrap task submitted");
            ids.push(id);
        }
        ids
    }

    /// Runs one supervision cycle.
    pub async fn run_cycle(&self) -> CycleReport {
        self.run_cycle_at(Utc::now()).await
    }

    /// Runs one supervision cycle, treating `now` as the current time for
    /// scheduled jobs.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport::default();
        self.probe_agents(&mut report).await;
        self.recover_tasks(&mut report).await;
        self.fire_schedules(now, &mut report).await;
        self.publish_health().await;
        debug!(
            probed = report.probed,
            health_changes = report.health_changes,
            rerouted = report.rerouted.len(),
            retried = report.retried.len(),
            scheduled = report.scheduled.len(),
            "Supervision cycle finished"
        );
        report
    }

    async fn probe_agents(&self, report: &mut CycleReport) {
        let agents = self.registry.list();
        report.probed = agents.len();
        for (id, observation) in self.monitor.check_all(&agents).await {
            let before = self.registry.health_of(&id);
            let status = observation.status;
            match self.registry.set_health(&id, observation) {
                Ok(true) if before != Some(status) => report.health_changes += 1,
                Ok(_) => {}
                // Deregistered while the probe was in flight.
                Err(err) => debug!(agent_id = %id, error = %err, "Dropping health observation"),
            }
        }
    }

    async fn recover_tasks(&self, report: &mut CycleReport) {
        for task in self.manager.list(&TaskFilter::default()).await {
            if task.state.is_assigned() {
                let Some(agent) = task.assigned_agent else {
                    continue;
                };
                let cause = match self.registry.health_of(&agent) {
                    None => format!("agent '{agent}' is no longer registered"),
                    Some(HealthStatus::Unreachable) => format!("agent '{agent}' is unreachable"),
                    Some(_) => continue,
                };
                match self.manager.reroute_from(task.id, &agent, &cause).await {
                    Ok(Some(_)) => report.rerouted.push(task.id),
                    Ok(None) => {}
                    Err(err) => debug!(task_id = %task.id, error = %err, "Re-route skipped"),
                }
            } else if task.state == TaskState::Rerouting {
                match self.manager.reroute(task.id, "retrying placement").await {
                    Ok(_) => report.retried.push(task.id),
                    Err(err) => debug!(task_id = %task.id, error = %err, "Retry skipped"),
                }
            }
        }
    }

    async fn fire_schedules(&self, now: DateTime<Utc>, report: &mut CycleReport) {
        let due = self.scheduler.lock().due(now);
        for (job, request) in due {
            let id = self.manager.submit(request).await;
            info!(job = %job, task_id = %id, "Scheduled job fired");
            report.scheduled.push(id);
        }
    }

    /// Writes `agent_health.<id>` per agent and the fleet score to the
    /// knowledge base, if the task manager has one.
    async fn publish_health(&self) {
        let Some(kb) = self.manager.knowledge_base() else {
            return;
        };
        let agents = self.registry.list();
        let mut score = 0.0;
        for agent in &agents {
            score += match agent.health {
                HealthStatus::Healthy => 1.0,
                HealthStatus::Degraded => 0.5,
                HealthStatus::Unknown | HealthStatus::Unreachable => 0.0,
            };
            let value = json!({
                "status": agent.health,
                "last_heartbeat": agent.last_heartbeat,
                "latency_ms": agent.heartbeat_latency.map(|d| d.as_millis() as u64),
            });
            if let Err(err) = kb.set(&format!("agent_health.{}", agent.id), value).await {
                warn!(agent_id = %agent.id, error = %err, "Failed to publish agent health");
            }
        }
        let average = if agents.is_empty() {
            0.0
        } else {
            score / agents.len() as f64
        };
        if let Err(err) = kb.set("agent_health.average_score", json!(average)).await {
            warn!(error = %err, "Failed to publish average health score");
        }
    }

    /// Takes every task off an agent that left the registry.
    pub async fn handle_departure(&self, agent: &AgentId) -> Vec<TaskId> {
        self.manager.router().forget_agent(agent);
        let cause = format!("agent '{agent}' deregistered");
        let mut moved = Vec::new();
        for task in self.manager.tasks_assigned_to(agent).await {
            match self.manager.reroute_from(task.id, agent, &cause).await {
                Ok(Some(_)) => moved.push(task.id),
                Ok(None) => {}
                Err(err) => debug!(task_id = %task.id, error = %err, "Re-route skipped"),
            }
        }
        if !moved.is_empty() {
            info!(agent_id = %agent, tasks = moved.len(), "Re-routed tasks of departed agent");
        }
        moved
    }

    /// Submits the bootstrap tasks unless that already happened, then runs
    /// a cycle every health-check interval until the returned handle is
    /// stopped. Deregistrations are acted on as soon as they are announced.
    pub fn start(self: Arc<Self>) -> OrchestratorHandle {
        let (stop, mut stopped) = watch::channel(false);
        let mut events = self.registry.subscribe();
        let join = tokio::spawn(async move {
            self.submit_bootstrap().await;
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?self.interval, "Orchestrator started");
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => {
                        self.run_cycle().await;
                    }
                    event = events.recv() => match event {
                        Ok(RegistryEvent::Deregistered(agent)) => {
                            self.handle_departure(&agent).await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Registry events lagged; next cycle will reconcile");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            info!("Orchestrator stopped");
        });
        OrchestratorHandle { stop, join }
    }
}

/// Control handle of a running [`Orchestrator`].
pub struct OrchestratorHandle {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl OrchestratorHandle {
    /// Stops the loop and waits for the in-flight cycle to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.join.await {
            warn!(error = %err, "Orchestrator loop ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
