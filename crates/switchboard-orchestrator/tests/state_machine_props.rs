//! Property tests for the task lifecycle, routing and health bookkeeping.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use proptest::prelude::*;
use proptest::test_runner::Config as ProptestConfig;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::*;
use switchboard_orchestrator::*;

struct AcceptAll;

#[async_trait]
impl AgentTransport for AcceptAll {
    async fn dispatch(&self, _agent: &AgentId, _dispatch: Dispatch) -> SwitchboardResult<()> {
        Ok(())
    }

    async fn cancel(&self, _agent: &AgentId, _task_id: TaskId) -> SwitchboardResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Op {
    Acknowledge,
    Progress,
    Complete,
    Fail,
    Cancel,
    Reject,
    Reroute,
    AgentDown(u8),
    AgentUp(u8),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Acknowledge),
        Just(Op::Progress),
        Just(Op::Complete),
        Just(Op::Fail),
        Just(Op::Cancel),
        Just(Op::Reject),
        Just(Op::Reroute),
        (0u8..3).prop_map(Op::AgentDown),
        (0u8..3).prop_map(Op::AgentUp),
    ]
}

fn agent_name(n: u8) -> AgentId {
    AgentId::new(format!("agent-{n}"))
}

async fn apply(manager: &TaskManager, registry: &AgentRegistry, id: TaskId, op: &Op) {
    // Errors are expected for operations that are illegal in the current
    // state; the properties below check that they never corrupt the record.
    let _ = match op {
        Op::Acknowledge => manager.acknowledge(id).await.map(|_| ()),
        Op::Progress => manager.report_progress(id, "tick", None).await.map(|_| ()),
        Op::Complete => manager.complete(id, "done").await.map(|_| ()),
        Op::Fail => manager.fail(id, "broken").await.map(|_| ()),
        Op::Cancel => manager.cancel(id).await.map(|_| ()),
        Op::Reject => {
            let assigned = manager.get(id).await.unwrap().assigned_agent;
            let agent = assigned.unwrap_or_else(|| agent_name(0));
            manager.reject(id, &agent, "no").await.map(|_| ())
        }
        Op::Reroute => manager.reroute(id, "test").await.map(|_| ()),
        Op::AgentDown(n) => registry
            .set_health(&agent_name(*n), HealthObservation::now(HealthStatus::Unreachable))
            .map(|_| ()),
        Op::AgentUp(n) => registry
            .set_health(&agent_name(*n), HealthObservation::now(HealthStatus::Healthy))
            .map(|_| ()),
    };
}

fn check_history(task: &Task) -> Result<(), TestCaseError> {
    let mut state = TaskState::Submitted;
    for (i, event) in task.events.iter().enumerate() {
        prop_assert_eq!(event.seq, i as u64);
        prop_assert!(!state.is_terminal(), "event after terminal state");
        match &event.kind {
            TaskEventKind::StateChanged { from, to, .. } => {
                prop_assert_eq!(*from, state);
                prop_assert!(from.can_transition_to(*to), "illegal edge {} -> {}", from, to);
                state = *to;
            }
            TaskEventKind::Progress { .. } => {
                prop_assert_eq!(state, TaskState::Running);
            }
            TaskEventKind::Completed { .. } => {
                prop_assert!(state.can_transition_to(TaskState::Completed));
                state = TaskState::Completed;
            }
            TaskEventKind::Failed { .. } => {
                prop_assert!(state.can_transition_to(TaskState::Failed));
                state = TaskState::Failed;
            }
            TaskEventKind::Canceled => {
                prop_assert!(state.can_transition_to(TaskState::Canceled));
                state = TaskState::Canceled;
            }
        }
    }
    prop_assert_eq!(state, task.state);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 96,
        // Do not write `.proptest-regressions` files into the repo.
        failure_persistence: None,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_random_operations_follow_lifecycle_edges(
        ops in prop::collection::vec(arb_op(), 1..40),
        max_reroutes in 0u32..4,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let registry = Arc::new(AgentRegistry::new());
            for n in 0..3 {
                registry
                    .register(AgentDescriptor::new(agent_name(n), vec![Skill::new("summarize")]))
                    .unwrap();
            }
            let config = OrchestratorConfig { max_reroutes, ..Default::default() };
            let manager = TaskManager::new(registry.clone(), Arc::new(AcceptAll), &config);
            let id = manager
                .submit(TaskRequest::new(SkillRequest::new("summarize"), "x"))
                .await;

            let mut terminal: Option<TaskSnapshot> = None;
            for op in &ops {
                apply(&manager, &registry, id, op).await;
                let snap = manager.get(id).await.unwrap();
                if let Some(done) = &terminal {
                    // Terminal records are frozen.
                    prop_assert_eq!(&snap, done);
                } else if snap.state.is_terminal() {
                    terminal = Some(snap.clone());
                }
                prop_assert!(snap.reroute_attempts <= max_reroutes);
            }

            let task = manager.task(id).await.unwrap();
            check_history(&task)?;
            if task.state.is_terminal() {
                prop_assert!(task.events.last().unwrap().is_terminal());
                prop_assert_eq!(task.events.iter().filter(|e| e.is_terminal()).count(), 1);
            }
            Ok::<(), TestCaseError>(())
        })?;
    }

    #[test]
    fn prop_routing_is_deterministic(
        agents in prop::collection::vec((0u8..12, prop::option::of(1u64..500), any::<bool>()), 0..10),
    ) {
        let registry = Arc::new(AgentRegistry::new());
        let mut expected: BTreeMap<AgentId, (Option<u64>, bool)> = BTreeMap::new();
        for (n, latency, down) in agents {
            let id = agent_name(n);
            if expected.contains_key(&id) {
                continue;
            }
            registry
                .register(AgentDescriptor::new(id.clone(), vec![Skill::new("summarize")]))
                .unwrap();
            let status = if down { HealthStatus::Unreachable } else { HealthStatus::Healthy };
            let mut obs = HealthObservation::now(status);
            obs.latency = latency.map(Duration::from_millis);
            registry.set_health(&id, obs).unwrap();
            expected.insert(id, (latency, down));
        }

        let router = TaskRouter::new(registry);
        let task = Task::new(TaskRequest::new(SkillRequest::new("summarize"), "x"));
        let first = router.route(&task);
        prop_assert_eq!(&router.route(&task), &first);

        let best = expected
            .iter()
            .filter(|(_, (_, down))| !down)
            .min_by_key(|(id, (latency, _))| (latency.is_none(), *latency, (*id).clone()))
            .map(|(id, _)| id.clone());
        match best {
            Some(id) => prop_assert_eq!(first, Ok(id)),
            None => prop_assert_eq!(first, Err(RoutingFailure::NoEligibleAgent)),
        }
    }

    #[test]
    fn prop_stale_health_never_regresses(
        offsets in prop::collection::vec((0i64..50, any::<bool>()), 1..20),
    ) {
        let registry = AgentRegistry::new();
        let id = AgentId::new("a1");
        registry.register(AgentDescriptor::new("a1", Vec::new())).unwrap();
        let base = Utc::now();

        let mut stored: Option<(chrono::DateTime<Utc>, HealthStatus)> = None;
        for (offset, healthy) in offsets {
            let observed_at = base + ChronoDuration::seconds(offset);
            let status = if healthy { HealthStatus::Healthy } else { HealthStatus::Degraded };
            let applied = registry
                .set_health(&id, HealthObservation { status, observed_at, latency: None })
                .unwrap();
            let should_apply = !stored.is_some_and(|(at, _)| observed_at < at);
            prop_assert_eq!(applied, should_apply);
            if should_apply {
                stored = Some((observed_at, status));
            }
            let current = registry.get(&id).unwrap();
            let (at, expected_status) = stored.unwrap();
            prop_assert_eq!(current.last_heartbeat, Some(at));
            prop_assert_eq!(current.health, expected_status);
        }
    }
}
