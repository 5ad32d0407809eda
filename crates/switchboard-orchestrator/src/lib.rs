//! Agent task orchestration engine.
//!
//! Keeps a live directory of agents and their health, routes each task to
//! an agent that declares the requested skill, drives the task lifecycle
//! state machine, and streams status events to subscribers. A supervision
//! loop probes agents and re-routes tasks stranded on lost ones.
//!
//! # Main types
//!
//! - [`AgentRegistry`]: Known agents, their skills, and last-known health.
//! - [`TaskRouter`]: Deterministic skill-based agent selection with optional sticky routing.
//! - [`TaskManager`]: Task lifecycle: submit, progress, complete, fail, cancel, reject, re-route.
//! - [`Subscription`]: Bounded per-subscriber stream of a task's status events.
//! - [`Orchestrator`]: Periodic health checks, re-routing, and scheduled task injection.
//! - [`InProcessTransport`]: Transport and health probe for agents running in this process.

/// Bounded record of tasks no agent could take.
pub mod dead_letter;
/// Supervision loop.
pub mod engine;
/// Task lifecycle state machine.
pub mod manager;
/// Concurrent health probing.
pub mod monitor;
/// Agent directory.
pub mod registry;
/// Skill-based routing.
pub mod router;
/// Cron-based job scheduler.
pub mod scheduler;
/// Task records and their per-task locks.
pub mod store;
/// Status event fan-out.
pub mod stream;
/// Agent transport, executor, and probe contracts.
pub mod transport;

pub use dead_letter::{DeadLetter, DeadLetterQueue};
pub use engine::{CycleReport, Orchestrator, OrchestratorHandle};
pub use manager::{TaskManager, TaskManagerBuilder};
pub use monitor::HealthMonitor;
pub use registry::{AgentRegistry, RegistryEvent};
pub use router::TaskRouter;
pub use scheduler::Scheduler;
pub use store::{TaskFilter, TaskStore};
pub use stream::Subscription;
pub use transport::{AgentExecutor, AgentTransport, Dispatch, HealthProbe, InProcessTransport};
