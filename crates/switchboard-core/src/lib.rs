//! Core types and error definitions for Switchboard.
//!
//! This crate provides the vocabulary shared by every Switchboard crate:
//! the error taxonomy, agent and skill descriptions, the task record with
//! its lifecycle states and events, configuration, and the knowledge base
//! contract.
//!
//! # Main types
//!
//! - [`SwitchboardError`]: Unified error enum.
//! - [`SwitchboardResult`]: Convenience alias for `Result<T, SwitchboardError>`.
//! - [`AgentDescriptor`]: An agent's id, declared skills, and last-known health.
//! - [`Skill`] / [`SkillRequest`]: Declared capability and what a task asks for.
//! - [`Task`] / [`TaskState`] / [`TaskEvent`]: Task record, lifecycle, and history.
//! - [`SwitchboardConfig`]: Fully-resolved configuration.
//! - [`KnowledgeBase`]: Shared key-value blackboard.

/// Agent identity, health, and descriptors.
pub mod agent;
/// Configuration structures and TOML loading.
pub mod config;
/// Error taxonomy.
pub mod error;
/// Knowledge base contract and in-memory implementation.
pub mod knowledge;
/// Skills and structured skill matching.
pub mod skill;
/// Task record, lifecycle states, and status events.
pub mod task;

pub use agent::{AgentDescriptor, AgentId, HealthObservation, HealthStatus};
pub use config::{AgentConfig, OrchestratorConfig, ScheduledJob, SwitchboardConfig, TaskTemplate};
pub use error::{RoutingFailure, SwitchboardError, SwitchboardResult};
pub use knowledge::{InMemoryKnowledgeBase, KnowledgeBase, KnowledgeUpdate};
pub use skill::{Skill, SkillRequest};
pub use task::{
    FailureReason, Task, TaskError, TaskEvent, TaskEventKind, TaskId, TaskRequest, TaskSnapshot,
    TaskState,
};
