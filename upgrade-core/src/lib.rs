//! Experiment assignment for A/B tests.
//!
//! Decides which condition a user sees at each decision point of a running
//! experiment, consistently across calls and with overrides for testers and
//! support staff.
//!
//! # Architecture
//!
//! - **Registries** ([`PartitionRegistry`], [`ConditionCatalog`]) validate and
//!   materialise the children of an experiment
//! - **Lifecycle** ([`ExperimentManager`]) commits every edit as one
//!   versioned [`storage::Transaction`]
//! - **Overrides** ([`ExplicitAssignments`], [`PreviewUsers`]) pin users to
//!   conditions ahead of randomization
//! - **Engine** ([`AssignmentEngine`]) resolves users and persists first draws
//! - **Storage** ([`storage`]) is consumed through async traits, with an
//!   in-memory and a libSQL implementation
//!
//! [`Services`] wires all of it from an [`UpgradeConfig`].

pub mod clock;
mod conditions;
pub mod config;
pub mod engine;
mod error;
pub mod experiment;
mod lifecycle;
pub mod overrides;
mod partitions;
mod services;
pub mod storage;
mod support;
mod types;
mod validation;

// Registries
pub use conditions::ConditionCatalog;
pub use partitions::PartitionRegistry;

// Lifecycle
pub use lifecycle::{Actor, ExperimentManager};

// Overrides
pub use overrides::{
    ExplicitAssignment, ExplicitAssignments, OverrideScope, PreviewAssignmentSpec, PreviewUser,
    PreviewUsers,
};

// Resolution
pub use engine::{
    AssignedCondition, AssignmentEngine, AssignmentRecord, AssignmentSource, ConditionAssignment,
    DecisionPointAssignment, DecisionPointVisit, ExperimentUser, NoAssignmentReason, Resolution,
};

// Data model
pub use experiment::{
    AssignmentUnit, Condition, ConditionSpec, ConsistencyRule, Experiment, ExperimentSpec,
    ExperimentState, Partition, PartitionSpec, PostExperimentRule,
};

// Support, wiring and configuration
pub use config::{ResolutionConfig, StorageConfig, UpgradeConfig};
pub use services::Services;
pub use support::SupportService;

// Errors
pub use error::{Error, NotFound, Result};
pub use validation::Violation;

// ID types
pub use types::{AssignmentId, ConditionId, ExperimentId, PartitionId, UserId};
