//! # flowstate-runtime
//!
//! Runtime wiring for flowstate.
//!
//! This crate provides:
//! - YAML and environment configuration
//! - The orchestrator handle over store, policy and governor
//! - State event fan-out over broadcast channels
//! - Background WAL sync and checkpoints

pub mod broadcast;
pub mod config;
pub mod error;
pub mod maintenance;
pub mod orchestrator;

pub use broadcast::{
    create_broadcaster, EventBroadcaster, EventFilter, EventStream, Subscription,
    SubscriptionType,
};
pub use config::{
    Config, ConfigError, CoordinatorConfig, EventsConfig, FsyncPolicy, MaintenanceConfig,
    PolicyConfig, StorageConfig,
};
pub use error::RuntimeError;
pub use maintenance::{MaintenanceResult, MaintenanceStats, MaintenanceTask};
pub use orchestrator::Orchestrator;
