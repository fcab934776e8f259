//! # flowstate-core
//!
//! Transition engine for flowstate.
//!
//! This crate provides:
//! - Runs, states and the state kind lattice
//! - Rules, tiered policies and the built-in orchestration rules
//! - The transition governor and its per-run units of work
//! - Per-run locking and tag-based concurrency slots
//! - The run store, rebuilt from a snapshot and the write-ahead log

pub mod context;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod governor;
pub mod kind;
pub mod policy;
pub mod rule;
pub mod rules;
pub mod run;
pub mod slots;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod txn;

pub use context::{Rejection, RejectionKind, TransitionContext, TransitionOptions};
pub use coordinator::{RunLockGuard, RunLocks};
pub use error::CoreError;
pub use events::{StateEvent, StateEventSink};
pub use governor::{TransitionGovernor, TransitionResult, TransitionStatus};
pub use kind::StateKind;
pub use policy::{Policy, PolicyBuilder, RegisteredRule};
pub use rule::{KindSet, Rule, RuleExit, TransitionScope};
pub use run::{NewRun, Run};
pub use slots::{ConcurrencySlots, SlotAcquire, SlotLedger, SlotUsage};
pub use snapshot::{RunSnapshot, SlotPoolSnapshot, SnapshotMeta, SnapshotStore, StoreSnapshot};
pub use state::{ProposedState, State};
pub use store::{CheckpointReport, RunStore, DEFAULT_LOCK_TIMEOUT, SNAPSHOT_DIRNAME};
pub use txn::{Committed, Transaction};
