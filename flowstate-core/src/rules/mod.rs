//! Built-in rules.
//!
//! Core rules encode orchestration policy (scheduling, retries, slot
//! limits). Global rules keep runs consistent (terminal protection,
//! idempotency, timing counters, notifications) and always apply.

mod concurrency;
mod global;
mod scheduling;

pub use concurrency::{ReleaseConcurrencySlots, SecureConcurrencySlots};
pub use global::{
    EmitStateEvent, IdempotentRetryGuard, IncrementRunCount, IncrementRunTime, SetEndTime,
    SetStartTime, TerminalStateProtection,
};
pub use scheduling::{RetryFailedRuns, WaitForScheduledTime};
