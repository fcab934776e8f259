//! Wires configuration, storage, policy and events into one handle.

use crate::broadcast::{create_broadcaster, EventBroadcaster, EventFilter, EventStream};
use crate::config::Config;
use crate::error::RuntimeError;
use crate::maintenance::MaintenanceTask;
use flowstate_core::{
    NewRun, Policy, ProposedState, Run, RunStore, State, StateEventSink, TransitionGovernor,
    TransitionOptions, TransitionResult,
};
use std::sync::Arc;
use uuid::Uuid;

/// An open flowstate data directory.
pub struct Orchestrator {
    config: Config,
    store: Arc<RunStore>,
    governor: TransitionGovernor,
    events: Option<Arc<EventBroadcaster>>,
    options: TransitionOptions,
}

impl Orchestrator {
    /// Opens the store, applies configured limits and builds the standard policy.
    pub fn open(config: Config) -> Result<Self, RuntimeError> {
        config.validate()?;

        let store = RunStore::open(config.storage.wal_config())?
            .with_lock_timeout(config.coordinator.lock_timeout());
        let store = Arc::new(store);

        let usage = store.slot_usage();
        for (tag, &limit) in &config.concurrency_limits {
            let current = usage.iter().find(|u| &u.tag == tag).map(|u| u.limit);
            if current != Some(limit) {
                store.set_concurrency_limit(tag, limit)?;
            }
        }

        let events = config
            .events
            .enabled
            .then(|| create_broadcaster(config.events.channel_capacity));
        let sink = events
            .clone()
            .map(|events| events as Arc<dyn StateEventSink>);
        let policy = Arc::new(Policy::standard(sink));

        let governor = TransitionGovernor::new(store.clone(), policy.clone())
            .with_lock_timeout(config.coordinator.lock_timeout());
        let options = TransitionOptions {
            apply_core_policy: config.policy.apply_core_rules,
            force: false,
        };

        tracing::info!(
            data_dir = %config.storage.data_dir.display(),
            runs = store.run_count(),
            rules = policy.len(),
            limits = config.concurrency_limits.len(),
            events = config.events.enabled,
            "Orchestrator ready"
        );

        Ok(Self {
            config,
            store,
            governor,
            events,
            options,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<RunStore> {
        &self.store
    }

    pub fn governor(&self) -> &TransitionGovernor {
        &self.governor
    }

    /// Event fan-out, if enabled.
    pub fn events(&self) -> Option<&Arc<EventBroadcaster>> {
        self.events.as_ref()
    }

    /// Starts a run description carrying the configured retry defaults.
    pub fn new_run(&self, name: impl Into<String>) -> NewRun {
        NewRun::new(name).with_retries(
            self.config.policy.default_max_retries,
            self.config.policy.default_retry_delay_secs,
        )
    }

    pub fn create_run(&self, new: NewRun) -> Result<Run, RuntimeError> {
        Ok(self.store.create_run(new)?)
    }

    /// Proposes a state under the configured policy options.
    pub fn propose(
        &self,
        run_id: Uuid,
        proposed: ProposedState,
    ) -> Result<TransitionResult, RuntimeError> {
        self.propose_with(run_id, proposed, self.options)
    }

    pub fn propose_with(
        &self,
        run_id: Uuid,
        proposed: ProposedState,
        options: TransitionOptions,
    ) -> Result<TransitionResult, RuntimeError> {
        Ok(self
            .governor
            .propose_transition(run_id, proposed, options)?)
    }

    /// Proposes a state, overriding terminal-state protection.
    pub fn force(
        &self,
        run_id: Uuid,
        proposed: ProposedState,
    ) -> Result<TransitionResult, RuntimeError> {
        let options = TransitionOptions {
            force: true,
            ..self.options
        };
        self.propose_with(run_id, proposed, options)
    }

    pub fn current_state(&self, run_id: Uuid) -> Result<Option<State>, RuntimeError> {
        Ok(self.store.current_state(run_id)?)
    }

    pub fn history(&self, run_id: Uuid) -> Result<Vec<State>, RuntimeError> {
        Ok(self.store.list_history(run_id)?)
    }

    /// Subscribes to one run. `None` when events are disabled.
    pub fn subscribe_run(&self, run_id: Uuid) -> Option<(String, EventStream)> {
        self.events.as_ref().map(|events| events.subscribe_run(run_id))
    }

    /// Subscribes to all runs. `None` when events are disabled.
    pub fn subscribe_all(&self, filter: EventFilter) -> Option<(String, EventStream)> {
        self.events.as_ref().map(|events| events.subscribe_all(filter))
    }

    /// Builds the background maintenance task for this store.
    pub fn maintenance(&self) -> MaintenanceTask {
        MaintenanceTask::new(
            self.store.clone(),
            self.events.clone(),
            self.config.maintenance.clone(),
        )
    }

    /// Flushes the log and rejects further writes.
    pub fn shutdown(&self) -> Result<(), RuntimeError> {
        self.store.wal().close()?;
        tracing::info!("Orchestrator shut down");
        Ok(())
    }
}
