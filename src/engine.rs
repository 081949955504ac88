//! Monitoring engine: wires the scheduler to the result pipeline.
//!
//! Every probe result is stored, counted into the daily record, applied to the
//! status tracker, broadcast and checked against notification settings.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use crate::aggregator::Aggregator;
use crate::config::EngineConfig;
use crate::db::{ProbeResult, Storage, StorageError, Target, TargetId, TargetRuntimeState, UptimeRecord};
use crate::notifier::{Deliver, Notifier};
use crate::probe::Prober;
use crate::scheduler::{Command, ResultHandler, Scheduler};
use crate::tracker::{StatusTracker, TransitionEvent};
use crate::validation::{revalidate, ValidationError};

const STREAM_CAPACITY: usize = 1024;
const SEAL_INTERVAL: Duration = Duration::from_secs(60);

/// Engine error types.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ValidationError),
    #[error("engine is stopped")]
    Stopped,
}

/// Per-result processing, run on the probe's task.
pub struct Pipeline {
    storage: Arc<dyn Storage>,
    tracker: StatusTracker,
    aggregator: Aggregator,
    notifier: Arc<Notifier>,
    dispatches: Mutex<JoinSet<()>>,
    results: broadcast::Sender<ProbeResult>,
    transitions: broadcast::Sender<TransitionEvent>,
}

impl Pipeline {
    pub fn new(config: &EngineConfig, storage: Arc<dyn Storage>, delivery: Arc<dyn Deliver>) -> Self {
        let (results, _) = broadcast::channel(STREAM_CAPACITY);
        let (transitions, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            tracker: StatusTracker::new(storage.clone(), config.failure_threshold),
            aggregator: Aggregator::new(storage.clone()),
            notifier: Arc::new(Notifier::new(storage.clone(), delivery, config.delivery_timeout)),
            dispatches: Mutex::new(JoinSet::new()),
            storage,
            results,
            transitions,
        }
    }

    fn dispatches(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.dispatches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for running notification dispatches until `deadline`, then abort the rest.
    async fn drain_dispatches(&self, deadline: Instant) {
        let mut dispatches = std::mem::take(&mut *self.dispatches());
        if dispatches.is_empty() {
            return;
        }
        tracing::info!("Engine: waiting for {} notification dispatches", dispatches.len());

        let drained = tokio::time::timeout_at(deadline, async {
            while dispatches.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                "Engine: aborting {} notification dispatches after grace period",
                dispatches.len()
            );
            dispatches.abort_all();
            while dispatches.join_next().await.is_some() {}
        }
    }
}

#[async_trait]
impl ResultHandler for Pipeline {
    async fn handle(&self, target: &Target, result: ProbeResult) -> Result<(), EngineError> {
        self.storage.append_probe_result(&result)?;

        // Counted even when the tracker drops the result or fails
        let counted = self.aggregator.record(target, &result);

        if let Some(update) = self.tracker.apply(target, &result)? {
            // No subscribers is fine
            let _ = self.results.send(result.clone());
            if let Some(transition) = &update.transition {
                let _ = self.transitions.send(transition.clone());
            }

            let pending = self.notifier.evaluate(target, &update, &result)?;
            if !pending.is_empty() {
                let notifier = self.notifier.clone();
                let mut dispatches = self.dispatches();
                while dispatches.try_join_next().is_some() {}
                dispatches.spawn(async move {
                    notifier.dispatch(pending).await;
                });
            }
        }

        counted?;
        Ok(())
    }

    fn on_target_removed(&self, target_id: TargetId) {
        self.tracker.evict(target_id);
        self.aggregator.evict(target_id);
        self.notifier.evict(target_id);
    }
}

/// Handle to a running engine.
pub struct Engine {
    pipeline: Arc<Pipeline>,
    commands: mpsc::Sender<Command>,
    shutdown: watch::Sender<bool>,
    shutdown_grace: Duration,
    scheduler: JoinHandle<()>,
    sealer: JoinHandle<()>,
}

impl Engine {
    /// Start scheduling the storage's active targets.
    pub fn start(
        config: EngineConfig,
        storage: Arc<dyn Storage>,
        prober: Arc<dyn Prober>,
        delivery: Arc<dyn Deliver>,
    ) -> Self {
        let config = config.normalized();
        let pipeline = Arc::new(Pipeline::new(&config, storage.clone(), delivery));

        let (commands, command_rx) = mpsc::channel(256);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let scheduler = Scheduler::new(&config, storage, prober, pipeline.clone());
        let scheduler = tokio::spawn(scheduler.run(command_rx, shutdown_rx.clone()));
        let sealer = tokio::spawn(run_sealer(pipeline.clone(), shutdown_rx));

        tracing::info!(
            "Engine: started (max {} concurrent probes, failure threshold {})",
            config.max_concurrent_probes,
            config.failure_threshold
        );

        Self {
            pipeline,
            commands,
            shutdown,
            shutdown_grace: config.shutdown_grace,
            scheduler,
            sealer,
        }
    }

    /// Apply a target change. Takes effect on the target's next due-time computation.
    ///
    /// Invalid targets are rejected here and never reach the scheduler.
    pub async fn upsert_target(&self, target: Target) -> Result<(), EngineError> {
        let target = revalidate(&target)?;
        self.commands
            .send(Command::Upsert(target))
            .await
            .map_err(|_| EngineError::Stopped)
    }

    pub async fn remove_target(&self, target_id: TargetId) -> Result<(), EngineError> {
        self.commands
            .send(Command::Remove(target_id))
            .await
            .map_err(|_| EngineError::Stopped)
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<TransitionEvent> {
        self.pipeline.transitions.subscribe()
    }

    pub fn subscribe_results(&self) -> broadcast::Receiver<ProbeResult> {
        self.pipeline.results.subscribe()
    }

    pub fn runtime_state(&self, target_id: TargetId) -> Option<TargetRuntimeState> {
        self.pipeline.tracker.snapshot(target_id)
    }

    /// Today's open uptime record for a target.
    pub fn current_uptime(&self, target_id: TargetId) -> Option<UptimeRecord> {
        self.pipeline.aggregator.current(target_id)
    }

    /// Stop dispatching, then wait for in-flight probes and notification
    /// deliveries (bounded by the grace period).
    pub async fn shutdown(self) {
        let deadline = Instant::now() + self.shutdown_grace;
        let _ = self.shutdown.send(true);
        if let Err(e) = self.scheduler.await {
            tracing::error!("Engine: scheduler task failed: {}", e);
        }
        if let Err(e) = self.sealer.await {
            tracing::error!("Engine: sealer task failed: {}", e);
        }
        self.pipeline.drain_dispatches(deadline).await;
        tracing::info!("Engine: stopped");
    }
}

/// Seal records of past days even for targets that stopped reporting.
async fn run_sealer(pipeline: Arc<Pipeline>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(SEAL_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                match pipeline.aggregator.seal_stale(Utc::now().date_naive()) {
                    Ok(0) => {}
                    Ok(n) => tracing::info!("Engine: sealed {} uptime records", n),
                    Err(e) => tracing::error!("Engine: failed to seal uptime records: {}", e),
                }
            }
        }
    }
}
