//! Target scheduler: decides when each target is due and dispatches probes.
//!
//! The loop is single-threaded and owns the due table. Probes run on spawned
//! tasks bounded by a semaphore; a target is never probed twice at once, and
//! its next due time is computed from when its last probe completed.

mod inflight;

pub use inflight::*;

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::EngineConfig;
use crate::db::{ProbeResult, Storage, Target, TargetId};
use crate::engine::EngineError;
use crate::probe::Prober;
use crate::validation::revalidate;

/// Configuration changes accepted while running.
#[derive(Debug, Clone)]
pub enum Command {
    /// Add or reconfigure a target. Inactive targets are removed.
    Upsert(Target),
    Remove(TargetId),
}

/// Receives every probe result, on the probe's task.
#[async_trait]
pub trait ResultHandler: Send + Sync {
    async fn handle(&self, target: &Target, result: ProbeResult) -> Result<(), EngineError>;

    /// Called when a target leaves the schedule.
    fn on_target_removed(&self, _target_id: TargetId) {}
}

struct Entry {
    target: Target,
    next_due: Instant,
    last_finished: Option<Instant>,
    overlap_logged: bool,
}

pub struct Scheduler {
    storage: Arc<dyn Storage>,
    prober: Arc<dyn Prober>,
    handler: Arc<dyn ResultHandler>,
    semaphore: Arc<Semaphore>,
    tick_interval: Duration,
    refresh_interval: Duration,
    shutdown_grace: Duration,
    entries: HashMap<TargetId, Entry>,
    in_flight: HashSet<TargetId>,
    tasks: JoinSet<()>,
    done_tx: mpsc::UnboundedSender<Completion>,
    done_rx: mpsc::UnboundedReceiver<Completion>,
}

impl Scheduler {
    pub fn new(
        config: &EngineConfig,
        storage: Arc<dyn Storage>,
        prober: Arc<dyn Prober>,
        handler: Arc<dyn ResultHandler>,
    ) -> Self {
        let config = config.clone().normalized();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            storage,
            prober,
            handler,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_probes)),
            tick_interval: config.tick_interval,
            refresh_interval: config.refresh_interval,
            shutdown_grace: config.shutdown_grace,
            entries: HashMap::new(),
            in_flight: HashSet::new(),
            tasks: JoinSet::new(),
            done_tx,
            done_rx,
        }
    }

    /// Run until `shutdown` flips or its sender is dropped.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut shutdown: watch::Receiver<bool>) {
        self.reload();
        tracing::info!("Scheduler: started with {} targets", self.entries.len());

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut refresh = tokio::time::interval_at(Instant::now() + self.refresh_interval, self.refresh_interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(command) = commands.recv() => self.apply(command),
                Some(done) = self.done_rx.recv() => self.complete(done),
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!("Scheduler: probe task panicked: {}", e);
                        }
                    }
                }
                _ = refresh.tick() => self.reload(),
                _ = ticker.tick() => self.dispatch_due(),
            }
        }

        self.drain().await;
    }

    /// Dispatch every due target, oldest due first, until the concurrency cap is hit.
    fn dispatch_due(&mut self) {
        let now = Instant::now();
        let mut due: Vec<(Instant, TargetId)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.next_due <= now)
            .map(|(id, e)| (e.next_due, *id))
            .collect();
        due.sort();

        for (i, (_, target_id)) in due.iter().enumerate() {
            let Some(entry) = self.entries.get_mut(target_id) else {
                continue;
            };

            if self.in_flight.contains(target_id) {
                if !entry.overlap_logged {
                    tracing::warn!("Scheduler: {} still in flight, skipping", entry.target.name);
                    entry.overlap_logged = true;
                }
                continue;
            }

            let permit = match self.semaphore.clone().try_acquire_owned() {
                Ok(p) => p,
                Err(_) => {
                    tracing::warn!(
                        "Scheduler: concurrency limit reached, {} due targets wait for the next tick",
                        due.len() - i
                    );
                    break;
                }
            };

            let target = entry.target.clone();
            let mut guard = InFlightGuard::new(target.id, self.done_tx.clone());
            let prober = self.prober.clone();
            let handler = self.handler.clone();
            self.in_flight.insert(target.id);

            self.tasks.spawn(async move {
                let result = prober.probe(&target).await;
                let finished_at = Instant::now();
                drop(permit);

                match handler.handle(&target, result).await {
                    Ok(()) => guard.finish(finished_at, false),
                    Err(e) => {
                        tracing::error!("Scheduler: failed to record result for {}: {}", target.name, e);
                        guard.finish(finished_at, true);
                    }
                }
            });
        }
    }

    fn complete(&mut self, done: Completion) {
        self.in_flight.remove(&done.target_id);

        match self.entries.get_mut(&done.target_id) {
            Some(entry) => {
                entry.last_finished = Some(done.finished_at);
                entry.overlap_logged = false;
                entry.next_due = if done.retry {
                    done.finished_at
                } else {
                    done.finished_at + entry.target.check_interval()
                };
            }
            // Removed while its probe was running
            None => self.handler.on_target_removed(done.target_id),
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Upsert(target) if !target.is_active => self.remove(target.id),
            Command::Upsert(target) => self.upsert(target),
            Command::Remove(target_id) => self.remove(target_id),
        }
    }

    fn upsert(&mut self, target: Target) {
        let target = match revalidate(&target) {
            Ok(target) => target,
            Err(e) => {
                tracing::warn!("Scheduler: skipping invalid target {} ({}): {}", target.id, target.name, e);
                self.remove(target.id);
                return;
            }
        };
        let in_flight = self.in_flight.contains(&target.id);
        match self.entries.get_mut(&target.id) {
            Some(entry) => {
                if entry.target == target {
                    return;
                }
                // An in-flight probe keeps its config; the new interval applies from its completion
                if !in_flight {
                    if let Some(finished) = entry.last_finished {
                        entry.next_due = finished + target.check_interval();
                    }
                }
                tracing::info!("Scheduler: updated target {}", target.name);
                entry.target = target;
            }
            None => {
                tracing::info!("Scheduler: adding target {}", target.name);
                let next_due = self.initial_due(&target);
                self.entries.insert(
                    target.id,
                    Entry {
                        target,
                        next_due,
                        last_finished: None,
                        overlap_logged: false,
                    },
                );
            }
        }
    }

    fn remove(&mut self, target_id: TargetId) {
        if let Some(entry) = self.entries.remove(&target_id) {
            tracing::info!("Scheduler: removed target {}", entry.target.name);
            self.handler.on_target_removed(target_id);
        }
    }

    /// Due immediately if never checked, else one interval after the stored last check.
    fn initial_due(&self, target: &Target) -> Instant {
        let now = Instant::now();
        let last_check = match self.storage.get_runtime_state(target.id) {
            Ok(state) => state.and_then(|s| s.last_check_at),
            Err(e) => {
                tracing::error!("Scheduler: failed to load state for {}: {}", target.name, e);
                None
            }
        };
        let Some(last_check) = last_check else {
            return now;
        };

        let interval = chrono::Duration::seconds(i64::from(target.check_interval_seconds));
        (last_check + interval - Utc::now())
            .to_std()
            .map(|wait| now + wait)
            .unwrap_or(now)
    }

    /// Sync the schedule with the storage's active targets. Invalid rows are skipped.
    fn reload(&mut self) {
        let targets = match self.storage.list_active_targets() {
            Ok(t) => t,
            Err(e) => {
                tracing::error!("Scheduler: failed to list targets: {}", e);
                return;
            }
        };

        let active: HashSet<TargetId> = targets.iter().map(|t| t.id).collect();
        let gone: Vec<TargetId> = self.entries.keys().filter(|id| !active.contains(id)).copied().collect();
        for target_id in gone {
            self.remove(target_id);
        }
        for target in targets {
            self.upsert(target);
        }
    }

    /// Stop dispatching, give in-flight probes the grace period, then abort the rest.
    async fn drain(&mut self) {
        tracing::info!("Scheduler: stopping, {} probes in flight", self.tasks.len());

        let deadline = tokio::time::sleep(self.shutdown_grace);
        tokio::pin!(deadline);
        while !self.tasks.is_empty() {
            tokio::select! {
                _ = &mut deadline => {
                    tracing::warn!("Scheduler: aborting {} probes after grace period", self.tasks.len());
                    self.tasks.abort_all();
                    while self.tasks.join_next().await.is_some() {}
                }
                _ = self.tasks.join_next() => {}
            }
        }

        while let Ok(done) = self.done_rx.try_recv() {
            self.complete(done);
        }
        if !self.in_flight.is_empty() {
            tracing::error!("Scheduler: {} in-flight flags left after shutdown", self.in_flight.len());
        }
        tracing::info!("Scheduler: stopped");
    }
}
