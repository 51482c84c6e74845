//! Fixed-interval tick driver.
//!
//! # Invariants
//! - Tick numbers advance by exactly one per processed cycle.
//! - Ticks never overlap: the loop and `step()` share one gate.
//! - A failing partition never aborts its siblings.
//! - Regular ticks do not run while paused.

use crate::config::CoreConfig;
use crate::intents::IntentQueue;
use crate::lock;
use crate::plugin::{Redaction, SimulationPlugin, TickState, guarded_redact, guarded_step};
use crate::ports::{AccessError, DataAccess, PartitionSnapshot};
use crate::protocol::ServerMessage;
use crate::registry::{ConnectionRegistry, Deliveries};
use crate::stats::{TickHistory, TickStats};
use futures::FutureExt;
use futures::future::join_all;
use serde_json::{Map, Value};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use zonehost_common::{PartitionId, TickResult, apply_deltas};

/// Keys of the full state owned by the scheduler; plugins may not set them
/// through `extras`.
pub const RESERVED_EXTRAS_KEYS: &[&str] = &["entities", "tick_number", "partition_id"];

/// Lifecycle of the tick loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
    Paused,
}

/// Errors from lifecycle calls and from whole-tick failures.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler is already running")]
    AlreadyRunning,
    #[error("scheduler is not running")]
    NotRunning,
    #[error("step() is only valid while paused")]
    NotPaused,
    #[error("tick aborted: {0}")]
    TickAborted(#[source] AccessError),
}

/// Failure of one partition within one tick.
#[derive(Debug, thiserror::Error)]
pub enum TickError {
    #[error("loading snapshot failed: {0}")]
    Load(#[source] AccessError),
    #[error("applying deltas failed: {0}")]
    Apply(#[source] AccessError),
    #[error("partition processing panicked")]
    Panicked,
}

/// How `stop()` ended the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The loop finished its in-flight work within the grace period.
    Graceful,
    /// The grace period ran out and the loop task was aborted.
    Forced,
    /// There was no loop to stop.
    NotRunning,
}

struct LoopHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct PartitionOutcome {
    intents: usize,
}

/// Drives the simulation at a fixed cadence.
///
/// Cheap to clone; clones share the same loop. This is also the
/// administrative control surface (`pause`, `resume`, `step`, ...).
#[derive(Clone)]
pub struct TickScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    config: CoreConfig,
    store: Arc<dyn DataAccess>,
    intents: Arc<IntentQueue>,
    registry: Arc<ConnectionRegistry>,
    plugin: Option<Arc<dyn SimulationPlugin>>,
    tick: AtomicU64,
    paused: AtomicBool,
    gate: tokio::sync::Mutex<()>,
    history: Mutex<TickHistory>,
    lifecycle: Mutex<Option<LoopHandle>>,
}

impl TickScheduler {
    pub fn new(
        config: CoreConfig,
        store: Arc<dyn DataAccess>,
        intents: Arc<IntentQueue>,
        registry: Arc<ConnectionRegistry>,
        plugin: Option<Arc<dyn SimulationPlugin>>,
    ) -> Self {
        let history = TickHistory::new(config.stats_capacity);
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                store,
                intents,
                registry,
                plugin,
                tick: AtomicU64::new(0),
                paused: AtomicBool::new(false),
                gate: tokio::sync::Mutex::new(()),
                history: Mutex::new(history),
                lifecycle: Mutex::new(None),
            }),
        }
    }

    /// `Stopped → Running`: spawn the periodic loop on the current runtime.
    pub fn start(&self) -> Result<(), SchedulerError> {
        self.launch(false)
    }

    /// `Stopped → Paused`: spawn the loop without letting it process ticks.
    pub fn start_paused(&self) -> Result<(), SchedulerError> {
        self.launch(true)
    }

    fn launch(&self, paused: bool) -> Result<(), SchedulerError> {
        let mut lifecycle = lock(&self.inner.lifecycle);
        if lifecycle.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }
        self.inner.paused.store(paused, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_loop(Arc::clone(&self.inner), cancel.clone()));
        *lifecycle = Some(LoopHandle { cancel, task });
        tracing::info!(
            interval_ms = self.inner.config.tick_interval_ms,
            plugin = self.inner.plugin.as_ref().map(|p| p.name()),
            paused,
            "tick scheduler started"
        );
        Ok(())
    }

    /// Signal the loop to stop and wait up to the grace period for the
    /// in-flight tick; abort it after that.
    pub async fn stop(&self) -> StopOutcome {
        let handle = lock(&self.inner.lifecycle).take();
        let Some(LoopHandle { cancel, mut task }) = handle else {
            return StopOutcome::NotRunning;
        };
        cancel.cancel();
        let grace = self.inner.config.stop_grace();
        let outcome = match tokio::time::timeout(grace, &mut task).await {
            Ok(_) => {
                tracing::info!("tick scheduler stopped");
                StopOutcome::Graceful
            }
            Err(_) => {
                task.abort();
                tracing::warn!(?grace, "in-flight tick did not finish in time; loop aborted");
                StopOutcome::Forced
            }
        };
        self.inner.paused.store(false, Ordering::SeqCst);
        outcome
    }

    /// `Running → Paused`. The loop keeps waking but skips processing.
    pub fn pause(&self) -> Result<(), SchedulerError> {
        if !self.is_running() {
            return Err(SchedulerError::NotRunning);
        }
        if !self.inner.paused.swap(true, Ordering::SeqCst) {
            tracing::info!(tick = self.current_tick_number(), "tick scheduler paused");
        }
        Ok(())
    }

    /// `Paused → Running`.
    pub fn resume(&self) -> Result<(), SchedulerError> {
        if !self.is_running() {
            return Err(SchedulerError::NotRunning);
        }
        if self.inner.paused.swap(false, Ordering::SeqCst) {
            tracing::info!(tick = self.current_tick_number(), "tick scheduler resumed");
        }
        Ok(())
    }

    /// Run exactly one tick out of band. Only valid while paused.
    pub async fn step(&self) -> Result<TickStats, SchedulerError> {
        let _gate = self.inner.gate.lock().await;
        if self.state() != SchedulerState::Paused {
            return Err(SchedulerError::NotPaused);
        }
        self.inner.process_tick().await
    }

    pub fn current_tick_number(&self) -> u64 {
        self.inner.tick.load(Ordering::SeqCst)
    }

    /// Whether the loop exists, paused or not.
    pub fn is_running(&self) -> bool {
        lock(&self.inner.lifecycle).is_some()
    }

    pub fn state(&self) -> SchedulerState {
        if !self.is_running() {
            SchedulerState::Stopped
        } else if self.inner.paused.load(Ordering::SeqCst) {
            SchedulerState::Paused
        } else {
            SchedulerState::Running
        }
    }

    /// Recent tick statistics, oldest first.
    pub fn history(&self) -> Vec<TickStats> {
        lock(&self.inner.history).recent()
    }

    pub fn last_stats(&self) -> Option<TickStats> {
        lock(&self.inner.history).last().cloned()
    }

    pub fn plugin_name(&self) -> Option<&str> {
        self.inner.plugin.as_ref().map(|p| p.name())
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.inner.registry
    }

    pub fn intents(&self) -> &Arc<IntentQueue> {
        &self.inner.intents
    }

    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }
}

async fn run_loop(inner: Arc<SchedulerInner>, cancel: CancellationToken) {
    let interval = inner.config.tick_interval();
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let started = Instant::now();
        if let Some(Err(e)) = inner.loop_tick().await {
            tracing::warn!(error = %e, "tick aborted; retrying next cycle");
        }
        let wait = interval.saturating_sub(started.elapsed());
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
    tracing::debug!("tick loop exited");
}

impl SchedulerInner {
    /// A regular loop tick; `None` when paused.
    async fn loop_tick(&self) -> Option<Result<TickStats, SchedulerError>> {
        let _gate = self.gate.lock().await;
        if self.paused.load(Ordering::SeqCst) {
            return None;
        }
        Some(self.process_tick().await)
    }

    /// One full cycle. The caller holds the gate.
    async fn process_tick(&self) -> Result<TickStats, SchedulerError> {
        let tick_number = self.tick.load(Ordering::SeqCst) + 1;
        let span = tracing::info_span!("tick", tick = tick_number);
        self.process_tick_inner(tick_number).instrument(span).await
    }

    async fn process_tick_inner(&self, tick_number: u64) -> Result<TickStats, SchedulerError> {
        let started = Instant::now();

        let partitions = self
            .store
            .list_partitions()
            .await
            .map_err(SchedulerError::TickAborted)?;
        self.intents.retain_partitions(&partitions);
        let snapshots = join_all(partitions.iter().map(|p| self.store.load_snapshot(p))).await;
        self.tick.store(tick_number, Ordering::SeqCst);

        let outcomes = join_all(partitions.iter().zip(snapshots).map(|(partition, snapshot)| {
            let span = tracing::debug_span!("partition", %partition);
            AssertUnwindSafe(self.process_partition(tick_number, partition, snapshot))
                .catch_unwind()
                .map(settle_partition)
                .instrument(span)
        }))
        .await;

        let mut stats = TickStats {
            tick_number,
            ..TickStats::default()
        };
        for (partition, outcome) in partitions.iter().zip(outcomes) {
            match outcome {
                Ok(done) => {
                    stats.partitions_processed += 1;
                    stats.intents_processed += done.intents;
                }
                Err(e) => {
                    stats.partitions_failed += 1;
                    tracing::warn!(%partition, tick = tick_number, error = %e, "partition tick failed");
                }
            }
        }

        stats.duration = started.elapsed();
        let interval = self.config.tick_interval();
        if stats.duration > interval {
            stats.missed_deadline = true;
            tracing::warn!(
                tick = tick_number,
                duration_ms = stats.duration.as_millis() as u64,
                interval_ms = interval.as_millis() as u64,
                "tick missed its deadline"
            );
        }
        tracing::debug!(
            partitions = stats.partitions_processed,
            failed = stats.partitions_failed,
            intents = stats.intents_processed,
            "tick complete"
        );
        lock(&self.history).record(stats.clone());
        Ok(stats)
    }

    /// Drain → step → apply → fan out, for one partition.
    async fn process_partition(
        &self,
        tick_number: u64,
        partition: &PartitionId,
        snapshot: Result<PartitionSnapshot, AccessError>,
    ) -> Result<PartitionOutcome, TickError> {
        let snapshot = snapshot.map_err(TickError::Load)?;
        let intents = self.intents.drain(partition);

        let result = match &self.plugin {
            Some(plugin) => {
                match guarded_step(plugin.as_ref(), partition, &snapshot.entities, &intents, tick_number) {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::warn!(%partition, tick = tick_number, error = %e, "plugin step failed; partition unchanged this tick");
                        TickResult::default()
                    }
                }
            }
            None => TickResult::default(),
        };

        let TickResult {
            entity_creates,
            entity_updates,
            entity_deletes,
            mut extras,
        } = result;
        let mut entities = snapshot.entities;
        if !(entity_creates.is_empty() && entity_updates.is_empty() && entity_deletes.is_empty()) {
            self.store
                .apply(partition, &entity_creates, &entity_updates, &entity_deletes)
                .await
                .map_err(TickError::Apply)?;
            apply_deltas(&mut entities, &entity_creates, &entity_updates, &entity_deletes);
        }
        strip_reserved_extras(partition, &mut extras);

        let state = TickState {
            tick_number,
            partition_id: partition.clone(),
            entities,
            extras,
        };
        // Deliveries run detached; the tick does not wait on clients.
        let deliveries = self.fan_out(partition, &state);
        tracing::trace!(recipients = deliveries.len(), "tick handed to deliveries");

        Ok(PartitionOutcome {
            intents: intents.len(),
        })
    }

    fn fan_out(&self, partition: &PartitionId, state: &TickState) -> Deliveries {
        let full = state.to_value();
        let Some(plugin) = &self.plugin else {
            let message = ServerMessage::Tick {
                tick_number: state.tick_number,
                state: full,
            };
            return self.registry.broadcast_to(partition, message, None);
        };

        let mut deliveries = Deliveries::default();
        for info in self.registry.subscribers(partition) {
            let view = match guarded_redact(plugin.as_ref(), partition, &info.player_id, state) {
                Ok(Redaction::View(view)) => view,
                Ok(Redaction::Passthrough) => full.clone(),
                Err(e) => {
                    tracing::warn!(%partition, viewer = %info.player_id, error = %e, "redaction failed; sending unredacted state");
                    full.clone()
                }
            };
            let message = ServerMessage::Tick {
                tick_number: state.tick_number,
                state: view,
            };
            deliveries.extend(self.registry.send_to(&info, message));
        }
        deliveries
    }
}

fn settle_partition(
    caught: std::thread::Result<Result<PartitionOutcome, TickError>>,
) -> Result<PartitionOutcome, TickError> {
    caught.unwrap_or(Err(TickError::Panicked))
}

fn strip_reserved_extras(partition: &PartitionId, extras: &mut Map<String, Value>) {
    for key in RESERVED_EXTRAS_KEYS {
        if extras.remove(*key).is_some() {
            tracing::warn!(%partition, key, "plugin extras tried to carry scheduler-owned state; dropped");
        }
    }
}
