use crate::scheduler::{SchedulerState, TickScheduler};
use crate::stats::{TickHistory, TickStats};
use std::time::Duration;

/// Read-only view of a running core for operators and the CLI.
pub struct CoreInspector;

impl CoreInspector {
    /// Produce a summary of the scheduler and its collaborators.
    pub fn summary(scheduler: &TickScheduler) -> CoreSummary {
        let mut history = TickHistory::new(scheduler.config().stats_capacity);
        for stats in scheduler.history() {
            history.record(stats);
        }
        CoreSummary {
            tick: scheduler.current_tick_number(),
            state: scheduler.state(),
            plugin: scheduler.plugin_name().map(str::to_string),
            connections: scheduler.registry().connection_count(),
            pending_intents: scheduler.intents().total_pending(),
            last: history.last().cloned(),
            average_duration: history.average_duration(),
            max_duration: history.max_duration(),
            missed_deadlines: history.missed_deadlines(),
        }
    }

    /// Recent ticks, newest first, at most `limit`.
    pub fn recent_ticks(scheduler: &TickScheduler, limit: usize) -> Vec<TickStats> {
        scheduler.history().into_iter().rev().take(limit).collect()
    }
}

/// Snapshot of core health.
#[derive(Debug, Clone)]
pub struct CoreSummary {
    pub tick: u64,
    pub state: SchedulerState,
    pub plugin: Option<String>,
    pub connections: usize,
    pub pending_intents: usize,
    pub last: Option<TickStats>,
    pub average_duration: Duration,
    pub max_duration: Duration,
    pub missed_deadlines: usize,
}

impl std::fmt::Display for CoreSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Core: tick={} state={:?} plugin={} connections={} pending_intents={} avg={:.2}ms max={:.2}ms missed={}",
            self.tick,
            self.state,
            self.plugin.as_deref().unwrap_or("none"),
            self.connections,
            self.pending_intents,
            millis(self.average_duration),
            millis(self.max_duration),
            self.missed_deadlines
        )
    }
}

impl std::fmt::Display for TickStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tick [{}] {:.2}ms partitions={} failed={} intents={}{}",
            self.tick_number,
            millis(self.duration),
            self.partitions_processed,
            self.partitions_failed,
            self.intents_processed,
            if self.missed_deadline { " LATE" } else { "" }
        )
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
