use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Observability record for one processed tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickStats {
    pub tick_number: u64,
    pub duration: Duration,
    pub partitions_processed: usize,
    pub partitions_failed: usize,
    pub intents_processed: usize,
    pub missed_deadline: bool,
}

/// Bounded ring of recent [`TickStats`]; the oldest entry is evicted first.
///
/// Never read by the simulation.
#[derive(Debug)]
pub struct TickHistory {
    entries: VecDeque<TickStats>,
    capacity: usize,
}

impl TickHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, stats: TickStats) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(stats);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&TickStats> {
        self.entries.back()
    }

    /// Oldest first.
    pub fn recent(&self) -> Vec<TickStats> {
        self.entries.iter().cloned().collect()
    }

    pub fn average_duration(&self) -> Duration {
        if self.entries.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.entries.iter().map(|s| s.duration).sum();
        total / self.entries.len() as u32
    }

    pub fn max_duration(&self) -> Duration {
        self.entries
            .iter()
            .map(|s| s.duration)
            .max()
            .unwrap_or(Duration::ZERO)
    }

    pub fn missed_deadlines(&self) -> usize {
        self.entries.iter().filter(|s| s.missed_deadline).count()
    }
}
