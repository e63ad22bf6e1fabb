use std::collections::HashMap;

use tokio::time::Instant;

/// Phase timer carried by every request. Phases are named and may be nested
/// in time but not re-entered; `end` on a phase that is not running is a
/// no-op so callers do not have to track pairing on error paths.
#[derive(Debug)]
pub struct PerfTimer {
    start: Instant,
    phases: Vec<(&'static str, Phase)>,
    counters: HashMap<&'static str, u64>,
    total: Option<f64>,
}

#[derive(Debug, Default)]
struct Phase {
    started: Option<Instant>,
    elapsed_ms: f64,
}

impl Default for PerfTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl PerfTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            phases: Vec::with_capacity(8),
            counters: HashMap::new(),
            total: None,
        }
    }

    pub fn begin(&mut self, name: &'static str) {
        let phase = match self.phases.iter_mut().find(|(n, _)| *n == name) {
            Some((_, phase)) => phase,
            None => {
                self.phases.push((name, Phase::default()));
                &mut self.phases.last_mut().unwrap().1
            }
        };
        if phase.started.is_none() {
            phase.started = Some(Instant::now());
        }
    }

    pub fn end(&mut self, name: &'static str) {
        if let Some((_, phase)) = self.phases.iter_mut().find(|(n, _)| *n == name) {
            if let Some(started) = phase.started.take() {
                phase.elapsed_ms += started.elapsed().as_secs_f64() * 1000.0;
            }
        }
    }

    pub fn count(&mut self, key: &'static str, amount: u64) {
        *self.counters.entry(key).or_insert(0) += amount;
    }

    /// Close any still-running phase and freeze the total. Idempotent.
    pub fn finish(&mut self) {
        if self.total.is_some() {
            return;
        }
        for (_, phase) in self.phases.iter_mut() {
            if let Some(started) = phase.started.take() {
                phase.elapsed_ms += started.elapsed().as_secs_f64() * 1000.0;
            }
        }
        self.total = Some(self.start.elapsed().as_secs_f64() * 1000.0);
    }

    /// Total elapsed in milliseconds. Live value until [PerfTimer::finish].
    pub fn elapsed_ms(&self) -> f64 {
        self.total
            .unwrap_or_else(|| self.start.elapsed().as_secs_f64() * 1000.0)
    }

    pub fn snapshot(&self) -> PerfSnapshot {
        PerfSnapshot {
            total_ms: self.elapsed_ms(),
            phases: self
                .phases
                .iter()
                .map(|(name, phase)| (*name, phase.elapsed_ms))
                .collect(),
            counters: self.counters.iter().map(|(k, v)| (*k, *v)).collect(),
        }
    }
}

/// Frozen view of a timer used for metrics merging and log emission.
#[derive(Clone, Debug)]
pub struct PerfSnapshot {
    pub total_ms: f64,
    pub phases: Vec<(&'static str, f64)>,
    pub counters: Vec<(&'static str, u64)>,
}
