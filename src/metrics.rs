use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use serde::Serialize;
use tracing::{info, warn};

use crate::perf::PerfSnapshot;

/// min/max/total/count aggregate for one timing series.
#[derive(Copy, Clone, Debug, Serialize)]
pub struct Mma {
    pub min: f64,
    pub max: f64,
    pub total: f64,
    pub count: u64,
}

impl Mma {
    fn merge(&mut self, value: f64) {
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
        self.total += value;
        self.count += 1;
    }

    fn one(value: f64) -> Self {
        Self {
            min: value,
            max: value,
            total: value,
            count: 1,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct StatsBuffer {
    pub stats: HashMap<String, Mma>,
    pub counters: HashMap<String, u64>,
}

impl StatsBuffer {
    fn merge_stat(&mut self, name: &str, value: f64) {
        match self.stats.get_mut(name) {
            Some(mma) => mma.merge(value),
            None => {
                self.stats.insert(name.to_owned(), Mma::one(value));
            }
        }
    }

    fn count(&mut self, name: &str, amount: u64) {
        *self.counters.entry(name.to_owned()).or_insert(0) += amount;
    }
}

/// Completed request summary kept in the recent ring and emitted on the
/// transaction log.
#[derive(Clone, Debug, Serialize)]
pub struct RequestSummary {
    pub id: String,
    pub conn_id: String,
    pub when: u64,
    pub proto: &'static str,
    pub port: u16,
    pub ip: String,
    pub method: String,
    pub uri: String,
    pub host: String,
    pub code: u16,
    pub status: String,
    pub elapsed_ms: f64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Rolling server metrics: a current/last stats double buffer swapped each
/// tick plus a bounded ring of recent request summaries.
#[derive(Default)]
pub(crate) struct Metrics {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    current: StatsBuffer,
    last: StatsBuffer,
    recent: VecDeque<RequestSummary>,
}

impl Metrics {
    pub fn record(&self, perf: &PerfSnapshot, summary: RequestSummary, recent_cap: usize) {
        let mut inner = self.inner.lock().unwrap();

        inner.current.merge_stat("total", perf.total_ms);
        for (phase, elapsed) in perf.phases.iter() {
            inner.current.merge_stat(phase, *elapsed);
        }
        inner.current.count("num_requests", 1);
        inner.current.count("bytes_in", summary.bytes_in);
        inner.current.count("bytes_out", summary.bytes_out);
        for (key, amount) in perf.counters.iter() {
            inner.current.count(key, *amount);
        }

        if recent_cap > 0 {
            while inner.recent.len() >= recent_cap {
                inner.recent.pop_front();
            }
            inner.recent.push_back(summary);
        }
    }

    /// swap the stats double buffer. called once per tick.
    pub fn tick(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.last = std::mem::take(&mut inner.current);
    }

    /// the last completed interval.
    pub fn last(&self) -> StatsBuffer {
        self.inner.lock().unwrap().last.clone()
    }

    pub fn recent(&self) -> Vec<RequestSummary> {
        let inner = self.inner.lock().unwrap();
        inner.recent.iter().rev().cloned().collect()
    }
}

/// One transaction log line per completed request matching the log regex.
pub(crate) fn log_transaction(summary: &RequestSummary) {
    info!(
        target: "txn",
        id = %summary.id,
        ip = %summary.ip,
        method = %summary.method,
        uri = %summary.uri,
        host = %summary.host,
        code = summary.code,
        elapsed_ms = summary.elapsed_ms,
        bytes_in = summary.bytes_in,
        bytes_out = summary.bytes_out,
        "request"
    );
}

/// Slow request record, optionally with the full phase report attached.
pub(crate) fn log_slow(summary: &RequestSummary, perf: &PerfSnapshot, with_report: bool) {
    if with_report {
        let phases = perf
            .phases
            .iter()
            .map(|(name, ms)| format!("{name}={ms:.1}ms"))
            .collect::<Vec<_>>()
            .join(" ");
        warn!(
            target: "metrics",
            id = %summary.id,
            uri = %summary.uri,
            elapsed_ms = summary.elapsed_ms,
            %phases,
            "slow request"
        );
    } else {
        warn!(
            target: "metrics",
            id = %summary.id,
            uri = %summary.uri,
            elapsed_ms = summary.elapsed_ms,
            "slow request"
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn summary(bytes_in: u64, bytes_out: u64) -> RequestSummary {
        RequestSummary {
            id: String::from("r1"),
            conn_id: String::from("c1"),
            when: 0,
            proto: "http",
            port: 80,
            ip: String::from("1.2.3.4"),
            method: String::from("GET"),
            uri: String::from("/"),
            host: String::from("ex.com"),
            code: 200,
            status: String::from("OK"),
            elapsed_ms: 5.0,
            bytes_in,
            bytes_out,
        }
    }

    fn snapshot(total: f64) -> PerfSnapshot {
        PerfSnapshot {
            total_ms: total,
            phases: vec![("read", total / 2.0)],
            counters: vec![],
        }
    }

    #[test]
    fn mma_merging() {
        let metrics = Metrics::default();
        metrics.record(&snapshot(10.0), summary(100, 200), 10);
        metrics.record(&snapshot(20.0), summary(1, 2), 10);
        metrics.tick();

        let last = metrics.last();
        let total = &last.stats["total"];
        assert_eq!(total.min, 10.0);
        assert_eq!(total.max, 20.0);
        assert_eq!(total.total, 30.0);
        assert_eq!(total.count, 2);
        assert_eq!(last.counters["num_requests"], 2);
        assert_eq!(last.counters["bytes_in"], 101);
        assert_eq!(last.counters["bytes_out"], 202);

        // current buffer starts fresh after the swap.
        metrics.tick();
        assert!(metrics.last().stats.is_empty());
    }

    #[test]
    fn recent_ring_bounded() {
        let metrics = Metrics::default();
        for i in 0..15 {
            let mut s = summary(0, 0);
            s.id = format!("r{i}");
            metrics.record(&snapshot(1.0), s, 10);
        }
        let recent = metrics.recent();
        assert_eq!(recent.len(), 10);
        // newest first.
        assert_eq!(recent[0].id, "r14");
        assert_eq!(recent[9].id, "r5");
    }

    #[test]
    fn zero_cap_disables_ring() {
        let metrics = Metrics::default();
        metrics.record(&snapshot(1.0), summary(0, 0), 0);
        assert!(metrics.recent().is_empty());
    }
}
