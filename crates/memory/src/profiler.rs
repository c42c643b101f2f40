//! Per-operation call counts and latencies.

use std::{collections::BTreeMap, time::Duration};

use {dashmap::DashMap, serde::Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OperationStats {
    pub calls: u64,
    pub errors: u64,
    pub total_ms: f64,
    pub max_ms: f64,
}

impl OperationStats {
    pub fn avg_ms(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_ms / self.calls as f64
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProfilerStats {
    pub operations: BTreeMap<String, OperationStats>,
}

impl ProfilerStats {
    pub fn get(&self, operation: &str) -> Option<&OperationStats> {
        self.operations.get(operation)
    }
}

#[derive(Debug, Default)]
pub struct Profiler {
    ops: DashMap<&'static str, OperationStats>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, operation: &'static str, elapsed: Duration, ok: bool) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let mut stats = self.ops.entry(operation).or_default();
        stats.calls += 1;
        if !ok {
            stats.errors += 1;
        }
        stats.total_ms += ms;
        stats.max_ms = stats.max_ms.max(ms);
    }

    pub fn snapshot(&self) -> ProfilerStats {
        ProfilerStats {
            operations: self
                .ops
                .iter()
                .map(|e| (e.key().to_string(), *e.value()))
                .collect(),
        }
    }
}
