//! 指标协作者：计数与耗时上报

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &str, by: u64);

    fn timing(&self, name: &str, duration: Duration);
}

/// 丢弃所有指标
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn increment(&self, _name: &str, _by: u64) {}

    fn timing(&self, _name: &str, _duration: Duration) {}
}

/// 以 tracing 事件输出指标（target = "apiary::metrics"）
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn increment(&self, name: &str, by: u64) {
        tracing::debug!(target: "apiary::metrics", metric = name, by, "counter");
    }

    fn timing(&self, name: &str, duration: Duration) {
        tracing::debug!(
            target: "apiary::metrics",
            metric = name,
            elapsed_ms = duration.as_millis() as u64,
            "timing"
        );
    }
}

/// 进程内累加，测试断言用
#[derive(Debug, Default)]
pub struct MemoryMetricsSink {
    counters: Mutex<HashMap<String, u64>>,
    timings: Mutex<HashMap<String, Vec<Duration>>>,
}

impl MemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .map(|c| c.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn timing_count(&self, name: &str) -> usize {
        self.timings
            .lock()
            .map(|t| t.get(name).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn increment(&self, name: &str, by: u64) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(name.to_string()).or_insert(0) += by;
        }
    }

    fn timing(&self, name: &str, duration: Duration) {
        if let Ok(mut timings) = self.timings.lock() {
            timings.entry(name.to_string()).or_default().push(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_accumulates() {
        let sink = MemoryMetricsSink::new();
        sink.increment("engines.created", 1);
        sink.increment("engines.created", 2);
        sink.timing("run.duration", Duration::from_millis(5));
        assert_eq!(sink.counter("engines.created"), 3);
        assert_eq!(sink.counter("missing"), 0);
        assert_eq!(sink.timing_count("run.duration"), 1);
    }
}
