//! Per-operation timing counters
//!
//! Purely observational. Counters only grow until [`Metrics::reset`].

use super::config::OpCode;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Counters for a single operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OpMetrics {
    /// Number of invocations
    pub count: u64,
    /// Cumulative execution time in microseconds
    pub time_us: u64,
    /// Cumulative time spent waiting in microseconds
    pub wait_us: u64,
}

/// Serialize/deserialize cost
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CodecMetrics {
    pub serialize_count: u64,
    pub serialize_us: u64,
    pub deserialize_count: u64,
    pub deserialize_us: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Metrics {
    ops: [OpMetrics; OpCode::COUNT],
    codec: CodecMetrics,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn op(&self, op: OpCode) -> OpMetrics {
        self.ops[op as usize]
    }

    pub fn codec(&self) -> CodecMetrics {
        self.codec
    }

    pub fn record_call(&mut self, op: OpCode) {
        self.ops[op as usize].count += 1;
    }

    pub fn record_time(&mut self, op: OpCode, elapsed: Duration) {
        self.ops[op as usize].time_us += elapsed.as_micros() as u64;
    }

    pub fn record_wait(&mut self, op: OpCode, elapsed: Duration) {
        self.ops[op as usize].wait_us += elapsed.as_micros() as u64;
    }

    pub fn record_serialize(&mut self, elapsed: Duration) {
        self.codec.serialize_count += 1;
        self.codec.serialize_us += elapsed.as_micros() as u64;
    }

    pub fn record_deserialize(&mut self, elapsed: Duration) {
        self.codec.deserialize_count += 1;
        self.codec.deserialize_us += elapsed.as_micros() as u64;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Snapshot keyed by operation name, omitting operations never called
    pub fn snapshot(&self) -> MetricsSnapshot {
        let ops = OpCode::ALL
            .iter()
            .filter(|op| self.ops[**op as usize].count > 0)
            .map(|op| (op.name().to_string(), self.ops[*op as usize]))
            .collect();
        MetricsSnapshot {
            ops,
            codec: self.codec,
        }
    }
}

/// Serializable dump of [`Metrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub ops: BTreeMap<String, OpMetrics>,
    pub codec: CodecMetrics,
}

impl MetricsSnapshot {
    pub fn total_calls(&self) -> u64 {
        self.ops.values().map(|m| m.count).sum()
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulates_and_resets() {
        let mut m = Metrics::new();
        m.record_call(OpCode::Read);
        m.record_call(OpCode::Read);
        m.record_wait(OpCode::Read, Duration::from_micros(30));
        m.record_serialize(Duration::from_micros(5));
        assert_eq!(m.op(OpCode::Read).count, 2);
        assert_eq!(m.op(OpCode::Read).wait_us, 30);
        assert_eq!(m.codec().serialize_count, 1);

        let snap = m.snapshot();
        assert_eq!(snap.ops.len(), 1);
        assert_eq!(snap.total_calls(), 2);
        assert!(snap.to_json().unwrap().contains("xRead"));

        m.reset();
        assert_eq!(m.op(OpCode::Read), OpMetrics::default());
        assert!(m.snapshot().ops.is_empty());
    }
}
