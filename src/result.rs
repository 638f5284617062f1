//! Probe result types.

use crate::timing::TimingResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Which probe produced a result row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// A standalone operation timed by the adaptive harness.
    Timing,
    /// A block-scheduled parallel matrix multiply.
    Matmul,
    /// Shared-counter increments under a lock or an atomic.
    Contention,
    /// Busy work spread over an increasing number of threads.
    Scaling,
    /// Two threads writing bytes a fixed distance apart.
    LineSize,
    /// Strided reads over a buffer of a given size.
    Mountain,
    /// Threads sharing one core.
    Smt,
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProbeKind::Timing => "timing",
            ProbeKind::Matmul => "matmul",
            ProbeKind::Contention => "contention",
            ProbeKind::Scaling => "scaling",
            ProbeKind::LineSize => "linesize",
            ProbeKind::Mountain => "mountain",
            ProbeKind::Smt => "smt",
        };
        f.write_str(s)
    }
}

/// Result of a single probe measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Full name including suite: "suite/probe"
    pub name: String,
    pub kind: ProbeKind,
    /// Estimated cost of one call of the measured operation
    #[serde(with = "duration_serde")]
    pub per_call: Duration,
    /// Calls in the batch that produced the estimate
    pub iterations: u64,
    /// Doubling rounds needed to reach the error bound
    pub rounds: u32,
    /// Units of work done by one call (for throughput)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_units: Option<u64>,
    /// Probe parameters such as thread count or block size
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl ProbeResult {
    /// Build a row from an adaptive-harness measurement.
    pub fn from_timing(name: impl Into<String>, kind: ProbeKind, timing: &TimingResult) -> Self {
        Self {
            name: name.into(),
            kind,
            per_call: timing.per_call_duration(),
            iterations: timing.iterations,
            rounds: timing.rounds,
            work_units: None,
            tags: BTreeMap::new(),
        }
    }

    /// Build a row from a single directly timed run.
    pub fn from_elapsed(name: impl Into<String>, kind: ProbeKind, elapsed: Duration) -> Self {
        Self {
            name: name.into(),
            kind,
            per_call: elapsed,
            iterations: 1,
            rounds: 1,
            work_units: None,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_work_units(mut self, units: u64) -> Self {
        self.work_units = Some(units);
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.tags.insert(key.into(), value.to_string());
        self
    }

    /// Work units per second, if work units were recorded.
    pub fn throughput(&self) -> Option<f64> {
        let secs = self.per_call.as_secs_f64();
        if secs == 0.0 {
            return None;
        }
        self.work_units.map(|u| u as f64 / secs)
    }
}

/// Results for an entire probe suite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteResult {
    pub suite: String,
    /// Clock resolution used for every measurement, in seconds
    pub delta_secs: f64,
    /// Relative error bound requested from the harness
    pub tolerance: f64,
    pub results: Vec<ProbeResult>,
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Unix milliseconds when the suite started
    pub started_at: String,
}

impl SuiteResult {
    /// Load a suite result from a JSON file.
    pub fn load(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Rows produced by a given probe.
    pub fn of_kind(&self, kind: ProbeKind) -> impl Iterator<Item = &ProbeResult> {
        self.results.iter().filter(move |r| r.kind == kind)
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_nanos().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let nanos = u128::deserialize(d)?;
        Ok(Duration::from_nanos(nanos as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing(per_call: f64, iterations: u64) -> TimingResult {
        TimingResult {
            per_call,
            iterations,
            rounds: 3,
            aggregate: per_call * iterations as f64,
            threshold: 1e-6,
        }
    }

    #[test]
    fn should_calculate_throughput_when_work_units_set() {
        let result = ProbeResult::from_timing("t", ProbeKind::Matmul, &timing(0.5, 4))
            .with_work_units(1_000_000);
        assert_eq!(result.throughput(), Some(2_000_000.0));
    }

    #[test]
    fn should_have_no_throughput_when_work_units_unset() {
        let result = ProbeResult::from_timing("t", ProbeKind::Timing, &timing(0.5, 4));
        assert_eq!(result.throughput(), None);
    }

    #[test]
    fn should_keep_tags_sorted_by_key() {
        let result = ProbeResult::from_elapsed("t", ProbeKind::Scaling, Duration::from_millis(1))
            .with_tag("threads", 8)
            .with_tag("block", 16);
        let keys: Vec<_> = result.tags.keys().cloned().collect();
        assert_eq!(keys, vec!["block", "threads"]);
        assert_eq!(result.tags["threads"], "8");
    }

    #[test]
    fn should_serialize_duration_as_nanoseconds() {
        let result = ProbeResult::from_elapsed("t", ProbeKind::LineSize, Duration::from_micros(3));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["per_call"], 3000);
        assert_eq!(json["kind"], "line_size");
        assert!(json.get("work_units").is_none());
    }
}
