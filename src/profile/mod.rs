//! Sample model and the buffer contract used by the accumulators.
//!
//! A [`ProfileBuffer`] is an exclusively owned handle: created empty, fed
//! samples under the owning accumulator's lock, serialized once after it has
//! been swapped out, and released on drop.

pub mod pprof;

use std::time::{Duration, SystemTime};

use serde::Deserialize;
use thiserror::Error;

pub use self::pprof::{decode_artifact, PprofBuffer};

/// Errors raised by a profile buffer.
#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("sample has {actual} values, expected {expected}")]
    ValueCount { expected: usize, actual: usize },

    #[error("sample has no frames")]
    EmptyStack,

    #[error("encoding profile: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("decoding profile: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("gzip stream: {0}")]
    Compress(#[from] std::io::Error),
}

/// Profilers that can contribute values to a sample.
///
/// Variant order is the canonical value layout: `EnabledProfilers` sorts by
/// the derived `Ord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfilerKind {
    #[serde(alias = "wall")]
    Walltime,
    Cpu,
    Exceptions,
    Allocations,
    Lock,
}

impl ProfilerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Walltime => "walltime",
            Self::Cpu => "cpu",
            Self::Exceptions => "exceptions",
            Self::Allocations => "allocations",
            Self::Lock => "lock",
        }
    }

    /// Value slots this profiler contributes to each sample.
    pub fn sample_types(&self) -> &'static [SampleType] {
        match self {
            Self::Walltime => &[SampleType { name: "wall", unit: "nanoseconds" }],
            Self::Cpu => &[SampleType { name: "cpu", unit: "nanoseconds" }],
            Self::Exceptions => &[SampleType { name: "exception", unit: "count" }],
            Self::Allocations => &[
                SampleType { name: "alloc-samples", unit: "count" },
                SampleType { name: "alloc-size", unit: "bytes" },
            ],
            Self::Lock => &[
                SampleType { name: "lock-count", unit: "count" },
                SampleType { name: "lock-time", unit: "nanoseconds" },
            ],
        }
    }
}

/// Deduplicated set of enabled profilers, kept in canonical order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnabledProfilers {
    kinds: Vec<ProfilerKind>,
}

impl EnabledProfilers {
    pub fn new(kinds: &[ProfilerKind]) -> Self {
        let mut kinds = kinds.to_vec();
        kinds.sort_unstable();
        kinds.dedup();
        Self { kinds }
    }

    pub fn is_enabled(&self, kind: ProfilerKind) -> bool {
        self.kinds.contains(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Value used for the `profiler_list` tag, e.g. `walltime_cpu`.
    pub fn tag_value(&self) -> String {
        self.kinds
            .iter()
            .map(ProfilerKind::as_str)
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Sample layout: the value slots of every enabled profiler, in order.
    pub fn sample_types(&self) -> Vec<SampleType> {
        self.kinds
            .iter()
            .flat_map(|k| k.sample_types().iter().copied())
            .collect()
    }
}

/// Name and unit of one sample value slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleType {
    pub name: &'static str,
    pub unit: &'static str,
}

impl SampleType {
    pub const fn new(name: &'static str, unit: &'static str) -> Self {
        Self { name, unit }
    }
}

/// One stack frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct Frame {
    #[serde(default)]
    pub module: String,
    pub function: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: i64,
}

impl Frame {
    pub fn new(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
            file: String::new(),
            line: 0,
        }
    }
}

/// Label value: either a string or a number with an optional unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(untagged)]
pub enum LabelValue {
    Str(String),
    Num {
        num: i64,
        #[serde(default)]
        unit: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct Label {
    pub key: String,
    pub value: LabelValue,
}

impl Label {
    pub fn str(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: LabelValue::Str(value.into()),
        }
    }

    pub fn num(key: impl Into<String>, num: i64, unit: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: LabelValue::Num {
                num,
                unit: unit.into(),
            },
        }
    }
}

/// A single performance observation produced by the instrumented runtime.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Sample {
    /// Call stack, leaf first.
    pub frames: Vec<Frame>,
    /// One value per configured sample type.
    pub values: Vec<i64>,
    #[serde(default)]
    pub labels: Vec<Label>,
}

impl Sample {
    pub fn new(frames: Vec<Frame>, values: Vec<i64>) -> Self {
        Self {
            frames,
            values,
            labels: Vec::new(),
        }
    }

    pub fn with_label(mut self, label: Label) -> Self {
        self.labels.push(label);
        self
    }
}

/// Time range covered by one extracted buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: SystemTime,
    pub end: SystemTime,
}

impl TimeWindow {
    pub fn duration(&self) -> Duration {
        self.end.duration_since(self.start).unwrap_or_default()
    }
}

/// Opaque sample store owned by one accumulator.
pub trait ProfileBuffer: Send + 'static {
    /// Creates an empty buffer for the given sample layout.
    fn create(sample_types: &[SampleType]) -> Self
    where
        Self: Sized;

    /// Adds one sample. A rejected sample leaves the buffer unchanged.
    fn add(&mut self, sample: &Sample) -> Result<(), ProfileError>;

    /// Encodes the buffer contents into a portable artifact.
    fn serialize(&self, window: &TimeWindow) -> Result<Vec<u8>, ProfileError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enabled_profilers_canonical_order_and_dedup() {
        let enabled = EnabledProfilers::new(&[
            ProfilerKind::Exceptions,
            ProfilerKind::Walltime,
            ProfilerKind::Exceptions,
            ProfilerKind::Cpu,
        ]);
        assert_eq!(enabled.tag_value(), "walltime_cpu_exceptions");
        assert!(enabled.is_enabled(ProfilerKind::Cpu));
        assert!(!enabled.is_enabled(ProfilerKind::Lock));
    }

    #[test]
    fn test_sample_types_follow_enabled_profilers() {
        let enabled = EnabledProfilers::new(&[ProfilerKind::Allocations, ProfilerKind::Walltime]);
        let types = enabled.sample_types();
        let names: Vec<_> = types.iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["wall", "alloc-samples", "alloc-size"]);
    }

    #[test]
    fn test_empty_profilers_tag_value() {
        let enabled = EnabledProfilers::new(&[]);
        assert!(enabled.is_empty());
        assert_eq!(enabled.tag_value(), "");
        assert!(enabled.sample_types().is_empty());
    }

    #[test]
    fn test_sample_deserialize_from_json() {
        let json = r#"{
            "frames": [{"module": "app", "function": "Main.Run", "line": 12}],
            "values": [100, 5],
            "labels": [
                {"key": "thread name", "value": "worker-1"},
                {"key": "thread id", "value": {"num": 7}}
            ]
        }"#;
        let sample: Sample = serde_json::from_str(json).expect("valid sample json");
        assert_eq!(sample.frames.len(), 1);
        assert_eq!(sample.frames[0].line, 12);
        assert_eq!(sample.values, vec![100, 5]);
        assert_eq!(sample.labels[0], Label::str("thread name", "worker-1"));
        assert_eq!(sample.labels[1], Label::num("thread id", 7, ""));
    }

    #[test]
    fn test_time_window_duration_never_negative() {
        let now = SystemTime::now();
        let window = TimeWindow {
            start: now,
            end: now - Duration::from_secs(1),
        };
        assert_eq!(window.duration(), Duration::ZERO);
    }
}
