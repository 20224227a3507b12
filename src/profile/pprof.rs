//! pprof-backed profile buffer.
//!
//! Strings, functions and locations are interned on the way in; samples
//! with the same stack and labels are merged by summing their values.
//! Serialization emits a gzip-compressed `perftools.profiles.Profile`.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::time::{Duration, SystemTime};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use prost::Message;

use super::{Frame, Label, LabelValue, ProfileBuffer, ProfileError, Sample, SampleType, TimeWindow};

/// Message schema of `perftools.profiles` (profile.proto), limited to the
/// fields this exporter writes.
pub mod pb {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Profile {
        #[prost(message, repeated, tag = "1")]
        pub sample_type: Vec<ValueType>,
        #[prost(message, repeated, tag = "2")]
        pub sample: Vec<Sample>,
        #[prost(message, repeated, tag = "4")]
        pub location: Vec<Location>,
        #[prost(message, repeated, tag = "5")]
        pub function: Vec<Function>,
        #[prost(string, repeated, tag = "6")]
        pub string_table: Vec<String>,
        #[prost(int64, tag = "9")]
        pub time_nanos: i64,
        #[prost(int64, tag = "10")]
        pub duration_nanos: i64,
        #[prost(message, optional, tag = "11")]
        pub period_type: Option<ValueType>,
        #[prost(int64, tag = "12")]
        pub period: i64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ValueType {
        #[prost(int64, tag = "1")]
        pub r#type: i64,
        #[prost(int64, tag = "2")]
        pub unit: i64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Sample {
        #[prost(uint64, repeated, tag = "1")]
        pub location_id: Vec<u64>,
        #[prost(int64, repeated, tag = "2")]
        pub value: Vec<i64>,
        #[prost(message, repeated, tag = "3")]
        pub label: Vec<Label>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Label {
        #[prost(int64, tag = "1")]
        pub key: i64,
        #[prost(int64, tag = "2")]
        pub str: i64,
        #[prost(int64, tag = "3")]
        pub num: i64,
        #[prost(int64, tag = "4")]
        pub num_unit: i64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Location {
        #[prost(uint64, tag = "1")]
        pub id: u64,
        #[prost(message, repeated, tag = "4")]
        pub line: Vec<Line>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Line {
        #[prost(uint64, tag = "1")]
        pub function_id: u64,
        #[prost(int64, tag = "2")]
        pub line: i64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Function {
        #[prost(uint64, tag = "1")]
        pub id: u64,
        #[prost(int64, tag = "2")]
        pub name: i64,
        #[prost(int64, tag = "3")]
        pub system_name: i64,
        #[prost(int64, tag = "4")]
        pub filename: i64,
    }

    impl Profile {
        /// Looks up a string table entry, returning "" for out-of-range ids.
        pub fn string(&self, id: i64) -> &str {
            usize::try_from(id)
                .ok()
                .and_then(|i| self.string_table.get(i))
                .map_or("", String::as_str)
        }

        /// Sum of the value at `index` across all samples.
        pub fn total(&self, index: usize) -> i64 {
            self.sample
                .iter()
                .filter_map(|s| s.value.get(index))
                .sum()
        }
    }
}

/// String table; id 0 is always the empty string.
#[derive(Debug)]
struct StringTable {
    strings: Vec<String>,
    ids: HashMap<String, i64>,
}

impl StringTable {
    fn new() -> Self {
        let mut table = Self {
            strings: Vec::with_capacity(64),
            ids: HashMap::with_capacity(64),
        };
        table.intern("");
        table
    }

    fn intern(&mut self, s: &str) -> i64 {
        if let Some(&id) = self.ids.get(s) {
            return id;
        }
        let id = self.strings.len() as i64;
        self.strings.push(s.to_owned());
        self.ids.insert(s.to_owned(), id);
        id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct LabelKey {
    key: i64,
    str: i64,
    num: i64,
    num_unit: i64,
}

impl LabelKey {
    fn to_pb(self) -> pb::Label {
        pb::Label {
            key: self.key,
            str: self.str,
            num: self.num,
            num_unit: self.num_unit,
        }
    }
}

/// Identity of an aggregated sample.
#[derive(Debug, PartialEq, Eq, Hash)]
struct SampleKey {
    locations: Vec<u64>,
    labels: Vec<LabelKey>,
}

/// In-memory pprof builder.
#[derive(Debug)]
pub struct PprofBuffer {
    sample_types: Vec<pb::ValueType>,
    strings: StringTable,
    functions: Vec<pb::Function>,
    function_ids: HashMap<(i64, i64), u64>,
    locations: Vec<pb::Location>,
    location_ids: HashMap<(u64, i64), u64>,
    samples: Vec<pb::Sample>,
    sample_ids: HashMap<SampleKey, usize>,
}

impl PprofBuffer {
    /// Number of distinct (stack, labels) entries.
    pub fn distinct_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn intern_function(&mut self, frame: &Frame) -> u64 {
        let name = if frame.module.is_empty() {
            self.strings.intern(&frame.function)
        } else {
            self.strings
                .intern(&format!("{}!{}", frame.module, frame.function))
        };
        let filename = self.strings.intern(&frame.file);

        match self.function_ids.entry((name, filename)) {
            Entry::Occupied(o) => *o.get(),
            Entry::Vacant(v) => {
                let id = self.functions.len() as u64 + 1;
                self.functions.push(pb::Function {
                    id,
                    name,
                    system_name: name,
                    filename,
                });
                *v.insert(id)
            }
        }
    }

    fn intern_location(&mut self, frame: &Frame) -> u64 {
        let function_id = self.intern_function(frame);

        match self.location_ids.entry((function_id, frame.line)) {
            Entry::Occupied(o) => *o.get(),
            Entry::Vacant(v) => {
                let id = self.locations.len() as u64 + 1;
                self.locations.push(pb::Location {
                    id,
                    line: vec![pb::Line {
                        function_id,
                        line: frame.line,
                    }],
                });
                *v.insert(id)
            }
        }
    }

    fn intern_label(&mut self, label: &Label) -> LabelKey {
        let key = self.strings.intern(&label.key);
        match &label.value {
            LabelValue::Str(s) => LabelKey {
                key,
                str: self.strings.intern(s),
                num: 0,
                num_unit: 0,
            },
            LabelValue::Num { num, unit } => LabelKey {
                key,
                str: 0,
                num: *num,
                num_unit: if unit.is_empty() {
                    0
                } else {
                    self.strings.intern(unit)
                },
            },
        }
    }
}

impl ProfileBuffer for PprofBuffer {
    fn create(sample_types: &[SampleType]) -> Self {
        let mut strings = StringTable::new();
        let sample_types = sample_types
            .iter()
            .map(|t| pb::ValueType {
                r#type: strings.intern(t.name),
                unit: strings.intern(t.unit),
            })
            .collect();

        Self {
            sample_types,
            strings,
            functions: Vec::new(),
            function_ids: HashMap::new(),
            locations: Vec::new(),
            location_ids: HashMap::new(),
            samples: Vec::new(),
            sample_ids: HashMap::new(),
        }
    }

    fn add(&mut self, sample: &Sample) -> Result<(), ProfileError> {
        if sample.values.len() != self.sample_types.len() {
            return Err(ProfileError::ValueCount {
                expected: self.sample_types.len(),
                actual: sample.values.len(),
            });
        }
        if sample.frames.is_empty() {
            return Err(ProfileError::EmptyStack);
        }

        let locations = sample
            .frames
            .iter()
            .map(|f| self.intern_location(f))
            .collect();
        let labels = sample
            .labels
            .iter()
            .map(|l| self.intern_label(l))
            .collect();

        match self.sample_ids.entry(SampleKey { locations, labels }) {
            Entry::Occupied(o) => {
                if let Some(existing) = self.samples.get_mut(*o.get()) {
                    for (acc, v) in existing.value.iter_mut().zip(&sample.values) {
                        *acc = acc.saturating_add(*v);
                    }
                }
            }
            Entry::Vacant(v) => {
                let key = v.key();
                let pb_sample = pb::Sample {
                    location_id: key.locations.clone(),
                    value: sample.values.clone(),
                    label: key.labels.iter().map(|l| l.to_pb()).collect(),
                };
                v.insert(self.samples.len());
                self.samples.push(pb_sample);
            }
        }

        Ok(())
    }

    fn serialize(&self, window: &TimeWindow) -> Result<Vec<u8>, ProfileError> {
        let profile = pb::Profile {
            sample_type: self.sample_types.clone(),
            sample: self.samples.clone(),
            location: self.locations.clone(),
            function: self.functions.clone(),
            string_table: self.strings.strings.clone(),
            time_nanos: unix_nanos(window.start),
            duration_nanos: duration_nanos(window.duration()),
            period_type: self.sample_types.first().cloned(),
            period: 0,
        };

        let mut raw = Vec::with_capacity(profile.encoded_len());
        profile.encode(&mut raw)?;

        let mut encoder = GzEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::default());
        encoder.write_all(&raw)?;
        Ok(encoder.finish()?)
    }
}

/// Decodes an artifact produced by [`PprofBuffer::serialize`].
pub fn decode_artifact(bytes: &[u8]) -> Result<pb::Profile, ProfileError> {
    let mut raw = Vec::new();
    GzDecoder::new(bytes).read_to_end(&mut raw)?;
    Ok(pb::Profile::decode(raw.as_slice())?)
}

fn unix_nanos(t: SystemTime) -> i64 {
    duration_nanos(t.duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default())
}

fn duration_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}
