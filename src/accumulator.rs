use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::profile::{ProfileBuffer, ProfileError, Sample, SampleType, TimeWindow};

/// State guarded by the accumulator lock.
struct State<B> {
    buffer: B,
    sample_count: u64,
    export_count: u64,
    window_start: SystemTime,
}

/// Per-application sample buffer plus its bookkeeping.
///
/// Every read and write of the buffer and counters happens under one mutex,
/// so the buffer itself does not need to be thread-safe.
pub struct ProfileAccumulator<B> {
    application_id: Arc<str>,
    sample_types: Arc<[SampleType]>,
    state: Mutex<State<B>>,
}

/// Contents of an accumulator taken out at an export boundary.
pub struct ExportSnapshot<B> {
    pub application_id: Arc<str>,
    pub buffer: B,
    pub sample_count: u64,
    /// Export count of the accumulator after this extraction (starts at 1).
    pub export_index: u64,
    pub window: TimeWindow,
}

impl<B: ProfileBuffer> ProfileAccumulator<B> {
    pub fn new(application_id: Arc<str>, sample_types: Arc<[SampleType]>) -> Self {
        let buffer = B::create(&sample_types);
        Self {
            application_id,
            sample_types,
            state: Mutex::new(State {
                buffer,
                sample_count: 0,
                export_count: 0,
                window_start: SystemTime::now(),
            }),
        }
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    /// Adds a sample to the live buffer.
    ///
    /// The counter only moves when the buffer accepted the sample.
    pub fn add_sample(&self, sample: &Sample) -> Result<(), ProfileError> {
        let mut state = self.state.lock();
        state.buffer.add(sample)?;
        state.sample_count += 1;
        Ok(())
    }

    /// Swaps in an empty buffer and returns what was accumulated.
    ///
    /// Buffer swap, counter reset and window advance happen in one critical
    /// section: a concurrent `add_sample` lands either in the returned
    /// snapshot or in the fresh buffer, never both.
    pub fn extract_for_export(&self) -> ExportSnapshot<B> {
        let fresh = B::create(&self.sample_types);

        let mut state = self.state.lock();
        let now = SystemTime::now();
        let buffer = std::mem::replace(&mut state.buffer, fresh);
        let sample_count = std::mem::take(&mut state.sample_count);
        let start = std::mem::replace(&mut state.window_start, now);
        state.export_count += 1;
        let export_index = state.export_count;
        drop(state);

        ExportSnapshot {
            application_id: Arc::clone(&self.application_id),
            buffer,
            sample_count,
            export_index,
            window: TimeWindow {
                // Clock steps backwards must not produce an inverted window.
                start: start.min(now),
                end: now,
            },
        }
    }

    /// Samples accepted since the last extraction.
    pub fn sample_count(&self) -> u64 {
        self.state.lock().sample_count
    }

    /// Number of extractions so far.
    pub fn export_count(&self) -> u64 {
        self.state.lock().export_count
    }
}
