use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::accumulator::ProfileAccumulator;
use crate::profile::{ProfileBuffer, SampleType};

/// Maps application identifiers to their accumulators.
///
/// The registry lock covers lookup-or-insert and copying the entry list only;
/// sample ingestion and extraction take the per-entry lock instead.
pub struct ApplicationRegistry<B> {
    sample_types: Arc<[SampleType]>,
    entries: Mutex<HashMap<Arc<str>, Arc<ProfileAccumulator<B>>>>,
}

impl<B: ProfileBuffer> ApplicationRegistry<B> {
    pub fn new(sample_types: Vec<SampleType>) -> Self {
        Self {
            sample_types: Arc::from(sample_types),
            entries: Mutex::new(HashMap::with_capacity(8)),
        }
    }

    pub fn sample_types(&self) -> &[SampleType] {
        &self.sample_types
    }

    /// Returns the accumulator for `application_id`, creating it on first use.
    pub fn resolve(&self, application_id: &str) -> Arc<ProfileAccumulator<B>> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(application_id) {
            return Arc::clone(existing);
        }

        let id: Arc<str> = Arc::from(application_id);
        let accumulator = Arc::new(ProfileAccumulator::new(
            Arc::clone(&id),
            Arc::clone(&self.sample_types),
        ));
        entries.insert(id, Arc::clone(&accumulator));
        tracing::debug!(application = application_id, "registered application");
        accumulator
    }

    pub fn get(&self, application_id: &str) -> Option<Arc<ProfileAccumulator<B>>> {
        self.entries.lock().get(application_id).cloned()
    }

    /// Copies the current entries out of the registry lock.
    pub fn snapshot(&self) -> Vec<Arc<ProfileAccumulator<B>>> {
        self.entries.lock().values().cloned().collect()
    }

    /// Visits every entry without holding the registry lock during `visit`.
    pub fn for_each(&self, mut visit: impl FnMut(&ProfileAccumulator<B>)) {
        for accumulator in self.snapshot() {
            visit(&accumulator);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use super::*;
    use crate::profile::{EnabledProfilers, Frame, PprofBuffer, ProfilerKind, Sample};

    fn registry() -> ApplicationRegistry<PprofBuffer> {
        ApplicationRegistry::new(EnabledProfilers::new(&[ProfilerKind::Cpu]).sample_types())
    }

    #[test]
    fn test_resolve_creates_once() {
        let reg = registry();
        let a = reg.resolve("svc-a");
        let b = reg.resolve("svc-a");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);

        reg.resolve("svc-b");
        assert_eq!(reg.len(), 2);
        assert!(reg.get("svc-c").is_none());
    }

    #[test]
    fn test_concurrent_resolve_returns_single_instance() {
        let reg = Arc::new(registry());
        let barrier = Arc::new(Barrier::new(8));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let reg = Arc::clone(&reg);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                reg.resolve("shared")
            }));
        }

        let resolved: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked"))
            .collect();
        for acc in &resolved[1..] {
            assert!(Arc::ptr_eq(&resolved[0], acc));
        }
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_for_each_allows_resolve_during_visit() {
        let reg = registry();
        reg.resolve("svc-a")
            .add_sample(&Sample::new(vec![Frame::new("app", "Work")], vec![1]))
            .expect("valid sample");
        reg.resolve("svc-b");

        let mut visited = Vec::new();
        reg.for_each(|acc| {
            // Would deadlock if the registry lock were held here.
            reg.resolve("svc-c");
            visited.push((acc.application_id().to_string(), acc.sample_count()));
        });
        visited.sort();

        assert_eq!(
            visited,
            vec![("svc-a".to_string(), 1), ("svc-b".to_string(), 0)]
        );
        assert_eq!(reg.len(), 3);
    }
}
