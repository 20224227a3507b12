//! Collect, serialize, deliver and report.
//!
//! Ingestion goes through [`ProfileExporter::add_sample`] from any thread.
//! [`ProfileExporter::export`] drains every application's accumulator, then
//! serializes and delivers each artifact without holding any lock. A failure
//! for one application is recorded in the report and does not stop the cycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use thiserror::Error;

use crate::accumulator::{ExportSnapshot, ProfileAccumulator};
use crate::application::{ApplicationStore, StaticApplicationStore};
use crate::config::{Config, TagsConfig};
use crate::delivery::{Delivery, DeliveryError, DeliveryRequest};
use crate::endpoint::Endpoint;
use crate::health::HealthMetrics;
use crate::profile::{EnabledProfilers, PprofBuffer, ProfileBuffer, ProfileError, Sample};
use crate::registry::ApplicationRegistry;
use crate::tags::{TagError, TagSet};

/// Why one application's artifact did not reach the endpoint.
#[derive(Error, Debug)]
pub enum ExportFailure {
    #[error("serializing profile: {0}")]
    Serialize(#[from] ProfileError),

    #[error("serialization task failed: {0}")]
    Task(String),

    #[error("building tags: {0}")]
    Tags(#[from] TagError),

    #[error("delivering profile: {0}")]
    Deliver(#[from] DeliveryError),
}

/// Result of exporting one application in one cycle.
#[derive(Debug)]
pub struct ApplicationOutcome {
    pub application_id: Arc<str>,
    pub export_index: u64,
    pub sample_count: u64,
    /// Serialized artifact size; 0 when serialization failed.
    pub payload_bytes: usize,
    pub result: Result<(), ExportFailure>,
}

impl ApplicationOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Outcome of one export cycle.
#[derive(Debug, Default)]
pub struct ExportReport {
    /// One entry per application that had samples, in collection order.
    pub outcomes: Vec<ApplicationOutcome>,
    pub duration: Duration,
}

impl ExportReport {
    /// True when every collected application was delivered. A cycle with
    /// nothing to export succeeds.
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(ApplicationOutcome::is_success)
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ApplicationOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    pub fn samples_exported(&self) -> u64 {
        self.outcomes.iter().map(|o| o.sample_count).sum()
    }

    pub fn outcome(&self, application_id: &str) -> Option<&ApplicationOutcome> {
        self.outcomes
            .iter()
            .find(|o| &*o.application_id == application_id)
    }
}

/// Everything needed to build a [`ProfileExporter`].
pub struct ExporterSettings {
    pub endpoint: Endpoint,
    pub process_id: u32,
    pub profilers: EnabledProfilers,
    pub base_tags: TagSet,
    pub applications: Arc<dyn ApplicationStore>,
}

impl ExporterSettings {
    /// Resolves the endpoint and builds the base tags from configuration.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let profilers = EnabledProfilers::new(&cfg.profilers);
        let process_id = cfg.process_id();
        let endpoint = Endpoint::resolve(&cfg.export).context("resolving export endpoint")?;
        let base_tags =
            base_tags(&cfg.tags, process_id, &profilers).context("building base tags")?;
        let applications = Arc::new(StaticApplicationStore::new(
            cfg.default_service.as_str(),
            cfg.applications.clone(),
        ));

        Ok(Self {
            endpoint,
            process_id,
            profilers,
            base_tags,
            applications,
        })
    }
}

/// Tags shared by every artifact of this process.
pub fn base_tags(
    cfg: &TagsConfig,
    process_id: u32,
    profilers: &EnabledProfilers,
) -> Result<TagSet, TagError> {
    let mut tags = TagSet::new();
    tags.add("language", cfg.language.as_str())?;
    tags.add("process_id", process_id.to_string())?;
    tags.add("profiler_version", cfg.profiler_version.as_str())?;
    if !cfg.host.is_empty() {
        tags.add("host", cfg.host.as_str())?;
    }
    tags.add("profiler_list", profilers.tag_value())?;
    for (name, value) in &cfg.extra {
        tags.add(name.as_str(), value.as_str())?;
    }
    Ok(tags)
}

/// Multi-application profile accumulation and export.
pub struct ProfileExporter<B = PprofBuffer> {
    registry: ApplicationRegistry<B>,
    delivery: Delivery,
    base_tags: Arc<TagSet>,
    applications: Arc<dyn ApplicationStore>,
    metrics: Option<Arc<HealthMetrics>>,
}

impl<B: ProfileBuffer> ProfileExporter<B> {
    pub fn new(settings: ExporterSettings) -> Result<Self> {
        if settings.profilers.is_empty() {
            bail!("at least one profiler must be enabled");
        }

        let delivery = Delivery::from_endpoint(&settings.endpoint, settings.process_id)
            .context("creating delivery")?;

        tracing::info!(
            endpoint = %settings.endpoint,
            profilers = %settings.profilers.tag_value(),
            tags = settings.base_tags.len(),
            "profile exporter created",
        );

        Ok(Self {
            registry: ApplicationRegistry::new(settings.profilers.sample_types()),
            delivery,
            base_tags: Arc::new(settings.base_tags),
            applications: settings.applications,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn base_tags(&self) -> &TagSet {
        &self.base_tags
    }

    pub fn delivery_name(&self) -> &str {
        self.delivery.name()
    }

    pub fn registry(&self) -> &ApplicationRegistry<B> {
        &self.registry
    }

    pub fn accumulator(&self, application_id: &str) -> Option<Arc<ProfileAccumulator<B>>> {
        self.registry.get(application_id)
    }

    /// Records one sample for `application_id`.
    ///
    /// Returns false when the buffer rejected the sample; it is dropped.
    pub fn add_sample(&self, application_id: &str, sample: &Sample) -> bool {
        let accumulator = self.registry.resolve(application_id);
        match accumulator.add_sample(sample) {
            Ok(()) => {
                if let Some(m) = &self.metrics {
                    m.samples_added.inc();
                }
                true
            }
            Err(e) => {
                tracing::debug!(
                    application = application_id,
                    error = %e,
                    "dropping sample",
                );
                if let Some(m) = &self.metrics {
                    m.samples_dropped.inc();
                }
                false
            }
        }
    }

    /// Runs one export cycle over every registered application.
    pub async fn export(&self) -> ExportReport {
        let started = Instant::now();

        let accumulators = self.registry.snapshot();
        let registered = accumulators.len();
        let collected: Vec<ExportSnapshot<B>> = accumulators
            .iter()
            .map(|acc| acc.extract_for_export())
            .filter(|snapshot| snapshot.sample_count > 0)
            .collect();
        drop(accumulators);

        let mut outcomes = Vec::with_capacity(collected.len());
        for snapshot in collected {
            let application_id = Arc::clone(&snapshot.application_id);
            let export_index = snapshot.export_index;
            let sample_count = snapshot.sample_count;

            let (payload_bytes, result) = match self.export_one(snapshot).await {
                Ok(bytes) => (bytes, Ok(())),
                Err((bytes, e)) => {
                    tracing::warn!(
                        application = %application_id,
                        export_index,
                        samples = sample_count,
                        delivery = self.delivery.name(),
                        error = %e,
                        "profile export failed",
                    );
                    (bytes, Err(e))
                }
            };

            outcomes.push(ApplicationOutcome {
                application_id,
                export_index,
                sample_count,
                payload_bytes,
                result,
            });
        }

        let report = ExportReport {
            outcomes,
            duration: started.elapsed(),
        };

        if let Some(m) = &self.metrics {
            m.applications.set(registered as f64);
            m.export_cycles.inc();
            m.export_cycle_duration
                .observe(report.duration.as_secs_f64());
            let succeeded = report.succeeded();
            m.exports
                .with_label_values(&["success"])
                .inc_by(succeeded as f64);
            m.exports
                .with_label_values(&["failure"])
                .inc_by((report.outcomes.len() - succeeded) as f64);
        }

        if report.outcomes.is_empty() {
            tracing::debug!(applications = registered, "export cycle had no samples");
        } else {
            tracing::info!(
                applications = registered,
                exported = report.outcomes.len(),
                failed = report.outcomes.len() - report.succeeded(),
                samples = report.samples_exported(),
                duration_ms = report.duration.as_millis() as u64,
                "export cycle complete",
            );
        }

        report
    }

    /// Serializes and delivers one snapshot. The error carries the payload
    /// size reached before failing.
    async fn export_one(
        &self,
        snapshot: ExportSnapshot<B>,
    ) -> Result<usize, (usize, ExportFailure)> {
        let ExportSnapshot {
            application_id,
            buffer,
            sample_count,
            export_index,
            window,
        } = snapshot;

        let payload = tokio::task::spawn_blocking(move || buffer.serialize(&window))
            .await
            .map_err(|e| (0, ExportFailure::Task(e.to_string())))?
            .map_err(|e| (0, ExportFailure::from(e)))?;
        let payload_bytes = payload.len();

        if let Some(m) = &self.metrics {
            m.artifact_size.observe(payload_bytes as f64);
        }

        let info = self.applications.get(&application_id);
        let app_tags = info
            .tags(&application_id)
            .map_err(|e| (payload_bytes, ExportFailure::from(e)))?;

        let request = DeliveryRequest {
            application_id,
            application_name: info.service,
            payload,
            tags: self.base_tags.merged(&app_tags),
            window,
            export_index,
            sample_count,
        };

        self.delivery
            .deliver(&request)
            .await
            .map_err(|e| (payload_bytes, ExportFailure::from(e)))?;

        Ok(payload_bytes)
    }
}
