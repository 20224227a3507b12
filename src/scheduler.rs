use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::pipeline::{ExportReport, ProfileExporter};
use crate::profile::ProfileBuffer;

/// Runs export cycles on a fixed period.
///
/// Stopping cancels the ticker and runs one last cycle so samples added since
/// the previous tick are not lost.
pub struct ExportScheduler {
    cancel: CancellationToken,
    task: Option<JoinHandle<ExportReport>>,
}

impl ExportScheduler {
    /// Spawns the scheduler task. Must be called within a tokio runtime.
    ///
    /// A zero interval is rejected.
    pub fn start<B: ProfileBuffer>(
        exporter: Arc<ProfileExporter<B>>,
        interval: Duration,
    ) -> Result<Self> {
        if interval.is_zero() {
            bail!("export interval must be positive");
        }

        let cancel = CancellationToken::new();
        let ctx = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Consume the immediate first tick.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = ticker.tick() => {
                        exporter.export().await;
                    }
                }
            }

            // Final export.
            let report = exporter.export().await;
            if !report.is_success() {
                tracing::error!(
                    failed = report.failures().count(),
                    "final profile export had failures",
                );
            }
            report
        });

        tracing::info!(interval = ?interval, "export scheduler started");

        Ok(Self {
            cancel,
            task: Some(task),
        })
    }

    /// Stops the ticker and waits for the final export.
    pub async fn stop(mut self) -> Result<ExportReport> {
        self.cancel.cancel();
        let report = match self.task.take() {
            Some(task) => task.await.context("export scheduler task")?,
            None => ExportReport::default(),
        };
        tracing::info!(
            exported = report.outcomes.len(),
            "export scheduler stopped",
        );
        Ok(report)
    }
}

impl Drop for ExportScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
