//! The driver: ticks both stages and the reporter until every task is settled.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::compress::CompressionScheduler;
use crate::config::PipelineConfig;
use crate::fingerprint::FingerprintScheduler;
use crate::registry::TaskRegistry;
use crate::report::{ProgressReporter, ReportEvent, ReportRow};
use crate::toolchain::Toolchain;

pub struct Pipeline {
    config: Arc<PipelineConfig>,
    registry: TaskRegistry,
    compression: CompressionScheduler,
    fingerprint: FingerprintScheduler,
    reporter: ProgressReporter,
    scheduled: usize,
}

impl Pipeline {
    /// Classify every task and seed both stages.
    pub async fn new(
        config: Arc<PipelineConfig>,
        tools: Arc<dyn Toolchain>,
        registry: TaskRegistry,
        reporter: ProgressReporter,
    ) -> Self {
        let seeds = registry.partition(&config).await;
        info!(
            compress = seeds.compress.len(),
            fingerprint = seeds.fingerprint.len(),
            "Seeded stages"
        );
        let scheduled = seeds.compress.len() + seeds.fingerprint.len();
        let compression =
            CompressionScheduler::new(Arc::clone(&config), Arc::clone(&tools), seeds.compress);
        let fingerprint = FingerprintScheduler::new(Arc::clone(&config), tools, seeds.fingerprint);
        Self {
            config,
            registry,
            compression,
            fingerprint,
            reporter,
            scheduled,
        }
    }

    /// Tasks that entered either stage; parse failures are not counted.
    pub fn scheduled(&self) -> usize {
        self.scheduled
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn compression(&self) -> &CompressionScheduler {
        &self.compression
    }

    pub fn fingerprint(&self) -> &FingerprintScheduler {
        &self.fingerprint
    }

    /// Both stages have nothing waiting and nothing running.
    pub fn is_finished(&self) -> bool {
        self.compression.is_idle() && self.fingerprint.is_idle()
    }

    /// One pass: compression (with hand-off), then fingerprinting, then reporting.
    pub async fn tick(&mut self) -> Result<Vec<ReportEvent>> {
        self.compression
            .tick(&self.registry, &mut self.fingerprint)
            .await;
        self.fingerprint.tick(&self.registry).await;
        self.reporter
            .flush(
                &self.registry,
                self.compression.queues(),
                self.fingerprint.queues(),
            )
            .await
    }

    /// Drive the run to completion and produce the final report.
    pub async fn run(mut self) -> Result<Vec<ReportRow>> {
        let span = Span::current();
        loop {
            let events = self.tick().await?;
            let settled = events.iter().filter(|e| e.is_final()).count();
            if settled > 0 {
                span.pb_inc(settled as u64);
            }
            if self.is_finished() {
                break;
            }
            debug!(
                compressing = self.compression.queues().in_flight(),
                fingerprinting = self.fingerprint.queues().in_flight(),
                "waiting"
            );
            tokio::time::sleep(self.config.poll_interval).await;
        }

        let events = self
            .reporter
            .flush(
                &self.registry,
                self.compression.queues(),
                self.fingerprint.queues(),
            )
            .await?;
        span.pb_inc(events.iter().filter(|e| e.is_final()).count() as u64);

        info!(
            compressed = self.compression.queues().done().len(),
            compress_failed = self.compression.queues().error().len(),
            fingerprinted = self.fingerprint.queues().done().len(),
            fingerprint_failed = self.fingerprint.queues().error().len(),
            "All stages finished"
        );
        self.reporter.finish(&self.registry).await
    }
}
