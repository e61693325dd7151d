//! Prometheus metrics for the order pipeline.
//!
//! # Metrics
//!
//! ## Counters
//! - `seckill_admissions_total{outcome}` - Purchase attempts by admission outcome
//! - `seckill_publish_failures_total{confirm}` - Admitted intents the broker did not accept
//! - `seckill_orders_processed_total{outcome}` - Processed deliveries by outcome
//! - `seckill_dead_letters_total` - Messages moved to the dead-letter path
//!
//! ## Gauges
//! - `seckill_dead_letter_depth` - Messages currently on the dead-letter path
//!
//! ## Histograms
//! - `seckill_purchase_duration_seconds` - Admission path latency
//!
//! Each daemon owns its own registry, so several pipelines can share a process.

use prometheus::{
    exponential_buckets, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

use crate::error::DaemonResult;

/// Pipeline metrics bound to one registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    admissions: IntCounterVec,
    publish_failures: IntCounterVec,
    orders_processed: IntCounterVec,
    dead_letters: IntCounter,
    dead_letter_depth: IntGauge,
    purchase_duration: HistogramVec,
}

impl Metrics {
    /// Create and register all pipeline metrics.
    pub fn new() -> DaemonResult<Self> {
        let registry = Registry::new();

        let admissions = IntCounterVec::new(
            Opts::new("seckill_admissions_total", "Purchase attempts by admission outcome"),
            &["outcome"],
        )?;
        let publish_failures = IntCounterVec::new(
            Opts::new(
                "seckill_publish_failures_total",
                "Admitted order intents the broker did not accept",
            ),
            &["confirm"],
        )?;
        let orders_processed = IntCounterVec::new(
            Opts::new("seckill_orders_processed_total", "Processed deliveries by outcome"),
            &["outcome"],
        )?;
        let dead_letters = IntCounter::with_opts(Opts::new(
            "seckill_dead_letters_total",
            "Deliveries rejected to the dead-letter path",
        ))?;
        let dead_letter_depth = IntGauge::with_opts(Opts::new(
            "seckill_dead_letter_depth",
            "Messages currently on the dead-letter path",
        ))?;
        let purchase_duration = HistogramVec::new(
            HistogramOpts::new(
                "seckill_purchase_duration_seconds",
                "Admission path latency in seconds",
            )
            .buckets(exponential_buckets(0.0001, 2.0, 16)?),
            &["outcome"],
        )?;

        registry.register(Box::new(admissions.clone()))?;
        registry.register(Box::new(publish_failures.clone()))?;
        registry.register(Box::new(orders_processed.clone()))?;
        registry.register(Box::new(dead_letters.clone()))?;
        registry.register(Box::new(dead_letter_depth.clone()))?;
        registry.register(Box::new(purchase_duration.clone()))?;

        Ok(Self {
            registry,
            admissions,
            publish_failures,
            orders_processed,
            dead_letters,
            dead_letter_depth,
            purchase_duration,
        })
    }

    /// Record one purchase attempt.
    pub fn record_admission(&self, outcome: &str, duration_secs: f64) {
        self.admissions.with_label_values(&[outcome]).inc();
        self.purchase_duration.with_label_values(&[outcome]).observe(duration_secs);
    }

    /// Record an admitted intent that did not reach the queue.
    pub fn record_publish_failure(&self, confirm: &str) {
        self.publish_failures.with_label_values(&[confirm]).inc();
    }

    /// Record one processed delivery by outcome.
    pub fn record_processed(&self, outcome: &str) {
        self.orders_processed.with_label_values(&[outcome]).inc();
    }

    /// Record a dead-lettered delivery.
    pub fn record_dead_letter(&self) {
        self.dead_letters.inc();
    }

    /// Update the dead-letter depth gauge.
    pub fn set_dead_letter_depth(&self, depth: usize) {
        self.dead_letter_depth.set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    /// Count for an admission outcome.
    pub fn admissions(&self, outcome: &str) -> u64 {
        self.admissions.with_label_values(&[outcome]).get()
    }

    /// Count for a processing outcome.
    pub fn orders_processed(&self, outcome: &str) -> u64 {
        self.orders_processed.with_label_values(&[outcome]).get()
    }

    /// Gather all metrics in Prometheus text format.
    pub fn gather(&self) -> DaemonResult<String> {
        let encoder = TextEncoder::new();
        Ok(encoder.encode_to_string(&self.registry.gather())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_independent_registries() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();

        a.record_admission("admitted", 0.001);

        assert_eq!(a.admissions("admitted"), 1);
        assert_eq!(b.admissions("admitted"), 0);
    }

    #[test]
    fn test_gather_text_format() {
        let metrics = Metrics::new().unwrap();
        metrics.record_admission("out_of_stock", 0.0005);
        metrics.record_processed("inserted");
        metrics.record_dead_letter();
        metrics.set_dead_letter_depth(3);

        let text = metrics.gather().unwrap();

        assert!(text.contains("seckill_admissions_total{outcome=\"out_of_stock\"} 1"));
        assert!(text.contains("seckill_orders_processed_total{outcome=\"inserted\"} 1"));
        assert!(text.contains("seckill_dead_letters_total 1"));
        assert!(text.contains("seckill_dead_letter_depth 3"));
        assert!(text.contains("seckill_purchase_duration_seconds_bucket"));
    }
}
