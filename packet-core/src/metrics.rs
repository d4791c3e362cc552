//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `packet_created_total` - Packets created
//! - `packet_claims_total{outcome}` - Claim attempts by outcome
//! - `packet_claimed_amount_total` - Minor units credited to claimers
//! - `packet_claim_duration_seconds` - Claim latency, lock wait included
//! - `packet_callbacks_total{result}` - Gateway callbacks by result
//! - `packet_anomalies_total{kind}` - Reconciliation anomalies
//! - `packet_refunded_total` - Packets refunded by the sweeper
//! - `packet_refunded_amount_total` - Minor units returned to owners
//! - `packet_funding_timeouts_total` - Pending packets abandoned by the watchdog
//!
//! Each [`Metrics`] owns its registry, so several engines can live in one
//! process (tests, embedded use).

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Packets created
    pub packets_created: IntCounter,

    /// Claim attempts by outcome
    pub claims_total: IntCounterVec,

    /// Minor units credited by claims
    pub claimed_amount: IntCounter,

    /// Claim latency
    pub claim_duration: Histogram,

    /// Gateway callbacks by result
    pub callbacks_total: IntCounterVec,

    /// Anomalies by kind
    pub anomalies_total: IntCounterVec,

    /// Packets refunded
    pub refunded_packets: IntCounter,

    /// Minor units refunded
    pub refunded_amount: IntCounter,

    /// Pending packets abandoned
    pub funding_timeouts: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let packets_created = IntCounter::new("packet_created_total", "Packets created")?;
        registry.register(Box::new(packets_created.clone()))?;

        let claims_total = IntCounterVec::new(
            Opts::new("packet_claims_total", "Claim attempts by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(claims_total.clone()))?;

        let claimed_amount = IntCounter::new(
            "packet_claimed_amount_total",
            "Minor units credited to claimers",
        )?;
        registry.register(Box::new(claimed_amount.clone()))?;

        let claim_duration = Histogram::with_opts(
            HistogramOpts::new(
                "packet_claim_duration_seconds",
                "Claim latency including lock wait",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(claim_duration.clone()))?;

        let callbacks_total = IntCounterVec::new(
            Opts::new("packet_callbacks_total", "Gateway callbacks by result"),
            &["result"],
        )?;
        registry.register(Box::new(callbacks_total.clone()))?;

        let anomalies_total = IntCounterVec::new(
            Opts::new("packet_anomalies_total", "Reconciliation anomalies by kind"),
            &["kind"],
        )?;
        registry.register(Box::new(anomalies_total.clone()))?;

        let refunded_packets =
            IntCounter::new("packet_refunded_total", "Packets refunded by the sweeper")?;
        registry.register(Box::new(refunded_packets.clone()))?;

        let refunded_amount = IntCounter::new(
            "packet_refunded_amount_total",
            "Minor units returned to owners",
        )?;
        registry.register(Box::new(refunded_amount.clone()))?;

        let funding_timeouts = IntCounter::new(
            "packet_funding_timeouts_total",
            "Pending packets abandoned without a callback",
        )?;
        registry.register(Box::new(funding_timeouts.clone()))?;

        Ok(Self {
            packets_created,
            claims_total,
            claimed_amount,
            claim_duration,
            callbacks_total,
            anomalies_total,
            refunded_packets,
            refunded_amount,
            funding_timeouts,
            registry,
        })
    }

    /// Record packet creation
    pub fn record_packet_created(&self) {
        self.packets_created.inc();
    }

    /// Record a claim attempt
    pub fn record_claim(&self, outcome: &str, amount: u64, duration_seconds: f64) {
        self.claims_total.with_label_values(&[outcome]).inc();
        self.claimed_amount.inc_by(amount);
        self.claim_duration.observe(duration_seconds);
    }

    /// Record a gateway callback
    pub fn record_callback(&self, result: &str) {
        self.callbacks_total.with_label_values(&[result]).inc();
    }

    /// Record an anomaly
    pub fn record_anomaly(&self, kind: &str) {
        self.anomalies_total.with_label_values(&[kind]).inc();
    }

    /// Record a refund
    pub fn record_refund(&self, amount: u64) {
        self.refunded_packets.inc();
        self.refunded_amount.inc_by(amount);
    }

    /// Record an abandoned pending packet
    pub fn record_funding_timeout(&self) {
        self.funding_timeouts.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition
    pub fn export(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.packets_created.get(), 0);
        assert_eq!(metrics.refunded_packets.get(), 0);
    }

    #[test]
    fn test_independent_registries() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_packet_created();
        assert_eq!(a.packets_created.get(), 1);
        assert_eq!(b.packets_created.get(), 0);
    }

    #[test]
    fn test_record_claim() {
        let metrics = Metrics::new().unwrap();
        metrics.record_claim("granted", 250, 0.002);
        metrics.record_claim("already_claimed", 0, 0.001);

        assert_eq!(metrics.claims_total.with_label_values(&["granted"]).get(), 1);
        assert_eq!(
            metrics.claims_total.with_label_values(&["already_claimed"]).get(),
            1
        );
        assert_eq!(metrics.claimed_amount.get(), 250);
    }

    #[test]
    fn test_export_contains_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.record_refund(100);
        metrics.record_anomaly("amount_mismatch");

        let text = metrics.export().unwrap();
        assert!(text.contains("packet_refunded_amount_total 100"));
        assert!(text.contains("packet_anomalies_total{kind=\"amount_mismatch\"} 1"));
    }
}
