//! Prometheus metrics.
//!
//! Two registries: the exporter's own counters live for the whole process,
//! while every probe result is rendered through a fresh registry so
//! concurrent probes never see each other's observations.

use prometheus::{
	Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, IntGaugeVec, Opts, Registry,
	TextEncoder,
};

use crate::probe::{FailureReason, ProbeLabels, ProbeResult};

/// Process-wide counters about the probe itself.
///
/// Increment-only, safe to share between tasks through an `Arc`.
pub struct ExporterMetrics {
	registry: Registry,
	queries: IntCounter,
	responses: IntCounter,
	failures: IntCounter,
}

impl ExporterMetrics {
	pub fn new() -> Result<Self, prometheus::Error> {
		let registry = Registry::new();
		let queries = IntCounter::new(
			"dns_exporter_dns_queries_total",
			"The total number of DNS queries sent by the exporter.",
		)?;
		let responses = IntCounter::new(
			"dns_exporter_dns_query_responses_total",
			"The total number of DNS query responses received.",
		)?;
		let failures = IntCounter::new(
			"dns_exporter_dns_query_failures_total",
			"The total number of DNS queries considered failed.",
		)?;
		registry.register(Box::new(queries.clone()))?;
		registry.register(Box::new(responses.clone()))?;
		registry.register(Box::new(failures.clone()))?;

		Ok(ExporterMetrics {
			registry,
			queries,
			responses,
			failures,
		})
	}

	pub fn record_query(&self) {
		self.queries.inc();
	}

	pub fn record_response(&self) {
		self.responses.inc();
	}

	pub fn record_failure(&self) {
		self.failures.inc();
	}

	pub fn queries(&self) -> u64 {
		self.queries.get()
	}

	pub fn responses(&self) -> u64 {
		self.responses.get()
	}

	pub fn failures(&self) -> u64 {
		self.failures.get()
	}

	/// Text exposition of the exporter counters.
	pub fn render(&self) -> Result<String, prometheus::Error> {
		encode(&self.registry)
	}
}

/// Text exposition of one probe result.
///
/// The query time histogram is only present when a response was received.
/// The failure reason gauge is only present when the probe failed, with
/// exactly one reason set to 1.
pub fn render_probe(result: &ProbeResult) -> Result<String, prometheus::Error> {
	let registry = Registry::new();

	let query_time = HistogramVec::new(
		HistogramOpts::new("dns_query_time_seconds", "DNS query time in seconds."),
		&ProbeLabels::NAMES,
	)?;
	registry.register(Box::new(query_time.clone()))?;
	if let (Some(labels), Some(elapsed)) = (&result.labels, result.elapsed) {
		let values = labels.values();
		let values: Vec<&str> = values.iter().map(String::as_str).collect();
		query_time
			.get_metric_with_label_values(&values)?
			.observe(elapsed.as_secs_f64());
	}

	let success = Gauge::new(
		"dns_query_success",
		"Was this DNS query successful or not, 1 for success or 0 for failure.",
	)?;
	registry.register(Box::new(success.clone()))?;
	success.set(if result.success { 1.0 } else { 0.0 });

	if let Some(active) = result.failure {
		let failure_reason = IntGaugeVec::new(
			Opts::new("dns_query_failure_reason", "The reason this DNS query failed"),
			&["reason"],
		)?;
		registry.register(Box::new(failure_reason.clone()))?;
		for reason in FailureReason::ALL {
			failure_reason
				.get_metric_with_label_values(&[reason.as_str()])?
				.set(i64::from(reason == active));
		}
	}

	encode(&registry)
}

fn encode(registry: &Registry) -> Result<String, prometheus::Error> {
	let mut buffer = Vec::new();
	TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
	String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
