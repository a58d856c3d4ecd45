//! One probe execution, from request parameters to a verdict.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::{ExporterConfig, ModuleConfig};
use crate::dns::ProbeResponse;
use crate::metrics::ExporterMetrics;
use crate::module::{self, ProbeSpec};
use crate::target::{resolve_target, HostLookup};
use crate::transport;
use crate::validate::validate;

/// Label value used when the response carried no NSID
pub const NO_NSID: &str = "no_nsid";

/// Why a probe did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
	InvalidRequestModule,
	InvalidRequestTarget,
	InvalidRequestFamily,
	InvalidRequestIp,
	InvalidRequestProtocol,
	Timeout,
	InvalidResponseRcode,
	InvalidResponseFlags,
	InvalidResponseAnswerRrs,
	InvalidResponseAuthorityRrs,
	InvalidResponseAdditionalRrs,
	Other,
}

impl FailureReason {
	/// Every reason, in reporting order
	pub const ALL: [FailureReason; 12] = [
		FailureReason::InvalidRequestModule,
		FailureReason::InvalidRequestTarget,
		FailureReason::InvalidRequestFamily,
		FailureReason::InvalidRequestIp,
		FailureReason::InvalidRequestProtocol,
		FailureReason::Timeout,
		FailureReason::InvalidResponseRcode,
		FailureReason::InvalidResponseFlags,
		FailureReason::InvalidResponseAnswerRrs,
		FailureReason::InvalidResponseAuthorityRrs,
		FailureReason::InvalidResponseAdditionalRrs,
		FailureReason::Other,
	];

	pub fn as_str(&self) -> &'static str {
		match self {
			FailureReason::InvalidRequestModule => "invalid_request_module",
			FailureReason::InvalidRequestTarget => "invalid_request_target",
			FailureReason::InvalidRequestFamily => "invalid_request_family",
			FailureReason::InvalidRequestIp => "invalid_request_ip",
			FailureReason::InvalidRequestProtocol => "invalid_request_protocol",
			FailureReason::Timeout => "timeout",
			FailureReason::InvalidResponseRcode => "invalid_response_rcode",
			FailureReason::InvalidResponseFlags => "invalid_response_flags",
			FailureReason::InvalidResponseAnswerRrs => "invalid_response_answer_rrs",
			FailureReason::InvalidResponseAuthorityRrs => "invalid_response_authority_rrs",
			FailureReason::InvalidResponseAdditionalRrs => "invalid_response_additional_rrs",
			FailureReason::Other => "other",
		}
	}
}

impl fmt::Display for FailureReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Labels describing a probe that got a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeLabels {
	pub target: String,
	pub ip: IpAddr,
	pub protocol: String,
	pub family: String,
	pub query_name: String,
	pub query_type: String,
	pub opcode: String,
	pub rcode: String,
	/// Sorted flag mnemonics joined by spaces
	pub flags: String,
	pub nsid: Option<String>,
	pub answer: usize,
	pub authority: usize,
	pub additional: usize,
}

impl ProbeLabels {
	/// Label names of the query time histogram, in order
	pub const NAMES: [&'static str; 13] = [
		"target",
		"protocol",
		"family",
		"query_name",
		"query_type",
		"ip",
		"opcode",
		"rcode",
		"flags",
		"nsid",
		"answer",
		"authority",
		"additional",
	];

	fn new(spec: &ProbeSpec, ip: IpAddr, response: &ProbeResponse) -> Self {
		ProbeLabels {
			target: spec.target.clone(),
			ip,
			protocol: spec.protocol.to_string(),
			family: spec.family.to_string(),
			query_name: spec.query_name.to_string(),
			query_type: spec.query_type.to_string(),
			opcode: response.opcode.clone(),
			rcode: response.rcode.clone(),
			flags: response.flags.join(" "),
			nsid: response.nsid.clone(),
			answer: response.answer.len(),
			authority: response.authority.len(),
			additional: response.additional.len(),
		}
	}

	/// Label values in the order of `NAMES`
	pub fn values(&self) -> Vec<String> {
		vec![
			self.target.clone(),
			self.protocol.clone(),
			self.family.clone(),
			self.query_name.clone(),
			self.query_type.clone(),
			self.ip.to_string(),
			self.opcode.clone(),
			self.rcode.clone(),
			self.flags.clone(),
			self.nsid.clone().unwrap_or_else(|| NO_NSID.to_string()),
			self.answer.to_string(),
			self.authority.to_string(),
			self.additional.to_string(),
		]
	}
}

/// Outcome of one probe
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
	/// Round trip time, present when a response was received
	pub elapsed: Option<Duration>,
	/// Present when a response was received
	pub labels: Option<ProbeLabels>,
	pub success: bool,
	/// Set exactly when `success` is false
	pub failure: Option<FailureReason>,
}

impl ProbeResult {
	fn failed(reason: FailureReason) -> Self {
		ProbeResult {
			elapsed: None,
			labels: None,
			success: false,
			failure: Some(reason),
		}
	}
}

/// Runs probes against the configured modules.
///
/// Cheap to share between tasks: the only mutable state reachable from here
/// is the atomic counters in `ExporterMetrics`.
pub struct Prober {
	defaults: ModuleConfig,
	config: ExporterConfig,
	lookup: Arc<dyn HostLookup>,
	metrics: Arc<ExporterMetrics>,
}

impl Prober {
	pub fn new(
		config: ExporterConfig,
		lookup: Arc<dyn HostLookup>,
		metrics: Arc<ExporterMetrics>,
	) -> Self {
		Prober {
			defaults: ModuleConfig::defaults(),
			config,
			lookup,
			metrics,
		}
	}

	pub fn metrics(&self) -> &ExporterMetrics {
		&self.metrics
	}

	/// Run one probe described by request parameters.
	///
	/// Stops at the first failing stage. Failures before a response was
	/// received carry no labels or timing.
	pub async fn run(&self, params: &HashMap<String, String>) -> ProbeResult {
		let spec = match module::resolve(&self.defaults, &self.config.modules, params) {
			Ok(spec) => spec,
			Err(e) => {
				warn!(error = %e, "invalid probe request");
				return ProbeResult::failed(e.reason());
			}
		};

		let ip = match spec.ip {
			Some(ip) => ip,
			None => match resolve_target(&spec.target, spec.family, self.lookup.as_ref()).await {
				Ok(ip) => ip,
				Err(e) => {
					warn!(module = %spec.module, target = %spec.target, error = %e, "target resolution failed");
					return ProbeResult::failed(e.reason());
				}
			},
		};

		let start = Instant::now();
		let response = match transport::dispatch(&spec, ip, &self.metrics).await {
			Ok(response) => response,
			Err(e) => {
				warn!(
					module = %spec.module,
					target = %spec.target,
					ip = %ip,
					protocol = %spec.protocol,
					error = %e,
					"DNS query failed"
				);
				self.metrics.record_failure();
				return ProbeResult::failed(e.reason());
			}
		};
		let elapsed = start.elapsed();

		let labels = ProbeLabels::new(&spec, ip, &response);
		let verdict = validate(&response, &spec.rules);
		if let Err(reason) = verdict {
			self.metrics.record_failure();
			info!(module = %spec.module, target = %spec.target, reason = %reason, "response failed validation");
		} else {
			debug!(module = %spec.module, target = %spec.target, elapsed_ms = elapsed.as_secs_f64() * 1000.0, "probe succeeded");
		}

		ProbeResult {
			elapsed: Some(elapsed),
			labels: Some(labels),
			success: verdict.is_ok(),
			failure: verdict.err(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::{Ipv4Addr, SocketAddr};

	use hickory_proto::op::{Message, MessageType, ResponseCode};
	use hickory_proto::rr::rdata::A;
	use hickory_proto::rr::{RData, Record};
	use tokio::net::{TcpListener, UdpSocket};

	use crate::target::tests::StaticLookup;
	use crate::transport::tcp::{read_with_length_prefix, send_with_length_prefix};

	fn answer_for(query_bytes: &[u8], rcode: ResponseCode) -> Vec<u8> {
		let query = Message::from_vec(query_bytes).unwrap();
		let mut response = Message::new();
		response.set_id(query.id());
		response.set_message_type(MessageType::Response);
		response.set_recursion_desired(query.recursion_desired());
		response.set_recursion_available(true);
		response.set_response_code(rcode);
		let name = query.queries()[0].name().clone();
		response.add_query(query.queries()[0].clone());
		response.add_answer(Record::from_rdata(
			name,
			300,
			RData::A(A(Ipv4Addr::new(192, 0, 2, 53))),
		));
		response.to_vec().unwrap()
	}

	async fn udp_server(rcode: ResponseCode) -> SocketAddr {
		let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let addr = socket.local_addr().unwrap();
		tokio::spawn(async move {
			let mut buf = [0u8; 1500];
			let (len, client) = socket.recv_from(&mut buf).await.unwrap();
			let reply = answer_for(&buf[..len], rcode);
			socket.send_to(&reply, client).await.unwrap();
		});
		addr
	}

	/// Receives the query and never answers
	async fn silent_udp_server() -> SocketAddr {
		let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let addr = socket.local_addr().unwrap();
		tokio::spawn(async move {
			let mut buf = [0u8; 1500];
			let _ = socket.recv_from(&mut buf).await;
			tokio::time::sleep(Duration::from_secs(5)).await;
		});
		addr
	}

	fn prober(lookup: StaticLookup) -> Prober {
		let mut config = ExporterConfig::default();
		config.modules.insert("default".to_string(), ModuleConfig::default());
		Prober::new(
			config,
			Arc::new(lookup),
			Arc::new(ExporterMetrics::new().unwrap()),
		)
	}

	fn params(addr: SocketAddr, extra: &[(&str, &str)]) -> HashMap<String, String> {
		let mut params: HashMap<String, String> = [
			("module", "default"),
			("target", "127.0.0.1"),
			("family", "ipv4"),
			("query_name", "example.com"),
		]
		.iter()
		.map(|(k, v)| (k.to_string(), v.to_string()))
		.collect();
		params.insert("port".to_string(), addr.port().to_string());
		for (k, v) in extra {
			params.insert(k.to_string(), v.to_string());
		}
		params
	}

	#[tokio::test]
	async fn test_successful_udp_probe() {
		let addr = udp_server(ResponseCode::NoError).await;
		let prober = prober(StaticLookup::default());
		let result = prober.run(&params(addr, &[])).await;

		assert!(result.success, "unexpected failure: {:?}", result.failure);
		assert_eq!(result.failure, None);
		assert!(result.elapsed.is_some());
		let labels = result.labels.unwrap();
		assert_eq!(labels.rcode, "NOERROR");
		assert_eq!(labels.opcode, "QUERY");
		assert_eq!(labels.flags, "QR RA RD");
		assert_eq!(labels.answer, 1);
		assert_eq!(labels.protocol, "udp");
		assert_eq!(labels.family, "ipv4");
		assert_eq!(labels.ip.to_string(), "127.0.0.1");
		assert_eq!(prober.metrics().queries(), 1);
		assert_eq!(prober.metrics().responses(), 1);
		assert_eq!(prober.metrics().failures(), 0);
	}

	#[tokio::test]
	async fn test_rcode_failure_keeps_labels() {
		let addr = udp_server(ResponseCode::NXDomain).await;
		let prober = prober(StaticLookup::default());
		let result = prober.run(&params(addr, &[])).await;

		assert!(!result.success);
		assert_eq!(result.failure, Some(FailureReason::InvalidResponseRcode));
		assert_eq!(result.labels.unwrap().rcode, "NXDOMAIN");
		assert_eq!(prober.metrics().failures(), 1);
	}

	#[tokio::test]
	async fn test_answer_rule_failure() {
		let addr = udp_server(ResponseCode::NoError).await;
		let mut config = ExporterConfig::from_yaml(
			"modules:\n  strict:\n    validate_answer_rrs:\n      fail_if_matches_regexp: ['192\\.0\\.2\\.']\n",
		)
		.unwrap();
		config.modules.insert("default".to_string(), ModuleConfig::default());
		let prober = Prober::new(
			config,
			Arc::new(StaticLookup::default()),
			Arc::new(ExporterMetrics::new().unwrap()),
		);
		let result = prober.run(&params(addr, &[("module", "strict")])).await;
		assert_eq!(result.failure, Some(FailureReason::InvalidResponseAnswerRrs));
	}

	#[tokio::test]
	async fn test_timeout() {
		let addr = silent_udp_server().await;
		let prober = prober(StaticLookup::default());
		let started = Instant::now();
		let result = prober.run(&params(addr, &[("timeout", "0.2")])).await;

		assert!(started.elapsed() < Duration::from_secs(2));
		assert!(!result.success);
		assert_eq!(result.failure, Some(FailureReason::Timeout));
		assert!(result.labels.is_none());
		assert!(result.elapsed.is_none());
		assert_eq!(prober.metrics().queries(), 1);
		assert_eq!(prober.metrics().responses(), 0);
		assert_eq!(prober.metrics().failures(), 1);
	}

	#[tokio::test]
	async fn test_request_errors_do_not_dispatch() {
		let prober = prober(StaticLookup::default());
		let addr: SocketAddr = "127.0.0.1:53".parse().unwrap();

		let result = prober.run(&params(addr, &[("module", "missing")])).await;
		assert_eq!(result.failure, Some(FailureReason::InvalidRequestModule));

		let result = prober.run(&params(addr, &[("protocol", "carrier-pigeon")])).await;
		assert_eq!(result.failure, Some(FailureReason::InvalidRequestProtocol));

		let result = prober.run(&params(addr, &[("protocol", "doh"), ("family", "ipv6")])).await;
		assert_eq!(result.failure, Some(FailureReason::InvalidRequestIp));

		let result = prober.run(&params(addr, &[("target", "unknown.example")])).await;
		assert_eq!(result.failure, Some(FailureReason::InvalidRequestTarget));
		assert!(result.labels.is_none());

		assert_eq!(prober.metrics().queries(), 0);
		assert_eq!(prober.metrics().failures(), 0);
	}

	#[tokio::test]
	async fn test_hostname_target_over_tcp() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			let (mut socket, _) = listener.accept().await.unwrap();
			let query = read_with_length_prefix(&mut socket).await.unwrap();
			let reply = answer_for(&query, ResponseCode::NoError);
			send_with_length_prefix(&mut socket, &reply).await.unwrap();
		});

		let prober = prober(StaticLookup::with("dns.example", &["127.0.0.1"]));
		let result = prober
			.run(&params(addr, &[("target", "dns.example"), ("protocol", "tcp")]))
			.await;
		assert!(result.success, "unexpected failure: {:?}", result.failure);
		let labels = result.labels.unwrap();
		assert_eq!(labels.target, "dns.example");
		assert_eq!(labels.protocol, "tcp");
		assert_eq!(labels.ip.to_string(), "127.0.0.1");
	}

	#[test]
	fn test_label_values_order() {
		let labels = ProbeLabels {
			target: "dns.example".to_string(),
			ip: "192.0.2.1".parse().unwrap(),
			protocol: "udp".to_string(),
			family: "ipv4".to_string(),
			query_name: "example.com".to_string(),
			query_type: "A".to_string(),
			opcode: "QUERY".to_string(),
			rcode: "NOERROR".to_string(),
			flags: "QR RD".to_string(),
			nsid: None,
			answer: 2,
			authority: 0,
			additional: 1,
		};
		let pairs: Vec<(&str, String)> = ProbeLabels::NAMES.iter().copied()
			.zip(labels.values())
			.collect();
		assert_eq!(pairs.len(), 13);
		assert_eq!(pairs[0], ("target", "dns.example".to_string()));
		assert_eq!(pairs[5], ("ip", "192.0.2.1".to_string()));
		assert_eq!(pairs[9], ("nsid", NO_NSID.to_string()));
		assert_eq!(pairs[10], ("answer", "2".to_string()));
	}

	#[test]
	fn test_reason_names_are_unique() {
		let names: std::collections::HashSet<&str> =
			FailureReason::ALL.iter().map(|r| r.as_str()).collect();
		assert_eq!(names.len(), FailureReason::ALL.len());
		assert_eq!(FailureReason::Timeout.to_string(), "timeout");
	}
}
