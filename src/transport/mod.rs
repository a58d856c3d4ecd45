pub mod https;
pub mod quic;
pub mod tcp;
pub mod tls;
pub mod udp;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::dns::{build_query, parse_response, ProbeResponse};
use crate::metrics::ExporterMetrics;
use crate::module::{ProbeSpec, Protocol};
use crate::probe::FailureReason;
use crate::target::{server_name, url_port, url_with_port};

/// Why a query did not produce a response
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
	#[error("no response within {0:?}")]
	Timeout(Duration),
	#[error("{0}")]
	Other(String),
}

impl TransportError {
	pub fn reason(&self) -> FailureReason {
		match self {
			TransportError::Timeout(_) => FailureReason::Timeout,
			TransportError::Other(_) => FailureReason::Other,
		}
	}
}

/// Delivers one wire-format query and returns the wire-format response.
#[async_trait]
pub trait DnsTransport: Send + Sync {
	/// Callers bound the whole exchange with the probe timeout and drop the
	/// future when it elapses.
	async fn send(&self, message_bytes: &[u8]) -> Result<Vec<u8>, TransportError>;

	fn protocol_name(&self) -> &'static str;
}

/// Pick the transport for the probe protocol.
///
/// UDP, TCP and DoQ talk to the resolved IP. DoT talks to the resolved IP
/// and checks the certificate against the target host. DoH talks to the
/// target URL with the resolved IP pinned for the URL host.
pub fn transport_for(spec: &ProbeSpec, ip: IpAddr) -> Box<dyn DnsTransport> {
	let port = spec.port.unwrap_or_else(|| spec.protocol.default_port());
	let addr = SocketAddr::new(ip, port);
	match spec.protocol {
		Protocol::Udp => Box::new(udp::UdpTransport::new(addr)),
		Protocol::Tcp => Box::new(tcp::TcpTransport::new(addr)),
		Protocol::Dot => Box::new(tls::TlsTransport::new(addr, server_name(&spec.target))),
		Protocol::Doh => {
			let (url, port) = doh_endpoint(spec);
			Box::new(https::HttpsTransport::new(url, SocketAddr::new(ip, port), spec.timeout))
		}
		Protocol::Doq => Box::new(quic::QuicTransport::new(addr, server_name(&spec.target))),
	}
}

/// DoH URL and port to connect to. A port in the URL wins over the port
/// setting, which in turn wins over 443.
fn doh_endpoint(spec: &ProbeSpec) -> (String, u16) {
	match (url_port(&spec.target), spec.port) {
		(Some(port), _) => (spec.target.clone(), port),
		(None, Some(port)) => (url_with_port(&spec.target, port), port),
		(None, None) => (spec.target.clone(), Protocol::Doh.default_port()),
	}
}

/// Send the probe query to `ip` once and parse the answer.
///
/// The query counter is bumped for every call and the response counter for
/// every parsed response. The transport future is dropped when the probe
/// timeout elapses.
pub async fn dispatch(
	spec: &ProbeSpec,
	ip: IpAddr,
	metrics: &ExporterMetrics,
) -> Result<ProbeResponse, TransportError> {
	metrics.record_query();

	// DoQ requires a zero message ID (RFC 9250 §4.2.1)
	let txid: u16 = match spec.protocol {
		Protocol::Doq => 0,
		_ => rand::random(),
	};
	let query_bytes = build_query(spec, txid)?;
	let transport = transport_for(spec, ip);

	debug!(
		protocol = transport.protocol_name(),
		target = %spec.target,
		ip = %ip,
		query_name = %spec.query_name,
		query_type = %spec.query_type,
		"sending DNS query"
	);

	let start = Instant::now();
	let response_bytes = tokio::time::timeout(spec.timeout, transport.send(&query_bytes))
		.await
		.map_err(|_| TransportError::Timeout(spec.timeout))??;
	let message = parse_response(&response_bytes, txid)?;
	metrics.record_response();

	debug!(
		protocol = transport.protocol_name(),
		ip = %ip,
		elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
		response_len = response_bytes.len(),
		"DNS response received"
	);

	Ok(ProbeResponse::from_message(&message))
}

/// rustls client configuration trusting the webpki roots.
pub(crate) fn tls_client_config(
	alpn: &[&[u8]],
	tls13_only: bool,
) -> Result<Arc<rustls::ClientConfig>, TransportError> {
	let mut root_store = rustls::RootCertStore::empty();
	root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

	let provider = Arc::new(rustls::crypto::ring::default_provider());
	let builder = rustls::ClientConfig::builder_with_provider(provider);
	let versioned = if tls13_only {
		builder.with_protocol_versions(&[&rustls::version::TLS13])
	} else {
		builder.with_safe_default_protocol_versions()
	};
	let builder = versioned
		.map_err(|e| TransportError::Other(format!("invalid TLS configuration: {}", e)))?;

	let mut config = builder
		.with_root_certificates(root_store)
		.with_no_client_auth();
	config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
	Ok(Arc::new(config))
}
