//! DNS over HTTPS (RFC 8484).
//!
//! The query is POSTed as `application/dns-message`. The URL host is pinned
//! to the already resolved address so the HTTP client never does its own
//! lookup, while TLS still checks the certificate against the URL host.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use url::{Host, Url};

use super::{DnsTransport, TransportError};

const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

pub struct HttpsTransport {
	url: String,
	hint: SocketAddr,
	/// Also given to the HTTP client so it reports its own timeouts
	timeout: Duration,
}

impl HttpsTransport {
	pub fn new(url: String, hint: SocketAddr, timeout: Duration) -> Self {
		Self { url, hint, timeout }
	}

	fn client(&self) -> Result<reqwest::Client, TransportError> {
		let url = Url::parse(&self.url)
			.map_err(|e| TransportError::Other(format!("invalid DoH URL '{}': {}", self.url, e)))?;

		let mut builder = reqwest::Client::builder()
			.use_rustls_tls()
			.timeout(self.timeout)
			.pool_max_idle_per_host(0);
		if let Some(Host::Domain(domain)) = url.host() {
			builder = builder.resolve(domain, self.hint);
		}
		builder
			.build()
			.map_err(|e| TransportError::Other(format!("failed to build HTTP client: {}", e)))
	}
}

#[async_trait]
impl DnsTransport for HttpsTransport {
	async fn send(&self, message_bytes: &[u8]) -> Result<Vec<u8>, TransportError> {
		let client = self.client()?;
		debug!(url = %self.url, hint = %self.hint, message_len = message_bytes.len(), "sending DoH query");

		let request_error = |e: reqwest::Error| {
			if e.is_timeout() {
				TransportError::Timeout(self.timeout)
			} else {
				TransportError::Other(format!("DoH request to {} failed: {}", self.url, e))
			}
		};

		let response = client
			.post(&self.url)
			.header(reqwest::header::CONTENT_TYPE, DNS_MESSAGE_CONTENT_TYPE)
			.header(reqwest::header::ACCEPT, DNS_MESSAGE_CONTENT_TYPE)
			.body(message_bytes.to_vec())
			.send()
			.await
			.map_err(request_error)?;

		let status = response.status();
		if !status.is_success() {
			return Err(TransportError::Other(format!(
				"DoH server {} returned HTTP {}: {}",
				self.url,
				status.as_u16(),
				status.canonical_reason().unwrap_or("Unknown")
			)));
		}

		let body = response.bytes().await.map_err(request_error)?;
		debug!(url = %self.url, response_len = body.len(), "DoH response received");
		Ok(body.to_vec())
	}

	fn protocol_name(&self) -> &'static str {
		"HTTPS"
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_https_transport_creation() {
		let hint: SocketAddr = "8.8.8.8:443".parse().unwrap();
		let timeout = Duration::from_secs(3);
		let transport = HttpsTransport::new("https://dns.google/dns-query".to_string(), hint, timeout);
		assert_eq!(transport.url, "https://dns.google/dns-query");
		assert_eq!(transport.hint, hint);
		assert_eq!(transport.timeout, timeout);
		assert_eq!(transport.protocol_name(), "HTTPS");
	}

	#[test]
	fn test_client_builds_for_literal_and_domain_hosts() {
		let hint: SocketAddr = "192.0.2.1:443".parse().unwrap();
		let timeout = Duration::from_secs(1);
		assert!(HttpsTransport::new("https://dns.example/dns-query".to_string(), hint, timeout)
			.client()
			.is_ok());
		assert!(HttpsTransport::new("https://192.0.2.1/dns-query".to_string(), hint, timeout)
			.client()
			.is_ok());
	}

	#[test]
	fn test_invalid_url_is_other() {
		let hint: SocketAddr = "192.0.2.1:443".parse().unwrap();
		let err = HttpsTransport::new("not a url".to_string(), hint, Duration::from_secs(1))
			.client()
			.unwrap_err();
		assert!(matches!(err, TransportError::Other(_)));
	}
}
