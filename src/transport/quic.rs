//! DNS over QUIC (RFC 9250).
//!
//! Each query gets its own endpoint and connection with ALPN `doq`. The
//! message goes on a fresh bidirectional stream with a 2-byte length prefix.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use quinn::crypto::rustls::QuicClientConfig;
use tracing::debug;

use super::tcp::{read_with_length_prefix, send_with_length_prefix};
use super::{tls_client_config, DnsTransport, TransportError};

const DOQ_ALPN: &[u8] = b"doq";

pub struct QuicTransport {
	server_addr: SocketAddr,
	server_name: String,
}

impl QuicTransport {
	pub fn new(server_addr: SocketAddr, server_name: String) -> Self {
		Self {
			server_addr,
			server_name,
		}
	}

	fn endpoint(&self) -> Result<quinn::Endpoint, TransportError> {
		let tls_config = tls_client_config(&[DOQ_ALPN], true)?;
		let quic_config = QuicClientConfig::try_from(tls_config)
			.map_err(|e| TransportError::Other(format!("invalid QUIC TLS config: {}", e)))?;

		let bind_addr: SocketAddr = if self.server_addr.is_ipv4() {
			(Ipv4Addr::UNSPECIFIED, 0).into()
		} else {
			(Ipv6Addr::UNSPECIFIED, 0).into()
		};
		let mut endpoint = quinn::Endpoint::client(bind_addr)
			.map_err(|e| TransportError::Other(format!("failed to bind QUIC endpoint: {}", e)))?;
		endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(quic_config)));
		Ok(endpoint)
	}
}

#[async_trait]
impl DnsTransport for QuicTransport {
	async fn send(&self, message_bytes: &[u8]) -> Result<Vec<u8>, TransportError> {
		let endpoint = self.endpoint()?;

		let connecting = endpoint.connect(self.server_addr, &self.server_name).map_err(|e| {
			TransportError::Other(format!(
				"failed to initiate QUIC connection to {}: {}",
				self.server_addr, e
			))
		})?;
		let conn = connecting.await.map_err(|e| {
			TransportError::Other(format!(
				"QUIC connection to {} ({}) failed: {}",
				self.server_addr, self.server_name, e
			))
		})?;
		debug!(server = %self.server_addr, server_name = %self.server_name, "QUIC connection established");

		let (mut send_stream, mut recv_stream) = conn.open_bi().await.map_err(|e| {
			TransportError::Other(format!("failed to open QUIC stream to {}: {}", self.server_addr, e))
		})?;
		send_with_length_prefix(&mut send_stream, message_bytes).await?;
		send_stream.finish().map_err(|e| {
			TransportError::Other(format!("failed to finish QUIC stream to {}: {}", self.server_addr, e))
		})?;

		let response = read_with_length_prefix(&mut recv_stream).await;
		conn.close(0u32.into(), b"");

		let response = response?;
		debug!(server = %self.server_addr, response_len = response.len(), "QUIC response received");
		Ok(response)
	}

	fn protocol_name(&self) -> &'static str {
		"QUIC"
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_quic_transport_creation() {
		let addr: SocketAddr = "94.140.14.14:853".parse().unwrap();
		let transport = QuicTransport::new(addr, "dns.adguard-dns.com".to_string());
		assert_eq!(transport.server_addr, addr);
		assert_eq!(transport.server_name, "dns.adguard-dns.com");
		assert_eq!(transport.protocol_name(), "QUIC");
	}

	#[tokio::test]
	async fn test_endpoint_binds_matching_family() {
		let v4 = QuicTransport::new("192.0.2.1:853".parse().unwrap(), "dns.example".to_string());
		assert!(v4.endpoint().unwrap().local_addr().unwrap().is_ipv4());
	}
}
