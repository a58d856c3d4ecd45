//! DNS over TLS (RFC 7858).
//!
//! A new TCP connection and TLS handshake per query; the certificate is
//! checked against the target host name.

use std::net::SocketAddr;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::tcp::{read_with_length_prefix, send_with_length_prefix};
use super::{tls_client_config, DnsTransport, TransportError};

pub struct TlsTransport {
	server_addr: SocketAddr,
	hostname: String,
}

impl TlsTransport {
	pub fn new(server_addr: SocketAddr, hostname: String) -> Self {
		Self {
			server_addr,
			hostname,
		}
	}
}

#[async_trait]
impl DnsTransport for TlsTransport {
	async fn send(&self, message_bytes: &[u8]) -> Result<Vec<u8>, TransportError> {
		let connector = TlsConnector::from(tls_client_config(&[], false)?);
		let server_name = ServerName::try_from(self.hostname.clone()).map_err(|e| {
			TransportError::Other(format!("invalid TLS hostname '{}': {}", self.hostname, e))
		})?;

		let tcp_stream = TcpStream::connect(self.server_addr).await.map_err(|e| {
			TransportError::Other(format!(
				"connection refused by TLS server {}: {}",
				self.server_addr, e
			))
		})?;
		let mut stream = connector.connect(server_name, tcp_stream).await.map_err(|e| {
			TransportError::Other(format!(
				"TLS handshake failed with {} ({}): {}",
				self.server_addr, self.hostname, e
			))
		})?;
		debug!(server = %self.server_addr, hostname = %self.hostname, "TLS connection established");

		send_with_length_prefix(&mut stream, message_bytes).await?;
		let response = read_with_length_prefix(&mut stream).await?;
		debug!(server = %self.server_addr, response_len = response.len(), "TLS response received");
		Ok(response)
	}

	fn protocol_name(&self) -> &'static str {
		"TLS"
	}
}
