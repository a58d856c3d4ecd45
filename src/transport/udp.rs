//! Plain DNS over UDP (RFC 1035 §4.2.1).
//!
//! One datagram out, one datagram back. Datagrams whose transaction ID does
//! not match the query are discarded and the wait continues until the
//! caller's deadline.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use super::{DnsTransport, TransportError};

/// Largest datagram we accept
const MAX_UDP_RESPONSE_SIZE: usize = 65535;

pub struct UdpTransport {
	server_addr: SocketAddr,
}

impl UdpTransport {
	pub fn new(server_addr: SocketAddr) -> Self {
		Self { server_addr }
	}
}

#[async_trait]
impl DnsTransport for UdpTransport {
	async fn send(&self, message_bytes: &[u8]) -> Result<Vec<u8>, TransportError> {
		// Bind a dedicated socket for this query
		let bind_addr = if self.server_addr.is_ipv4() {
			"0.0.0.0:0"
		} else {
			"[::]:0"
		};
		let socket = UdpSocket::bind(bind_addr).await.map_err(|e| {
			TransportError::Other(format!("failed to bind UDP socket: {}", e))
		})?;

		socket.send_to(message_bytes, self.server_addr).await.map_err(|e| {
			TransportError::Other(format!(
				"failed to send UDP query to {}: {}",
				self.server_addr, e
			))
		})?;
		debug!(server = %self.server_addr, bytes_sent = message_bytes.len(), "UDP query sent");

		let mut buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
		loop {
			let (len, from) = socket.recv_from(&mut buf).await.map_err(|e| {
				TransportError::Other(format!(
					"failed to receive UDP response from {}: {}",
					self.server_addr, e
				))
			})?;

			if from != self.server_addr {
				warn!(expected = %self.server_addr, received_from = %from, "UDP response from unexpected source");
				continue;
			}
			if len < 2 || buf[..2] != message_bytes[..2] {
				debug!(server = %self.server_addr, "discarding UDP response with foreign txid");
				continue;
			}

			buf.truncate(len);
			return Ok(buf);
		}
	}

	fn protocol_name(&self) -> &'static str {
		"UDP"
	}
}
