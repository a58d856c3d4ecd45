use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::{DnsTransport, TransportError};

/// DNS over TCP with a fresh connection per query
pub struct TcpTransport {
	server_addr: SocketAddr,
}

impl TcpTransport {
	pub fn new(server_addr: SocketAddr) -> Self {
		Self { server_addr }
	}
}

#[async_trait]
impl DnsTransport for TcpTransport {
	async fn send(&self, message_bytes: &[u8]) -> Result<Vec<u8>, TransportError> {
		let mut stream = TcpStream::connect(self.server_addr).await.map_err(|e| {
			TransportError::Other(format!(
				"connection refused by TCP server {}: {}",
				self.server_addr, e
			))
		})?;
		stream.set_nodelay(true).map_err(|e| {
			TransportError::Other(format!("failed to set TCP_NODELAY on {}: {}", self.server_addr, e))
		})?;

		send_with_length_prefix(&mut stream, message_bytes).await?;
		debug!(server = %self.server_addr, message_len = message_bytes.len(), "TCP query sent");

		let response = read_with_length_prefix(&mut stream).await?;
		debug!(server = %self.server_addr, response_len = response.len(), "TCP response received");
		Ok(response)
	}

	fn protocol_name(&self) -> &'static str {
		"TCP"
	}
}

/// Write a DNS message with its 2-byte big-endian length prefix.
pub(crate) async fn send_with_length_prefix<S>(
	stream: &mut S,
	message_bytes: &[u8],
) -> Result<(), TransportError>
where
	S: AsyncWrite + Unpin,
{
	let length = u16::try_from(message_bytes.len())
		.map_err(|_| TransportError::Other("DNS message too large for length prefix".to_string()))?;

	let mut framed = Vec::with_capacity(message_bytes.len() + 2);
	framed.extend_from_slice(&length.to_be_bytes());
	framed.extend_from_slice(message_bytes);

	stream.write_all(&framed).await
		.map_err(|e| TransportError::Other(format!("failed to write DNS message: {}", e)))?;
	stream.flush().await
		.map_err(|e| TransportError::Other(format!("failed to flush stream: {}", e)))?;
	Ok(())
}

/// Read one length-prefixed DNS message.
pub(crate) async fn read_with_length_prefix<S>(stream: &mut S) -> Result<Vec<u8>, TransportError>
where
	S: AsyncRead + Unpin,
{
	let mut len_buf = [0u8; 2];
	stream.read_exact(&mut len_buf).await
		.map_err(|e| TransportError::Other(format!("failed to read response length: {}", e)))?;

	let response_len = u16::from_be_bytes(len_buf) as usize;
	let mut response = vec![0u8; response_len];
	stream.read_exact(&mut response).await
		.map_err(|e| TransportError::Other(format!("failed to read response body: {}", e)))?;
	Ok(response)
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::net::TcpListener;

	#[tokio::test]
	async fn test_length_prefix_framing() {
		let (mut client, mut server) = tokio::io::duplex(1024);
		send_with_length_prefix(&mut client, b"hello dns").await.unwrap();
		let mut prefix = [0u8; 2];
		server.read_exact(&mut prefix).await.unwrap();
		assert_eq!(prefix, [0, 9]);
		let mut body = [0u8; 9];
		server.read_exact(&mut body).await.unwrap();
		assert_eq!(&body, b"hello dns");

		send_with_length_prefix(&mut client, b"again").await.unwrap();
		let body = read_with_length_prefix(&mut server).await.unwrap();
		assert_eq!(body, b"again");
	}

	#[tokio::test]
	async fn test_short_read_is_error() {
		let (mut client, mut server) = tokio::io::duplex(64);
		client.write_all(&[0, 10, 1, 2]).await.unwrap();
		drop(client);
		assert!(read_with_length_prefix(&mut server).await.is_err());
	}

	#[tokio::test]
	async fn test_round_trip_over_loopback() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();

		tokio::spawn(async move {
			let (mut socket, _) = listener.accept().await.unwrap();
			let query = read_with_length_prefix(&mut socket).await.unwrap();
			send_with_length_prefix(&mut socket, &query).await.unwrap();
		});

		let transport = TcpTransport::new(addr);
		let response = transport.send(b"\x00\x01query").await.unwrap();
		assert_eq!(response, b"\x00\x01query");
	}

	#[tokio::test]
	async fn test_connection_refused_is_other() {
		// bind then drop to get a port with nothing listening
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		drop(listener);

		let err = TcpTransport::new(addr)
			.send(b"\x00\x01")
			.await
			.unwrap_err();
		assert!(matches!(err, TransportError::Other(_)));
	}
}
