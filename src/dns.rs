use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::opt::{EdnsCode, EdnsOption};

use crate::module::ProbeSpec;
use crate::transport::TransportError;

/// Size of an EDNS option header (code + length)
const EDNS_OPTION_HEADER_LEN: usize = 4;

/// The parts of a DNS response the probe reports and validates.
///
/// Everything is already rendered as text so the validator works on plain
/// strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
	pub opcode: String,
	pub rcode: String,
	/// Header flag mnemonics, sorted
	pub flags: Vec<String>,
	pub nsid: Option<String>,
	/// Answer RDATA text, one entry per record
	pub answer: Vec<String>,
	/// Full record text
	pub authority: Vec<String>,
	/// Full record text
	pub additional: Vec<String>,
}

impl ProbeResponse {
	pub fn from_message(message: &Message) -> Self {
		let nsid = message.extensions().as_ref()
			.and_then(|edns| match edns.options().get(EdnsCode::NSID) {
				Some(EdnsOption::Unknown(_, data)) => Some(nsid_text(data)),
				_ => None,
			});

		ProbeResponse {
			opcode: opcode_text(message.op_code()),
			rcode: rcode_text(message.response_code()),
			flags: flag_list(message),
			nsid,
			answer: message.answers().iter()
				.map(|record| record.data().to_string())
				.collect(),
			authority: message.name_servers().iter()
				.map(|record| record.to_string())
				.collect(),
			additional: message.additionals().iter()
				.map(|record| record.to_string())
				.collect(),
		}
	}
}

/// Build the wire-format query for a probe.
///
/// EDNS is attached only when enabled. With padding configured the query is
/// padded up to a multiple of the padding block size.
pub fn build_query(spec: &ProbeSpec, txid: u16) -> Result<Vec<u8>, TransportError> {
	let mut query = Query::query(spec.query_name.clone(), spec.query_type);
	query.set_query_class(spec.query_class);

	let mut message = Message::new();
	message.set_id(txid);
	message.set_message_type(MessageType::Query);
	message.set_op_code(OpCode::Query);
	message.set_recursion_desired(spec.recursion_desired);
	message.add_query(query);

	let settings = spec.edns;
	if settings.enabled {
		let edns = message.extensions_mut().get_or_insert_with(Edns::new);
		edns.set_dnssec_ok(settings.dnssec_ok);
		if settings.bufsize > 0 {
			edns.set_max_payload(settings.bufsize);
		}
		if settings.nsid {
			edns.options_mut()
				.insert(EdnsOption::Unknown(u16::from(EdnsCode::NSID), Vec::new()));
		}
	}

	let bytes = message.to_vec()
		.map_err(|e| TransportError::Other(format!("failed to serialize DNS query: {}", e)))?;

	if !settings.enabled || settings.pad == 0 {
		return Ok(bytes);
	}

	let block = settings.pad as usize;
	let padding = (block - (bytes.len() + EDNS_OPTION_HEADER_LEN) % block) % block;
	if let Some(edns) = message.extensions_mut().as_mut() {
		edns.options_mut()
			.insert(EdnsOption::Unknown(u16::from(EdnsCode::Padding), vec![0u8; padding]));
	}
	message.to_vec()
		.map_err(|e| TransportError::Other(format!("failed to serialize padded DNS query: {}", e)))
}

/// Parse a DNS response and make sure it answers the query with `expected_txid`.
pub fn parse_response(bytes: &[u8], expected_txid: u16) -> Result<Message, TransportError> {
	let message = Message::from_vec(bytes)
		.map_err(|e| TransportError::Other(format!("failed to parse DNS response: {}", e)))?;

	if message.id() != expected_txid {
		return Err(TransportError::Other(format!(
			"txid mismatch: expected {}, got {}",
			expected_txid, message.id()
		)));
	}

	if message.message_type() != MessageType::Response {
		return Err(TransportError::Other(
			"received a query instead of a response".to_string(),
		));
	}

	Ok(message)
}

/// Upper-case rcode mnemonic, or the numeric value when unnamed.
pub fn rcode_text(rcode: ResponseCode) -> String {
	let value = u16::from(rcode);
	let name = match value {
		0 => "NOERROR",
		1 => "FORMERR",
		2 => "SERVFAIL",
		3 => "NXDOMAIN",
		4 => "NOTIMP",
		5 => "REFUSED",
		6 => "YXDOMAIN",
		7 => "YXRRSET",
		8 => "NXRRSET",
		9 => "NOTAUTH",
		10 => "NOTZONE",
		16 => "BADVERS",
		23 => "BADCOOKIE",
		_ => return value.to_string(),
	};
	name.to_string()
}

/// Upper-case opcode mnemonic, or the numeric value when unnamed.
pub fn opcode_text(opcode: OpCode) -> String {
	let value = u8::from(opcode);
	let name = match value {
		0 => "QUERY",
		1 => "IQUERY",
		2 => "STATUS",
		4 => "NOTIFY",
		5 => "UPDATE",
		_ => return value.to_string(),
	};
	name.to_string()
}

/// Header flags set in the message, sorted alphabetically.
pub fn flag_list(message: &Message) -> Vec<String> {
	let mut flags: Vec<String> = [
		("QR", message.message_type() == MessageType::Response),
		("AA", message.authoritative()),
		("TC", message.truncated()),
		("RD", message.recursion_desired()),
		("RA", message.recursion_available()),
		("AD", message.authentic_data()),
		("CD", message.checking_disabled()),
	]
	.iter()
	.filter(|(_, set)| *set)
	.map(|(name, _)| name.to_string())
	.collect();
	flags.sort();
	flags
}

/// NSID as text when printable ASCII, otherwise as lower-case hex.
fn nsid_text(data: &[u8]) -> String {
	if data.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
		String::from_utf8_lossy(data).into_owned()
	} else {
		data.iter().map(|b| format!("{:02x}", b)).collect()
	}
}
