use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use hickory_proto::rr::{DNSClass, Name, RecordType};
use thiserror::Error;
use tracing::debug;

use crate::config::{ModuleConfig, RuleConfig};
use crate::probe::FailureReason;
use crate::target::url_host;
use crate::validate::{RuleSet, ValidationRules};

/// Transport used to deliver the query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
	Udp,
	Tcp,
	Dot,
	Doh,
	Doq,
}

impl Protocol {
	pub fn as_str(&self) -> &'static str {
		match self {
			Protocol::Udp => "udp",
			Protocol::Tcp => "tcp",
			Protocol::Dot => "dot",
			Protocol::Doh => "doh",
			Protocol::Doq => "doq",
		}
	}

	/// Port used when neither the module nor the target names one.
	pub fn default_port(&self) -> u16 {
		match self {
			Protocol::Udp | Protocol::Tcp => 53,
			Protocol::Dot | Protocol::Doq => 853,
			Protocol::Doh => 443,
		}
	}
}

impl FromStr for Protocol {
	type Err = ResolveError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"udp" => Ok(Protocol::Udp),
			"tcp" => Ok(Protocol::Tcp),
			"dot" => Ok(Protocol::Dot),
			"doh" => Ok(Protocol::Doh),
			"doq" => Ok(Protocol::Doq),
			other => Err(ResolveError::InvalidProtocol(other.to_string())),
		}
	}
}

impl fmt::Display for Protocol {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Address family of the server IP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
	Ipv4,
	Ipv6,
}

impl Family {
	pub fn as_str(&self) -> &'static str {
		match self {
			Family::Ipv4 => "ipv4",
			Family::Ipv6 => "ipv6",
		}
	}

	/// True if `ip` belongs to this family.
	pub fn matches(&self, ip: &IpAddr) -> bool {
		matches!(
			(self, ip),
			(Family::Ipv4, IpAddr::V4(_)) | (Family::Ipv6, IpAddr::V6(_))
		)
	}
}

impl FromStr for Family {
	type Err = ResolveError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"ipv4" => Ok(Family::Ipv4),
			"ipv6" => Ok(Family::Ipv6),
			other => Err(ResolveError::InvalidFamily(other.to_string())),
		}
	}
}

impl fmt::Display for Family {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// EDNS(0) settings attached to the outgoing query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdnsSettings {
	pub enabled: bool,
	pub dnssec_ok: bool,
	pub nsid: bool,
	/// Advertised UDP payload size, 0 leaves the library default
	pub bufsize: u16,
	/// Padding block size, 0 disables padding
	pub pad: u16,
}

/// Fully resolved configuration for one probe.
///
/// Built once by `resolve` and never modified afterwards.
#[derive(Debug, Clone)]
pub struct ProbeSpec {
	pub module: String,
	pub protocol: Protocol,
	pub target: String,
	/// Explicit `ip` or literal IP target; `None` means the target still has to be resolved
	pub ip: Option<IpAddr>,
	pub port: Option<u16>,
	pub family: Family,
	pub query_name: Name,
	pub query_type: RecordType,
	pub query_class: DNSClass,
	pub recursion_desired: bool,
	pub timeout: Duration,
	pub edns: EdnsSettings,
	pub rules: ValidationRules,
}

/// Reasons a probe cannot be built or its server cannot be located
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolveError {
	#[error("missing or unknown module {0:?}")]
	InvalidModule(Option<String>),
	#[error("no target given")]
	MissingTarget,
	#[error("unable to resolve target '{0}'")]
	UnresolvableTarget(String),
	#[error("invalid protocol '{0}'")]
	InvalidProtocol(String),
	#[error("invalid address family '{0}'")]
	InvalidFamily(String),
	#[error("invalid ip '{0}' for the configured family")]
	InvalidIp(String),
	#[error("no query_name given")]
	MissingQueryName,
	#[error("invalid value '{value}' for {key}: {reason}")]
	InvalidValue {
		key: String,
		value: String,
		reason: String,
	},
}

impl ResolveError {
	fn invalid(key: &str, value: &str, reason: impl fmt::Display) -> Self {
		ResolveError::InvalidValue {
			key: key.to_string(),
			value: value.to_string(),
			reason: reason.to_string(),
		}
	}

	/// The failure reason reported for this error.
	pub fn reason(&self) -> FailureReason {
		match self {
			ResolveError::InvalidModule(_) => FailureReason::InvalidRequestModule,
			ResolveError::MissingTarget | ResolveError::UnresolvableTarget(_) => {
				FailureReason::InvalidRequestTarget
			}
			ResolveError::InvalidProtocol(_) => FailureReason::InvalidRequestProtocol,
			ResolveError::InvalidFamily(_) => FailureReason::InvalidRequestFamily,
			ResolveError::InvalidIp(_) => FailureReason::InvalidRequestIp,
			ResolveError::MissingQueryName | ResolveError::InvalidValue { .. } => {
				FailureReason::Other
			}
		}
	}
}

/// Query string booleans: only the literal "true" is true.
fn parse_bool(value: &str) -> bool {
	value == "true"
}

fn parse_number<T>(key: &str, value: &str) -> Result<T, ResolveError>
where
	T: FromStr,
	T::Err: fmt::Display,
{
	value.trim().parse::<T>()
		.map_err(|e| ResolveError::invalid(key, value, e))
}

/// Coerce untyped request parameters into a partial module.
///
/// The `module` key selects the stored module and is not part of the result.
/// Keys that do not name a module setting are ignored.
pub fn overrides_from_params(
	params: &HashMap<String, String>,
) -> Result<ModuleConfig, ResolveError> {
	let mut overrides = ModuleConfig::default();
	for (key, value) in params {
		match key.as_str() {
			"module" => {}
			"protocol" => overrides.protocol = Some(value.clone()),
			"target" => overrides.target = Some(value.clone()),
			"ip" => overrides.ip = Some(value.clone()),
			"family" => overrides.family = Some(value.clone()),
			"query_name" => overrides.query_name = Some(value.clone()),
			"query_type" => overrides.query_type = Some(value.clone()),
			"query_class" => overrides.query_class = Some(value.clone()),
			"recursion_desired" => overrides.recursion_desired = Some(parse_bool(value)),
			"edns" => overrides.edns = Some(parse_bool(value)),
			"edns_do" => overrides.edns_do = Some(parse_bool(value)),
			"edns_nsid" => overrides.edns_nsid = Some(parse_bool(value)),
			"port" => overrides.port = Some(parse_number(key, value)?),
			"edns_bufsize" => overrides.edns_bufsize = Some(parse_number(key, value)?),
			"edns_pad" => overrides.edns_pad = Some(parse_number(key, value)?),
			"timeout" => overrides.timeout = Some(parse_number(key, value)?),
			"valid_rcodes" => {
				overrides.valid_rcodes = Some(
					value.split(',')
						.map(str::trim)
						.filter(|s| !s.is_empty())
						.map(String::from)
						.collect(),
				);
			}
			_ => debug!(key = %key, "ignoring unknown request parameter"),
		}
	}
	Ok(overrides)
}

/// Rewrite a bare DoH target into the default endpoint URL.
///
/// Targets that already parse as a URL with a host are returned unchanged.
pub fn doh_url(target: &str) -> String {
	if url_host(target).is_some() {
		return target.to_string();
	}
	match target.parse::<IpAddr>() {
		Ok(IpAddr::V6(ip)) => format!("https://[{}]/dns-query", ip),
		_ => format!("https://{}/dns-query", target),
	}
}

/// Merge defaults, the requested stored module and request parameters
/// into a validated `ProbeSpec`.
///
/// Precedence, lowest first: `defaults`, the module named by the `module`
/// parameter, then the remaining request parameters.
pub fn resolve(
	defaults: &ModuleConfig,
	modules: &HashMap<String, ModuleConfig>,
	params: &HashMap<String, String>,
) -> Result<ProbeSpec, ResolveError> {
	let module_name = params.get("module").cloned();
	let stored = module_name.as_ref()
		.and_then(|name| modules.get(name))
		.ok_or_else(|| ResolveError::InvalidModule(module_name.clone()))?;
	let module_name = module_name.unwrap_or_default();

	let overrides = overrides_from_params(params)?;
	let merged = defaults.merged_with(stored).merged_with(&overrides);

	let target = merged.target.clone()
		.filter(|t| !t.trim().is_empty())
		.ok_or(ResolveError::MissingTarget)?;
	let protocol: Protocol = required(&merged.protocol, "protocol")?.parse()?;
	let family: Family = required(&merged.family, "family")?.parse()?;

	// an explicit ip must be valid and agree with the family
	let ip = match &merged.ip {
		Some(raw) => {
			let ip: IpAddr = raw.trim().parse()
				.map_err(|_| ResolveError::InvalidIp(raw.clone()))?;
			if !family.matches(&ip) {
				return Err(ResolveError::InvalidIp(raw.clone()));
			}
			Some(ip)
		}
		None => None,
	};

	// a literal IP target is checked against the family before any DoH rewrite
	let ip = match target.trim().parse::<IpAddr>() {
		Ok(literal) if !family.matches(&literal) => {
			return Err(ResolveError::InvalidIp(target.clone()));
		}
		Ok(literal) => ip.or(Some(literal)),
		Err(_) => ip,
	};

	let raw_name = merged.query_name.as_deref()
		.filter(|n| !n.is_empty())
		.ok_or(ResolveError::MissingQueryName)?;
	let query_name = Name::from_ascii(raw_name)
		.map_err(|e| ResolveError::invalid("query_name", raw_name, e))?;

	let raw_type = required(&merged.query_type, "query_type")?;
	let query_type = RecordType::from_str(&raw_type.to_ascii_uppercase())
		.map_err(|e| ResolveError::invalid("query_type", raw_type, e))?;
	let raw_class = required(&merged.query_class, "query_class")?;
	let query_class = DNSClass::from_str(&raw_class.to_ascii_uppercase())
		.map_err(|e| ResolveError::invalid("query_class", raw_class, e))?;

	let seconds = merged.timeout.unwrap_or_default();
	if !seconds.is_finite() || seconds <= 0.0 {
		return Err(ResolveError::invalid("timeout", &seconds.to_string(), "must be a positive number of seconds"));
	}
	let timeout = Duration::try_from_secs_f64(seconds)
		.map_err(|e| ResolveError::invalid("timeout", &seconds.to_string(), e))?;

	let target = if protocol == Protocol::Doh {
		doh_url(&target)
	} else {
		target
	};

	let rules = ValidationRules {
		valid_rcodes: merged.valid_rcodes.clone().unwrap_or_default()
			.iter()
			.map(|r| r.trim().to_ascii_uppercase())
			.collect(),
		flags: RuleSet::flags(&rule_config(&merged.validate_response_flags))?,
		answer: RuleSet::records("validate_answer_rrs", &rule_config(&merged.validate_answer_rrs))?,
		authority: RuleSet::records("validate_authority_rrs", &rule_config(&merged.validate_authority_rrs))?,
		additional: RuleSet::records("validate_additional_rrs", &rule_config(&merged.validate_additional_rrs))?,
	};

	Ok(ProbeSpec {
		module: module_name,
		protocol,
		target,
		ip,
		port: merged.port,
		family,
		query_name,
		query_type,
		query_class,
		recursion_desired: merged.recursion_desired.unwrap_or(true),
		timeout,
		edns: EdnsSettings {
			enabled: merged.edns.unwrap_or(false),
			dnssec_ok: merged.edns_do.unwrap_or(false),
			nsid: merged.edns_nsid.unwrap_or(false),
			bufsize: merged.edns_bufsize.unwrap_or(0),
			pad: merged.edns_pad.unwrap_or(0),
		},
		rules,
	})
}

fn required<'a>(value: &'a Option<String>, key: &str) -> Result<&'a str, ResolveError> {
	value.as_deref()
		.ok_or_else(|| ResolveError::invalid(key, "", "missing"))
}

fn rule_config(value: &Option<RuleConfig>) -> RuleConfig {
	value.clone().unwrap_or_default()
}
