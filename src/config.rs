use std::collections::{BTreeMap, HashMap};

use anyhow::{anyhow, Result};
use serde::Deserialize;

/// A rule group as written in the module file: quantifier name to predicates.
pub type RuleConfig = BTreeMap<String, Vec<String>>;

/// A partial probe configuration.
///
/// Every field is optional so that the built-in defaults, a stored module and
/// the request overrides can be layered on top of each other. Values are kept
/// close to how they were written; the module resolver turns the merged
/// result into a typed `ProbeSpec`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleConfig {
	pub protocol: Option<String>,
	pub target: Option<String>,
	pub ip: Option<String>,
	pub port: Option<u16>,
	pub family: Option<String>,
	pub query_name: Option<String>,
	pub query_type: Option<String>,
	pub query_class: Option<String>,
	pub recursion_desired: Option<bool>,
	pub timeout: Option<f64>,
	pub edns: Option<bool>,
	pub edns_do: Option<bool>,
	pub edns_nsid: Option<bool>,
	pub edns_bufsize: Option<u16>,
	pub edns_pad: Option<u16>,
	pub valid_rcodes: Option<Vec<String>>,
	pub validate_response_flags: Option<RuleConfig>,
	pub validate_answer_rrs: Option<RuleConfig>,
	pub validate_authority_rrs: Option<RuleConfig>,
	pub validate_additional_rrs: Option<RuleConfig>,
}

impl ModuleConfig {
	/// Built-in defaults, the lowest precedence layer.
	pub fn defaults() -> Self {
		ModuleConfig {
			protocol: Some("udp".to_string()),
			query_type: Some("A".to_string()),
			query_class: Some("IN".to_string()),
			recursion_desired: Some(true),
			timeout: Some(5.0),
			family: Some("ipv6".to_string()),
			edns: Some(true),
			edns_do: Some(false),
			edns_nsid: Some(true),
			edns_bufsize: Some(1232),
			edns_pad: Some(0),
			valid_rcodes: Some(vec!["NOERROR".to_string()]),
			validate_response_flags: Some(RuleConfig::new()),
			validate_answer_rrs: Some(RuleConfig::new()),
			validate_authority_rrs: Some(RuleConfig::new()),
			validate_additional_rrs: Some(RuleConfig::new()),
			..ModuleConfig::default()
		}
	}

	/// Layer `upper` on top of `self`. Fields set in `upper` win.
	pub fn merged_with(&self, upper: &ModuleConfig) -> ModuleConfig {
		let upper = upper.clone();
		let base = self.clone();
		ModuleConfig {
			protocol: upper.protocol.or(base.protocol),
			target: upper.target.or(base.target),
			ip: upper.ip.or(base.ip),
			port: upper.port.or(base.port),
			family: upper.family.or(base.family),
			query_name: upper.query_name.or(base.query_name),
			query_type: upper.query_type.or(base.query_type),
			query_class: upper.query_class.or(base.query_class),
			recursion_desired: upper.recursion_desired.or(base.recursion_desired),
			timeout: upper.timeout.or(base.timeout),
			edns: upper.edns.or(base.edns),
			edns_do: upper.edns_do.or(base.edns_do),
			edns_nsid: upper.edns_nsid.or(base.edns_nsid),
			edns_bufsize: upper.edns_bufsize.or(base.edns_bufsize),
			edns_pad: upper.edns_pad.or(base.edns_pad),
			valid_rcodes: upper.valid_rcodes.or(base.valid_rcodes),
			validate_response_flags: upper.validate_response_flags.or(base.validate_response_flags),
			validate_answer_rrs: upper.validate_answer_rrs.or(base.validate_answer_rrs),
			validate_authority_rrs: upper.validate_authority_rrs.or(base.validate_authority_rrs),
			validate_additional_rrs: upper.validate_additional_rrs.or(base.validate_additional_rrs),
		}
	}
}

/// The module store read from the YAML configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExporterConfig {
	#[serde(default)]
	pub modules: HashMap<String, ModuleConfig>,
}

impl ExporterConfig {
	/// Parse a module store from YAML text.
	pub fn from_yaml(content: &str) -> Result<Self> {
		serde_yaml::from_str(content)
			.map_err(|e| anyhow!("invalid module configuration: {}", e))
	}

	/// Read and parse the module store at `path`.
	pub fn load(path: &str) -> Result<Self> {
		let content = std::fs::read_to_string(path)
			.map_err(|e| anyhow!("failed to read config file '{}': {}", path, e))?;
		Self::from_yaml(&content)
			.map_err(|e| anyhow!("{} ({})", e, path))
	}
}
