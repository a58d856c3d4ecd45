use std::collections::HashMap;

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};

/// How probe results are printed
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
	/// Prometheus text exposition format
	Prometheus,
	/// Human readable table
	Table,
}

/// Blackbox DNS probe
#[derive(Parser, Debug)]
#[command(name = "dns-probe")]
#[command(about = "Probe a DNS server over UDP, TCP, DoT, DoH or DoQ and report the result as metrics")]
pub struct Cli {
	/// YAML file with the named probe modules
	#[arg(short = 'c', long = "config", default_value = "dns_probe.yml")]
	pub config: String,

	/// Module to use from the config file
	#[arg(short = 'm', long = "module")]
	pub module: Option<String>,

	/// DNS server to probe: IP, hostname or DoH URL (repeatable, probed in parallel)
	#[arg(short = 't', long = "target")]
	pub targets: Vec<String>,

	/// Name to query
	#[arg(short = 'q', long = "query-name")]
	pub query_name: Option<String>,

	/// Extra module setting as key=value, e.g. protocol=dot (repeatable)
	#[arg(short = 'p', long = "param")]
	pub params: Vec<String>,

	/// Output format
	#[arg(short = 'o', long = "format", value_enum, default_value = "prometheus")]
	pub format: OutputFormat,

	/// Also print the exporter's own query counters
	#[arg(long = "exporter-metrics")]
	pub exporter_metrics: bool,

	/// Log level filter, overridden by RUST_LOG
	#[arg(long = "log-level", default_value = "warn")]
	pub log_level: String,
}

impl Cli {
	/// One request parameter map per probe to run.
	///
	/// With no `--target` a single request is built and the target has to
	/// come from the module.
	pub fn requests(&self) -> Result<Vec<HashMap<String, String>>> {
		let mut base = HashMap::new();
		for param in &self.params {
			let (key, value) = param.split_once('=')
				.ok_or_else(|| anyhow!("invalid --param '{}', expected key=value", param))?;
			base.insert(key.trim().to_string(), value.to_string());
		}
		if let Some(module) = &self.module {
			base.insert("module".to_string(), module.clone());
		}
		if let Some(query_name) = &self.query_name {
			base.insert("query_name".to_string(), query_name.clone());
		}

		if self.targets.is_empty() {
			return Ok(vec![base]);
		}
		Ok(self.targets.iter()
			.map(|target| {
				let mut request = base.clone();
				request.insert("target".to_string(), target.clone());
				request
			})
			.collect())
	}
}
