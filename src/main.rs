mod cli;
mod config;
mod dns;
mod metrics;
mod module;
mod output;
mod probe;
mod target;
mod transport;
mod validate;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, OutputFormat};
use crate::config::ExporterConfig;
use crate::metrics::ExporterMetrics;
use crate::probe::Prober;
use crate::target::SystemLookup;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
	let cli = Cli::parse();

	// RUST_LOG wins over --log-level; logs go to stderr so stdout stays metrics only
	let filter = EnvFilter::try_from_default_env()
		.or_else(|_| EnvFilter::try_new(&cli.log_level))
		.map_err(|e| anyhow!("invalid log level '{}': {}", cli.log_level, e))?;
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.init();

	let config = ExporterConfig::load(&cli.config)?;
	debug!(path = %cli.config, modules = config.modules.len(), "loaded module configuration");

	let lookup = Arc::new(SystemLookup::new()?);
	let metrics = Arc::new(ExporterMetrics::new().context("failed to create exporter metrics")?);
	let prober = Arc::new(Prober::new(config, lookup, metrics));

	// One task per target, results printed in the order the targets were given
	let requests = cli.requests()?;
	let handles: Vec<_> = requests.into_iter()
		.map(|request| {
			let prober = prober.clone();
			tokio::spawn(async move {
				let result = prober.run(&request).await;
				(request, result)
			})
		})
		.collect();

	let mut all_succeeded = true;
	for handle in handles {
		let (request, result) = handle.await.context("probe task failed")?;
		all_succeeded &= result.success;
		match cli.format {
			OutputFormat::Prometheus => {
				let text = metrics::render_probe(&result).context("failed to render probe metrics")?;
				print!("{}", text);
			}
			OutputFormat::Table => {
				let target = request.get("target").map(String::as_str).unwrap_or("-");
				println!("{}", output::render_table(target, &result));
			}
		}
	}

	if cli.exporter_metrics {
		let text = prober.metrics().render().context("failed to render exporter metrics")?;
		print!("{}", text);
	}

	Ok(if all_succeeded { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
