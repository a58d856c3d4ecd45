use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};

use crate::probe::{ProbeResult, NO_NSID};

/// Render a probe result as a human readable table.
pub fn render_table(target: &str, result: &ProbeResult) -> String {
	let mut table = Table::new();
	table.load_preset(UTF8_FULL);
	table.set_content_arrangement(ContentArrangement::Dynamic);
	table.set_header(vec!["Field", "Value"]);

	let verdict = if result.success { "success" } else { "failure" };
	table.add_row(vec!["Target".to_string(), target.to_string()]);
	table.add_row(vec!["Result".to_string(), verdict.to_string()]);
	if let Some(reason) = result.failure {
		table.add_row(vec!["Failure reason".to_string(), reason.to_string()]);
	}
	if let Some(elapsed) = result.elapsed {
		table.add_row(vec![
			"Query time".to_string(),
			format!("{:.1} ms", elapsed.as_secs_f64() * 1000.0),
		]);
	}

	if let Some(labels) = &result.labels {
		let rows = [
			("Server IP", labels.ip.to_string()),
			("Protocol", labels.protocol.clone()),
			("Family", labels.family.clone()),
			("Query", format!("{} {}", labels.query_name, labels.query_type)),
			("Opcode", labels.opcode.clone()),
			("Rcode", labels.rcode.clone()),
			("Flags", labels.flags.clone()),
			("NSID", labels.nsid.clone().unwrap_or_else(|| NO_NSID.to_string())),
			(
				"Records",
				format!(
					"{} answer, {} authority, {} additional",
					labels.answer, labels.authority, labels.additional
				),
			),
		];
		for (field, value) in rows {
			table.add_row(vec![field.to_string(), value]);
		}
	}

	format!("{table}")
}
