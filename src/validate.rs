//! Response validation.
//!
//! A response passes when its rcode is allowed and none of the configured
//! flag or resource record rules fire. The first failing check decides the
//! failure reason.

use std::collections::BTreeMap;

use regex::Regex;
use tracing::debug;

use crate::config::RuleConfig;
use crate::dns::ProbeResponse;
use crate::module::ResolveError;
use crate::probe::FailureReason;

/// How a list of predicates is applied to a list of items.
///
/// Declaration order is evaluation order within a rule group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Quantifier {
	/// Fails if any item satisfies the predicate
	Any,
	/// Fails if every item satisfies the predicate
	All,
	/// Fails if any item does not satisfy the predicate
	AnyNot,
	/// Fails if no item satisfies the predicate
	None,
}

impl Quantifier {
	pub fn from_flag_key(key: &str) -> Option<Self> {
		match key {
			"fail_if_any_present" => Some(Quantifier::Any),
			"fail_if_all_present" => Some(Quantifier::All),
			"fail_if_any_absent" => Some(Quantifier::AnyNot),
			"fail_if_all_absent" => Some(Quantifier::None),
			_ => None,
		}
	}

	pub fn from_record_key(key: &str) -> Option<Self> {
		match key {
			"fail_if_matches_regexp" => Some(Quantifier::Any),
			"fail_if_all_match_regexp" => Some(Quantifier::All),
			"fail_if_not_matches_regexp" => Some(Quantifier::AnyNot),
			"fail_if_none_matches_regexp" => Some(Quantifier::None),
			_ => None,
		}
	}

	/// Evaluate the quantifier over `items`, returning true if the rule fires.
	///
	/// An empty item list never fires, for any quantifier.
	pub fn fires<T>(self, items: &[T], holds: impl Fn(&T) -> bool) -> bool {
		if items.is_empty() {
			return false;
		}
		match self {
			Quantifier::Any => items.iter().any(holds),
			Quantifier::All => items.iter().all(holds),
			Quantifier::AnyNot => !items.iter().all(holds),
			Quantifier::None => !items.iter().any(holds),
		}
	}
}

/// Rules for one section, keyed by quantifier
#[derive(Debug, Clone)]
pub struct RuleSet<P> {
	rules: BTreeMap<Quantifier, Vec<P>>,
}

impl<P> Default for RuleSet<P> {
	fn default() -> Self {
		RuleSet { rules: BTreeMap::new() }
	}
}

impl<P> RuleSet<P> {
	pub fn is_empty(&self) -> bool {
		self.rules.values().all(Vec::is_empty)
	}
}

impl RuleSet<String> {
	/// Flag rules. Flag names are compared case-insensitively.
	pub fn flags(config: &RuleConfig) -> Result<Self, ResolveError> {
		let mut rules = BTreeMap::new();
		for (key, flags) in config {
			let quantifier = Quantifier::from_flag_key(key)
				.ok_or_else(|| unknown_quantifier("validate_response_flags", key))?;
			rules.insert(
				quantifier,
				flags.iter().map(|f| f.trim().to_ascii_uppercase()).collect(),
			);
		}
		Ok(RuleSet { rules })
	}

	/// The configured flags are the items; the predicate is presence in
	/// the response.
	pub fn fires_on(&self, response_flags: &[String]) -> bool {
		self.rules.iter().any(|(quantifier, flags)| {
			quantifier.fires(flags, |flag| response_flags.contains(flag))
		})
	}
}

impl RuleSet<Regex> {
	/// Record rules. Each pattern is anchored at the start of the record text.
	pub fn records(section: &str, config: &RuleConfig) -> Result<Self, ResolveError> {
		let mut rules = BTreeMap::new();
		for (key, patterns) in config {
			let quantifier = Quantifier::from_record_key(key)
				.ok_or_else(|| unknown_quantifier(section, key))?;
			let compiled = patterns.iter()
				.map(|pattern| {
					Regex::new(&format!("^(?:{})", pattern))
						.map_err(|e| ResolveError::InvalidValue {
							key: format!("{}.{}", section, key),
							value: pattern.clone(),
							reason: e.to_string(),
						})
				})
				.collect::<Result<Vec<_>, _>>()?;
			rules.insert(quantifier, compiled);
		}
		Ok(RuleSet { rules })
	}

	/// Each pattern is evaluated on its own with the records as items.
	pub fn fires_on(&self, records: &[String]) -> bool {
		self.rules.iter().any(|(quantifier, patterns)| {
			patterns.iter().any(|pattern| {
				quantifier.fires(records, |record| pattern.is_match(record))
			})
		})
	}
}

fn unknown_quantifier(section: &str, key: &str) -> ResolveError {
	ResolveError::InvalidValue {
		key: section.to_string(),
		value: key.to_string(),
		reason: "unknown rule".to_string(),
	}
}

/// All response checks for one probe
#[derive(Debug, Clone, Default)]
pub struct ValidationRules {
	/// Allowed rcode mnemonics; empty allows any rcode
	pub valid_rcodes: Vec<String>,
	pub flags: RuleSet<String>,
	pub answer: RuleSet<Regex>,
	pub authority: RuleSet<Regex>,
	pub additional: RuleSet<Regex>,
}

/// Check a response against the rules.
pub fn validate(response: &ProbeResponse, rules: &ValidationRules) -> Result<(), FailureReason> {
	if !rules.valid_rcodes.is_empty() && !rules.valid_rcodes.contains(&response.rcode) {
		debug!(rcode = %response.rcode, allowed = ?rules.valid_rcodes, "rcode not allowed");
		return Err(FailureReason::InvalidResponseRcode);
	}

	if rules.flags.fires_on(&response.flags) {
		debug!(flags = ?response.flags, "flag rule fired");
		return Err(FailureReason::InvalidResponseFlags);
	}

	let sections = [
		(&rules.answer, &response.answer, FailureReason::InvalidResponseAnswerRrs),
		(&rules.authority, &response.authority, FailureReason::InvalidResponseAuthorityRrs),
		(&rules.additional, &response.additional, FailureReason::InvalidResponseAdditionalRrs),
	];
	for (rule_set, records, reason) in sections {
		if !rule_set.is_empty() && rule_set.fires_on(records) {
			debug!(reason = %reason, records = ?records, "record rule fired");
			return Err(reason);
		}
	}

	Ok(())
}
