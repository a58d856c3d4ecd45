use std::net::IpAddr;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use hickory_resolver::{Resolver, TokioResolver};
use rand::seq::SliceRandom;
use tracing::debug;
use url::{Host, Url};

use crate::module::{Family, ResolveError};

/// Forward address lookup for a server hostname.
#[async_trait]
pub trait HostLookup: Send + Sync {
	/// Return the addresses of `host` in `family`.
	async fn lookup(&self, host: &str, family: Family) -> Result<Vec<IpAddr>, ResolveError>;
}

/// `HostLookup` backed by the system resolver configuration.
pub struct SystemLookup {
	resolver: TokioResolver,
}

impl SystemLookup {
	/// Build from /etc/resolv.conf. Lookups are never cached.
	pub fn new() -> Result<Self> {
		let mut builder = Resolver::builder_tokio()
			.map_err(|e| anyhow!("failed to read system resolver configuration: {}", e))?;
		builder.options_mut().cache_size = 0;
		Ok(SystemLookup { resolver: builder.build() })
	}
}

#[async_trait]
impl HostLookup for SystemLookup {
	async fn lookup(&self, host: &str, family: Family) -> Result<Vec<IpAddr>, ResolveError> {
		debug!(host = %host, family = %family, "looking up target hostname");
		let unresolvable = |e: hickory_resolver::ResolveError| {
			debug!(host = %host, error = %e, "target lookup failed");
			ResolveError::UnresolvableTarget(host.to_string())
		};
		let addrs = match family {
			Family::Ipv4 => self.resolver.ipv4_lookup(host).await
				.map_err(unresolvable)?
				.iter()
				.map(|a| IpAddr::V4(a.0))
				.collect(),
			Family::Ipv6 => self.resolver.ipv6_lookup(host).await
				.map_err(unresolvable)?
				.iter()
				.map(|aaaa| IpAddr::V6(aaaa.0))
				.collect(),
		};
		Ok(addrs)
	}
}

/// Host component of `target` if it parses as a URL with a host.
pub fn url_host(target: &str) -> Option<Host<String>> {
	let url = Url::parse(target).ok()?;
	url.host().map(|host| host.to_owned())
}

/// Port of `target` if it is a URL naming one explicitly.
pub fn url_port(target: &str) -> Option<u16> {
	Url::parse(target).ok()?.port()
}

/// `url` with `port` filled in when the URL does not name one.
///
/// Returns the URL unchanged when it already has a port or does not parse.
pub fn url_with_port(url: &str, port: u16) -> String {
	match Url::parse(url) {
		Ok(mut parsed) if parsed.port().is_none() => {
			if parsed.port_or_known_default() == Some(port) || parsed.set_port(Some(port)).is_err() {
				return url.to_string();
			}
			parsed.to_string()
		}
		_ => url.to_string(),
	}
}

/// Name the server is expected to present, used for TLS identity checks.
pub fn server_name(target: &str) -> String {
	match url_host(target) {
		Some(Host::Domain(domain)) => domain,
		Some(Host::Ipv4(ip)) => ip.to_string(),
		Some(Host::Ipv6(ip)) => ip.to_string(),
		None => target.to_string(),
	}
}

/// Pick one address of `family` at random.
pub fn select_address(addrs: &[IpAddr], family: Family) -> Option<IpAddr> {
	let candidates: Vec<IpAddr> = addrs.iter()
		.copied()
		.filter(|ip| family.matches(ip))
		.collect();
	candidates.choose(&mut rand::thread_rng()).copied()
}

/// Turn a target (IP literal, URL or hostname) into the IP to query.
///
/// Literal IPs must match `family`. URLs are reduced to their host, then
/// hostnames are looked up and one address of the family is chosen.
pub async fn resolve_target(
	target: &str,
	family: Family,
	lookup: &dyn HostLookup,
) -> Result<IpAddr, ResolveError> {
	if let Ok(ip) = target.trim().parse::<IpAddr>() {
		if family.matches(&ip) {
			return Ok(ip);
		}
		return Err(ResolveError::InvalidIp(target.to_string()));
	}

	let hostname = match url_host(target) {
		Some(Host::Domain(domain)) => domain,
		Some(Host::Ipv4(ip)) => return literal_host(IpAddr::V4(ip), target, family),
		Some(Host::Ipv6(ip)) => return literal_host(IpAddr::V6(ip), target, family),
		None => target.trim().to_string(),
	};

	let addrs = lookup.lookup(&hostname, family).await?;
	let ip = select_address(&addrs, family)
		.ok_or_else(|| ResolveError::UnresolvableTarget(hostname.clone()))?;
	debug!(target = %target, hostname = %hostname, ip = %ip, "resolved target");
	Ok(ip)
}

fn literal_host(ip: IpAddr, target: &str, family: Family) -> Result<IpAddr, ResolveError> {
	if family.matches(&ip) {
		Ok(ip)
	} else {
		Err(ResolveError::UnresolvableTarget(target.to_string()))
	}
}

#[cfg(test)]
pub mod tests {
	use super::*;
	use std::collections::HashMap;

	use crate::probe::FailureReason;

	/// In-memory lookup for tests.
	#[derive(Default)]
	pub struct StaticLookup {
		pub hosts: HashMap<String, Vec<IpAddr>>,
	}

	impl StaticLookup {
		pub fn with(host: &str, addrs: &[&str]) -> Self {
			let mut hosts = HashMap::new();
			hosts.insert(
				host.to_string(),
				addrs.iter().map(|a| a.parse().unwrap()).collect(),
			);
			StaticLookup { hosts }
		}
	}

	#[async_trait]
	impl HostLookup for StaticLookup {
		async fn lookup(&self, host: &str, family: Family) -> Result<Vec<IpAddr>, ResolveError> {
			let addrs: Vec<IpAddr> = self.hosts.get(host)
				.map(|addrs| addrs.iter().copied().filter(|ip| family.matches(ip)).collect())
				.unwrap_or_default();
			if addrs.is_empty() {
				return Err(ResolveError::UnresolvableTarget(host.to_string()));
			}
			Ok(addrs)
		}
	}

	#[tokio::test]
	async fn test_literal_ip_family() {
		let lookup = StaticLookup::default();
		let ip = resolve_target("192.0.2.1", Family::Ipv4, &lookup).await.unwrap();
		assert_eq!(ip.to_string(), "192.0.2.1");

		let err = resolve_target("2001:db8::1", Family::Ipv4, &lookup).await.unwrap_err();
		assert_eq!(err.reason(), FailureReason::InvalidRequestIp);
	}

	#[tokio::test]
	async fn test_hostname_lookup() {
		let lookup = StaticLookup::with("dns.example", &["192.0.2.1", "2001:db8::53"]);
		let ip = resolve_target("dns.example", Family::Ipv6, &lookup).await.unwrap();
		assert_eq!(ip.to_string(), "2001:db8::53");
	}

	#[tokio::test]
	async fn test_url_host_is_looked_up() {
		let lookup = StaticLookup::with("dns.example", &["192.0.2.7"]);
		let ip = resolve_target("https://dns.example/dns-query", Family::Ipv4, &lookup)
			.await
			.unwrap();
		assert_eq!(ip.to_string(), "192.0.2.7");
	}

	#[tokio::test]
	async fn test_url_with_literal_host() {
		let lookup = StaticLookup::default();
		let ip = resolve_target("https://[2001:db8::1]/dns-query", Family::Ipv6, &lookup)
			.await
			.unwrap();
		assert_eq!(ip.to_string(), "2001:db8::1");

		let err = resolve_target("https://192.0.2.1/dns-query", Family::Ipv6, &lookup)
			.await
			.unwrap_err();
		assert_eq!(err.reason(), FailureReason::InvalidRequestTarget);
	}

	#[tokio::test]
	async fn test_no_address_in_family() {
		let lookup = StaticLookup::with("v4only.example", &["192.0.2.1"]);
		let err = resolve_target("v4only.example", Family::Ipv6, &lookup).await.unwrap_err();
		assert_eq!(err.reason(), FailureReason::InvalidRequestTarget);

		let err = resolve_target("missing.example", Family::Ipv4, &lookup).await.unwrap_err();
		assert_eq!(err.reason(), FailureReason::InvalidRequestTarget);
	}

	#[test]
	fn test_select_address_spreads_over_candidates() {
		let addrs: Vec<IpAddr> = ["192.0.2.1", "192.0.2.2", "192.0.2.3", "2001:db8::1"]
			.iter()
			.map(|a| a.parse().unwrap())
			.collect();
		let mut seen = std::collections::HashSet::new();
		for _ in 0..200 {
			let ip = select_address(&addrs, Family::Ipv4).unwrap();
			assert!(ip.is_ipv4());
			seen.insert(ip);
		}
		assert_eq!(seen.len(), 3);
		assert!(select_address(&[], Family::Ipv4).is_none());
	}

	#[test]
	fn test_server_name() {
		assert_eq!(server_name("dns.google"), "dns.google");
		assert_eq!(server_name("https://dns.google/dns-query"), "dns.google");
		assert_eq!(server_name("https://[2001:db8::1]:8443/q"), "2001:db8::1");
		assert_eq!(url_port("https://dns.google/dns-query"), None);
		assert_eq!(url_port("https://dns.google:8443/dns-query"), Some(8443));
		assert_eq!(url_port("dns.google"), None);
	}

	#[test]
	fn test_url_with_port() {
		assert_eq!(
			url_with_port("https://dns.google/dns-query", 8443),
			"https://dns.google:8443/dns-query"
		);
		assert_eq!(
			url_with_port("https://[2001:db8::1]/dns-query", 8443),
			"https://[2001:db8::1]:8443/dns-query"
		);
		// an explicit URL port wins
		assert_eq!(
			url_with_port("https://dns.google:9443/dns-query", 8443),
			"https://dns.google:9443/dns-query"
		);
		assert_eq!(url_with_port("https://dns.google/dns-query", 443), "https://dns.google/dns-query");
	}
}
