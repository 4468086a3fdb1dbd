//! Local challenge pre-flight.
//!
//! Before asking the server to validate a challenge, confirm the response
//! is actually in place: fetch the well-known HTTP path or resolve the
//! `_acme-challenge` TXT record, following CNAME indirection and falling
//! back to the zone's authoritative nameservers when the local resolver
//! has not caught up yet.

use std::net::IpAddr;

use hickory_resolver::{
    config::{NameServerConfigGroup, ResolverConfig, ResolverOpts},
    error::{ResolveError, ResolveErrorKind},
    proto::rr::{RData, RecordType},
    TokioAsyncResolver,
};

use crate::{
    api::ChallengeKind,
    error::{Error, Result},
};

/// CNAME chains longer than this are treated as broken.
const MAX_CNAME_HOPS: usize = 10;

/// DNS queries needed for pre-flight, as a seam for tests.
pub(crate) trait DnsLookup {
    /// Canonical name `name` points at, if any.
    async fn cname(&self, name: &str) -> Result<Option<String>>;

    /// TXT record strings at `name`, via the system resolver.
    async fn txt(&self, name: &str) -> Result<Vec<String>>;

    /// Whether `name` is a zone apex (has an SOA record).
    async fn has_soa(&self, name: &str) -> Result<bool>;

    /// Nameserver hostnames for the zone `name`.
    async fn ns(&self, name: &str) -> Result<Vec<String>>;

    /// Addresses for a nameserver hostname.
    async fn host_addrs(&self, name: &str) -> Result<Vec<IpAddr>>;

    /// TXT record strings at `name`, queried directly at `servers`.
    async fn txt_at(&self, name: &str, servers: &[IpAddr]) -> Result<Vec<String>>;
}

/// [`DnsLookup`] backed by the operating system's resolver configuration.
pub(crate) struct SystemDns {
    resolver: TokioAsyncResolver,
}

impl SystemDns {
    pub(crate) fn from_system_conf() -> Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|err| Error::Verification(format!("resolver configuration: {err}")))?;
        Ok(SystemDns { resolver })
    }
}

/// Absent records are an empty answer, not a failure.
fn none_if_missing<T>(res: std::result::Result<T, ResolveError>) -> Result<Option<T>> {
    match res {
        Ok(val) => Ok(Some(val)),
        Err(err) => match err.kind() {
            ResolveErrorKind::NoRecordsFound { .. } => Ok(None),
            _ => Err(Error::Verification(format!("DNS lookup: {err}"))),
        },
    }
}

fn txt_strings(lookup: Option<hickory_resolver::lookup::TxtLookup>) -> Vec<String> {
    lookup
        .into_iter()
        .flat_map(|l| l.into_iter().map(|txt| txt.to_string()))
        .collect()
}

impl DnsLookup for SystemDns {
    async fn cname(&self, name: &str) -> Result<Option<String>> {
        let lookup = none_if_missing(self.resolver.lookup(name, RecordType::CNAME).await)?;

        Ok(lookup.and_then(|l| {
            l.iter().find_map(|rdata| match rdata {
                RData::CNAME(target) => Some(target.0.to_utf8().trim_end_matches('.').to_owned()),
                _ => None,
            })
        }))
    }

    async fn txt(&self, name: &str) -> Result<Vec<String>> {
        Ok(txt_strings(none_if_missing(
            self.resolver.txt_lookup(name).await,
        )?))
    }

    async fn has_soa(&self, name: &str) -> Result<bool> {
        Ok(none_if_missing(self.resolver.soa_lookup(name).await)?.is_some())
    }

    async fn ns(&self, name: &str) -> Result<Vec<String>> {
        let lookup = none_if_missing(self.resolver.ns_lookup(name).await)?;

        Ok(lookup
            .into_iter()
            .flat_map(|l| {
                l.into_iter()
                    .map(|ns| ns.0.to_utf8().trim_end_matches('.').to_owned())
                    .collect::<Vec<_>>()
            })
            .collect())
    }

    async fn host_addrs(&self, name: &str) -> Result<Vec<IpAddr>> {
        let lookup = none_if_missing(self.resolver.lookup_ip(name).await)?;
        Ok(lookup.into_iter().flat_map(|l| l.into_iter()).collect())
    }

    async fn txt_at(&self, name: &str, servers: &[IpAddr]) -> Result<Vec<String>> {
        let config = ResolverConfig::from_parts(
            None,
            vec![],
            NameServerConfigGroup::from_ips_clear(servers, 53, true),
        );
        let resolver = TokioAsyncResolver::tokio(config, ResolverOpts::default());

        Ok(txt_strings(none_if_missing(resolver.txt_lookup(name).await)?))
    }
}

/// Checks that a challenge response is observable before the server is told
/// to validate it.
pub(crate) struct ChallengeVerifier<D = SystemDns> {
    http: reqwest::Client,
    http_port: u16,
    dns: D,
}

impl ChallengeVerifier<SystemDns> {
    pub(crate) fn new(http: reqwest::Client, http_port: u16) -> Result<Self> {
        Ok(ChallengeVerifier {
            http,
            http_port,
            dns: SystemDns::from_system_conf()?,
        })
    }
}

impl<D: DnsLookup> ChallengeVerifier<D> {
    #[cfg(test)]
    fn with_dns(http: reqwest::Client, http_port: u16, dns: D) -> Self {
        ChallengeVerifier {
            http,
            http_port,
            dns,
        }
    }

    /// Check that `expected` (the key authorization in the form the
    /// challenge type publishes) is being served for `identifier`.
    pub(crate) async fn verify(
        &self,
        kind: ChallengeKind,
        identifier: &str,
        token: &str,
        expected: &str,
    ) -> Result<()> {
        match kind {
            ChallengeKind::Http01 => self.verify_http(identifier, token, expected).await,
            ChallengeKind::Dns01 => self.verify_dns(identifier, expected).await,
        }
    }

    async fn verify_http(&self, identifier: &str, token: &str, expected: &str) -> Result<()> {
        let url = format!(
            "http://{identifier}:{port}/.well-known/acme-challenge/{token}",
            port = self.http_port,
        );
        log::debug!("http-01 pre-flight: {url}");

        let res = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| Error::Verification(format!("challenge URL unreachable: {err}")))?;

        if !res.status().is_success() {
            return Err(Error::Verification(format!(
                "challenge URL returned status {}",
                res.status(),
            )));
        }

        let body = res
            .text()
            .await
            .map_err(|err| Error::Verification(format!("challenge response unreadable: {err}")))?;

        if body.trim_end() == expected {
            Ok(())
        } else {
            Err(Error::Verification(
                "served key authorization does not match".to_owned(),
            ))
        }
    }

    async fn verify_dns(&self, identifier: &str, expected: &str) -> Result<()> {
        let record_name = self.resolve_cname_chain(identifier).await?;
        log::debug!("dns-01 pre-flight: TXT {record_name}");

        let mut records = self.dns.txt(&record_name).await?;

        if !records.iter().any(|r| r == expected) {
            // The local resolver may be serving a stale answer; ask the
            // zone's authoritative nameservers directly. An empty answer
            // keeps the cached records so a mismatch stays reported as one.
            let authoritative = self.authoritative_txt(&record_name).await?;
            if !authoritative.is_empty() {
                records = authoritative;
            }
        }

        if records.iter().any(|r| r == expected) {
            Ok(())
        } else if records.is_empty() {
            Err(Error::Verification(format!(
                "no TXT record found at {record_name}",
            )))
        } else {
            Err(Error::Verification(format!(
                "TXT records at {record_name} do not include the key authorization digest",
            )))
        }
    }

    async fn resolve_cname_chain(&self, identifier: &str) -> Result<String> {
        let mut name = format!("_acme-challenge.{identifier}");

        // One extra lookup so a chain of exactly MAX_CNAME_HOPS aliases
        // ending at a real name is still accepted.
        for _ in 0..=MAX_CNAME_HOPS {
            match self.dns.cname(&name).await? {
                Some(target) => {
                    log::debug!("following CNAME: {name} -> {target}");
                    name = target;
                }
                None => return Ok(name),
            }
        }

        Err(Error::Verification(format!(
            "CNAME chain from _acme-challenge.{identifier} exceeds {MAX_CNAME_HOPS} hops",
        )))
    }

    async fn authoritative_txt(&self, record_name: &str) -> Result<Vec<String>> {
        let Some(zone) = self.find_zone(record_name).await? else {
            return Ok(vec![]);
        };

        let mut addrs = vec![];
        for ns in self.dns.ns(&zone).await? {
            addrs.extend(self.dns.host_addrs(&ns).await?);
        }

        if addrs.is_empty() {
            return Ok(vec![]);
        }

        log::debug!("querying authoritative nameservers of {zone} for {record_name}");
        self.dns.txt_at(record_name, &addrs).await
    }

    /// Walk suffixes of `record_name` until one answers with an SOA.
    async fn find_zone(&self, record_name: &str) -> Result<Option<String>> {
        let mut labels = record_name.split('.').collect::<Vec<_>>();

        while labels.len() > 1 {
            let candidate = labels.join(".");
            if self.dns.has_soa(&candidate).await? {
                return Ok(Some(candidate));
            }
            labels.remove(0);
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct MockDns {
        cnames: HashMap<String, String>,
        txts: HashMap<String, Vec<String>>,
        soas: Vec<String>,
        nss: HashMap<String, Vec<String>>,
        addrs: HashMap<String, Vec<IpAddr>>,
        authoritative_txts: HashMap<String, Vec<String>>,
        authoritative_queries: Mutex<Vec<(String, Vec<IpAddr>)>>,
    }

    impl DnsLookup for MockDns {
        async fn cname(&self, name: &str) -> Result<Option<String>> {
            Ok(self.cnames.get(name).cloned())
        }

        async fn txt(&self, name: &str) -> Result<Vec<String>> {
            Ok(self.txts.get(name).cloned().unwrap_or_default())
        }

        async fn has_soa(&self, name: &str) -> Result<bool> {
            Ok(self.soas.iter().any(|s| s == name))
        }

        async fn ns(&self, name: &str) -> Result<Vec<String>> {
            Ok(self.nss.get(name).cloned().unwrap_or_default())
        }

        async fn host_addrs(&self, name: &str) -> Result<Vec<IpAddr>> {
            Ok(self.addrs.get(name).cloned().unwrap_or_default())
        }

        async fn txt_at(&self, name: &str, servers: &[IpAddr]) -> Result<Vec<String>> {
            self.authoritative_queries
                .lock()
                .push((name.to_owned(), servers.to_vec()));
            Ok(self
                .authoritative_txts
                .get(name)
                .cloned()
                .unwrap_or_default())
        }
    }

    fn verifier(dns: MockDns) -> ChallengeVerifier<MockDns> {
        ChallengeVerifier::with_dns(reqwest::Client::new(), 80, dns)
    }

    #[tokio::test]
    async fn dns_record_resolves_through_cname_indirection() {
        let mut dns = MockDns::default();
        dns.cnames.insert(
            "_acme-challenge.example.test".to_owned(),
            "validation.delegated.test".to_owned(),
        );
        dns.txts.insert(
            "validation.delegated.test".to_owned(),
            vec!["digest-value".to_owned()],
        );

        verifier(dns)
            .verify(ChallengeKind::Dns01, "example.test", "tok", "digest-value")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cname_chain_at_the_hop_limit_still_resolves() {
        let mut dns = MockDns::default();
        dns.cnames.insert(
            "_acme-challenge.example.test".to_owned(),
            "hop1.test".to_owned(),
        );
        for i in 1..MAX_CNAME_HOPS {
            dns.cnames
                .insert(format!("hop{i}.test"), format!("hop{}.test", i + 1));
        }
        dns.txts.insert(
            format!("hop{MAX_CNAME_HOPS}.test"),
            vec!["digest-value".to_owned()],
        );

        verifier(dns)
            .verify(ChallengeKind::Dns01, "example.test", "tok", "digest-value")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cname_loops_are_cut_off() {
        let mut dns = MockDns::default();
        dns.cnames
            .insert("_acme-challenge.example.test".to_owned(), "a.test".to_owned());
        dns.cnames.insert("a.test".to_owned(), "b.test".to_owned());
        dns.cnames.insert("b.test".to_owned(), "a.test".to_owned());

        let err = verifier(dns)
            .verify(ChallengeKind::Dns01, "example.test", "tok", "digest-value")
            .await
            .unwrap_err();

        match err {
            Error::Verification(msg) => assert!(msg.contains("CNAME chain"), "{msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn falls_back_to_authoritative_nameservers() {
        let mut dns = MockDns::default();
        dns.soas.push("example.test".to_owned());
        dns.nss.insert(
            "example.test".to_owned(),
            vec!["ns1.example.test".to_owned()],
        );
        dns.addrs.insert(
            "ns1.example.test".to_owned(),
            vec!["192.0.2.53".parse().unwrap()],
        );
        dns.authoritative_txts.insert(
            "_acme-challenge.example.test".to_owned(),
            vec!["digest-value".to_owned()],
        );

        let v = verifier(dns);
        v.verify(ChallengeKind::Dns01, "example.test", "tok", "digest-value")
            .await
            .unwrap();

        let queries = v.dns.authoritative_queries.lock();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].0, "_acme-challenge.example.test");
        assert_eq!(queries[0].1, vec!["192.0.2.53".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn mismatched_record_is_reported() {
        let mut dns = MockDns::default();
        dns.txts.insert(
            "_acme-challenge.example.test".to_owned(),
            vec!["something-else".to_owned()],
        );

        let err = verifier(dns)
            .verify(ChallengeKind::Dns01, "example.test", "tok", "digest-value")
            .await
            .unwrap_err();

        match err {
            Error::Verification(msg) => assert!(msg.contains("do not include"), "{msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
