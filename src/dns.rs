//! DNS resolver adapter (spec §4.5/§6): `txt(name) -> { data, rcode, secure,
//! bogus }`, behind one trait with two concrete transports. Collapses the
//! plain/validating duplication the legacy resolver kept as separate code
//! paths (DESIGN NOTES) into a single [`Resolver`] trait.

use crate::DKIMError;
use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use std::time::Duration;

/// Result of a TXT lookup, independent of transport.
#[derive(Debug, Clone, Default)]
pub struct TxtAnswer {
    /// Reassembled TXT record strings (multi-segment character-strings are
    /// concatenated by the transport before reaching the caller).
    pub data: Option<Vec<String>>,
    pub rcode: u8,
    pub secure: bool,
    pub bogus: bool,
}

const RCODE_NO_ERROR: u8 = 0;
const RCODE_NXDOMAIN: u8 = 3;

#[async_trait]
pub trait Resolver: Sync + Send {
    async fn txt(&self, name: &str) -> Result<TxtAnswer, DKIMError>;
}

fn classify_resolve_error(err: &hickory_resolver::error::ResolveError) -> DKIMError {
    match err.kind() {
        ResolveErrorKind::Timeout => DKIMError::DnsTimeout,
        _ => DKIMError::KeyUnavailable(format!("DNS query failed: {}", err)),
    }
}

/// Plain DNS over the resolver's configured transport; never sets `secure`.
pub struct HickoryResolver {
    inner: TokioAsyncResolver,
}

impl HickoryResolver {
    pub fn new(config: ResolverConfig, mut opts: ResolverOpts) -> Result<Self, DKIMError> {
        opts.timeout = Duration::from_secs(5);
        let inner = TokioAsyncResolver::tokio(config, opts);
        Ok(Self { inner })
    }

    pub fn from_system_conf() -> Result<Self, DKIMError> {
        let (config, mut opts) = hickory_resolver::system_conf::read_system_conf()
            .map_err(|err| DKIMError::KeyUnavailable(format!("failed to read resolv.conf: {}", err)))?;
        opts.timeout = Duration::from_secs(5);
        Ok(Self {
            inner: TokioAsyncResolver::tokio(config, opts),
        })
    }
}

#[async_trait]
impl Resolver for HickoryResolver {
    async fn txt(&self, name: &str) -> Result<TxtAnswer, DKIMError> {
        txt_lookup(&self.inner, name, false).await
    }
}

/// Same transport, with DNSSEC validation requested; populates
/// `secure`/`bogus` from the validation outcome.
pub struct ValidatingResolver {
    inner: TokioAsyncResolver,
}

impl ValidatingResolver {
    pub fn new(config: ResolverConfig, mut opts: ResolverOpts) -> Result<Self, DKIMError> {
        opts.timeout = Duration::from_secs(5);
        opts.validate = true;
        let inner = TokioAsyncResolver::tokio(config, opts);
        Ok(Self { inner })
    }
}

#[async_trait]
impl Resolver for ValidatingResolver {
    async fn txt(&self, name: &str) -> Result<TxtAnswer, DKIMError> {
        txt_lookup(&self.inner, name, true).await
    }
}

async fn txt_lookup(
    resolver: &TokioAsyncResolver,
    name: &str,
    validating: bool,
) -> Result<TxtAnswer, DKIMError> {
    match resolver.txt_lookup(name).await {
        Ok(lookup) => {
            // hickory signals bogus DNSSEC validation by returning an error
            // rather than a successful lookup, so any successful lookup
            // under a validating resolver has already passed validation.
            let strings: Vec<String> = lookup
                .iter()
                .map(|txt| {
                    // Multi-segment character-strings are concatenated here.
                    txt.iter()
                        .map(|segment| String::from_utf8_lossy(segment))
                        .collect::<Vec<_>>()
                        .join("")
                })
                .collect();
            Ok(TxtAnswer {
                data: Some(strings),
                rcode: RCODE_NO_ERROR,
                secure: validating,
                bogus: false,
            })
        }
        Err(err) => match err.kind() {
            ResolveErrorKind::NoRecordsFound { response_code, .. } => Ok(TxtAnswer {
                data: None,
                rcode: response_code.low(),
                secure: false,
                bogus: false,
            }),
            ResolveErrorKind::Timeout => Err(DKIMError::DnsTimeout),
            ResolveErrorKind::Message(msg) if validating && msg.contains("RRSIG") => Ok(TxtAnswer {
                data: None,
                rcode: RCODE_NXDOMAIN,
                secure: false,
                bogus: true,
            }),
            _ => Err(classify_resolve_error(&err)),
        },
    }
}

/// Deterministic in-memory resolver for tests, following the teacher's
/// sibling `dns-resolver` crate's `TestResolver` builder idiom.
#[cfg(test)]
pub struct TestResolver {
    answers: std::collections::HashMap<String, TxtAnswer>,
}

#[cfg(test)]
impl TestResolver {
    pub fn new() -> Self {
        Self {
            answers: std::collections::HashMap::new(),
        }
    }

    pub fn with_txt(mut self, name: &str, data: Vec<String>) -> Self {
        self.answers.insert(
            name.to_string(),
            TxtAnswer {
                data: Some(data),
                rcode: RCODE_NO_ERROR,
                secure: false,
                bogus: false,
            },
        );
        self
    }

    pub fn with_nxdomain(mut self, name: &str) -> Self {
        self.answers.insert(
            name.to_string(),
            TxtAnswer {
                data: None,
                rcode: RCODE_NXDOMAIN,
                secure: false,
                bogus: false,
            },
        );
        self
    }
}

#[cfg(test)]
#[async_trait]
impl Resolver for TestResolver {
    async fn txt(&self, name: &str) -> Result<TxtAnswer, DKIMError> {
        Ok(self.answers.get(name).cloned().unwrap_or(TxtAnswer {
            data: None,
            rcode: RCODE_NXDOMAIN,
            secure: false,
            bogus: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_test_resolver() {
        let resolver = TestResolver::new().with_txt("dkim._domainkey.example.com", vec!["v=DKIM1; p=abc".to_string()]);
        let answer = resolver.txt("dkim._domainkey.example.com").await.unwrap();
        assert_eq!(answer.data, Some(vec!["v=DKIM1; p=abc".to_string()]));
    }

    #[tokio::test]
    async fn test_test_resolver_nxdomain() {
        let resolver = TestResolver::new().with_nxdomain("missing._domainkey.example.com");
        let answer = resolver.txt("missing._domainkey.example.com").await.unwrap();
        assert!(answer.data.is_none());
        assert_eq!(answer.rcode, RCODE_NXDOMAIN);
    }
}
