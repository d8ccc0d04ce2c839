use async_trait::async_trait;
use hickory_resolver::proto::op::response_code::ResponseCode;
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::proto::ProtoErrorKind;
use hickory_resolver::{Name, ResolveError, TokioResolver};
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

mod overlay;

pub use overlay::FileOverlay;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Error, PartialEq)]
pub enum DnsError {
    #[error("invalid DNS name: {0}")]
    InvalidName(String),
    #[error("DNS: {0}")]
    ResolveFailed(String),
    #[error("DNS: timeout resolving {0}")]
    Timeout(String),
}

impl DnsError {
    pub(crate) fn from_resolve(name: &impl fmt::Display, err: ResolveError) -> Self {
        DnsError::ResolveFailed(format!("failed to query DNS for {name}: {err}"))
    }

    /// A transient error may succeed on retry; everything except a
    /// malformed query name is treated as transient.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::InvalidName(_))
    }
}

/// The result of a TXT lookup. A name that does not exist is reported
/// via `nxdomain` rather than as an error; a name that exists with no
/// TXT records yields an empty record list.
#[derive(Debug, Clone, Default)]
pub struct TxtAnswer {
    pub records: Vec<String>,
    pub nxdomain: bool,
}

#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    async fn resolve_txt(&self, name: &str) -> Result<TxtAnswer, DnsError>;
}

#[async_trait]
impl<T: Resolver + ?Sized> Resolver for Arc<T> {
    async fn resolve_txt(&self, name: &str) -> Result<TxtAnswer, DnsError> {
        (**self).resolve_txt(name).await
    }
}

/// Live resolver backed by hickory, with a query timeout.
pub struct HickoryResolver {
    inner: TokioResolver,
    timeout: Duration,
}

impl HickoryResolver {
    pub fn new() -> Result<Self, hickory_resolver::ResolveError> {
        Ok(Self {
            inner: TokioResolver::builder_tokio()?.build(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Resolver for HickoryResolver {
    async fn resolve_txt(&self, name: &str) -> Result<TxtAnswer, DnsError> {
        let dns_name = Name::from_utf8(name)
            .map_err(|err| DnsError::InvalidName(format!("invalid name {name}: {err}")))?;

        let lookup = tokio::time::timeout(
            self.timeout,
            self.inner.lookup(dns_name.clone(), RecordType::TXT),
        )
        .await
        .map_err(|_| DnsError::Timeout(name.to_string()))?;

        match lookup {
            Ok(result) => {
                let mut records = vec![];
                for rdata in result.iter() {
                    if let RData::TXT(txt) = rdata {
                        let mut joined = String::new();
                        for segment in txt.iter() {
                            joined.push_str(&String::from_utf8_lossy(segment));
                        }
                        records.push(joined);
                    }
                }
                Ok(TxtAnswer {
                    records,
                    nxdomain: false,
                })
            }
            Err(err) => match err.proto().map(|err| err.kind()) {
                Some(ProtoErrorKind::NoRecordsFound { response_code, .. }) => Ok(TxtAnswer {
                    records: vec![],
                    nxdomain: *response_code == ResponseCode::NXDomain,
                }),
                _ => Err(DnsError::from_resolve(&dns_name, err)),
            },
        }
    }
}

/// Fixture resolver for tests: answers from a static table, optionally
/// simulating transient failures for specific names.
#[derive(Debug, Default)]
pub struct TestResolver {
    records: BTreeMap<String, Vec<String>>,
    tempfail: BTreeSet<String>,
}

impl TestResolver {
    pub fn with_txt(self, name: &str, value: String) -> Self {
        self.with_txt_multiple(name, vec![value])
    }

    /// Add multiple separate TXT records for the specified name
    pub fn with_txt_multiple(mut self, name: &str, values: Vec<String>) -> Self {
        self.records.insert(name.to_ascii_lowercase(), values);
        self
    }

    /// Simulate a transient lookup failure for the specified name
    pub fn with_tempfail(mut self, name: &str) -> Self {
        self.tempfail.insert(name.to_ascii_lowercase());
        self
    }
}

#[async_trait]
impl Resolver for TestResolver {
    async fn resolve_txt(&self, name: &str) -> Result<TxtAnswer, DnsError> {
        let key = name.to_ascii_lowercase();
        if self.tempfail.contains(&key) {
            return Err(DnsError::ResolveFailed(format!(
                "failed to query DNS for {name}: simulated tempfail"
            )));
        }
        match self.records.get(&key) {
            Some(records) => Ok(TxtAnswer {
                records: records.clone(),
                nxdomain: false,
            }),
            None => Ok(TxtAnswer {
                records: vec![],
                nxdomain: true,
            }),
        }
    }
}

/// Construct the resolver stack for the service: the live resolver,
/// optionally fronted by a static key file.
pub fn build_resolver(
    test_keys: Option<&Path>,
    timeout: Duration,
) -> std::io::Result<Arc<dyn Resolver>> {
    let live = HickoryResolver::new()
        .map_err(|err| std::io::Error::other(format!("failed to create DNS resolver: {err}")))?
        .with_timeout(timeout);

    match test_keys {
        Some(path) => Ok(Arc::new(FileOverlay::load(path, Arc::new(live))?)),
        None => Ok(Arc::new(live)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_test_resolver() {
        let resolver = TestResolver::default()
            .with_txt("sel._domainkey.example.com", "v=DKIM1; p=abc".to_string())
            .with_tempfail("busted._domainkey.example.com");

        let answer = resolver
            .resolve_txt("sel._domainkey.example.com")
            .await
            .unwrap();
        assert_eq!(answer.records, vec!["v=DKIM1; p=abc".to_string()]);
        assert!(!answer.nxdomain);

        let answer = resolver
            .resolve_txt("missing._domainkey.example.com")
            .await
            .unwrap();
        assert!(answer.nxdomain);

        let err = resolver
            .resolve_txt("busted._domainkey.example.com")
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
