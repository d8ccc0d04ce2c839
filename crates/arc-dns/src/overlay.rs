use crate::{DnsError, Resolver, TxtAnswer};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Serves TXT records from a static file, falling back to the inner
/// resolver for anything the file does not mention.
///
/// The file holds one record per line: the record name, whitespace, and
/// the record data. A line beginning with whitespace continues the
/// previous record. Blank lines and lines starting with `#` are skipped.
///
/// ```text
/// sel._domainkey.example.com v=DKIM1; k=rsa; p=MIIB...
/// ```
///
/// The file is read once; changing it requires a restart.
pub struct FileOverlay {
    records: BTreeMap<String, String>,
    inner: Arc<dyn Resolver>,
}

impl FileOverlay {
    pub fn load(path: &Path, inner: Arc<dyn Resolver>) -> std::io::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(Self {
            records: parse_records(&data),
            inner,
        })
    }

    #[cfg(test)]
    pub(crate) fn from_str(data: &str, inner: Arc<dyn Resolver>) -> Self {
        Self {
            records: parse_records(data),
            inner,
        }
    }
}

fn parse_records(data: &str) -> BTreeMap<String, String> {
    let mut records = BTreeMap::new();
    let mut logical: Vec<String> = vec![];

    for line in data.lines() {
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // Continuation of the previous record
            if let Some(prev) = logical.last_mut() {
                prev.push_str(line.trim_start());
            }
            continue;
        }
        logical.push(line.to_string());
    }

    for line in logical {
        let Some((name, value)) = line.split_once(char::is_whitespace) else {
            tracing::warn!("ignoring malformed key record line: {line:?}");
            continue;
        };
        records.insert(name.to_ascii_lowercase(), value.trim_start().to_string());
    }

    records
}

#[async_trait]
impl Resolver for FileOverlay {
    async fn resolve_txt(&self, name: &str) -> Result<TxtAnswer, DnsError> {
        match self.records.get(&name.to_ascii_lowercase()) {
            Some(record) => Ok(TxtAnswer {
                records: vec![record.clone()],
                nxdomain: false,
            }),
            None => self.inner.resolve_txt(name).await,
        }
    }
}
