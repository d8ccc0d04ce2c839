use crate::canonicalization;
use crate::header::TaggedHeader;
use crate::{ArcError, RawHeader};
use data_encoding::BASE64;
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    RsaSha256,
    Ed25519Sha256,
}

impl HashAlgo {
    pub fn algo_name(&self) -> &'static str {
        match self {
            Self::RsaSha256 => "rsa-sha256",
            Self::Ed25519Sha256 => "ed25519-sha256",
        }
    }
}

/// SHA-256 is the only hash permitted on output; both signature
/// algorithms feed it.
pub(crate) enum HashImpl {
    Sha256(Sha256),
    #[cfg(test)]
    Copy(Vec<u8>),
}

impl HashImpl {
    pub fn sha256() -> Self {
        Self::Sha256(Sha256::new())
    }

    #[cfg(test)]
    pub fn copy_data() -> Self {
        Self::Copy(vec![])
    }

    pub fn hash(&mut self, bytes: &[u8]) {
        match self {
            Self::Sha256(hasher) => hasher.update(bytes),
            #[cfg(test)]
            Self::Copy(data) => data.extend_from_slice(bytes),
        }
    }

    pub fn finalize(self) -> String {
        match self {
            Self::Sha256(hasher) => BASE64.encode(&hasher.finalize()),
            #[cfg(test)]
            Self::Copy(data) => String::from_utf8_lossy(&data).into(),
        }
    }

    pub fn finalize_bytes(self) -> Vec<u8> {
        match self {
            Self::Sha256(hasher) => hasher.finalize().to_vec(),
            #[cfg(test)]
            Self::Copy(data) => data,
        }
    }
}

/// Returns the base64 encoded hash of the canonical message body
/// https://datatracker.ietf.org/doc/html/rfc6376#section-3.7
pub fn compute_body_hash(canonicalization_type: canonicalization::Type, body: &[u8]) -> String {
    let mut hasher = HashImpl::sha256();
    canonicalization_type.canon_body(body, &mut hasher);
    hasher.finalize()
}

/// Select the headers named by an `h=` list from the message, proceeding
/// from the bottom of the header block upwards, with repeated names
/// selecting successively older instances.
pub(crate) fn select_headers<'a>(
    signed_headers: &str,
    headers: &'a [RawHeader],
) -> Vec<(&'a str, &'a str)> {
    let mut selected = vec![];

    let num_headers = headers.len();
    let mut last_index: HashMap<String, usize> = HashMap::new();

    'outer: for name in signed_headers.split(':').map(|h| h.trim()) {
        let index = *last_index
            .get(&name.to_ascii_lowercase())
            .unwrap_or(&num_headers);
        for (header_index, header) in headers.iter().enumerate().rev().skip(num_headers - index) {
            if header.name.eq_ignore_ascii_case(name) {
                selected.push((header.name.as_str(), header.value.as_str()));
                last_index.insert(name.to_ascii_lowercase(), header_index);
                continue 'outer;
            }
        }

        last_index.insert(name.to_ascii_lowercase(), 0);
    }

    selected
}

/// Compute the header hash for a DKIM-style signature: the canonical forms
/// of the headers listed in `h=`, followed by the signature header itself
/// with the `b=` value blanked and the trailing CRLF removed.
/// https://datatracker.ietf.org/doc/html/rfc6376#section-3.7
pub(crate) fn compute_headers_hash(
    canonicalization_type: canonicalization::Type,
    signature_header_name: &str,
    signature_header: &TaggedHeader,
    headers: &[RawHeader],
) -> Result<Vec<u8>, ArcError> {
    let signed_headers = signature_header.get_required_tag("h");

    let mut input = Vec::new();
    for (key, value) in select_headers(signed_headers, headers) {
        canonicalization_type.canon_header_into(key, value.as_bytes(), &mut input);
    }

    append_blanked_signature_header(
        canonicalization_type,
        signature_header_name,
        signature_header,
        &mut input,
    );
    tracing::trace!("headers to hash: {:?}", String::from_utf8_lossy(&input));

    let mut hasher = HashImpl::sha256();
    hasher.hash(&input);
    Ok(hasher.finalize_bytes())
}

/// Append the signature header itself, with the value of the `b=` tag
/// removed and no trailing CRLF, to a hash input buffer.
pub(crate) fn append_blanked_signature_header(
    canonicalization_type: canonicalization::Type,
    signature_header_name: &str,
    signature_header: &TaggedHeader,
    input: &mut Vec<u8>,
) {
    let value = match signature_header.get_raw_tag("b") {
        Some(sig) if !sig.is_empty() => signature_header.raw().replace(sig, ""),
        _ => signature_header.raw().to_string(),
    };

    let mut canonicalized = vec![];
    canonicalization_type.canon_header_into(
        signature_header_name,
        value.as_bytes(),
        &mut canonicalized,
    );

    // remove trailing "\r\n"
    canonicalized.truncate(canonicalized.len() - 2);

    input.extend_from_slice(&canonicalized);
}
