use crate::canonicalization::{canonicalize_set_member, Type};
use crate::hash::{append_blanked_signature_header, compute_body_hash, compute_headers_hash, HashImpl};
use crate::header::{ArcMessageSignatureHeader, ArcSealHeader, TaggedHeaderBuilder};
use crate::public_key::retrieve_public_key;
use crate::{parser, verify_signature, ArcError, ArcPrivateKey, RawHeader};
use arc_dns::Resolver;
use data_encoding::BASE64;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

/// <https://datatracker.ietf.org/doc/html/rfc8617#section-4.2.1>
pub const MAX_INSTANCE: u8 = 50;

pub const ARC_SEAL_HEADER_NAME: &str = "ARC-Seal";
pub const ARC_MESSAGE_SIGNATURE_HEADER_NAME: &str = "ARC-Message-Signature";
pub const ARC_AUTHENTICATION_RESULTS_HEADER_NAME: &str = "ARC-Authentication-Results";

/// The headers covered by a new ARC-Message-Signature. From is listed
/// twice to oversign it.
pub const SEALED_HEADERS: &[&str] = &[
    "from",
    "subject",
    "to",
    "date",
    "message-id",
    "content-type",
    "from",
];

/// Chain validation state, which doubles as the value vocabulary of the
/// `cv=` tag: `none` for a chain with no prior sets, otherwise the outcome
/// of validating the existing chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    None,
    Pass,
    Fail,
}

impl ChainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pass => "pass",
            Self::Fail => "fail",
        }
    }
}

impl std::fmt::Display for ChainStatus {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(self.as_str())
    }
}

impl FromStr for ChainStatus {
    type Err = ArcError;

    fn from_str(s: &str) -> Result<Self, ArcError> {
        match s {
            "none" => Ok(Self::None),
            "pass" => Ok(Self::Pass),
            "fail" => Ok(Self::Fail),
            other => Err(ArcError::InvalidChainStatus(other.to_string())),
        }
    }
}

/// One complete ARC set. Header content is referenced by index into the
/// session's header list rather than by pointer; the list outlives the
/// analysis and is freed as a unit at session teardown.
#[derive(Debug, Clone)]
struct ArcSet {
    instance: u8,
    seal: ArcSealHeader,
    sig: ArcMessageSignatureHeader,
    seal_idx: usize,
    sig_idx: usize,
    aar_idx: usize,
}

/// The outcome of validating the ARC chain carried by a message.
#[derive(Debug)]
pub struct ChainAnalysis {
    pub state: ChainStatus,
    /// N: the number of instances present (the highest parsed instance
    /// when the structure is broken).
    pub instance_count: u8,
    /// The highest instance below the first failure; N when the chain
    /// verifies.
    pub highest_valid: u8,
    /// Start of the longest suffix of AMS signatures that all verify;
    /// 0 when the whole chain verifies. Only meaningful for a passing
    /// chain.
    pub oldest_pass: u8,
    /// The inbound chain already carries a cv=fail seal. Such a chain is
    /// dead: it is reported as fail and never resealed.
    pub dead: bool,
    sets: Vec<ArcSet>,
}

impl ChainAnalysis {
    fn none() -> Self {
        Self {
            state: ChainStatus::None,
            instance_count: 0,
            highest_valid: 0,
            oldest_pass: 0,
            dead: false,
            sets: vec![],
        }
    }

    fn broken(instance_count: u8) -> Self {
        Self {
            state: ChainStatus::Fail,
            instance_count,
            highest_valid: 0,
            oldest_pass: 0,
            dead: false,
            sets: vec![],
        }
    }
}

/// Parse the leading `i=<n>;` of an ARC-Authentication-Results value.
fn aar_instance(value: &str) -> Result<u8, ArcError> {
    let rest = value.trim_start();
    let rest = rest.strip_prefix('i').ok_or(ArcError::InvalidInstance)?;
    let rest = rest.trim_start();
    let rest = rest.strip_prefix('=').ok_or(ArcError::InvalidInstance)?;
    let rest = rest.trim_start();

    let digits: &str = &rest[..rest
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(idx, _)| idx)
        .unwrap_or(rest.len())];
    let instance = digits.parse::<u8>().map_err(|_| ArcError::InvalidInstance)?;
    if instance == 0 || instance > MAX_INSTANCE {
        return Err(ArcError::InvalidInstance);
    }
    Ok(instance)
}

struct CollectOutcome {
    sets: Vec<ArcSet>,
    any: bool,
    highest: u8,
    issue: Option<ArcError>,
}

fn collect(headers: &[RawHeader]) -> CollectOutcome {
    let mut seals = BTreeMap::new();
    let mut sigs = BTreeMap::new();
    let mut aars = BTreeMap::new();

    let mut any = false;
    let mut highest = 0u8;
    let mut issues = vec![];

    for (idx, hdr) in headers.iter().enumerate() {
        if hdr.name.eq_ignore_ascii_case(ARC_SEAL_HEADER_NAME) {
            any = true;
            match ArcSealHeader::parse(&hdr.value) {
                Ok(seal) => {
                    let instance = seal.arc_instance().expect("validated by parse");
                    highest = highest.max(instance);
                    seals
                        .entry(instance)
                        .or_insert_with(Vec::new)
                        .push((idx, seal));
                }
                Err(err) => issues.push(err),
            }
        } else if hdr.name.eq_ignore_ascii_case(ARC_MESSAGE_SIGNATURE_HEADER_NAME) {
            any = true;
            match ArcMessageSignatureHeader::parse(&hdr.value) {
                Ok(sig) => {
                    let instance = sig.arc_instance().expect("validated by parse");
                    highest = highest.max(instance);
                    sigs.entry(instance)
                        .or_insert_with(Vec::new)
                        .push((idx, sig));
                }
                Err(err) => issues.push(err),
            }
        } else if hdr
            .name
            .eq_ignore_ascii_case(ARC_AUTHENTICATION_RESULTS_HEADER_NAME)
        {
            any = true;
            match aar_instance(&hdr.value) {
                Ok(instance) => {
                    highest = highest.max(instance);
                    aars.entry(instance).or_insert_with(Vec::new).push(idx);
                }
                Err(err) => issues.push(err),
            }
        }
    }

    let mut sets = vec![];
    for instance in 1..=MAX_INSTANCE {
        match (
            seals.get(&instance),
            sigs.get(&instance),
            aars.get(&instance),
        ) {
            (Some(seal), Some(sig), Some(aar)) => {
                if seal.len() > 1 || sig.len() > 1 || aar.len() > 1 {
                    issues.push(ArcError::DuplicateInstance(instance));
                    continue;
                }

                sets.push(ArcSet {
                    instance,
                    seal: seal[0].1.clone(),
                    sig: sig[0].1.clone(),
                    seal_idx: seal[0].0,
                    sig_idx: sig[0].0,
                    aar_idx: aar[0],
                });
            }
            (None, None, None) => {
                // Not an error unless there are gaps; checked below
            }
            _ => {
                // One or more members of the set are missing
                issues.push(ArcError::MissingInstance(instance));
            }
        }
    }

    // Ensure that the instances are contiguous from 1
    for (pos, set) in sets.iter().enumerate() {
        if set.instance != (pos + 1) as u8 {
            issues.push(ArcError::MissingInstance((pos + 1) as u8));
            break;
        }
    }

    let issue = issues.into_iter().next();
    if issue.is_some() {
        sets.clear();
    }

    CollectOutcome {
        sets,
        any,
        highest,
        issue,
    }
}

async fn verify_ams(
    set: &ArcSet,
    headers: &[RawHeader],
    body: &[u8],
    resolver: &dyn Resolver,
) -> Result<(), ArcError> {
    let public_key = retrieve_public_key(
        resolver,
        set.sig.get_required_tag("d"),
        set.sig.get_required_tag("s"),
    )
    .await?;

    let hash_algo = parser::parse_hash_algo(set.sig.get_required_tag("a"))?;
    let (header_canon, body_canon) = parser::parse_canonicalization(set.sig.get_tag("c"))?;

    let computed_body_hash = compute_body_hash(body_canon, body);
    if set.sig.get_required_tag("bh") != computed_body_hash {
        return Err(ArcError::BodyHashDidNotVerify);
    }

    let header_hash = compute_headers_hash(
        header_canon,
        ARC_MESSAGE_SIGNATURE_HEADER_NAME,
        &set.sig,
        headers,
    )?;

    let signature = BASE64
        .decode(set.sig.get_required_tag("b").as_bytes())
        .map_err(|err| {
            ArcError::SignatureSyntaxError(format!("failed to decode signature: {}", err))
        })?;

    if !verify_signature(hash_algo, &header_hash, &signature, &public_key)? {
        return Err(ArcError::SignatureDidNotVerify);
    }
    Ok(())
}

/// Compute the input over which AS[i] is signed: the prior seals, then
/// AAR[1..i], then AMS[1..i], then AS[i] itself with b= blanked.
fn seal_scope(sets: &[ArcSet], pos: usize, headers: &[RawHeader]) -> Vec<u8> {
    let mut input = Vec::new();
    for prior in &sets[..pos] {
        canonicalize_set_member(
            ARC_SEAL_HEADER_NAME,
            headers[prior.seal_idx].value.as_bytes(),
            &mut input,
        );
    }
    for set in &sets[..=pos] {
        canonicalize_set_member(
            ARC_AUTHENTICATION_RESULTS_HEADER_NAME,
            headers[set.aar_idx].value.as_bytes(),
            &mut input,
        );
    }
    for set in &sets[..=pos] {
        canonicalize_set_member(
            ARC_MESSAGE_SIGNATURE_HEADER_NAME,
            headers[set.sig_idx].value.as_bytes(),
            &mut input,
        );
    }
    append_blanked_signature_header(
        Type::Relaxed,
        ARC_SEAL_HEADER_NAME,
        &sets[pos].seal,
        &mut input,
    );
    input
}

async fn verify_seal(
    sets: &[ArcSet],
    pos: usize,
    headers: &[RawHeader],
    resolver: &dyn Resolver,
) -> Result<(), ArcError> {
    let set = &sets[pos];
    let public_key = retrieve_public_key(
        resolver,
        set.seal.get_required_tag("d"),
        set.seal.get_required_tag("s"),
    )
    .await?;
    let hash_algo = parser::parse_hash_algo(set.seal.get_required_tag("a"))?;

    let input = seal_scope(sets, pos, headers);
    let mut hasher = HashImpl::sha256();
    hasher.hash(&input);
    let header_hash = hasher.finalize_bytes();

    let signature = BASE64
        .decode(set.seal.get_required_tag("b").as_bytes())
        .map_err(|err| {
            ArcError::SignatureSyntaxError(format!("failed to decode signature: {}", err))
        })?;

    if !verify_signature(hash_algo, &header_hash, &signature, &public_key)? {
        return Err(ArcError::SignatureDidNotVerify);
    }
    Ok(())
}

/// Validate the ARC chain carried by the message per RFC8617 section 5.2.
pub async fn analyze(
    headers: &[RawHeader],
    body: &[u8],
    resolver: &dyn Resolver,
) -> ChainAnalysis {
    let outcome = collect(headers);
    if !outcome.any {
        return ChainAnalysis::none();
    }
    if let Some(issue) = outcome.issue {
        tracing::debug!("chain structure invalid: {issue}");
        return ChainAnalysis::broken(outcome.highest);
    }
    if outcome.sets.is_empty() {
        // ARC headers were present but none parsed into a set
        return ChainAnalysis::broken(outcome.highest);
    }

    let sets = outcome.sets;
    let n = sets.len() as u8;

    let mut state = ChainStatus::Pass;
    let mut highest_valid = n;
    let mut dead = false;

    // cv transition rules: the first seal asserts cv=none, every
    // subsequent one cv=pass. An explicit cv=fail kills the chain.
    for set in &sets {
        let cv = set.seal.chain_status().expect("validated by parse");
        let expected = if set.instance == 1 {
            ChainStatus::None
        } else {
            ChainStatus::Pass
        };
        if cv == ChainStatus::Fail {
            tracing::debug!("chain carries cv=fail at instance {}", set.instance);
            dead = true;
            state = ChainStatus::Fail;
            highest_valid = set.instance - 1;
            break;
        }
        if cv != expected {
            tracing::debug!(
                "unexpected cv={} at instance {}",
                cv,
                set.instance
            );
            state = ChainStatus::Fail;
            highest_valid = set.instance - 1;
            break;
        }
    }

    let mut ams_ok = vec![false; n as usize];
    if state == ChainStatus::Pass {
        for (pos, set) in sets.iter().enumerate() {
            match verify_ams(set, headers, body, resolver).await {
                Ok(()) => ams_ok[pos] = true,
                Err(err) => {
                    tracing::debug!("AMS instance {} did not verify: {err}", set.instance);
                }
            }
        }

        // Older message signatures may legitimately be broken by
        // intermediaries; the most recent one must verify.
        if !ams_ok[n as usize - 1] {
            state = ChainStatus::Fail;
            highest_valid = n - 1;
        }
    }

    if state == ChainStatus::Pass {
        for pos in 0..sets.len() {
            if let Err(err) = verify_seal(&sets, pos, headers, resolver).await {
                tracing::debug!(
                    "seal instance {} did not verify: {err}",
                    sets[pos].instance
                );
                state = ChainStatus::Fail;
                highest_valid = sets[pos].instance - 1;
                break;
            }
        }
    }

    let oldest_pass = if state == ChainStatus::Pass {
        let mut start = n;
        for i in (1..=n).rev() {
            if ams_ok[i as usize - 1] {
                start = i;
            } else {
                break;
            }
        }
        if start == 1 {
            0
        } else {
            start
        }
    } else {
        0
    };

    ChainAnalysis {
        state,
        instance_count: n,
        highest_valid,
        oldest_pass,
        dead,
        sets,
    }
}

/// The three header values of a freshly produced ARC set, folded and
/// ready for insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct ArcSealSet {
    pub seal: String,
    pub sig: String,
    pub aar: String,
}

#[derive(Clone)]
pub struct SealerBuilder {
    domain: Option<String>,
    selector: Option<String>,
    private_key: Option<Arc<ArcPrivateKey>>,
    signed_headers: Vec<String>,
    timestamp: Option<i64>,
}

impl SealerBuilder {
    pub fn new() -> Self {
        Self {
            domain: None,
            selector: None,
            private_key: None,
            signed_headers: SEALED_HEADERS.iter().map(|h| h.to_string()).collect(),
            timestamp: None,
        }
    }

    /// The d= of the produced set
    pub fn with_domain(mut self, value: impl Into<String>) -> Self {
        self.domain = Some(value.into());
        self
    }

    /// The s= of the produced set
    pub fn with_selector(mut self, value: impl Into<String>) -> Self {
        self.selector = Some(value.into());
        self
    }

    pub fn with_private_key(mut self, key: Arc<ArcPrivateKey>) -> Self {
        self.private_key = Some(key);
        self
    }

    /// Override the headers covered by the message signature.
    /// The From: header is required.
    pub fn with_signed_headers(
        mut self,
        headers: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self, ArcError> {
        let headers: Vec<String> = headers
            .into_iter()
            .map(|h| h.into().to_lowercase())
            .collect();

        if !headers.iter().any(|h| h == "from") {
            return Err(ArcError::BuilderError("missing From in signed headers"));
        }

        self.signed_headers = headers;
        Ok(self)
    }

    /// Freeze the t= value. Mostly used for testing
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn build(self) -> Result<Sealer, ArcError> {
        use ArcError::BuilderError;

        Ok(Sealer {
            domain: self.domain.ok_or(BuilderError("missing required domain"))?,
            selector: self
                .selector
                .ok_or(BuilderError("missing required selector"))?,
            private_key: self
                .private_key
                .ok_or(BuilderError("missing required private key"))?,
            signed_headers: self.signed_headers,
            timestamp: self.timestamp,
        })
    }
}

impl Default for SealerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Produces new ARC sets. Use the [SealerBuilder] to build an instance.
#[derive(Debug)]
pub struct Sealer {
    domain: String,
    selector: String,
    private_key: Arc<ArcPrivateKey>,
    signed_headers: Vec<String>,
    timestamp: Option<i64>,
}

impl Sealer {
    /// Produce the next ARC set for the message.
    ///
    /// `status` is the effective chain state being recorded, which may
    /// differ from `analysis.state` when an Authentication-Results
    /// override is in force. `aar_payload` is the content of the new
    /// ARC-Authentication-Results value, minus the instance prefix.
    ///
    /// Returns None when no set may be produced: the chain is dead, or
    /// the instance limit has been reached.
    pub fn seal(
        &self,
        headers: &[RawHeader],
        body: &[u8],
        analysis: &ChainAnalysis,
        status: ChainStatus,
        aar_payload: &str,
    ) -> Result<Option<ArcSealSet>, ArcError> {
        if analysis.dead {
            return Ok(None);
        }
        if analysis.instance_count >= MAX_INSTANCE {
            return Ok(None);
        }
        let next = analysis.instance_count + 1;

        let cv = match status {
            ChainStatus::Fail => ChainStatus::Fail,
            _ if next == 1 => ChainStatus::None,
            _ => ChainStatus::Pass,
        };

        let timestamp = self
            .timestamp
            .unwrap_or_else(|| chrono::Utc::now().timestamp());
        let algo = self.private_key.hash_algo();
        let canon = Type::Relaxed;

        // ARC-Message-Signature, in two passes: hash with b= empty,
        // then fill in the signature.
        let body_hash = compute_body_hash(canon, body);
        let sig_builder = TaggedHeaderBuilder::new()
            .add_tag("i", &next.to_string())
            .add_tag("a", algo.algo_name())
            .add_tag(
                "c",
                &format!("{}/{}", canon.canon_name(), canon.canon_name()),
            )
            .add_tag("d", &self.domain)
            .add_tag("s", &self.selector)
            .set_time(timestamp)
            .add_tag("h", &self.signed_headers.join(":"))
            .add_tag("bh", &body_hash);

        let blank_sig = sig_builder.clone().add_tag("b", "").build();
        let header_hash = compute_headers_hash(
            canon,
            ARC_MESSAGE_SIGNATURE_HEADER_NAME,
            &blank_sig,
            headers,
        )?;
        let signature = self.private_key.sign(&header_hash)?;
        let sig_value = sig_builder
            .add_tag("b", &BASE64.encode(&signature))
            .build()
            .raw()
            .to_string();

        let aar_value = format!("i={next}; {aar_payload}");

        // ARC-Seal. A failed chain is sealed over this set alone; an
        // intact chain is sealed over the whole of it.
        let seal_builder = TaggedHeaderBuilder::new()
            .add_tag("i", &next.to_string())
            .add_tag("a", algo.algo_name())
            .add_tag("cv", cv.as_str())
            .add_tag("d", &self.domain)
            .add_tag("s", &self.selector)
            .set_time(timestamp);
        let blank_seal = seal_builder.clone().add_tag("b", "").build();

        let mut input = Vec::new();
        if cv != ChainStatus::Fail {
            for set in &analysis.sets {
                canonicalize_set_member(
                    ARC_SEAL_HEADER_NAME,
                    headers[set.seal_idx].value.as_bytes(),
                    &mut input,
                );
            }
            for set in &analysis.sets {
                canonicalize_set_member(
                    ARC_AUTHENTICATION_RESULTS_HEADER_NAME,
                    headers[set.aar_idx].value.as_bytes(),
                    &mut input,
                );
            }
            canonicalize_set_member(
                ARC_AUTHENTICATION_RESULTS_HEADER_NAME,
                aar_value.as_bytes(),
                &mut input,
            );
            for set in &analysis.sets {
                canonicalize_set_member(
                    ARC_MESSAGE_SIGNATURE_HEADER_NAME,
                    headers[set.sig_idx].value.as_bytes(),
                    &mut input,
                );
            }
            canonicalize_set_member(
                ARC_MESSAGE_SIGNATURE_HEADER_NAME,
                sig_value.as_bytes(),
                &mut input,
            );
        } else {
            canonicalize_set_member(
                ARC_AUTHENTICATION_RESULTS_HEADER_NAME,
                aar_value.as_bytes(),
                &mut input,
            );
            canonicalize_set_member(
                ARC_MESSAGE_SIGNATURE_HEADER_NAME,
                sig_value.as_bytes(),
                &mut input,
            );
        }
        append_blanked_signature_header(Type::Relaxed, ARC_SEAL_HEADER_NAME, &blank_seal, &mut input);

        let mut hasher = HashImpl::sha256();
        hasher.hash(&input);
        let seal_hash = hasher.finalize_bytes();
        let seal_signature = self.private_key.sign(&seal_hash)?;
        let seal_value = seal_builder
            .add_tag("b", &BASE64.encode(&seal_signature))
            .build()
            .raw()
            .to_string();

        Ok(Some(ArcSealSet {
            seal: seal_value,
            sig: sig_value,
            aar: aar_value,
        }))
    }
}
