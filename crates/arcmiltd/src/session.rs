use crate::config::{Config, Mode};
use arc_dns::Resolver;
use arc_seal::{analyze, ChainAnalysis, ChainStatus, RawHeader};
use authres::{AuthenticationResult, AuthenticationResults, StatementCollector};
use milter_proto::{Command, Reply, SmfiActions, SmfiProtocol, MILTER_VERSION};
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

const AUTHENTICATION_RESULTS_HEADER_NAME: &str = "Authentication-Results";
const SOFTWARE_HEADER_NAME: &str = "ARC-Filter";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("sealing failed: {0}")]
    Seal(#[from] arc_seal::ArcError),
}

pub struct SessionParams {
    pub config: Arc<Config>,
    pub resolver: Arc<dyn Resolver>,
}

/// Where we are in the per-message milter exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
enum Phase {
    Negotiating,
    Connected,
    Helo,
    Envelope,
    Headers,
    Body,
}

/// Buffers for the message currently in flight. Dropped as a unit on
/// ABORT, QUIT or completion.
#[derive(Default)]
struct Transaction {
    mail_from: Option<String>,
    rcpt_to: Vec<String>,
    headers: Vec<RawHeader>,
    body: Vec<u8>,
}

/// One milter connection. Sessions are fully independent; the only
/// shared state is the read-only configuration and the resolver.
pub struct MilterSession {
    params: SessionParams,
    phase: Phase,
    /// remote matched PeerList: everything is accepted untouched
    peered: bool,
    /// SMFIP_HDR_LEADSPC was negotiated
    leadspc: bool,
    hostname: Option<String>,
    remote_ip: Option<IpAddr>,
    helo: Option<String>,
    txn: Option<Transaction>,
}

impl MilterSession {
    pub fn new(params: SessionParams) -> Self {
        Self {
            params,
            phase: Phase::Negotiating,
            peered: false,
            leadspc: false,
            hostname: None,
            remote_ip: None,
            helo: None,
            txn: None,
        }
    }

    /// Process one command from the MTA, producing the replies to send
    /// back. MACRO, ABORT and QUIT produce no reply.
    pub async fn handle(&mut self, command: Command) -> Vec<Reply> {
        match command {
            Command::OptNeg {
                version,
                actions,
                protocol,
            } => self.negotiate(version, actions, protocol),
            Command::Macro { .. } => vec![],
            Command::Quit => vec![],
            Command::QuitNewConnection => {
                self.reset_connection();
                vec![]
            }
            Command::Abort => {
                self.txn = None;
                if self.phase > Phase::Helo {
                    self.phase = Phase::Helo;
                }
                vec![]
            }
            _ if self.peered => vec![Reply::Accept],
            Command::Connect {
                hostname, address, ..
            } => self.connect(hostname, address),
            Command::Helo { hostname } => {
                tracing::debug!("HELO {hostname}");
                self.helo = Some(hostname);
                self.phase = Phase::Helo;
                vec![Reply::Continue]
            }
            Command::MailFrom { mut args } => {
                let mut txn = Transaction::default();
                if !args.is_empty() {
                    txn.mail_from = Some(args.remove(0));
                }
                self.txn = Some(txn);
                self.phase = Phase::Envelope;
                vec![Reply::Continue]
            }
            Command::RcptTo { mut args } => {
                if !args.is_empty() {
                    self.txn_mut().rcpt_to.push(args.remove(0));
                }
                vec![Reply::Continue]
            }
            Command::Data => vec![Reply::Continue],
            Command::Header { name, value } => {
                let value = if self.leadspc {
                    value.strip_prefix(' ').unwrap_or(&value).to_string()
                } else {
                    value
                };
                self.txn_mut().headers.push(RawHeader::new(name, value));
                self.phase = Phase::Headers;
                vec![Reply::Continue]
            }
            Command::EndOfHeaders => {
                self.phase = Phase::Body;
                vec![Reply::Continue]
            }
            Command::Body { chunk } => {
                self.txn_mut().body.extend_from_slice(&chunk);
                vec![Reply::Continue]
            }
            Command::EndOfBody => self.end_of_message().await,
            Command::Unknown { .. } => vec![Reply::Continue],
        }
    }

    fn txn_mut(&mut self) -> &mut Transaction {
        self.txn.get_or_insert_with(Transaction::default)
    }

    fn reset_connection(&mut self) {
        self.phase = Phase::Negotiating;
        self.peered = false;
        self.hostname = None;
        self.remote_ip = None;
        self.helo = None;
        self.txn = None;
    }

    fn negotiate(
        &mut self,
        version: u32,
        actions: SmfiActions,
        protocol: SmfiProtocol,
    ) -> Vec<Reply> {
        self.leadspc = protocol.contains(SmfiProtocol::HDR_LEADSPC);
        self.phase = Phase::Connected;

        vec![Reply::OptNeg {
            version: version.min(MILTER_VERSION),
            actions: (SmfiActions::ADD_HDRS | SmfiActions::CHG_HDRS) & actions,
            protocol: protocol & SmfiProtocol::HDR_LEADSPC,
        }]
    }

    fn connect(&mut self, hostname: String, address: Option<String>) -> Vec<Reply> {
        self.phase = Phase::Connected;
        self.remote_ip = address.as_deref().and_then(|a| a.parse().ok());
        self.hostname = Some(hostname);

        if let Some(ip) = self.remote_ip {
            if self.params.config.peer_list.contains(ip) {
                // The remote is a peer milter; hands off the message
                tracing::debug!("{ip} is a peer, accepting outright");
                self.peered = true;
                return vec![Reply::Accept];
            }
        }
        vec![Reply::Continue]
    }

    /// Mode for this connection: configured, or decided by whether the
    /// remote is one of ours.
    fn effective_mode(&self) -> Mode {
        match self.params.config.mode {
            Some(mode) => mode,
            None => match self.remote_ip {
                Some(ip) if self.params.config.internal_hosts.contains(ip) => Mode::SignVerify,
                _ => Mode::Verify,
            },
        }
    }

    async fn end_of_message(&mut self) -> Vec<Reply> {
        self.phase = Phase::Helo;
        let Some(txn) = self.txn.take() else {
            return vec![Reply::Accept];
        };

        match self.run_eom(&txn).await {
            Ok(replies) => replies,
            Err(err) => {
                // A failure during processing must not block the mail
                // flow: pass the message through untouched
                tracing::error!("end-of-message processing failed: {err:#}");
                vec![Reply::Accept]
            }
        }
    }

    async fn run_eom(&self, txn: &Transaction) -> Result<Vec<Reply>, SessionError> {
        let config = &self.params.config;
        let mode = self.effective_mode();
        tracing::debug!(
            "message from {} ({} rcpts) via {}/{:?}",
            txn.mail_from.as_deref().unwrap_or("<>"),
            txn.rcpt_to.len(),
            self.hostname.as_deref().unwrap_or("unknown"),
            self.helo,
        );

        let analysis = analyze(&txn.headers, &txn.body, self.params.resolver.as_ref()).await;
        tracing::debug!(
            "chain: state={} n={} oldest_pass={} dead={}",
            analysis.state,
            analysis.instance_count,
            analysis.oldest_pass,
            analysis.dead,
        );

        let mut collector = StatementCollector::new(&config.authserv_id);
        for header in &txn.headers {
            if header
                .name
                .eq_ignore_ascii_case(AUTHENTICATION_RESULTS_HEADER_NAME)
            {
                if let Err(err) = collector.ingest(&header.value) {
                    tracing::debug!("discarding malformed Authentication-Results: {err}");
                }
            }
        }

        let effective = self.effective_status(&analysis, &collector);

        let ar_value = self.build_auth_results(&analysis, effective).encode_value();

        let mut replies = vec![];
        let mut index = 0u32;

        if mode.verifies() {
            replies.push(self.insert(index, AUTHENTICATION_RESULTS_HEADER_NAME, ar_value.clone()));
            index += 1;
        }

        if mode.signs() {
            if let Some(sealer) = &config.sealer {
                let aar_payload = if effective == ChainStatus::Fail {
                    let mut failed = AuthenticationResults::new(&config.authserv_id);
                    failed.push(AuthenticationResult::new("arc", "fail"));
                    failed.encode_value()
                } else {
                    ar_value
                };

                if let Some(set) =
                    sealer.seal(&txn.headers, &txn.body, &analysis, effective, &aar_payload)?
                {
                    replies.push(self.insert(index, arc_seal::ARC_SEAL_HEADER_NAME, set.seal));
                    index += 1;
                    replies.push(self.insert(
                        index,
                        arc_seal::ARC_MESSAGE_SIGNATURE_HEADER_NAME,
                        set.sig,
                    ));
                    index += 1;
                    replies.push(self.insert(
                        index,
                        arc_seal::ARC_AUTHENTICATION_RESULTS_HEADER_NAME,
                        set.aar,
                    ));
                    index += 1;
                }
            }
        }

        if config.software_header {
            replies.push(self.insert(
                index,
                SOFTWARE_HEADER_NAME,
                format!("arcmiltd v{}", env!("CARGO_PKG_VERSION")),
            ));
        }

        replies.push(Reply::Accept);
        Ok(replies)
    }

    /// The chain state we record: the computed one, unless an upstream
    /// arc= statement is permitted to override it. A chain that
    /// validated fail stays failed no matter what upstream claims.
    fn effective_status(
        &self,
        analysis: &ChainAnalysis,
        collector: &StatementCollector,
    ) -> ChainStatus {
        let computed = analysis.state;
        if !self.params.config.permit_authentication_overrides {
            return computed;
        }
        let Some(statement) = collector.get("arc") else {
            return computed;
        };
        let Ok(claimed) = statement.result.parse::<ChainStatus>() else {
            tracing::debug!("ignoring arc={} override", statement.result);
            return computed;
        };
        if computed == ChainStatus::Fail {
            // dead chains are not resurrected
            return computed;
        }
        if claimed != computed {
            tracing::debug!("upstream arc={claimed} overrides computed arc={computed}");
            return claimed;
        }
        computed
    }

    fn build_auth_results(
        &self,
        analysis: &ChainAnalysis,
        effective: ChainStatus,
    ) -> AuthenticationResults {
        let config = &self.params.config;
        let mut results = AuthenticationResults::new(&config.authserv_id);

        let mut arc = AuthenticationResult::new("arc", effective.as_str());
        if effective == ChainStatus::Pass {
            arc = arc.prop("header.oldest-pass", analysis.oldest_pass.to_string());
        }
        if config.auth_res_ip {
            if let Some(ip) = self.remote_ip {
                arc = arc.prop("smtp.remote-ip", ip.to_string());
            }
        }
        results.push(arc);
        results
    }

    fn insert(&self, index: u32, name: &str, value: String) -> Reply {
        let value = if self.leadspc {
            format!(" {value}")
        } else {
            value
        };
        Reply::InsertHeader {
            index,
            name: name.to_string(),
            value,
        }
    }
}
