use anyhow::Context;
use clap::Parser;
use milter_proto::{parse_command, read_packet, write_reply, Command};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

mod cidrset;
mod config;
mod session;

use config::Config;
use session::{MilterSession, SessionParams};

/// Reads that stall longer than this tear the session down without
/// emitting any header inserts.
const SESSION_READ_TIMEOUT: Duration = Duration::from_secs(600);

/// ARC (RFC8617) signing and verification milter.
///
/// Attaches to an MTA over the milter protocol; for each message it
/// verifies the existing ARC chain, seals the message with a new ARC
/// set, or both.
#[derive(Debug, Parser)]
#[command(version)]
struct Opt {
    /// Configuration file to load
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: PathBuf,

    /// Milter socket to listen on: a path, unix:/path, local:/path
    /// or inet:port@host
    #[arg(short = 'p', long = "socket", value_name = "SOCKET")]
    socket: Option<String>,

    /// Remain in the foreground
    #[arg(short = 'f', long = "foreground")]
    foreground: bool,

    /// Raise the default log verbosity to debug
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Parse the configuration, report problems and exit
    #[arg(short = 'n', long = "check-config")]
    check_config: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum ListenSpec {
    Unix(PathBuf),
    Inet(String),
}

impl ListenSpec {
    fn parse(spec: &str) -> anyhow::Result<Self> {
        if let Some(path) = spec.strip_prefix("unix:").or_else(|| spec.strip_prefix("local:")) {
            return Ok(Self::Unix(path.into()));
        }
        if let Some(rest) = spec.strip_prefix("inet:") {
            let (port, host) = rest
                .split_once('@')
                .ok_or_else(|| anyhow::anyhow!("inet socket spec must be inet:port@host"))?;
            return Ok(Self::Inet(format!("{host}:{port}")));
        }
        Ok(Self::Unix(spec.into()))
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("ARCMILTD_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();
    init_logging(opts.verbose);

    let config = match Config::load(&opts.config) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            eprintln!("arcmiltd: {err}");
            std::process::exit(1);
        }
    };

    if opts.check_config {
        println!("configuration {} OK", opts.config.display());
        return Ok(());
    }

    let socket = opts
        .socket
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("a milter socket must be specified with -p"))?;
    let listen = ListenSpec::parse(socket)?;

    if !opts.foreground {
        nix::unistd::daemon(false, false).context("failed to daemonize")?;
    }

    // Build the runtime only after daemonizing so that the worker
    // threads belong to the final process
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(listen, config))
}

async fn serve(listen: ListenSpec, config: Arc<Config>) -> anyhow::Result<()> {
    let resolver = arc_dns::build_resolver(config.test_keys.as_deref(), config.dns_timeout)
        .context("failed to set up DNS resolution")?;
    let mut sigterm = signal(SignalKind::terminate())?;

    macro_rules! accept_loop {
        ($listener:expr) => {
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = sigterm.recv() => break,
                    accepted = $listener.accept() => {
                        let (stream, _peer) = accepted.context("accept failed")?;
                        let params = SessionParams {
                            config: config.clone(),
                            resolver: resolver.clone(),
                        };
                        tokio::spawn(async move {
                            if let Err(err) = run_session(stream, params).await {
                                tracing::error!("session ended with error: {err:#}");
                            }
                        });
                    }
                }
            }
        };
    }

    match listen {
        ListenSpec::Unix(path) => {
            // A previous instance may have left its socket behind
            let _ = std::fs::remove_file(&path);
            let listener = UnixListener::bind(&path)
                .with_context(|| format!("failed to bind {}", path.display()))?;
            tracing::info!("listening on {}", path.display());
            accept_loop!(listener);
            let _ = std::fs::remove_file(&path);
        }
        ListenSpec::Inet(addr) => {
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            tracing::info!("listening on {addr}");
            accept_loop!(listener);
        }
    }

    tracing::info!("shutting down");
    Ok(())
}

async fn run_session<S>(stream: S, params: SessionParams) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut session = MilterSession::new(params);

    loop {
        let packet = tokio::time::timeout(SESSION_READ_TIMEOUT, read_packet(&mut reader))
            .await
            .context("milter read timed out")??;
        let Some((code, payload)) = packet else {
            break;
        };

        let command = match parse_command(code, &payload) {
            Ok(command) => command,
            Err(err) => {
                // Protocol violation: close with no insertions
                tracing::debug!("protocol violation from MTA: {err}");
                break;
            }
        };
        let done = matches!(command, Command::Quit);

        for reply in session.handle(command).await {
            write_reply(&mut writer, &reply).await?;
        }

        if done {
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_spec() {
        assert_eq!(
            ListenSpec::parse("/run/arcmiltd.sock").unwrap(),
            ListenSpec::Unix("/run/arcmiltd.sock".into())
        );
        assert_eq!(
            ListenSpec::parse("unix:/run/arcmiltd.sock").unwrap(),
            ListenSpec::Unix("/run/arcmiltd.sock".into())
        );
        assert_eq!(
            ListenSpec::parse("local:/run/arcmiltd.sock").unwrap(),
            ListenSpec::Unix("/run/arcmiltd.sock".into())
        );
        assert_eq!(
            ListenSpec::parse("inet:8890@localhost").unwrap(),
            ListenSpec::Inet("localhost:8890".into())
        );
        assert!(ListenSpec::parse("inet:8890").is_err());
    }
}
