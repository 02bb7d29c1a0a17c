//! keel-sshd: hosts the keel SSH server on a TCP port.
//!
//! Each accepted connection runs one synchronous session on a blocking
//! worker. Host keys are PKCS#1/PKCS#8 PEM files; authorized keys live in
//! `<users>/<name>`, one OpenSSH public key line per user.

#![forbid(unsafe_code)]

mod executor;

use clap::Parser;
use executor::ProcessExecutor;
use keel_platform::{KeelError, KeelResult};
use keel_proto::ssh::{load_host_key, DirectoryKeyStore, HostKey, HostKeys, Server, ServerConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Minimal single-channel SSH-2 server
#[derive(Parser, Debug)]
#[command(name = "keel-sshd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:2222")]
    listen: SocketAddr,

    /// Host private key in PEM format (repeatable)
    #[arg(long = "host-key", required = true)]
    host_keys: Vec<PathBuf>,

    /// Directory holding one authorized key file per user
    #[arg(short, long)]
    users: PathBuf,

    /// Software part of the identification string
    #[arg(long)]
    identification: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt().with_env_filter(filter).with_target(false).init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "keel-sshd failed");
            ExitCode::FAILURE
        }
    }
}

fn build_server(args: &Args) -> KeelResult<Server> {
    let mut host_keys = HostKeys::new();
    for path in &args.host_keys {
        let pem = std::fs::read_to_string(path).map_err(|e| {
            KeelError::Config(format!("Cannot read host key {}: {}", path.display(), e))
        })?;
        let key = load_host_key(&pem)?;
        info!(path = %path.display(), algorithm = key.algorithm_name(), "host key loaded");
        host_keys.add(key);
    }

    if !args.users.is_dir() {
        return Err(KeelError::Config(format!(
            "Users directory {} does not exist",
            args.users.display()
        )));
    }

    let mut config = ServerConfig::default();
    if let Some(identification) = &args.identification {
        config.identification = identification.clone();
    }

    Server::new(
        config,
        host_keys,
        Arc::new(DirectoryKeyStore::new(&args.users)),
        Arc::new(ProcessExecutor),
    )
}

async fn run(args: Args) -> KeelResult<()> {
    let server = Arc::new(build_server(&args)?);
    let listener = TcpListener::bind(args.listen).await?;
    info!(addr = %args.listen, "listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => spawn_session(Arc::clone(&server), stream, peer),
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

/// Hands the connection to a blocking worker; sessions are synchronous.
fn spawn_session(server: Arc<Server>, stream: TcpStream, peer: SocketAddr) {
    info!(peer = %peer, "connection accepted");
    tokio::task::spawn_blocking(move || {
        let result = stream.into_std().and_then(|stream| {
            stream.set_nonblocking(false)?;
            let input = stream.try_clone()?;
            Ok((input, stream))
        });
        let outcome = match result {
            Ok((input, output)) => server.serve(input, output),
            Err(e) => Err(KeelError::Io(e)),
        };
        match outcome {
            Ok(()) => info!(peer = %peer, "session closed"),
            Err(e) => warn!(peer = %peer, error = %e, "session failed"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let args =
            Args::try_parse_from(["keel-sshd", "--host-key", "host.pem", "--users", "users"])
                .unwrap();
        assert_eq!(args.listen, "127.0.0.1:2222".parse::<SocketAddr>().unwrap());
        assert_eq!(args.host_keys, vec![PathBuf::from("host.pem")]);
        assert!(args.identification.is_none());
        assert!(!args.verbose);
    }

    #[test]
    fn test_repeated_host_keys() {
        let args = Args::try_parse_from([
            "keel-sshd",
            "--host-key",
            "a.pem",
            "--host-key",
            "b.pem",
            "-u",
            "users",
            "-l",
            "0.0.0.0:22",
            "-v",
        ])
        .unwrap();
        assert_eq!(args.host_keys.len(), 2);
        assert_eq!(args.listen.port(), 22);
        assert!(args.verbose);
    }

    #[test]
    fn test_host_key_required() {
        assert!(Args::try_parse_from(["keel-sshd", "--users", "users"]).is_err());
    }

    #[test]
    fn test_build_server_checks_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let missing = Args::try_parse_from([
            "keel-sshd",
            "--host-key",
            dir.path().join("absent.pem").to_str().unwrap(),
            "--users",
            dir.path().to_str().unwrap(),
        ])
        .unwrap();
        assert!(matches!(build_server(&missing), Err(KeelError::Config(_))));

        let key_path = dir.path().join("host.pem");
        std::fs::write(
            &key_path,
            include_str!("../../proto/tests/fixtures/host_rsa.pem"),
        )
        .unwrap();
        let args = Args::try_parse_from([
            "keel-sshd",
            "--host-key",
            key_path.to_str().unwrap(),
            "--users",
            dir.path().to_str().unwrap(),
            "--identification",
            "keel_test",
        ])
        .unwrap();
        let server = build_server(&args).unwrap();
        assert_eq!(server.config().identification, "keel_test");
    }
}
