//! proxyguard-client: forward local WireGuard UDP to a remote HTTP server
//!
//! # Usage
//!
//! ```bash
//! proxyguard-client --to https://proxy.example.org/tunnel
//!
//! # With a fixed TCP source port and firewall mark (Linux)
//! proxyguard-client --to https://proxy.example.org --tcp-port 4433 --fwmark 51820
//! ```

use std::net::IpAddr;
use std::process::ExitCode;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use proxyguard::{Client, ClientConfig};

/// Command-line arguments
struct Args {
    /// UDP port to listen on for WireGuard traffic
    listen_port: u16,
    /// Local port the WireGuard process sends from
    forward_port: u16,
    /// TCP source port (0 = kernel-chosen)
    tcp_port: u16,
    /// Peer URL
    to: String,
    /// Firewall mark, -1 = disabled
    fwmark: i64,
    /// Pre-resolved peer IPs
    peer_ips: Vec<IpAddr>,
    /// Show version information
    version: bool,
}

impl Args {
    fn parse() -> Result<Self, String> {
        let mut listen_port = 51821u16;
        let mut forward_port = 51820u16;
        let mut tcp_port = 0u16;
        let mut to = String::new();
        let mut fwmark = -1i64;
        let mut peer_ips = Vec::new();
        let mut version = false;

        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--listen-port" => listen_port = parse_value(&arg, args.next())?,
                "--forward-port" => forward_port = parse_value(&arg, args.next())?,
                "--tcp-port" => tcp_port = parse_value(&arg, args.next())?,
                "--to" => {
                    to = args
                        .next()
                        .ok_or_else(|| format!("{arg} requires a value"))?;
                }
                "--fwmark" => fwmark = parse_value(&arg, args.next())?,
                "--peer-ips" => {
                    let csv = args
                        .next()
                        .ok_or_else(|| format!("{arg} requires a value"))?;
                    peer_ips = csv
                        .split(',')
                        .map(str::trim)
                        .filter(|part| !part.is_empty())
                        .map(|part| {
                            part.parse::<IpAddr>()
                                .map_err(|e| format!("invalid peer IP '{part}': {e}"))
                        })
                        .collect::<Result<_, _>>()?;
                }
                "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                other => return Err(format!("unknown argument: {other}")),
            }
        }

        Ok(Self {
            listen_port,
            forward_port,
            tcp_port,
            to,
            fwmark,
            peer_ips,
            version,
        })
    }
}

fn parse_value<T: std::str::FromStr>(flag: &str, value: Option<String>) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    let value = value.ok_or_else(|| format!("{flag} requires a value"))?;
    value
        .parse()
        .map_err(|e| format!("invalid value for {flag}: {e}"))
}

fn print_help() {
    println!(
        r"proxyguard-client v{}

Forward local WireGuard UDP traffic through an HTTP-upgraded TCP stream.

USAGE:
    proxyguard-client --to <URL> [OPTIONS]

OPTIONS:
    --to <URL>            The HTTP(S) URL of the server peer (required)
    --listen-port <PORT>  The PORT to listen on for UDP traffic [default: 51821]
    --forward-port <PORT> The PORT from which the UDP traffic originates [default: 51820]
    --tcp-port <PORT>     The TCP source port; 0 means kernel-chosen [default: 0]
    --fwmark <MARK>       [Linux only] fwmark/SO_MARK for the TCP socket; -1 disables [default: -1]
    --peer-ips <CSV>      Comma-separated server IPs, skipping DNS resolution
    --version             Show version information
    -h, --help            Print help information

ENVIRONMENT:
    RUST_LOG              Log filter (e.g. info, proxyguard=debug)",
        proxyguard::VERSION
    );
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Invalid invocation error: {e}");
            print_help();
            return ExitCode::FAILURE;
        }
    };

    if args.version {
        println!("proxyguard-client\nVersion: {}", proxyguard::VERSION);
        return ExitCode::SUCCESS;
    }
    if args.to.is_empty() {
        eprintln!("Invalid invocation error: Please supply the --to flag");
        print_help();
        return ExitCode::FAILURE;
    }
    let mut fwmark = args.fwmark;
    if fwmark != -1 && !cfg!(target_os = "linux") {
        eprintln!(
            "Invalid invocation warning: The --fwmark flag is a NO-OP when you're not using Linux. We will ignore it..."
        );
        fwmark = -1;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    let config = ClientConfig::new(args.to)
        .with_listen_port(args.listen_port)
        .with_tcp_source_port(args.tcp_port)
        .with_fwmark((fwmark > 0).then_some(fwmark as u32))
        .with_peer_ips(args.peer_ips);

    let client = match Client::new(config) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "error occurred when setting up the client");
            return ExitCode::FAILURE;
        }
    };

    match client.tunnel(&cancel, args.forward_port).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_cancelled() || cancel.is_cancelled() => {
            info!("exiting...");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "client exited with error");
            ExitCode::FAILURE
        }
    }
}
