//! proxyguard-server: accept upgraded HTTP connections and relay them to a
//! WireGuard UDP endpoint
//!
//! # Usage
//!
//! ```bash
//! proxyguard-server --listen 0.0.0.0:443 --to 127.0.0.1:51820
//! ```

use std::process::ExitCode;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use proxyguard::Server;

/// Command-line arguments
struct Args {
    /// HOST:PORT to listen on for HTTP upgrade requests
    listen: String,
    /// HOST:PORT of the WireGuard destination
    to: String,
    /// Show version information
    version: bool,
}

impl Args {
    fn parse() -> Result<Self, String> {
        let mut listen = String::new();
        let mut to = String::new();
        let mut version = false;

        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--listen" => {
                    listen = args
                        .next()
                        .ok_or_else(|| format!("{arg} requires a value"))?;
                }
                "--to" => {
                    to = args
                        .next()
                        .ok_or_else(|| format!("{arg} requires a value"))?;
                }
                "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                other => return Err(format!("unknown argument: {other}")),
            }
        }

        Ok(Self { listen, to, version })
    }
}

fn print_help() {
    println!(
        r"proxyguard-server v{}

Accept HTTP-upgraded TCP streams and relay them to a WireGuard UDP endpoint.

USAGE:
    proxyguard-server --listen <HOST:PORT> --to <HOST:PORT>

OPTIONS:
    --listen <HOST:PORT>  The address to listen on for HTTP upgrade requests (required)
    --to <HOST:PORT>      The WireGuard destination for the converted UDP traffic (required)
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
        println!("proxyguard-server\nVersion: {}", proxyguard::VERSION);
        return ExitCode::SUCCESS;
    }
    if args.listen.is_empty() {
        eprintln!("Invalid invocation error: Please supply the --listen flag");
        print_help();
        return ExitCode::FAILURE;
    }
    if args.to.is_empty() {
        eprintln!("Invalid invocation error: Please supply the --to flag");
        print_help();
        return ExitCode::FAILURE;
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

    let server = match Server::bind(&args.listen, &args.to).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "error occurred when setting up the server");
            return ExitCode::FAILURE;
        }
    };

    match server.serve(cancel.clone()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_cancelled() => {
            info!("exiting...");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "server exited with error");
            ExitCode::FAILURE
        }
    }
}
