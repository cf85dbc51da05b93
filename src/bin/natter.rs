use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{error, info};

use natter::{init_logging, Config, Natter};

#[derive(Parser, Debug)]
#[command(
    name = "natter",
    version,
    about = "Expose a NAT-ed local port by discovering and holding its public mapping",
    override_usage = "natter [options] [host] <port>\n       natter -c config.json"
)]
struct Args {
    /// Path to JSON config file (enables config mode)
    #[arg(short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'v')]
    verbose: bool,

    /// Run a built-in HTTP test server on the open port (port mode only)
    #[arg(short = 't')]
    test_http: bool,

    /// [host] <port>
    #[arg(value_name = "HOST_PORT")]
    host_port: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let mut test_server = None;

    let cfg = if let Some(path) = &args.config {
        Config::load(path).context("failed to load config")?
    } else {
        let (host, port) = parse_host_port(&args.host_port)?;
        if args.test_http {
            test_server = Some((host.clone(), port));
        }
        Config::port_mode(&host, port)
    };

    let level = if args.verbose {
        "debug"
    } else if cfg.logging.level.is_empty() {
        "info"
    } else {
        cfg.logging.level.as_str()
    };
    init_logging(level, Some(cfg.logging.log_file.as_str()))
        .context("failed to init logging")?;

    if let Some((host, port)) = test_server {
        tokio::spawn(async move {
            if let Err(e) = http_test_server(&host, port).await {
                error!(error = %e, "HTTP test server error");
            }
        });
    }

    let natter = Natter::new(cfg).context("failed to create natter")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    info!("starting natter");
    natter.run(shutdown_rx).await;
    info!("exited natter");
    Ok(())
}

fn parse_host_port(args: &[String]) -> Result<(String, u16)> {
    let (host, port_arg) = match args {
        [port] => ("0.0.0.0".to_string(), port),
        [host, port] => (host.clone(), port),
        _ => bail!("usage: natter [options] [host] <port>"),
    };
    let port: u16 = port_arg
        .parse()
        .with_context(|| format!("invalid port: {:?}", port_arg))?;
    if port == 0 {
        bail!("invalid port: 0");
    }
    Ok((host, port))
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Trivial "it works" responder for checking the mapping from outside.
/// The listener comes from the reusable-bind factory so the STUN probe and
/// the keep-alive flow can keep sharing the same port.
async fn http_test_server(host: &str, port: u16) -> std::io::Result<()> {
    let addr = tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "unresolvable host"))?;
    let listener = natter::socket::tcp_listener(addr)?;
    info!(addr = %addr, "HTTP test server listening");
    loop {
        let (mut stream, _) = listener.accept().await?;
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let body = "<h1>It works!</h1><hr/>Natter";
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
        });
    }
}
