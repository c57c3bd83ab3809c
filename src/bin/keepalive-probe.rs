//! keepalive-probe - measure how long a server keeps idle connections open.
//!
//! Sends HEAD requests on a single connection with growing pauses between
//! them and reports the longest pause the server tolerated.

use clap::Parser;
use keepalive::logging::{self, Format, Level, LogConfig};
use keepalive::{ClientConfig, PersistentHttpClient, ProxyTarget};
use std::process::ExitCode;
use std::time::Duration;
use tracing::error;

/// Probe a server's keep-alive idle timeout
#[derive(Parser, Debug)]
#[command(name = "keepalive-probe")]
#[command(version)]
#[command(about = "Measure how long a server keeps an idle HTTP connection open")]
struct Cli {
    /// URL to probe
    url: String,

    /// Longest pause to try, in seconds
    #[arg(short, long, default_value_t = 10)]
    max: u64,

    /// Connect timeout in seconds
    #[arg(long, default_value_t = 10)]
    open_timeout: u64,

    /// Read timeout in seconds
    #[arg(long, default_value_t = 30)]
    read_timeout: u64,

    /// Proxy URL
    #[arg(long, env = "HTTP_PROXY")]
    proxy: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON logs
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut log = LogConfig::from_env();
    if cli.verbose {
        log = log.with_level(Level::Debug);
    }
    if cli.json {
        log = log.with_format(Format::Json);
    }
    let _ = logging::init(&log);

    match run(cli).await {
        Ok(idle) => {
            println!("{}", idle.as_secs());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Probe failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> keepalive::Result<Duration> {
    let mut config = ClientConfig::builder()
        .name("keepalive-probe")
        .open_timeout(Duration::from_secs(cli.open_timeout))
        .read_timeout(Duration::from_secs(cli.read_timeout))
        .build();

    if let Some(proxy) = cli.proxy.as_deref().filter(|p| !p.is_empty()) {
        config.proxy = Some(ProxyTarget::parse(proxy)?);
    }

    let client = PersistentHttpClient::new(config);
    let idle = client.detect_idle_timeout(&cli.url, cli.max).await;
    client.shutdown();
    idle
}
