mod server;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use vodhub_core::logging::{init_logging, LoggingConfig};

/// Media-source aggregation engine with an embedded playback proxy.
#[derive(Debug, Parser)]
#[command(name = "vodhub", version)]
struct Cli {
    /// Config document URL or local file path.
    #[arg(long, env = "VODHUB_CONFIG")]
    config: Option<String>,

    /// Remote index endpoint answering with the config URL.
    #[arg(long, env = "VODHUB_INDEX_URL")]
    index_url: Option<String>,

    /// Loopback port for the local proxy.
    #[arg(long, env = "VODHUB_PORT", default_value_t = vodhub_proxy::server::DEFAULT_PORT)]
    port: u16,

    /// Cache root (payloads, compressed tier, config snapshot).
    #[arg(long, env = "VODHUB_CACHE_DIR", default_value = "cache")]
    cache_dir: PathBuf,

    /// trace | debug | info | warn | error
    #[arg(long, env = "VODHUB_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

const EXIT_CONFIG: u8 = 1;
const EXIT_BIND: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&LoggingConfig {
        level: cli.log_level.clone(),
        ..LoggingConfig::default()
    }) {
        eprintln!("logging init failed: {e}");
        return ExitCode::from(EXIT_CONFIG);
    }

    match server::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(server::FatalError::Config(e)) => {
            tracing::error!(error = %e, "fatal config error");
            ExitCode::from(EXIT_CONFIG)
        }
        Err(server::FatalError::Bind(e)) => {
            tracing::error!(error = %e, "proxy port bind failed");
            ExitCode::from(EXIT_BIND)
        }
    }
}
