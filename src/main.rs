//! Settlement service entry point
//!
//! ```text
//! settlement api     # POST /transfer, GET /transactions/{id}, GET /isalive
//! settlement worker  # transfer channel → ledger
//! settlement logger  # audit channel → transaction records
//! settlement all     # everything in one process
//! ```

use clap::Parser;
use transfer_settlement::app::{self, Role};
use transfer_settlement::config::AppConfig;
use transfer_settlement::logging::init_logging;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Process role to run
    #[arg(value_enum)]
    role: Role,

    /// Config environment, loads config/{env}.yaml
    #[arg(short, long, default_value = "dev")]
    env: String,

    /// HTTP port, overrides config and HTTP_PORT
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(&cli.env)?;
    if let Some(port) = cli.port {
        config.http.port = port;
    }

    let _log_guard = init_logging(&config, cli.role.as_str());
    tracing::info!(role = %cli.role, env = %cli.env, "Starting settlement service");

    app::run(cli.role, config).await
}
