//! toolbridge — command-line MCP tool client.
//!
//! ```bash
//! toolbridge -c mcp-servers.json tools list
//! toolbridge tools call store_value --param key=a --param value=b
//! ```

use std::process::ExitCode;

use clap::Parser;

use toolbridge::cli::{self, Cli};
use toolbridge::logging::init_tracing;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(&cli.log_options()) {
        eprintln!("error: {e:#}");
        return ExitCode::from(1);
    }

    match cli::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!(error = ?e, "command failed");
            eprintln!("error: {e:#}");
            ExitCode::from(cli::exit_code(&e))
        }
    }
}
