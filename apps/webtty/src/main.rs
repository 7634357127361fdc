use std::process::ExitCode;
use tracing::debug;
use webtty::telemetry::logging;
use webtty::terminal::{app, cli, error::CliError};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError::Usage(err)) => {
            let code = err.exit_code();
            let _ = err.print();
            ExitCode::from(u8::try_from(code).unwrap_or(2))
        }
        Err(err) => {
            eprintln!("Quitting with an unexpected error: \"{err}\"");
            ExitCode::from(err.exit_code())
        }
    }
}

async fn run() -> Result<(), CliError> {
    let cli = cli::parse_from(std::env::args_os())?;
    let log_config = cli.logging.to_config();
    logging::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");
    app::run(cli).await
}
