use clap::Parser as _;
use tracing::debug;

use treesync::application::{Application, ApplicationError, data::LogLevel};
use treesync::cli::Cli;

#[compio::main]
#[snafu::report]
async fn main() -> Result<(), ApplicationError> {
    let cli_args = Cli::parse();
    setup_tracing(cli_args.log_level);
    debug!("Parsed CLI arguments: {cli_args:?}");

    Application::run(cli_args).await?;

    Ok(())
}

fn setup_tracing(log_level: LogLevel) {
    if log_level == LogLevel::Silent {
        return;
    }
    tracing_subscriber::fmt()
        .with_max_level(log_level.to_level_filter())
        .without_time()
        .compact()
        .init();
}
