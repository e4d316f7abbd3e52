use std::process::ExitCode;

use clap::Parser;

use manga_worker::cli::{CliArgs, Command};
use manga_worker::config::WorkerConfig;
use manga_worker::startup::{self, StartupError};

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    dotenvy::dotenv().ok();
    startup::init_tracing();

    match run(args.command()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Worker failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command) -> Result<(), StartupError> {
    let config = WorkerConfig::from_env()?;
    tracing::info!(
        concurrency = config.concurrency,
        timeout = ?config.worker_timeout,
        "Loaded worker configuration",
    );
    let pool = startup::connect(&config).await?;

    match command {
        Command::Run => startup::run_worker(&config, pool).await,
        Command::Submit { file } => {
            let request = startup::submit_file(&config, pool, &file).await?;
            tracing::info!(request_id = %request.id, "Submitted");
            println!("{}", request.id);
        }
    }
    Ok(())
}
