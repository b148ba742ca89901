use clap::Parser;
use flock_lib::config::ClientArgs;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    flock_lib::init_logging();
    let args = ClientArgs::parse();

    match flock_lib::run_client(args).await {
        Ok(summary) => {
            log::info!(
                "Transfer finished: {} table(s), {} batch(es)",
                summary.record_counts.len(),
                summary.batches
            );
            if summary.discrepancies.is_empty() {
                ExitCode::SUCCESS
            } else {
                log::warn!(
                    "{} table(s) did not verify; data was committed",
                    summary.discrepancies.len()
                );
                ExitCode::from(2)
            }
        }
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
