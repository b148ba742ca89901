use clap::Parser;
use flock_lib::config::ServerArgs;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    flock_lib::init_logging();
    let args = ServerArgs::parse();

    match flock_lib::run_server(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
