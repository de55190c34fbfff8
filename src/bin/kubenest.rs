//! kubenest binary entry point.

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match kubenest::cli::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "command failed");
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}
