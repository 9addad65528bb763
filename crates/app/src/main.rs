use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match tempra_app::run_from_env().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!("{error:#}");
            ExitCode::FAILURE
        }
    }
}
