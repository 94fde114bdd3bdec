mod bootstrap;

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::task::LocalSet;

#[derive(Parser, Debug)]
#[command(name = "switchboardd")]
struct Args {
    #[arg(long)]
    config: Option<PathBuf>,
    /// Log at debug level regardless of the configured filter.
    #[arg(long)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let local = LocalSet::new();
    local
        .run_until(async {
            let args = Args::parse();
            let context = match bootstrap::bootstrap(&args).await {
                Ok(context) => context,
                Err(err) => {
                    eprintln!("[switchboardd] startup failed: {err}");
                    return ExitCode::FAILURE;
                }
            };
            bootstrap::run(context).await;
            ExitCode::SUCCESS
        })
        .await
}
