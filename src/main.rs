// src/main.rs

use exprun::{cli, logging, run, RunStatus};

#[tokio::main]
async fn main() {
    match run_main().await {
        Ok(RunStatus::Completed) => {}
        Ok(RunStatus::Stopped) => std::process::exit(1),
        Err(err) => {
            eprintln!("exprun error: {err:?}");
            std::process::exit(1);
        }
    }
}

async fn run_main() -> anyhow::Result<RunStatus> {
    let args = cli::parse();
    logging::init_logging(args.log_level, "logs")?;
    run(args).await
}
