use std::{env, fs, process::ExitCode};

use log::{error, info};
use specs::TrainingSpec;
use tokio::signal;

use trainer::{Driver, Result, TrainErr, data::SyntheticSource};

const DEFAULT_CONFIG: &str = "./config.json";

async fn run() -> Result<()> {
    let path = env::var("TRAINER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG.to_string());
    let raw = fs::read_to_string(&path)?;
    let spec = TrainingSpec::from_json(&raw)
        .map_err(|e| TrainErr::Config(format!("invalid task configuration {path}: {e}")))?;

    info!(
        arch:? = spec.parameters.arch_name,
        steps = spec.parameters.steps;
        "loaded task configuration from {path}"
    );

    let mut driver = Driver::from_spec(&spec)?;
    let source = SyntheticSource::from_config(driver.config());

    let token = driver.cancellation_token();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("received SIGINT, stopping after the current step");
            token.cancel();
        }
    });

    let summary = driver.run(source).await?;
    info!(
        step = summary.last_step,
        updates = summary.updates,
        checkpoint:? = summary.checkpoint;
        "wrapping up"
    );

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
