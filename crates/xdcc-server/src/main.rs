mod api;
mod config;
mod irc_session;
mod logging;
mod registry;
mod supervisor;

use tracing::error;

use crate::config::Config;
use crate::supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let config = Config::from_env()?;
    let _logging_guard = logging::init(&config)?;

    if let Err(e) = run(config).await {
        error!(error = %e, "fatal startup error");
        std::process::exit(1);
    }

    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let supervisor = Supervisor::start(config).await?;
    supervisor.run().await
}
