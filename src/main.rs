use std::sync::Arc;

use clap::Parser;
use miette::Result;
use tracing_subscriber::{fmt, EnvFilter};

use pos_authz::authz::provider::StaticGrantProvider;
use pos_authz::{operations, settings, web};

#[derive(Parser, Debug)]
#[command(
    name = "pos-authz",
    version,
    about = "Module permission authorization service"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    let settings = settings::Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    let provider = Arc::new(StaticGrantProvider::from_dir(&settings.grants.dir)?);
    let pipeline = operations::build_pipeline(provider.clone())?;

    let state = web::AppState::new(pipeline, provider, &settings.identity.principal_header)?;
    web::serve(&settings, state).await?;
    Ok(())
}
