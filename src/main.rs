use clap::Parser;
use miette::Result;
use tracing_subscriber::{fmt, EnvFilter};

use trackgate::{settings, storage, web};

#[derive(Parser, Debug)]
#[command(
    name = "trackgate",
    version,
    about = "Authorizing gateway for experiment tracking servers"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "trackgate.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = settings::Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    // init storage (database)
    let db = storage::init(&settings.database).await?;

    // bootstrap admin
    storage::create_admin_user(
        &db,
        &settings.auth.admin_username,
        &settings.auth.admin_password,
    )
    .await?;

    // start gateway
    web::serve(settings, db).await?;
    Ok(())
}
