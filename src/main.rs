use dotenvy::dotenv;
use sameday::{
    config::{self, Settings, database},
    core::{
        clock::{BusinessClock, SystemClock},
        notify::LoggingPublisher,
        scheduler::{JobContext, Scheduler},
    },
    errors::Result,
};
use std::{env, path::Path, sync::Arc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

fn load_settings() -> Result<Settings> {
    let path = env::var("SAMEDAY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    if Path::new(&path).exists() {
        config::load_settings(&path).inspect(|_| info!(%path, "Loaded settings"))
    } else {
        warn!(%path, "Config file not found, using defaults");
        let settings = Settings::default();
        settings.validate()?;
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize tracing (as early as possible)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 2. Load .env file; env vars can also be set externally
    dotenv().ok();

    // 3. Load and validate business settings
    let settings = Arc::new(
        load_settings().inspect_err(|e| error!("Failed to load settings: {}", e))?,
    );

    // 4. Connect and make sure the schema exists
    let db = database::create_connection()
        .await
        .inspect_err(|e| error!("Failed to connect to database: {}", e))?;
    database::create_tables(&db)
        .await
        .inspect(|()| info!("Database initialized successfully."))
        .inspect_err(|e| error!("Failed to create tables: {}", e))?;

    // 5. Start background jobs on business-local time
    let clock = BusinessClock::new(Arc::new(SystemClock), settings.business.offset()?);
    info!(
        business_date = %clock.business_date(settings.business.day_close),
        "Starting scheduler"
    );
    let ctx = JobContext::new(db, clock, Arc::clone(&settings), Arc::new(LoggingPublisher));
    let scheduler = Scheduler::spawn(Arc::new(ctx));

    // 6. Run until Ctrl-C, then let in-flight jobs finish
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    scheduler.shutdown().await;
    Ok(())
}
