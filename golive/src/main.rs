use golive::config::AppConfig;
use golive::database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;

    // Initialize logging (the guard must outlive the process body)
    let _guard = golive::logging::init_logging(&config.log_dir)?;
    golive::panic_hook::install(&config.log_dir);

    // Initialize database
    let pool = database::init_pool(&config.database_url).await?;

    // Run migrations
    database::run_migrations(&pool).await?;

    tracing::info!("golive initialized successfully");

    Ok(())
}
