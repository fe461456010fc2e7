use std::sync::Arc;

use tokio::net::TcpListener;

use chatverse_server::auth::{self, JwtVerifier};
use chatverse_server::config::{generate_config_template, Config};
use chatverse_server::db::{self, SqliteStore};
use chatverse_server::routes;
use chatverse_server::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("chatverse_server=info"))
    };
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter())
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(filter())
            .init();
    }

    tracing::info!(
        "Chatverse server v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    // Initialize SQLite database
    let db = db::init_db(&config.data_dir)?;

    // Load or generate the JWT secret shared with the account service
    let jwt_secret = auth::jwt::load_or_generate_jwt_secret(&config.data_dir)?;

    let settings = config.settings();
    tracing::info!(
        store_timeout_ms = settings.store_timeout.as_millis() as u64,
        ping_interval_secs = settings.ping_interval.as_secs(),
        pong_timeout_secs = settings.pong_timeout.as_secs(),
        "Runtime settings"
    );

    let app_state = AppState::new(
        SqliteStore::new(db),
        Arc::new(JwtVerifier::new(&jwt_secret)),
        settings,
    );

    // Build router
    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
