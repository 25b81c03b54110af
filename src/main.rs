use std::sync::Arc;

use freight_gateway::config::Config;
use freight_gateway::db::Store;
use freight_gateway::gateway::Gateway;
use freight_gateway::handlers;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // init tracing
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug")),
        )
        .init();

    // Install crypto provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| "Failed to install rustls crypto provider")?;

    let config_path =
        std::env::var("GATEWAY_CONFIG").unwrap_or_else(|_| "config/gateway.toml".to_string());
    let mut cfg = Config::load_or_default(&config_path)?;
    cfg.apply_env();
    let secrets = cfg.secrets()?;

    let store = Arc::new(Store::open(&cfg.database.path)?);
    let (invoices, contracts, usage) = store.get_counts()?;
    info!(
        path = %cfg.database.path,
        invoices, contracts, usage,
        "Database ready"
    );

    let gateway = Gateway::from_config(&cfg, &secrets, store)?;
    info!(
        require_auth = cfg.auth.require_authenticated_caller,
        daily_limit = cfg.quota.daily_limit,
        burst_limit = cfg.quota.burst_limit,
        "Gateway configured"
    );

    let app = handlers::router(Arc::new(gateway), cfg.server.max_upload_bytes);

    let addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Starting {} on http://{}", handlers::SERVICE_NAME, addr);
    axum::serve(listener, app).await?;

    Ok(())
}
