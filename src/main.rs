use std::sync::Arc;

use log::{error, info};
use tokio::sync::watch;

use perp_exchange::config::EngineConfig;
use perp_exchange::engine::engine::Engine;
use perp_exchange::persistence::create_pool_and_migrate;
use perp_exchange::store::PgStore;
use perp_exchange::stream::PgMessageLog;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    let pool = match create_pool_and_migrate(&config.database_url, config.pool_size).await {
        Ok(pool) => pool,
        Err(err) => {
            error!("database setup failed: {err}");
            std::process::exit(1);
        }
    };

    let store = Arc::new(PgStore::new(pool.clone()));
    let log = Arc::new(PgMessageLog::new(pool, config.stream_poll));

    let mut engine = Engine::new(store, log);
    if let Err(err) = engine.recover().await {
        error!("recovery failed: {err}");
        std::process::exit(1);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    engine.run(config.snapshot_interval, shutdown_rx).await;
    info!("engine stopped");
}
