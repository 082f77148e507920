//! `kmvd` main executable: parses configuration, opens the store
//! worker pool, and serves the HTTP surface until `/exit` is hit.

use std::sync::Arc;

use kmvd::config::Config;
use kmvd::http::{self, AppState};
use kmvd::store::StorePool;
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    let config = Config::from_args();

    if config.version {
        println!("kmvd: v{}", VERSION);
        return;
    }

    if config.default_size == 0 {
        eprintln!("--default-size must be greater than 0");
        return;
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .init();

    tracing::info!(db = %config.db.display(), "opening store");
    std::fs::create_dir_all(&config.db).expect("create db directory");
    let pool = StorePool::open(
        &config.db,
        config.cache_capacity,
        config.default_size,
        config.nworkers,
        config.channel_capacity(),
    )
    .expect("open store");

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let state = AppState::new(pool.handle(), Arc::clone(&shutdown));
    let app = http::router(state);

    tracing::info!(addr = %config.http, "starting kmvd HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.http)
        .await
        .expect("bind HTTP address");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.notified().await;
            tracing::info!("shutting down");
        })
        .await
        .expect("serve HTTP");

    pool.shutdown();
}
