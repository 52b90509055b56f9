// main.rs - Entry point for the clearnode broker

mod app_sessions;
mod auth;
mod channels;
mod config;
mod crypto;
mod db;
mod dispatcher;
mod envelope;
mod error;
mod handlers;
mod ledger;
mod logger;
mod model;
mod service;
mod session_keys;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use alloy::providers::ProviderBuilder;
use alloy::signers::local::PrivateKeySigner;
use tracing::info;

use crate::channels::ContractOracle;
use crate::config::Config;
use crate::crypto::SigVerifier;
use crate::db::{PgStore, Store};
use crate::handlers::create_router;
use crate::service::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    logger::init_from_env()?;

    let config = Arc::new(Config::from_env()?);
    let port = config.port;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));
    store.init().await?;
    store.seed_assets(&config.assets).await?;

    let provider = Arc::new(
        ProviderBuilder::new()
            .disable_recommended_fillers()
            .connect_http(config.rpc_url.parse()?),
    );

    let broker_signer: PrivateKeySigner = config.broker_private_key.parse()?;
    info!("broker address: 0x{:x}", broker_signer.address());

    let mut assets = store.load_state().await?.assets;
    if assets.is_empty() {
        assets = config.assets.clone();
    }
    info!("clearing {} assets", assets.len());

    let oracle = Arc::new(ContractOracle::new(
        provider.clone(),
        config.custody_address,
        config.chain_id,
        Arc::new(assets.clone()),
    ));

    let state = AppState::new(
        config,
        store,
        assets,
        broker_signer,
        SigVerifier::new(provider),
        Some(oracle),
    );
    state.load().await?;
    state.spawn_background_tasks();

    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("clearnode listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            // Fatal log events flush and stop the broker.
            loop {
                if logger::fatal_flagged() {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        })
        .await?;

    Ok(())
}
