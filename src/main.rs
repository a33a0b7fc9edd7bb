// src/main.rs
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::ServiceExt;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use qsl_edge_gateway::config::{Config, StoreBackend};
use qsl_edge_gateway::push::SubscriberChannel;
use qsl_edge_gateway::routes::{self, AppState};
use qsl_edge_gateway::store::{Backends, MemoryStore, PostgresStore};
use qsl_edge_gateway::wechat::WechatChannel;

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;

    let backends = match config.store_backend {
        StoreBackend::Postgres => {
            let url = config.database_url.as_deref().unwrap_or_default();
            let store = PostgresStore::connect(url).await?;
            let purge = store.clone();
            tokio::spawn(async move { purge_worker(purge).await });
            Backends::postgres(store)
        }
        StoreBackend::Memory => {
            info!("using in-memory store; state is lost on restart");
            Backends::memory(Arc::new(MemoryStore::new()))
        }
    };

    let channel = WechatChannel::from_config(&config.wechat, config.outbound_timeout)?
        .map(|c| Arc::new(c) as Arc<dyn SubscriberChannel>);

    info!(
        signing = config.client_sign_key.is_some(),
        captcha = config.captcha_enabled(),
        rate_limit = config.rate_limit_enabled,
        wechat_subscribe = config.wechat.subscribe_enabled(),
        wechat_push = config.wechat.push_enabled(),
        "features"
    );

    let addr = config.bind_addr;
    let app = routes::app(Arc::new(AppState::new(config, backends, channel)));

    info!("gateway listening on {addr}");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        ServiceExt::<Request>::into_make_service_with_connect_info::<SocketAddr>(app),
    )
    .await?;
    Ok(())
}

async fn purge_worker(store: PostgresStore) {
    loop {
        tokio::time::sleep(PURGE_INTERVAL).await;
        match store.purge_expired().await {
            Ok(0) => {}
            Ok(n) => info!("purged {n} expired nonce/rate rows"),
            Err(e) => error!("purge tick error: {e}"),
        }
    }
}
