use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use relay_gateway::config;
use relay_gateway::db::UsageStore;
use relay_gateway::error::AppResult;
use relay_gateway::server;
use relay_gateway::state::Gateway;
use relay_gateway::store::kv::{KvStore, MemoryKv};
use relay_gateway::store::repo::{AccountRepository, DirectoryRepository, MemoryRepo};
use relay_gateway::store::CacheEvents;

#[tokio::main]
async fn main() -> AppResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RELAY_GATEWAY_LOG")
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = config::load()?;

    let events = CacheEvents::new();
    let repo = Arc::new(MemoryRepo::new(events.clone()));
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let usage_log = Arc::new(UsageStore::open_default()?);

    let gateway = Gateway::new(
        settings,
        kv,
        Arc::clone(&repo) as Arc<dyn AccountRepository>,
        repo as Arc<dyn DirectoryRepository>,
        usage_log,
        events,
    );
    gateway.start_background_tasks();

    server::serve(gateway).await
}
