//! Service discovery against an in-process ensemble.
//!
//! Run with: cargo run -p discovery-demo [config.json]
//!
//! Two instances register themselves as ephemeral nodes under `/services`,
//! a watch cache follows the membership, and one instance leaves.

use std::time::Duration;

use futures::StreamExt;
use registry_center::{
    Registry, RegistryCenter, RegistryConfig, TreeCacheEvent,
    driver::{MemoryDriver, MemoryEnsemble},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SERVICES: &str = "/services";

fn load_config() -> Result<RegistryConfig, Box<dyn std::error::Error>> {
    match std::env::args().nth(1) {
        Some(file) => Ok(serde_json::from_str(&std::fs::read_to_string(file)?)?),
        None => Ok(RegistryConfig::new("127.0.0.1:2181", "demo").with_retry(100, 300, 3)),
    }
}

async fn instance(
    ensemble: &MemoryEnsemble,
    config: &RegistryConfig,
    name: &str,
    addr: &str,
) -> Result<RegistryCenter<MemoryDriver>, Box<dyn std::error::Error>> {
    let center = RegistryCenter::new(config.clone(), ensemble.driver());
    center.init().await?;
    center.ephemeral(&format!("{SERVICES}/{name}"), addr).await?;
    Ok(center)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = load_config()?;
    let ensemble = MemoryEnsemble::new();
    for server in config.server_list() {
        ensemble.serve(server);
    }

    let observer = RegistryCenter::new(config.clone(), ensemble.driver());
    observer.init().await?;
    observer.persist(SERVICES, "").await?;
    let cache = observer.add_cache_data(SERVICES).await?;
    let mut events = cache.events();

    let alpha = instance(&ensemble, &config, "alpha", "10.0.0.1:8080").await?;
    let beta = instance(&ensemble, &config, "beta", "10.0.0.2:8080").await?;
    tracing::info!(members = ?observer.get_children_keys(SERVICES).await?, "Registered");

    beta.destroy().await;

    loop {
        let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(1), events.next()).await
        else {
            tracing::warn!("No more cache events");
            break;
        };
        match event {
            TreeCacheEvent::NodeAdded(node) | TreeCacheEvent::NodeUpdated(node) => {
                tracing::info!(
                    path = %node.path,
                    data = node.data_str().unwrap_or_default(),
                    "Member up"
                );
            }
            TreeCacheEvent::NodeRemoved(node) => {
                tracing::info!(path = %node.path, "Member down");
                break;
            }
            TreeCacheEvent::Initialized => tracing::info!("Cache initialized"),
        }
    }

    if let Some(children) = cache.current_children(SERVICES) {
        tracing::info!(members = ?children.keys().collect::<Vec<_>>(), "Cached membership");
    }

    alpha.destroy().await;
    observer.destroy().await;
    Ok(())
}
