use anyhow::Result;
use contract_indexer::api::http::ApiState;
use contract_indexer::api::stream::StreamState;
use contract_indexer::api::{http, stream};
use contract_indexer::metrics::init_metrics;
use contract_indexer::storage::{
    AnalysisRepository, FileRepository, MemoryRepository, StaticSubscriptions,
};
use contract_indexer::{IndexerConfig, IndexerService};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("🚀 Starting Contract Indexer Service");

    let config = IndexerConfig::from_env();
    if config.endpoints.is_empty() {
        error!("No RPC endpoints configured; set {{CHAIN}}_RPC_URL1..3");
        anyhow::bail!("no RPC endpoints configured");
    }
    for (chain, urls) in &config.endpoints {
        info!("📋 {}: {} endpoint(s) configured", chain, urls.len());
    }

    init_metrics(config.metrics_port)?;

    let repo: Arc<dyn AnalysisRepository> = match &config.data_dir {
        Some(dir) => {
            info!("💾 Using file repository at {:?}", dir);
            Arc::new(FileRepository::open(dir.clone()).await?)
        }
        None => {
            info!("💾 Using in-memory repository (set INDEXER_DATA_DIR to persist)");
            Arc::new(MemoryRepository::new())
        }
    };

    let subscriptions = Arc::new(StaticSubscriptions::new());
    let service = IndexerService::new(config, repo, subscriptions);

    // Sessions a previous process left behind must be failed before the
    // control surface takes requests.
    let recovered = service.recover_stale().await?;
    if recovered > 0 {
        info!("♻️ Recovered {} stale sessions", recovered);
    }

    let api_state = ApiState {
        manager: service.manager.clone(),
        health: service.health.clone(),
    };
    let http_bind = service.config.http_bind.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http::serve(&http_bind, api_state).await {
            error!("control API error: {}", e);
        }
    });

    let stream_state = StreamState {
        manager: service.manager.clone(),
        publisher: service.publisher.clone(),
    };
    let stream_bind = service.config.stream_bind.clone();
    let stream_handle = tokio::spawn(async move {
        if let Err(e) = stream::serve(&stream_bind, stream_state).await {
            error!("progress stream error: {}", e);
        }
    });

    info!("✅ Service started successfully");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Received shutdown signal");
        }
        _ = http_handle => {
            error!("control API exited unexpectedly");
        }
        _ = stream_handle => {
            error!("progress stream exited unexpectedly");
        }
    }

    service.pool.shutdown();
    info!("👋 Contract Indexer Service stopped");
    Ok(())
}
