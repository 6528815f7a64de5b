use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use dunning_api::app::adapters::{LogNotifier, PlaceholderCsmPool, UnconfiguredGateway};
use dunning_infra::{
    DunningOrchestrator, DunningRepository, DunningService, InMemoryDunningRepository,
    OrchestratorConfig, PostgresDunningRepository, RetryingGateway,
};
use dunning_sequence::RetryPolicy;

#[tokio::main]
async fn main() {
    dunning_api::telemetry::init();

    let repository: Arc<dyn DunningRepository> = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(8)
                .connect(&url)
                .await
                .expect("failed to connect to DATABASE_URL");
            Arc::new(PostgresDunningRepository::new(pool))
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set; using in-memory store");
            Arc::new(InMemoryDunningRepository::new())
        }
    };

    let gateway = Arc::new(RetryingGateway::new(UnconfiguredGateway));
    let notifier = Arc::new(LogNotifier);
    let csm_pool = Arc::new(PlaceholderCsmPool);
    let policy = RetryPolicy::default();

    let service = DunningService::new(
        repository.clone(),
        gateway.clone(),
        notifier.clone(),
        csm_pool.clone(),
        policy.clone(),
    );

    let orchestrator = DunningOrchestrator::new(
        repository,
        gateway,
        notifier,
        csm_pool,
        OrchestratorConfig {
            policy,
            ..OrchestratorConfig::default()
        },
    );

    let tick_secs: u64 = std::env::var("TICK_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(300);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(tick_secs));
        loop {
            interval.tick().await;
            orchestrator.tick(Utc::now()).await;
        }
    });

    let app = dunning_api::app::build_app(service);

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {bind_addr}: {e}"));

    tracing::info!("listening on {}", listener.local_addr().unwrap());

    axum::serve(listener, app).await.unwrap();
}
