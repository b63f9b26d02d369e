//! Application state wiring the runtime together.
//!
//! `AppState` pins the runner and trigger-plane components to the
//! concrete `AnyBackend` so axum handlers stay monomorphic.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use conductor_core::auth::OverrideManager;
use conductor_core::endpoint::EndpointRegistry;
use conductor_core::executor::{BoxStepExecutor, LocalStepExecutor};
use conductor_core::loader::WorkflowLoader;
use conductor_core::parser::YamlWorkflowParser;
use conductor_core::ratelimit::RateLimiterMap;
use conductor_core::runner::Runner;
use conductor_core::webhook::WebhookRouter;
use conductor_infra::backend::AnyBackend;
use conductor_infra::sqlite::{DatabasePool, SqliteBackend};
use conductor_types::config::{BackendKind, ConductorConfig};

/// Runner pinned to the runtime backend.
pub type ConcreteRunner = Runner<AnyBackend>;

/// Shared application state for all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConductorConfig>,
    pub backend: Arc<AnyBackend>,
    pub runner: Arc<ConcreteRunner>,
    pub loader: Arc<WorkflowLoader>,
    pub endpoints: Arc<EndpointRegistry>,
    pub webhooks: Arc<WebhookRouter>,
    pub overrides: Arc<OverrideManager>,
    /// Per-endpoint token buckets.
    pub endpoint_limits: Arc<RateLimiterMap>,
    /// Per-identity request buckets.
    pub request_limits: Arc<RateLimiterMap>,
    pub data_dir: PathBuf,
    pub instance_id: String,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Initialize state from configuration: open the backend, start the
    /// runner, seed the endpoint registry and webhook routes.
    pub async fn init(config: ConductorConfig, data_dir: PathBuf) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir).await?;

        let backend = match config.backend {
            BackendKind::Memory => {
                tracing::info!("using in-memory backend (no persistence)");
                AnyBackend::Memory(conductor_core::backend::memory::MemoryBackend::new())
            }
            BackendKind::Sqlite => {
                let url = conductor_infra::sqlite::pool::default_database_url(&data_dir);
                let pool = DatabasePool::new(&url).await?;
                AnyBackend::Sqlite(SqliteBackend::new(pool))
            }
        };
        let backend = Arc::new(backend);

        let executor = BoxStepExecutor::new(LocalStepExecutor::new(data_dir.clone()));
        let runner = Runner::start(
            Arc::clone(&backend),
            Some(executor),
            config.runner.clone(),
        );

        let loader = Arc::new(WorkflowLoader::new(
            data_dir.clone(),
            Arc::new(YamlWorkflowParser),
        ));

        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());

        Ok(Self {
            endpoints: Arc::new(EndpointRegistry::from_config(config.endpoints.clone())),
            webhooks: Arc::new(WebhookRouter::new(config.webhooks.clone())),
            overrides: Arc::new(OverrideManager::new()),
            endpoint_limits: Arc::new(RateLimiterMap::new()),
            request_limits: Arc::new(RateLimiterMap::new()),
            config: Arc::new(config),
            backend,
            runner,
            loader,
            data_dir,
            instance_id,
            started_at: Utc::now(),
        })
    }
}
