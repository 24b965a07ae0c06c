use crate::cli::ServeArgs;
use crate::infra::{AppState, ConfiguredSource};
use crate::routes::with_policy_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use loyalty_engine::config::AppConfig;
use loyalty_engine::error::AppError;
use loyalty_engine::policy::{PolicyEngine, PolicyRegistry};
use loyalty_engine::telemetry;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let source = Arc::new(ConfiguredSource::from_config(&config.engine)?);
    let source_label = source.describe();
    let registry = Arc::new(PolicyRegistry::new(
        source.clone(),
        config.engine.registry_settings(),
    ));
    if let ConfiguredSource::Catalog(catalog) = source.as_ref() {
        registry.follow_changes(catalog.subscribe());
    }

    let mut engine = PolicyEngine::new(registry);
    if let Some(deadline) = config.engine.evaluation_deadline {
        engine = engine.with_deadline(deadline);
    }

    let app = with_policy_routes(Arc::new(engine))
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(
        ?config.environment,
        %addr,
        source = %source_label,
        cache_ttl_secs = config.engine.cache_ttl.as_secs(),
        "loyalty policy engine ready"
    );

    axum::serve(listener, app).await?;
    Ok(())
}
