//! Broker Server
//!
//! The thinnest possible edge contract over the job broker kernel: a single
//! JSON ingestion endpoint that hands the raw request body to
//! [`Dispatcher::dispatch_value`], which sniffs the `type` tag and routes
//! it through [`Dispatcher`]. This is deliberately not a full
//! websocket/SSE protocol implementation (callers bring their own transport);
//! it exists so the kernel in `broker` can be exercised over HTTP.
//!
//! ## Architecture
//!
//! ```text
//! HTTP POST /dispatch
//!   -> raw JSON body
//!   -> Dispatcher::dispatch_value (type-tag sniff, then InboundEnvelope)
//!   -> OutboundMessage (JSON)
//!
//! RecoverySupervisor runs as a background task against the same Store.
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use broker::{BrokerConfig, Dispatcher, EventFabric, JobBroker, MonitorRegistry, OutboundMessage, ProgressEngine, RecoverySupervisor, Store, WorkerRegistry};
use connectors::{Connector, SimulationConnector};
use core_config::{app_info, Environment, FromEnv};
use eyre::{Result, WrapErr};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{error, info, Level};

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
}

/// Accepts the body as a raw JSON value rather than `Json<InboundEnvelope>`:
/// the latter would have axum/serde reject an unrecognized `type` tag with a
/// generic 400 before `Dispatcher` ever saw the message, bypassing the
/// unknown-type contract in spec.md §4.7. `Dispatcher::dispatch_value` does
/// the tag sniffing and only then hands a recognized envelope to serde.
async fn dispatch_handler(State(state): State<AppState>, Json(value): Json<serde_json::Value>) -> Json<OutboundMessage> {
    Json(state.dispatcher.dispatch_value(value).await)
}

async fn health_handler(State(app_info): State<core_config::AppInfo>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy", "name": app_info.name, "version": app_info.version }))
}

async fn metrics_handler() -> String {
    broker::metrics::get_metrics_handle().map(|h| h.render()).unwrap_or_default()
}

fn app(dispatcher: Dispatcher, app_info: core_config::AppInfo) -> Router {
    let state = AppState { dispatcher: Arc::new(dispatcher) };

    Router::new()
        .route("/dispatch", post(dispatch_handler))
        .with_state(state)
        .merge(Router::new().route("/health", get(health_handler)).with_state(app_info))
        .route("/metrics", get(metrics_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

/// Run the broker server. Initializes logging/metrics, connects to the
/// configured store, starts the recovery supervisor in the background, and
/// serves the dispatch/health/metrics HTTP surface until a shutdown signal
/// arrives.
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);
    broker::metrics::init_metrics();

    let app_info = app_info!();
    info!(name = %app_info.name, version = %app_info.version, "starting broker server");

    let config = BrokerConfig::from_env().wrap_err("failed to load broker configuration")?;

    info!(url = %config.store.url, "connecting to store backend");
    let client = redis::Client::open(config.store.url.clone()).wrap_err("invalid store URL")?;
    let conn = client
        .get_connection_manager()
        .await
        .wrap_err("failed to connect to store backend")?;

    let store = Store::new(conn.clone(), config.store.prefix.clone());
    let events = EventFabric::new(conn, store.keys().clone(), config.events.clone());

    let broker = JobBroker::new(store.clone(), events.clone(), config.broker.clone());
    let registry = WorkerRegistry::new(store.clone(), events.clone());
    let progress = ProgressEngine::new(store.clone(), events.clone());
    let dispatcher = Dispatcher::new(broker, registry, progress, config.dispatcher.clone());

    let monitors = Arc::new(MonitorRegistry::new());
    let sim_connector: Arc<dyn Connector> = Arc::new(SimulationConnector::new("simulation", std::time::Duration::from_secs(5)));
    let mut connector_map: HashMap<String, Arc<dyn Connector>> = HashMap::new();
    connector_map.insert("simulation".to_string(), sim_connector);

    let supervisor = RecoverySupervisor::new(store, events, monitors, connector_map, config.recovery.clone(), config.monitor.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        supervisor.run(supervisor_shutdown).await;
    });

    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            error!(error = %e, "error waiting for shutdown signal");
        }
        let _ = shutdown_tx.send(true);
    });

    let port: u16 = std::env::var("BROKER_SERVER_PORT")
        .or_else(|_| std::env::var("PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .unwrap_or(8080);

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await.wrap_err_with(|| format!("failed to bind {addr}"))?;
    info!(%addr, "broker server listening");

    let router = app(dispatcher, app_info);
    let mut shutdown_rx_for_serve = shutdown_rx;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx_for_serve.changed().await;
        })
        .await
        .wrap_err("broker server failed")?;

    info!("broker server stopped");
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, initiating shutdown..."),
        _ = terminate => info!("received SIGTERM, initiating shutdown..."),
    }

    Ok(())
}
