/*
 * ChaosMeta Inject Operator - Operator Service
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Operator Service - Kubernetes Controller for the `Experiment` CRD
//!
//! This service:
//! - Watches `Experiment` resources and drives their inject and recover phases
//! - Periodically forces timed-out experiments into recovery
//! - Serves health and readiness endpoints

use axum::{extract::State, response::Json, routing::get, Router};
use inject_operator::tasks::cluster::{ClusterClient, KubeClusterClient};
use inject_operator::tasks::config::{ExecutorMode, OperatorConfig};
use inject_operator::tasks::executor::{AgentExecutor, DaemonExecutor, RemoteExecutor};
use inject_operator::tasks::{
    load_config, run_auto_recovery, run_experiment_controller, Context, Engine,
    DEFAULT_CONFIG_PATH,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone)]
struct AppState {
    config: Arc<OperatorConfig>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,inject_operator=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn build_remote_executor(
    cluster: Arc<dyn ClusterClient>,
    config: &OperatorConfig,
) -> Result<Arc<dyn RemoteExecutor>, Box<dyn std::error::Error>> {
    let remote: Arc<dyn RemoteExecutor> = match config.executor.mode {
        ExecutorMode::Agent => Arc::new(AgentExecutor::new(&config.executor)?),
        ExecutorMode::Daemonset => Arc::new(DaemonExecutor::new(cluster, &config.executor)),
    };
    Ok(remote)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!(
        "Starting ChaosMeta Inject Operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config_path = std::env::var("INJECT_OPERATOR_CONFIG_PATH")
        .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = Arc::new(load_config(&config_path)?);
    info!(
        pool_count = config.worker.pool_count,
        executor_mode = ?config.executor.mode,
        "Loaded operator configuration"
    );

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let cluster: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(client.clone()));
    let remote = build_remote_executor(cluster.clone(), &config)?;
    let engine = Arc::new(Engine::new(cluster, remote, config.worker.pool_count));

    let context = Arc::new(Context {
        client: client.clone(),
        config: config.clone(),
        engine,
    });

    let recovery_handle = {
        let client = client.clone();
        let interval = Duration::from_secs(config.ticker.auto_check_interval);
        tokio::spawn(run_auto_recovery(client, interval))
    };

    let controller_handle = {
        let client = client.clone();
        tokio::spawn(async move {
            if let Err(e) = run_experiment_controller(client, context).await {
                error!("Controller error: {}", e);
            }
        })
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(TimeoutLayer::new(Duration::from_secs(30))),
        )
        .with_state(AppState {
            config: config.clone(),
        });

    let address = format!("0.0.0.0:{}", config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("Operator HTTP server listening on {}", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    recovery_handle.abort();
    controller_handle.abort();
    info!("Inject operator stopped");

    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "inject-operator",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ready",
        "service": "inject-operator",
        "executor": format!("{:?}", state.config.executor.mode).to_lowercase(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
