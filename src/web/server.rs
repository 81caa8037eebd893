//! Stats endpoint: Prometheus text and a JSON snapshot.

use std::sync::Arc;

use axum::{extract::State, response::Json, routing::get, Router};
use tracing::info;

use crate::config::Config;
use crate::metrics::Metrics;

pub struct WebServer {
    metrics: Arc<Metrics>,
    config: Arc<Config>,
}

#[derive(Clone)]
struct AppState {
    metrics: Arc<Metrics>,
}

impl WebServer {
    pub fn new(metrics: Arc<Metrics>, config: Arc<Config>) -> Self {
        Self { metrics, config }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        if !self.config.web.enabled {
            info!("stats endpoint disabled");
            return Ok(());
        }

        let state = AppState {
            metrics: self.metrics.clone(),
        };

        let app = Router::new()
            .route("/metrics", get(metrics_text))
            .route("/api/stats", get(api_stats))
            .with_state(state);

        let addr = format!("{}:{}", self.config.web.address, self.config.web.port);
        info!("stats endpoint listening on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }
}

async fn metrics_text(State(state): State<AppState>) -> String {
    state.metrics.render()
}

async fn api_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.metrics.snapshot())
}
