//! JSON read API over the latest harvest snapshot.

use std::future::Future;

use axum::{extract::State, routing::get, Json, Router};
use finwire_core::FeedItem;
use finwire_sync::{PassSummary, SnapshotStore};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "finwire-web";

#[derive(Clone)]
pub struct AppState {
    pub snapshot: SnapshotStore,
}

impl AppState {
    pub fn new(snapshot: SnapshotStore) -> Self {
        Self { snapshot }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub articles: usize,
    pub passes: Vec<PassSummary>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/news", get(news_handler))
        .route("/api/status", get(status_handler))
        .with_state(state)
}

/// Serve until `shutdown` resolves, then drain in-flight requests.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "web api listening");
    }
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Feed of the most recent completed pass per source; `[]` before the first one.
async fn news_handler(State(state): State<AppState>) -> Json<Vec<FeedItem>> {
    Json(state.snapshot.feed().await)
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let articles = state.snapshot.feed().await.len();
    Json(StatusResponse {
        articles,
        passes: state.snapshot.passes().await,
    })
}
