//! HTTP surface: the WebSocket endpoint plus a health probe.
//!
//! Everything else the browser needs (project metadata, stored sessions,
//! static assets) is served by the surrounding application, not this core.

pub mod channel;

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::core::broker::Broker;

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    active_sessions: usize,
}

async fn healthz(State(broker): State<Arc<Broker>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        active_sessions: broker.registry().active_count(),
    })
}

/// Builds the router with the given shared state.
pub fn build_router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/ws", get(channel::ws_handler))
        .route("/healthz", get(healthz))
        .with_state(broker)
}

/// Serves until the listener fails.
pub async fn serve(
    broker: Arc<Broker>,
    listener: tokio::net::TcpListener,
) -> std::io::Result<()> {
    let app = build_router(broker);
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    async fn start_test_server() -> (std::net::SocketAddr, Arc<Broker>) {
        let broker = Broker::new(Config::default());
        let app = build_router(broker.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, broker)
    }

    #[tokio::test]
    async fn healthz_reports_session_count() {
        let (addr, _broker) = start_test_server().await;
        let body: serde_json::Value = reqwest::get(format!("http://{addr}/healthz"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["active_sessions"], 0);
    }

    #[tokio::test]
    async fn ws_route_rejects_plain_get() {
        let (addr, _broker) = start_test_server().await;
        // Without the upgrade headers this is not a WebSocket handshake.
        let status = reqwest::get(format!("http://{addr}/ws"))
            .await
            .unwrap()
            .status();
        assert!(status.is_client_error(), "got {status}");
    }
}
