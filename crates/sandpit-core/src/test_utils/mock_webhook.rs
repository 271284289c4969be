// src/test_utils/mock_webhook.rs
use axum::{extract::State, http::HeaderMap, http::StatusCode, routing::put, Json, Router};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

use crate::notifier::TOKEN_HEADER;

#[derive(Debug, Clone)]
pub struct ReceivedCallback {
    pub token: Option<String>,
    pub user_agent: Option<String>,
    pub body: serde_json::Value,
}

#[derive(Clone)]
struct MockWebhookState {
    statuses: Arc<Mutex<VecDeque<u16>>>,
    received: Arc<Mutex<Vec<ReceivedCallback>>>,
}

async fn callback_handler(
    State(state): State<MockWebhookState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    state.received.lock().unwrap().push(ReceivedCallback {
        token: header(TOKEN_HEADER),
        user_agent: header("user-agent"),
        body,
    });

    // Scripted responses first, then success.
    let code = state.statuses.lock().unwrap().pop_front().unwrap_or(200);
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

pub struct MockWebhookServer {
    addr: SocketAddr,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
    received: Arc<Mutex<Vec<ReceivedCallback>>>,
}

impl MockWebhookServer {
    pub async fn start(statuses: Vec<u16>) -> Self {
        let state = MockWebhookState {
            statuses: Arc::new(Mutex::new(VecDeque::from(statuses))),
            received: Arc::new(Mutex::new(Vec::new())),
        };
        let received = state.received.clone();

        let app = Router::new()
            .route("/callback", put(callback_handler))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap_or_else(|e| {
            panic!("Failed to bind mock webhook server to 127.0.0.1:0. Error: {}", e);
        });
        let addr = listener.local_addr().unwrap();
        log::info!("Mock webhook server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .unwrap_or_else(|e| log::error!("Mock webhook server error: {}", e));
        });

        MockWebhookServer {
            addr,
            shutdown_tx,
            received,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}/callback", self.addr)
    }

    pub fn received(&self) -> Vec<ReceivedCallback> {
        self.received.lock().unwrap().clone()
    }

    pub async fn shutdown(self) {
        if self.shutdown_tx.send(()).is_err() {
            log::warn!("Mock webhook server already stopped");
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
    }
}
