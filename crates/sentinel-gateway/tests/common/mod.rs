//! Shared fixture: a real gateway served on an ephemeral port.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use sentinel_core::auth::KeyStore;
use sentinel_core::config::Config;
use sentinel_core::forward::RecordingSink;
use sentinel_gateway::{router, AppState};
use serde_json::Value;

/// Seeded key for the default test agent.
pub const TEST_KEY: &str = "agent_sk_test_key_12345678901234567890";

pub struct TestApp {
    pub addr: SocketAddr,
    pub client: reqwest::Client,
    pub state: AppState,
    pub sink: Arc<RecordingSink>,
}

pub async fn spawn_app(config: Config) -> TestApp {
    spawn_app_with_keys(config, Arc::new(KeyStore::with_seeded_agents())).await
}

pub async fn spawn_app_with_keys(config: Config, keys: Arc<KeyStore>) -> TestApp {
    let sink = Arc::new(RecordingSink::new());
    let state = AppState::build(&config, sink.clone(), keys).expect("app state builds");
    let app = router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("ephemeral port");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server runs");
    });

    TestApp {
        addr,
        client: reqwest::Client::new(),
        state,
        sink,
    }
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .bearer_auth(TEST_KEY)
            .json(body)
            .send()
            .await
            .expect("request sends")
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .bearer_auth(TEST_KEY)
            .send()
            .await
            .expect("request sends")
    }

    pub async fn put_json(&self, path: &str, body: &Value) -> reqwest::Response {
        self.client
            .put(self.url(path))
            .bearer_auth(TEST_KEY)
            .json(body)
            .send()
            .await
            .expect("request sends")
    }

    pub async fn delete(&self, path: &str) -> reqwest::Response {
        self.client
            .delete(self.url(path))
            .bearer_auth(TEST_KEY)
            .send()
            .await
            .expect("request sends")
    }

    pub async fn evaluate(&self, body: &Value) -> reqwest::Response {
        self.post_json("/api/v1/gateway/evaluate", body).await
    }
}
