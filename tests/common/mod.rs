//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use fedipost::{AppState, config, jobs};
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Owner API key installed on every test server
pub const OWNER_API_KEY: &str = "owner.test-secret-value";

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        // Bind first so actor IDs carry the real port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: addr.port(),
                domain: addr.to_string(),
                protocol: "http".to_string(),
            },
            database: config::DatabaseConfig {
                path: db_path,
                max_connections: 5,
            },
            owner: config::OwnerConfig {
                username: "alice".to_string(),
                name: "Alice".to_string(),
                summary: "Test account".to_string(),
                image_url: String::new(),
                email: "alice@localhost".to_string(),
                api_key: Some(OWNER_API_KEY.to_string()),
                key_bits: 1024,
            },
            federation: config::FederationConfig {
                allow_private_hosts: true,
                request_timeout_seconds: 5,
                actor_cache_ttl_seconds: 60,
                actor_cache_capacity: 100,
                user_agent: "fedipost-test".to_string(),
            },
            jobs: config::JobsConfig {
                enabled: false,
                max_workers: 4,
                poll_interval_ms: 50,
                max_attempts: 25,
                backoff_base_seconds: 15,
                backoff_max_seconds: 3600,
                lease_seconds: 300,
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        // Initialize app state
        let state = AppState::new(config).await.unwrap();

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        let app = fedipost::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: format!("http://{}", addr),
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// The owner's actor ID
    pub fn actor_id(&self) -> String {
        self.state.config.server.actor_id("alice")
    }

    pub async fn owner(&self) -> fedipost::identity::User {
        self.state.identity.get_user_by_username("alice").await.unwrap()
    }

    /// Run every due job to completion
    pub async fn drain_jobs(&self) -> usize {
        self.state.worker_pool().drain().await.unwrap()
    }

    pub async fn jobs(&self) -> Vec<jobs::JobRecord> {
        self.state.jobs.list_jobs(None).await.unwrap()
    }

    /// Publish a public note through the outbox endpoint
    pub async fn publish_note(&self, content: &str) -> reqwest::Response {
        self.client
            .post(self.url("/~alice/outbox"))
            .bearer_auth(OWNER_API_KEY)
            .json(&serde_json::json!({
                "@context": "https://www.w3.org/ns/activitystreams",
                "type": "Note",
                "content": content,
                "to": ["https://www.w3.org/ns/activitystreams#Public"]
            }))
            .send()
            .await
            .unwrap()
    }
}

/// Have `name` on `remote` follow the owner, then run the resulting jobs
pub async fn follow_and_drain(server: &TestServer, remote: &MockRemote, name: &str, n: u32) {
    let response = remote
        .post_signed(
            &server.client,
            &server.url("/~alice/inbox"),
            name,
            &remote.follow(name, &server.actor_id(), n),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    server.drain_jobs().await;
}

/// A request received by a [`MockRemote`] inbox
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ReceivedRequest {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

#[derive(Clone)]
struct MockState {
    base: String,
    public_key_pem: Arc<Mutex<String>>,
    inbox_status: Arc<Mutex<StatusCode>>,
    received: Arc<Mutex<Vec<ReceivedRequest>>>,
}

/// A remote federated server
///
/// Serves actor documents at `/users/:name` with an inbox at
/// `/users/:name/inbox`. Actors named `noinbox*` publish no inbox.
/// Inbox responses use a configurable status.
pub struct MockRemote {
    pub base: String,
    private_key_pem: Mutex<String>,
    public_key_pem: Arc<Mutex<String>>,
    inbox_status: Arc<Mutex<StatusCode>>,
    received: Arc<Mutex<Vec<ReceivedRequest>>>,
}

impl MockRemote {
    pub async fn start() -> Self {
        let (private_key_pem, public_key_pem) = test_key_pair();
        let public_key_pem = Arc::new(Mutex::new(public_key_pem));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let inbox_status = Arc::new(Mutex::new(StatusCode::ACCEPTED));
        let received = Arc::new(Mutex::new(Vec::new()));
        let state = MockState {
            base: base.clone(),
            public_key_pem: public_key_pem.clone(),
            inbox_status: inbox_status.clone(),
            received: received.clone(),
        };

        let app = Router::new()
            .route("/users/:name", get(mock_actor))
            .route("/users/:name/inbox", post(mock_inbox))
            .with_state(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base,
            private_key_pem: Mutex::new(private_key_pem),
            public_key_pem,
            inbox_status,
            received,
        }
    }

    pub fn actor_id(&self, name: &str) -> String {
        format!("{}/users/{}", self.base, name)
    }

    pub fn key_id(&self, name: &str) -> String {
        format!("{}#main-key", self.actor_id(name))
    }

    pub fn private_key_pem(&self) -> String {
        self.private_key_pem.lock().unwrap().clone()
    }

    /// Replace the key every actor signs with and publishes
    pub fn rotate_key(&self) {
        let (private_key_pem, public_key_pem) = test_key_pair();
        *self.private_key_pem.lock().unwrap() = private_key_pem;
        *self.public_key_pem.lock().unwrap() = public_key_pem;
    }

    /// Status every inbox POST is answered with
    pub fn set_inbox_status(&self, status: StatusCode) {
        *self.inbox_status.lock().unwrap() = status;
    }

    pub fn received(&self) -> Vec<ReceivedRequest> {
        self.received.lock().unwrap().clone()
    }

    /// POST `activity` to `url`, signed as `signer`
    pub async fn post_signed(
        &self,
        client: &reqwest::Client,
        url: &str,
        signer: &str,
        activity: &serde_json::Value,
    ) -> reqwest::Response {
        let body = serde_json::to_vec(activity).unwrap();
        let mut request = client.post(url).body(body.clone()).build().unwrap();
        fedipost::federation::sign_request(
            &mut request,
            &self.key_id(signer),
            &self.private_key_pem(),
            &body,
        )
        .unwrap();
        client.execute(request).await.unwrap()
    }

    pub fn follow(&self, follower: &str, target: &str, n: u32) -> serde_json::Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": format!("{}/follows/{}", self.actor_id(follower), n),
            "type": "Follow",
            "actor": self.actor_id(follower),
            "object": target
        })
    }
}

fn test_key_pair() -> (String, String) {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
    let public_key = RsaPublicKey::from(&private_key);
    (
        private_key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string(),
        public_key.to_public_key_pem(LineEnding::LF).unwrap(),
    )
}

async fn mock_actor(State(state): State<MockState>, Path(name): Path<String>) -> Response {
    let id = format!("{}/users/{}", state.base, name);
    let public_key_pem = state.public_key_pem.lock().unwrap().clone();
    let mut actor = serde_json::json!({
        "@context": [
            "https://www.w3.org/ns/activitystreams",
            "https://w3id.org/security/v1"
        ],
        "type": "Person",
        "id": id,
        "preferredUsername": name,
        "publicKey": {
            "id": format!("{id}#main-key"),
            "owner": id,
            "publicKeyPem": public_key_pem
        }
    });
    if !name.starts_with("noinbox") {
        actor["inbox"] = serde_json::json!(format!("{id}/inbox"));
    }
    (
        [("content-type", "application/activity+json")],
        Json(actor),
    )
        .into_response()
}

async fn mock_inbox(
    State(state): State<MockState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    state.received.lock().unwrap().push(ReceivedRequest {
        path: format!("/users/{name}/inbox"),
        headers,
        body,
    });
    *state.inbox_status.lock().unwrap()
}
