//! End-to-end tests of the node API.
//!
//! Each test starts a real axum server on a random port and talks to it with
//! reqwest. Remote nodes are served by the in-process mock transport.

mod common;

use common::{mesh_with, test_config, MockTransport, SearchBehavior};
use nodemesh::config::{ApiKeyConfig, Config};
use nodemesh::{ApiServer, NodeMesh};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;

const OPERATOR_KEY: &str = "operator-key-for-tests";
const REGISTRATION_TOKEN: &str = "join-the-mesh";

fn api_config() -> Config {
    let mut config = test_config();
    config.auth.api_keys = vec![ApiKeyConfig {
        key: OPERATOR_KEY.into(),
        name: "operator".into(),
    }];
    config.auth.registration_token = Some(REGISTRATION_TOKEN.into());
    config
}

/// Start a real HTTP server on a random port and return the base URL.
async fn start_server(mesh: Arc<NodeMesh>) -> (String, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let server = ApiServer::new(mesh);

    let handle = tokio::spawn(async move {
        server.serve_listener(listener).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
    (base_url, handle)
}

async fn register_child(client: &Client, base_url: &str, name: &str) -> Value {
    let resp = client
        .post(format!("{}/register", base_url))
        .header("x-registration-token", REGISTRATION_TOKEN)
        .json(&json!({
            "name": name,
            "url": format!("http://{}.test:8640", name),
            "capabilities": ["search", "actions"],
            "metadata": {"domains": ["docs"]}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    resp.json().await.unwrap()
}

#[tokio::test]
async fn test_health_is_public() {
    let mesh = mesh_with(api_config(), MockTransport::new());
    let (base_url, _handle) = start_server(mesh).await;

    let resp = Client::new()
        .get(format!("{}/health", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["node_id"], "master");
    assert_eq!(body["role"], "master");
}

#[tokio::test]
async fn test_protected_routes_require_credentials() {
    let mesh = mesh_with(api_config(), MockTransport::new());
    let (base_url, _handle) = start_server(mesh).await;
    let client = Client::new();

    let resp = client.get(format!("{}/status", base_url)).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_token");
    assert_eq!(body["status"], 401);

    let resp = client
        .get(format!("{}/status", base_url))
        .bearer_auth("not-a-key")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = client
        .get(format!("{}/status", base_url))
        .bearer_auth(OPERATOR_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["node_id"], "master");
}

#[tokio::test]
async fn test_registration_and_token_refresh() {
    let mesh = mesh_with(api_config(), MockTransport::new());
    let (base_url, _handle) = start_server(mesh).await;
    let client = Client::new();

    // Missing registration token
    let resp = client
        .post(format!("{}/register", base_url))
        .json(&json!({"name": "alpha", "url": "http://alpha.test"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let reg = register_child(&client, &base_url, "alpha").await;
    assert!(reg["node"].get("api_key_hash").is_none());
    let access = reg["access_token"].as_str().unwrap().to_string();
    let refresh = reg["refresh_token"].as_str().unwrap().to_string();

    let resp = client
        .post(format!("{}/search", base_url))
        .bearer_auth(&access)
        .json(&json!({"query": "rust"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["count"], 1);

    let resp = client
        .post(format!("{}/refresh-token", base_url))
        .json(&json!({ "refresh_token": refresh }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let pair: Value = resp.json().await.unwrap();
    assert_eq!(pair["token_type"], "Bearer");

    // The refresh token was single use
    let resp = client
        .post(format!("{}/refresh-token", base_url))
        .bearer_auth(&refresh)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_refresh_token");

    // Duplicate name
    let resp = client
        .post(format!("{}/register", base_url))
        .header("x-registration-token", REGISTRATION_TOKEN)
        .json(&json!({"name": "Alpha", "url": "http://other.test"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_node_administration() {
    let mesh = mesh_with(api_config(), MockTransport::new());
    let (base_url, _handle) = start_server(mesh).await;
    let client = Client::new();
    let reg = register_child(&client, &base_url, "alpha").await;
    let id = reg["node"]["id"].as_str().unwrap().to_string();

    let list: Value = client
        .get(format!("{}/nodes", base_url))
        .bearer_auth(OPERATOR_KEY)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["count"], 1);

    let resp = client
        .patch(format!("{}/nodes/{}", base_url, id))
        .bearer_auth(OPERATOR_KEY)
        .json(&json!({"weight": 5}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let node: Value = resp.json().await.unwrap();
    assert_eq!(node["weight"], 5);

    let resp = client
        .post(format!("{}/nodes/{}/breaker/reset", base_url, id))
        .bearer_auth(OPERATOR_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let stats: Value = resp.json().await.unwrap();
    assert_eq!(stats["state"], "closed");

    let resp = client
        .delete(format!("{}/nodes/{}", base_url, id))
        .bearer_auth(OPERATOR_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let list: Value = client
        .get(format!("{}/nodes?include_retired=true", base_url))
        .bearer_auth(OPERATOR_KEY)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["count"], 1);
    assert!(!list["nodes"][0]["retired_at"].is_null());

    // The retired node's token no longer works
    let resp = client
        .get(format!("{}/status", base_url))
        .bearer_auth(reg["access_token"].as_str().unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = client
        .get(format!("{}/nodes/missing", base_url))
        .bearer_auth(OPERATOR_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "node_not_found");
}

#[tokio::test]
async fn test_node_credentials_cannot_administer_the_mesh() {
    let mesh = mesh_with(api_config(), MockTransport::new());
    let (base_url, _handle) = start_server(mesh.clone()).await;
    let client = Client::new();
    let intruder = register_child(&client, &base_url, "intruder").await;
    let peer = register_child(&client, &base_url, "peer").await;
    let token = intruder["access_token"].as_str().unwrap();
    let api_key = intruder["api_key"].as_str().unwrap();
    let peer_id = peer["node"]["id"].as_str().unwrap();

    for credential in [token, api_key] {
        let resp = client
            .delete(format!("{}/nodes/{}", base_url, peer_id))
            .bearer_auth(credential)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["type"], "forbidden");
    }

    let resp = client
        .patch(format!("{}/nodes/{}", base_url, peer_id))
        .bearer_auth(token)
        .json(&json!({"status": "maintenance"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = client
        .post(format!("{}/federated/actions", base_url))
        .bearer_auth(token)
        .json(&json!({"action": "delete_document", "params": {"id": "local-1"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    for path in ["/nodes", "/requests"] {
        let resp = client
            .get(format!("{}{}", base_url, path))
            .bearer_auth(token)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    // The peer is untouched and node-to-node routes stay open
    assert!(mesh.registry().get(peer_id).unwrap().retired_at.is_none());
    let resp = client
        .get(format!("{}/status", base_url))
        .bearer_auth(token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_federated_search_over_http() {
    let transport = MockTransport::new();
    let mesh = mesh_with(api_config(), transport.clone());
    let (base_url, _handle) = start_server(mesh).await;
    let client = Client::new();
    register_child(&client, &base_url, "alpha").await;
    transport.on_search(
        "alpha",
        SearchBehavior::Results(vec![common::item("a1", "rust from alpha", 0.9)]),
    );

    let search = || {
        client
            .post(format!("{}/federated/search", base_url))
            .bearer_auth(OPERATOR_KEY)
            .header("x-correlation-id", "corr-http")
            .json(&json!({"query": "rust", "limit": 5}))
            .send()
    };

    let first = search().await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()["x-cache"], "miss");
    let first_body = first.bytes().await.unwrap();

    let second = search().await.unwrap();
    assert_eq!(second.headers()["x-cache"], "hit");
    let second_body = second.bytes().await.unwrap();
    assert_eq!(first_body, second_body);
    assert_eq!(transport.search_calls("alpha"), 1);

    let body: Value = serde_json::from_slice(&first_body).unwrap();
    assert_eq!(body["nodes_searched"], 2);
    assert_eq!(body["count"], 2);

    let records: Value = client
        .get(format!("{}/requests?correlation_id=corr-http", base_url))
        .bearer_auth(OPERATOR_KEY)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(records["count"], 1);
    assert_eq!(records["records"][0]["direction"], "outbound");
}

#[tokio::test]
async fn test_federated_actions_and_transactions_over_http() {
    let transport = MockTransport::new();
    let mesh = mesh_with(api_config(), transport.clone());
    let (base_url, _handle) = start_server(mesh).await;
    let client = Client::new();
    let a = register_child(&client, &base_url, "alpha").await["node"]["id"]
        .as_str()
        .unwrap()
        .to_string();
    let b = register_child(&client, &base_url, "beta").await["node"]["id"]
        .as_str()
        .unwrap()
        .to_string();
    transport.fail_action("beta", "apply");
    transport.fail_action("alpha", "revert");

    let resp = client
        .post(format!("{}/federated/actions", base_url))
        .bearer_auth(OPERATOR_KEY)
        .json(&json!({"action": "apply"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["succeeded"], 1);
    assert_eq!(body["failed"], 1);

    let resp = client
        .post(format!("{}/federated/transactions", base_url))
        .bearer_auth(OPERATOR_KEY)
        .json(&json!({"steps": [
            {"node_id": a, "action": "apply", "compensation": {"action": "revert"}},
            {"node_id": b, "action": "apply", "compensation": {"action": "revert"}}
        ]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "partial_transaction_failure");
    assert_eq!(body["error"]["report"]["steps"][0]["state"], "rollback_failed");
}

#[tokio::test]
async fn test_inbound_calls_are_recorded() {
    let mesh = mesh_with(api_config(), MockTransport::new());
    let (base_url, _handle) = start_server(mesh.clone()).await;
    let client = Client::new();
    let reg = register_child(&client, &base_url, "alpha").await;

    let resp = client
        .post(format!("{}/actions", base_url))
        .bearer_auth(reg["access_token"].as_str().unwrap())
        .header("x-correlation-id", "corr-in")
        .json(&json!({"action": "delete_document", "params": {"id": "local-1"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let records = mesh.requests().by_correlation("corr-in");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].node_id, reg["node"]["id"].as_str().unwrap());
    assert_eq!(
        records[0].auth_method,
        Some(nodemesh::auth::AuthMethod::AccessToken)
    );
}

#[tokio::test]
async fn test_rate_limit_returns_429() {
    let mut config = api_config();
    config.rate_limit.enabled = true;
    config.rate_limit.requests_per_minute = 60;
    config.rate_limit.burst = Some(2);
    let mesh = mesh_with(config, MockTransport::new());
    let (base_url, _handle) = start_server(mesh).await;
    let client = Client::new();

    for _ in 0..2 {
        let resp = client
            .get(format!("{}/status", base_url))
            .bearer_auth(OPERATOR_KEY)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
    let resp = client
        .get(format!("{}/status", base_url))
        .bearer_auth(OPERATOR_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(resp.headers().contains_key("retry-after"));

    // Health stays reachable
    let resp = client.get(format!("{}/health", base_url)).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}
