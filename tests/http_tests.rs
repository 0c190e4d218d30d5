//! HTTP data plane: `POST /mcp` and `GET /health`

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use common::{Script, ScriptedFactory};
use mcp_hub::config::{BackendConfig, Config};
use mcp_hub::gateway::{AppState, Dispatcher, create_router};

async fn serve(factory: Arc<ScriptedFactory>, backends: &[&str]) -> SocketAddr {
    let mut config = Config::default();
    config.control.enabled = false;
    config.control.socket_path = Some("/tmp/mcp-hub-http-tests.sock".into());
    config.gateway.permissions = vec!["mcp:tools:*".to_string()];
    config.gateway.list_timeout = Duration::from_millis(200);
    for id in backends {
        config
            .backends
            .insert((*id).to_string(), BackendConfig::default());
    }

    let dispatcher = Dispatcher::start(config, factory).await.unwrap();
    let app = create_router(Arc::new(AppState { dispatcher }));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

async fn post(addr: SocketAddr, body: &str) -> reqwest::Response {
    client()
        .post(format!("http://{addr}/mcp"))
        .header("content-type", "application/json")
        .body(body.to_string())
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn tools_list_and_call_over_http() {
    let factory = ScriptedFactory::new();
    factory.script("notes", Script::tools(&["search"]));
    let addr = serve(factory, &["notes"]).await;

    let listing: Value = post(addr, r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(listing["result"]["tools"][0]["name"], "notes__search");

    let call: Value = post(
        addr,
        &json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/call",
            "params": { "name": "notes__search", "arguments": { "q": "rust" } }
        })
        .to_string(),
    )
    .await
    .json()
    .await
    .unwrap();
    assert_eq!(call["id"], 2);
    assert_eq!(call["result"]["content"][0]["text"], "notes:search");
}

#[tokio::test]
async fn notification_is_accepted_without_body() {
    let addr = serve(ScriptedFactory::new(), &[]).await;

    let response = post(
        addr,
        r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
    )
    .await;

    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    assert!(response.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn health_reports_degraded_connectors() {
    let factory = ScriptedFactory::new();
    factory.script("up", Script::tools(&["t"]));
    factory.script(
        "stuck",
        Script {
            list_delay: Duration::from_secs(5),
            ..Script::tools(&["t"])
        },
    );
    let addr = serve(factory, &["stuck", "up"]).await;

    let health: Value = client()
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(health["status"], "degraded");
    assert_eq!(health["connectors"], 2);
    assert_eq!(health["tools"], 1);
    assert_eq!(health["in_flight"], 0);
}
