//! End-to-end dispatch through the public API: detection, authorization,
//! namespaced aggregation and forwarding against scripted backends.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use common::{Script, ScriptedFactory, inbound, request};
use mcp_hub::config::{BackendConfig, Config};
use mcp_hub::error::rpc_codes;
use mcp_hub::gateway::Dispatcher;
use mcp_hub::protocol::RawMessage;

fn config(backends: &[&str], grants: &[&str]) -> Config {
    let mut config = Config::default();
    config.control.socket_path = Some("/tmp/mcp-hub-dispatch-tests.sock".into());
    config.gateway.permissions = grants.iter().map(ToString::to_string).collect();
    config.gateway.list_timeout = Duration::from_millis(200);
    config.gateway.call_timeout = Duration::from_millis(300);
    for id in backends {
        config
            .backends
            .insert((*id).to_string(), BackendConfig::default());
    }
    config
}

async fn reply(dispatcher: &Dispatcher, raw: RawMessage) -> Value {
    let response = dispatcher.handle(raw).await.expect("a reply");
    serde_json::to_value(response).unwrap()
}

fn tool_names(listing: &Value) -> Vec<String> {
    listing["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn catalog_is_namespaced_and_survives_a_hanging_backend() {
    // GIVEN connector A listing [x, y] and connector B that never answers in time
    let factory = ScriptedFactory::new();
    factory.script("A", Script::tools(&["x", "y"]));
    factory.script(
        "B",
        Script {
            list_delay: Duration::from_secs(5),
            ..Script::tools(&["z"])
        },
    );

    // WHEN the gateway starts and a client lists tools
    let started = Instant::now();
    let dispatcher = Dispatcher::start(config(&["A", "B"], &["mcp:*"]), factory)
        .await
        .unwrap();
    let listing = reply(&dispatcher, request("tools/list", json!({}))).await;

    // THEN only A's tools are advertised, within the list budget
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(tool_names(&listing), vec!["A__x", "A__y"]);
    assert_eq!(listing["result"]["tools"][0]["description"], "x from A");
    assert_eq!(dispatcher.snapshot().degraded_connectors, vec!["B"]);
}

#[tokio::test]
async fn call_is_forwarded_with_the_prefix_stripped() {
    let factory = ScriptedFactory::new();
    factory.script("weather", Script::tools(&["forecast"]));
    let dispatcher = Dispatcher::start(
        config(&["weather"], &["mcp:tools:call:weather"]),
        factory.clone(),
    )
    .await
    .unwrap();

    let response = reply(
        &dispatcher,
        request(
            "tools/call",
            json!({ "name": "weather__forecast", "arguments": { "city": "Oslo" } }),
        ),
    )
    .await;

    assert_eq!(response["id"], 1);
    assert_eq!(response["result"]["content"][0]["text"], "weather:forecast");
    assert_eq!(response["result"]["arguments"], json!({ "city": "Oslo" }));
    assert_eq!(factory.instances("weather")[0].calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn nested_method_argument_does_not_change_classification() {
    // GIVEN a broad MCP grant and a fetch tool
    let factory = ScriptedFactory::new();
    factory.script("web", Script::tools(&["fetch"]));
    let dispatcher = Dispatcher::start(config(&["web"], &["mcp:*"]), factory.clone())
        .await
        .unwrap();

    // WHEN params come before method and the arguments carry a "method" key
    let mut texts = Vec::new();
    for nested in ["GET", "tasks/get"] {
        let body = format!(
            r#"{{"params":{{"name":"web__fetch","arguments":{{"method":"{nested}"}}}},"jsonrpc":"2.0","id":1,"method":"tools/call"}}"#
        );
        let response = reply(&dispatcher, RawMessage::inbound(body)).await;
        assert_eq!(response["result"]["arguments"], json!({ "method": nested }));
        texts.push(response["result"]["content"][0]["text"].clone());
    }

    // THEN both are forwarded as MCP tool calls
    assert_eq!(texts, vec![json!("web:fetch"), json!("web:fetch")]);
    assert_eq!(factory.instances("web")[0].calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn denied_call_never_reaches_the_backend() {
    // GIVEN a grant for a different connector
    let factory = ScriptedFactory::new();
    factory.script("fs", Script::tools(&["read"]));
    factory.script("shell", Script::tools(&["exec"]));
    let dispatcher = Dispatcher::start(
        config(&["fs", "shell"], &["mcp:tools:call:fs"]),
        factory.clone(),
    )
    .await
    .unwrap();

    // WHEN a call targets the other connector
    let response = reply(
        &dispatcher,
        request("tools/call", json!({ "name": "shell__exec" })),
    )
    .await;

    // THEN the caller sees a denial and the backend saw nothing
    assert_eq!(response["error"]["code"], rpc_codes::PERMISSION_DENIED);
    assert!(
        response["error"]["message"]
            .as_str()
            .unwrap()
            .contains("mcp:tools:call:shell")
    );
    assert_eq!(factory.instances("shell")[0].calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_grant_list_denies_everything_routed() {
    let factory = ScriptedFactory::new();
    factory.script("A", Script::tools(&["x"]));
    let dispatcher = Dispatcher::start(config(&["A"], &[]), factory)
        .await
        .unwrap();

    let list = reply(&dispatcher, request("tools/list", json!({}))).await;
    let call = reply(&dispatcher, request("tools/call", json!({ "name": "A__x" }))).await;
    let ping = reply(&dispatcher, request("ping", json!({}))).await;

    assert_eq!(list["error"]["code"], rpc_codes::PERMISSION_DENIED);
    assert_eq!(call["error"]["code"], rpc_codes::PERMISSION_DENIED);
    assert_eq!(ping["result"], json!({}));
}

#[tokio::test]
async fn addressing_failures_are_distinct_from_denial() {
    let factory = ScriptedFactory::new();
    factory.script("A", Script::tools(&["x"]));
    let dispatcher = Dispatcher::start(config(&["A"], &["mcp:*"]), factory)
        .await
        .unwrap();

    let unprefixed = reply(&dispatcher, request("tools/call", json!({ "name": "x" }))).await;
    let unknown = reply(&dispatcher, request("tools/call", json!({ "name": "Z__x" }))).await;

    assert_eq!(unprefixed["error"]["code"], rpc_codes::INVALID_PARAMS);
    assert_eq!(unknown["error"]["code"], rpc_codes::CONNECTOR_NOT_FOUND);
}

#[tokio::test]
async fn backend_error_is_relayed_verbatim() {
    let factory = ScriptedFactory::new();
    factory.script("A", Script::tools(&["explode"]));
    let dispatcher = Dispatcher::start(config(&["A"], &["mcp:*"]), factory)
        .await
        .unwrap();

    let response = reply(
        &dispatcher,
        request("tools/call", json!({ "name": "A__explode" })),
    )
    .await;

    assert_eq!(
        response["error"],
        json!({ "code": -32099, "message": "A exploded", "data": { "retry": false } })
    );
}

#[tokio::test]
async fn slow_call_times_out_without_stalling_others() {
    let factory = ScriptedFactory::new();
    factory.script(
        "slow",
        Script {
            call_delay: Duration::from_secs(5),
            ..Script::tools(&["wait"])
        },
    );
    factory.script("fast", Script::tools(&["now"]));
    let dispatcher = Dispatcher::start(config(&["fast", "slow"], &["mcp:*"]), factory)
        .await
        .unwrap();

    let (slow, fast) = tokio::join!(
        reply(&dispatcher, request("tools/call", json!({ "name": "slow__wait" }))),
        reply(&dispatcher, request("tools/call", json!({ "name": "fast__now" }))),
    );

    assert_eq!(slow["error"]["code"], rpc_codes::BACKEND_ERROR);
    assert_eq!(fast["result"]["content"][0]["text"], "fast:now");
}

#[tokio::test]
async fn malformed_and_unclassified_input() {
    let dispatcher = Dispatcher::start(config(&[], &["mcp:*"]), ScriptedFactory::new())
        .await
        .unwrap();

    let malformed = reply(
        &dispatcher,
        RawMessage::inbound(r#"{"jsonrpc":"2.0","id":7,"method":"tools/list""#),
    )
    .await;
    assert_eq!(malformed["error"]["code"], rpc_codes::PARSE_ERROR);
    assert_eq!(malformed["id"], Value::Null);

    let noise = dispatcher.handle(RawMessage::inbound("GET / HTTP/1.1")).await;
    assert!(noise.is_none());
}

#[tokio::test]
async fn initialize_is_answered_by_the_gateway() {
    let dispatcher = Dispatcher::start(config(&[], &[]), ScriptedFactory::new())
        .await
        .unwrap();

    let response = reply(
        &dispatcher,
        inbound(&json!({
            "jsonrpc": "2.0",
            "id": "init-1",
            "method": "initialize",
            "params": { "protocolVersion": "2025-06-18", "capabilities": {} }
        })),
    )
    .await;

    assert_eq!(response["id"], "init-1");
    assert_eq!(response["result"]["serverInfo"]["name"], "mcp-hub");
    assert_eq!(
        response["result"]["protocolVersion"],
        mcp_hub::protocol::PROTOCOL_VERSION
    );
}

#[tokio::test]
async fn concurrent_calls_share_one_dispatcher() {
    let factory = ScriptedFactory::new();
    factory.script(
        "A",
        Script {
            call_delay: Duration::from_millis(50),
            ..Script::tools(&["x"])
        },
    );
    let dispatcher = Dispatcher::start(config(&["A"], &["mcp:*"]), factory.clone())
        .await
        .unwrap();

    let started = Instant::now();
    let calls = (0..20).map(|n| {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            reply(
                &dispatcher,
                request("tools/call", json!({ "name": "A__x", "arguments": { "n": n } })),
            )
            .await
        })
    });
    let replies = futures::future::join_all(calls).await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(replies.iter().all(|r| r.as_ref().unwrap()["result"].is_object()));
    assert_eq!(factory.instances("A")[0].calls.load(Ordering::SeqCst), 20);
    assert_eq!(dispatcher.in_flight(), 0);
}
