//! CLI commands against an in-memory node

use chainrpc_cli::commands;
use chainrpc_engine::test_support::{fast_config, FakeNode};
use chainrpc_engine::RpcEngine;
use serde_json::{json, Value};

fn printed(out: &[u8]) -> Vec<Value> {
    serde_json::Deserializer::from_slice(out)
        .into_iter::<Value>()
        .collect::<Result<_, _>>()
        .unwrap()
}

#[tokio::test]
async fn test_call_prints_result() {
    let node = FakeNode::new();
    let engine = RpcEngine::start(fast_config(), node.connector());
    let mut out = Vec::new();

    let (result, _) = tokio::join!(
        commands::call(&engine, "chain_getBlockHash", json!([0]), &mut out),
        async {
            let mut conn = node.accept().await;
            let (id, params) = conn.expect_request("chain_getBlockHash").await;
            assert_eq!(params, json!([0]));
            conn.respond(id, json!("0x91b1")).await;
            conn
        }
    );

    result.unwrap();
    assert_eq!(printed(&out), vec![json!("0x91b1")]);
}

#[tokio::test]
async fn test_call_surfaces_remote_error() {
    let node = FakeNode::new();
    let engine = RpcEngine::start(fast_config(), node.connector());
    let mut out = Vec::new();

    let (result, _) = tokio::join!(
        commands::call(&engine, "bogus_method", Value::Null, &mut out),
        async {
            let mut conn = node.accept().await;
            let (id, _) = conn.expect_request("bogus_method").await;
            conn.respond_error(id, -32601, "Method not found").await;
            conn
        }
    );

    let err = result.unwrap_err();
    assert!(format!("{:#}", err).contains("Method not found"));
    assert!(out.is_empty());
}

#[tokio::test]
async fn test_subscribe_stops_after_count_and_unsubscribes() {
    let node = FakeNode::new();
    let engine = RpcEngine::start(fast_config(), node.connector());
    let mut out = Vec::new();

    let (received, mut conn) = tokio::join!(
        commands::subscribe(
            &engine,
            "chain_subscribeNewHeads",
            Value::Null,
            Some("chain_unsubscribeNewHeads".into()),
            Some(2),
            &mut out,
        ),
        async {
            let mut conn = node.accept().await;
            let (id, _) = conn.expect_request("chain_subscribeNewHeads").await;
            conn.respond(id, json!("S1")).await;
            for n in 1..=3 {
                conn.push("chain_newHead", json!("S1"), json!({"number": n}))
                    .await;
            }
            conn
        }
    );

    assert_eq!(received.unwrap(), 2);
    assert_eq!(
        printed(&out),
        vec![json!({"number": 1}), json!({"number": 2})]
    );
    let (_, params) = conn.expect_request("chain_unsubscribeNewHeads").await;
    assert_eq!(params, json!(["S1"]));
}

#[tokio::test]
async fn test_subscribe_reports_terminal_failure() {
    let node = FakeNode::new();
    let engine = RpcEngine::start(fast_config(), node.connector());
    let mut out = Vec::new();

    let (result, _) = tokio::join!(
        commands::subscribe(
            &engine,
            "chain_subscribeNewHeads",
            Value::Null,
            None,
            None,
            &mut out,
        ),
        async {
            let mut conn = node.accept().await;
            let (id, _) = conn.expect_request("chain_subscribeNewHeads").await;
            conn.respond_error(id, -32601, "Method not found").await;
            conn
        }
    );

    let err = result.unwrap_err();
    assert!(err.to_string().contains("chain_subscribeNewHeads ended"));
}
