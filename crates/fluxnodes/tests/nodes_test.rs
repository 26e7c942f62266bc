use fluxcore::{EventSink, Node, NodeContext, NodeError, Value};
use fluxnodes::{DebugNode, DelayNode, JsonParseNode};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn ctx(inputs: HashMap<String, Value>, config: HashMap<String, Value>) -> NodeContext {
    let (tx, _rx) = broadcast::channel(16);
    NodeContext {
        run_id: Uuid::new_v4(),
        node_id: Uuid::new_v4(),
        inputs,
        config,
        events: EventSink::new(Uuid::new_v4(), tx),
        cancellation: CancellationToken::new(),
    }
}

#[tokio::test]
async fn debug_node_forwards_message() {
    let inputs = HashMap::from([("message".to_string(), Value::from("hello"))]);
    let output = DebugNode.execute(ctx(inputs, HashMap::new())).await.unwrap();
    assert_eq!(output.outputs.get("message"), Some(&Value::from("hello")));
}

#[tokio::test]
async fn json_parse_produces_json_value() {
    let inputs = HashMap::from([("json".to_string(), Value::from(r#"{"a": 1}"#))]);
    let output = JsonParseNode
        .execute(ctx(inputs, HashMap::new()))
        .await
        .unwrap();
    let parsed = output.outputs.get("parsed").unwrap().as_json().unwrap();
    assert_eq!(parsed["a"], 1);
}

#[tokio::test]
async fn json_parse_rejects_non_string_input() {
    let inputs = HashMap::from([("json".to_string(), Value::from(3.0))]);
    let err = JsonParseNode
        .execute(ctx(inputs, HashMap::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::InvalidInputType { .. }));
}

#[tokio::test]
async fn delay_node_returns_early_on_cancellation() {
    let config = HashMap::from([("ms".to_string(), Value::from(30_000.0))]);
    let ctx = ctx(HashMap::new(), config);
    let token = ctx.cancellation.clone();

    let started = Instant::now();
    let exec = tokio::spawn(async move { DelayNode.execute(ctx).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    let result = exec.await.unwrap();
    assert!(matches!(result, Err(NodeError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(5));
}
