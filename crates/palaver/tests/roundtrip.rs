//! End-to-end request/reply over real listeners: the happy path, unknown
//! types, push fan-out, the HTTP variant, and middleware on the wire.

mod common;

use std::sync::Arc;
use std::time::Duration;

use palaver::{
    middleware_fn, Client, ClientError, ClientEvent, ClientOptions, ConcurrencyPool, HttpClient,
    PoolMiddleware, PushScope, Schema, Server, ServerEvent, WireError,
};
use serde::Deserialize;
use serde_json::{json, Value};

use common::{adder_schema, drain_events, ephemeral_addr, next_matching, start_server, ws_url};

#[tokio::test]
async fn happy_path_add() {
    let server = start_server(adder_schema()).await;
    let client = Client::connect(ws_url(&server), ClientOptions::default());

    let sum = client.dispatch("ADD", json!({"x": 3, "y": 5})).await.unwrap();
    assert_eq!(sum, json!(8));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn unknown_type_is_err() {
    let server = start_server(adder_schema()).await;
    let client = Client::connect(ws_url(&server), ClientOptions::default());

    let err = client.dispatch("NOPE", json!({})).await.unwrap_err();
    match err {
        ClientError::Task(wire) => {
            assert_eq!(wire.message, "Unknown request type: \"NOPE\"");
        }
        other => panic!("expected task error, got {other:?}"),
    }

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn typed_schema_handlers() {
    #[derive(Deserialize)]
    struct MulArgs {
        x: i64,
        y: i64,
    }

    let schema = Schema::builder()
        .task_fn("MUL", |args: MulArgs| async move { Ok(args.x * args.y) })
        .build();
    let server = start_server(schema).await;
    let client = Client::connect(ws_url(&server), ClientOptions::default());

    let product = client.dispatch("MUL", json!({"x": 6, "y": 7})).await.unwrap();
    assert_eq!(product, json!(42));

    // A payload that does not deserialize fails with the 400 the typed
    // wrapper attaches.
    let err = client.dispatch("MUL", json!({"x": "six"})).await.unwrap_err();
    assert_eq!(err.as_wire().and_then(|w| w.code), Some(400));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn ping_runs_the_healthcheck() {
    let schema = adder_schema();
    let server = Server::new(schema)
        .with_healthcheck(|| async { Ok(json!({"status": "ok"})) })
        .listen(ephemeral_addr())
        .await
        .unwrap();
    let client = Client::connect(ws_url(&server), ClientOptions::default());

    let health = client.ping(Duration::from_secs(2)).await.unwrap();
    assert_eq!(health, json!({"status": "ok"}));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn push_fan_out() {
    let server = start_server(adder_schema()).await;

    let client0 = Client::connect(ws_url(&server), ClientOptions::default());
    client0.wait_ready().await;
    let conn0 = wait_for_connections(&server, 1).await[0];

    let client1 = Client::connect(ws_url(&server), ClientOptions::default());
    client1.wait_ready().await;
    let conn1 = *wait_for_connections(&server, 2)
        .await
        .iter()
        .find(|id| **id != conn0)
        .unwrap();

    let mut events0 = client0.subscribe();
    let mut events1 = client1.subscribe();

    server.push("foo", Value::Null, PushScope::Broadcast);
    server.push("foo", Value::Null, PushScope::Single(conn0));
    server.push("foo", Value::Null, PushScope::List(vec![conn0, conn1]));

    tokio::time::sleep(Duration::from_millis(200)).await;

    let foos = |events: Vec<ClientEvent>| {
        events
            .into_iter()
            .filter(|e| matches!(e, ClientEvent::Push { event, .. } if event == "foo"))
            .count()
    };
    assert_eq!(foos(drain_events(&mut events0)), 3);
    assert_eq!(foos(drain_events(&mut events1)), 2);

    client0.close().await;
    client1.close().await;
    server.close().await;
}

async fn wait_for_connections(server: &palaver::ServerHandle, n: usize) -> Vec<palaver::ConnectionId> {
    for _ in 0..100 {
        let connections = server.connections();
        if connections.len() == n {
            return connections;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("never saw {n} connections");
}

#[tokio::test]
async fn http_variant_roundtrip() {
    let schema = Schema::builder()
        .task("ADD", |payload| async move {
            let x = payload["x"].as_i64().unwrap_or(0);
            let y = payload["y"].as_i64().unwrap_or(0);
            Ok(json!(x + y))
        })
        .task("TEAPOT", |_| async move {
            Err(WireError::new("short and stout").with_code(418))
        })
        .task("BADCODE", |_| async move {
            Err(WireError::new("code out of range").with_code(999))
        })
        .build();
    let server = Server::new(schema)
        .with_healthcheck(|| async { Ok(json!("healthy")) })
        .listen(ephemeral_addr())
        .await
        .unwrap();
    let base = format!("http://{}", server.local_addr());
    let http = HttpClient::new(&base);

    assert_eq!(
        http.dispatch("ADD", json!({"x": 3, "y": 5})).await.unwrap(),
        json!(8)
    );
    assert_eq!(http.healthcheck().await.unwrap(), json!("healthy"));

    // ERR status is the error's code when it is a valid HTTP status.
    let err = http.dispatch("TEAPOT", Value::Null).await.unwrap_err();
    assert_eq!(err.as_wire().and_then(|w| w.code), Some(418));

    // Unknown type and out-of-range codes fall back to 500.
    let raw = reqwest::Client::new();
    let response = raw
        .post(format!("{base}/api/NOPE"))
        .json(&Value::Null)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["message"], json!("Unknown request type: \"NOPE\""));

    let response = raw
        .post(format!("{base}/api/BADCODE"))
        .json(&Value::Null)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 500);

    // A body that is not JSON is a bad frame: 400.
    let response = raw
        .post(format!("{base}/api/ADD"))
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    server.close().await;
}

#[tokio::test]
async fn disconnect_endpoint_closes_connections() {
    let server = start_server(adder_schema()).await;
    let client = Client::connect(ws_url(&server), ClientOptions::default());
    client.wait_ready().await;
    let mut events = client.subscribe();

    let response = reqwest::get(format!("http://{}/disconnect", server.local_addr()))
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    next_matching(
        &mut events,
        Duration::from_secs(2),
        "host-closed",
        |e| matches!(e, ClientEvent::HostClosed),
    )
    .await;

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn middleware_runs_on_the_wire() {
    let gate = middleware_fn(|req, next| {
        Box::pin(async move {
            if req.payload["forbidden"].as_bool().unwrap_or(false) {
                return Err(WireError::new("forbidden").with_code(403));
            }
            next.run(req).await
        })
    });

    let server = Server::new(adder_schema())
        .with_middleware(gate)
        .listen(ephemeral_addr())
        .await
        .unwrap();
    let client = Client::connect(ws_url(&server), ClientOptions::default());

    assert_eq!(
        client.dispatch("ADD", json!({"x": 1, "y": 2})).await.unwrap(),
        json!(3)
    );
    let err = client
        .dispatch("ADD", json!({"x": 1, "y": 2, "forbidden": true}))
        .await
        .unwrap_err();
    assert_eq!(err.as_wire().and_then(|w| w.code), Some(403));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn pool_middleware_sheds_load() {
    let schema = Schema::builder()
        .task("SLEEP", |_| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(json!("done"))
        })
        .build();
    let pool = Arc::new(ConcurrencyPool::new(1, 0));
    let server = Server::new(schema)
        .with_middleware(Arc::new(PoolMiddleware::new(pool)))
        .listen(ephemeral_addr())
        .await
        .unwrap();
    let client = Client::connect(ws_url(&server), ClientOptions::default());
    client.wait_ready().await;

    let (a, b) = tokio::join!(
        client.dispatch("SLEEP", Value::Null),
        client.dispatch("SLEEP", Value::Null),
    );

    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    let rejected = outcomes
        .iter()
        .find_map(|r| r.as_ref().err())
        .expect("one dispatch rejected");
    match rejected {
        ClientError::Task(wire) => assert_eq!(wire.code, Some(503)),
        other => panic!("expected queue-full task error, got {other:?}"),
    }

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn server_emits_request_and_reply_events() {
    let server = start_server(adder_schema()).await;
    let mut events = server.subscribe();
    let client = Client::connect(ws_url(&server), ClientOptions::default());

    client.dispatch("ADD", json!({"x": 2, "y": 2})).await.unwrap();

    next_matching(&mut events, Duration::from_secs(2), "request event", |e| {
        matches!(e, ServerEvent::Request(req) if req.task == "ADD")
    })
    .await;
    next_matching(&mut events, Duration::from_secs(2), "reply event", |e| {
        matches!(e, ServerEvent::Reply(reply) if reply.is_ok())
    })
    .await;

    client.close().await;
    server.close().await;
}
