use std::collections::HashMap;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::time::timeout;

use crate::json_line::JsonLineTransport;
use crate::transport::{TransportAdapter, TransportError};

/// Accepts one connection and answers frames the way a subordinate would.
async fn spawn_peer() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("local addr").to_string();

    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            let frame: Value = serde_json::from_str(&line).expect("valid frame");
            let id = frame["id"].as_u64().expect("id");
            let mut out = Vec::new();
            match frame["kind"].as_str() {
                Some("call") if frame["command"] == "Configure" => {
                    out.push(json!({"kind": "reply", "id": id, "ok": false, "message": "unknown band"}));
                }
                Some("call") if frame["command"] == "Hangup" => return,
                Some("call") => {
                    out.push(json!({"kind": "reply", "id": id, "ok": true, "message": frame["command"]}));
                }
                Some("subscribe") => {
                    let signal = frame["signal"].clone();
                    out.push(json!({"kind": "reply", "id": id, "ok": true}));
                    out.push(json!({"kind": "event", "signal": signal, "value": "DEGRADED"}));
                }
                _ => out.push(json!({"kind": "reply", "id": id, "ok": true})),
            }
            for frame in out {
                let mut bytes = serde_json::to_vec(&frame).expect("encode");
                bytes.push(b'\n');
                if write_half.write_all(&bytes).await.is_err() {
                    return;
                }
            }
        }
    });

    address
}

fn transport(address: String) -> JsonLineTransport {
    let mut endpoints = HashMap::new();
    endpoints.insert("csp".to_string(), address);
    JsonLineTransport::new(endpoints, Duration::from_secs(1))
}

#[tokio::test]
async fn call_and_ping_round_trip() {
    // Arrange
    let transport = transport(spawn_peer().await);

    // Act
    let reply = transport
        .call("csp", "AssignResources", json!({"receptors": ["SKA001"]}))
        .await;
    let ping = transport.ping("csp").await;

    // Assert
    assert_eq!(reply, Ok(Some("AssignResources".to_string())));
    assert_eq!(ping, Ok(()));
}

#[tokio::test]
async fn remote_failure_is_reported_with_reason() {
    let transport = transport(spawn_peer().await);

    let reply = transport.call("csp", "Configure", json!({})).await;

    assert_eq!(
        reply,
        Err(TransportError::Remote {
            command: "Configure".to_string(),
            reason: "unknown band".to_string(),
        })
    );
}

#[tokio::test]
async fn subscription_delivers_push_notifications() {
    // Arrange
    let transport = transport(spawn_peer().await);

    // Act
    let mut updates = transport
        .subscribe("csp", "healthState")
        .await
        .expect("subscribe");
    let first = timeout(Duration::from_secs(2), updates.recv())
        .await
        .expect("update in time");

    // Assert
    assert_eq!(first, Some(Ok(json!("DEGRADED"))));
}

#[tokio::test]
async fn unknown_subordinate_is_rejected() {
    let transport = transport(spawn_peer().await);

    let result = transport.ping("sdp").await;

    assert_eq!(result, Err(TransportError::UnknownDevice("sdp".to_string())));
}

#[tokio::test]
async fn peer_hangup_fails_waiters_and_closes_subscriptions() {
    // Arrange
    let transport = transport(spawn_peer().await);
    let mut updates = transport
        .subscribe("csp", "obsState")
        .await
        .expect("subscribe");
    let _ = timeout(Duration::from_secs(2), updates.recv()).await;

    // Act
    let hangup = transport.call("csp", "Hangup", Value::Null).await;
    let after = timeout(Duration::from_secs(2), updates.recv())
        .await
        .expect("close in time");

    // Assert
    assert_eq!(hangup, Err(TransportError::Disconnected));
    assert_eq!(after, Some(Err(TransportError::Disconnected)));
}

#[tokio::test]
async fn abandoned_requests_do_not_leave_waiters_behind() {
    // Arrange: a peer that reads every frame and never answers
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("local addr").to_string();
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(_)) = lines.next_line().await {}
    });
    let transport = transport(address);

    // Act
    for _ in 0..20 {
        let result = timeout(Duration::from_millis(50), transport.ping("csp")).await;
        assert!(result.is_err(), "silent peer must not answer");
    }

    // Assert
    assert_eq!(transport.waiting("csp").await, Some(0));
}
