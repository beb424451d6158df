//! Push flows: WebSocket and server-sent events end to end.

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
    use uuid::Uuid;

    use tea_events::TransportType;

    use crate::support::{
        eventually, fast_config, ledger_record, TestGateway, WebhookReceiver, CHANNEL, WAIT,
    };

    type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    fn push_body(transport: &str) -> Value {
        json!({
            "name": "grading floor",
            "type": transport,
            "channelName": CHANNEL,
        })
    }

    async fn connect(gateway: &TestGateway, id: &str) -> Client {
        let (socket, _) = connect_async(gateway.ws_url(id)).await.expect("ws connect");
        let sockets = gateway.pipeline.sinks().socket.clone();
        let sub_id: Uuid = id.parse().unwrap();
        assert!(eventually(WAIT, || sockets.connection_count(sub_id) == 1).await);
        socket
    }

    /// Next text frame, skipping pings
    async fn next_text(socket: &mut Client) -> Value {
        loop {
            let message = tokio::time::timeout(WAIT, socket.next())
                .await
                .expect("frame in time")
                .expect("open socket")
                .expect("valid frame");
            match message {
                Message::Text(text) => return serde_json::from_str(&text).expect("json frame"),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    /// Close code the server sent
    async fn close_code(socket: &mut Client) -> Option<u16> {
        loop {
            match tokio::time::timeout(WAIT, socket.next()).await.ok()?? {
                Ok(Message::Close(frame)) => return frame.map(|f| u16::from(f.code)),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    #[tokio::test]
    async fn test_websocket_receives_events() {
        let gateway = TestGateway::start().await;
        let sub = gateway.create_ok(push_body("websocket")).await;
        let id = sub["id"].as_str().unwrap().to_string();
        assert!(gateway.listening(CHANNEL, 1).await);
        let mut socket = connect(&gateway, &id).await;

        gateway.ledger.publish(
            CHANNEL,
            ledger_record(4, "BatchGraded", json!({"batchId": "B-4", "grade": "BOPF"})),
        );
        let event = next_text(&mut socket).await;
        assert_eq!(event["eventName"], "BatchGraded");
        assert_eq!(event["channelName"], CHANNEL);
        assert_eq!(event["payload"]["grade"], "BOPF");

        let records = gateway.store.connections_for(id.parse().unwrap());
        assert_eq!(records.len(), 1);
        assert_eq!(gateway.pipeline.metrics().delivered(TransportType::WebSocket), 1);
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_upgrade_on_wrong_transport_is_rejected() {
        let gateway = TestGateway::start().await;
        let sub = gateway.create_ok(push_body("sse")).await;
        let id = sub["id"].as_str().unwrap();

        match connect_async(gateway.ws_url(id)).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), 409);
            }
            other => panic!("expected HTTP 409, got {:?}", other.map(|_| ())),
        }

        match connect_async(gateway.ws_url(&Uuid::new_v4().to_string())).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), 404);
            }
            other => panic!("expected HTTP 404, got {:?}", other.map(|_| ())),
        }
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_deactivation_closes_socket() {
        let gateway = TestGateway::start().await;
        let sub = gateway.create_ok(push_body("websocket")).await;
        let id = sub["id"].as_str().unwrap().to_string();
        let mut socket = connect(&gateway, &id).await;

        let response = gateway
            .patch("u1", &format!("/events/subscriptions/{id}"), json!({"active": false}))
            .await;
        assert_eq!(response.status(), 200);
        assert_eq!(close_code(&mut socket).await, Some(1000));
        assert!(gateway.listening(CHANNEL, 0).await);

        // inactive subscriptions refuse new sockets
        match connect_async(gateway.ws_url(&id)).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), 409);
            }
            other => panic!("expected HTTP 409, got {:?}", other.map(|_| ())),
        }

        let response = gateway
            .patch("u1", &format!("/events/subscriptions/{id}"), json!({"active": true}))
            .await;
        assert_eq!(response.status(), 200);
        assert!(gateway.listening(CHANNEL, 1).await);
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_socket_with_going_away() {
        let gateway = TestGateway::start().await;
        let sub = gateway.create_ok(push_body("websocket")).await;
        let id = sub["id"].as_str().unwrap().to_string();
        let mut socket = connect(&gateway, &id).await;

        let pipeline = gateway.pipeline.clone();
        let stop = tokio::spawn(gateway.stop());
        assert_eq!(close_code(&mut socket).await, Some(1001));
        drop(socket);
        let _ = tokio::time::timeout(WAIT, stop).await;
        assert!(pipeline.is_shutting_down());
    }

    #[tokio::test]
    async fn test_sse_stream() {
        let gateway = TestGateway::start().await;
        let sub = gateway.create_ok(push_body("sse")).await;
        let id = sub["id"].as_str().unwrap().to_string();
        assert!(gateway.listening(CHANNEL, 1).await);

        let mut response = gateway
            .client
            .get(gateway.url(&format!("/events/sse/{id}")))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert!(response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let streams = gateway.pipeline.sinks().stream.clone();
        assert!(eventually(WAIT, || streams.open_streams() == 1).await);

        gateway.ledger.publish(
            CHANNEL,
            ledger_record(9, "BatchPacked", json!({"batchId": "B-9"})),
        );

        let mut buffer = String::new();
        let event = loop {
            let chunk = tokio::time::timeout(WAIT, response.chunk())
                .await
                .expect("chunk in time")
                .unwrap()
                .expect("stream still open");
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            let Some(start) = buffer.find("data:") else {
                continue;
            };
            if let Some(end) = buffer[start..].find("\n\n") {
                let line = buffer[start + "data:".len()..start + end].trim();
                break serde_json::from_str::<Value>(line).unwrap();
            }
        };
        assert_eq!(event["eventName"], "BatchPacked");
        assert_eq!(event["blockNumber"], 9);
        assert_eq!(gateway.pipeline.metrics().delivered(TransportType::Sse), 1);
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_fanout_to_socket_and_webhook() {
        let gateway = TestGateway::start().await;
        let receiver = WebhookReceiver::ok().await;
        let socket_sub = gateway.create_ok(push_body("websocket")).await;
        gateway
            .create_ok(json!({
                "name": "erp",
                "type": "webhook",
                "channelName": CHANNEL,
                "webhookUrl": receiver.url,
                "webhookSecret": "s",
            }))
            .await;
        assert_eq!(gateway.pipeline.listeners().ref_count(CHANNEL), 2);
        assert!(gateway.listening(CHANNEL, 1).await);

        let id = socket_sub["id"].as_str().unwrap().to_string();
        let mut socket = connect(&gateway, &id).await;
        gateway
            .ledger
            .publish(CHANNEL, ledger_record(5, "BatchCreated", json!({"batchId": "B-5"})));

        let frame = next_text(&mut socket).await;
        assert!(receiver.wait_for(1).await);
        assert_eq!(frame, receiver.hits()[0].json());
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_listener_recovers_from_ledger_failure() {
        let gateway = TestGateway::start().await;
        let sub = gateway.create_ok(push_body("websocket")).await;
        let id = sub["id"].as_str().unwrap().to_string();
        assert!(gateway.listening(CHANNEL, 1).await);
        let mut socket = connect(&gateway, &id).await;

        gateway.ledger.fail(CHANNEL, "peer restarted");
        let calls = gateway.ledger.clone();
        assert!(eventually(WAIT, || calls.watch_calls(CHANNEL) >= 2).await);
        assert!(gateway.listening(CHANNEL, 1).await);

        gateway
            .ledger
            .publish(CHANNEL, ledger_record(6, "BatchCreated", json!({"batchId": "B-6"})));
        assert_eq!(next_text(&mut socket).await["blockNumber"], 6);
        assert!(
            gateway
                .pipeline
                .metrics()
                .ledger_reconnects
                .load(Ordering::Relaxed)
                >= 1
        );
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_idle_socket_subscription_drops_events() {
        let gateway = TestGateway::start().await;
        gateway.create_ok(push_body("websocket")).await;
        assert!(gateway.listening(CHANNEL, 1).await);

        gateway
            .ledger
            .publish(CHANNEL, ledger_record(1, "BatchCreated", json!({})));
        let metrics = gateway.pipeline.metrics().clone();
        assert!(eventually(WAIT, || metrics.published() == 1).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(metrics.delivered(TransportType::WebSocket), 0);
        assert_eq!(metrics.failed(TransportType::WebSocket), 0);
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_chatty_client_is_closed_with_policy_violation() {
        let mut config = fast_config();
        config.websocket.inbound_messages = 2;
        let gateway = TestGateway::with_config(config).await;
        let sub = gateway.create_ok(push_body("websocket")).await;
        let id = sub["id"].as_str().unwrap().to_string();
        let sub_id: Uuid = id.parse().unwrap();
        let mut socket = connect(&gateway, &id).await;

        for n in 0..3 {
            socket.send(Message::Text(format!("hello {n}"))).await.unwrap();
        }
        assert_eq!(close_code(&mut socket).await, Some(1008));

        let store = gateway.store.clone();
        assert!(
            eventually(WAIT, || {
                store
                    .connections_for(sub_id)
                    .first()
                    .is_some_and(|record| record.disconnected_at.is_some())
            })
            .await
        );
        let sockets = gateway.pipeline.sinks().socket.clone();
        assert!(eventually(WAIT, || sockets.connection_count(sub_id) == 0).await);
        assert_eq!(gateway.pipeline.rate_limiter().bucket_count(), 0);
        gateway.stop().await;
    }
}
