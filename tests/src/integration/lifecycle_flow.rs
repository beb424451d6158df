//! Subscription lifecycle over the REST surface.

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use crate::support::{fast_config, TestGateway, CHANNEL};

    fn socket_body(name: &str) -> Value {
        json!({
            "name": name,
            "type": "websocket",
            "channelName": CHANNEL,
            "chaincodeName": "teaTraceCC",
        })
    }

    #[tokio::test]
    async fn test_crud_round_trip() {
        let gateway = TestGateway::start().await;

        let created = gateway.create_ok(socket_body("floor")).await;
        let id = created["id"].as_str().unwrap().to_string();
        assert_eq!(created["userId"], "u1");
        assert_eq!(created["type"], "websocket");
        assert_eq!(created["active"], true);
        assert_eq!(gateway.pipeline.listeners().ref_count(CHANNEL), 1);

        let path = format!("/events/subscriptions/{id}");
        let response = gateway.patch("u1", &path, json!({"name": "grading floor"})).await;
        assert_eq!(response.status(), 200);
        let updated: Value = response.json().await.unwrap();
        assert_eq!(updated["name"], "grading floor");
        assert_eq!(updated["channelName"], CHANNEL);

        let response = gateway.get("u1", "/events/subscriptions").await;
        let list: Value = response.json().await.unwrap();
        assert_eq!(list["subscriptions"].as_array().unwrap().len(), 1);

        let response = gateway.delete("u1", &path).await;
        assert_eq!(response.status(), 204);
        assert_eq!(gateway.get("u1", &path).await.status(), 404);
        assert_eq!(gateway.delete("u1", &path).await.status(), 404);
        assert_eq!(gateway.pipeline.listeners().ref_count(CHANNEL), 0);
        assert!(gateway.listening(CHANNEL, 0).await);
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let gateway = TestGateway::start().await;

        let response = gateway
            .create(
                "u1",
                json!({"name": "erp", "type": "webhook", "channelName": CHANNEL}),
            )
            .await;
        assert_eq!(response.status(), 400);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"]["code"], "invalid_request");

        let response = gateway
            .create("u1", json!({"name": "x", "type": "carrier-pigeon", "channelName": CHANNEL}))
            .await;
        assert_eq!(response.status(), 400);

        let response = gateway
            .create("u1", json!({"name": "x", "type": "sse", "channelName": ""}))
            .await;
        assert_eq!(response.status(), 400);

        assert!(gateway.pipeline.registry().is_empty());
        assert!(gateway.pipeline.listeners().active_channels().is_empty());
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_owner_headers() {
        let gateway = TestGateway::start().await;

        let response = gateway
            .client
            .get(gateway.url("/events/subscriptions"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 401);

        let response = gateway
            .client
            .get(gateway.url("/events/subscriptions"))
            .header("x-user-id", "u1")
            .header("x-api-key-id", "k1")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);

        // api key owners are separate from user owners
        let created = gateway.create_ok(socket_body("floor")).await;
        let response = gateway
            .client
            .get(gateway.url(&format!("/events/subscriptions/{}", created["id"].as_str().unwrap())))
            .header("x-api-key-id", "u1")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_pagination() {
        let gateway = TestGateway::start().await;
        for n in 0..3 {
            gateway.create_ok(socket_body(&format!("sub-{n}"))).await;
        }

        let first: Value = gateway
            .get("u1", "/events/subscriptions?limit=2")
            .await
            .json()
            .await
            .unwrap();
        assert_eq!(first["subscriptions"].as_array().unwrap().len(), 2);
        assert_eq!(first["limit"], 2);

        let rest: Value = gateway
            .get("u1", "/events/subscriptions?limit=2&offset=2")
            .await
            .json()
            .await
            .unwrap();
        assert_eq!(rest["subscriptions"].as_array().unwrap().len(), 1);

        let response = gateway.get("u1", "/events/subscriptions?limit=lots").await;
        assert_eq!(response.status(), 400);
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_health_reports_pipeline() {
        let gateway = TestGateway::start().await;
        gateway.create_ok(socket_body("floor")).await;

        let response = gateway.client.get(gateway.url("/health")).send().await.unwrap();
        assert_eq!(response.status(), 200);
        assert!(response.headers().contains_key("x-request-id"));
        let health: Value = response.json().await.unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["subscriptions"], 1);
        assert_eq!(health["channels"], json!([CHANNEL]));
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_request_id_is_echoed() {
        let gateway = TestGateway::start().await;
        let id = uuid::Uuid::new_v4().to_string();
        let response = gateway
            .client
            .get(gateway.url("/health"))
            .header("x-request-id", &id)
            .send()
            .await
            .unwrap();
        assert_eq!(response.headers()["x-request-id"].to_str().unwrap(), id);
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_rest_rate_limit() {
        let mut config = fast_config();
        config.rate_limit.enabled = true;
        config.rate_limit.requests_per_second = 1;
        config.rate_limit.burst_size = 2;
        let gateway = TestGateway::with_config(config).await;

        let mut statuses = Vec::new();
        for _ in 0..3 {
            statuses.push(gateway.get("u1", "/events/subscriptions").await.status().as_u16());
        }
        assert_eq!(statuses, [200, 200, 429]);

        let response = gateway.get("u1", "/events/subscriptions").await;
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"]["code"], "rate_limited");

        // push and health routes are not REST-limited
        let response = gateway.client.get(gateway.url("/health")).send().await.unwrap();
        assert_eq!(response.status(), 200);
        gateway.stop().await;
    }
}
