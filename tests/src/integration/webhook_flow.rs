//! Webhook flows: signed POSTs, retries and durable delivery records.

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use tea_events::sinks::signing;
    use tea_events::TransportType;

    use crate::support::{eventually, ledger_record, TestGateway, WebhookReceiver, CHANNEL, WAIT};

    const SECRET: &str = "estate-secret";

    fn webhook_body(url: &str) -> Value {
        json!({
            "name": "erp sync",
            "type": "webhook",
            "channelName": CHANNEL,
            "chaincodeName": "teaTraceCC",
            "webhookUrl": url,
            "webhookSecret": SECRET,
        })
    }

    async fn deliveries(gateway: &TestGateway, id: &str) -> Vec<Value> {
        let response = gateway
            .get("u1", &format!("/events/subscriptions/{id}/deliveries"))
            .await;
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        body["deliveries"].as_array().cloned().unwrap_or_default()
    }

    async fn wait_for_status(gateway: &TestGateway, id: &str, status: &str) -> Vec<Value> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let records = deliveries(gateway, id).await;
            if records.iter().any(|r| r["status"] == status) {
                return records;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no {status} delivery in {records:?}"
            );
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_signed_delivery() {
        let gateway = TestGateway::start().await;
        let receiver = WebhookReceiver::ok().await;
        let sub = gateway.create_ok(webhook_body(&receiver.url)).await;
        let id = sub["id"].as_str().unwrap().to_string();
        assert!(sub.get("webhookSecret").is_none());
        assert!(gateway.listening(CHANNEL, 1).await);

        gateway.ledger.publish(
            CHANNEL,
            ledger_record(12, "BatchCreated", json!({"batchId": "B-12", "estate": "Nuwara"})),
        );
        assert!(receiver.wait_for(1).await);

        let hit = &receiver.hits()[0];
        assert_eq!(hit.header("x-event-type"), Some("chaincode-event"));
        assert_eq!(hit.header("x-subscription-id"), Some(id.as_str()));
        assert_eq!(hit.header("x-channel-name"), Some(CHANNEL));
        assert_eq!(hit.header("x-chaincode-name"), Some("teaTraceCC"));
        assert_eq!(hit.header("x-event-name"), Some("BatchCreated"));
        assert_eq!(hit.header("x-transaction-id"), Some("tx-12"));
        assert_eq!(hit.header("x-event-id"), Some("tx-12:BatchCreated"));
        assert_eq!(hit.header("x-delivery-attempt"), Some("1"));
        let signature = hit.header("x-webhook-signature").unwrap();
        assert!(signing::verify(SECRET.as_bytes(), hit.body.as_bytes(), signature));

        let event = hit.json();
        assert_eq!(event["blockNumber"], 12);
        assert_eq!(event["payload"]["batchId"], "B-12");

        let records = wait_for_status(&gateway, &id, "success").await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["attempts"], 1);
        assert_eq!(records[0]["statusCode"], 200);
        assert_eq!(records[0]["eventId"], "tx-12:BatchCreated");
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_retries_until_failed() {
        let gateway = TestGateway::start().await;
        let receiver = WebhookReceiver::start(Vec::new(), 500).await;
        let sub = gateway.create_ok(webhook_body(&receiver.url)).await;
        let id = sub["id"].as_str().unwrap().to_string();
        assert!(gateway.listening(CHANNEL, 1).await);

        gateway
            .ledger
            .publish(CHANNEL, ledger_record(1, "BatchCreated", json!({})));
        assert!(receiver.wait_for(3).await);

        let records = wait_for_status(&gateway, &id, "failed").await;
        assert_eq!(records[0]["attempts"], 3);
        assert_eq!(records[0]["statusCode"], 500);

        let attempts: Vec<_> = receiver
            .hits()
            .iter()
            .map(|h| h.header("x-delivery-attempt").unwrap_or_default().to_string())
            .collect();
        assert_eq!(attempts, ["1", "2", "3"]);

        let metrics = gateway.pipeline.metrics().clone();
        assert!(eventually(WAIT, || metrics.failed(TransportType::Webhook) == 1).await);
        // no fourth attempt
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(receiver.hits().len(), 3);
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_transient_error_recovers() {
        let gateway = TestGateway::start().await;
        let receiver = WebhookReceiver::start(vec![503], 200).await;
        let sub = gateway.create_ok(webhook_body(&receiver.url)).await;
        let id = sub["id"].as_str().unwrap().to_string();
        assert!(gateway.listening(CHANNEL, 1).await);

        gateway
            .ledger
            .publish(CHANNEL, ledger_record(2, "BatchShipped", json!({"batchId": "B-2"})));

        let records = wait_for_status(&gateway, &id, "success").await;
        assert_eq!(records[0]["attempts"], 2);
        assert_eq!(receiver.hits().len(), 2);
        assert_eq!(receiver.hits()[0].body, receiver.hits()[1].body);
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_order_preserved_per_subscription() {
        let gateway = TestGateway::start().await;
        let receiver = WebhookReceiver::ok().await;
        gateway.create_ok(webhook_body(&receiver.url)).await;
        assert!(gateway.listening(CHANNEL, 1).await);

        for block in 1..=5 {
            gateway.ledger.publish(
                CHANNEL,
                ledger_record(block, "BatchUpdated", json!({"seq": block})),
            );
        }
        assert!(receiver.wait_for(5).await);

        let blocks: Vec<u64> = receiver
            .hits()
            .iter()
            .map(|h| h.json()["blockNumber"].as_u64().unwrap())
            .collect();
        assert_eq!(blocks, [1, 2, 3, 4, 5]);
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_filters_skip_non_matching_payloads() {
        let gateway = TestGateway::start().await;
        let receiver = WebhookReceiver::ok().await;
        let mut body = webhook_body(&receiver.url);
        body["filters"] = json!({"estate": "Nuwara"});
        gateway.create_ok(body).await;
        assert!(gateway.listening(CHANNEL, 1).await);

        gateway.ledger.publish(
            CHANNEL,
            ledger_record(1, "BatchCreated", json!({"estate": "Kandy"})),
        );
        gateway.ledger.publish(
            CHANNEL,
            ledger_record(2, "BatchCreated", json!({"estate": "Nuwara"})),
        );
        assert!(receiver.wait_for(1).await);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let hits = receiver.hits();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].json()["payload"]["estate"], "Nuwara");
        gateway.stop().await;
    }
}
