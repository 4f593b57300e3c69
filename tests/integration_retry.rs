//! Integration tests for the retry and dead-letter paths

use std::time::Duration;

use ledger_events::broker::{HeaderValue, Headers};
use ledger_events::messaging::headers::{
    event_properties, HEADER_DEATH, HEADER_FAILED_AT, HEADER_FINAL_RETRY_COUNT,
    HEADER_ORIGINAL_ROUTING_KEY, HEADER_RETRY_COUNT,
};
use ledger_events::{Config, Event, RetryBackoff, SubscribeOptions};
use serde_json::json;

mod common;

use common::{fast_config, publish_raw, raw_channel, setup, wait_for, RecordingHandler, EXCHANGE};

const QUEUE: &str = "movement.created.queue";
const RETRY_QUEUE: &str = "movement.created.queue.retry";
const DEAD_LETTER_QUEUE: &str = "movement.created.queue.dlq";
const TIMEOUT: Duration = Duration::from_secs(5);

fn header_int(message: &ledger_events::broker::memory::StoredMessage, name: &str) -> Option<i64> {
    message.header(name).and_then(HeaderValue::as_i64)
}

fn two_retries() -> SubscribeOptions {
    SubscribeOptions::new()
        .retry_attempts(2)
        .retry_delay(Duration::from_millis(100))
}

#[tokio::test]
async fn test_handler_recovers_after_two_failures() {
    let (broker, manager) = setup(fast_config());
    let handler = RecordingHandler::failing(2);

    manager
        .subscribe("movement.created", handler.clone(), two_retries())
        .await
        .unwrap();
    manager.start_consumer().await.unwrap();

    let event = Event::new("movement.created", json!({"amount": "12.00"})).with_id("e1");
    manager.publish(&event).await.unwrap();

    assert!(wait_for(TIMEOUT, || handler.calls() == 3 && broker.unacked_count(QUEUE) == 0).await);
    assert!(handler.received().iter().all(|e| e.id() == "e1"));

    let retries = broker.history(RETRY_QUEUE);
    assert_eq!(retries.len(), 2);
    assert_eq!(header_int(&retries[0], HEADER_RETRY_COUNT), Some(1));
    assert_eq!(header_int(&retries[1], HEADER_RETRY_COUNT), Some(2));

    let deliveries = broker.history(QUEUE);
    assert_eq!(deliveries.len(), 3);
    assert_eq!(header_int(&deliveries[2], HEADER_RETRY_COUNT), Some(2));

    // Nothing left behind
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(handler.calls(), 3);
    assert!(broker.history(DEAD_LETTER_QUEUE).is_empty());
    assert_eq!(broker.queue_depth(QUEUE), 0);
    assert_eq!(broker.queue_depth(RETRY_QUEUE), 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_retries_move_to_dead_letter_queue() {
    let (broker, manager) = setup(fast_config());
    let handler = RecordingHandler::always_failing();

    manager
        .subscribe("movement.created", handler.clone(), two_retries())
        .await
        .unwrap();
    manager.start_consumer().await.unwrap();

    let event = Event::new("movement.created", json!({})).with_correlation_id("req-1");
    manager.publish(&event).await.unwrap();

    assert!(wait_for(TIMEOUT, || broker.history(DEAD_LETTER_QUEUE).len() == 1).await);
    assert!(wait_for(TIMEOUT, || broker.unacked_count(DEAD_LETTER_QUEUE) == 0).await);

    // One initial delivery plus exactly two redeliveries
    assert_eq!(handler.calls(), 3);
    assert_eq!(broker.history(RETRY_QUEUE).len(), 2);

    let dead = &broker.history(DEAD_LETTER_QUEUE)[0];
    assert_eq!(header_int(dead, HEADER_FINAL_RETRY_COUNT), Some(2));
    assert_eq!(
        dead.header(HEADER_ORIGINAL_ROUTING_KEY).and_then(HeaderValue::as_str),
        Some("movement.created")
    );
    assert!(dead.header(HEADER_FAILED_AT).is_some());

    let parked = Event::from_wire(&dead.body).unwrap();
    assert_eq!(parked.id(), event.id());
    assert_eq!(parked.correlation_id(), Some("req-1"));

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(handler.calls(), 3);
    assert_eq!(broker.history(DEAD_LETTER_QUEUE).len(), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_retry_count_header_wins_over_broker_metadata() {
    let (broker, manager) = setup(fast_config());
    let handler = RecordingHandler::always_failing();

    manager
        .subscribe("movement.created", handler.clone(), two_retries())
        .await
        .unwrap();
    manager.start_consumer().await.unwrap();

    // Already retried once, but the broker recorded many more deaths
    let event = Event::new("movement.created", json!({}));
    let mut death = Headers::new();
    death.insert("count".to_string(), HeaderValue::Int(7));
    death.insert("reason".to_string(), HeaderValue::from("rejected"));
    let properties = event_properties(&event)
        .with_header(HEADER_RETRY_COUNT, 1u32)
        .with_header(HEADER_ORIGINAL_ROUTING_KEY, "movement.created")
        .with_header(HEADER_DEATH, HeaderValue::Array(vec![HeaderValue::Table(death)]));

    let channel = raw_channel(&broker).await;
    channel
        .publish(EXCHANGE, "movement.created", &event.to_wire().unwrap(), &properties)
        .await
        .unwrap();

    assert!(wait_for(TIMEOUT, || broker.history(DEAD_LETTER_QUEUE).len() == 1).await);
    assert_eq!(handler.calls(), 2);
    assert_eq!(broker.history(RETRY_QUEUE).len(), 1);
    assert_eq!(
        header_int(&broker.history(DEAD_LETTER_QUEUE)[0], HEADER_FINAL_RETRY_COUNT),
        Some(2)
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn test_original_routing_key_survives_retry_hops() {
    let (broker, manager) = setup(fast_config());
    let handler = RecordingHandler::always_failing();

    manager
        .subscribe(
            "movement.*",
            handler.clone(),
            two_retries().queue("movement-audit"),
        )
        .await
        .unwrap();
    manager.start_consumer().await.unwrap();

    manager
        .publish(&Event::new("movement.cancelled", json!({})))
        .await
        .unwrap();

    assert!(wait_for(TIMEOUT, || broker.history("movement-audit.dlq").len() == 1).await);

    for retry in broker.history("movement-audit.retry") {
        assert_eq!(
            retry.header(HEADER_ORIGINAL_ROUTING_KEY).and_then(HeaderValue::as_str),
            Some("movement.cancelled")
        );
    }
    let dead = &broker.history("movement-audit.dlq")[0];
    assert_eq!(
        dead.header(HEADER_ORIGINAL_ROUTING_KEY).and_then(HeaderValue::as_str),
        Some("movement.cancelled")
    );
    assert_eq!(handler.calls(), 3);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_retries_stay_within_their_subscription() {
    let (broker, manager) = setup(fast_config());
    let healthy = RecordingHandler::succeeding();
    let failing = RecordingHandler::always_failing();

    manager
        .subscribe("movement.created", healthy.clone(), two_retries())
        .await
        .unwrap();
    manager
        .subscribe("movement.*", failing.clone(), two_retries())
        .await
        .unwrap();
    manager.start_consumer().await.unwrap();

    manager
        .publish(&Event::new("movement.created", json!({})).with_id("shared"))
        .await
        .unwrap();

    assert!(wait_for(TIMEOUT, || broker.history("movement.*.queue.dlq").len() == 1).await);
    tokio::time::sleep(Duration::from_millis(250)).await;

    // The failing subscription went through its full retry cycle
    assert_eq!(failing.calls(), 3);
    assert_eq!(broker.history("movement.*.queue").len(), 3);
    assert_eq!(broker.history("movement.*.queue.retry").len(), 2);

    // The healthy one saw the event exactly once
    assert_eq!(healthy.calls(), 1);
    assert_eq!(broker.history(QUEUE).len(), 1);
    assert!(broker.history(RETRY_QUEUE).is_empty());
    assert!(broker.history(DEAD_LETTER_QUEUE).is_empty());

    // Redeliveries still carry the routing key of the original publish
    for redelivery in &broker.history("movement.*.queue")[1..] {
        assert_eq!(
            redelivery.header(HEADER_ORIGINAL_ROUTING_KEY).and_then(HeaderValue::as_str),
            Some("movement.created")
        );
    }

    manager.shutdown().await;
}

#[tokio::test]
async fn test_malformed_message_is_discarded_without_retry() {
    let (broker, manager) = setup(fast_config());
    let handler = RecordingHandler::succeeding();

    manager
        .subscribe("movement.created", handler.clone(), two_retries())
        .await
        .unwrap();
    manager.start_consumer().await.unwrap();

    let channel = raw_channel(&broker).await;
    channel
        .publish(EXCHANGE, "movement.created", b"{not json", &Default::default())
        .await
        .unwrap();

    assert!(wait_for(TIMEOUT, || broker.history(DEAD_LETTER_QUEUE).len() == 1).await);
    assert!(broker.history(RETRY_QUEUE).is_empty());
    assert_eq!(handler.calls(), 0);

    // The consumer keeps working
    publish_raw(&channel, "movement.created", &Event::new("movement.created", json!({}))).await;
    assert!(wait_for(TIMEOUT, || handler.calls() == 1).await);
    assert!(wait_for(TIMEOUT, || broker.unacked_count(DEAD_LETTER_QUEUE) == 0).await);
    assert!(broker.history(RETRY_QUEUE).is_empty());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_dead_letter_handler_receives_failed_event() {
    let (broker, manager) = setup(fast_config());
    let handler = RecordingHandler::always_failing();
    let compensation = RecordingHandler::succeeding();

    manager
        .subscribe("movement.created", handler.clone(), two_retries().retry_attempts(0))
        .await
        .unwrap();
    manager
        .set_dead_letter_handler("movement.created", compensation.clone())
        .await
        .unwrap();
    manager.start_consumer().await.unwrap();

    let event = Event::new("movement.created", json!({"movementId": "m-1"}));
    manager.publish(&event).await.unwrap();

    assert!(wait_for(TIMEOUT, || compensation.calls() == 1).await);
    assert_eq!(compensation.received()[0].id(), event.id());
    assert_eq!(handler.calls(), 1);
    assert!(wait_for(TIMEOUT, || broker.unacked_count(DEAD_LETTER_QUEUE) == 0).await);
    assert_eq!(broker.queue_depth(DEAD_LETTER_QUEUE), 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_failing_dead_letter_handler_does_not_loop() {
    let (broker, manager) = setup(fast_config());
    let compensation = RecordingHandler::always_failing();

    manager
        .subscribe(
            "movement.created",
            RecordingHandler::always_failing(),
            two_retries().retry_attempts(0),
        )
        .await
        .unwrap();
    manager
        .set_dead_letter_handler("movement.created", compensation.clone())
        .await
        .unwrap();
    manager.start_consumer().await.unwrap();

    manager
        .publish(&Event::new("movement.created", json!({})))
        .await
        .unwrap();

    assert!(wait_for(TIMEOUT, || compensation.calls() == 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(compensation.calls(), 1);
    assert_eq!(broker.history(DEAD_LETTER_QUEUE).len(), 1);
    assert_eq!(broker.queue_depth(DEAD_LETTER_QUEUE), 0);
    assert_eq!(broker.unacked_count(DEAD_LETTER_QUEUE), 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_retry_disabled_sends_first_failure_to_dead_letter_queue() {
    let (broker, manager) = setup(Config {
        retry_enabled: false,
        ..fast_config()
    });
    let handler = RecordingHandler::always_failing();

    manager
        .subscribe("movement.created", handler.clone(), two_retries())
        .await
        .unwrap();
    manager.start_consumer().await.unwrap();

    manager
        .publish(&Event::new("movement.created", json!({})))
        .await
        .unwrap();

    assert!(wait_for(TIMEOUT, || broker.history(DEAD_LETTER_QUEUE).len() == 1).await);
    assert_eq!(handler.calls(), 1);
    assert!(broker.history(RETRY_QUEUE).is_empty());
    assert_eq!(
        header_int(&broker.history(DEAD_LETTER_QUEUE)[0], HEADER_FINAL_RETRY_COUNT),
        Some(0)
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn test_exponential_backoff_grows_per_hop() {
    let (broker, manager) = setup(Config {
        retry_backoff: RetryBackoff::Exponential {
            max_delay: Duration::from_millis(150),
        },
        ..fast_config()
    });
    let handler = RecordingHandler::always_failing();

    manager
        .subscribe(
            "movement.created",
            handler.clone(),
            SubscribeOptions::new()
                .retry_attempts(3)
                .retry_delay(Duration::from_millis(50)),
        )
        .await
        .unwrap();
    manager.start_consumer().await.unwrap();

    manager
        .publish(&Event::new("movement.created", json!({})))
        .await
        .unwrap();

    assert!(wait_for(TIMEOUT, || broker.history(DEAD_LETTER_QUEUE).len() == 1).await);

    let expirations: Vec<Option<String>> = broker
        .history(RETRY_QUEUE)
        .into_iter()
        .map(|m| m.properties.expiration)
        .collect();
    assert_eq!(
        expirations,
        vec![Some("50".to_string()), Some("100".to_string()), Some("150".to_string())]
    );
    assert_eq!(handler.calls(), 4);

    manager.shutdown().await;
}
