//! Gateway pipeline integration tests.
//!
//! Exercises caching, rate limiting, circuit breaking, retry classification
//! and idempotent order placement against a scripted remote.

#![allow(clippy::unwrap_used)]

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal_macros::dec;
use serde_json::json;

use broker_gateway::error::{ErrorCode, GatewayError};
use broker_gateway::gateway::{
    Gateway, Instrument, Operation, OrderSide, PlaceOrderRequest, RemoteApi, RemoteFailure,
    RemoteReply,
};
use broker_gateway::ledger::{IdempotencyKey, IdempotencyStatus, Ledger, Severity};
use broker_gateway::resilience::{CircuitBreakerState, Clock, SystemClock};
use common::{harness, order_accepted, payload_order_id, quote_reply, test_config};

fn nifty() -> Instrument {
    Instrument::equity("NIFTY", "NSE")
}

fn buy(quantity: rust_decimal::Decimal) -> PlaceOrderRequest {
    PlaceOrderRequest::market(nifty(), OrderSide::Buy, quantity)
}

// =============================================================================
// Cache
// =============================================================================

#[tokio::test]
async fn test_cached_read_is_identical_until_ttl_expires() {
    let h = harness(&test_config()).await;
    h.remote
        .set_default(Operation::Funds, RemoteReply::ok(json!({ "available": "5000.25" })));

    let first = h.gateway.get_funds().await;
    let second = h.gateway.get_funds().await;
    assert!(first.success);
    assert_eq!(first.data, second.data);
    assert_eq!(h.remote.calls(Operation::Funds), 1);

    h.clock.advance(Duration::from_secs(61));
    let third = h.gateway.get_funds().await;
    assert!(third.success);
    assert_eq!(h.remote.calls(Operation::Funds), 2);
}

#[tokio::test]
async fn test_order_invalidates_cached_positions() {
    let h = harness(&test_config()).await;
    h.remote
        .set_default(Operation::PlaceOrder, order_accepted("R-1"));

    h.gateway.get_positions().await;
    h.gateway.get_positions().await;
    assert_eq!(h.remote.calls(Operation::Positions), 1);

    assert!(h.gateway.place_order(&buy(dec!(1)), None).await.success);
    h.gateway.get_positions().await;
    assert_eq!(h.remote.calls(Operation::Positions), 2);
}

// =============================================================================
// Rate limiting
// =============================================================================

#[tokio::test]
async fn test_rate_limit_admits_capacity_then_waits_one_refill() {
    let mut config = test_config();
    config.rate_limit.capacity = 2;
    config.rate_limit.refill_per_second = 1.0;
    config.rate_limit.acquire_timeout_ms = 5_000;
    config.cache.quote = 0;
    let h = harness(&config).await;
    h.remote.set_default(Operation::Quote, quote_reply("100"));

    h.gateway.get_quote(&nifty()).await;
    h.gateway.get_quote(&nifty()).await;
    assert!(h.clock.sleeps().is_empty());

    let third = h.gateway.get_quote(&nifty()).await;
    assert!(third.success);
    let waited: Duration = h.clock.sleeps().iter().sum();
    assert!(waited >= Duration::from_secs(1));
    assert_eq!(h.remote.calls(Operation::Quote), 3);
}

#[tokio::test]
async fn test_rate_limit_timeout_never_reaches_remote() {
    let mut config = test_config();
    config.rate_limit.capacity = 1;
    config.rate_limit.refill_per_second = 0.1;
    config.rate_limit.acquire_timeout_ms = 100;
    config.cache.quote = 0;
    let h = harness(&config).await;

    assert!(h.gateway.get_quote(&nifty()).await.success);
    let limited = h.gateway.get_quote(&nifty()).await;
    assert_eq!(limited.error_code, Some(ErrorCode::RateLimitTimeout));
    assert_eq!(h.remote.calls(Operation::Quote), 1);

    // Placement rejected by the limiter leaves no ledger record.
    let key = IdempotencyKey::new("rl-1");
    let rejected = h.gateway.place_order(&buy(dec!(1)), Some(key.clone())).await;
    assert_eq!(rejected.error_code, Some(ErrorCode::RateLimitTimeout));
    assert!(h.gateway.ledger().get_record(&key).await.unwrap().is_none());
}

// =============================================================================
// Retry classification
// =============================================================================

#[tokio::test]
async fn test_server_error_retried_with_increasing_delay() {
    let h = harness(&test_config()).await;
    h.remote.push_status(Operation::Funds, 500, 3);

    let response = h.gateway.get_funds().await;
    assert_eq!(response.error_code, Some(ErrorCode::TransientRemoteError));
    assert_eq!(h.remote.calls(Operation::Funds), 3);
    assert_eq!(
        h.clock.sleeps(),
        vec![Duration::from_millis(100), Duration::from_millis(200)]
    );
}

#[tokio::test]
async fn test_unauthorized_is_never_retried() {
    let h = harness(&test_config()).await;
    h.remote
        .push(Operation::Funds, Ok(RemoteReply::error(401, "invalid session")));

    let response = h.gateway.get_funds().await;
    assert_eq!(response.error_code, Some(ErrorCode::PermanentRemoteError));
    assert_eq!(h.remote.calls(Operation::Funds), 1);
    assert!(h.clock.sleeps().is_empty());
    assert_eq!(h.gateway.breaker().consecutive_failures(), 0);
}

#[tokio::test]
async fn test_transient_then_success() {
    let h = harness(&test_config()).await;
    h.remote
        .push(Operation::Margin, Err(RemoteFailure::ConnectionReset));
    h.remote
        .set_default(Operation::Margin, RemoteReply::ok(json!({ "margin": "10" })));

    let response = h.gateway.get_margin("NSE").await;
    assert!(response.success);
    assert_eq!(response.data["margin"], "10");
    assert_eq!(h.remote.calls(Operation::Margin), 2);
}

#[derive(Debug)]
struct HangingRemote;

#[async_trait]
impl RemoteApi for HangingRemote {
    async fn call(
        &self,
        _endpoint: &str,
        _params: &BTreeMap<String, String>,
    ) -> Result<RemoteReply, RemoteFailure> {
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        Ok(RemoteReply::ok(json!({})))
    }
}

#[tokio::test]
async fn test_hung_remote_call_times_out_as_transient() {
    let mut config = test_config();
    config.remote.call_timeout_ms = 20;
    config.retry.max_attempts = 2;
    config.retry.base_delay_ms = 1;
    let ledger = Ledger::open_in_memory().await.unwrap();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let gateway = Gateway::from_config(&config, Arc::new(HangingRemote), ledger, clock);

    let err = gateway
        .call(Operation::CustomerDetails, BTreeMap::new())
        .await
        .unwrap_err();
    match err {
        GatewayError::TransientRemote {
            attempts, message, ..
        } => {
            assert_eq!(attempts, 2);
            assert!(message.contains("timed out"));
        }
        other => panic!("expected transient error, got {other:?}"),
    }
}

// =============================================================================
// Circuit breaker
// =============================================================================

#[tokio::test]
async fn test_breaker_opens_then_admits_one_probe() {
    let mut config = test_config();
    config.retry.max_attempts = 1;
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.recovery_timeout_secs = 30;
    let h = harness(&config).await;
    h.remote.push_status(Operation::TradeList, 503, 2);

    let range = broker_gateway::gateway::DateRange {
        exchange_code: "NSE".to_string(),
        from: chrono::DateTime::from_timestamp(1_735_689_600, 0).unwrap(),
        to: chrono::DateTime::from_timestamp(1_738_281_600, 0).unwrap(),
    };
    h.gateway.get_trade_list(&range).await;
    h.gateway.get_trade_list(&range).await;
    assert_eq!(h.gateway.breaker().state(), CircuitBreakerState::Open);

    let rejected = h.gateway.get_trade_list(&range).await;
    assert_eq!(rejected.error_code, Some(ErrorCode::CircuitOpen));
    assert_eq!(h.remote.calls(Operation::TradeList), 2);

    h.clock.advance(Duration::from_secs(30));
    let probe = h.gateway.get_trade_list(&range).await;
    assert!(probe.success);
    assert_eq!(h.gateway.breaker().state(), CircuitBreakerState::Closed);
    assert_eq!(h.remote.calls(Operation::TradeList), 3);
}

#[tokio::test]
async fn test_open_breaker_rejects_order_without_record() {
    let h = harness(&test_config()).await;
    h.gateway.breaker().force_open();

    let key = IdempotencyKey::new("cb-1");
    let response = h.gateway.place_order(&buy(dec!(1)), Some(key.clone())).await;
    assert_eq!(response.error_code, Some(ErrorCode::CircuitOpen));
    assert_eq!(h.remote.calls(Operation::PlaceOrder), 0);
    assert!(h.gateway.ledger().get_record(&key).await.unwrap().is_none());
}

// =============================================================================
// Idempotent placement
// =============================================================================

#[tokio::test]
async fn test_same_key_places_exactly_once() {
    let h = harness(&test_config()).await;
    h.remote
        .set_default(Operation::PlaceOrder, order_accepted("R-1"));
    let key = IdempotencyKey::new("order-1");

    let first = h.gateway.place_order(&buy(dec!(5)), Some(key.clone())).await;
    let second = h.gateway.place_order(&buy(dec!(5)), Some(key.clone())).await;

    assert!(first.success);
    assert_eq!(first.error_code, None);
    assert!(second.success);
    assert_eq!(second.error_code, Some(ErrorCode::DuplicateRequest));
    assert_eq!(payload_order_id(&first.data), Some("R-1"));
    assert_eq!(payload_order_id(&second.data), Some("R-1"));
    assert_eq!(h.remote.calls(Operation::PlaceOrder), 1);

    let sent = h.remote.last_params(Operation::PlaceOrder).unwrap();
    assert_eq!(sent.get("client_order_id").map(String::as_str), Some("order-1"));

    let trades = h.gateway.ledger().recent_trades(10).await.unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].status, IdempotencyStatus::Succeeded);
}

#[tokio::test]
async fn test_concurrent_same_key_places_once() {
    let h = harness(&test_config()).await;
    h.remote
        .set_default(Operation::PlaceOrder, order_accepted("R-2"));
    let key = IdempotencyKey::new("order-race");

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let gateway = Arc::clone(&h.gateway);
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            gateway.place_order(&buy(dec!(2)), Some(key)).await
        }));
    }
    for task in tasks {
        let response = task.await.unwrap();
        assert!(response.success);
        assert_eq!(payload_order_id(&response.data), Some("R-2"));
    }
    assert_eq!(h.remote.calls(Operation::PlaceOrder), 1);
}

#[tokio::test]
async fn test_reused_key_with_different_request_conflicts() {
    let h = harness(&test_config()).await;
    h.remote
        .set_default(Operation::PlaceOrder, order_accepted("R-3"));
    let key = IdempotencyKey::new("order-3");

    assert!(h.gateway.place_order(&buy(dec!(1)), Some(key.clone())).await.success);
    let conflict = h.gateway.place_order(&buy(dec!(2)), Some(key)).await;
    assert_eq!(conflict.error_code, Some(ErrorCode::IdempotencyConflict));
    assert_eq!(h.remote.calls(Operation::PlaceOrder), 1);
}

#[tokio::test]
async fn test_rejected_order_is_final() {
    let h = harness(&test_config()).await;
    h.remote.push(
        Operation::PlaceOrder,
        Ok(RemoteReply::error(400, "insufficient margin")),
    );
    let key = IdempotencyKey::new("order-4");

    let first = h.gateway.place_order(&buy(dec!(1)), Some(key.clone())).await;
    assert_eq!(first.error_code, Some(ErrorCode::PermanentRemoteError));

    let record = h.gateway.ledger().get_record(&key).await.unwrap().unwrap();
    assert_eq!(record.status, IdempotencyStatus::Failed);

    let replay = h.gateway.place_order(&buy(dec!(1)), Some(key)).await;
    assert!(!replay.success);
    assert_eq!(replay.error_code, Some(ErrorCode::DuplicateRequest));
    assert_eq!(h.remote.calls(Operation::PlaceOrder), 1);
}

#[tokio::test]
async fn test_invalid_order_never_reaches_remote() {
    let h = harness(&test_config()).await;
    let mut limit = buy(dec!(1));
    limit.order_type = broker_gateway::gateway::OrderType::Limit;

    let response = h.gateway.place_order(&limit, None).await;
    assert_eq!(response.error_code, Some(ErrorCode::InvalidRequest));
    assert_eq!(h.remote.calls(Operation::PlaceOrder), 0);
    assert!(h.gateway.ledger().pending_records().await.unwrap().is_empty());
}

// =============================================================================
// Ambiguous outcomes
// =============================================================================

#[tokio::test]
async fn test_exhausted_placement_confirmed_by_lookup() {
    let h = harness(&test_config()).await;
    h.remote.push_status(Operation::PlaceOrder, 503, 3);
    h.remote
        .set_default(Operation::OrderLookup, order_accepted("R-9"));
    let key = IdempotencyKey::new("order-5");

    let response = h.gateway.place_order(&buy(dec!(1)), Some(key.clone())).await;
    assert!(response.success);
    assert_eq!(payload_order_id(&response.data), Some("R-9"));
    assert_eq!(
        h.remote
            .last_params(Operation::OrderLookup)
            .unwrap()
            .get("client_order_id")
            .map(String::as_str),
        Some("order-5")
    );

    let record = h.gateway.ledger().get_record(&key).await.unwrap().unwrap();
    assert_eq!(record.status, IdempotencyStatus::Succeeded);
    assert_eq!(record.remote_order_id.as_deref(), Some("R-9"));
}

#[tokio::test]
async fn test_exhausted_placement_waits_before_lookup() {
    let mut config = test_config();
    config.ledger.lookup_interval_ms = 750;
    let h = harness(&config).await;
    h.remote.push_status(Operation::PlaceOrder, 503, 3);
    h.remote
        .set_default(Operation::OrderLookup, order_accepted("R-late"));

    let response = h
        .gateway
        .place_order(&buy(dec!(1)), Some(IdempotencyKey::new("order-late")))
        .await;
    assert!(response.success);
    assert_eq!(
        h.clock.sleeps(),
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(750)
        ]
    );
    assert_eq!(h.remote.calls(Operation::OrderLookup), 1);
}

#[tokio::test]
async fn test_exhausted_placement_absent_at_remote_fails() {
    let h = harness(&test_config()).await;
    h.remote.push_status(Operation::PlaceOrder, 503, 3);
    h.remote
        .set_default(Operation::OrderLookup, RemoteReply::error(404, "no such order"));
    let key = IdempotencyKey::new("order-6");

    let response = h.gateway.place_order(&buy(dec!(1)), Some(key.clone())).await;
    assert_eq!(response.error_code, Some(ErrorCode::TransientRemoteError));
    let record = h.gateway.ledger().get_record(&key).await.unwrap().unwrap();
    assert_eq!(record.status, IdempotencyStatus::Failed);
}

#[tokio::test]
async fn test_unresolved_placement_stays_pending_until_reconciled() {
    let h = harness(&test_config()).await;
    h.remote.push_status(Operation::PlaceOrder, 503, 3);
    h.remote.push_status(Operation::OrderLookup, 503, 3);
    let key = IdempotencyKey::new("order-7");

    let response = h.gateway.place_order(&buy(dec!(1)), Some(key.clone())).await;
    assert_eq!(response.error_code, Some(ErrorCode::TransientRemoteError));
    assert!(response.message.contains("reconciled"));

    let record = h.gateway.ledger().get_record(&key).await.unwrap().unwrap();
    assert_eq!(record.status, IdempotencyStatus::Pending);
    let activity = h.gateway.ledger().recent_activity(5).await.unwrap();
    assert_eq!(activity[0].severity, Severity::Critical);

    // A retry with the same key is not re-sent while unresolved.
    let replay = h.gateway.place_order(&buy(dec!(1)), Some(key.clone())).await;
    assert_eq!(replay.error_code, Some(ErrorCode::ReconciliationAmbiguous));
    assert_eq!(h.remote.calls(Operation::PlaceOrder), 3);

    h.remote
        .set_default(Operation::OrderLookup, order_accepted("R-7"));
    let report = h.gateway.reconcile_pending().await.unwrap();
    assert_eq!((report.examined, report.succeeded), (1, 1));
    assert!(report.is_clean());

    let replay = h.gateway.place_order(&buy(dec!(1)), Some(key)).await;
    assert_eq!(replay.error_code, Some(ErrorCode::DuplicateRequest));
    assert_eq!(payload_order_id(&replay.data), Some("R-7"));
}

// =============================================================================
// Status
// =============================================================================

#[tokio::test]
async fn test_connection_status_reflects_activity() {
    let h = harness(&test_config()).await;
    h.remote
        .push(Operation::Funds, Ok(RemoteReply::error(403, "forbidden")));

    h.gateway.get_customer_details().await;
    h.gateway.get_funds().await;

    let status = h.gateway.connection_status();
    assert_eq!(status.breaker_state, CircuitBreakerState::Closed);
    assert_eq!(status.total_calls, 2);
    assert_eq!(status.remote_calls, 2);
    assert_eq!(status.failed_calls, 1);
    assert_eq!(status.last_error, Some(ErrorCode::PermanentRemoteError));
    assert!(status.tokens_available <= status.token_capacity);
    assert!(status.is_healthy());
}
