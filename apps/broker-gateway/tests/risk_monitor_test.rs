//! Risk monitor integration tests against the paper brokerage.

#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use broker_gateway::config::Config;
use broker_gateway::gateway::{Gateway, Instrument, Operation, Position, PositionSide};
use broker_gateway::infrastructure::{InjectedFailure, PaperRemote};
use broker_gateway::ledger::{IdempotencyKey, IdempotencyStatus, Ledger, LedgerAction, Severity};
use broker_gateway::monitor::{AlertCategory, RiskMonitor, StopRule, TrailDistance};
use broker_gateway::resilience::{Clock, ManualClock, SystemClock};

fn banknifty() -> Instrument {
    Instrument::equity("BANKNIFTY", "NSE")
}

const KEY: &str = "NSE:BANKNIFTY";

fn position(side: PositionSide, quantity: Decimal) -> Position {
    Position {
        instrument: banknifty(),
        quantity,
        side,
        avg_entry_price: dec!(500),
    }
}

fn monitor_config() -> Config {
    let mut config = common::test_config();
    config.cache.quote = 0;
    config.cache.positions = 0;
    config.monitor.poll_interval_secs = 1;
    config.monitor.shutdown_grace_secs = 2;
    config
}

async fn setup(paper: &Arc<PaperRemote>, clock: Arc<dyn Clock>) -> (Arc<Gateway>, RiskMonitor) {
    let config = monitor_config();
    let ledger = Ledger::open_in_memory().await.unwrap();
    let gateway = Arc::new(Gateway::from_config(&config, paper.clone(), ledger, clock));
    let monitor = RiskMonitor::new(Arc::clone(&gateway), config.monitor);
    (gateway, monitor)
}

#[tokio::test]
async fn test_lost_close_reply_does_not_double_close() {
    let paper = Arc::new(PaperRemote::new());
    paper.set_position(position(PositionSide::Long, dec!(25)));
    paper.set_price(&banknifty(), dec!(480));
    let (gateway, monitor) = setup(&paper, Arc::new(ManualClock::new())).await;
    monitor
        .attach_stop_rule(KEY, StopRule::fixed(KEY, dec!(490)).with_armed_at(1_000))
        .unwrap();

    // First attempt fills but the reply is lost; the retry finds the same order.
    paper.inject(Operation::PlaceOrder, InjectedFailure::AcceptThenStatus(503));
    let report = monitor.run_cycle().await;
    assert_eq!(report.closed, 1);
    assert_eq!(paper.order_count(), 1);
    assert!(paper.position(KEY).is_none());

    let key = IdempotencyKey::new("stop-NSE:BANKNIFTY-1000-0");
    let record = gateway.ledger().get_record(&key).await.unwrap().unwrap();
    assert_eq!(record.status, IdempotencyStatus::Succeeded);
    let trades = gateway.ledger().recent_trades(5).await.unwrap();
    assert_eq!(trades[0].action, LedgerAction::Close);
}

#[tokio::test]
async fn test_unresolved_close_is_reconciled_later() {
    let paper = Arc::new(PaperRemote::new());
    paper.set_position(position(PositionSide::Short, dec!(10)));
    paper.set_price(&banknifty(), dec!(520));
    let (gateway, monitor) = setup(&paper, Arc::new(ManualClock::new())).await;
    monitor
        .attach_stop_rule(KEY, StopRule::fixed(KEY, dec!(510)).with_armed_at(2_000))
        .unwrap();

    paper.inject(Operation::PlaceOrder, InjectedFailure::AcceptThenStatus(503));
    paper.inject(Operation::PlaceOrder, InjectedFailure::Status(503, "busy".into()));
    paper.inject(Operation::PlaceOrder, InjectedFailure::Status(503, "busy".into()));
    for _ in 0..3 {
        paper.inject(Operation::OrderLookup, InjectedFailure::Status(503, "busy".into()));
    }

    let report = monitor.run_cycle().await;
    assert_eq!((report.triggered, report.closed), (1, 0));
    let alerts = monitor.get_alerts(None);
    assert_eq!(alerts[0].category, AlertCategory::Order);
    assert_eq!(alerts[0].severity, Severity::Critical);
    assert!(alerts[0].message.contains("outcome unknown"));

    // The order did fill: the position is gone and the rule is dropped.
    let report = monitor.run_cycle().await;
    assert_eq!(report.removed, 1);

    let reconciled = gateway.reconcile_pending().await.unwrap();
    assert_eq!(reconciled.succeeded, 1);
    assert_eq!(paper.order_count(), 1);
}

#[tokio::test]
async fn test_position_fetch_failure_degrades_to_alert() {
    let paper = Arc::new(PaperRemote::new());
    paper.set_position(position(PositionSide::Long, dec!(1)));
    let (_gateway, monitor) = setup(&paper, Arc::new(ManualClock::new())).await;
    monitor
        .attach_stop_rule(KEY, StopRule::trailing(KEY, TrailDistance::Percent(dec!(2))))
        .unwrap();

    paper.inject(Operation::Positions, InjectedFailure::Status(401, "session expired".into()));
    let report = monitor.run_cycle().await;
    assert_eq!(report.fetch_failures, 1);
    assert_eq!(monitor.get_alerts(None)[0].category, AlertCategory::PriceFetch);
    assert_eq!(monitor.monitored_summary().len(), 1);

    paper.set_price(&banknifty(), dec!(500));
    let report = monitor.run_cycle().await;
    assert_eq!(report.evaluated, 1);
    assert_eq!(monitor.monitored_summary()[0].stop_level, Some(dec!(490)));
}

#[tokio::test]
async fn test_alert_history_is_bounded_and_filtered() {
    let paper = Arc::new(PaperRemote::new());
    paper.set_position(position(PositionSide::Long, dec!(1)));
    let mut config = monitor_config();
    config.monitor.alert_capacity = 3;
    let ledger = Ledger::open_in_memory().await.unwrap();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
    let gateway = Arc::new(Gateway::from_config(&config, paper.clone(), ledger, clock));
    let monitor = RiskMonitor::new(gateway, config.monitor);
    monitor.attach_stop_rule(KEY, StopRule::fixed(KEY, dec!(400))).unwrap();

    // No price set: every cycle raises a price fetch warning.
    for _ in 0..5 {
        monitor.run_cycle().await;
    }
    let alerts = monitor.get_alerts(None);
    assert_eq!(alerts.len(), 3);
    assert!(alerts.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));

    let newest = alerts[0].timestamp;
    assert!(monitor.get_alerts(Some(newest)).is_empty());
}

#[tokio::test]
async fn test_background_loop_closes_and_stops() {
    let paper = Arc::new(PaperRemote::new());
    paper.set_position(position(PositionSide::Long, dec!(15)));
    paper.set_price(&banknifty(), dec!(450));
    let (_gateway, monitor) = setup(&paper, Arc::new(SystemClock)).await;
    let monitor = Arc::new(monitor);
    monitor
        .attach_stop_rule(KEY, StopRule::fixed(KEY, dec!(480)))
        .unwrap();

    monitor.start().unwrap();
    assert!(monitor.is_running());

    let mut closed = false;
    for _ in 0..100 {
        if paper.position(KEY).is_none() {
            closed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(closed);

    assert!(monitor.stop().await);
    assert!(!monitor.is_running());
    assert_eq!(paper.order_count(), 1);
}
