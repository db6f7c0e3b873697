//! Background risk monitor.
//!
//! Every cycle the monitor fetches open positions through the gateway,
//! prices each position carrying a [`StopRule`], and submits a protective
//! close when the rule fires. The close goes through the idempotent order
//! path with key `stop-{position}-{armed_at}-{attempt}`, so re-running a
//! cycle after a crash cannot close twice.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::alerts::{Alert, AlertCategory, AlertLog};
use super::stop_rule::StopRule;
use crate::config::MonitorSettings;
use crate::error::ErrorCode;
use crate::gateway::{Gateway, PlaceOrderRequest, Position, PositionSide};
use crate::ledger::{CLOSE_KEY_PREFIX, IdempotencyKey, IdempotencyStatus, Resolution, Severity};
use crate::observability::{record_monitor_cycle, update_monitored_positions};

/// Set while a monitor loop is running anywhere in the process.
static MONITOR_RUNNING: AtomicBool = AtomicBool::new(false);

/// Position key used for alerts that concern every position.
const ALL_POSITIONS: &str = "*";

/// Risk monitor errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MonitorError {
    /// Another monitor loop is already running in this process.
    #[error("a risk monitor is already running")]
    AlreadyRunning,

    /// Rule parameters are invalid.
    #[error("invalid stop rule for {position_key}: {reason}")]
    InvalidRule {
        /// Position the rule was meant for.
        position_key: String,
        /// What is wrong.
        reason: String,
    },
}

// ============================================================================
// Rule state
// ============================================================================

#[derive(Debug, Clone)]
struct RuleState {
    rule: StopRule,
    side: Option<PositionSide>,
    last_price: Option<Decimal>,
    last_checked: Option<DateTime<Utc>>,
    triggered: bool,
    close_attempt: u32,
}

impl RuleState {
    const fn new(rule: StopRule) -> Self {
        Self {
            rule,
            side: None,
            last_price: None,
            last_checked: None,
            triggered: false,
            close_attempt: 0,
        }
    }
}

/// One monitored rule, for operator display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitoredPosition {
    /// Position key.
    pub position_key: String,
    /// `FIXED` or `TRAILING`.
    pub kind: &'static str,
    /// Side seen on the last cycle.
    pub side: Option<PositionSide>,
    /// Last evaluated price.
    pub last_price: Option<Decimal>,
    /// Trailing water mark.
    pub water_mark: Option<Decimal>,
    /// Current stop level.
    pub stop_level: Option<Decimal>,
    /// Whether a close has been placed.
    pub triggered: bool,
    /// Arming time (unix seconds).
    pub armed_at: i64,
    /// Close attempts that definitively failed.
    pub close_attempt: u32,
    /// Last evaluation time.
    pub last_checked: Option<DateTime<Utc>>,
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Rules evaluated against a fresh price.
    pub evaluated: usize,
    /// Rules that fired.
    pub triggered: usize,
    /// Protective closes confirmed.
    pub closed: usize,
    /// Rules removed because the position is gone.
    pub removed: usize,
    /// Price or position fetch failures.
    pub fetch_failures: usize,
}

enum CloseOutcome {
    Placed(Option<String>),
    /// The order definitively did not happen under this key.
    Failed(String),
    /// Rejected before anything was recorded (rate limit, open circuit).
    NotSent(String),
    /// The remote may or may not have it.
    Unresolved(String),
}

struct Worker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Clears [`MONITOR_RUNNING`] when the loop future is dropped.
struct RunningGuard;

impl Drop for RunningGuard {
    fn drop(&mut self) {
        MONITOR_RUNNING.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// RiskMonitor
// ============================================================================

/// Periodic stop-loss evaluation over gateway positions.
pub struct RiskMonitor {
    gateway: Arc<Gateway>,
    settings: MonitorSettings,
    rules: Mutex<BTreeMap<String, RuleState>>,
    alerts: AlertLog,
    worker: Mutex<Option<Worker>>,
}

impl std::fmt::Debug for RiskMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskMonitor")
            .field("rules", &self.rules.lock().len())
            .field("alerts", &self.alerts.len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl RiskMonitor {
    /// Create a stopped monitor.
    #[must_use]
    pub fn new(gateway: Arc<Gateway>, settings: MonitorSettings) -> Self {
        Self {
            alerts: AlertLog::new(settings.alert_capacity),
            gateway,
            settings,
            rules: Mutex::new(BTreeMap::new()),
            worker: Mutex::new(None),
        }
    }

    /// Attach (or replace) the stop rule for `position_key`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRule` if the rule parameters are invalid.
    pub fn attach_stop_rule(
        &self,
        position_key: &str,
        mut rule: StopRule,
    ) -> Result<(), MonitorError> {
        rule.validate().map_err(|reason| MonitorError::InvalidRule {
            position_key: position_key.to_string(),
            reason,
        })?;
        rule.position_key = position_key.to_string();

        info!(
            position_key = %position_key,
            kind = rule.kind_name(),
            armed_at = rule.armed_at,
            "Stop rule attached"
        );
        let mut rules = self.rules.lock();
        rules.insert(position_key.to_string(), RuleState::new(rule));
        update_monitored_positions(rules.len());
        Ok(())
    }

    /// Detach the rule for `position_key`, returning it.
    pub fn remove_stop_rule(&self, position_key: &str) -> Option<StopRule> {
        let mut rules = self.rules.lock();
        let removed = rules.remove(position_key).map(|state| state.rule);
        update_monitored_positions(rules.len());
        if removed.is_some() {
            info!(position_key = %position_key, "Stop rule removed");
        }
        removed
    }

    /// Alerts newer than `since`, most recent first.
    #[must_use]
    pub fn get_alerts(&self, since: Option<DateTime<Utc>>) -> Vec<Alert> {
        self.alerts.since(since)
    }

    /// Every rule with its latest evaluation state.
    #[must_use]
    pub fn monitored_summary(&self) -> Vec<MonitoredPosition> {
        self.rules
            .lock()
            .iter()
            .map(|(key, state)| MonitoredPosition {
                position_key: key.clone(),
                kind: state.rule.kind_name(),
                side: state.side,
                last_price: state.last_price,
                water_mark: state.rule.water_mark(),
                stop_level: state.side.and_then(|side| state.rule.level(side)),
                triggered: state.triggered,
                armed_at: state.rule.armed_at,
                close_attempt: state.close_attempt,
                last_checked: state.last_checked,
            })
            .collect()
    }

    /// Whether this monitor's loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawn the evaluation loop.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` if any monitor loop is running in the process.
    pub fn start(self: &Arc<Self>) -> Result<(), MonitorError> {
        if MONITOR_RUNNING
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(MonitorError::AlreadyRunning);
        }
        let guard = RunningGuard;

        let token = CancellationToken::new();
        let monitor = Arc::clone(self);
        let cancelled = token.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            monitor.run_loop(cancelled).await;
        });

        *self.worker.lock() = Some(Worker { token, handle });
        info!(
            poll_interval_secs = self.settings.poll_interval_secs,
            "Risk monitor started"
        );
        Ok(())
    }

    /// Signal the loop to stop and wait up to the shutdown grace period.
    ///
    /// Returns `false` if the monitor was not running.
    pub async fn stop(&self) -> bool {
        let Some(worker) = self.worker.lock().take() else {
            return false;
        };
        worker.token.cancel();

        let mut handle = worker.handle;
        if tokio::time::timeout(self.settings.shutdown_grace(), &mut handle)
            .await
            .is_err()
        {
            warn!(
                grace_secs = self.settings.shutdown_grace_secs,
                "Risk monitor did not stop within grace period, aborting"
            );
            handle.abort();
            let _ = handle.await;
        }
        info!("Risk monitor stopped");
        true
    }

    async fn run_loop(&self, cancelled: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancelled.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
            }
        }
        debug!("Risk monitor loop exited");
    }

    // ========================================================================
    // Evaluation
    // ========================================================================

    /// Run one evaluation cycle over every attached rule.
    ///
    /// Failures never escape: they become alerts and the next cycle retries.
    pub async fn run_cycle(&self) -> CycleReport {
        let started = self.gateway.clock().now();
        let mut report = CycleReport::default();

        if self.rules.lock().is_empty() {
            return report;
        }

        let positions = match self.gateway.positions().await {
            Ok(positions) => positions,
            Err(e) => {
                report.fetch_failures += 1;
                self.alert(
                    ALL_POSITIONS,
                    Severity::Warning,
                    AlertCategory::PriceFetch,
                    format!("position fetch failed: {}", e.user_message()),
                );
                self.finish_cycle(started);
                return report;
            }
        };
        let by_key: HashMap<String, Position> =
            positions.into_iter().map(|p| (p.key(), p)).collect();

        let keys: Vec<String> = self.rules.lock().keys().cloned().collect();
        for key in keys {
            let Some(position) = by_key.get(&key) else {
                if self.rules.lock().remove(&key).is_some() {
                    report.removed += 1;
                    self.alert(
                        &key,
                        Severity::Info,
                        AlertCategory::Position,
                        "position no longer open, stop rule removed",
                    );
                }
                continue;
            };
            self.evaluate_position(&key, position, &mut report).await;
        }

        update_monitored_positions(self.rules.lock().len());
        self.finish_cycle(started);
        report
    }

    async fn evaluate_position(&self, key: &str, position: &Position, report: &mut CycleReport) {
        if self.rules.lock().get(key).is_none_or(|s| s.triggered) {
            return;
        }

        let price = match self.gateway.last_price(&position.instrument).await {
            Ok(price) => price,
            Err(e) => {
                report.fetch_failures += 1;
                self.alert(
                    key,
                    Severity::Warning,
                    AlertCategory::PriceFetch,
                    format!("price fetch failed: {}", e.user_message()),
                );
                return;
            }
        };

        let (evaluation, armed_at, attempt) = {
            let mut rules = self.rules.lock();
            let Some(state) = rules.get_mut(key) else {
                return;
            };
            let evaluation = state.rule.evaluate(position.side, price);
            state.side = Some(position.side);
            state.last_price = Some(price);
            state.last_checked = Some(Utc::now());
            (evaluation, state.rule.armed_at, state.close_attempt)
        };
        report.evaluated += 1;
        debug!(
            position_key = %key,
            price = %price,
            stop_level = %evaluation.level(),
            "Stop rule evaluated"
        );

        if !evaluation.is_triggered() {
            return;
        }
        report.triggered += 1;
        self.alert(
            key,
            Severity::Critical,
            AlertCategory::StopLoss,
            format!(
                "{} stop triggered at {price} (level {}), closing {} {}",
                position.side,
                evaluation.level(),
                position.quantity,
                position.instrument.stock_code
            ),
        );

        let close_key =
            IdempotencyKey::new(format!("{CLOSE_KEY_PREFIX}{key}-{armed_at}-{attempt}"));
        match self.close(position, &close_key).await {
            CloseOutcome::Placed(order_id) => {
                report.closed += 1;
                if let Some(state) = self.rules.lock().get_mut(key) {
                    state.triggered = true;
                }
                self.alert(
                    key,
                    Severity::Info,
                    AlertCategory::Order,
                    format!(
                        "close order placed: {}",
                        order_id.as_deref().unwrap_or("unknown id")
                    ),
                );
            }
            CloseOutcome::Failed(reason) => {
                if let Some(state) = self.rules.lock().get_mut(key) {
                    state.close_attempt += 1;
                }
                self.alert(
                    key,
                    Severity::Critical,
                    AlertCategory::Order,
                    format!("close order failed, retrying next cycle: {reason}"),
                );
            }
            CloseOutcome::NotSent(reason) => self.alert(
                key,
                Severity::Warning,
                AlertCategory::Order,
                format!("close order not sent, retrying next cycle: {reason}"),
            ),
            CloseOutcome::Unresolved(reason) => self.alert(
                key,
                Severity::Critical,
                AlertCategory::Order,
                format!("close order outcome unknown ({close_key}): {reason}"),
            ),
        }
    }

    async fn close(&self, position: &Position, key: &IdempotencyKey) -> CloseOutcome {
        let request = PlaceOrderRequest::market(
            position.instrument.clone(),
            position.side.closing_side(),
            position.quantity,
        );
        let response = self.gateway.close_position(&request, key).await;
        if response.success {
            return CloseOutcome::Placed(
                response
                    .data
                    .get("order_id")
                    .and_then(|id| id.as_str())
                    .map(str::to_string),
            );
        }

        if response.error_code == Some(ErrorCode::ReconciliationAmbiguous) {
            return match self.gateway.reconcile_key(key).await {
                Ok(Resolution::Succeeded(record)) => CloseOutcome::Placed(record.remote_order_id),
                Ok(Resolution::AlreadyFinal(record))
                    if record.status == IdempotencyStatus::Succeeded =>
                {
                    CloseOutcome::Placed(record.remote_order_id)
                }
                Ok(Resolution::Failed(record) | Resolution::AlreadyFinal(record)) => {
                    CloseOutcome::Failed(record.error_message.unwrap_or(response.message))
                }
                Ok(Resolution::Ambiguous { reason, .. }) => CloseOutcome::Unresolved(reason),
                Err(e) => CloseOutcome::Unresolved(e.user_message()),
            };
        }

        match self.gateway.ledger().get_record(key).await {
            Ok(Some(record)) => match record.status {
                IdempotencyStatus::Failed => CloseOutcome::Failed(response.message),
                IdempotencyStatus::Succeeded => CloseOutcome::Placed(record.remote_order_id),
                IdempotencyStatus::Pending => CloseOutcome::Unresolved(response.message),
            },
            Ok(None) => CloseOutcome::NotSent(response.message),
            Err(e) => CloseOutcome::Unresolved(e.to_string()),
        }
    }

    fn alert(
        &self,
        position_key: &str,
        severity: Severity,
        category: AlertCategory,
        message: impl Into<String>,
    ) {
        self.alerts
            .push(Alert::new(position_key, severity, category, message));
    }

    fn finish_cycle(&self, started: tokio::time::Instant) {
        let elapsed = self
            .gateway
            .clock()
            .now()
            .saturating_duration_since(started);
        record_monitor_cycle(elapsed.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rust_decimal_macros::dec;

    use super::*;
    use crate::config::Config;
    use crate::gateway::{Instrument, Operation};
    use crate::infrastructure::{InjectedFailure, PaperRemote};
    use crate::ledger::Ledger;
    use crate::monitor::TrailDistance;
    use crate::resilience::{Clock, ManualClock};

    fn nifty() -> Instrument {
        Instrument::equity("NIFTY", "NSE")
    }

    fn long_nifty(quantity: Decimal) -> Position {
        Position {
            instrument: nifty(),
            quantity,
            side: PositionSide::Long,
            avg_entry_price: dec!(100),
        }
    }

    async fn monitor_over(paper: &Arc<PaperRemote>) -> RiskMonitor {
        let mut config = Config::default();
        config.cache.quote = 0;
        config.cache.positions = 0;
        config.retry.max_attempts = 1;
        config.ledger.lookup_attempts = 1;
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let ledger = Ledger::open_in_memory().await.unwrap();
        let gateway = Gateway::from_config(&config, paper.clone(), ledger, clock);
        RiskMonitor::new(Arc::new(gateway), config.monitor)
    }

    #[tokio::test]
    async fn test_trailing_stop_closes_long_position() {
        let paper = Arc::new(PaperRemote::new());
        paper.set_position(long_nifty(dec!(10)));
        let monitor = monitor_over(&paper).await;
        monitor
            .attach_stop_rule("NSE:NIFTY", StopRule::trailing("", TrailDistance::Points(dec!(10))))
            .unwrap();

        for price in [dec!(100), dec!(110), dec!(105)] {
            paper.set_price(&nifty(), price);
            let report = monitor.run_cycle().await;
            assert_eq!(report.triggered, 0);
        }

        paper.set_price(&nifty(), dec!(95));
        let report = monitor.run_cycle().await;
        assert_eq!(report.triggered, 1);
        assert_eq!(report.closed, 1);
        assert!(paper.position("NSE:NIFTY").is_none());

        let summary = monitor.monitored_summary();
        assert!(summary[0].triggered);
        assert_eq!(summary[0].water_mark, Some(dec!(110)));

        let alerts = monitor.get_alerts(None);
        assert_eq!(alerts[0].category, AlertCategory::Order);
        assert_eq!(alerts[1].category, AlertCategory::StopLoss);
        assert_eq!(alerts[1].severity, Severity::Critical);

        // Position gone: the rule is dropped on the next cycle.
        let report = monitor.run_cycle().await;
        assert_eq!(report.removed, 1);
        assert!(monitor.monitored_summary().is_empty());
    }

    #[tokio::test]
    async fn test_short_fixed_stop_buys_to_close() {
        let paper = Arc::new(PaperRemote::new());
        paper.set_position(Position {
            side: PositionSide::Short,
            ..long_nifty(dec!(5))
        });
        let monitor = monitor_over(&paper).await;
        let rule = StopRule::fixed("NSE:NIFTY", dec!(105)).with_armed_at(42);
        monitor.attach_stop_rule("NSE:NIFTY", rule).unwrap();

        paper.set_price(&nifty(), dec!(90));
        assert_eq!(monitor.run_cycle().await.triggered, 0);

        paper.set_price(&nifty(), dec!(106));
        assert_eq!(monitor.run_cycle().await.closed, 1);
        assert!(paper.order_for_client_id("stop-NSE:NIFTY-42-0").is_some());
        assert!(paper.position("NSE:NIFTY").is_none());
    }

    #[tokio::test]
    async fn test_price_fetch_failure_becomes_warning() {
        let paper = Arc::new(PaperRemote::new());
        paper.set_position(long_nifty(dec!(1)));
        let monitor = monitor_over(&paper).await;
        monitor
            .attach_stop_rule("NSE:NIFTY", StopRule::fixed("", dec!(90)))
            .unwrap();

        paper.inject(Operation::Quote, InjectedFailure::Status(503, "down".into()));
        let report = monitor.run_cycle().await;
        assert_eq!(report.fetch_failures, 1);
        let alerts = monitor.get_alerts(None);
        assert_eq!(alerts[0].severity, Severity::Warning);
        assert_eq!(alerts[0].category, AlertCategory::PriceFetch);

        // Next cycle recovers.
        paper.set_price(&nifty(), dec!(100));
        assert_eq!(monitor.run_cycle().await.evaluated, 1);
    }

    #[tokio::test]
    async fn test_rejected_close_uses_fresh_key_next_cycle() {
        let paper = Arc::new(PaperRemote::new());
        paper.set_position(long_nifty(dec!(3)));
        paper.set_price(&nifty(), dec!(80));
        let monitor = monitor_over(&paper).await;
        let rule = StopRule::fixed("NSE:NIFTY", dec!(90)).with_armed_at(7);
        monitor.attach_stop_rule("NSE:NIFTY", rule).unwrap();

        paper.inject(Operation::PlaceOrder, InjectedFailure::Status(400, "bad lot".into()));
        let first = monitor.run_cycle().await;
        assert_eq!((first.triggered, first.closed), (1, 0));
        assert_eq!(monitor.monitored_summary()[0].close_attempt, 1);

        let second = monitor.run_cycle().await;
        assert_eq!(second.closed, 1);
        assert!(paper.order_for_client_id("stop-NSE:NIFTY-7-1").is_some());
    }

    #[tokio::test]
    async fn test_invalid_rule_rejected() {
        let paper = Arc::new(PaperRemote::new());
        let monitor = monitor_over(&paper).await;
        let err = monitor
            .attach_stop_rule("K", StopRule::trailing("K", TrailDistance::Percent(dec!(0))))
            .unwrap_err();
        assert!(matches!(err, MonitorError::InvalidRule { .. }));
        assert!(monitor.remove_stop_rule("K").is_none());
    }

    #[tokio::test]
    async fn test_single_running_monitor_per_process() {
        let paper = Arc::new(PaperRemote::new());
        let first = Arc::new(monitor_over(&paper).await);
        let second = Arc::new(monitor_over(&paper).await);

        first.start().unwrap();
        assert_eq!(second.start(), Err(MonitorError::AlreadyRunning));
        assert!(first.stop().await);
        assert!(!first.stop().await);

        second.start().unwrap();
        assert!(second.is_running());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(second.stop().await);
    }
}
