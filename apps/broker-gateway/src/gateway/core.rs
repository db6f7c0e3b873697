//! Gateway pipeline.
//!
//! Every operation runs the same pipeline:
//!
//! 1. serve from the response cache when the operation is cacheable
//! 2. take rate tokens (weighted per operation)
//! 3. obtain a circuit breaker permit
//! 4. call the remote under a per-attempt timeout, retrying transient
//!    failures with backoff (each retry takes a fresh token)
//! 5. resolve the permit, fill the cache or invalidate stale reads
//!
//! Order placement is additionally keyed by an idempotency key: the key is
//! locked, recorded PENDING before the first remote attempt, and finalized
//! together with its ledger entry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::operation::Operation;
use super::remote::{RemoteApi, RemoteFailure, classify_reply};
use super::status::{CallStats, ConnectionStatus};
use super::types::{
    ApiResponse, DateRange, HistoryRequest, Instrument, ModifyOrderRequest, OptionChainRequest,
    PlaceOrderRequest, Position, extract_price, params, parse_positions,
};
use crate::config::{CacheSettings, Config};
use crate::error::{ErrorCode, GatewayError};
use crate::ledger::{
    BeginOutcome, IdempotencyKey, IdempotencyRecord, IdempotencyStatus, Ledger, LedgerAction,
    LedgerEntry, LookupResult, OrderLookup, Outcome, ReconciliationReport, Reconciler, Resolution,
};
use crate::observability::{record_cache_lookup, record_gateway_call, record_retry};
use crate::resilience::{
    CacheKey, CallPermit, CircuitBreaker, Clock, FailureClass, ResponseCache, RetryPolicy,
    TokenBucketLimiter,
};

/// Breaker name used for the remote API.
pub const REMOTE_BREAKER_NAME: &str = "remote";

// ============================================================================
// Construction
// ============================================================================

/// Resilience primitives owned by one gateway.
#[derive(Debug, Clone)]
pub struct GatewayComponents {
    /// Token bucket shared by every operation.
    pub limiter: Arc<TokenBucketLimiter>,
    /// Breaker guarding the remote.
    pub breaker: Arc<CircuitBreaker>,
    /// Response cache.
    pub cache: Arc<ResponseCache>,
    /// Retry policy for transient failures.
    pub retry: RetryPolicy,
}

impl GatewayComponents {
    /// Build every primitive from configuration.
    #[must_use]
    pub fn from_config(config: &Config, clock: &Arc<dyn Clock>) -> Self {
        Self {
            limiter: Arc::new(TokenBucketLimiter::new(
                config.rate_limit.capacity,
                config.rate_limit.refill_per_second,
                Arc::clone(clock),
            )),
            breaker: Arc::new(CircuitBreaker::new(
                REMOTE_BREAKER_NAME,
                config.circuit_breaker.to_resilience_config(),
                Arc::clone(clock),
            )),
            cache: Arc::new(ResponseCache::new(
                config.cache.max_entries,
                Arc::clone(clock),
            )),
            retry: config.retry.to_policy(),
        }
    }
}

/// Timeouts and windows used by the pipeline.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Longest wait for rate tokens.
    pub acquire_timeout: Duration,
    /// Per-attempt remote call timeout.
    pub call_timeout: Duration,
    /// Per-operation cache TTLs.
    pub cache: CacheSettings,
    /// Lookups made when reconciling a PENDING record at startup.
    pub lookup_attempts: u32,
    /// Spacing between those lookups.
    pub lookup_interval: Duration,
}

impl GatewaySettings {
    /// Extract the pipeline settings from configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            acquire_timeout: config.rate_limit.acquire_timeout(),
            call_timeout: config.remote.call_timeout(),
            cache: config.cache.clone(),
            lookup_attempts: config.ledger.lookup_attempts,
            lookup_interval: config.ledger.lookup_interval(),
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

// ============================================================================
// Pipeline internals
// ============================================================================

/// Why a single attempt failed.
struct AttemptFailure {
    class: FailureClass,
    status: Option<u16>,
    message: String,
}

impl From<RemoteFailure> for AttemptFailure {
    fn from(failure: RemoteFailure) -> Self {
        Self {
            class: failure.class(),
            status: None,
            message: failure.to_string(),
        }
    }
}

/// The retry loop gave up.
struct Exhausted {
    error: GatewayError,
    attempts: u32,
}

/// Remote order id carried by a placement or lookup payload.
fn remote_order_id(payload: &Value) -> Option<String> {
    match payload.get(params::ORDER_ID)? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn order_data(record: &IdempotencyRecord) -> Value {
    json!({
        "order_id": record.remote_order_id,
        "idempotency_key": record.key,
        "status": record.status,
    })
}

// ============================================================================
// Gateway
// ============================================================================

/// Resilient access to the remote brokerage.
pub struct Gateway {
    remote: Arc<dyn RemoteApi>,
    ledger: Ledger,
    limiter: Arc<TokenBucketLimiter>,
    breaker: Arc<CircuitBreaker>,
    cache: Arc<ResponseCache>,
    retry: RetryPolicy,
    settings: GatewaySettings,
    clock: Arc<dyn Clock>,
    started_at: Instant,
    stats: CallStats,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("breaker", &self.breaker.state())
            .field("tokens", &self.limiter.available())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Create a gateway from explicit components.
    #[must_use]
    pub fn new(
        remote: Arc<dyn RemoteApi>,
        ledger: Ledger,
        components: GatewayComponents,
        settings: GatewaySettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            remote,
            ledger,
            limiter: components.limiter,
            breaker: components.breaker,
            cache: components.cache,
            retry: components.retry,
            settings,
            started_at: clock.now(),
            clock,
            stats: CallStats::default(),
        }
    }

    /// Create a gateway with every component built from configuration.
    #[must_use]
    pub fn from_config(
        config: &Config,
        remote: Arc<dyn RemoteApi>,
        ledger: Ledger,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let components = GatewayComponents::from_config(config, &clock);
        Self::new(remote, ledger, components, GatewaySettings::from_config(config), clock)
    }

    /// Durable ledger.
    #[must_use]
    pub const fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Circuit breaker guarding the remote.
    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Response cache.
    #[must_use]
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Rate limiter.
    #[must_use]
    pub fn limiter(&self) -> &TokenBucketLimiter {
        &self.limiter
    }

    /// Clock shared by every component.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Run `op` through the full pipeline.
    ///
    /// # Errors
    ///
    /// Returns the classified failure when no payload could be obtained.
    pub async fn call(
        &self,
        op: Operation,
        params: BTreeMap<String, String>,
    ) -> Result<Value, GatewayError> {
        let started = self.clock.now();
        self.stats.record_call();

        let cacheable = op
            .ttl(&self.settings.cache)
            .map(|ttl| (CacheKey::new(op.endpoint(), &params), ttl));

        if let Some((key, _)) = &cacheable {
            if let Some(hit) = self.cache.get(key) {
                trace!(endpoint = op.endpoint(), key = %key, "Cache hit");
                record_cache_lookup(op.endpoint(), true);
                record_gateway_call(op.endpoint(), "cached", self.elapsed_secs(started));
                return Ok(hit);
            }
            record_cache_lookup(op.endpoint(), false);
        }

        let result = match self.admit(op).await {
            Ok(permit) => self
                .run_attempts(op, &params, permit)
                .await
                .map_err(|exhausted| exhausted.error),
            Err(e) => Err(e),
        };

        match &result {
            Ok(payload) => {
                if let Some((key, ttl)) = cacheable {
                    self.cache.put(key, payload.clone(), ttl);
                }
                self.invalidate_after(op);
                record_gateway_call(op.endpoint(), "ok", self.elapsed_secs(started));
            }
            Err(e) => {
                self.stats.record_failure(e.code());
                record_gateway_call(op.endpoint(), e.code().reason(), self.elapsed_secs(started));
            }
        }
        result
    }

    fn elapsed_secs(&self, started: Instant) -> f64 {
        self.clock.now().saturating_duration_since(started).as_secs_f64()
    }

    async fn admit(&self, op: Operation) -> Result<CallPermit<'_>, GatewayError> {
        self.limiter
            .acquire(op.token_cost(), self.settings.acquire_timeout)
            .await?;
        Ok(self.breaker.try_acquire()?)
    }

    async fn attempt(
        &self,
        op: Operation,
        params: &BTreeMap<String, String>,
    ) -> Result<Value, AttemptFailure> {
        self.stats.record_remote_attempt();
        let call = self.remote.call(op.endpoint(), params);
        match tokio::time::timeout(self.settings.call_timeout, call).await {
            Err(_) => Err(RemoteFailure::Timeout.into()),
            Ok(Err(failure)) => Err(failure.into()),
            Ok(Ok(reply)) if reply.is_success() => Ok(reply.payload),
            Ok(Ok(reply)) => Err(AttemptFailure {
                class: classify_reply(&reply),
                status: Some(reply.status),
                message: reply.error_message(),
            }),
        }
    }

    async fn run_attempts(
        &self,
        op: Operation,
        params: &BTreeMap<String, String>,
        permit: CallPermit<'_>,
    ) -> Result<Value, Exhausted> {
        let endpoint = op.endpoint();
        let mut attempt = 1;

        loop {
            let failure = match self.attempt(op, params).await {
                Ok(payload) => {
                    permit.succeed();
                    debug!(endpoint, attempt, "Remote call succeeded");
                    return Ok(payload);
                }
                Err(failure) => failure,
            };

            if failure.class == FailureClass::Permanent {
                // The remote answered; its health is not in question.
                permit.succeed();
                let error = GatewayError::PermanentRemote {
                    endpoint: endpoint.to_string(),
                    status: failure.status,
                    message: failure.message,
                };
                error!(endpoint, attempt, error = %error.user_message(), "Permanent remote error");
                return Err(Exhausted {
                    error,
                    attempts: attempt,
                });
            }

            if !self.retry.should_retry(failure.class, attempt) {
                permit.fail();
                let error = GatewayError::TransientRemote {
                    endpoint: endpoint.to_string(),
                    attempts: attempt,
                    status: failure.status,
                    message: failure.message,
                };
                warn!(endpoint, attempts = attempt, error = %error.user_message(), "Retries exhausted");
                return Err(Exhausted {
                    error,
                    attempts: attempt,
                });
            }

            let delay = self.retry.backoff(attempt - 1);
            warn!(
                endpoint,
                attempt,
                delay_ms = delay.as_millis() as u64,
                status = ?failure.status,
                error = %crate::error::redact(&failure.message),
                "Transient remote error, retrying"
            );
            record_retry(endpoint);
            self.clock.sleep(delay).await;

            if let Err(timeout) = self
                .limiter
                .acquire(op.token_cost(), self.settings.acquire_timeout)
                .await
            {
                return Err(Exhausted {
                    error: timeout.into(),
                    attempts: attempt,
                });
            }
            attempt += 1;
        }
    }

    fn invalidate_after(&self, op: Operation) {
        for stale in op.invalidates() {
            let removed = self.cache.invalidate_endpoint(stale.endpoint());
            if removed > 0 {
                trace!(endpoint = stale.endpoint(), removed, "Invalidated cached reads");
            }
        }
    }

    fn respond(&self, result: Result<Value, GatewayError>) -> ApiResponse {
        ApiResponse::from_result(result)
    }

    fn reject(&self, error: &GatewayError) -> ApiResponse {
        self.stats.record_failure(error.code());
        ApiResponse::err(error)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Latest quote for `instrument`.
    pub async fn get_quote(&self, instrument: &Instrument) -> ApiResponse {
        let mut p = BTreeMap::new();
        instrument.write_params(&mut p);
        self.respond(self.call(Operation::Quote, p).await)
    }

    /// Last traded price for `instrument`.
    ///
    /// # Errors
    ///
    /// Returns the pipeline error, or `PermanentRemote` when the quote has no price.
    pub async fn last_price(&self, instrument: &Instrument) -> Result<Decimal, GatewayError> {
        let mut p = BTreeMap::new();
        instrument.write_params(&mut p);
        let payload = self.call(Operation::Quote, p).await?;
        extract_price(&payload).ok_or_else(|| GatewayError::PermanentRemote {
            endpoint: Operation::Quote.endpoint().to_string(),
            status: None,
            message: format!("quote for {} carries no price", instrument.key()),
        })
    }

    /// Spot price of a cash-segment underlying.
    pub async fn get_spot_price(&self, stock_code: &str, exchange_code: &str) -> ApiResponse {
        let instrument = Instrument::equity(stock_code, exchange_code);
        match self.last_price(&instrument).await {
            Ok(price) => ApiResponse::ok(json!({
                "stock_code": stock_code,
                "exchange_code": exchange_code,
                "ltp": price,
            })),
            Err(e) => ApiResponse::err(&e),
        }
    }

    /// Option chain.
    pub async fn get_option_chain(&self, request: &OptionChainRequest) -> ApiResponse {
        if request.expiry.trim().is_empty() {
            return self.reject(&GatewayError::invalid_request("expiry is required"));
        }
        self.respond(self.call(Operation::OptionChain, request.to_params()).await)
    }

    /// Open positions as a raw payload.
    pub async fn get_positions(&self) -> ApiResponse {
        self.respond(self.call(Operation::Positions, BTreeMap::new()).await)
    }

    /// Open positions, parsed.
    ///
    /// # Errors
    ///
    /// Returns the pipeline error, or `PermanentRemote` when the payload is malformed.
    pub async fn positions(&self) -> Result<Vec<Position>, GatewayError> {
        let payload = self.call(Operation::Positions, BTreeMap::new()).await?;
        parse_positions(&payload).map_err(|e| GatewayError::PermanentRemote {
            endpoint: Operation::Positions.endpoint().to_string(),
            status: None,
            message: format!("malformed positions payload: {e}"),
        })
    }

    /// Funds and balances.
    pub async fn get_funds(&self) -> ApiResponse {
        self.respond(self.call(Operation::Funds, BTreeMap::new()).await)
    }

    /// Margin for an exchange.
    pub async fn get_margin(&self, exchange_code: &str) -> ApiResponse {
        let mut p = BTreeMap::new();
        p.insert(params::EXCHANGE_CODE.to_string(), exchange_code.to_string());
        self.respond(self.call(Operation::Margin, p).await)
    }

    /// Historical candles.
    pub async fn get_history(&self, request: &HistoryRequest) -> ApiResponse {
        if let Err(e) = request.validate() {
            return self.reject(&e);
        }
        self.respond(self.call(Operation::History, request.to_params()).await)
    }

    /// Detail of one order.
    pub async fn get_order_detail(&self, order_id: &str, exchange_code: &str) -> ApiResponse {
        let mut p = BTreeMap::new();
        p.insert(params::ORDER_ID.to_string(), order_id.to_string());
        p.insert(params::EXCHANGE_CODE.to_string(), exchange_code.to_string());
        self.respond(self.call(Operation::OrderDetail, p).await)
    }

    /// Orders in a date range.
    pub async fn get_order_list(&self, range: &DateRange) -> ApiResponse {
        self.respond(self.call(Operation::OrderList, range.to_params()).await)
    }

    /// Trades in a date range.
    pub async fn get_trade_list(&self, range: &DateRange) -> ApiResponse {
        self.respond(self.call(Operation::TradeList, range.to_params()).await)
    }

    /// Customer profile.
    pub async fn get_customer_details(&self) -> ApiResponse {
        self.respond(self.call(Operation::CustomerDetails, BTreeMap::new()).await)
    }

    // ========================================================================
    // Orders
    // ========================================================================

    /// Place an order at most once per idempotency key.
    ///
    /// A key is generated when none is supplied. Repeating a completed key
    /// returns the stored outcome with `DUPLICATE_REQUEST`; repeating a key
    /// whose outcome is unresolved returns `RECONCILIATION_AMBIGUOUS`.
    pub async fn place_order(
        &self,
        request: &PlaceOrderRequest,
        key: Option<IdempotencyKey>,
    ) -> ApiResponse {
        let key = key.unwrap_or_else(IdempotencyKey::generate);
        self.submit_order(request, &key, LedgerAction::Place).await
    }

    /// Place a protective close; recorded in the ledger as `CLOSE`.
    pub async fn close_position(
        &self,
        request: &PlaceOrderRequest,
        key: &IdempotencyKey,
    ) -> ApiResponse {
        self.submit_order(request, key, LedgerAction::Close).await
    }

    async fn submit_order(
        &self,
        request: &PlaceOrderRequest,
        key: &IdempotencyKey,
        action: LedgerAction,
    ) -> ApiResponse {
        match self.submit_order_inner(request, key, action).await {
            Ok(response) => response,
            Err(e) => self
                .reject(&e)
                .with_data(json!({ "idempotency_key": key })),
        }
    }

    async fn submit_order_inner(
        &self,
        request: &PlaceOrderRequest,
        key: &IdempotencyKey,
        action: LedgerAction,
    ) -> Result<ApiResponse, GatewayError> {
        request.validate()?;
        self.stats.record_call();

        let fingerprint = request.fingerprint();
        let _guard = self.ledger.lock_key(key).await;

        if let Some(existing) = self.ledger.get_record(key).await? {
            return Self::duplicate_response(&existing, &fingerprint);
        }

        let started = self.clock.now();
        let permit = self.admit(Operation::PlaceOrder).await?;

        if let BeginOutcome::Duplicate(existing) = self.ledger.begin(key, &fingerprint).await? {
            drop(permit);
            return Self::duplicate_response(&existing, &fingerprint);
        }

        let mut order_params = request.to_params();
        order_params.insert(params::CLIENT_ORDER_ID.to_string(), key.to_string());
        info!(
            idempotency_key = %key,
            instrument = %request.instrument.key(),
            side = %request.side,
            quantity = %request.quantity,
            "Submitting order"
        );

        let result = self
            .run_attempts(Operation::PlaceOrder, &order_params, permit)
            .await;
        let elapsed = self.elapsed_secs(started);

        match result {
            Ok(payload) => {
                self.invalidate_after(Operation::PlaceOrder);
                if let Some(remote_id) = remote_order_id(&payload) {
                    record_gateway_call(Operation::PlaceOrder.endpoint(), "ok", elapsed);
                    let outcome = Outcome::Succeeded {
                        remote_order_id: remote_id,
                    };
                    let record = self.finalize(key, action, request, &outcome).await?;
                    info!(idempotency_key = %key, remote_order_id = ?record.remote_order_id, "Order placed");
                    return Ok(ApiResponse::ok(order_data(&record)));
                }
                warn!(idempotency_key = %key, "Order accepted without an order id, looking it up");
                let exhausted = Exhausted {
                    error: GatewayError::TransientRemote {
                        endpoint: Operation::PlaceOrder.endpoint().to_string(),
                        attempts: 1,
                        status: None,
                        message: "reply carried no order id".to_string(),
                    },
                    attempts: 1,
                };
                self.resolve_ambiguous(key, exhausted).await
            }
            Err(Exhausted {
                error: error @ GatewayError::PermanentRemote { .. },
                ..
            }) => {
                record_gateway_call(Operation::PlaceOrder.endpoint(), error.code().reason(), elapsed);
                let outcome = Outcome::Failed {
                    reason: error.user_message(),
                };
                self.finalize(key, action, request, &outcome).await?;
                Err(error)
            }
            Err(exhausted) => {
                record_gateway_call(
                    Operation::PlaceOrder.endpoint(),
                    exhausted.error.code().reason(),
                    elapsed,
                );
                self.resolve_ambiguous(key, exhausted).await
            }
        }
    }

    async fn finalize(
        &self,
        key: &IdempotencyKey,
        action: LedgerAction,
        request: &PlaceOrderRequest,
        outcome: &Outcome,
    ) -> Result<IdempotencyRecord, GatewayError> {
        let entry = LedgerEntry::for_order(key, action, request, outcome);
        self.ledger
            .complete(key, outcome, Some(&entry))
            .await
            .map_err(|e| {
                error!(idempotency_key = %key, error = %e, "Failed to finalize order record");
                GatewayError::Persistence {
                    message: format!(
                        "order outcome known but not recorded, will be reconciled: {e}"
                    ),
                }
            })
    }

    /// The remote may or may not have the order. Wait one lookup interval
    /// for a late acceptance to land, then ask once while still holding the
    /// key lock.
    async fn resolve_ambiguous(
        &self,
        key: &IdempotencyKey,
        exhausted: Exhausted,
    ) -> Result<ApiResponse, GatewayError> {
        if !self.settings.lookup_interval.is_zero() {
            debug!(
                idempotency_key = %key,
                delay_ms = self.settings.lookup_interval.as_millis() as u64,
                "Waiting before order lookup"
            );
            self.clock.sleep(self.settings.lookup_interval).await;
        }
        let reconciler =
            Reconciler::new(&self.ledger, self, self.clock.as_ref()).with_window(1, Duration::ZERO);

        match reconciler.resolve_locked(key).await? {
            Resolution::Succeeded(record) | Resolution::AlreadyFinal(record)
                if record.status == IdempotencyStatus::Succeeded =>
            {
                info!(idempotency_key = %key, "Order confirmed by lookup after transient failure");
                Ok(ApiResponse::ok(order_data(&record))
                    .with_message("order confirmed by lookup after transient failure"))
            }
            Resolution::Succeeded(_) | Resolution::Failed(_) | Resolution::AlreadyFinal(_) => {
                Err(exhausted.error)
            }
            Resolution::Ambiguous { .. } => Err(GatewayError::TransientRemote {
                endpoint: Operation::PlaceOrder.endpoint().to_string(),
                attempts: exhausted.attempts,
                status: match &exhausted.error {
                    GatewayError::TransientRemote { status, .. } => *status,
                    _ => None,
                },
                message: format!(
                    "{}; order outcome unknown, will be reconciled",
                    exhausted.error.user_message()
                ),
            }),
        }
    }

    fn duplicate_response(
        existing: &IdempotencyRecord,
        fingerprint: &str,
    ) -> Result<ApiResponse, GatewayError> {
        if existing.fingerprint != fingerprint {
            return Err(GatewayError::IdempotencyConflict {
                key: existing.key.to_string(),
            });
        }

        match existing.status {
            IdempotencyStatus::Pending => Err(GatewayError::ReconciliationAmbiguous {
                key: existing.key.to_string(),
                message: "an earlier attempt with this key is unresolved".to_string(),
            }),
            IdempotencyStatus::Succeeded => Ok(ApiResponse::ok(order_data(existing))
                .with_code(ErrorCode::DuplicateRequest)
                .with_message("duplicate request; returning original outcome")),
            IdempotencyStatus::Failed => {
                let reason = existing.error_message.as_deref().unwrap_or("unknown");
                Ok(ApiResponse {
                    success: false,
                    ..ApiResponse::ok(order_data(existing))
                }
                .with_code(ErrorCode::DuplicateRequest)
                .with_message(format!("duplicate request; original attempt failed: {reason}")))
            }
        }
    }

    /// Modify a working order.
    pub async fn modify_order(&self, request: &ModifyOrderRequest) -> ApiResponse {
        if let Err(e) = request.validate() {
            return self.reject(&e);
        }
        let result = self.call(Operation::ModifyOrder, request.to_params()).await;
        let entry = amendment_entry(
            LedgerAction::Modify,
            &request.order_id,
            &request.exchange_code,
            request.quantity.unwrap_or_default(),
            request.price,
            &result,
        );
        self.record_amendment(entry, result).await
    }

    /// Cancel a working order.
    pub async fn cancel_order(&self, order_id: &str, exchange_code: &str) -> ApiResponse {
        if order_id.trim().is_empty() {
            return self.reject(&GatewayError::invalid_request("order_id is required"));
        }
        let mut p = BTreeMap::new();
        p.insert(params::ORDER_ID.to_string(), order_id.to_string());
        p.insert(params::EXCHANGE_CODE.to_string(), exchange_code.to_string());

        let result = self.call(Operation::CancelOrder, p).await;
        let entry = amendment_entry(
            LedgerAction::Cancel,
            order_id,
            exchange_code,
            Decimal::ZERO,
            None,
            &result,
        );
        self.record_amendment(entry, result).await
    }

    async fn record_amendment(
        &self,
        entry: Option<LedgerEntry>,
        result: Result<Value, GatewayError>,
    ) -> ApiResponse {
        if let Some(entry) = entry
            && let Err(e) = self.ledger.append_entry(&entry).await
        {
            error!(entry_id = %entry.entry_id, error = %e, "Failed to record order amendment");
            if result.is_ok() {
                return self.reject(&GatewayError::Persistence {
                    message: format!(
                        "{} accepted by remote but not recorded: {e}",
                        entry.action.as_str()
                    ),
                });
            }
        }
        self.respond(result)
    }

    // ========================================================================
    // Recovery and status
    // ========================================================================

    /// Resolve every PENDING idempotency record against the remote.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the ledger cannot be read or written.
    pub async fn reconcile_pending(&self) -> Result<ReconciliationReport, GatewayError> {
        let report = Reconciler::new(&self.ledger, self, self.clock.as_ref())
            .with_window(self.settings.lookup_attempts, self.settings.lookup_interval)
            .reconcile_pending()
            .await?;
        Ok(report)
    }

    /// Resolve a single key, e.g. a protective close left PENDING.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the key has no record or the ledger fails.
    pub async fn reconcile_key(&self, key: &IdempotencyKey) -> Result<Resolution, GatewayError> {
        let _guard = self.ledger.lock_key(key).await;
        let resolution = Reconciler::new(&self.ledger, self, self.clock.as_ref())
            .with_window(self.settings.lookup_attempts, self.settings.lookup_interval)
            .resolve_locked(key)
            .await?;
        Ok(resolution)
    }

    /// Health snapshot.
    #[must_use]
    pub fn connection_status(&self) -> ConnectionStatus {
        let breaker = self.breaker.metrics();
        let (total_calls, remote_calls, failed_calls, last_error) = self.stats.totals();
        ConnectionStatus {
            breaker_state: breaker.state,
            consecutive_failures: breaker.consecutive_failures,
            tokens_available: self.limiter.available(),
            token_capacity: self.limiter.capacity(),
            uptime_secs: self
                .clock
                .now()
                .saturating_duration_since(self.started_at)
                .as_secs(),
            cache: self.cache.stats(),
            total_calls,
            remote_calls,
            failed_calls,
            last_error,
            breaker,
        }
    }

    /// Sweep expired cache entries every `interval` until `shutdown` fires.
    pub fn spawn_cache_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = gateway.cache.sweep_expired();
                        if removed > 0 {
                            debug!(removed, "Swept expired cache entries");
                        }
                    }
                }
            }
            debug!("Cache sweeper stopped");
        })
    }
}

/// Ledger row for a modify or cancel that reached the remote.
fn amendment_entry(
    action: LedgerAction,
    order_id: &str,
    exchange_code: &str,
    quantity: Decimal,
    price: Option<Decimal>,
    result: &Result<Value, GatewayError>,
) -> Option<LedgerEntry> {
    let (status, message) = match result {
        Ok(_) => (IdempotencyStatus::Succeeded, None),
        Err(e @ (GatewayError::TransientRemote { .. } | GatewayError::PermanentRemote { .. })) => {
            (IdempotencyStatus::Failed, Some(e.user_message()))
        }
        Err(_) => return None,
    };
    Some(LedgerEntry {
        entry_id: uuid::Uuid::new_v4().to_string(),
        idempotency_key: None,
        action,
        instrument: exchange_code.to_string(),
        side: None,
        quantity,
        price,
        status,
        remote_order_id: Some(order_id.to_string()),
        message,
        recorded_at: chrono::Utc::now(),
    })
}

#[async_trait]
impl OrderLookup for Gateway {
    async fn lookup_order(&self, key: &IdempotencyKey) -> Result<LookupResult, GatewayError> {
        let mut p = BTreeMap::new();
        p.insert(params::CLIENT_ORDER_ID.to_string(), key.to_string());

        match self.call(Operation::OrderLookup, p).await {
            Ok(payload) => Ok(remote_order_id(&payload).map_or(LookupResult::NotFound, |id| {
                LookupResult::Found {
                    remote_order_id: id,
                }
            })),
            Err(GatewayError::PermanentRemote {
                status: Some(404), ..
            }) => Ok(LookupResult::NotFound),
            Err(e) => Err(e),
        }
    }
}
