//! In-memory simulated brokerage.
//!
//! Implements every gateway endpoint against local state. Orders fill
//! immediately at the current price (market) or their limit price and net
//! into positions. Placement is idempotent on `client_order_id`, which is
//! what makes crash reconciliation against it meaningful.
//!
//! Failures can be scripted per endpoint, including the ambiguous case
//! where an order is accepted but the reply is lost.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::{Value, json};
use tracing::debug;

use crate::gateway::{
    Instrument, Operation, OrderSide, OrderType, PlaceOrderRequest, Position, PositionSide,
    RemoteApi, RemoteFailure, RemoteReply, params,
};

/// Scripted failure for the next call to an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Reply with this status and message.
    Status(u16, String),
    /// Fail without a reply.
    Transport(RemoteFailure),
    /// Accept the order, then reply with this status as if the answer were lost.
    AcceptThenStatus(u16),
}

#[derive(Debug, Clone)]
struct PaperOrder {
    order_id: String,
    client_order_id: Option<String>,
    request: PlaceOrderRequest,
    fill_price: Decimal,
    status: &'static str,
}

impl PaperOrder {
    fn to_json(&self) -> Value {
        json!({
            "order_id": self.order_id,
            "client_order_id": self.client_order_id,
            "instrument": self.request.instrument.key(),
            "action": self.request.side.as_str(),
            "order_type": self.request.order_type.as_str(),
            "quantity": self.request.quantity,
            "price": self.request.price,
            "fill_price": self.fill_price,
            "status": self.status,
        })
    }
}

#[derive(Debug, Default)]
struct PaperState {
    prices: HashMap<String, Decimal>,
    positions: BTreeMap<String, Position>,
    orders: BTreeMap<String, PaperOrder>,
    by_client_id: HashMap<String, String>,
    failures: HashMap<String, VecDeque<InjectedFailure>>,
    calls: HashMap<String, usize>,
    funds: Decimal,
}

/// Simulated brokerage implementing [`RemoteApi`].
#[derive(Debug)]
pub struct PaperRemote {
    state: Mutex<PaperState>,
    order_counter: AtomicU64,
}

impl Default for PaperRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperRemote {
    /// Create an empty brokerage with 1,000,000 in funds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PaperState {
                funds: Decimal::from(1_000_000),
                ..PaperState::default()
            }),
            order_counter: AtomicU64::new(1),
        }
    }

    /// Set the last traded price for `instrument`.
    pub fn set_price(&self, instrument: &Instrument, price: Decimal) {
        self.state.lock().prices.insert(instrument.key(), price);
    }

    /// Insert or replace a position.
    pub fn set_position(&self, position: Position) {
        self.state.lock().positions.insert(position.key(), position);
    }

    /// Remove a position.
    pub fn remove_position(&self, key: &str) -> Option<Position> {
        self.state.lock().positions.remove(key)
    }

    /// Current position for `key`.
    #[must_use]
    pub fn position(&self, key: &str) -> Option<Position> {
        self.state.lock().positions.get(key).cloned()
    }

    /// Queue a failure for the next call to `op`.
    pub fn inject(&self, op: Operation, failure: InjectedFailure) {
        self.state
            .lock()
            .failures
            .entry(op.endpoint().to_string())
            .or_default()
            .push_back(failure);
    }

    /// Calls received for `op`, including failed ones.
    #[must_use]
    pub fn call_count(&self, op: Operation) -> usize {
        self.state
            .lock()
            .calls
            .get(op.endpoint())
            .copied()
            .unwrap_or(0)
    }

    /// Orders accepted so far.
    #[must_use]
    pub fn order_count(&self) -> usize {
        self.state.lock().orders.len()
    }

    /// Remote order id for a client order id.
    #[must_use]
    pub fn order_for_client_id(&self, client_order_id: &str) -> Option<String> {
        self.state.lock().by_client_id.get(client_order_id).cloned()
    }

    fn next_order_id(&self) -> String {
        format!("PAPER-{}", self.order_counter.fetch_add(1, Ordering::SeqCst))
    }

    fn dispatch(
        &self,
        state: &mut PaperState,
        endpoint: &str,
        p: &BTreeMap<String, String>,
    ) -> RemoteReply {
        match endpoint {
            "quote" => quote(state, p),
            "option_chain" => option_chain(state, p),
            "positions" => {
                let rows: Vec<&Position> = state.positions.values().collect();
                RemoteReply::ok(json!({ "positions": rows }))
            }
            "funds" => RemoteReply::ok(json!({ "available": state.funds })),
            "margin" => RemoteReply::ok(json!({
                "exchange_code": p.get(params::EXCHANGE_CODE),
                "available": state.funds,
                "blocked": Decimal::ZERO,
            })),
            "place_order" => self.place(state, p),
            "modify_order" => modify(state, p),
            "cancel_order" => with_order(state, p, |order| {
                order.status = "CANCELLED";
                json!({ "order_id": order.order_id, "status": order.status })
            }),
            "history" => history(state, p),
            "order_detail" => with_order(state, p, |order| order.to_json()),
            "order_list" => {
                let rows: Vec<Value> = state.orders.values().map(PaperOrder::to_json).collect();
                RemoteReply::ok(Value::Array(rows))
            }
            "trade_list" => {
                let rows: Vec<Value> = state
                    .orders
                    .values()
                    .filter(|o| o.status == "EXECUTED")
                    .map(PaperOrder::to_json)
                    .collect();
                RemoteReply::ok(Value::Array(rows))
            }
            "customer_details" => RemoteReply::ok(json!({
                "client_id": "PAPER",
                "name": "Paper Account",
            })),
            "order_lookup" => match p
                .get(params::CLIENT_ORDER_ID)
                .and_then(|id| state.by_client_id.get(id))
            {
                Some(order_id) => RemoteReply::ok(json!({ "order_id": order_id })),
                None => RemoteReply::error(404, "order not found"),
            },
            other => RemoteReply::error(404, &format!("unknown endpoint '{other}'")),
        }
    }

    fn place(&self, state: &mut PaperState, p: &BTreeMap<String, String>) -> RemoteReply {
        let client_id = p.get(params::CLIENT_ORDER_ID).cloned();
        if let Some(existing) = client_id.as_ref().and_then(|id| state.by_client_id.get(id)) {
            return RemoteReply::ok(json!({ "order_id": existing, "status": "EXECUTED" }));
        }

        let Some(request) = PlaceOrderRequest::from_params(p) else {
            return RemoteReply::error(400, "invalid order parameters");
        };
        let market = state.prices.get(&request.instrument.key()).copied();
        let fill_price = match (request.order_type, request.price, market) {
            (OrderType::Market, _, Some(price)) | (_, Some(price), _) => price,
            _ => return RemoteReply::error(400, "no price available for instrument"),
        };

        let order_id = self.next_order_id();
        apply_fill(state, &request, fill_price);
        if let Some(id) = &client_id {
            state.by_client_id.insert(id.clone(), order_id.clone());
        }
        state.orders.insert(
            order_id.clone(),
            PaperOrder {
                order_id: order_id.clone(),
                client_order_id: client_id,
                request,
                fill_price,
                status: "EXECUTED",
            },
        );
        debug!(order_id = %order_id, "Paper order executed");
        RemoteReply::ok(json!({ "order_id": order_id, "status": "EXECUTED" }))
    }
}

fn quote(state: &PaperState, p: &BTreeMap<String, String>) -> RemoteReply {
    let Some(instrument) = Instrument::from_params(p) else {
        return RemoteReply::error(400, "invalid instrument");
    };
    match state.prices.get(&instrument.key()) {
        Some(price) => RemoteReply::ok(json!({
            "stock_code": instrument.stock_code,
            "exchange_code": instrument.exchange_code,
            "ltp": price,
        })),
        None => RemoteReply::error(404, "no quote for instrument"),
    }
}

fn option_chain(state: &PaperState, p: &BTreeMap<String, String>) -> RemoteReply {
    let stock = p.get(params::STOCK_CODE).map(String::as_str).unwrap_or_default();
    let expiry = p.get(params::EXPIRY_DATE).map(String::as_str).unwrap_or_default();
    let prefix = format!(
        "{}:{stock}:{expiry}:",
        p.get(params::EXCHANGE_CODE).map(String::as_str).unwrap_or_default()
    );
    let rows: Vec<Value> = state
        .prices
        .iter()
        .filter(|(key, _)| key.starts_with(&prefix))
        .map(|(key, price)| json!({ "instrument": key, "ltp": price }))
        .collect();
    RemoteReply::ok(Value::Array(rows))
}

fn history(state: &PaperState, p: &BTreeMap<String, String>) -> RemoteReply {
    let Some(instrument) = Instrument::from_params(p) else {
        return RemoteReply::error(400, "invalid instrument");
    };
    let Some(price) = state.prices.get(&instrument.key()) else {
        return RemoteReply::error(404, "no history for instrument");
    };
    RemoteReply::ok(json!([{
        "datetime": p.get(params::FROM_DATE),
        "open": price, "high": price, "low": price, "close": price,
        "volume": 0,
    }]))
}

fn modify(state: &mut PaperState, p: &BTreeMap<String, String>) -> RemoteReply {
    let quantity = p
        .get(params::QUANTITY)
        .and_then(|q| Decimal::from_str(q).ok());
    let price = p.get(params::PRICE).and_then(|q| Decimal::from_str(q).ok());
    with_order(state, p, |order| {
        if let Some(quantity) = quantity {
            order.request.quantity = quantity;
        }
        if price.is_some() {
            order.request.price = price;
        }
        order.status = "MODIFIED";
        json!({ "order_id": order.order_id, "status": order.status })
    })
}

fn with_order(
    state: &mut PaperState,
    p: &BTreeMap<String, String>,
    f: impl FnOnce(&mut PaperOrder) -> Value,
) -> RemoteReply {
    match p
        .get(params::ORDER_ID)
        .and_then(|id| state.orders.get_mut(id))
    {
        Some(order) => RemoteReply::ok(f(order)),
        None => RemoteReply::error(404, "order not found"),
    }
}

/// Net a fill into the position book.
fn apply_fill(state: &mut PaperState, request: &PlaceOrderRequest, fill_price: Decimal) {
    let key = request.instrument.key();
    let signed = |side: PositionSide, qty: Decimal| match side {
        PositionSide::Long => qty,
        PositionSide::Short => -qty,
    };
    let fill_qty = match request.side {
        OrderSide::Buy => request.quantity,
        OrderSide::Sell => -request.quantity,
    };

    let (current, avg) = state
        .positions
        .get(&key)
        .map_or((Decimal::ZERO, fill_price), |pos| {
            (signed(pos.side, pos.quantity), pos.avg_entry_price)
        });
    let net = current + fill_qty;

    let notional = request.quantity * fill_price;
    match request.side {
        OrderSide::Buy => state.funds -= notional,
        OrderSide::Sell => state.funds += notional,
    }

    if net.is_zero() {
        state.positions.remove(&key);
        return;
    }

    let same_direction = current.is_zero() || current.is_sign_positive() == fill_qty.is_sign_positive();
    let flipped = !current.is_zero() && current.is_sign_positive() != net.is_sign_positive();
    let avg_entry_price = if same_direction && !current.is_zero() {
        (current.abs() * avg + request.quantity * fill_price) / net.abs()
    } else if flipped || current.is_zero() {
        fill_price
    } else {
        avg
    };

    state.positions.insert(
        key,
        Position {
            instrument: request.instrument.clone(),
            quantity: net.abs(),
            side: if net.is_sign_positive() {
                PositionSide::Long
            } else {
                PositionSide::Short
            },
            avg_entry_price,
        },
    );
}

#[async_trait]
impl RemoteApi for PaperRemote {
    async fn call(
        &self,
        endpoint: &str,
        p: &BTreeMap<String, String>,
    ) -> Result<RemoteReply, RemoteFailure> {
        let mut state = self.state.lock();
        *state.calls.entry(endpoint.to_string()).or_default() += 1;

        let injected = state
            .failures
            .get_mut(endpoint)
            .and_then(VecDeque::pop_front);
        match injected {
            Some(InjectedFailure::Status(status, message)) => {
                Ok(RemoteReply::error(status, &message))
            }
            Some(InjectedFailure::Transport(failure)) => Err(failure),
            Some(InjectedFailure::AcceptThenStatus(status)) => {
                let _accepted = self.dispatch(&mut state, endpoint, p);
                Ok(RemoteReply::error(status, "reply lost after acceptance"))
            }
            None => Ok(self.dispatch(&mut state, endpoint, p)),
        }
    }
}
