//! Typed requests and responses for gateway operations.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, GatewayError};

// ============================================================================
// Parameter names
// ============================================================================

/// Parameter names shared by the gateway and its remote binding.
pub mod params {
    /// Underlying or stock code.
    pub const STOCK_CODE: &str = "stock_code";
    /// Exchange code.
    pub const EXCHANGE_CODE: &str = "exchange_code";
    /// Product type.
    pub const PRODUCT: &str = "product";
    /// Order side.
    pub const ACTION: &str = "action";
    /// Order type.
    pub const ORDER_TYPE: &str = "order_type";
    /// Order quantity.
    pub const QUANTITY: &str = "quantity";
    /// Limit price.
    pub const PRICE: &str = "price";
    /// Stop-loss trigger price.
    pub const TRIGGER_PRICE: &str = "trigger_price";
    /// Order validity.
    pub const VALIDITY: &str = "validity";
    /// Derivative expiry date.
    pub const EXPIRY_DATE: &str = "expiry_date";
    /// Option strike.
    pub const STRIKE_PRICE: &str = "strike_price";
    /// Option right.
    pub const RIGHT: &str = "right";
    /// Remote order id.
    pub const ORDER_ID: &str = "order_id";
    /// Idempotency key forwarded to the remote.
    pub const CLIENT_ORDER_ID: &str = "client_order_id";
    /// Candle interval.
    pub const INTERVAL: &str = "interval";
    /// Range start.
    pub const FROM_DATE: &str = "from_date";
    /// Range end.
    pub const TO_DATE: &str = "to_date";
}

// ============================================================================
// Enums
// ============================================================================

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    /// Buy.
    Buy,
    /// Sell.
    Sell,
}

impl OrderSide {
    /// Wire and storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    /// Parse, ignoring case.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }

    /// The side that closes a position opened with this side.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    /// Market order.
    Market,
    /// Limit order.
    Limit,
    /// Stop-loss order with a trigger price.
    StopLoss,
}

impl OrderType {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
            Self::StopLoss => "STOP_LOSS",
        }
    }

    /// Parse, ignoring case.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "MARKET" => Some(Self::Market),
            "LIMIT" => Some(Self::Limit),
            "STOP_LOSS" | "STOPLOSS" => Some(Self::StopLoss),
            _ => None,
        }
    }
}

/// Product type of a position or order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductType {
    /// Delivery equity.
    Cash,
    /// Intraday margin equity.
    Margin,
    /// Futures.
    Futures,
    /// Options.
    Options,
}

impl ProductType {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cash => "CASH",
            Self::Margin => "MARGIN",
            Self::Futures => "FUTURES",
            Self::Options => "OPTIONS",
        }
    }

    /// Parse, ignoring case.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "CASH" => Some(Self::Cash),
            "MARGIN" => Some(Self::Margin),
            "FUTURES" => Some(Self::Futures),
            "OPTIONS" => Some(Self::Options),
            _ => None,
        }
    }
}

/// Option right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OptionRight {
    /// Call option.
    Call,
    /// Put option.
    Put,
}

impl OptionRight {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Call => "CALL",
            Self::Put => "PUT",
        }
    }

    /// Parse, ignoring case.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "CALL" => Some(Self::Call),
            "PUT" => Some(Self::Put),
            _ => None,
        }
    }
}

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionSide {
    /// Profits when price rises.
    Long,
    /// Profits when price falls.
    Short,
}

impl PositionSide {
    /// Order side that closes this position.
    #[must_use]
    pub const fn closing_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Sell,
            Self::Short => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

// ============================================================================
// Instruments and requests
// ============================================================================

/// Tradable instrument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    /// Stock or underlying code.
    pub stock_code: String,
    /// Exchange code (e.g. `NSE`, `NFO`).
    pub exchange_code: String,
    /// Product type.
    pub product: ProductType,
    /// Expiry date for derivatives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<String>,
    /// Strike for options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strike: Option<Decimal>,
    /// Right for options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<OptionRight>,
}

impl Instrument {
    /// Cash-segment equity.
    #[must_use]
    pub fn equity(stock_code: impl Into<String>, exchange_code: impl Into<String>) -> Self {
        Self {
            stock_code: stock_code.into(),
            exchange_code: exchange_code.into(),
            product: ProductType::Cash,
            expiry: None,
            strike: None,
            right: None,
        }
    }

    /// Option contract.
    #[must_use]
    pub fn option(
        stock_code: impl Into<String>,
        exchange_code: impl Into<String>,
        expiry: impl Into<String>,
        strike: Decimal,
        right: OptionRight,
    ) -> Self {
        Self {
            stock_code: stock_code.into(),
            exchange_code: exchange_code.into(),
            product: ProductType::Options,
            expiry: Some(expiry.into()),
            strike: Some(strike),
            right: Some(right),
        }
    }

    /// Stable key identifying the instrument, e.g. `NFO:NIFTY:2025-01-30:22000:CALL`.
    #[must_use]
    pub fn key(&self) -> String {
        let mut key = format!("{}:{}", self.exchange_code, self.stock_code);
        if let Some(expiry) = &self.expiry {
            key.push(':');
            key.push_str(expiry);
        }
        if let Some(strike) = self.strike {
            key.push(':');
            key.push_str(&strike.normalize().to_string());
        }
        if let Some(right) = self.right {
            key.push(':');
            key.push_str(right.as_str());
        }
        key
    }

    /// Write the instrument's parameters into `out`.
    pub fn write_params(&self, out: &mut BTreeMap<String, String>) {
        out.insert(params::STOCK_CODE.into(), self.stock_code.clone());
        out.insert(params::EXCHANGE_CODE.into(), self.exchange_code.clone());
        out.insert(params::PRODUCT.into(), self.product.as_str().into());
        if let Some(expiry) = &self.expiry {
            out.insert(params::EXPIRY_DATE.into(), expiry.clone());
        }
        if let Some(strike) = self.strike {
            out.insert(params::STRIKE_PRICE.into(), strike.normalize().to_string());
        }
        if let Some(right) = self.right {
            out.insert(params::RIGHT.into(), right.as_str().into());
        }
    }

    /// Rebuild an instrument from parameters written by [`Instrument::write_params`].
    #[must_use]
    pub fn from_params(map: &BTreeMap<String, String>) -> Option<Self> {
        Some(Self {
            stock_code: map.get(params::STOCK_CODE)?.clone(),
            exchange_code: map.get(params::EXCHANGE_CODE)?.clone(),
            product: ProductType::parse(map.get(params::PRODUCT)?)?,
            expiry: map.get(params::EXPIRY_DATE).cloned(),
            strike: map
                .get(params::STRIKE_PRICE)
                .and_then(|s| Decimal::from_str(s).ok()),
            right: map.get(params::RIGHT).and_then(|s| OptionRight::parse(s)),
        })
    }
}

/// New order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    /// Instrument to trade.
    pub instrument: Instrument,
    /// Buy or sell.
    pub side: OrderSide,
    /// Order type.
    pub order_type: OrderType,
    /// Quantity (must be positive).
    pub quantity: Decimal,
    /// Limit price, required for limit and stop-loss orders.
    #[serde(default)]
    pub price: Option<Decimal>,
    /// Trigger price, required for stop-loss orders.
    #[serde(default)]
    pub trigger_price: Option<Decimal>,
    /// Validity (defaults to `DAY`).
    #[serde(default = "default_validity")]
    pub validity: String,
}

fn default_validity() -> String {
    "DAY".to_string()
}

impl PlaceOrderRequest {
    /// Market order.
    #[must_use]
    pub fn market(instrument: Instrument, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            instrument,
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            trigger_price: None,
            validity: default_validity(),
        }
    }

    /// Limit order.
    #[must_use]
    pub fn limit(instrument: Instrument, side: OrderSide, quantity: Decimal, price: Decimal) -> Self {
        Self {
            order_type: OrderType::Limit,
            price: Some(price),
            ..Self::market(instrument, side, quantity)
        }
    }

    /// Check the request locally before it reaches the remote.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.instrument.stock_code.trim().is_empty() {
            return Err(GatewayError::invalid_request("stock_code is required"));
        }
        if self.quantity <= Decimal::ZERO {
            return Err(GatewayError::invalid_request("quantity must be positive"));
        }
        if let Some(price) = self.price
            && price <= Decimal::ZERO
        {
            return Err(GatewayError::invalid_request("price must be positive"));
        }
        match self.order_type {
            OrderType::Limit if self.price.is_none() => {
                Err(GatewayError::invalid_request("limit orders require a price"))
            }
            OrderType::StopLoss if self.trigger_price.is_none() => Err(
                GatewayError::invalid_request("stop-loss orders require a trigger price"),
            ),
            _ => Ok(()),
        }
    }

    /// Remote parameters, excluding the idempotency key.
    #[must_use]
    pub fn to_params(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        self.instrument.write_params(&mut out);
        out.insert(params::ACTION.into(), self.side.as_str().into());
        out.insert(params::ORDER_TYPE.into(), self.order_type.as_str().into());
        out.insert(params::QUANTITY.into(), self.quantity.normalize().to_string());
        out.insert(params::VALIDITY.into(), self.validity.clone());
        if let Some(price) = self.price {
            out.insert(params::PRICE.into(), price.normalize().to_string());
        }
        if let Some(trigger) = self.trigger_price {
            out.insert(params::TRIGGER_PRICE.into(), trigger.normalize().to_string());
        }
        out
    }

    /// Canonical fingerprint used to detect idempotency key reuse.
    ///
    /// The sorted parameter map as a JSON object, so values containing
    /// separators cannot collide.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(&self.to_params()).unwrap_or_default()
    }

    /// Rebuild a request from a fingerprint.
    #[must_use]
    pub fn from_fingerprint(fingerprint: &str) -> Option<Self> {
        let map: BTreeMap<String, String> = serde_json::from_str(fingerprint).ok()?;
        Self::from_params(&map)
    }

    /// Rebuild a request from remote parameters. Unknown keys are ignored.
    #[must_use]
    pub fn from_params(map: &BTreeMap<String, String>) -> Option<Self> {
        Some(Self {
            instrument: Instrument::from_params(&map)?,
            side: OrderSide::parse(map.get(params::ACTION)?)?,
            order_type: OrderType::parse(map.get(params::ORDER_TYPE)?)?,
            quantity: Decimal::from_str(map.get(params::QUANTITY)?).ok()?,
            price: map.get(params::PRICE).and_then(|s| Decimal::from_str(s).ok()),
            trigger_price: map
                .get(params::TRIGGER_PRICE)
                .and_then(|s| Decimal::from_str(s).ok()),
            validity: map
                .get(params::VALIDITY)
                .cloned()
                .unwrap_or_else(default_validity),
        })
    }
}

/// Change to a working order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyOrderRequest {
    /// Remote order id.
    pub order_id: String,
    /// Exchange code.
    pub exchange_code: String,
    /// New quantity.
    #[serde(default)]
    pub quantity: Option<Decimal>,
    /// New limit price.
    #[serde(default)]
    pub price: Option<Decimal>,
    /// New trigger price.
    #[serde(default)]
    pub trigger_price: Option<Decimal>,
}

impl ModifyOrderRequest {
    /// Check the request locally.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.order_id.trim().is_empty() {
            return Err(GatewayError::invalid_request("order_id is required"));
        }
        if self.quantity.is_none() && self.price.is_none() && self.trigger_price.is_none() {
            return Err(GatewayError::invalid_request("nothing to modify"));
        }
        if let Some(quantity) = self.quantity
            && quantity <= Decimal::ZERO
        {
            return Err(GatewayError::invalid_request("quantity must be positive"));
        }
        Ok(())
    }

    /// Remote parameters.
    #[must_use]
    pub fn to_params(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        out.insert(params::ORDER_ID.into(), self.order_id.clone());
        out.insert(params::EXCHANGE_CODE.into(), self.exchange_code.clone());
        if let Some(quantity) = self.quantity {
            out.insert(params::QUANTITY.into(), quantity.normalize().to_string());
        }
        if let Some(price) = self.price {
            out.insert(params::PRICE.into(), price.normalize().to_string());
        }
        if let Some(trigger) = self.trigger_price {
            out.insert(params::TRIGGER_PRICE.into(), trigger.normalize().to_string());
        }
        out
    }
}

/// Option chain query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionChainRequest {
    /// Underlying code.
    pub stock_code: String,
    /// Exchange code.
    pub exchange_code: String,
    /// Expiry date.
    pub expiry: String,
    /// Restrict to one right.
    #[serde(default)]
    pub right: Option<OptionRight>,
    /// Restrict to one strike.
    #[serde(default)]
    pub strike: Option<Decimal>,
}

impl OptionChainRequest {
    /// Remote parameters.
    #[must_use]
    pub fn to_params(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        out.insert(params::STOCK_CODE.into(), self.stock_code.clone());
        out.insert(params::EXCHANGE_CODE.into(), self.exchange_code.clone());
        out.insert(params::PRODUCT.into(), ProductType::Options.as_str().into());
        out.insert(params::EXPIRY_DATE.into(), self.expiry.clone());
        if let Some(right) = self.right {
            out.insert(params::RIGHT.into(), right.as_str().into());
        }
        if let Some(strike) = self.strike {
            out.insert(params::STRIKE_PRICE.into(), strike.normalize().to_string());
        }
        out
    }
}

/// Historical candle query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRequest {
    /// Instrument.
    pub instrument: Instrument,
    /// Candle interval (e.g. `1minute`, `1day`).
    pub interval: String,
    /// Range start.
    pub from: DateTime<Utc>,
    /// Range end.
    pub to: DateTime<Utc>,
}

impl HistoryRequest {
    /// Check the request locally.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.from >= self.to {
            return Err(GatewayError::invalid_request("history range start must precede end"));
        }
        if self.interval.trim().is_empty() {
            return Err(GatewayError::invalid_request("interval is required"));
        }
        Ok(())
    }

    /// Remote parameters.
    #[must_use]
    pub fn to_params(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        self.instrument.write_params(&mut out);
        out.insert(params::INTERVAL.into(), self.interval.clone());
        out.insert(params::FROM_DATE.into(), self.from.to_rfc3339());
        out.insert(params::TO_DATE.into(), self.to.to_rfc3339());
        out
    }
}

/// Inclusive date range for order and trade lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    /// Exchange code.
    pub exchange_code: String,
    /// Range start.
    pub from: DateTime<Utc>,
    /// Range end.
    pub to: DateTime<Utc>,
}

impl DateRange {
    /// Remote parameters.
    #[must_use]
    pub fn to_params(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        out.insert(params::EXCHANGE_CODE.into(), self.exchange_code.clone());
        out.insert(params::FROM_DATE.into(), self.from.to_rfc3339());
        out.insert(params::TO_DATE.into(), self.to.to_rfc3339());
        out
    }
}

// ============================================================================
// Positions and prices
// ============================================================================

/// Open position as reported by the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Instrument held.
    pub instrument: Instrument,
    /// Absolute quantity held.
    pub quantity: Decimal,
    /// Long or short.
    pub side: PositionSide,
    /// Average entry price.
    pub avg_entry_price: Decimal,
}

impl Position {
    /// Position key (the instrument key).
    #[must_use]
    pub fn key(&self) -> String {
        self.instrument.key()
    }

    /// Product type.
    #[must_use]
    pub const fn product_type(&self) -> ProductType {
        self.instrument.product
    }
}

/// Parse a positions payload: either an array of positions or an object
/// with a `positions` array. Zero-quantity rows are dropped.
pub fn parse_positions(payload: &Value) -> Result<Vec<Position>, serde_json::Error> {
    let rows = match payload {
        Value::Object(map) => map.get("positions").cloned().unwrap_or(Value::Array(vec![])),
        Value::Null => Value::Array(vec![]),
        other => other.clone(),
    };
    let positions: Vec<Position> = serde_json::from_value(rows)?;
    Ok(positions
        .into_iter()
        .filter(|p| !p.quantity.is_zero())
        .collect())
}

/// Extract a last-traded price from a quote payload.
///
/// Accepts `ltp` or `last_price` as a number or string, on an object or the
/// first element of an array.
#[must_use]
pub fn extract_price(payload: &Value) -> Option<Decimal> {
    let quote = match payload {
        Value::Array(items) => items.first()?,
        other => other,
    };
    let field = quote.get("ltp").or_else(|| quote.get("last_price"))?;
    match field {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

// ============================================================================
// Response envelope
// ============================================================================

/// Uniform response envelope for every gateway operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Payload (null on failure).
    pub data: Value,
    /// Error or outcome code.
    pub error_code: Option<ErrorCode>,
    /// Human-readable message, credentials redacted.
    pub message: String,
    /// Response time.
    pub timestamp: DateTime<Utc>,
}

impl ApiResponse {
    /// Successful response.
    #[must_use]
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
            error_code: None,
            message: String::new(),
            timestamp: Utc::now(),
        }
    }

    /// Failed response.
    #[must_use]
    pub fn err(error: &GatewayError) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error_code: Some(error.code()),
            message: error.user_message(),
            timestamp: Utc::now(),
        }
    }

    /// Build from a pipeline result.
    #[must_use]
    pub fn from_result(result: Result<Value, GatewayError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(error) => Self::err(&error),
        }
    }

    /// Attach a message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = crate::error::redact(&message.into());
        self
    }

    /// Attach a code.
    #[must_use]
    pub const fn with_code(mut self, code: ErrorCode) -> Self {
        self.error_code = Some(code);
        self
    }

    /// Attach data.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}
