//! Resilient gateway to the remote brokerage API.
//!
//! The [`Gateway`] wraps a [`RemoteApi`] with rate limiting, circuit
//! breaking, retries, caching and an idempotent order ledger. Every
//! operation answers with an [`ApiResponse`].

mod core;
mod operation;
mod remote;
mod status;
mod types;

pub use self::core::{Gateway, GatewayComponents, GatewaySettings, REMOTE_BREAKER_NAME};
pub use operation::Operation;
pub use remote::{RemoteApi, RemoteFailure, RemoteReply, classify_reply};
pub use status::ConnectionStatus;
pub use types::{
    ApiResponse, DateRange, HistoryRequest, Instrument, ModifyOrderRequest, OptionChainRequest,
    OptionRight, OrderSide, OrderType, PlaceOrderRequest, Position, PositionSide, ProductType,
    extract_price, params, parse_positions,
};
