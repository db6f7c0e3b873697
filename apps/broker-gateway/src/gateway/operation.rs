//! Catalogue of remote operations: endpoint names, token weights, cache TTLs.

use std::time::Duration;

use crate::config::CacheSettings;

/// Remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Last traded price.
    Quote,
    /// Option chain for an underlying and expiry.
    OptionChain,
    /// Open positions.
    Positions,
    /// Funds and balances.
    Funds,
    /// New order.
    PlaceOrder,
    /// Order modification.
    ModifyOrder,
    /// Order cancellation.
    CancelOrder,
    /// Margin requirement.
    Margin,
    /// Historical candles.
    History,
    /// Single order detail.
    OrderDetail,
    /// Orders in a date range.
    OrderList,
    /// Trades in a date range.
    TradeList,
    /// Customer profile.
    CustomerDetails,
    /// Find an order by client order id.
    OrderLookup,
}

/// Reads dropped after any successful mutating call.
const INVALIDATED_BY_MUTATION: &[Operation] = &[
    Operation::Positions,
    Operation::Funds,
    Operation::Margin,
    Operation::OrderList,
    Operation::OrderDetail,
    Operation::TradeList,
];

impl Operation {
    /// Remote endpoint name.
    #[must_use]
    pub const fn endpoint(&self) -> &'static str {
        match self {
            Self::Quote => "quote",
            Self::OptionChain => "option_chain",
            Self::Positions => "positions",
            Self::Funds => "funds",
            Self::PlaceOrder => "place_order",
            Self::ModifyOrder => "modify_order",
            Self::CancelOrder => "cancel_order",
            Self::Margin => "margin",
            Self::History => "history",
            Self::OrderDetail => "order_detail",
            Self::OrderList => "order_list",
            Self::TradeList => "trade_list",
            Self::CustomerDetails => "customer_details",
            Self::OrderLookup => "order_lookup",
        }
    }

    /// Whether the call changes remote state.
    #[must_use]
    pub const fn is_mutating(&self) -> bool {
        matches!(self, Self::PlaceOrder | Self::ModifyOrder | Self::CancelOrder)
    }

    /// Rate tokens consumed per attempt.
    #[must_use]
    pub const fn token_cost(&self) -> u32 {
        match self {
            Self::OptionChain | Self::History => 2,
            _ => 1,
        }
    }

    /// Cache TTL, or `None` when the result must never be cached.
    #[must_use]
    pub const fn ttl(&self, settings: &CacheSettings) -> Option<Duration> {
        let secs = match self {
            Self::Quote => settings.quote,
            Self::OptionChain => settings.option_chain,
            Self::Positions => settings.positions,
            Self::Funds => settings.funds,
            Self::Margin => settings.margin,
            Self::History => settings.history,
            Self::OrderDetail | Self::OrderList | Self::TradeList => settings.order_list,
            Self::CustomerDetails => settings.customer,
            Self::PlaceOrder | Self::ModifyOrder | Self::CancelOrder | Self::OrderLookup => {
                return None;
            }
        };
        if secs == 0 {
            None
        } else {
            Some(Duration::from_secs(secs))
        }
    }

    /// Cached reads made stale by this operation.
    #[must_use]
    pub const fn invalidates(&self) -> &'static [Self] {
        if self.is_mutating() {
            INVALIDATED_BY_MUTATION
        } else {
            &[]
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.endpoint())
    }
}
