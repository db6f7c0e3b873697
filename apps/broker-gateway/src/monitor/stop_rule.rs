//! Stop-loss rules and their evaluation.
//!
//! # Trigger sides
//!
//! | Rule | Long position | Short position |
//! |------|---------------|----------------|
//! | FIXED | price <= trigger | price >= trigger |
//! | TRAILING | mark = highest price, fires at price <= mark - distance | mark = lowest price, fires at price >= mark + distance |
//!
//! The short trailing behaviour is the [`ShortTrailing::LowWaterMark`] policy.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::gateway::PositionSide;

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Distance a trailing stop keeps from its water mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "unit", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrailDistance {
    /// Absolute price distance.
    Points(Decimal),
    /// Percentage of the water mark (`5` means 5%).
    Percent(Decimal),
}

impl TrailDistance {
    /// Stop level beneath `mark`.
    #[must_use]
    pub fn below(&self, mark: Decimal) -> Decimal {
        match self {
            Self::Points(points) => mark - points,
            Self::Percent(pct) => mark * (HUNDRED - pct) / HUNDRED,
        }
    }

    /// Stop level above `mark`.
    #[must_use]
    pub fn above(&self, mark: Decimal) -> Decimal {
        match self {
            Self::Points(points) => mark + points,
            Self::Percent(pct) => mark * (HUNDRED + pct) / HUNDRED,
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Self::Points(points) if *points <= Decimal::ZERO => {
                Err("trail distance must be positive".to_string())
            }
            Self::Percent(pct) if *pct <= Decimal::ZERO || *pct >= HUNDRED => {
                Err("trail percent must be between 0 and 100".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Trailing behaviour for short positions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShortTrailing {
    /// Track the lowest price seen; fire when price rises by the trail
    /// distance above it.
    #[default]
    LowWaterMark,
}

/// Kind of stop with its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopKind {
    /// Fires when price crosses an absolute level.
    Fixed {
        /// Trigger price.
        trigger_price: Decimal,
    },
    /// Fires when price retreats from the best price seen.
    Trailing {
        /// Distance from the water mark.
        distance: TrailDistance,
        /// Best price seen so far (highest for long, lowest for short).
        #[serde(default)]
        water_mark: Option<Decimal>,
        /// Short-position policy.
        #[serde(default)]
        short_policy: ShortTrailing,
    },
}

/// Stop rule attached to a position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRule {
    /// Position the rule protects.
    pub position_key: String,
    /// Rule kind and parameters.
    pub kind: StopKind,
    /// Unix seconds when the rule was armed; part of the close order key.
    pub armed_at: i64,
}

/// Result of evaluating a rule against a price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// No trigger.
    Hold {
        /// Current stop level.
        level: Decimal,
    },
    /// The stop fired.
    Triggered {
        /// Stop level that was crossed.
        level: Decimal,
    },
}

impl Evaluation {
    /// Whether the stop fired.
    #[must_use]
    pub const fn is_triggered(&self) -> bool {
        matches!(self, Self::Triggered { .. })
    }

    /// Stop level at evaluation time.
    #[must_use]
    pub const fn level(&self) -> Decimal {
        match self {
            Self::Hold { level } | Self::Triggered { level } => *level,
        }
    }
}

impl StopRule {
    /// Fixed stop armed now.
    #[must_use]
    pub fn fixed(position_key: impl Into<String>, trigger_price: Decimal) -> Self {
        Self {
            position_key: position_key.into(),
            kind: StopKind::Fixed { trigger_price },
            armed_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Trailing stop armed now, seeded on the first evaluated price.
    #[must_use]
    pub fn trailing(position_key: impl Into<String>, distance: TrailDistance) -> Self {
        Self {
            position_key: position_key.into(),
            kind: StopKind::Trailing {
                distance,
                water_mark: None,
                short_policy: ShortTrailing::LowWaterMark,
            },
            armed_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Seed the water mark (e.g. with the entry price).
    #[must_use]
    pub fn with_water_mark(mut self, mark: Decimal) -> Self {
        if let StopKind::Trailing { water_mark, .. } = &mut self.kind {
            *water_mark = Some(mark);
        }
        self
    }

    /// Override the arming time, e.g. when re-attaching after a restart.
    #[must_use]
    pub fn with_armed_at(mut self, armed_at: i64) -> Self {
        self.armed_at = armed_at;
        self
    }

    /// Check parameters.
    pub fn validate(&self) -> Result<(), String> {
        match &self.kind {
            StopKind::Fixed { trigger_price } if *trigger_price <= Decimal::ZERO => {
                Err("trigger price must be positive".to_string())
            }
            StopKind::Fixed { .. } => Ok(()),
            StopKind::Trailing { distance, .. } => distance.validate(),
        }
    }

    /// Stored water mark, for trailing rules.
    #[must_use]
    pub const fn water_mark(&self) -> Option<Decimal> {
        match &self.kind {
            StopKind::Trailing { water_mark, .. } => *water_mark,
            StopKind::Fixed { .. } => None,
        }
    }

    /// `FIXED` or `TRAILING`.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self.kind {
            StopKind::Fixed { .. } => "FIXED",
            StopKind::Trailing { .. } => "TRAILING",
        }
    }

    /// Current stop level without evaluating a new price.
    #[must_use]
    pub fn level(&self, side: PositionSide) -> Option<Decimal> {
        match &self.kind {
            StopKind::Fixed { trigger_price } => Some(*trigger_price),
            StopKind::Trailing {
                distance,
                water_mark,
                ..
            } => water_mark.map(|mark| match side {
                PositionSide::Long => distance.below(mark),
                PositionSide::Short => distance.above(mark),
            }),
        }
    }

    /// Ratchet the water mark with `price` and test for a trigger.
    pub fn evaluate(&mut self, side: PositionSide, price: Decimal) -> Evaluation {
        match &mut self.kind {
            StopKind::Fixed { trigger_price } => {
                let level = *trigger_price;
                let fired = match side {
                    PositionSide::Long => price <= level,
                    PositionSide::Short => price >= level,
                };
                if fired {
                    Evaluation::Triggered { level }
                } else {
                    Evaluation::Hold { level }
                }
            }
            StopKind::Trailing {
                distance,
                water_mark,
                short_policy: ShortTrailing::LowWaterMark,
            } => {
                let (mark, level, fired) = match side {
                    PositionSide::Long => {
                        let mark = water_mark.map_or(price, |m| m.max(price));
                        let level = distance.below(mark);
                        (mark, level, price <= level)
                    }
                    PositionSide::Short => {
                        let mark = water_mark.map_or(price, |m| m.min(price));
                        let level = distance.above(mark);
                        (mark, level, price >= level)
                    }
                };
                *water_mark = Some(mark);
                if fired {
                    Evaluation::Triggered { level }
                } else {
                    Evaluation::Hold { level }
                }
            }
        }
    }
}
