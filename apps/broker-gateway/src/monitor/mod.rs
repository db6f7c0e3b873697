//! Background risk monitor: stop rules, alert history and the evaluation loop.

mod alerts;
mod service;
mod stop_rule;

pub use alerts::{Alert, AlertCategory, AlertLog};
pub use service::{CycleReport, MonitorError, MonitoredPosition, RiskMonitor};
pub use stop_rule::{Evaluation, ShortTrailing, StopKind, StopRule, TrailDistance};
