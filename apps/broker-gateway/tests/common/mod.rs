//! Shared fixtures for integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use broker_gateway::config::Config;
use broker_gateway::gateway::{Gateway, Operation, RemoteApi, RemoteFailure, RemoteReply};
use broker_gateway::ledger::Ledger;
use broker_gateway::resilience::{Clock, ManualClock};

// =============================================================================
// Scripted remote
// =============================================================================

type Scripted = Result<RemoteReply, RemoteFailure>;

/// Remote that answers from per-endpoint scripts and records every call.
///
/// Unscripted calls get the endpoint's default reply, or `200 {}`.
#[derive(Debug, Default)]
pub struct ScriptedRemote {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    defaults: Mutex<HashMap<String, RemoteReply>>,
    calls: Mutex<Vec<(String, BTreeMap<String, String>)>>,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one answer for `op`.
    pub fn push(&self, op: Operation, answer: Scripted) {
        self.scripts
            .lock()
            .entry(op.endpoint().to_string())
            .or_default()
            .push_back(answer);
    }

    /// Queue `count` copies of a status reply.
    pub fn push_status(&self, op: Operation, status: u16, count: usize) {
        for _ in 0..count {
            self.push(op, Ok(RemoteReply::error(status, "scripted failure")));
        }
    }

    /// Answer every unscripted call to `op` with `reply`.
    pub fn set_default(&self, op: Operation, reply: RemoteReply) {
        self.defaults
            .lock()
            .insert(op.endpoint().to_string(), reply);
    }

    /// Calls received for `op`.
    pub fn calls(&self, op: Operation) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(endpoint, _)| endpoint == op.endpoint())
            .count()
    }

    /// Parameters of the most recent call to `op`.
    pub fn last_params(&self, op: Operation) -> Option<BTreeMap<String, String>> {
        self.calls
            .lock()
            .iter()
            .rev()
            .find(|(endpoint, _)| endpoint == op.endpoint())
            .map(|(_, params)| params.clone())
    }
}

#[async_trait]
impl RemoteApi for ScriptedRemote {
    async fn call(
        &self,
        endpoint: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<RemoteReply, RemoteFailure> {
        self.calls
            .lock()
            .push((endpoint.to_string(), params.clone()));

        if let Some(answer) = self
            .scripts
            .lock()
            .get_mut(endpoint)
            .and_then(VecDeque::pop_front)
        {
            return answer;
        }
        Ok(self
            .defaults
            .lock()
            .get(endpoint)
            .cloned()
            .unwrap_or_else(|| RemoteReply::ok(json!({}))))
    }
}

// =============================================================================
// Gateway harness
// =============================================================================

/// Deterministic configuration: no jitter, 100ms base backoff.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.retry.max_attempts = 3;
    config.retry.base_delay_ms = 100;
    config.retry.max_delay_ms = 5_000;
    config.retry.jitter = false;
    config.ledger.lookup_attempts = 1;
    config.ledger.lookup_interval_ms = 0;
    config
}

pub struct Harness {
    pub gateway: Arc<Gateway>,
    pub remote: Arc<ScriptedRemote>,
    pub clock: Arc<ManualClock>,
}

/// Gateway over a scripted remote, an in-memory ledger and a manual clock.
pub async fn harness(config: &Config) -> Harness {
    let ledger = Ledger::open_in_memory().await.unwrap();
    harness_with_ledger(config, ledger)
}

pub fn harness_with_ledger(config: &Config, ledger: Ledger) -> Harness {
    let remote = Arc::new(ScriptedRemote::new());
    let clock = Arc::new(ManualClock::new());
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let gateway = Gateway::from_config(config, remote.clone(), ledger, dyn_clock);
    Harness {
        gateway: Arc::new(gateway),
        remote,
        clock,
    }
}

pub fn order_accepted(order_id: &str) -> RemoteReply {
    RemoteReply::ok(json!({ "order_id": order_id }))
}

pub fn quote_reply(ltp: &str) -> RemoteReply {
    RemoteReply::ok(json!({ "ltp": ltp, "stock_code": "NIFTY" }))
}

pub fn payload_order_id(data: &Value) -> Option<&str> {
    data.get("order_id").and_then(Value::as_str)
}
