//! Infrastructure Layer
//!
//! Adapters implementing the gateway's ports:
//!
//! - `paper`: in-memory simulated brokerage implementing `RemoteApi`

pub mod paper;

pub use paper::{InjectedFailure, PaperRemote};
