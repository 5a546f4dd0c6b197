//! Fleet manager for independently configured SOCKS5 server instances.
//!
//! Each [`Rule`] describes one instance: its port, auth mode and UDP flag.
//! A [`Fleet`] starts and stops instances and counts the bytes that pass
//! through each one, folding them into the rule's cumulative totals and the
//! JSON rules file.

mod error;
pub mod instrumented;
mod lifecycle;
mod registry;
mod rule;
pub mod socks;
mod store;
pub mod traffic;

pub use error::{FleetError, FleetResult};
pub use lifecycle::server_options;
pub use registry::{Fleet, FleetOptions};
pub use rule::{next_rule_id, Rule, RuleError};
pub use store::{RuleStore, StoreError, RULES_FILE_NAME};
pub use traffic::{TrafficCounter, PERSIST_EVERY_FLUSHES, SYNC_INTERVAL};
