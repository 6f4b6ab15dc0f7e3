//! Policy distribution: fetching rule tables and keeping the store fresh.

pub mod refresh;
pub mod source;

pub use refresh::{PolicyRefresher, RefreshOutcome};
pub use source::{HttpRuleSource, RuleSource};
