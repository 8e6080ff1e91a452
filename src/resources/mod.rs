//! Resource accounting: quantities, the admission ledger, and usage history.

mod history;
mod ledger;
mod quantity;

pub(crate) use history::{ResourceUsageHistory, UsageSample};
pub(crate) use ledger::{LedgerSnapshot, ResourceLedger};
pub use quantity::ResourceQuantity;
