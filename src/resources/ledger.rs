//! Process-wide accounting of reserved compute resources.
//!
//! The ledger is the only shared mutable counter in the orchestrator.
//! `try_reserve` and `release` are its sole mutators and both run inside
//! one critical section, so no two reservations can observe the same
//! stale `used` value.

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::ResourceQuantity;
use crate::error::ResourceError;

#[derive(Debug)]
struct LedgerState {
    total: ResourceQuantity,
    used: ResourceQuantity,
}

/// Read-only view of the ledger at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct LedgerSnapshot {
    /// Total capacity.
    pub total: ResourceQuantity,
    /// Currently reserved.
    pub used: ResourceQuantity,
    /// `total - used`, clamped at zero.
    pub available: ResourceQuantity,
}

/// Tracks total versus reserved resources with atomic check-and-reserve.
#[derive(Debug)]
pub(crate) struct ResourceLedger {
    state: Mutex<LedgerState>,
}

impl ResourceLedger {
    /// Creates a ledger with the given capacity and nothing reserved.
    pub fn new(total: ResourceQuantity) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                total,
                used: ResourceQuantity::ZERO,
            }),
        }
    }

    /// Reserves `request` if every dimension is available.
    ///
    /// On failure the ledger is left untouched.
    pub async fn try_reserve(&self, request: ResourceQuantity) -> Result<(), ResourceError> {
        if !request.is_valid() {
            return Err(ResourceError::invalid_quantity(request));
        }

        let mut state = self.state.lock().await;
        let available = state.total.saturating_sub(state.used);

        if !request.fits_within(&available) {
            debug!(requested = %request, available = %available, "Reservation rejected");
            return Err(ResourceError::insufficient(request, available));
        }

        state.used = state.used + request;
        debug!(requested = %request, used = %state.used, "Reservation granted");
        Ok(())
    }

    /// Returns `amount` to the pool, clamping each dimension at zero.
    pub async fn release(&self, amount: ResourceQuantity) {
        let mut state = self.state.lock().await;
        if !amount.fits_within(&state.used) {
            warn!(
                releasing = %amount,
                used = %state.used,
                "Release exceeds reserved amount; clamping to zero"
            );
        }
        state.used = state.used.saturating_sub(amount);
        debug!(released = %amount, used = %state.used, "Reservation released");
    }

    /// Returns a consistent snapshot of total, used and available.
    pub async fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state.lock().await;
        LedgerSnapshot {
            total: state.total,
            used: state.used,
            available: state.total.saturating_sub(state.used),
        }
    }
}
