//! Bounded per-sandbox usage history.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

use super::ResourceQuantity;

/// Number of samples retained per sandbox.
pub(crate) const HISTORY_WINDOW: usize = 5;

/// One timestamped usage measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct UsageSample {
    pub timestamp: DateTime<Utc>,
    pub usage: ResourceQuantity,
}

impl UsageSample {
    /// Sample stamped with the current time.
    pub fn now(usage: ResourceQuantity) -> Self {
        Self {
            timestamp: Utc::now(),
            usage,
        }
    }
}

/// The most recent usage samples for one sandbox, oldest first.
#[derive(Debug, Clone, Default)]
pub(crate) struct ResourceUsageHistory {
    samples: VecDeque<UsageSample>,
}

impl ResourceUsageHistory {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(HISTORY_WINDOW + 1),
        }
    }

    /// Appends a sample, evicting the oldest once the window is full.
    pub fn add_measurement(&mut self, sample: UsageSample) {
        self.samples.push_back(sample);
        while self.samples.len() > HISTORY_WINDOW {
            self.samples.pop_front();
        }
    }

    /// Element-wise maximum across retained samples; zero when empty.
    pub fn max_usage(&self) -> ResourceQuantity {
        self.samples
            .iter()
            .fold(ResourceQuantity::ZERO, |acc, s| acc.max(s.usage))
    }

    pub fn latest(&self) -> Option<&UsageSample> {
        self.samples.back()
    }

    pub fn samples(&self) -> impl Iterator<Item = &UsageSample> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
