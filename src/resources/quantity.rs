//! Multi-dimensional resource amounts.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Sub};

/// Tolerance applied to every per-dimension comparison.
///
/// Reservations are accumulated as floats, so repeated reserve/release
/// cycles can leave residue in the last bits.
pub(crate) const EPSILON: f64 = 1e-9;

/// An amount of compute resources across every accounted dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceQuantity {
    /// CPU cores (fractional cores allowed).
    #[serde(default)]
    pub cpu_cores: f64,
    /// Memory in gigabytes.
    #[serde(default)]
    pub ram_gb: f64,
    /// Disk in gigabytes.
    #[serde(default)]
    pub disk_gb: f64,
    /// Memory bandwidth in GB/s.
    #[serde(default)]
    pub memory_bandwidth_gbps: f64,
    /// Network bandwidth in Mbit/s.
    #[serde(default)]
    pub network_bandwidth_mbps: f64,
}

impl ResourceQuantity {
    /// The all-zero quantity.
    pub const ZERO: Self = Self {
        cpu_cores: 0.0,
        ram_gb: 0.0,
        disk_gb: 0.0,
        memory_bandwidth_gbps: 0.0,
        network_bandwidth_mbps: 0.0,
    };

    /// Quantity with only CPU and memory set.
    pub fn compute(cpu_cores: f64, ram_gb: f64) -> Self {
        Self {
            cpu_cores,
            ram_gb,
            ..Self::ZERO
        }
    }

    fn dimensions(&self) -> [f64; 5] {
        [
            self.cpu_cores,
            self.ram_gb,
            self.disk_gb,
            self.memory_bandwidth_gbps,
            self.network_bandwidth_mbps,
        ]
    }

    fn from_dimensions(d: [f64; 5]) -> Self {
        Self {
            cpu_cores: d[0],
            ram_gb: d[1],
            disk_gb: d[2],
            memory_bandwidth_gbps: d[3],
            network_bandwidth_mbps: d[4],
        }
    }

    fn zip_with(self, other: Self, f: impl Fn(f64, f64) -> f64) -> Self {
        let a = self.dimensions();
        let b = other.dimensions();
        Self::from_dimensions([
            f(a[0], b[0]),
            f(a[1], b[1]),
            f(a[2], b[2]),
            f(a[3], b[3]),
            f(a[4], b[4]),
        ])
    }

    /// Returns true if every dimension is finite and non-negative.
    pub fn is_valid(&self) -> bool {
        self.dimensions().iter().all(|v| v.is_finite() && *v >= 0.0)
    }

    /// Returns true if every dimension is (approximately) zero.
    pub fn is_zero(&self) -> bool {
        self.dimensions().iter().all(|v| v.abs() <= EPSILON)
    }

    /// Returns true if `self` fits inside `capacity` on every dimension.
    pub fn fits_within(&self, capacity: &Self) -> bool {
        self.dimensions()
            .iter()
            .zip(capacity.dimensions())
            .all(|(need, have)| *need <= have + EPSILON)
    }

    /// Subtracts `other`, clamping each dimension at zero.
    #[must_use]
    pub fn saturating_sub(self, other: Self) -> Self {
        self.zip_with(other, |a, b| {
            let v = a - b;
            if v <= EPSILON {
                0.0
            } else {
                v
            }
        })
    }

    /// Element-wise maximum.
    #[must_use]
    pub fn max(self, other: Self) -> Self {
        self.zip_with(other, f64::max)
    }

    /// Element-wise minimum.
    #[must_use]
    pub fn min(self, other: Self) -> Self {
        self.zip_with(other, f64::min)
    }

    /// Multiplies every dimension by `factor`.
    #[must_use]
    pub fn scale(self, factor: f64) -> Self {
        let d = self.dimensions();
        Self::from_dimensions(d.map(|v| v * factor))
    }
}

impl Add for ResourceQuantity {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        self.zip_with(rhs, |a, b| a + b)
    }
}

impl Sub for ResourceQuantity {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self.zip_with(rhs, |a, b| a - b)
    }
}

/// Aggregate comparison: `a <= b` only when every dimension agrees.
///
/// Quantities that are larger on one dimension and smaller on another are
/// unordered.
impl PartialOrd for ResourceQuantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let le = self.fits_within(other);
        let ge = other.fits_within(self);
        match (le, ge) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => None,
        }
    }
}

impl fmt::Display for ResourceQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={:.2} ram={:.2}GB disk={:.2}GB membw={:.2}GB/s netbw={:.2}Mbps",
            self.cpu_cores,
            self.ram_gb,
            self.disk_gb,
            self.memory_bandwidth_gbps,
            self.network_bandwidth_mbps
        )
    }
}
