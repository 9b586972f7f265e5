//! Joint-readout correlation histograms, split by Bell-state parity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::event::EventTable;

// ---------------------------------------------------------------------------
// Classification enums
// ---------------------------------------------------------------------------

/// Bell-state class heralded by the click-channel pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParityClass {
    Psi1,
    Psi2,
}

impl ParityClass {
    pub const ALL: [ParityClass; 2] = [ParityClass::Psi1, ParityClass::Psi2];
}

impl fmt::Display for ParityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParityClass::Psi1 => f.write_str("psi1"),
            ParityClass::Psi2 => f.write_str("psi2"),
        }
    }
}

/// Measurement setting; the discriminant is the tensor index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Basis {
    ZZ = 0,
    XX = 1,
    XmX = 2,
}

impl Basis {
    pub const ALL: [Basis; 3] = [Basis::ZZ, Basis::XX, Basis::XmX];

    pub fn index(self) -> usize {
        self as usize
    }

    /// File-system safe name, used for data folders and event tables.
    pub fn label(self) -> &'static str {
        match self {
            Basis::ZZ => "ZZ",
            Basis::XX => "XX",
            Basis::XmX => "XmX",
        }
    }
}

impl fmt::Display for Basis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Basis::ZZ => f.write_str("ZZ"),
            Basis::XX => f.write_str("XX"),
            Basis::XmX => f.write_str("X-X"),
        }
    }
}

impl FromStr for ParityClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "psi1" | "1" => Ok(ParityClass::Psi1),
            "psi2" | "2" => Ok(ParityClass::Psi2),
            other => Err(format!("unknown parity class {other:?} (expected psi1 or psi2)")),
        }
    }
}

impl FromStr for Basis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ZZ" => Ok(Basis::ZZ),
            "XX" => Ok(Basis::XX),
            "XMX" | "X-X" => Ok(Basis::XmX),
            other => Err(format!("unknown basis {other:?} (expected ZZ, XX or XmX)")),
        }
    }
}

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Counts per joint outcome, ordered `[00, 01, 10, 11]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationHistogram(pub [u64; 4]);

impl CorrelationHistogram {
    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn counts(&self) -> [u64; 4] {
        self.0
    }

    /// Bins in `[11, 10, 01, 00]` order, as the readout corrector consumes them.
    pub fn reversed(&self) -> [u64; 4] {
        let [a, b, c, d] = self.0;
        [d, c, b, a]
    }

    fn increment(&mut self, bin: usize) {
        self.0[bin] += 1;
    }
}

/// Both parity histograms of one event table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlations {
    pub psi1: CorrelationHistogram,
    pub psi2: CorrelationHistogram,
}

impl Correlations {
    pub fn get(&self, parity: ParityClass) -> &CorrelationHistogram {
        match parity {
            ParityClass::Psi1 => &self.psi1,
            ParityClass::Psi2 => &self.psi2,
        }
    }

    /// False when either class is empty; readout correction is undefined then.
    pub fn sufficient(&self) -> bool {
        !self.psi1.is_empty() && !self.psi2.is_empty()
    }
}

/// Histogram every event of `table` into its parity class.
///
/// Returns the histograms and whether both classes have counts.
pub fn correlate(table: &EventTable) -> (Correlations, bool) {
    let mut c = Correlations::default();
    for e in table {
        let bin = e.outcome_bin();
        match e.parity() {
            ParityClass::Psi1 => c.psi1.increment(bin),
            ParityClass::Psi2 => c.psi2.increment(bin),
        }
    }
    let ok = c.sufficient();
    (c, ok)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
