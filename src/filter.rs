//! Detection-window, coincidence-time and gate-phase cuts.

use serde::{Deserialize, Serialize};

use crate::error::{FidelityError, Result};
use crate::event::{EventTable, HeraldEvent};

/// Cut parameters for [`filter_times`].
///
/// Node A accepts `[start[CH1], start[CH1] + window1]`, node B accepts
/// `[start[CH2], start[CH2] + window2]`.  The coincidence difference is
/// taken after shifting channel 1 by `start[1] - start[0]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterParameters {
    pub channel_starts: [i64; 2],
    pub window1: i64,
    pub window2: i64,
    pub dt_min: i64,
    pub dt_max: i64,
}

impl Default for FilterParameters {
    fn default() -> Self {
        Self {
            channel_starts: [640, 670],
            window1: 200,
            window2: 200,
            dt_min: 0,
            dt_max: 50,
        }
    }
}

impl FilterParameters {
    pub fn validate(&self) -> Result<()> {
        if self.window1 < 0 || self.window2 < 0 {
            return Err(FidelityError::Filter(format!(
                "negative window width ({}, {})",
                self.window1, self.window2
            )));
        }
        if self.dt_min < 0 || self.dt_min > self.dt_max {
            return Err(FidelityError::Filter(format!(
                "invalid dt range [{}, {}]",
                self.dt_min, self.dt_max
            )));
        }
        Ok(())
    }

    fn start(&self, ch: u8) -> Option<i64> {
        self.channel_starts.get(usize::from(ch)).copied()
    }

    /// Clock-aligned time difference between the two heralding clicks.
    ///
    /// `None` when either click is on a channel other than 0 or 1.
    pub fn corrected_dt(&self, e: &HeraldEvent) -> Option<i64> {
        let base = self.channel_starts[0];
        let t1 = e.t1 - (self.start(e.ch1)? - base);
        let t2 = e.t2 - (self.start(e.ch2)? - base);
        Some((t2 - t1).abs())
    }

    /// Events on an unknown channel are rejected.
    pub fn accepts(&self, e: &HeraldEvent) -> bool {
        let in_window = |t: i64, ch: u8, width: i64| {
            self.start(ch)
                .is_some_and(|start| t >= start && t <= start + width)
        };
        if !in_window(e.t1, e.ch1, self.window1) || !in_window(e.t2, e.ch2, self.window2) {
            return false;
        }
        self.corrected_dt(e)
            .is_some_and(|dt| dt >= self.dt_min && dt <= self.dt_max)
    }
}

/// Events passing the window and coincidence cuts, as a new table.
pub fn filter_times(table: &EventTable, params: &FilterParameters) -> EventTable {
    table.select(|e| params.accepts(e))
}

/// Events of the correct excitation sub-cycle (`GP > 0`).
pub fn filter_gate_phase(table: &EventTable) -> EventTable {
    table.select(|e| e.gp > 0)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
