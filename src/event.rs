//! Detection records, heralding events, and the event table.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::correlate::ParityClass;
use crate::error::{FidelityError, Result, ResultExt as _};

// ---------------------------------------------------------------------------
// Raw input records
// ---------------------------------------------------------------------------

/// One time-tagger record: a photon click or a sync marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDetection {
    pub sync: u64,
    pub time: i64,
    pub channel: u8,
    /// Non-zero for marker records.
    pub marker: u8,
}

impl RawDetection {
    pub fn photon(sync: u64, time: i64, channel: u8) -> Self {
        Self {
            sync,
            time,
            channel,
            marker: 0,
        }
    }

    pub fn sync_marker(sync: u64) -> Self {
        Self {
            sync,
            time: 0,
            channel: 0,
            marker: 1,
        }
    }

    pub fn is_marker(&self) -> bool {
        self.marker != 0
    }
}

/// Per-shot readout data, one row per sync marker of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShotOutcome {
    pub ssro1: u32,
    pub ssro2: u32,
    pub cr1: u32,
    pub cr2: u32,
    pub gate: i32,
}

// ---------------------------------------------------------------------------
// Heralding event
// ---------------------------------------------------------------------------

/// A candidate entanglement event: one click per node plus both readouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeraldEvent {
    pub t1: i64,
    pub t2: i64,
    pub ch1: u8,
    pub ch2: u8,
    pub ro1: u32,
    pub ro2: u32,
    pub cr1: u32,
    pub cr2: u32,
    pub gp: i32,
}

impl HeraldEvent {
    /// Same-channel clicks herald psi1, different channels psi2.
    pub fn parity(&self) -> ParityClass {
        if self.ch1 == self.ch2 {
            ParityClass::Psi1
        } else {
            ParityClass::Psi2
        }
    }

    /// Joint readout bin: `2*[RO1 == 0] + [RO2 == 0]`.
    pub fn outcome_bin(&self) -> usize {
        (usize::from(self.ro1 == 0) << 1) | usize::from(self.ro2 == 0)
    }
}

// ---------------------------------------------------------------------------
// Event table
// ---------------------------------------------------------------------------

/// Ordered, growable collection of heralding events.
///
/// Filters never mutate a table; they return a new one, so a loaded table
/// can serve as the pristine snapshot for every sweep point.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventTable {
    events: Vec<HeraldEvent>,
}

impl EventTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            events: Vec::with_capacity(n),
        }
    }

    pub fn push(&mut self, event: HeraldEvent) {
        self.events.push(event);
    }

    pub fn append(&mut self, other: EventTable) {
        self.events.extend(other.events);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[HeraldEvent] {
        &self.events
    }

    pub fn iter(&self) -> std::slice::Iter<'_, HeraldEvent> {
        self.events.iter()
    }

    /// Independent copy of the table.
    pub fn snapshot(&self) -> EventTable {
        self.clone()
    }

    /// New table holding the events that satisfy `keep`, in order.
    pub fn select<F>(&self, mut keep: F) -> EventTable
    where
        F: FnMut(&HeraldEvent) -> bool,
    {
        self.events.iter().copied().filter(|e| keep(e)).collect()
    }

    /// Load a table previously written by [`EventTable::write_csv`].
    pub fn read_csv(path: &Path) -> Result<Self> {
        let mut rdr = csv::Reader::from_path(path)
            .ctx_extract(&format!("open events {}", path.display()))?;
        let mut table = EventTable::new();
        for (row, rec) in rdr.deserialize::<HeraldEvent>().enumerate() {
            let event = rec.ctx_extract(&format!("{} row {}", path.display(), row + 1))?;
            if event.ch1 > 1 || event.ch2 > 1 {
                return Err(FidelityError::Extract(format!(
                    "{} row {}: channel out of range",
                    path.display(),
                    row + 1
                )));
            }
            table.push(event);
        }
        info!(path = %path.display(), events = table.len(), "event table loaded");
        Ok(table)
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut wtr = csv::Writer::from_path(path)?;
        for e in &self.events {
            wtr.serialize(e)?;
        }
        wtr.flush()?;
        info!(path = %path.display(), events = self.len(), "event table saved");
        Ok(())
    }
}

impl FromIterator<HeraldEvent> for EventTable {
    fn from_iter<I: IntoIterator<Item = HeraldEvent>>(iter: I) -> Self {
        Self {
            events: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a EventTable {
    type Item = &'a HeraldEvent;
    type IntoIter = std::slice::Iter<'a, HeraldEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
