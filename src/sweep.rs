//! Parameter sweep over (dt threshold, window-1 width, window-2 width).
//!
//! Every grid point re-filters the three pristine basis tables, histograms
//! them, and estimates both parity fidelities.  Points are independent, so
//! they are evaluated into immutable [`PointOutcome`] records (optionally
//! on the rayon pool) and written into the tensors afterwards.

use ndarray::{Array3, Array5, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ReadoutConfig, SweepConfig};
use crate::correlate::{correlate, Basis, Correlations, ParityClass};
use crate::error::{FidelityError, Result, ResultExt as _};
use crate::event::EventTable;
use crate::fidelity::{get_fidelity, BasisHistograms, CorrectionMode, FidelityResult};
use crate::filter::{filter_gate_phase, filter_times, FilterParameters};
use crate::readout::{ConfusionMatrixCorrector, ReadoutCorrector};
use crate::util;

static DEFAULT_CORRECTOR: ConfusionMatrixCorrector = ConfusionMatrixCorrector;

pub type GridIndex = (usize, usize, usize);

// ---------------------------------------------------------------------------
// Grid and settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepGrid {
    pub dt: Vec<i64>,
    pub win1: Vec<i64>,
    pub win2: Vec<i64>,
}

impl SweepGrid {
    pub fn new(dt: Vec<i64>, win1: Vec<i64>, win2: Vec<i64>) -> Result<Self> {
        util::validate_axis(&dt, "dt")?;
        util::validate_axis(&win1, "win1")?;
        util::validate_axis(&win2, "win2")?;
        Ok(Self { dt, win1, win2 })
    }

    pub fn from_config(cfg: &SweepConfig) -> Result<Self> {
        Self::new(cfg.dt.values()?, cfg.win1.values()?, cfg.win2.values()?)
    }

    pub fn shape(&self) -> GridIndex {
        (self.dt.len(), self.win1.len(), self.win2.len())
    }

    pub fn len(&self) -> usize {
        self.dt.len() * self.win1.len() * self.win2.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All coordinates in row-major order.
    pub fn coordinates(&self) -> Vec<GridIndex> {
        let (ni, nj, nk) = self.shape();
        let mut out = Vec::with_capacity(self.len());
        for i in 0..ni {
            for j in 0..nj {
                for k in 0..nk {
                    out.push((i, j, k));
                }
            }
        }
        out
    }

    pub fn nearest(&self, dt: i64, win1: i64, win2: i64) -> Option<GridIndex> {
        Some((
            util::nearest_index(&self.dt, dt)?,
            util::nearest_index(&self.win1, win1)?,
            util::nearest_index(&self.win2, win2)?,
        ))
    }
}

/// Everything besides the axes that determines a sweep's numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSettings {
    pub ch0_start: i64,
    pub ch1_offset: i64,
    /// Fixed dt floor, unused for all but the first slice when slicing.
    pub dt_min: i64,
    /// Use the previous dt value as floor (differential statistics).
    pub dt_slices: bool,
    pub mode: CorrectionMode,
}

impl SweepSettings {
    pub fn from_config(cfg: &SweepConfig) -> Self {
        Self {
            ch0_start: cfg.ch0_start,
            ch1_offset: cfg.ch1_offset,
            dt_min: cfg.dt_min,
            dt_slices: cfg.dt_slices,
            mode: cfg.mode,
        }
    }

    pub fn filter_params(&self, grid: &SweepGrid, (i, j, k): GridIndex) -> FilterParameters {
        let dt_min = if self.dt_slices && i > 0 {
            grid.dt[i - 1]
        } else {
            self.dt_min
        };
        FilterParameters {
            channel_starts: [self.ch0_start, self.ch0_start + self.ch1_offset],
            window1: grid.win1[j],
            window2: grid.win2[k],
            dt_min,
            dt_max: grid.dt[i],
        }
    }
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Pristine event tables of the three bases.
#[derive(Debug, Clone, Default)]
pub struct BasisTables {
    pub zz: EventTable,
    pub xx: EventTable,
    pub xmx: EventTable,
}

impl BasisTables {
    /// Keep only correct-gate-phase events of each table.
    pub fn gate_filtered(zz: &EventTable, xx: &EventTable, xmx: &EventTable) -> Self {
        Self {
            zz: filter_gate_phase(zz),
            xx: filter_gate_phase(xx),
            xmx: filter_gate_phase(xmx),
        }
    }

    pub fn get(&self, basis: Basis) -> &EventTable {
        match basis {
            Basis::ZZ => &self.zz,
            Basis::XX => &self.xx,
            Basis::XmX => &self.xmx,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-point evaluation
// ---------------------------------------------------------------------------

/// Result of one fully evaluated grid point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointOutcome {
    pub psi1_hists: BasisHistograms,
    pub psi2_hists: BasisHistograms,
    pub psi1: FidelityResult,
    pub psi2: FidelityResult,
}

/// Filter, histogram and estimate one grid point.
///
/// `Ok(None)` means some basis lacks counts in a parity class.
pub fn evaluate_point(
    tables: &BasisTables,
    params: &FilterParameters,
    mode: CorrectionMode,
    corrector: &dyn ReadoutCorrector,
    readout: &ReadoutConfig,
) -> Result<Option<PointOutcome>> {
    params.validate()?;

    let mut per_basis = [Correlations::default(); 3];
    for basis in Basis::ALL {
        let filtered = filter_times(tables.get(basis), params);
        let (c, ok) = correlate(&filtered);
        if !ok {
            return Ok(None);
        }
        per_basis[basis.index()] = c;
    }

    let hists_for = |parity: ParityClass| BasisHistograms {
        zz: *per_basis[Basis::ZZ.index()].get(parity),
        xx: *per_basis[Basis::XX.index()].get(parity),
        xmx: *per_basis[Basis::XmX.index()].get(parity),
    };
    let psi1_hists = hists_for(ParityClass::Psi1);
    let psi2_hists = hists_for(ParityClass::Psi2);

    let psi1 = get_fidelity(&psi1_hists, ParityClass::Psi1, mode, corrector, readout)?;
    let psi2 = get_fidelity(&psi2_hists, ParityClass::Psi2, mode, corrector, readout)?;

    Ok(Some(PointOutcome {
        psi1_hists,
        psi2_hists,
        psi1,
        psi2,
    }))
}

// ---------------------------------------------------------------------------
// Result tensors
// ---------------------------------------------------------------------------

/// Dense per-parity tensors; correlation tensors are `[.., basis, outcome]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParityTensors {
    pub fidelity: Array3<f64>,
    pub fidelity_uncertainty: Array3<f64>,
    pub raw: Array5<u64>,
    pub corrected: Array5<f64>,
    pub corrected_uncertainty: Array5<f64>,
}

impl ParityTensors {
    pub fn zeros((ni, nj, nk): GridIndex) -> Self {
        Self {
            fidelity: Array3::zeros((ni, nj, nk)),
            fidelity_uncertainty: Array3::zeros((ni, nj, nk)),
            raw: Array5::zeros((ni, nj, nk, 3, 4)),
            corrected: Array5::zeros((ni, nj, nk, 3, 4)),
            corrected_uncertainty: Array5::zeros((ni, nj, nk, 3, 4)),
        }
    }

    fn write(&mut self, (i, j, k): GridIndex, hists: &BasisHistograms, result: &FidelityResult) {
        self.fidelity[[i, j, k]] = result.fidelity;
        self.fidelity_uncertainty[[i, j, k]] = result.uncertainty;
        for basis in Basis::ALL {
            let b = basis.index();
            let counts = hists.get(basis).counts();
            let corrected = result.corrected(basis);
            for o in 0..4 {
                self.raw[[i, j, k, b, o]] = counts[o];
                self.corrected[[i, j, k, b, o]] = corrected.p[o];
                self.corrected_uncertainty[[i, j, k, b, o]] = corrected.u[o];
            }
        }
    }

    /// Leading three dimensions of every tensor.
    pub fn grid_shapes(&self) -> [GridIndex; 5] {
        let lead = |s: &[usize]| (s[0], s[1], s[2]);
        [
            lead(self.fidelity.shape()),
            lead(self.fidelity_uncertainty.shape()),
            lead(self.raw.shape()),
            lead(self.corrected.shape()),
            lead(self.corrected_uncertainty.shape()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepResult {
    pub run_id: Uuid,
    pub grid: SweepGrid,
    pub settings: SweepSettings,
    /// Cells that were fully evaluated; all others hold zeros.
    pub evaluated: Array3<bool>,
    pub psi1: ParityTensors,
    pub psi2: ParityTensors,
}

/// Read-only view of one grid point.
#[derive(Debug, Clone, Serialize)]
pub struct PointSummary {
    pub parity: ParityClass,
    pub index: GridIndex,
    pub dt: i64,
    pub win1: i64,
    pub win2: i64,
    pub evaluated: bool,
    pub raw: [[u64; 4]; 3],
    pub corrected: [[f64; 4]; 3],
    pub corrected_uncertainty: [[f64; 4]; 3],
    pub fidelity: f64,
    pub fidelity_uncertainty: f64,
}

/// The chosen best grid point of a parity class.
#[derive(Debug, Clone, Serialize)]
pub struct GridOptimum {
    pub parity: ParityClass,
    pub index: GridIndex,
    pub dt: i64,
    pub win1: i64,
    pub win2: i64,
    pub fidelity: f64,
    pub uncertainty: f64,
    pub sigma: f64,
    pub events: u64,
}

impl SweepResult {
    pub fn parity(&self, parity: ParityClass) -> &ParityTensors {
        match parity {
            ParityClass::Psi1 => &self.psi1,
            ParityClass::Psi2 => &self.psi2,
        }
    }

    /// `(F - 1/2) / uF`; cells never evaluated are 0.
    pub fn significance_map(&self, parity: ParityClass) -> Array3<f64> {
        let t = self.parity(parity);
        let mut out = Array3::zeros(self.evaluated.raw_dim());
        for ((idx, &done), s) in self.evaluated.indexed_iter().zip(out.iter_mut()) {
            if done {
                *s = (t.fidelity[idx] - 0.5) / t.fidelity_uncertainty[idx];
            }
        }
        out
    }

    /// Total raw events over all bases and outcomes per cell.
    pub fn event_count_map(&self, parity: ParityClass) -> Array3<u64> {
        self.parity(parity).raw.sum_axis(Axis(4)).sum_axis(Axis(3))
    }

    pub fn point_summary(
        &self,
        parity: ParityClass,
        dt: i64,
        win1: i64,
        win2: i64,
    ) -> Option<PointSummary> {
        let (i, j, k) = self.grid.nearest(dt, win1, win2)?;
        let t = self.parity(parity);
        let mut raw = [[0u64; 4]; 3];
        let mut corrected = [[0.0; 4]; 3];
        let mut corrected_uncertainty = [[0.0; 4]; 3];
        for b in 0..3 {
            for o in 0..4 {
                raw[b][o] = t.raw[[i, j, k, b, o]];
                corrected[b][o] = t.corrected[[i, j, k, b, o]];
                corrected_uncertainty[b][o] = t.corrected_uncertainty[[i, j, k, b, o]];
            }
        }
        Some(PointSummary {
            parity,
            index: (i, j, k),
            dt: self.grid.dt[i],
            win1: self.grid.win1[j],
            win2: self.grid.win2[k],
            evaluated: self.evaluated[[i, j, k]],
            raw,
            corrected,
            corrected_uncertainty,
            fidelity: t.fidelity[[i, j, k]],
            fidelity_uncertainty: t.fidelity_uncertainty[[i, j, k]],
        })
    }

    /// Evaluated cell with the highest fidelity, optionally requiring a
    /// minimum significance.
    ///
    /// Equal fidelities go to the cell with more events, then to the
    /// lowest grid index; tied candidates are logged.
    pub fn best_point(&self, parity: ParityClass, min_sigma: Option<f64>) -> Option<GridOptimum> {
        let t = self.parity(parity);
        let sigma = self.significance_map(parity);
        let events = self.event_count_map(parity);

        let candidates: Vec<GridOptimum> = self
            .grid
            .coordinates()
            .into_iter()
            .filter(|&(i, j, k)| self.evaluated[[i, j, k]])
            .filter(|&(i, j, k)| min_sigma.map_or(true, |m| sigma[[i, j, k]] >= m))
            .map(|(i, j, k)| GridOptimum {
                parity,
                index: (i, j, k),
                dt: self.grid.dt[i],
                win1: self.grid.win1[j],
                win2: self.grid.win2[k],
                fidelity: t.fidelity[[i, j, k]],
                uncertainty: t.fidelity_uncertainty[[i, j, k]],
                sigma: sigma[[i, j, k]],
                events: events[[i, j, k]],
            })
            .collect();

        let max_f = candidates
            .iter()
            .map(|c| c.fidelity)
            .fold(f64::NEG_INFINITY, f64::max);
        let tied: Vec<&GridOptimum> = candidates.iter().filter(|c| c.fidelity == max_f).collect();

        if tied.len() > 1 {
            for c in &tied {
                info!(
                    %parity,
                    index = ?c.index,
                    fidelity = c.fidelity,
                    events = c.events,
                    "tied optimum candidate"
                );
            }
        }

        tied.into_iter()
            .fold(None::<&GridOptimum>, |best, c| match best {
                Some(b) if b.events >= c.events => Some(b),
                _ => Some(c),
            })
            .cloned()
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Runs the Filter -> Correlate -> Correct -> Estimate pipeline over a grid.
pub struct SweepDriver<'a> {
    grid: SweepGrid,
    settings: SweepSettings,
    readout: ReadoutConfig,
    corrector: &'a dyn ReadoutCorrector,
    parallel: bool,
}

impl std::fmt::Debug for SweepDriver<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepDriver")
            .field("grid", &self.grid.shape())
            .field("settings", &self.settings)
            .field("parallel", &self.parallel)
            .finish_non_exhaustive()
    }
}

impl SweepDriver<'static> {
    pub fn new(grid: SweepGrid, settings: SweepSettings, readout: ReadoutConfig) -> Self {
        Self {
            grid,
            settings,
            readout,
            corrector: &DEFAULT_CORRECTOR,
            parallel: false,
        }
    }
}

impl<'a> SweepDriver<'a> {
    pub fn with_corrector<'b>(self, corrector: &'b dyn ReadoutCorrector) -> SweepDriver<'b> {
        SweepDriver {
            grid: self.grid,
            settings: self.settings,
            readout: self.readout,
            corrector,
            parallel: self.parallel,
        }
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn run(&self, tables: &BasisTables) -> Result<SweepResult> {
        self.readout.validate()?;
        if self.grid.is_empty() {
            return Err(FidelityError::Sweep("empty grid".into()));
        }

        let coords = self.grid.coordinates();
        info!(
            points = coords.len(),
            mode = %self.settings.mode,
            dt_slices = self.settings.dt_slices,
            parallel = self.parallel,
            zz = tables.zz.len(),
            xx = tables.xx.len(),
            xmx = tables.xmx.len(),
            "starting sweep"
        );

        let eval = |&idx: &GridIndex| {
            let params = self.settings.filter_params(&self.grid, idx);
            let outcome = evaluate_point(
                tables,
                &params,
                self.settings.mode,
                self.corrector,
                &self.readout,
            )
            .ctx_sweep(&format!("point {idx:?}"));
            (idx, outcome)
        };
        let outcomes: Vec<_> = if self.parallel {
            coords.par_iter().map(eval).collect()
        } else {
            coords.iter().map(eval).collect()
        };

        let shape = self.grid.shape();
        let mut result = SweepResult {
            run_id: Uuid::new_v4(),
            grid: self.grid.clone(),
            settings: self.settings,
            evaluated: Array3::from_elem(shape, false),
            psi1: ParityTensors::zeros(shape),
            psi2: ParityTensors::zeros(shape),
        };

        let (mut done, mut sparse, mut failed) = (0usize, 0usize, 0usize);
        for (idx, outcome) in outcomes {
            match outcome {
                Ok(Some(p)) => {
                    result.psi1.write(idx, &p.psi1_hists, &p.psi1);
                    result.psi2.write(idx, &p.psi2_hists, &p.psi2);
                    let (i, j, k) = idx;
                    result.evaluated[[i, j, k]] = true;
                    done += 1;
                    debug!(index = ?idx, f_psi1 = p.psi1.fidelity, f_psi2 = p.psi2.fidelity, "point evaluated");
                }
                Ok(None) => {
                    sparse += 1;
                    debug!(index = ?idx, "insufficient statistics; skipped");
                }
                Err(e) => {
                    failed += 1;
                    warn!(index = ?idx, error = %e, "grid point failed; skipped");
                }
            }
        }

        info!(run_id = %result.run_id, evaluated = done, insufficient = sparse, failed, "sweep finished");
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
