//! Simulated time-tagger runs for development, tests and benchmarks.
//!
//! Each shot heralds psi1 or psi2 with equal probability and draws joint
//! readout outcomes from a state of the given visibility `v`.  Without
//! readout errors the raw-mode fidelity of such data is `v`.

use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng as _};
use tracing::info;

use crate::config::ExtractionConfig;
use crate::correlate::{Basis, ParityClass};
use crate::error::{FidelityError, Result};
use crate::event::{EventTable, RawDetection, ShotOutcome};
use crate::extract::{self, detection_file_name, outcome_file_name};

/// Detection and outcome streams of one run.
#[derive(Debug, Clone, Default)]
pub struct SimulatedRun {
    pub detections: Vec<RawDetection>,
    pub outcomes: Vec<ShotOutcome>,
}

/// A seeded generator of heralded-entanglement runs.
#[derive(Debug)]
pub struct RunSimulator {
    /// Sync markers per run.
    pub shots: usize,
    /// State visibility in [0, 1].
    pub visibility: f64,
    /// Probability of an extra click making the first window ambiguous.
    pub noise_click_prob: f64,
    /// Maximum clock-aligned time difference between the two clicks.
    pub dt_spread: i64,
    /// Fraction of shots flagged with the wrong gate phase.
    pub bad_gate_fraction: f64,
    pub ch0_start: i64,
    pub ch1_offset: i64,
    rng: StdRng,
}

impl Default for RunSimulator {
    fn default() -> Self {
        Self::new(0x1DEF_1D)
    }
}

impl RunSimulator {
    pub fn new(seed: u64) -> Self {
        Self {
            shots: 2000,
            visibility: 0.9,
            noise_click_prob: 0.02,
            dt_spread: 40,
            bad_gate_fraction: 0.05,
            ch0_start: 640,
            ch1_offset: 30,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let unit = |x: f64| (0.0..=1.0).contains(&x);
        if !unit(self.visibility) || !unit(self.noise_click_prob) || !unit(self.bad_gate_fraction)
        {
            return Err(FidelityError::Validation(
                "simulator probabilities must lie in [0, 1]".into(),
            ));
        }
        if self.dt_spread < 0 {
            return Err(FidelityError::Validation("negative dt spread".into()));
        }
        Ok(())
    }

    fn channel_start(&self, ch: u8) -> i64 {
        if ch == 0 {
            self.ch0_start
        } else {
            self.ch0_start + self.ch1_offset
        }
    }

    /// Joint outcome bits `(b1, b2)`; bin index is `2*b1 + b2`.
    fn outcome_bits(&mut self, basis: Basis, parity: ParityClass) -> (bool, bool) {
        let agree = (1.0 - self.visibility) / 2.0;
        // probability that the two bits are equal
        let p_equal = match (basis, parity) {
            (Basis::ZZ, _) => agree,
            (Basis::XX, ParityClass::Psi1) | (Basis::XmX, ParityClass::Psi2) => 1.0 - agree,
            (Basis::XX, ParityClass::Psi2) | (Basis::XmX, ParityClass::Psi1) => agree,
        };
        let b1 = self.rng.random_bool(0.5);
        let equal = self.rng.random_bool(p_equal);
        (b1, if equal { b1 } else { !b1 })
    }

    fn readout(&mut self, dark: bool) -> u32 {
        if dark {
            0
        } else {
            self.rng.random_range(1..6)
        }
    }

    pub fn simulate_run(&mut self, basis: Basis) -> Result<SimulatedRun> {
        self.validate()?;
        let mut run = SimulatedRun::default();
        for shot in 0..self.shots as u64 {
            let (w1, w2) = (2 * shot, 2 * shot + 1);

            let ch1 = u8::from(self.rng.random_bool(0.5));
            let parity = if self.rng.random_bool(0.5) {
                ParityClass::Psi1
            } else {
                ParityClass::Psi2
            };
            let ch2 = match parity {
                ParityClass::Psi1 => ch1,
                ParityClass::Psi2 => 1 - ch1,
            };

            let aligned = self.ch0_start + self.rng.random_range(0..=60);
            let jitter = self.rng.random_range(-self.dt_spread..=self.dt_spread);
            let t1 = aligned + self.channel_start(ch1) - self.ch0_start;
            let t2 = aligned + 40 + jitter + self.channel_start(ch2) - self.ch0_start;

            run.detections.push(RawDetection::photon(w1, t1, ch1));
            if self.rng.random_bool(self.noise_click_prob) {
                let extra = self.ch0_start + self.rng.random_range(0..=150);
                run.detections.push(RawDetection::photon(w1, extra, self.rng.random_range(0..=1)));
            }
            run.detections.push(RawDetection::photon(w2, t2, ch2));
            run.detections.push(RawDetection::sync_marker(w2));

            let (b1, b2) = self.outcome_bits(basis, parity);
            let ssro1 = self.readout(b1);
            let ssro2 = self.readout(b2);
            let gate = if self.rng.random_bool(self.bad_gate_fraction) { 0 } else { 1 };
            run.outcomes.push(ShotOutcome {
                ssro1,
                ssro2,
                cr1: self.rng.random_range(20..60),
                cr2: self.rng.random_range(20..60),
                gate,
            });
        }
        Ok(run)
    }

    /// Simulate a run and extract its events with the default window.
    pub fn simulate_events(&mut self, basis: Basis) -> Result<EventTable> {
        let cfg = ExtractionConfig::default();
        let run = self.simulate_run(basis)?;
        extract::extract(&run.detections, &run.outcomes, cfg.start, cfg.stop)
    }

    /// Write `runs_per_basis` runs of every basis below `root/<basis>/`.
    pub fn write_dataset(
        &mut self,
        root: &Path,
        cfg: &ExtractionConfig,
        runs_per_basis: u32,
    ) -> Result<Vec<PathBuf>> {
        self.validate()?;
        let mut written = Vec::new();
        for basis in Basis::ALL {
            let dir = root.join(basis.label());
            std::fs::create_dir_all(&dir)?;
            for index in 0..runs_per_basis {
                let run = self.simulate_run(basis)?;
                let det = dir.join(detection_file_name(cfg, index));
                let out = dir.join(outcome_file_name(cfg, index));
                extract::write_detections(&det, &run.detections)?;
                extract::write_outcomes(&out, &run.outcomes)?;
                written.push(det);
                written.push(out);
            }
        }
        info!(
            root = %root.display(),
            files = written.len(),
            visibility = self.visibility,
            "simulated dataset written"
        );
        Ok(written)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlate::correlate;

    #[test]
    fn same_seed_same_run() {
        let a = RunSimulator::new(7).simulate_run(Basis::XX).unwrap();
        let b = RunSimulator::new(7).simulate_run(Basis::XX).unwrap();
        assert_eq!(a.detections, b.detections);
        assert_eq!(a.outcomes, b.outcomes);
    }

    #[test]
    fn one_outcome_per_marker() {
        let run = RunSimulator::new(1).simulate_run(Basis::ZZ).unwrap();
        let markers = run.detections.iter().filter(|d| d.is_marker()).count();
        assert_eq!(markers, run.outcomes.len());
    }

    #[test]
    fn perfect_state_zz_is_anticorrelated() {
        let mut sim = RunSimulator::new(3);
        sim.visibility = 1.0;
        sim.noise_click_prob = 0.0;
        let events = sim.simulate_events(Basis::ZZ).unwrap();
        assert_eq!(events.len(), sim.shots);
        let (c, ok) = correlate(&events);
        assert!(ok);
        for h in [c.psi1, c.psi2] {
            assert_eq!(h.counts()[0], 0);
            assert_eq!(h.counts()[3], 0);
        }
    }

    #[test]
    fn noise_clicks_drop_cycles() {
        let mut sim = RunSimulator::new(5);
        sim.noise_click_prob = 0.5;
        let events = sim.simulate_events(Basis::XmX).unwrap();
        assert!(events.len() < sim.shots);
        assert!(!events.is_empty());
    }

    #[test]
    fn invalid_visibility_rejected() {
        let mut sim = RunSimulator::new(0);
        sim.visibility = 1.5;
        assert!(sim.simulate_events(Basis::ZZ).is_err());
    }
}
