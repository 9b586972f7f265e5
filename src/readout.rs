//! Single-shot-readout correction of joint-outcome histograms.
//!
//! The corrector works on counts ordered by `2a + b`, where bit `a` (`b`) is
//! the photon-count result of node A (B): 0 is dark (ms=1, read out with
//! fidelity `F1`) and 1 is bright (ms=0, fidelity `F0`).  Histograms from
//! [`crate::correlate`] are in ms order (`[00, 01, 10, 11]`, bit 1 = dark),
//! so they are fed in reversed and the results are reversed back by
//! [`correct_histogram`]; callers must go through it.

use serde::{Deserialize, Serialize};

use crate::correlate::CorrelationHistogram;
use crate::error::{FidelityError, Result};

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Readout fidelities of both nodes with their uncertainties.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReadoutFidelities {
    pub f0_a: f64,
    pub f0_b: f64,
    pub f1_a: f64,
    pub f1_b: f64,
    pub u_f0_a: f64,
    pub u_f0_b: f64,
    pub u_f1_a: f64,
    pub u_f1_b: f64,
}

impl ReadoutFidelities {
    /// Perfect readout on both nodes.
    pub fn identity() -> Self {
        Self {
            f0_a: 1.0,
            f0_b: 1.0,
            f1_a: 1.0,
            f1_b: 1.0,
            u_f0_a: 0.0,
            u_f0_b: 0.0,
            u_f1_a: 0.0,
            u_f1_b: 0.0,
        }
    }

    /// Same parameters with node B's `F1` replaced.
    pub fn with_f1_b(self, f1_b: f64, u_f1_b: f64) -> Self {
        Self {
            f1_b,
            u_f1_b,
            ..self
        }
    }

    /// `[F0_A, F0_B, F1_A, F1_B, uF0_A, uF0_B, uF1_A, uF1_B]`.
    pub fn as_array(&self) -> [f64; 8] {
        [
            self.f0_a, self.f0_b, self.f1_a, self.f1_b, self.u_f0_a, self.u_f0_b, self.u_f1_a,
            self.u_f1_b,
        ]
    }

    pub fn validate(&self) -> Result<()> {
        let [f0a, f0b, f1a, f1b, u0a, u0b, u1a, u1b] = self.as_array();
        for (name, f) in [("F0_A", f0a), ("F0_B", f0b), ("F1_A", f1a), ("F1_B", f1b)] {
            if !f.is_finite() || f <= 0.5 || f > 1.0 {
                return Err(FidelityError::Validation(format!(
                    "readout fidelity {name} = {f} outside (0.5, 1]"
                )));
            }
        }
        for u in [u0a, u0b, u1a, u1b] {
            if !u.is_finite() || u < 0.0 {
                return Err(FidelityError::Validation(format!(
                    "readout fidelity uncertainty {u} must be finite and >= 0"
                )));
            }
        }
        Ok(())
    }
}

/// Corrected joint-state probabilities and their one-sigma uncertainties.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrectedProbabilities {
    pub p: [f64; 4],
    pub u: [f64; 4],
}

// ---------------------------------------------------------------------------
// Corrector trait
// ---------------------------------------------------------------------------

/// Unmixes observed joint-outcome counts into joint-state probabilities.
///
/// All methods take counts in corrector order (see module docs).  Results
/// are not projected onto the simplex; components may leave `[0, 1]`.
pub trait ReadoutCorrector: Send + Sync {
    fn correct(&self, counts: &[u64; 4], fids: &ReadoutFidelities)
        -> Result<CorrectedProbabilities>;

    /// Uncertainty of `p[1] + p[2]`.
    fn mixed_term_uncertainty(&self, counts: &[u64; 4], fids: &ReadoutFidelities) -> Result<f64>;

    /// Uncertainty of `sqrt(max(p[0], 0) * max(p[3], 0))`.
    fn coherence_term_uncertainty(
        &self,
        counts: &[u64; 4],
        fids: &ReadoutFidelities,
    ) -> Result<f64>;
}

/// Correct a histogram in `[00, 01, 10, 11]` order through the reversed
/// corrector convention; the result is in histogram order again.
pub fn correct_histogram(
    corrector: &dyn ReadoutCorrector,
    hist: &CorrelationHistogram,
    fids: &ReadoutFidelities,
) -> Result<CorrectedProbabilities> {
    let c = corrector.correct(&hist.reversed(), fids)?;
    Ok(CorrectedProbabilities {
        p: reverse4(c.p),
        u: reverse4(c.u),
    })
}

fn reverse4(v: [f64; 4]) -> [f64; 4] {
    [v[3], v[2], v[1], v[0]]
}

// ---------------------------------------------------------------------------
// Confusion-matrix implementation
// ---------------------------------------------------------------------------

type Mat2 = [[f64; 2]; 2];
type Mat4 = [[f64; 4]; 4];

const SINGULAR_EPS: f64 = 1e-12;

/// Inverts `M_A (x) M_B` with `M = [[F1, 1-F0], [1-F1, F0]]` (dark first).
///
/// Uncertainties combine multinomial counting noise with the readout
/// fidelity uncertainties, both propagated linearly.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfusionMatrixCorrector;

struct Propagation {
    n: f64,
    f: [f64; 4],
    inv: Mat4,
    p: [f64; 4],
    /// dp/dF for F0_A, F1_A, F0_B, F1_B.
    dp: [[f64; 4]; 4],
    u_fids: [f64; 4],
}

impl Propagation {
    fn new(counts: &[u64; 4], fids: &ReadoutFidelities) -> Result<Self> {
        let total: u64 = counts.iter().sum();
        if total == 0 {
            return Err(FidelityError::Correction(
                "cannot correct an empty histogram".into(),
            ));
        }
        let n = total as f64;
        let f = counts.map(|c| c as f64 / n);

        let inv_a = inverse2(&node_matrix(fids.f0_a, fids.f1_a))?;
        let inv_b = inverse2(&node_matrix(fids.f0_b, fids.f1_b))?;
        let inv = kron(&inv_a, &inv_b);
        let p = mat_vec(&inv, &f);

        let d_f0: Mat2 = [[0.0, -1.0], [0.0, 1.0]];
        let d_f1: Mat2 = [[1.0, 0.0], [-1.0, 0.0]];
        let dinv = |inv: &Mat2, dm: &Mat2| scale2(&mul2(&mul2(inv, dm), inv), -1.0);

        let dp = [
            mat_vec(&kron(&dinv(&inv_a, &d_f0), &inv_b), &f),
            mat_vec(&kron(&dinv(&inv_a, &d_f1), &inv_b), &f),
            mat_vec(&kron(&inv_a, &dinv(&inv_b, &d_f0)), &f),
            mat_vec(&kron(&inv_a, &dinv(&inv_b, &d_f1)), &f),
        ];

        Ok(Self {
            n,
            f,
            inv,
            p,
            dp,
            u_fids: [fids.u_f0_a, fids.u_f1_a, fids.u_f0_b, fids.u_f1_b],
        })
    }

    /// Standard deviation of the linear functional `g . p`.
    fn sigma(&self, g: &[f64; 4]) -> f64 {
        // h = inv^T g, var = (sum h_i^2 f_i - (h.f)^2) / n
        let mut h = [0.0; 4];
        for (j, hj) in h.iter_mut().enumerate() {
            *hj = (0..4).map(|i| self.inv[i][j] * g[i]).sum();
        }
        let hf: f64 = h.iter().zip(&self.f).map(|(h, f)| h * f).sum();
        let h2f: f64 = h.iter().zip(&self.f).map(|(h, f)| h * h * f).sum();
        let counting = (h2f - hf * hf) / self.n;

        let readout: f64 = self
            .dp
            .iter()
            .zip(&self.u_fids)
            .map(|(dp, u)| {
                let d: f64 = dp.iter().zip(g).map(|(a, b)| a * b).sum();
                (d * u).powi(2)
            })
            .sum();

        (counting + readout).max(0.0).sqrt()
    }
}

impl ReadoutCorrector for ConfusionMatrixCorrector {
    fn correct(
        &self,
        counts: &[u64; 4],
        fids: &ReadoutFidelities,
    ) -> Result<CorrectedProbabilities> {
        let prop = Propagation::new(counts, fids)?;
        let mut u = [0.0; 4];
        for (i, ui) in u.iter_mut().enumerate() {
            let mut g = [0.0; 4];
            g[i] = 1.0;
            *ui = prop.sigma(&g);
        }
        Ok(CorrectedProbabilities { p: prop.p, u })
    }

    fn mixed_term_uncertainty(&self, counts: &[u64; 4], fids: &ReadoutFidelities) -> Result<f64> {
        let prop = Propagation::new(counts, fids)?;
        Ok(prop.sigma(&[0.0, 1.0, 1.0, 0.0]))
    }

    fn coherence_term_uncertainty(
        &self,
        counts: &[u64; 4],
        fids: &ReadoutFidelities,
    ) -> Result<f64> {
        let prop = Propagation::new(counts, fids)?;
        let p0 = prop.p[0].max(0.0);
        let p3 = prop.p[3].max(0.0);
        let s = (p0 * p3).sqrt();
        // gradient diverges at the clamp; the term is pinned to zero there
        if s <= 0.0 {
            return Ok(0.0);
        }
        Ok(prop.sigma(&[p3 / (2.0 * s), 0.0, 0.0, p0 / (2.0 * s)]))
    }
}

// ---------------------------------------------------------------------------
// Small dense linear algebra
// ---------------------------------------------------------------------------

/// Columns are the true state, rows the observed outcome; index 0 is dark.
fn node_matrix(f0: f64, f1: f64) -> Mat2 {
    [[f1, 1.0 - f0], [1.0 - f1, f0]]
}

fn inverse2(m: &Mat2) -> Result<Mat2> {
    let det = m[0][0] * m[1][1] - m[0][1] * m[1][0];
    if !det.is_finite() || det.abs() < SINGULAR_EPS {
        return Err(FidelityError::Correction(format!(
            "singular readout matrix (det = {det})"
        )));
    }
    Ok([
        [m[1][1] / det, -m[0][1] / det],
        [-m[1][0] / det, m[0][0] / det],
    ])
}

fn mul2(a: &Mat2, b: &Mat2) -> Mat2 {
    let mut out = [[0.0; 2]; 2];
    for i in 0..2 {
        for j in 0..2 {
            out[i][j] = a[i][0] * b[0][j] + a[i][1] * b[1][j];
        }
    }
    out
}

fn scale2(a: &Mat2, s: f64) -> Mat2 {
    a.map(|row| row.map(|x| x * s))
}

fn kron(a: &Mat2, b: &Mat2) -> Mat4 {
    let mut out = [[0.0; 4]; 4];
    for i in 0..2 {
        for j in 0..2 {
            for k in 0..2 {
                for l in 0..2 {
                    out[2 * i + k][2 * j + l] = a[i][j] * b[k][l];
                }
            }
        }
    }
    out
}

fn mat_vec(m: &Mat4, v: &[f64; 4]) -> [f64; 4] {
    let mut out = [0.0; 4];
    for (i, o) in out.iter_mut().enumerate() {
        *o = m[i].iter().zip(v).map(|(a, b)| a * b).sum();
    }
    out
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn symmetric_fids() -> ReadoutFidelities {
        ReadoutFidelities {
            f0_a: 0.9,
            f0_b: 0.9,
            f1_a: 0.8,
            f1_b: 0.8,
            u_f0_a: 0.0,
            u_f0_b: 0.0,
            u_f1_a: 0.0,
            u_f1_b: 0.0,
        }
    }

    #[test]
    fn identity_readout_normalizes() {
        let c = ConfusionMatrixCorrector
            .correct(&[10, 5, 5, 10], &ReadoutFidelities::identity())
            .unwrap();
        let expect = [1.0 / 3.0, 1.0 / 6.0, 1.0 / 6.0, 1.0 / 3.0];
        for (p, e) in c.p.iter().zip(expect) {
            assert!((p - e).abs() < 1e-12);
        }
        let u0 = ((1.0 / 3.0) * (2.0 / 3.0) / 30.0_f64).sqrt();
        assert!((c.u[0] - u0).abs() < 1e-12);
    }

    #[test]
    fn recovers_state_through_confusion() {
        // p = [0, .5, .5, 0] measured through F0 = .9, F1 = .8 on both nodes
        let c = ConfusionMatrixCorrector
            .correct(&[8, 37, 37, 18], &symmetric_fids())
            .unwrap();
        let expect = [0.0, 0.5, 0.5, 0.0];
        for (p, e) in c.p.iter().zip(expect) {
            assert!((p - e).abs() < 1e-12, "{p} vs {e}");
        }
        assert!((c.p.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn bright_bright_state_corrects_to_ms00() {
        // ms=00 seen through F0 = .9, F1 = .99: each node reads bright 90% of the time
        let fids = ReadoutFidelities {
            f0_a: 0.9,
            f0_b: 0.9,
            f1_a: 0.99,
            f1_b: 0.99,
            ..ReadoutFidelities::identity()
        };
        let c = correct_histogram(
            &ConfusionMatrixCorrector,
            &CorrelationHistogram([8100, 900, 900, 100]),
            &fids,
        )
        .unwrap();
        for (p, e) in c.p.iter().zip([1.0, 0.0, 0.0, 0.0]) {
            assert!((p - e).abs() < 1e-9, "{:?}", c.p);
        }
    }

    #[test]
    fn asymmetric_nodes_round_trip() {
        let fids = ReadoutFidelities {
            f0_a: 0.85,
            f0_b: 0.92,
            f1_a: 0.99,
            f1_b: 0.97,
            ..ReadoutFidelities::identity()
        };
        // true ms probabilities in histogram order
        let truth = [0.1, 0.4, 0.3, 0.2];
        let bright = |f0: f64, f1: f64, dark_state: bool| if dark_state { 1.0 - f1 } else { f0 };
        let mut observed = [0.0; 4];
        for (t, pt) in truth.iter().enumerate() {
            let (da, db) = (t & 2 != 0, t & 1 != 0);
            for (o, po) in observed.iter_mut().enumerate() {
                let pa = bright(fids.f0_a, fids.f1_a, da);
                let pb = bright(fids.f0_b, fids.f1_b, db);
                let ra = if o & 2 != 0 { 1.0 - pa } else { pa };
                let rb = if o & 1 != 0 { 1.0 - pb } else { pb };
                *po += pt * ra * rb;
            }
        }
        let counts = observed.map(|q| (q * 1e6).round() as u64);
        let c = correct_histogram(&ConfusionMatrixCorrector, &CorrelationHistogram(counts), &fids)
            .unwrap();
        for (p, e) in c.p.iter().zip(truth) {
            assert!((p - e).abs() < 1e-4, "{:?}", c.p);
        }
    }

    #[test]
    fn correction_can_go_negative() {
        let c = ConfusionMatrixCorrector
            .correct(&[0, 50, 50, 0], &symmetric_fids())
            .unwrap();
        assert!(c.p[0] < 0.0);
    }

    #[test]
    fn mixed_term_uncertainty_matches_binomial() {
        let u = ConfusionMatrixCorrector
            .mixed_term_uncertainty(&[10, 5, 5, 10], &ReadoutFidelities::identity())
            .unwrap();
        let q = 1.0 / 3.0;
        assert!((u - (q * (1.0 - q) / 30.0_f64).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn fidelity_uncertainty_adds_in_quadrature() {
        let counts = [8, 37, 37, 18];
        let base = ConfusionMatrixCorrector
            .mixed_term_uncertainty(&counts, &symmetric_fids())
            .unwrap();
        let noisy = symmetric_fids().with_f1_b(0.8, 0.01);
        let with_fid = ConfusionMatrixCorrector
            .mixed_term_uncertainty(&counts, &noisy)
            .unwrap();
        assert!(with_fid > base);
    }

    #[test]
    fn coherence_uncertainty_zero_when_clamped() {
        let u = ConfusionMatrixCorrector
            .coherence_term_uncertainty(&[0, 5, 5, 10], &ReadoutFidelities::identity())
            .unwrap();
        assert_eq!(u, 0.0);
        let u = ConfusionMatrixCorrector
            .coherence_term_uncertainty(&[10, 5, 5, 10], &ReadoutFidelities::identity())
            .unwrap();
        assert!(u > 0.0);
    }

    #[test]
    fn empty_and_singular_rejected() {
        assert!(ConfusionMatrixCorrector
            .correct(&[0, 0, 0, 0], &ReadoutFidelities::identity())
            .is_err());
        let half = ReadoutFidelities {
            f0_a: 0.5,
            f1_a: 0.5,
            ..ReadoutFidelities::identity()
        };
        assert!(ConfusionMatrixCorrector.correct(&[1, 1, 1, 1], &half).is_err());
    }

    #[test]
    fn histogram_order_is_reversed_round_trip() {
        let hist = CorrelationHistogram([10, 2, 3, 5]);
        let c = correct_histogram(&ConfusionMatrixCorrector, &hist, &ReadoutFidelities::identity())
            .unwrap();
        assert!((c.p[0] - 0.5).abs() < 1e-12);
        assert!((c.p[3] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn validation() {
        assert!(ReadoutFidelities::identity().validate().is_ok());
        assert!(symmetric_fids().validate().is_ok());
        let bad = ReadoutFidelities {
            u_f0_a: -0.1,
            ..ReadoutFidelities::identity()
        };
        assert!(bad.validate().is_err());
        let bad = ReadoutFidelities {
            f1_b: 1.2,
            ..ReadoutFidelities::identity()
        };
        assert!(bad.validate().is_err());
    }
}
