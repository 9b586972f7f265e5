//! Entanglement fidelity from ZZ, XX and X-X correlation histograms.
//!
//!   F = zz/2 - sqrt(p00 * p11) + (xx - 1/2)
//!
//! where `zz` is the mixed-outcome population in the Z basis, the square
//! root bounds the coherence from the same histogram, and `xx` is the
//! count-weighted parity population of the two X settings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ReadoutConfig;
use crate::correlate::{Basis, CorrelationHistogram, ParityClass};
use crate::error::{FidelityError, Result};
use crate::readout::{correct_histogram, ReadoutCorrector, ReadoutFidelities};

// ---------------------------------------------------------------------------
// Correction mode
// ---------------------------------------------------------------------------

/// How histograms are corrected and how the coherence term is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrectionMode {
    /// Readout-corrected, coherence lower bound kept.
    #[default]
    Default,
    /// Readout-corrected, coherence term dropped.
    BestGuess,
    /// Normalized counts only.
    Raw,
    /// Readout-corrected at the worse extremal F1_B, negative p(11)
    /// pushed onto the mixed bins.
    LowerBound,
    RawBestGuess,
    RawLowerBound,
}

impl CorrectionMode {
    pub const ALL: [CorrectionMode; 6] = [
        CorrectionMode::Default,
        CorrectionMode::BestGuess,
        CorrectionMode::Raw,
        CorrectionMode::LowerBound,
        CorrectionMode::RawBestGuess,
        CorrectionMode::RawLowerBound,
    ];

    /// Archive tag; the default mode has none.
    pub fn tag(self) -> Option<&'static str> {
        match self {
            CorrectionMode::Default => None,
            CorrectionMode::BestGuess => Some("bestguess"),
            CorrectionMode::Raw => Some("raw"),
            CorrectionMode::LowerBound => Some("lowerbound"),
            CorrectionMode::RawBestGuess => Some("rawbestguess"),
            CorrectionMode::RawLowerBound => Some("rawlowerbound"),
        }
    }

    pub fn is_raw(self) -> bool {
        matches!(
            self,
            CorrectionMode::Raw | CorrectionMode::RawBestGuess | CorrectionMode::RawLowerBound
        )
    }

    pub fn is_best_guess(self) -> bool {
        matches!(self, CorrectionMode::BestGuess | CorrectionMode::RawBestGuess)
    }

    pub fn is_lower_bound(self) -> bool {
        matches!(self, CorrectionMode::LowerBound | CorrectionMode::RawLowerBound)
    }
}

impl fmt::Display for CorrectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag().unwrap_or("default"))
    }
}

impl FromStr for CorrectionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("default") || s.eq_ignore_ascii_case("none") {
            return Ok(CorrectionMode::Default);
        }
        CorrectionMode::ALL
            .into_iter()
            .find(|m| m.tag().is_some_and(|t| t.eq_ignore_ascii_case(s)))
            .ok_or_else(|| format!("unknown correction mode '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Corrected histograms
// ---------------------------------------------------------------------------

/// Probabilities `[00, 01, 10, 11]` after correction and mode handling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrectedHistogram {
    pub p: [f64; 4],
    pub u: [f64; 4],
    /// Some component is still negative after mode handling.
    pub negative: bool,
}

/// Push a negative `p(11)` onto the two mixed bins.
///
/// Only bin 11 is handled; negativity elsewhere passes through unchanged.
pub fn compensate_opposite_parity(mut p: [f64; 4]) -> [f64; 4] {
    if p[3] < 0.0 {
        let half = p[3].abs() / 2.0;
        p[1] -= half;
        p[2] -= half;
        p[3] = 0.0;
    }
    p
}

fn normalized(hist: &CorrelationHistogram) -> Result<([f64; 4], [f64; 4])> {
    let total = hist.total();
    if total == 0 {
        return Err(FidelityError::Fidelity("cannot normalize an empty histogram".into()));
    }
    let p = hist.counts().map(|c| c as f64 / total as f64);
    let s: f64 = p.iter().sum();
    let u = p.map(|pi| pi * (s - pi) / s);
    Ok((p, u))
}

/// Apply the mode's correction to one histogram.
pub fn corrected_histogram(
    hist: &CorrelationHistogram,
    mode: CorrectionMode,
    corrector: &dyn ReadoutCorrector,
    fids: &ReadoutFidelities,
) -> Result<CorrectedHistogram> {
    let (p, u) = match mode {
        CorrectionMode::Raw | CorrectionMode::RawBestGuess | CorrectionMode::RawLowerBound => {
            normalized(hist)?
        }
        CorrectionMode::Default | CorrectionMode::BestGuess => {
            let c = correct_histogram(corrector, hist, fids)?;
            (c.p, c.u)
        }
        CorrectionMode::LowerBound => {
            let c = correct_histogram(corrector, hist, fids)?;
            (compensate_opposite_parity(c.p), c.u)
        }
    };

    let negative = p.iter().any(|&x| x < 0.0);
    if negative && mode == CorrectionMode::LowerBound {
        warn!(?p, counts = ?hist.counts(), "negative probability outside the 11 bin is not compensated");
    }
    Ok(CorrectedHistogram { p, u, negative })
}

// ---------------------------------------------------------------------------
// Fidelity
// ---------------------------------------------------------------------------

/// The three measurement-basis histograms of one parity class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasisHistograms {
    pub zz: CorrelationHistogram,
    pub xx: CorrelationHistogram,
    pub xmx: CorrelationHistogram,
}

impl BasisHistograms {
    pub fn get(&self, basis: Basis) -> &CorrelationHistogram {
        match basis {
            Basis::ZZ => &self.zz,
            Basis::XX => &self.xx,
            Basis::XmX => &self.xmx,
        }
    }
}

/// Individual terms of the fidelity witness.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FidelityTerms {
    pub zz: f64,
    pub u_zz: f64,
    pub sqrt: f64,
    pub u_sqrt: f64,
    pub xx: f64,
    pub u_xx: f64,
    pub weight_xx: f64,
    pub weight_xmx: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FidelityResult {
    pub parity: ParityClass,
    pub mode: CorrectionMode,
    pub fidelity: f64,
    pub uncertainty: f64,
    pub zz: CorrectedHistogram,
    pub xx: CorrectedHistogram,
    pub xmx: CorrectedHistogram,
    pub terms: FidelityTerms,
    /// Readout parameters the result was computed with.
    pub readout: ReadoutFidelities,
}

impl FidelityResult {
    pub fn corrected(&self, basis: Basis) -> &CorrectedHistogram {
        match basis {
            Basis::ZZ => &self.zz,
            Basis::XX => &self.xx,
            Basis::XmX => &self.xmx,
        }
    }
}

/// Fidelity of one parity class for a single readout parameter set.
pub fn fidelity_from_hists(
    hists: &BasisHistograms,
    parity: ParityClass,
    mode: CorrectionMode,
    corrector: &dyn ReadoutCorrector,
    fids: &ReadoutFidelities,
) -> Result<FidelityResult> {
    for basis in Basis::ALL {
        if hists.get(basis).is_empty() {
            return Err(FidelityError::Fidelity(format!(
                "{parity} {basis} histogram is empty"
            )));
        }
    }

    let c_zz = corrected_histogram(&hists.zz, mode, corrector, fids)?;
    let c_xx = corrected_histogram(&hists.xx, mode, corrector, fids)?;
    let c_xmx = corrected_histogram(&hists.xmx, mode, corrector, fids)?;

    let zz = c_zz.p[1] + c_zz.p[2];
    let u_zz = corrector.mixed_term_uncertainty(&hists.zz.reversed(), fids)?;

    let mut sqrt = (c_zz.p[0].max(0.0) * c_zz.p[3].max(0.0)).sqrt();
    let mut u_sqrt = corrector.coherence_term_uncertainty(&hists.zz.reversed(), fids)?;

    let (xx_part, xmx_part) = match parity {
        ParityClass::Psi1 => (c_xx.p[0] + c_xx.p[3], c_xmx.p[1] + c_xmx.p[2]),
        ParityClass::Psi2 => (c_xx.p[1] + c_xx.p[2], c_xmx.p[0] + c_xmx.p[3]),
    };
    let u_xx_part = corrector.mixed_term_uncertainty(&hists.xx.reversed(), fids)?;
    let u_xmx_part = corrector.mixed_term_uncertainty(&hists.xmx.reversed(), fids)?;

    let n_xx = hists.xx.total() as f64;
    let n_xmx = hists.xmx.total() as f64;
    let weight_xx = n_xx / (n_xx + n_xmx);
    let weight_xmx = n_xmx / (n_xx + n_xmx);
    let xx = weight_xx * xx_part + weight_xmx * xmx_part;
    let u_xx = ((weight_xx * u_xx_part).powi(2) + (weight_xmx * u_xmx_part).powi(2)).sqrt();

    if mode.is_best_guess() {
        sqrt = 0.0;
        u_sqrt = 0.0;
    }

    let fidelity = zz / 2.0 - sqrt + (xx - 0.5);
    let uncertainty = (0.25 * u_zz.powi(2) + u_sqrt.powi(2) + u_xx.powi(2)).sqrt();

    Ok(FidelityResult {
        parity,
        mode,
        fidelity,
        uncertainty,
        zz: c_zz,
        xx: c_xx,
        xmx: c_xmx,
        terms: FidelityTerms {
            zz,
            u_zz,
            sqrt,
            u_sqrt,
            xx,
            u_xx,
            weight_xx,
            weight_xmx,
        },
        readout: *fids,
    })
}

/// Fidelity of one parity class under `mode`.
///
/// Lower-bound modes evaluate both extremal F1_B values and keep the
/// branch with the smaller fidelity, corrected histograms included.
pub fn get_fidelity(
    hists: &BasisHistograms,
    parity: ParityClass,
    mode: CorrectionMode,
    corrector: &dyn ReadoutCorrector,
    readout: &ReadoutConfig,
) -> Result<FidelityResult> {
    if !mode.is_lower_bound() {
        return fidelity_from_hists(hists, parity, mode, corrector, &readout.regular());
    }

    let upper = fidelity_from_hists(hists, parity, mode, corrector, &readout.extremal_upper())?;
    let lower = fidelity_from_hists(hists, parity, mode, corrector, &readout.extremal_lower())?;
    debug!(
        %parity,
        f_upper = upper.fidelity,
        f_lower = lower.fidelity,
        "extremal readout branches"
    );
    if upper.fidelity < lower.fidelity {
        Ok(upper)
    } else {
        Ok(lower)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readout::ConfusionMatrixCorrector;

    fn worked_hists() -> BasisHistograms {
        BasisHistograms {
            zz: CorrelationHistogram([10, 5, 5, 10]),
            xx: CorrelationHistogram([12, 3, 3, 12]),
            xmx: CorrelationHistogram([2, 13, 13, 2]),
        }
    }

    fn identity_readout() -> ReadoutConfig {
        ReadoutConfig {
            f0_a: 1.0,
            u_f0_a: 0.0,
            f1_a: 1.0,
            u_f1_a: 0.0,
            f0_b: 1.0,
            u_f0_b: 0.0,
            f1_b: 1.0,
            u_f1_b: 0.0,
            f1_b_upper: 1.0,
            f1_b_lower: 1.0,
        }
    }

    #[test]
    fn worked_raw_psi1_scenario() {
        let r = fidelity_from_hists(
            &worked_hists(),
            ParityClass::Psi1,
            CorrectionMode::Raw,
            &ConfusionMatrixCorrector,
            &ReadoutFidelities::identity(),
        )
        .unwrap();
        assert!((r.terms.zz - 1.0 / 3.0).abs() < 1e-12);
        assert!((r.terms.sqrt - 1.0 / 3.0).abs() < 1e-12);
        assert!((r.terms.weight_xx - 0.5).abs() < 1e-12);
        assert!((r.terms.xx - 0.833_333_333_333).abs() < 1e-9);
        assert!((r.fidelity - 1.0 / 6.0).abs() < 1e-9);
        assert!((r.uncertainty - 0.006_f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn identity_correction_matches_raw() {
        let hists = worked_hists();
        let raw = get_fidelity(
            &hists,
            ParityClass::Psi1,
            CorrectionMode::Raw,
            &ConfusionMatrixCorrector,
            &identity_readout(),
        )
        .unwrap();
        let corrected = get_fidelity(
            &hists,
            ParityClass::Psi1,
            CorrectionMode::Default,
            &ConfusionMatrixCorrector,
            &identity_readout(),
        )
        .unwrap();
        assert!((raw.fidelity - corrected.fidelity).abs() < 1e-12);
    }

    #[test]
    fn best_guess_drops_coherence_term() {
        let hists = worked_hists();
        let fids = ReadoutFidelities::identity();
        let raw = fidelity_from_hists(
            &hists,
            ParityClass::Psi1,
            CorrectionMode::Raw,
            &ConfusionMatrixCorrector,
            &fids,
        )
        .unwrap();
        let best = fidelity_from_hists(
            &hists,
            ParityClass::Psi1,
            CorrectionMode::RawBestGuess,
            &ConfusionMatrixCorrector,
            &fids,
        )
        .unwrap();
        assert_eq!(best.terms.sqrt, 0.0);
        assert_eq!(best.terms.u_sqrt, 0.0);
        assert!((best.fidelity - raw.fidelity - 1.0 / 3.0).abs() < 1e-12);
        assert!(best.uncertainty < raw.uncertainty);
    }

    #[test]
    fn psi2_uses_complementary_pairing() {
        let r = fidelity_from_hists(
            &worked_hists(),
            ParityClass::Psi2,
            CorrectionMode::Raw,
            &ConfusionMatrixCorrector,
            &ReadoutFidelities::identity(),
        )
        .unwrap();
        // 0.5 * 0.2 + 0.5 * (4/30)
        let xx = 0.5 * 0.2 + 0.5 * (4.0 / 30.0);
        assert!((r.terms.xx - xx).abs() < 1e-12);
        assert!((r.fidelity - (1.0 / 6.0 - 1.0 / 3.0 + xx - 0.5)).abs() < 1e-12);
    }

    #[test]
    fn xx_weights_follow_counts() {
        let hists = BasisHistograms {
            zz: CorrelationHistogram([0, 10, 10, 0]),
            xx: CorrelationHistogram([30, 0, 0, 30]),
            xmx: CorrelationHistogram([0, 10, 10, 0]),
        };
        let r = fidelity_from_hists(
            &hists,
            ParityClass::Psi1,
            CorrectionMode::Raw,
            &ConfusionMatrixCorrector,
            &ReadoutFidelities::identity(),
        )
        .unwrap();
        assert!((r.terms.weight_xx - 0.75).abs() < 1e-12);
        assert!((r.terms.weight_xmx - 0.25).abs() < 1e-12);
        // perfect correlations give unit fidelity
        assert!((r.fidelity - 1.0).abs() < 1e-12);
    }

    #[test]
    fn lower_bound_compensation() {
        let p = compensate_opposite_parity([0.50, 0.30, 0.30, -0.10]);
        let expect = [0.50, 0.25, 0.25, 0.00];
        for (a, b) in p.iter().zip(expect) {
            assert!((a - b).abs() < 1e-12);
        }
        // other bins are left alone
        assert_eq!(
            compensate_opposite_parity([-0.1, 0.6, 0.5, 0.0]),
            [-0.1, 0.6, 0.5, 0.0]
        );
    }

    #[test]
    fn lower_bound_flags_other_negative_bins() {
        let fids = ReadoutFidelities {
            f0_a: 0.9,
            f0_b: 0.9,
            f1_a: 0.8,
            f1_b: 0.8,
            ..ReadoutFidelities::identity()
        };
        let c = corrected_histogram(
            &CorrelationHistogram([0, 50, 50, 0]),
            CorrectionMode::LowerBound,
            &ConfusionMatrixCorrector,
            &fids,
        )
        .unwrap();
        assert_eq!(c.p[3], 0.0);
        assert!(c.p[0] < 0.0);
        assert!(c.negative);
    }

    #[test]
    fn lower_bound_selects_smaller_branch() {
        let hists = BasisHistograms {
            zz: CorrelationHistogram([40, 210, 190, 30]),
            xx: CorrelationHistogram([120, 40, 35, 110]),
            xmx: CorrelationHistogram([30, 130, 120, 25]),
        };
        let readout = ReadoutConfig::default();
        let mode = CorrectionMode::LowerBound;
        let upper = fidelity_from_hists(
            &hists,
            ParityClass::Psi1,
            mode,
            &ConfusionMatrixCorrector,
            &readout.extremal_upper(),
        )
        .unwrap();
        let lower = fidelity_from_hists(
            &hists,
            ParityClass::Psi1,
            mode,
            &ConfusionMatrixCorrector,
            &readout.extremal_lower(),
        )
        .unwrap();
        let chosen = get_fidelity(
            &hists,
            ParityClass::Psi1,
            mode,
            &ConfusionMatrixCorrector,
            &readout,
        )
        .unwrap();

        let expected = if upper.fidelity < lower.fidelity { upper } else { lower };
        assert_eq!(chosen, expected);
        assert_eq!(chosen.fidelity, upper.fidelity.min(lower.fidelity));
        assert_eq!(chosen.readout.u_f1_b, 0.0);
    }

    #[test]
    fn empty_basis_is_an_error() {
        let mut hists = worked_hists();
        hists.xmx = CorrelationHistogram::default();
        assert!(fidelity_from_hists(
            &hists,
            ParityClass::Psi1,
            CorrectionMode::Raw,
            &ConfusionMatrixCorrector,
            &ReadoutFidelities::identity(),
        )
        .is_err());
    }

    #[test]
    fn mode_names_round_trip() {
        for mode in CorrectionMode::ALL {
            let parsed: CorrectionMode = mode.to_string().parse().unwrap();
            assert_eq!(parsed, mode);
        }
        assert_eq!(CorrectionMode::Default.tag(), None);
        assert_eq!("LowerBound".parse::<CorrectionMode>().unwrap(), CorrectionMode::LowerBound);
        assert!("upperbound".parse::<CorrectionMode>().is_err());
        assert!(CorrectionMode::RawLowerBound.is_raw());
        assert!(CorrectionMode::RawLowerBound.is_lower_bound());
        assert!(!CorrectionMode::RawLowerBound.is_best_guess());
    }
}
