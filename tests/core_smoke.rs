use anyhow::Result;

use ldefid_core::{
    config::ReadoutConfig,
    correlate::{correlate, CorrelationHistogram, ParityClass},
    event::{EventTable, HeraldEvent},
    fidelity::{fidelity_from_hists, get_fidelity, BasisHistograms, CorrectionMode},
    filter::{filter_gate_phase, filter_times, FilterParameters},
    readout::{correct_histogram, ConfusionMatrixCorrector, ReadoutFidelities},
};

fn event(t1: i64, t2: i64, ch1: u8, ch2: u8, ro1: u32, ro2: u32, gp: i32) -> HeraldEvent {
    HeraldEvent {
        t1,
        t2,
        ch1,
        ch2,
        ro1,
        ro2,
        cr1: 35,
        cr2: 41,
        gp,
    }
}

#[test]
fn worked_raw_psi1_fidelity() -> Result<()> {
    let hists = BasisHistograms {
        zz: CorrelationHistogram([10, 5, 5, 10]),
        xx: CorrelationHistogram([12, 3, 3, 12]),
        xmx: CorrelationHistogram([2, 13, 13, 2]),
    };
    let res = fidelity_from_hists(
        &hists,
        ParityClass::Psi1,
        CorrectionMode::Raw,
        &ConfusionMatrixCorrector,
        &ReadoutFidelities::identity(),
    )?;
    assert!((res.fidelity - 1.0 / 6.0).abs() < 1e-9);
    assert!((res.uncertainty - 0.006f64.sqrt()).abs() < 1e-9);
    Ok(())
}

#[test]
fn filter_then_correlate() -> Result<()> {
    let table: EventTable = vec![
        // psi1, dt 10
        event(650, 660, 0, 0, 1, 1, 1),
        // psi2, aligned dt 5
        event(650, 685, 0, 1, 0, 1, 1),
        // wrong gate phase
        event(650, 660, 1, 1, 0, 0, 0),
        // dt 60 is cut
        event(650, 710, 0, 0, 0, 0, 1),
    ]
    .into_iter()
    .collect();

    let params = FilterParameters {
        dt_max: 50,
        ..FilterParameters::default()
    };
    let kept = filter_times(&filter_gate_phase(&table), &params);
    assert_eq!(kept.len(), 2);
    assert_eq!(table.len(), 4);

    let (c, ok) = correlate(&kept);
    assert!(ok);
    assert_eq!(c.get(ParityClass::Psi1).counts(), [1, 0, 0, 0]);
    assert_eq!(c.get(ParityClass::Psi2).counts(), [0, 0, 1, 0]);
    Ok(())
}

#[test]
fn readout_correction_recovers_mixed_state() -> Result<()> {
    // true ms=01/10 mix seen through F0 = 0.9, F1 = 0.8 on both nodes
    let fids = ReadoutFidelities {
        f0_a: 0.9,
        f0_b: 0.9,
        f1_a: 0.8,
        f1_b: 0.8,
        u_f0_a: 0.0,
        u_f0_b: 0.0,
        u_f1_a: 0.0,
        u_f1_b: 0.0,
    };
    let hist = CorrelationHistogram([18, 37, 37, 8]);
    let c = correct_histogram(&ConfusionMatrixCorrector, &hist, &fids)?;
    let expected = [0.0, 0.5, 0.5, 0.0];
    for (p, e) in c.p.iter().zip(expected) {
        assert!((p - e).abs() < 1e-9, "{:?}", c.p);
    }
    Ok(())
}

/// Counts observed for true ms probabilities `p` (histogram order, bit set =
/// dark) when node A (B) reads bright with `F0` and dark with `F1`.
fn forward_model(p: [f64; 4], fids: &ReadoutFidelities, shots: f64) -> CorrelationHistogram {
    let bright = |f0: f64, f1: f64, dark: bool| if dark { 1.0 - f1 } else { f0 };
    let mut observed = [0.0; 4];
    for (t, pt) in p.iter().enumerate() {
        let pa = bright(fids.f0_a, fids.f1_a, t & 2 != 0);
        let pb = bright(fids.f0_b, fids.f1_b, t & 1 != 0);
        for (o, q) in observed.iter_mut().enumerate() {
            let ra = if o & 2 != 0 { 1.0 - pa } else { pa };
            let rb = if o & 1 != 0 { 1.0 - pb } else { pb };
            *q += pt * ra * rb;
        }
    }
    CorrelationHistogram(observed.map(|q| (q * shots).round() as u64))
}

#[test]
fn perfect_psi1_survives_default_readout() -> Result<()> {
    let readout = ReadoutConfig::default();
    let fids = readout.regular();
    let hists = BasisHistograms {
        zz: forward_model([0.0, 0.5, 0.5, 0.0], &fids, 1e7),
        xx: forward_model([0.5, 0.0, 0.0, 0.5], &fids, 1e7),
        xmx: forward_model([0.0, 0.5, 0.5, 0.0], &fids, 1e7),
    };
    let res = get_fidelity(
        &hists,
        ParityClass::Psi1,
        CorrectionMode::BestGuess,
        &ConfusionMatrixCorrector,
        &readout,
    )?;
    assert!((res.fidelity - 1.0).abs() < 1e-4, "F = {}", res.fidelity);
    assert!(res.zz.p[0].abs() < 1e-4 && res.zz.p[3].abs() < 1e-4, "{:?}", res.zz.p);
    Ok(())
}

#[test]
fn lower_bound_is_never_above_either_branch() -> Result<()> {
    let hists = BasisHistograms {
        zz: CorrelationHistogram([40, 410, 395, 35]),
        xx: CorrelationHistogram([380, 60, 55, 390]),
        xmx: CorrelationHistogram([70, 350, 360, 65]),
    };
    let readout = ReadoutConfig::default();
    let corrector = ConfusionMatrixCorrector;
    let mode = CorrectionMode::LowerBound;
    let chosen = get_fidelity(&hists, ParityClass::Psi1, mode, &corrector, &readout)?;
    let up = fidelity_from_hists(&hists, ParityClass::Psi1, mode, &corrector, &readout.extremal_upper())?;
    let lo = fidelity_from_hists(&hists, ParityClass::Psi1, mode, &corrector, &readout.extremal_lower())?;
    assert_eq!(chosen.fidelity, up.fidelity.min(lo.fidelity));
    assert!(chosen.fidelity.is_finite() && chosen.uncertainty.is_finite());
    assert!(chosen.zz.p[3] >= 0.0);
    Ok(())
}
