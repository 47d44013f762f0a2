//! Photometric pass: exposure and detector magnitude offsets, the shared
//! flux surface and star magnitudes.
//!
//! Residual of one detection:
//!
//! ```text
//! r = m_inst + ε_e + κ_c + P(fp) - m_star
//! ```
//!
//! The problem is linear, so one step reaches the optimum for the current
//! flags and focal-plane positions.
//!
//! Relative fits hold the degree-1 surface terms at zero. Under dithers that
//! translate the focal plane on the sky, a linear `P` equals a linear
//! function of sky position (absorbed by the star magnitudes) plus one
//! constant per exposure, so nothing but reference magnitudes can pin it.

use rayon::prelude::*;

use super::FitState;
use super::normal::{NormalEquations, Row, StarBlock};
use crate::error::{Error, Result};

/// Prior weight on every surface coefficient (1 mag standard deviation), so
/// terms the overlap does not constrain stay at zero.
const SURFACE_PRIOR_WEIGHT: f64 = 1.0;

/// Magnitude error floor added in quadrature.
pub(super) const MAG_ERROR_FLOOR: f64 = 0.001;

#[derive(Debug, Clone)]
pub(super) struct PhotoLayout {
    pub exposures: Vec<Option<usize>>,
    pub detectors: Vec<Option<usize>>,
    /// Exposures and detectors with photometric detections, gauges included.
    pub active_exposures: Vec<bool>,
    pub active_detectors: Vec<bool>,
    /// Parameter slot of each surface coefficient; `None` for gauge terms.
    pub surface: Vec<Option<usize>>,
    pub n: usize,
}

impl PhotoLayout {
    fn new(state: &FitState, usable: &[bool]) -> Self {
        let mut per_exposure = vec![0usize; state.exposures.len()];
        let mut per_detector = vec![0usize; state.detector_ids.len()];
        for (star, _) in state.stars.iter().enumerate().filter(|&(i, _)| usable[i]) {
            for obs in state.star_obs(star).filter(|o| o.flux_good && o.mag.is_some()) {
                per_exposure[obs.exposure] += 1;
                per_detector[obs.detector] += 1;
            }
        }

        let absolute = state.flux.absolute;
        let mut n = 0;
        let mut first_active = true;
        let exposures = per_exposure
            .iter()
            .map(|&count| {
                if count == 0 {
                    return None;
                }
                // Relative fits hold the first active exposure at zero.
                if !absolute && std::mem::take(&mut first_active) {
                    return None;
                }
                n += 1;
                Some(n - 1)
            })
            .collect();

        let mut gauge = true;
        let detectors = per_detector
            .iter()
            .map(|&count| {
                if count == 0 || std::mem::take(&mut gauge) {
                    return None;
                }
                n += 1;
                Some(n - 1)
            })
            .collect();

        let surface = state
            .flux
            .terms()
            .exponents()
            .iter()
            .map(|&(p, q)| {
                if !absolute && p + q == 1 {
                    return None;
                }
                n += 1;
                Some(n - 1)
            })
            .collect();
        Self {
            exposures,
            detectors,
            active_exposures: per_exposure.iter().map(|&c| c > 0).collect(),
            active_detectors: per_detector.iter().map(|&c| c > 0).collect(),
            surface,
            n,
        }
    }
}

/// Whether a star can carry photometric information this pass.
fn is_usable(state: &FitState, star: usize) -> bool {
    let count = state
        .star_obs(star)
        .filter(|o| o.flux_good && o.mag.is_some())
        .count();
    let anchored = state.flux.absolute && state.stars[star].ref_mag.is_some();
    count >= 2 || (anchored && count >= 1)
}

fn star_block(state: &FitState, layout: &PhotoLayout, star: usize) -> StarBlock {
    let s = &state.stars[star];
    let terms = state.flux.terms();
    let mut basis = Vec::new();
    let mut block = StarBlock::default();
    for obs in state.star_obs(star).filter(|o| o.flux_good) {
        let Some((mag, weight)) = obs.mag else {
            continue;
        };
        let predicted = mag
            + state.exposure_mag[obs.exposure]
            + state.detector_mag[obs.detector]
            + state.flux.eval(obs.fp);
        let mut row = Row {
            entries: Vec::with_capacity(layout.surface.len() + 2),
            weight,
            residual: predicted - s.mag,
        };
        if let Some(p) = layout.exposures[obs.exposure] {
            row.entries.push((p, 1.0));
        }
        if let Some(p) = layout.detectors[obs.detector] {
            row.entries.push((p, 1.0));
        }
        if !layout.surface.is_empty() {
            terms.values_into(state.flux.normalized(obs.fp), &mut basis);
            row.entries.extend(
                layout
                    .surface
                    .iter()
                    .zip(&basis)
                    .filter_map(|(slot, &b)| slot.map(|p| (p, b))),
            );
        }
        block.rows.push(row);
    }
    if state.flux.absolute
        && let Some((ref_mag, ref_err)) = s.ref_mag
    {
        let weight = 1.0 / (ref_err * ref_err + MAG_ERROR_FLOOR * MAG_ERROR_FLOOR);
        block.prior = Some((weight, s.mag - ref_mag));
    }
    block
}

/// One solve of the photometric sub-problem.
pub(super) fn solve_pass(state: &mut FitState) -> Result<()> {
    let usable: Vec<bool> = (0..state.stars.len()).map(|s| is_usable(state, s)).collect();
    let layout = PhotoLayout::new(state, &usable);
    let blocks: Vec<Option<StarBlock>> = (0..state.stars.len())
        .into_par_iter()
        .map(|star| usable[star].then(|| star_block(state, &layout, star)))
        .collect();
    let used: Vec<StarBlock> = blocks.iter().flatten().cloned().collect();
    if used.is_empty() {
        tracing::warn!("No photometric constraints, keeping magnitude offsets");
        return Ok(());
    }

    let mut normal = NormalEquations::assemble(layout.n, &used);
    for (&slot, &coeff) in layout.surface.iter().zip(&state.flux.coeffs) {
        if let Some(p) = slot {
            normal.add_prior(p, SURFACE_PRIOR_WEIGHT, coeff);
        }
    }
    let Some(delta) = normal.solve() else {
        return Err(Error::DegenerateFit {
            reason: "photometric normal matrix is not positive definite".into(),
            groups: used.len(),
            detections: used.iter().map(|b| b.rows.len()).sum(),
        });
    };

    for (e, slot) in layout.exposures.iter().enumerate() {
        if let Some(p) = *slot {
            state.exposure_mag[e] += delta[p];
        }
    }
    for (c, slot) in layout.detectors.iter().enumerate() {
        if let Some(p) = *slot {
            state.detector_mag[c] += delta[p];
        }
    }
    for (coeff, slot) in state.flux.coeffs.iter_mut().zip(&layout.surface) {
        if let Some(p) = *slot {
            *coeff += delta[p];
        }
    }
    for (star, block) in state.stars.iter_mut().zip(&blocks) {
        if let Some(block) = block {
            star.mag += block.star_step(&delta);
        }
    }

    renormalize(state, &layout);
    tracing::debug!(
        parameters = layout.n,
        stars = used.len(),
        "Photometric step"
    );
    Ok(())
}

/// Move the mean detector offset into the exposure offsets and, for relative
/// fits, the mean exposure offset into the star magnitudes.
fn renormalize(state: &mut FitState, layout: &PhotoLayout) {
    if let Some(mean) = active_mean(&state.detector_mag, &layout.active_detectors) {
        state.detector_mag.iter_mut().for_each(|k| *k -= mean);
        state.exposure_mag.iter_mut().for_each(|e| *e += mean);
    }
    if !state.flux.absolute
        && let Some(mean) = active_mean(&state.exposure_mag, &layout.active_exposures)
    {
        state.exposure_mag.iter_mut().for_each(|e| *e -= mean);
        state.stars.iter_mut().for_each(|s| s.mag -= mean);
    }
}

fn active_mean(values: &[f64], active: &[bool]) -> Option<f64> {
    let (sum, count) = values
        .iter()
        .zip(active)
        .filter(|&(_, &a)| a)
        .fold((0.0, 0usize), |(sum, count), (v, _)| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}
