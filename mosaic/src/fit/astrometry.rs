//! Astrometric pass: exposure polynomials, detector alignment and star
//! positions solved together.
//!
//! Residual of one detection, in the exposure's standard coordinates:
//!
//! ```text
//! r = P_e(fp(pixel; detector + alignment)) - project(star, crval_e)
//! ```
//!
//! Each axis of each star is one eliminated unknown. Reference stars carry a
//! prior at the catalog position, or are held fixed in the reference-only
//! variant.

use glam::DVec2;
use rayon::prelude::*;

use super::model::DistortionModel;
use super::normal::{NormalEquations, Row, StarBlock};
use super::{FitState, StarMode};
use crate::error::{Error, Result};
use crate::math::poly::full_term_count;
use crate::wcs::{deproject, project};

/// Parameter layout of one astrometric pass.
#[derive(Debug, Clone)]
pub(super) struct AstroLayout {
    /// Per exposure: (offset, term count) of the solved `a` block; the `b`
    /// block follows it. `None` for frozen exposures.
    pub exposures: Vec<Option<(usize, usize)>>,
    /// Per detector: offset of (dx, dy[, dθ]). `None` for the gauge detector
    /// and detectors without good detections.
    pub detectors: Vec<Option<usize>>,
    pub rotation: bool,
    pub n: usize,
}

impl AstroLayout {
    pub fn new(state: &FitState) -> Self {
        let mut good_per_exposure = vec![0usize; state.exposures.len()];
        let mut good_per_detector = vec![0usize; state.detector_ids.len()];
        for obs in state.obs.iter().filter(|o| o.good) {
            good_per_exposure[obs.exposure] += 1;
            good_per_detector[obs.detector] += 1;
        }

        let mut n = 0;
        let exposures = good_per_exposure
            .iter()
            .zip(&state.models)
            .map(|(&good, model)| {
                let order = effective_order(model.order, good)?;
                let terms = full_term_count(order);
                let offset = n;
                n += 2 * terms;
                Some((offset, terms))
            })
            .collect();

        let config = state.config;
        let rotation = config.solve_ccd && config.allow_rotation;
        let per_detector = if rotation { 3 } else { 2 };
        // The lowest id with good detections is the fixed gauge.
        let mut gauge = true;
        let detectors = good_per_detector
            .iter()
            .map(|&good| {
                if !config.solve_ccd || good == 0 || std::mem::take(&mut gauge) {
                    return None;
                }
                let offset = n;
                n += per_detector;
                Some(offset)
            })
            .collect();

        Self {
            exposures,
            detectors,
            rotation,
            n,
        }
    }

    pub fn frozen_exposures(&self) -> usize {
        self.exposures.iter().filter(|e| e.is_none()).count()
    }
}

/// Largest order `<= max_order` whose term count times two fits in `good`
/// detections, `None` when not even order 1 does.
pub(super) fn effective_order(max_order: usize, good: usize) -> Option<usize> {
    (1..=max_order)
        .rev()
        .find(|&order| 2 * full_term_count(order) <= good)
}

/// Linearised rows (xi, eta) of every good detection of `star`.
fn star_blocks(state: &FitState, layout: &AstroLayout, star: usize) -> [StarBlock; 2] {
    let s = &state.stars[star];
    let fixed = s.mode == StarMode::Fixed;
    let mut blocks = [
        StarBlock {
            fixed,
            ..Default::default()
        },
        StarBlock {
            fixed,
            ..Default::default()
        },
    ];
    let mut basis = Vec::new();

    for obs in state.obs[s.obs.clone()].iter().filter(|o| o.good) {
        let model = &state.models[obs.exposure];
        let Some(star_xi) = project(s.sky, model.crval) else {
            continue;
        };
        let r0 = model.intermediate(obs.fp) - star_xi;

        let mut x = Row {
            weight: state.weight.x,
            residual: r0.x,
            ..Default::default()
        };
        let mut y = Row {
            weight: state.weight.y,
            residual: r0.y,
            ..Default::default()
        };

        if let Some((offset, terms)) = layout.exposures[obs.exposure] {
            solved_basis(model, obs.fp, terms, &mut basis);
            for (i, &value) in basis.iter().enumerate() {
                x.entries.push((offset + i, value));
                y.entries.push((offset + terms + i, value));
            }
        }

        if let Some(offset) = layout.detectors[obs.detector] {
            let j = model.jacobian(obs.fp);
            x.entries.push((offset, j[0][0]));
            x.entries.push((offset + 1, j[0][1]));
            y.entries.push((offset, j[1][0]));
            y.entries.push((offset + 1, j[1][1]));
            if layout.rotation {
                let arm = obs.fp - state.aligned[obs.detector].center;
                let perp = DVec2::new(-arm.y, arm.x);
                x.entries.push((offset + 2, j[0][0] * perp.x + j[0][1] * perp.y));
                y.entries.push((offset + 2, j[1][0] * perp.x + j[1][1] * perp.y));
            }
        }

        blocks[0].rows.push(x);
        blocks[1].rows.push(y);
    }

    if s.mode == StarMode::Prior
        && let Some(reference) = s.reference
        && let Some(offset) = project(s.sky, reference)
    {
        let weight = 1.0 / (state.config.cat_rms * state.config.cat_rms);
        blocks[0].prior = Some((weight, offset.x));
        blocks[1].prior = Some((weight, offset.y));
    }
    blocks
}

/// Basis values of the first `terms` terms of `model` at `fp`.
fn solved_basis(model: &DistortionModel, fp: DVec2, terms: usize, out: &mut Vec<f64>) {
    DistortionModel::terms(model.order).values_into(model.normalized(fp), out);
    out.truncate(terms);
}

/// One Gauss-Newton step of the astrometric sub-problem.
pub(super) fn solve_pass(state: &mut FitState) -> Result<()> {
    let layout = AstroLayout::new(state);
    let blocks: Vec<[StarBlock; 2]> = (0..state.stars.len())
        .into_par_iter()
        .map(|star| star_blocks(state, &layout, star))
        .collect();
    let flat: Vec<StarBlock> = blocks.iter().flat_map(|b| b.iter().cloned()).collect();

    let normal = NormalEquations::assemble(layout.n, &flat);
    let Some(delta) = normal.solve() else {
        return Err(Error::DegenerateFit {
            reason: "astrometric normal matrix is not positive definite".into(),
            groups: state.stars.len(),
            detections: state.good_count(),
        });
    };

    for (e, slot) in layout.exposures.iter().enumerate() {
        let Some((offset, terms)) = *slot else {
            continue;
        };
        let model = &mut state.models[e];
        for i in 0..terms {
            model.a[i] += delta[offset + i];
            model.b[i] += delta[offset + terms + i];
        }
        if model.recenter().is_none() {
            tracing::warn!(exposure = %model.exposure, "Could not recentre distortion model");
        }
    }

    for (c, slot) in layout.detectors.iter().enumerate() {
        let Some(offset) = *slot else {
            continue;
        };
        let alignment = &mut state.alignments[c];
        alignment.offset += DVec2::new(delta[offset], delta[offset + 1]);
        if layout.rotation {
            alignment.rotation += delta[offset + 2];
        }
    }

    for (star, [bx, by]) in state.stars.iter_mut().zip(&blocks) {
        if star.mode == StarMode::Fixed {
            continue;
        }
        let step = DVec2::new(bx.star_step(&delta), by.star_step(&delta));
        if step != DVec2::ZERO && step.is_finite() {
            star.sky = deproject(step, star.sky);
        }
    }

    tracing::debug!(
        parameters = layout.n,
        frozen = layout.frozen_exposures(),
        max_step = delta.amax(),
        "Astrometric step"
    );
    state.refresh_focal_plane();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_order() {
        // Term counts: order 1 -> 3, order 2 -> 6, order 3 -> 10.
        assert_eq!(effective_order(5, 5), None);
        assert_eq!(effective_order(5, 6), Some(1));
        assert_eq!(effective_order(5, 11), Some(1));
        assert_eq!(effective_order(5, 12), Some(2));
        assert_eq!(effective_order(5, 20), Some(3));
        assert_eq!(effective_order(2, 1000), Some(2));
    }
}
