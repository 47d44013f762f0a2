//! Global fit: per-exposure distortion models, detector alignment and
//! photometric scales solved jointly over all observation groups.
//!
//! Every pass runs one astrometric Gauss-Newton step, one photometric solve,
//! then recomputes residuals for all detections. During the first
//! `clip_iterations` passes the inlier flags are re-derived from a MAD-based
//! threshold; clipped detections stay in the groups for diagnostics but
//! leave the normal equations.

mod astrometry;
pub mod flux;
pub mod model;
mod normal;
mod photometry;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::ops::Range;

use glam::DVec2;
use rayon::prelude::*;

pub use flux::FluxFitParams;
pub use model::DistortionModel;

use crate::config::MosaicConfig;
use crate::error::{Error, Result};
use crate::geometry::{Detector, DetectorAlignment, DetectorSet};
use crate::math::ARCSEC_PER_DEG;
use crate::math::statistics::{clipped_std_history, robust_sigma};
use crate::observation::{ObservationGroup, mean_sky};
use crate::result::{ClipPass, FitSummary, MosaicResult};
use crate::types::{DetectorId, ExposureId};
use crate::wcs::{WcsTable, angular_separation, project};

use astrometry::AstroLayout;
use photometry::MAG_ERROR_FLOOR;

/// Floor of the astrometric scatter: 1 mas in degrees.
const MIN_SIGMA_DEG: f64 = 0.001 / ARCSEC_PER_DEG;

/// Fewest groups a fit accepts.
const MIN_GROUPS: usize = 3;

/// Clipping threshold of the photometric summary statistic.
const SUMMARY_CLIP_SIGMA: f64 = 2.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StarMode {
    /// Position solved from the detections alone.
    Free,
    /// Solved with a prior at the catalog position.
    Prior,
    /// Held at the catalog position.
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupKind {
    Match,
    Source,
}

/// One physical star: the unknowns of one observation group.
#[derive(Debug, Clone)]
struct Star {
    kind: GroupKind,
    group: usize,
    sky: DVec2,
    mode: StarMode,
    reference: Option<DVec2>,
    mag: f64,
    /// Catalog magnitude and error.
    ref_mag: Option<(f64, f64)>,
    obs: Range<usize>,
}

/// One detection as seen by the solver.
#[derive(Debug, Clone)]
struct Obs {
    star: usize,
    /// Index into the group's detections.
    detection: usize,
    exposure: usize,
    detector: usize,
    pixel: DVec2,
    fp: DVec2,
    /// Instrumental magnitude and its weight.
    mag: Option<(f64, f64)>,
    good: bool,
    flux_good: bool,
    /// Degrees in the exposure's standard coordinates.
    residual: DVec2,
    mag_residual: f64,
}

/// Mutable solver state, private to one run.
struct FitState<'a> {
    config: &'a MosaicConfig,
    exposures: Vec<ExposureId>,
    models: Vec<DistortionModel>,
    /// Observed detectors by ascending id.
    detector_ids: Vec<DetectorId>,
    base: Vec<Detector>,
    alignments: Vec<DetectorAlignment>,
    aligned: Vec<Detector>,
    stars: Vec<Star>,
    obs: Vec<Obs>,
    /// Per-axis detection weight, 1/deg².
    weight: DVec2,
    flux: FluxFitParams,
    exposure_mag: Vec<f64>,
    detector_mag: Vec<f64>,
}

impl<'a> FitState<'a> {
    fn new(
        config: &'a MosaicConfig,
        matches: &[ObservationGroup],
        sources: &[ObservationGroup],
        detectors: &DetectorSet,
        wcs: &WcsTable,
    ) -> Result<Self> {
        let extent = detectors.extent();
        let scale = extent.x.max(extent.y).max(1.0);

        let sources: &[ObservationGroup] = if config.internal_fitting { sources } else { &[] };
        let participating = || {
            matches
                .iter()
                .enumerate()
                .map(|(i, g)| (GroupKind::Match, i, g))
                .chain(sources.iter().enumerate().map(|(i, g)| (GroupKind::Source, i, g)))
        };

        let mut models = BTreeMap::new();
        let mut observed = BTreeMap::new();
        for (_, _, group) in participating() {
            for detection in &group.detections {
                let Some(detector) = detectors.get(detection.detector) else {
                    continue;
                };
                if !models.contains_key(&detection.exposure) {
                    let Some(exposure_wcs) = wcs.get(detection.exposure) else {
                        continue;
                    };
                    match DistortionModel::from_wcs(
                        detection.exposure,
                        exposure_wcs,
                        DVec2::ZERO,
                        scale,
                        config.fitting_order,
                    ) {
                        Some(model) => {
                            models.insert(detection.exposure, model);
                        }
                        None => {
                            tracing::warn!(exposure = %detection.exposure, "Cannot model exposure WCS");
                            continue;
                        }
                    }
                }
                observed.insert(detector.id, *detector);
            }
        }

        let exposure_index: BTreeMap<ExposureId, usize> =
            models.keys().enumerate().map(|(i, &e)| (e, i)).collect();
        let detector_index: BTreeMap<DetectorId, usize> =
            observed.keys().enumerate().map(|(i, &d)| (d, i)).collect();

        let mut stars = Vec::new();
        let mut obs = Vec::new();
        for (kind, group_index, group) in participating() {
            let start = obs.len();
            let star = stars.len();
            for (detection_index, detection) in group.detections.iter().enumerate() {
                let (Some(&exposure), Some(&detector)) = (
                    exposure_index.get(&detection.exposure),
                    detector_index.get(&detection.detector),
                ) else {
                    continue;
                };
                let mag = match (detection.magnitude(), detection.magnitude_err()) {
                    (Some(m), Some(err)) => {
                        Some((m, 1.0 / (err * err + MAG_ERROR_FLOOR * MAG_ERROR_FLOOR)))
                    }
                    _ => None,
                };
                obs.push(Obs {
                    star,
                    detection: detection_index,
                    exposure,
                    detector,
                    pixel: detection.pixel,
                    fp: observed[&detection.detector].pixel_to_focal_plane(detection.pixel),
                    mag,
                    good: detection.good,
                    flux_good: detection.flux_good && mag.is_some(),
                    residual: DVec2::ZERO,
                    mag_residual: 0.0,
                });
            }

            let count = obs.len() - start;
            let needed = if kind == GroupKind::Match { 1 } else { 2 };
            if count < needed {
                obs.truncate(start);
                continue;
            }

            let members = &obs[start..];
            let mean_mag = {
                let mags: Vec<f64> = members.iter().filter_map(|o| o.mag.map(|(m, _)| m)).collect();
                if mags.is_empty() {
                    0.0
                } else {
                    mags.iter().sum::<f64>() / mags.len() as f64
                }
            };
            let reference = group.reference.as_ref();
            let ref_mag = reference
                .and_then(|r| r.magnitude().map(|m| (m, r.magnitude_err().unwrap_or(0.0))));
            let mode = match (kind, config.internal_fitting) {
                (GroupKind::Source, _) => StarMode::Free,
                (GroupKind::Match, true) => StarMode::Prior,
                (GroupKind::Match, false) => StarMode::Fixed,
            };
            let sky = match reference {
                Some(r) => r.sky,
                None => match mean_sky(group.detections.iter().map(|d| d.sky)) {
                    Some(sky) => sky,
                    None => {
                        obs.truncate(start);
                        continue;
                    }
                },
            };
            let mag = match ref_mag {
                Some((m, _)) if config.flux_fit_absolute => m,
                _ => mean_mag,
            };
            stars.push(Star {
                kind,
                group: group_index,
                sky,
                mode,
                reference: reference.map(|r| r.sky),
                mag,
                ref_mag,
                obs: start..obs.len(),
            });
        }

        let anchored = stars.iter().filter(|s| s.kind == GroupKind::Match).count();
        let degenerate = |reason: &str| Error::DegenerateFit {
            reason: reason.to_string(),
            groups: stars.len(),
            detections: obs.len(),
        };
        if stars.len() < MIN_GROUPS {
            return Err(degenerate("too few usable groups"));
        }
        if anchored == 0 {
            return Err(degenerate("no reference-anchored group"));
        }

        let fp_extent = obs.iter().fold(DVec2::ZERO, |acc, o| acc.max(o.fp.abs()));
        let flux = FluxFitParams::new(
            config.flux_basis,
            config.flux_fit_order,
            config.flux_fit_absolute,
            fp_extent,
        );
        let base: Vec<Detector> = observed.into_values().collect();
        let n_exposures = models.len();
        let n_detectors = base.len();
        Ok(Self {
            config,
            exposures: models.keys().copied().collect(),
            models: models.into_values().collect(),
            detector_ids: base.iter().map(|d| d.id).collect(),
            aligned: base.clone(),
            base,
            alignments: vec![DetectorAlignment::default(); n_detectors],
            stars,
            obs,
            weight: DVec2::splat(1.0 / (config.cat_rms * config.cat_rms)),
            flux,
            exposure_mag: vec![0.0; n_exposures],
            detector_mag: vec![0.0; n_detectors],
        })
    }

    fn star_obs(&self, star: usize) -> impl Iterator<Item = &Obs> {
        self.obs[self.stars[star].obs.clone()].iter()
    }

    fn good_count(&self) -> usize {
        self.obs.iter().filter(|o| o.good).count()
    }

    /// Recompute detector placement and focal-plane positions.
    fn refresh_focal_plane(&mut self) {
        self.aligned = self
            .base
            .iter()
            .zip(&self.alignments)
            .map(|(d, a)| {
                let mut d = *d;
                d.center += a.offset;
                d.yaw += a.rotation;
                d
            })
            .collect();
        let aligned = &self.aligned;
        self.obs.par_iter_mut().for_each(|o| {
            o.fp = aligned[o.detector].pixel_to_focal_plane(o.pixel);
        });
    }

    fn calibrated_mag(&self, o: &Obs) -> Option<f64> {
        o.mag.map(|(m, _)| {
            m + self.exposure_mag[o.exposure] + self.detector_mag[o.detector] + self.flux.eval(o.fp)
        })
    }

    fn update_residuals(&mut self) {
        let residuals: Vec<(DVec2, f64)> = self
            .obs
            .par_iter()
            .map(|o| {
                let star = &self.stars[o.star];
                let model = &self.models[o.exposure];
                let residual = project(star.sky, model.crval)
                    .map_or(DVec2::NAN, |xi| model.intermediate(o.fp) - xi);
                let mag_residual = self.calibrated_mag(o).map_or(f64::NAN, |m| m - star.mag);
                (residual, mag_residual)
            })
            .collect();
        for (o, (residual, mag_residual)) in self.obs.iter_mut().zip(residuals) {
            o.residual = residual;
            o.mag_residual = mag_residual;
        }
    }

    /// Robust per-axis scatter of the good residuals, floored.
    fn astrometric_sigma(&self) -> DVec2 {
        let (xs, ys): (Vec<f64>, Vec<f64>) = self
            .obs
            .iter()
            .filter(|o| o.good && o.residual.is_finite())
            .map(|o| (o.residual.x, o.residual.y))
            .unzip();
        DVec2::new(
            robust_sigma(&xs).max(MIN_SIGMA_DEG),
            robust_sigma(&ys).max(MIN_SIGMA_DEG),
        )
    }

    fn photometric_sigma(&self) -> f64 {
        let residuals: Vec<f64> = self
            .obs
            .iter()
            .filter(|o| o.flux_good && o.mag_residual.is_finite())
            .map(|o| o.mag_residual)
            .collect();
        robust_sigma(&residuals).max(MAG_ERROR_FLOOR)
    }

    /// Re-derive inlier flags.
    fn clip(&mut self, iteration: usize) -> ClipPass {
        let kappa = self.config.clip_sigma;
        let limit = self.astrometric_sigma() * kappa;
        let mag_limit = self.photometric_sigma() * kappa;
        let mut changed = 0;
        for o in &mut self.obs {
            let good = o.residual.x.abs() <= limit.x && o.residual.y.abs() <= limit.y;
            let flux_good = o.mag.is_some() && o.mag_residual.abs() <= mag_limit;
            changed += usize::from(good != o.good) + usize::from(flux_good != o.flux_good);
            o.good = good;
            o.flux_good = flux_good;
        }
        ClipPass {
            iteration,
            rejected: self.obs.iter().filter(|o| !o.good).count(),
            flux_rejected: self.obs.iter().filter(|o| o.mag.is_some() && !o.flux_good).count(),
            changed,
        }
    }

    fn update_weights(&mut self) {
        let sigma = self.astrometric_sigma();
        self.weight = DVec2::ONE / (sigma * sigma);
    }

    /// Predicted sky position and calibrated magnitude of every detection.
    fn predictions(&self) -> Vec<(DVec2, f64)> {
        self.obs
            .par_iter()
            .map(|o| {
                let sky = self.models[o.exposure].sky(o.fp);
                (sky, self.calibrated_mag(o).unwrap_or(0.0))
            })
            .collect()
    }

    fn into_result(
        self,
        mut matches: Vec<ObservationGroup>,
        mut sources: Vec<ObservationGroup>,
        detectors: &DetectorSet,
        iterations: usize,
        converged: bool,
    ) -> MosaicResult {
        for star in &self.stars {
            let group = match star.kind {
                GroupKind::Match => &mut matches[star.group],
                GroupKind::Source => &mut sources[star.group],
            };
            group.position = Some(star.sky);
            group.magnitude = Some(star.mag);
            for o in &self.obs[star.obs.clone()] {
                let detection = &mut group.detections[o.detection];
                detection.good = o.good;
                detection.flux_good = o.flux_good;
                detection.residual = o.residual * ARCSEC_PER_DEG;
                detection.mag_residual = o.mag_residual;
            }
        }

        let good: Vec<&Obs> = self.obs.iter().filter(|o| o.good).collect();
        let astrometric_rms_arcsec = if good.is_empty() {
            0.0
        } else {
            (good.iter().map(|o| o.residual.length_squared()).sum::<f64>() / good.len() as f64)
                .sqrt()
                * ARCSEC_PER_DEG
        };
        let mag_residuals: Vec<f64> = self
            .obs
            .iter()
            .filter(|o| o.flux_good)
            .map(|o| o.mag_residual)
            .collect();
        let photometric_clip_history =
            clipped_std_history(&mag_residuals, SUMMARY_CLIP_SIGMA, self.config.clip_iterations);
        let layout = AstroLayout::new(&self);
        let frozen_exposures: Vec<ExposureId> = layout
            .exposures
            .iter()
            .zip(&self.exposures)
            .filter(|(slot, _)| slot.is_none())
            .map(|(_, &e)| e)
            .collect();

        let summary = FitSummary {
            iterations,
            converged,
            best_effort: !converged,
            astrometric_rms_arcsec,
            photometric_rms_mag: photometric_clip_history.last().copied().unwrap_or(0.0),
            photometric_clip_history,
            good: good.len(),
            clipped: self.obs.len() - good.len(),
            frozen_exposures,
            clip_passes: Vec::new(),
        };

        let alignments: BTreeMap<DetectorId, DetectorAlignment> = self
            .detector_ids
            .iter()
            .copied()
            .zip(self.alignments.iter().copied())
            .collect();
        let fexp = self
            .exposures
            .iter()
            .zip(&self.exposure_mag)
            .map(|(&e, &m)| (e, 10f64.powf(-0.4 * m)))
            .collect();
        let fchip = self
            .detector_ids
            .iter()
            .zip(&self.detector_mag)
            .map(|(&d, &m)| (d, 10f64.powf(-0.4 * m)))
            .collect();

        MosaicResult {
            models: self.exposures.iter().copied().zip(self.models).collect(),
            detectors: detectors.aligned(&alignments),
            alignments,
            flux: self.flux,
            fexp,
            fchip,
            matches,
            sources,
            summary,
        }
    }
}

/// Largest angular change between two prediction sets, arcsec, and largest
/// magnitude change.
fn prediction_change(before: &[(DVec2, f64)], after: &[(DVec2, f64)]) -> (f64, f64) {
    before
        .iter()
        .zip(after)
        .fold((0.0f64, 0.0f64), |(shift, mag), ((s0, m0), (s1, m1))| {
            (
                shift.max(angular_separation(*s0, *s1) * ARCSEC_PER_DEG),
                mag.max((m1 - m0).abs()),
            )
        })
}

/// Joint astrometric and photometric solver.
#[derive(Debug, Clone)]
pub struct GlobalFitEngine<'a> {
    config: &'a MosaicConfig,
}

impl<'a> GlobalFitEngine<'a> {
    pub fn new(config: &'a MosaicConfig) -> Self {
        Self { config }
    }

    /// Fit all exposures of `wcs` against the cross-matched groups.
    ///
    /// `sources` may be `None`, in which case only reference-anchored groups
    /// inform the fit. With internal fitting disabled the sources are
    /// carried through untouched.
    pub fn run(
        &self,
        matches: Vec<ObservationGroup>,
        sources: Option<Vec<ObservationGroup>>,
        detectors: &DetectorSet,
        wcs: &WcsTable,
    ) -> Result<MosaicResult> {
        let config = self.config;
        let sources = sources.unwrap_or_default();
        let mut state = FitState::new(config, &matches, &sources, detectors, wcs)?;
        tracing::info!(
            groups = state.stars.len(),
            detections = state.obs.len(),
            exposures = state.exposures.len(),
            detectors = state.detector_ids.len(),
            order = config.fitting_order,
            internal = config.internal_fitting,
            "Starting global fit"
        );

        let mut previous = state.predictions();
        let mut converged = false;
        let mut iterations = 0;
        let mut last_shift = f64::INFINITY;
        let mut clip_passes = Vec::new();
        for iteration in 1..=config.max_iterations {
            iterations = iteration;
            astrometry::solve_pass(&mut state)?;
            photometry::solve_pass(&mut state)?;
            state.update_residuals();
            let changed = if iteration <= config.clip_iterations {
                let pass = state.clip(iteration);
                clip_passes.push(pass);
                pass.changed
            } else {
                0
            };
            state.update_weights();

            let current = state.predictions();
            let (shift, mag_change) = prediction_change(&previous, &current);
            previous = current;
            last_shift = shift;
            tracing::debug!(
                iteration,
                shift_arcsec = shift,
                mag_change,
                flags_changed = changed,
                good = state.good_count(),
                "Fit iteration"
            );
            if shift < config.tolerance_arcsec && mag_change < config.tolerance_mag && changed == 0 {
                converged = true;
                break;
            }
        }

        if !converged {
            if !config.allow_best_effort {
                return Err(Error::NotConverged {
                    iterations,
                    shift_arcsec: last_shift,
                });
            }
            tracing::warn!(
                iterations,
                shift_arcsec = last_shift,
                "Fit did not converge, returning best-effort result"
            );
        }

        let mut result = state.into_result(matches, sources, detectors, iterations, converged);
        result.summary.clip_passes = clip_passes;
        for exposure in &result.summary.frozen_exposures {
            tracing::warn!(exposure = %exposure, "Exposure polynomial frozen, too few good detections");
        }
        tracing::info!(
            iterations,
            converged,
            astrometric_rms_arcsec = result.summary.astrometric_rms_arcsec,
            photometric_rms_mag = result.summary.photometric_rms_mag,
            good = result.summary.good,
            clipped = result.summary.clipped,
            "Global fit complete"
        );
        Ok(result)
    }
}
