//! The immutable outcome of the global fit.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::fit::flux::FluxFitParams;
use crate::fit::model::DistortionModel;
use crate::geometry::{DetectorAlignment, DetectorSet};
use crate::observation::ObservationGroup;
use crate::types::{DetectorId, ExposureId};

/// Flags after one outlier-rejection pass of the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipPass {
    pub iteration: usize,
    /// Detections rejected astrometrically.
    pub rejected: usize,
    /// Detections with a magnitude rejected photometrically.
    pub flux_rejected: usize,
    /// Flags that changed in this pass.
    pub changed: usize,
}

/// Diagnostics of one fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitSummary {
    pub iterations: usize,
    pub converged: bool,
    /// Set when the iteration cap was reached and the caller allowed a
    /// best-effort result.
    pub best_effort: bool,
    /// RMS of the astrometric residual length of good detections.
    pub astrometric_rms_arcsec: f64,
    /// 2.1-sigma clipped standard deviation of good magnitude residuals.
    pub photometric_rms_mag: f64,
    /// Clipped standard deviation of good magnitude residuals after 0, 1, ...
    /// clipping rounds.
    pub photometric_clip_history: Vec<f64>,
    /// Astrometrically good detections.
    pub good: usize,
    /// Detections flagged as astrometric outliers.
    pub clipped: usize,
    /// Exposures whose polynomial could not be solved in the final pass.
    pub frozen_exposures: Vec<ExposureId>,
    pub clip_passes: Vec<ClipPass>,
}

/// Fitted models, scale factors and annotated groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MosaicResult {
    pub models: BTreeMap<ExposureId, DistortionModel>,
    /// Detector geometry with the fitted alignments applied.
    pub detectors: DetectorSet,
    pub alignments: BTreeMap<DetectorId, DetectorAlignment>,
    pub flux: FluxFitParams,
    /// Per-exposure flux scale, `10^(-0.4 ε_e)`.
    pub fexp: BTreeMap<ExposureId, f64>,
    /// Per-detector flux scale, `10^(-0.4 κ_c)`.
    pub fchip: BTreeMap<DetectorId, f64>,
    pub matches: Vec<ObservationGroup>,
    pub sources: Vec<ObservationGroup>,
    pub summary: FitSummary,
}

impl MosaicResult {
    pub fn exposures(&self) -> impl Iterator<Item = ExposureId> + '_ {
        self.models.keys().copied()
    }

    /// Flux scale of an exposure, 1 when it was not fitted.
    pub fn fexp(&self, exposure: ExposureId) -> f64 {
        self.fexp.get(&exposure).copied().unwrap_or(1.0)
    }

    /// Flux scale of a detector, 1 when it was not fitted.
    pub fn fchip(&self, detector: DetectorId) -> f64 {
        self.fchip.get(&detector).copied().unwrap_or(1.0)
    }

    /// All groups, reference-anchored first.
    pub fn groups(&self) -> impl Iterator<Item = &ObservationGroup> {
        self.matches.iter().chain(&self.sources)
    }
}
