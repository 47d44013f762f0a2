//! Detections, reference matches and observation groups.

use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::math::{MAG_PER_LN_FLUX, flux_to_mag};
use crate::types::{DataKey, DetectorId, ExposureId};

/// One measured source on one (exposure, detector).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub exposure: ExposureId,
    pub detector: DetectorId,
    /// Identifier of the record in its source catalog.
    pub source_id: u64,
    /// Detector pixel position.
    pub pixel: DVec2,
    /// Sky position (RA, Dec) in degrees from the input WCS.
    pub sky: DVec2,
    pub flux: f64,
    pub flux_err: f64,
    /// Astrometric inlier flag, maintained by the fit.
    pub good: bool,
    /// Photometric inlier flag, maintained by the fit.
    pub flux_good: bool,
    /// Fitted position minus group position, arcsec (xi, eta).
    pub residual: DVec2,
    /// Fitted magnitude minus group magnitude.
    pub mag_residual: f64,
}

impl Detection {
    pub fn new(
        key: DataKey,
        source_id: u64,
        pixel: DVec2,
        sky: DVec2,
        flux: f64,
        flux_err: f64,
    ) -> Self {
        Self {
            exposure: key.exposure,
            detector: key.detector,
            source_id,
            pixel,
            sky,
            flux,
            flux_err,
            good: true,
            flux_good: true,
            residual: DVec2::ZERO,
            mag_residual: 0.0,
        }
    }

    #[inline]
    pub fn key(&self) -> DataKey {
        DataKey::new(self.exposure, self.detector)
    }

    pub fn has_valid_flux(&self) -> bool {
        self.flux.is_finite() && self.flux > 0.0 && self.flux_err.is_finite() && self.flux_err > 0.0
    }

    /// Instrumental magnitude, `None` for non-positive flux.
    pub fn magnitude(&self) -> Option<f64> {
        (self.flux.is_finite() && self.flux > 0.0).then(|| flux_to_mag(self.flux))
    }

    /// Magnitude error from the flux error.
    pub fn magnitude_err(&self) -> Option<f64> {
        self.has_valid_flux()
            .then(|| MAG_PER_LN_FLUX * self.flux_err / self.flux)
    }

    /// Flux signal-to-noise, 0 when undefined.
    pub fn significance(&self) -> f64 {
        if self.has_valid_flux() {
            self.flux / self.flux_err
        } else {
            0.0
        }
    }
}

/// One reference-catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceStar {
    pub id: u64,
    pub sky: DVec2,
    pub flux: f64,
    pub flux_err: f64,
}

impl ReferenceStar {
    pub fn magnitude(&self) -> Option<f64> {
        (self.flux.is_finite() && self.flux > 0.0).then(|| flux_to_mag(self.flux))
    }

    pub fn magnitude_err(&self) -> Option<f64> {
        (self.flux.is_finite() && self.flux > 0.0 && self.flux_err.is_finite() && self.flux_err > 0.0)
            .then(|| MAG_PER_LN_FLUX * self.flux_err / self.flux)
    }
}

/// A detection paired with its reference-catalog counterpart, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceMatch {
    pub reference: Option<ReferenceStar>,
    pub detection: Detection,
}

/// Detections believed to be the same physical object.
///
/// The reference star, when present, is element 0 of the group; no two
/// detections share an (exposure, detector).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationGroup {
    pub reference: Option<ReferenceStar>,
    pub detections: Vec<Detection>,
    /// Fitted sky position, set by the fit.
    pub position: Option<DVec2>,
    /// Fitted magnitude, set by the fit.
    pub magnitude: Option<f64>,
}

impl ObservationGroup {
    pub fn new(reference: Option<ReferenceStar>, detections: Vec<Detection>) -> Self {
        Self {
            reference,
            detections,
            position: None,
            magnitude: None,
        }
    }

    /// Group size, counting the reference head.
    pub fn len(&self) -> usize {
        self.detections.len() + usize::from(self.reference.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_anchored(&self) -> bool {
        self.reference.is_some()
    }

    pub fn good_count(&self) -> usize {
        self.detections.iter().filter(|d| d.good).count()
    }

    /// Best current sky estimate: fitted position, reference, or mean of detections.
    pub fn anchor(&self) -> Option<DVec2> {
        if let Some(position) = self.position {
            return Some(position);
        }
        if let Some(reference) = &self.reference {
            return Some(reference.sky);
        }
        mean_sky(self.detections.iter().map(|d| d.sky))
    }
}

/// Mean of sky positions via unit vectors, robust to the RA wrap.
pub fn mean_sky(positions: impl Iterator<Item = DVec2>) -> Option<DVec2> {
    let mut sum = [0.0; 3];
    let mut n = 0usize;
    for p in positions {
        let v = crate::wcs::unit_vector(p);
        sum[0] += v[0];
        sum[1] += v[1];
        sum[2] += v[2];
        n += 1;
    }
    (n > 0).then(|| crate::wcs::from_unit_vector(sum))
}

/// Inputs of one exposure, merged over its detectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureCatalog {
    pub exposure: ExposureId,
    /// Point-source detections.
    pub detections: Vec<Detection>,
    /// Detections with a reference-catalog counterpart, from the external matcher.
    pub matches: Vec<ReferenceMatch>,
}

impl ExposureCatalog {
    pub fn new(exposure: ExposureId) -> Self {
        Self {
            exposure,
            detections: Vec::new(),
            matches: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty() && self.matches.is_empty()
    }
}
