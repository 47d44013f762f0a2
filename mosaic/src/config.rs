//! Configuration for the mosaic calibration run.
//!
//! All options consumed by ingest, cross-matching and the global fit live in
//! [`MosaicConfig`]. Defaults follow the values used for Subaru Suprime-Cam and
//! HSC processing; ranges are enforced by [`MosaicConfig::validate`].

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::math::poly::{MAX_DEGREE, PolyBasis};

// =============================================================================
// Enumerated options
// =============================================================================

/// Which reference star heads a group that chains several catalog entries.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReferenceTieBreak {
    /// Reference star with the smallest mean distance to the group's detections.
    #[default]
    Nearest,
    /// Reference star of the first match in input order.
    FirstSeen,
}

/// Which detection survives when one (exposure, detector) contributes twice to a group.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DuplicateResolution {
    /// Closest to the group anchor (reference position or centroid).
    #[default]
    Nearest,
    /// Highest flux / flux error.
    Significance,
}

// =============================================================================
// MosaicConfig
// =============================================================================

/// Options of one calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MosaicConfig {
    /// Number of brightest internal detections kept per (exposure, detector)
    /// before cross-matching.
    pub n_brightest: usize,
    /// Cross-match radius in arcseconds.
    pub match_radius_arcsec: f64,
    /// Order of the per-exposure astrometric polynomial.
    pub fitting_order: usize,
    /// Use stars without a catalog counterpart in the fit.
    pub internal_fitting: bool,
    /// Solve detector offsets in the focal plane.
    pub solve_ccd: bool,
    /// Solve detector rotations (only with `solve_ccd`).
    pub allow_rotation: bool,
    /// Positional error of the reference catalog in degrees.
    pub cat_rms: f64,
    /// Basis of the flux-correction polynomial.
    pub flux_basis: PolyBasis,
    /// Order of the flux-correction polynomial. Zero disables the surface.
    pub flux_fit_order: usize,
    /// Anchor star magnitudes to the reference catalog instead of a relative fit.
    pub flux_fit_absolute: bool,

    /// When fewer point-source matches than this survive selection on one
    /// (exposure, detector), saturated matches are admitted as well.
    pub min_selected_matches: usize,
    /// Head selection for groups chaining several reference stars.
    pub reference_tie_break: ReferenceTieBreak,
    /// Duplicate (exposure, detector) resolution inside a group.
    pub duplicate_resolution: DuplicateResolution,
    /// Rejection threshold in robust standard deviations.
    pub clip_sigma: f64,
    /// Number of passes during which outlier flags are re-derived.
    pub clip_iterations: usize,
    /// Iteration cap of the global fit.
    pub max_iterations: usize,
    /// Convergence threshold on the change of predicted positions, arcsec.
    pub tolerance_arcsec: f64,
    /// Convergence threshold on the change of predicted magnitudes.
    pub tolerance_mag: f64,
    /// Return a result flagged as best-effort instead of failing when the
    /// iteration cap is reached.
    pub allow_best_effort: bool,
}

impl Default for MosaicConfig {
    fn default() -> Self {
        Self {
            n_brightest: 300,
            match_radius_arcsec: 5.0,
            fitting_order: 5,
            internal_fitting: true,
            solve_ccd: true,
            allow_rotation: true,
            cat_rms: 0.040 / 3600.0,
            flux_basis: PolyBasis::Chebyshev,
            flux_fit_order: 5,
            flux_fit_absolute: false,
            min_selected_matches: 10,
            reference_tie_break: ReferenceTieBreak::Nearest,
            duplicate_resolution: DuplicateResolution::Nearest,
            clip_sigma: 3.0,
            clip_iterations: 3,
            max_iterations: 20,
            tolerance_arcsec: 1e-4,
            tolerance_mag: 1e-5,
            allow_best_effort: false,
        }
    }
}

impl MosaicConfig {
    /// Parse a (possibly partial) YAML document; missing fields take defaults.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yml::to_string(self)?)
    }

    /// Cross-match radius in degrees.
    pub fn match_radius_deg(&self) -> f64 {
        self.match_radius_arcsec / 3600.0
    }

    /// Check every option against its allowed range.
    pub fn validate(&self) -> Result<()> {
        check(
            self.n_brightest >= 100,
            format!("n_brightest must be >= 100, got {}", self.n_brightest),
        )?;
        check(
            self.match_radius_arcsec >= 3.0,
            format!(
                "match_radius_arcsec must be >= 3.0, got {}",
                self.match_radius_arcsec
            ),
        )?;
        check(
            self.fitting_order >= 2,
            format!("fitting_order must be >= 2, got {}", self.fitting_order),
        )?;
        check(
            self.fitting_order <= MAX_DEGREE && self.flux_fit_order <= MAX_DEGREE,
            format!(
                "polynomial orders must be <= {}, got {} / {}",
                MAX_DEGREE, self.fitting_order, self.flux_fit_order
            ),
        )?;
        check(
            self.cat_rms.is_finite() && self.cat_rms > 0.0,
            format!("cat_rms must be positive, got {}", self.cat_rms),
        )?;
        check(
            self.clip_sigma.is_finite() && self.clip_sigma > 0.0,
            format!("clip_sigma must be positive, got {}", self.clip_sigma),
        )?;
        check(
            self.max_iterations >= 1,
            format!("max_iterations must be >= 1, got {}", self.max_iterations),
        )?;
        check(
            self.tolerance_arcsec > 0.0 && self.tolerance_mag > 0.0,
            format!(
                "tolerances must be positive, got {} arcsec / {} mag",
                self.tolerance_arcsec, self.tolerance_mag
            ),
        )?;
        Ok(())
    }
}

fn check(condition: bool, message: String) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(Error::InvalidConfig(message))
    }
}
