//! Color-term transformation of reference magnitudes.

use serde::{Deserialize, Serialize};

use crate::ingest::source::ReferenceEntry;
use crate::math::{flux_to_mag, mag_to_flux};

/// Quadratic color term from two catalog bands to the instrument band:
///
/// ```text
/// m = m1 + c0 + c1 (m1 - m2) + c2 (m1 - m2)²
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorTerm {
    pub primary: String,
    pub secondary: String,
    pub c0: f64,
    pub c1: f64,
    pub c2: f64,
}

impl ColorTerm {
    pub fn transform_mag(&self, m1: f64, m2: f64) -> f64 {
        let color = m1 - m2;
        m1 + self.c0 + self.c1 * color + self.c2 * color * color
    }

    /// Color-corrected `(flux, flux_err)` of a reference entry.
    ///
    /// `None` when either band is missing or the result is not finite. The
    /// error keeps the primary band's relative error.
    pub fn apply(&self, entry: &ReferenceEntry) -> Option<(f64, f64)> {
        let f1 = *entry.band_fluxes.get(&self.primary)?;
        let f2 = *entry.band_fluxes.get(&self.secondary)?;
        let mag = self.transform_mag(flux_to_mag(f1), flux_to_mag(f2));
        let flux = mag_to_flux(mag);
        if !flux.is_finite() || flux <= 0.0 {
            return None;
        }
        let rel_err = if entry.flux > 0.0 && entry.flux_err.is_finite() {
            entry.flux_err / entry.flux
        } else {
            0.0
        };
        Some((flux, flux * rel_err))
    }
}
