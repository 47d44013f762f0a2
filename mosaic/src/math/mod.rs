//! Numerical helpers: 2-D polynomial bases, least squares and robust statistics.

pub mod poly;
pub mod statistics;

/// Magnitude per natural-log unit of flux: 2.5 / ln 10.
pub const MAG_PER_LN_FLUX: f64 = 1.085_736_204_758_129_6;

/// Degrees to arcseconds.
pub const ARCSEC_PER_DEG: f64 = 3600.0;

/// Instrumental magnitude of a positive flux.
#[inline]
pub fn flux_to_mag(flux: f64) -> f64 {
    -2.5 * flux.log10()
}

#[inline]
pub fn mag_to_flux(mag: f64) -> f64 {
    10f64.powf(-0.4 * mag)
}
