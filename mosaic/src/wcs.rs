//! World Coordinate System with gnomonic projection and SIP distortion.
//!
//! # Model
//!
//! ```text
//! (u, v)     = (x, y) - CRPIX
//! (u', v')   = (u + f(u, v), v + g(u, v))        SIP A/B, 2 <= p+q <= order
//! (xi, eta)  = CD · (u', v')                      degrees
//! (ra, dec)  = deproject((xi, eta), CRVAL)        gnomonic (TAN)
//! ```
//!
//! The inverse SIP polynomials (AP/BP) give a starting point for
//! [`Wcs::sky_to_pixel`], which is then polished with Newton steps against the
//! forward model so round trips are exact to floating-point precision.

use std::collections::BTreeMap;

use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::geometry::{Detector, rotate};
use crate::math::poly::{PolyBasis, PolyTerms};
use crate::types::ExposureId;

/// Gnomonic projection of `sky` (RA, Dec degrees) about `crval`.
///
/// Returns standard coordinates (xi, eta) in degrees, or `None` when the point
/// is on or behind the tangent plane horizon.
pub fn project(sky: DVec2, crval: DVec2) -> Option<DVec2> {
    let ra = sky.x.to_radians();
    let dec = sky.y.to_radians();
    let ra0 = crval.x.to_radians();
    let dec0 = crval.y.to_radians();

    let (sin_dec, cos_dec) = dec.sin_cos();
    let (sin_dec0, cos_dec0) = dec0.sin_cos();
    let (sin_dra, cos_dra) = (ra - ra0).sin_cos();

    let d = sin_dec * sin_dec0 + cos_dec * cos_dec0 * cos_dra;
    if d <= 1e-12 || !d.is_finite() {
        return None;
    }

    let xi = cos_dec * sin_dra / d;
    let eta = (sin_dec * cos_dec0 - cos_dec * sin_dec0 * cos_dra) / d;
    Some(DVec2::new(xi.to_degrees(), eta.to_degrees()))
}

/// Inverse of [`project`]: standard coordinates (degrees) to (RA, Dec) degrees.
/// RA is normalised to `[0, 360)`.
pub fn deproject(xi_eta: DVec2, crval: DVec2) -> DVec2 {
    let xi = xi_eta.x.to_radians();
    let eta = xi_eta.y.to_radians();
    let ra0 = crval.x.to_radians();
    let dec0 = crval.y.to_radians();

    let (sin_dec0, cos_dec0) = dec0.sin_cos();
    let denom = cos_dec0 - eta * sin_dec0;

    let ra = ra0 + xi.atan2(denom);
    let dec = (sin_dec0 + eta * cos_dec0).atan2((xi * xi + denom * denom).sqrt());

    DVec2::new(ra.to_degrees().rem_euclid(360.0), dec.to_degrees())
}

/// Angular separation in degrees (haversine).
pub fn angular_separation(a: DVec2, b: DVec2) -> f64 {
    let (ra1, dec1) = (a.x.to_radians(), a.y.to_radians());
    let (ra2, dec2) = (b.x.to_radians(), b.y.to_radians());
    let h = ((dec2 - dec1) / 2.0).sin().powi(2)
        + dec1.cos() * dec2.cos() * ((ra2 - ra1) / 2.0).sin().powi(2);
    (2.0 * h.sqrt().min(1.0).asin()).to_degrees()
}

/// Unit vector of a sky position.
pub fn unit_vector(sky: DVec2) -> [f64; 3] {
    let (ra, dec) = (sky.x.to_radians(), sky.y.to_radians());
    [dec.cos() * ra.cos(), dec.cos() * ra.sin(), dec.sin()]
}

/// Sky position of a (not necessarily normalised) vector.
pub fn from_unit_vector(v: [f64; 3]) -> DVec2 {
    let ra = v[1].atan2(v[0]).to_degrees().rem_euclid(360.0);
    let dec = v[2].atan2((v[0] * v[0] + v[1] * v[1]).sqrt()).to_degrees();
    DVec2::new(ra, dec)
}

/// SIP distortion polynomials in pixel units relative to CRPIX.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sip {
    pub order: usize,
    /// Forward coefficients for terms `2 <= p+q <= order`.
    pub a: Vec<f64>,
    pub b: Vec<f64>,
    /// Inverse coefficients for terms `1 <= p+q <= order`.
    pub ap: Vec<f64>,
    pub bp: Vec<f64>,
}

impl Sip {
    pub fn forward_terms(order: usize) -> PolyTerms {
        PolyTerms::new(PolyBasis::Ordinary, 2, order)
    }

    pub fn inverse_terms(order: usize) -> PolyTerms {
        PolyTerms::new(PolyBasis::Ordinary, 1, order)
    }

    /// Forward distortion `(f, g)` and its Jacobian `I + ∂(f, g)/∂(u, v)`.
    fn forward(&self, uv: DVec2) -> (DVec2, [[f64; 2]; 2]) {
        let terms = Self::forward_terms(self.order);
        let (f, gf) = terms.eval_with_gradient(&self.a, uv);
        let (g, gg) = terms.eval_with_gradient(&self.b, uv);
        (
            uv + DVec2::new(f, g),
            [[1.0 + gf.x, gf.y], [gg.x, 1.0 + gg.y]],
        )
    }

    /// Initial inverse estimate from AP/BP, identity when they are empty.
    fn inverse_start(&self, uv: DVec2) -> DVec2 {
        if self.ap.is_empty() || self.bp.is_empty() {
            return uv;
        }
        let terms = Self::inverse_terms(self.order);
        uv + DVec2::new(terms.eval(&self.ap, uv), terms.eval(&self.bp, uv))
    }

    /// Coefficient `A_pq` by exponent.
    pub fn a_coefficient(&self, p: usize, q: usize) -> f64 {
        Self::forward_terms(self.order)
            .index_of(p, q)
            .and_then(|i| self.a.get(i).copied())
            .unwrap_or(0.0)
    }

    pub fn b_coefficient(&self, p: usize, q: usize) -> f64 {
        Self::forward_terms(self.order)
            .index_of(p, q)
            .and_then(|i| self.b.get(i).copied())
            .unwrap_or(0.0)
    }
}

/// World Coordinate System of one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wcs {
    /// Reference pixel.
    pub crpix: DVec2,
    /// Reference sky position (RA, Dec) in degrees.
    pub crval: DVec2,
    /// Pixel offset to standard coordinates, degrees per pixel.
    pub cd: [[f64; 2]; 2],
    pub sip: Option<Sip>,
    /// Image size (width, height) in pixels.
    pub naxis: (u32, u32),
}

impl Wcs {
    pub fn new(crpix: DVec2, crval: DVec2, cd: [[f64; 2]; 2], naxis: (u32, u32)) -> Self {
        Self {
            crpix,
            crval,
            cd,
            sip: None,
            naxis,
        }
    }

    /// WCS with square pixels of `pixel_scale` arcsec, rotated by `rotation` degrees.
    pub fn from_scale_rotation(
        crpix: DVec2,
        crval: DVec2,
        pixel_scale: f64,
        rotation: f64,
        naxis: (u32, u32),
    ) -> Self {
        let scale_deg = pixel_scale / 3600.0;
        let (sin_r, cos_r) = rotation.to_radians().sin_cos();
        let cd = [
            [scale_deg * cos_r, -scale_deg * sin_r],
            [scale_deg * sin_r, scale_deg * cos_r],
        ];
        Self::new(crpix, crval, cd, naxis)
    }

    pub fn with_sip(mut self, sip: Sip) -> Self {
        self.sip = Some(sip);
        self
    }

    #[inline]
    pub fn cd_det(&self) -> f64 {
        self.cd[0][0] * self.cd[1][1] - self.cd[0][1] * self.cd[1][0]
    }

    #[inline]
    fn apply_cd(&self, d: DVec2) -> DVec2 {
        DVec2::new(
            self.cd[0][0] * d.x + self.cd[0][1] * d.y,
            self.cd[1][0] * d.x + self.cd[1][1] * d.y,
        )
    }

    #[inline]
    fn apply_cd_inverse(&self, xi: DVec2) -> DVec2 {
        let det = self.cd_det();
        DVec2::new(
            (self.cd[1][1] * xi.x - self.cd[0][1] * xi.y) / det,
            (-self.cd[1][0] * xi.x + self.cd[0][0] * xi.y) / det,
        )
    }

    /// Standard coordinates (xi, eta) in degrees of a pixel position.
    pub fn pixel_to_intermediate(&self, pixel: DVec2) -> DVec2 {
        let uv = pixel - self.crpix;
        let distorted = match &self.sip {
            Some(sip) => sip.forward(uv).0,
            None => uv,
        };
        self.apply_cd(distorted)
    }

    pub fn pixel_to_sky(&self, pixel: DVec2) -> DVec2 {
        deproject(self.pixel_to_intermediate(pixel), self.crval)
    }

    /// Inverse of [`Wcs::pixel_to_sky`]; `None` behind the tangent plane or
    /// when the distortion cannot be inverted.
    pub fn sky_to_pixel(&self, sky: DVec2) -> Option<DVec2> {
        let xi = project(sky, self.crval)?;
        let target = self.apply_cd_inverse(xi);
        let Some(sip) = &self.sip else {
            return Some(self.crpix + target);
        };

        let mut uv = sip.inverse_start(target);
        for _ in 0..20 {
            let (value, jac) = sip.forward(uv);
            let r = value - target;
            if r.length() < 1e-12 {
                break;
            }
            let det = jac[0][0] * jac[1][1] - jac[0][1] * jac[1][0];
            if det.abs() < 1e-12 {
                return None;
            }
            uv -= DVec2::new(
                (jac[1][1] * r.x - jac[0][1] * r.y) / det,
                (-jac[1][0] * r.x + jac[0][0] * r.y) / det,
            );
        }
        uv.is_finite().then_some(self.crpix + uv)
    }

    /// Determinant of `∂(xi, eta)/∂(x, y)` in square degrees per square pixel.
    pub fn jacobian_det(&self, pixel: DVec2) -> f64 {
        let distortion = match &self.sip {
            Some(sip) => {
                let (_, j) = sip.forward(pixel - self.crpix);
                j[0][0] * j[1][1] - j[0][1] * j[1][0]
            }
            None => 1.0,
        };
        self.cd_det() * distortion
    }

    /// Pixel area at `pixel` relative to the linear (CD-only) pixel area.
    pub fn relative_pixel_area(&self, pixel: DVec2) -> f64 {
        self.jacobian_det(pixel) / self.cd_det()
    }

    /// Mean linear pixel scale in arcseconds per pixel.
    pub fn pixel_scale_arcsec(&self) -> f64 {
        let scale_x = (self.cd[0][0].powi(2) + self.cd[1][0].powi(2)).sqrt();
        let scale_y = (self.cd[0][1].powi(2) + self.cd[1][1].powi(2)).sqrt();
        (scale_x + scale_y) / 2.0 * 3600.0
    }

    /// Linear part of this detector WCS re-expressed in focal-plane pixels.
    ///
    /// The reference pixel moves with the detector centre and the CD matrix
    /// absorbs the detector yaw. SIP terms are dropped: they describe the
    /// detector's own footprint and do not extrapolate across the focal plane.
    pub fn to_focal_plane(&self, detector: &Detector) -> Wcs {
        let crpix = detector.pixel_to_focal_plane(self.crpix);
        // CD_fp = CD · R(-yaw)
        let c0 = rotate(DVec2::X, -detector.yaw);
        let c1 = rotate(DVec2::Y, -detector.yaw);
        let col0 = self.apply_cd(c0);
        let col1 = self.apply_cd(c1);
        Wcs {
            crpix,
            crval: self.crval,
            cd: [[col0.x, col1.x], [col0.y, col1.y]],
            sip: None,
            naxis: self.naxis,
        }
    }
}

/// Current WCS of every exposure, in the focal-plane frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WcsTable {
    entries: BTreeMap<ExposureId, Wcs>,
}

impl WcsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, exposure: ExposureId, wcs: Wcs) -> Option<Wcs> {
        self.entries.insert(exposure, wcs)
    }

    pub fn get(&self, exposure: ExposureId) -> Option<&Wcs> {
        self.entries.get(&exposure)
    }

    pub fn remove(&mut self, exposure: ExposureId) -> Option<Wcs> {
        self.entries.remove(&exposure)
    }

    pub fn contains(&self, exposure: ExposureId) -> bool {
        self.entries.contains_key(&exposure)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn exposures(&self) -> impl Iterator<Item = ExposureId> + '_ {
        self.entries.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ExposureId, &Wcs)> {
        self.entries.iter().map(|(&id, wcs)| (id, wcs))
    }
}

impl FromIterator<(ExposureId, Wcs)> for WcsTable {
    fn from_iter<I: IntoIterator<Item = (ExposureId, Wcs)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
