//! Per-exposure astrometric distortion model.
//!
//! Maps focal-plane pixels to standard coordinates about the exposure's
//! tangent point `crval`:
//!
//! ```text
//! (u, v)    = (fp - origin) / scale
//! xi        = Σ a_i u^p v^q          0 <= p+q <= order, degrees
//! eta       = Σ b_i u^p v^q
//! (ra, dec) = deproject((xi, eta), crval)
//! ```
//!
//! After each update the constant terms are folded into `crval` so the
//! exposure origin always maps onto the tangent point.

use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::math::poly::{PolyBasis, PolyTerms, full_term_count};
use crate::types::ExposureId;
use crate::wcs::{Wcs, deproject, project};

/// Samples per axis of the grids used to re-express the polynomial.
const GRID_SAMPLES: usize = 12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistortionModel {
    pub exposure: ExposureId,
    /// Tangent point (A, D) in degrees.
    pub crval: DVec2,
    /// Focal-plane origin (x0, y0) in pixels.
    pub origin: DVec2,
    /// Focal-plane normalisation in pixels.
    pub scale: f64,
    pub order: usize,
    /// xi coefficients, degrees.
    pub a: Vec<f64>,
    /// eta coefficients, degrees.
    pub b: Vec<f64>,
    /// Inverse correction of `u` on the linearly inverted position.
    pub ap: Vec<f64>,
    pub bp: Vec<f64>,
}

impl DistortionModel {
    pub fn terms(order: usize) -> PolyTerms {
        PolyTerms::new(PolyBasis::Ordinary, 0, order)
    }

    fn inverse_terms(order: usize) -> PolyTerms {
        PolyTerms::new(PolyBasis::Ordinary, 1, order)
    }

    /// Model of order `order` reproducing `wcs` (expressed in focal-plane pixels).
    pub fn from_wcs(
        exposure: ExposureId,
        wcs: &Wcs,
        origin: DVec2,
        scale: f64,
        order: usize,
    ) -> Option<Self> {
        let n = full_term_count(order);
        let mut model = Self {
            exposure,
            crval: wcs.pixel_to_sky(origin),
            origin,
            scale,
            order,
            a: vec![0.0; n],
            b: vec![0.0; n],
            ap: Vec::new(),
            bp: Vec::new(),
        };
        let crval = model.crval;
        model.refit(|fp| project(wcs.pixel_to_sky(fp), crval))?;
        model.fit_inverse();
        Some(model)
    }

    #[inline]
    pub fn normalized(&self, fp: DVec2) -> DVec2 {
        (fp - self.origin) / self.scale
    }

    /// Standard coordinates (xi, eta) in degrees.
    pub fn intermediate(&self, fp: DVec2) -> DVec2 {
        let terms = Self::terms(self.order);
        let uv = self.normalized(fp);
        DVec2::new(terms.eval(&self.a, uv), terms.eval(&self.b, uv))
    }

    pub fn sky(&self, fp: DVec2) -> DVec2 {
        deproject(self.intermediate(fp), self.crval)
    }

    /// `∂(xi, eta)/∂(x, y)` in degrees per pixel, rows (xi, eta).
    pub fn jacobian(&self, fp: DVec2) -> [[f64; 2]; 2] {
        let terms = Self::terms(self.order);
        let uv = self.normalized(fp);
        let (_, ga) = terms.eval_with_gradient(&self.a, uv);
        let (_, gb) = terms.eval_with_gradient(&self.b, uv);
        [
            [ga.x / self.scale, ga.y / self.scale],
            [gb.x / self.scale, gb.y / self.scale],
        ]
    }

    pub fn det_j(&self, fp: DVec2) -> f64 {
        let j = self.jacobian(fp);
        j[0][0] * j[1][1] - j[0][1] * j[1][0]
    }

    /// Linear pixel scale at the origin, arcsec per pixel.
    pub fn pixel_scale(&self) -> f64 {
        self.det_j(self.origin).abs().sqrt() * 3600.0
    }

    /// Linear part as a CD matrix in degrees per pixel.
    pub fn linear_cd(&self) -> [[f64; 2]; 2] {
        let terms = Self::terms(self.order);
        let (i10, i01) = (terms.index_of(1, 0), terms.index_of(0, 1));
        let coeff = |c: &[f64], i: Option<usize>| i.and_then(|i| c.get(i)).copied().unwrap_or(0.0);
        [
            [coeff(&self.a, i10) / self.scale, coeff(&self.a, i01) / self.scale],
            [coeff(&self.b, i10) / self.scale, coeff(&self.b, i01) / self.scale],
        ]
    }

    /// Inverse mapping: sky position to focal-plane pixels.
    ///
    /// Starts from the linear inverse plus the fitted inverse correction, then
    /// polishes with Newton steps on the forward model.
    pub fn focal_plane(&self, sky: DVec2) -> Option<DVec2> {
        let target = project(sky, self.crval)?;
        let terms = Self::terms(self.order);
        let mut uv = self.linear_inverse(target)?;
        if !self.ap.is_empty() && !self.bp.is_empty() {
            let inverse = Self::inverse_terms(self.order);
            uv += DVec2::new(inverse.eval(&self.ap, uv), inverse.eval(&self.bp, uv));
        }
        for _ in 0..20 {
            let (x, gx) = terms.eval_with_gradient(&self.a, uv);
            let (y, gy) = terms.eval_with_gradient(&self.b, uv);
            let r = DVec2::new(x, y) - target;
            let det = gx.x * gy.y - gx.y * gy.x;
            if det.abs() < f64::MIN_POSITIVE {
                return None;
            }
            let step = DVec2::new((gy.y * r.x - gx.y * r.y) / det, (-gy.x * r.x + gx.x * r.y) / det);
            uv -= step;
            if step.length() < 1e-14 {
                break;
            }
        }
        let fp = self.origin + uv * self.scale;
        fp.is_finite().then_some(fp)
    }

    /// Normalised position from the constant and linear terms only.
    fn linear_inverse(&self, xi: DVec2) -> Option<DVec2> {
        let terms = Self::terms(self.order);
        let at = |c: &[f64], p: usize, q: usize| terms.index_of(p, q).map_or(0.0, |i| c[i]);
        let rhs = xi - DVec2::new(at(&self.a, 0, 0), at(&self.b, 0, 0));
        let (m00, m01) = (at(&self.a, 1, 0), at(&self.a, 0, 1));
        let (m10, m11) = (at(&self.b, 1, 0), at(&self.b, 0, 1));
        let det = m00 * m11 - m01 * m10;
        if det.abs() < f64::MIN_POSITIVE {
            return None;
        }
        Some(DVec2::new(
            (m11 * rhs.x - m01 * rhs.y) / det,
            (-m10 * rhs.x + m00 * rhs.y) / det,
        ))
    }

    /// Refit the inverse correction on a grid over the normalised domain.
    pub fn fit_inverse(&mut self) {
        let terms = Self::terms(self.order);
        let inverse = Self::inverse_terms(self.order);
        let mut starts = Vec::new();
        let mut corrections = Vec::new();
        for uv in grid(1.0) {
            let xi = DVec2::new(terms.eval(&self.a, uv), terms.eval(&self.b, uv));
            if let Some(lin) = self.linear_inverse(xi) {
                starts.push(lin);
                corrections.push(uv - lin);
            }
        }
        match inverse.fit_xy(&starts, &corrections) {
            Some((ap, bp)) => {
                self.ap = ap;
                self.bp = bp;
            }
            None => {
                self.ap.clear();
                self.bp.clear();
            }
        }
    }

    /// Fold the constant terms into `crval` and re-express the polynomial
    /// about the new tangent point.
    pub fn recenter(&mut self) -> Option<()> {
        let old = self.clone();
        self.crval = old.sky(old.origin);
        let crval = self.crval;
        self.refit(|fp| project(old.sky(fp), crval))?;
        // The origin maps exactly onto the tangent point.
        self.a[0] = 0.0;
        self.b[0] = 0.0;
        self.fit_inverse();
        Some(())
    }

    /// Fit all coefficients to `target(fp)` sampled on a grid.
    fn refit(&mut self, target: impl Fn(DVec2) -> Option<DVec2>) -> Option<()> {
        let terms = Self::terms(self.order);
        let mut uv = Vec::new();
        let mut values = Vec::new();
        for p in grid(1.0) {
            if let Some(t) = target(self.origin + p * self.scale) {
                uv.push(p);
                values.push(t);
            }
        }
        let (a, b) = terms.fit_xy(&uv, &values)?;
        self.a = a;
        self.b = b;
        Some(())
    }
}

/// Regular grid over `[-half, half]²` in normalised coordinates.
fn grid(half: f64) -> impl Iterator<Item = DVec2> {
    let step = 2.0 * half / (GRID_SAMPLES - 1) as f64;
    (0..GRID_SAMPLES).flat_map(move |i| {
        (0..GRID_SAMPLES).map(move |j| DVec2::new(-half + i as f64 * step, -half + j as f64 * step))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wcs::angular_separation;

    fn wcs() -> Wcs {
        Wcs::from_scale_rotation(
            DVec2::new(150.0, -80.0),
            DVec2::new(34.5, -5.2),
            0.17,
            12.0,
            (2048, 4096),
        )
    }

    fn model(order: usize) -> DistortionModel {
        DistortionModel::from_wcs(ExposureId(1), &wcs(), DVec2::ZERO, 10_000.0, order).unwrap()
    }

    #[test]
    fn test_from_wcs_reproduces_sky() {
        let m = model(3);
        let w = wcs();
        for fp in [DVec2::ZERO, DVec2::new(9000.0, -7000.0), DVec2::new(-4000.0, 8000.0)] {
            let sep = angular_separation(m.sky(fp), w.pixel_to_sky(fp)) * 3600.0;
            assert!(sep < 1e-5, "separation {} arcsec at {:?}", sep, fp);
        }
        assert!((m.pixel_scale() - 0.17).abs() < 1e-6);
        assert!(m.a[0].abs() < 1e-10 && m.b[0].abs() < 1e-10);
    }

    #[test]
    fn test_focal_plane_inverts_sky() {
        let mut m = model(3);
        // Add a visible cubic distortion.
        let i30 = DistortionModel::terms(3).index_of(3, 0).unwrap();
        m.a[i30] = 2e-4;
        m.fit_inverse();
        for fp in [DVec2::new(1234.0, -5678.0), DVec2::new(-9000.0, 9000.0)] {
            let back = m.focal_plane(m.sky(fp)).unwrap();
            assert!((back - fp).length() < 1e-6, "{:?} -> {:?}", fp, back);
        }
    }

    #[test]
    fn test_recenter_keeps_mapping() {
        let mut m = model(2);
        m.a[0] = 1e-3;
        m.b[0] = -2e-3;
        let before: Vec<DVec2> = [DVec2::new(100.0, 200.0), DVec2::new(-8000.0, 3000.0)]
            .iter()
            .map(|&fp| m.sky(fp))
            .collect();
        m.recenter().unwrap();
        assert_eq!(m.a[0], 0.0);
        assert_eq!(m.b[0], 0.0);
        for (fp, expected) in [DVec2::new(100.0, 200.0), DVec2::new(-8000.0, 3000.0)]
            .iter()
            .zip(before)
        {
            let sep = angular_separation(m.sky(*fp), expected) * 3600.0;
            assert!(sep < 1e-4, "separation {} arcsec", sep);
        }
    }

    #[test]
    fn test_linear_cd_matches_wcs() {
        // Tangent point at CRPIX: the reprojected WCS stays exactly linear.
        let w = wcs();
        let m = DistortionModel::from_wcs(ExposureId(1), &w, w.crpix, 10_000.0, 2).unwrap();
        let cd = m.linear_cd();
        for r in 0..2 {
            for c in 0..2 {
                let error = (cd[r][c] - w.cd[r][c]).abs() / w.cd[r][c].abs();
                assert!(error < 1e-9, "cd[{}][{}] {:e} vs {:e}", r, c, cd[r][c], w.cd[r][c]);
            }
        }
    }

    #[test]
    fn test_linear_cd_follows_tangent_point() {
        // Away from CRPIX the local plate scale differs by the gnomonic
        // reprojection, a few parts per million here.
        let m = model(2);
        let cd = m.linear_cd();
        let w = wcs();
        let relative = (cd[0][0] - w.cd[0][0]) / w.cd[0][0];
        assert!(relative.abs() > 1e-7 && relative.abs() < 1e-5, "relative {:e}", relative);
        assert!((m.pixel_scale() - 0.17).abs() < 1e-5);
    }
}
