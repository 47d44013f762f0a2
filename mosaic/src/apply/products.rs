//! Output products of one (exposure, detector): a SIP WCS in detector pixels
//! and a flux-correction record.
//!
//! The distortion model is a polynomial in focal-plane pixels, and detector
//! pixels map onto the focal plane by a rotation and a shift. Substituting
//! that affine map into the model gives a polynomial in detector pixels of
//! the same order, so the forward SIP terms are exact. Only the inverse
//! (AP/BP) terms are fitted.

use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::fit::{DistortionModel, FluxFitParams};
use crate::geometry::Detector;
use crate::math::poly::PolyTerms;
use crate::types::DataKey;
use crate::wcs::{Sip, Wcs};

/// Samples per axis of the pixel grid used for the inverse SIP fit.
const INVERSE_GRID: usize = 16;

// =============================================================================
// DetectorFrame
// =============================================================================

/// Fitted placement of one detector in one exposure's focal plane.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectorFrame {
    /// Detector geometry with the fitted alignment applied.
    pub detector: Detector,
}

impl DetectorFrame {
    pub fn new(detector: Detector) -> Self {
        Self { detector }
    }

    #[inline]
    pub fn focal_plane(&self, pixel: DVec2) -> DVec2 {
        self.detector.pixel_to_focal_plane(pixel)
    }
}

// =============================================================================
// FluxCorrection
// =============================================================================

/// Photometric calibration of one (exposure, detector).
///
/// Calibrated magnitude is `m_inst + magnitude_correction(pixel)`; the flux
/// zeropoint carries the exposure and detector scales, the surface carries
/// the position dependence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FluxCorrection {
    pub params: FluxFitParams,
    pub frame: DetectorFrame,
    pub fexp: f64,
    pub fchip: f64,
    /// Flux of a zero-magnitude source, `1 / (fexp · fchip)`.
    pub flux_mag0: f64,
}

impl FluxCorrection {
    pub fn new(params: FluxFitParams, frame: DetectorFrame, fexp: f64, fchip: f64) -> Self {
        Self {
            params,
            frame,
            fexp,
            fchip,
            flux_mag0: 1.0 / (fexp * fchip),
        }
    }

    /// Correction that leaves every flux unchanged.
    pub fn identity(params: FluxFitParams, frame: DetectorFrame) -> Self {
        let params = FluxFitParams {
            coeffs: vec![0.0; params.coeffs.len()],
            ..params
        };
        Self::new(params, frame, 1.0, 1.0)
    }

    /// Position-dependent part, magnitudes.
    pub fn surface(&self, pixel: DVec2) -> f64 {
        self.params.eval(self.frame.focal_plane(pixel))
    }

    /// Full magnitude correction: exposure and detector offsets plus surface.
    pub fn magnitude_correction(&self, pixel: DVec2) -> f64 {
        -2.5 * self.fexp.log10() - 2.5 * self.fchip.log10() + self.surface(pixel)
    }

    /// Multiplicative flux factor of the surface alone.
    pub fn surface_scale(&self, pixel: DVec2) -> f64 {
        10f64.powf(-0.4 * self.surface(pixel))
    }

    pub fn is_identity(&self) -> bool {
        self.params.is_identity() && self.fexp == 1.0 && self.fchip == 1.0
    }
}

// =============================================================================
// DetectorSolution
// =============================================================================

/// Everything written for one (exposure, detector).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorSolution {
    pub key: DataKey,
    pub wcs: Wcs,
    pub flux: FluxCorrection,
}

impl DetectorSolution {
    /// `None` when the model's linear part is singular on this detector.
    pub fn new(
        key: DataKey,
        model: &DistortionModel,
        detector: &Detector,
        params: &FluxFitParams,
        fexp: f64,
        fchip: f64,
    ) -> Option<Self> {
        let wcs = detector_wcs(model, detector)?;
        let flux = FluxCorrection::new(params.clone(), DetectorFrame::new(*detector), fexp, fchip);
        Some(Self { key, wcs, flux })
    }
}

/// Dense polynomial in two variables, coefficient of `x^i y^j` at `i·(n+1)+j`.
#[derive(Debug, Clone)]
struct Dense {
    order: usize,
    c: Vec<f64>,
}

impl Dense {
    fn zeros(order: usize) -> Self {
        Self {
            order,
            c: vec![0.0; (order + 1) * (order + 1)],
        }
    }

    fn constant(order: usize, value: f64) -> Self {
        let mut p = Self::zeros(order);
        p.c[0] = value;
        p
    }

    /// `c0 + cx·x + cy·y`.
    fn linear(order: usize, c0: f64, cx: f64, cy: f64) -> Self {
        let mut p = Self::constant(order, c0);
        if order >= 1 {
            p.c[order + 1] = cx;
            p.c[1] = cy;
        }
        p
    }

    #[inline]
    fn get(&self, i: usize, j: usize) -> f64 {
        self.c[i * (self.order + 1) + j]
    }

    /// Product truncated to total degree `order`.
    fn mul(&self, other: &Self) -> Self {
        let n = self.order;
        let mut out = Self::zeros(n);
        for i in 0..=n {
            for j in 0..=n - i {
                let a = self.get(i, j);
                if a == 0.0 {
                    continue;
                }
                for k in 0..=n - i - j {
                    for l in 0..=n - i - j - k {
                        out.c[(i + k) * (n + 1) + j + l] += a * other.get(k, l);
                    }
                }
            }
        }
        out
    }

    fn add_scaled(&mut self, other: &Self, scale: f64) {
        for (a, b) in self.c.iter_mut().zip(&other.c) {
            *a += scale * b;
        }
    }

    fn powers(&self) -> Vec<Self> {
        let mut powers = vec![Self::constant(self.order, 1.0)];
        for k in 1..=self.order {
            let next = powers[k - 1].mul(self);
            powers.push(next);
        }
        powers
    }
}

/// Substitute `u = lu(x, y)`, `v = lv(x, y)` into `Σ coeffs_i u^p v^q`.
fn compose(terms: &PolyTerms, coeffs: &[f64], lu: &Dense, lv: &Dense) -> Dense {
    let u_powers = lu.powers();
    let v_powers = lv.powers();
    let mut out = Dense::zeros(lu.order);
    for (&(p, q), &c) in terms.exponents().iter().zip(coeffs) {
        if c != 0.0 {
            out.add_scaled(&u_powers[p].mul(&v_powers[q]), c);
        }
    }
    out
}

/// SIP WCS of `detector` under `model`, reference pixel at the model origin.
fn detector_wcs(model: &DistortionModel, detector: &Detector) -> Option<Wcs> {
    let order = model.order;
    let crpix = detector.focal_plane_to_pixel(model.origin);

    // Normalised focal-plane coordinates are linear in (x, y) = pixel - crpix.
    let (sin, cos) = detector.yaw.sin_cos();
    let s = model.scale;
    let lu = Dense::linear(order, 0.0, cos / s, -sin / s);
    let lv = Dense::linear(order, 0.0, sin / s, cos / s);
    let terms = DistortionModel::terms(order);
    let xi = compose(&terms, &model.a, &lu, &lv);
    let eta = compose(&terms, &model.b, &lu, &lv);

    let cd = [[xi.get(1, 0), xi.get(0, 1)], [eta.get(1, 0), eta.get(0, 1)]];
    let det = cd[0][0] * cd[1][1] - cd[0][1] * cd[1][0];
    if !det.is_finite() || det.abs() < f64::MIN_POSITIVE {
        return None;
    }
    let naxis = (detector.width, detector.height);
    let wcs = Wcs::new(crpix, model.crval, cd, naxis);
    if order < 2 {
        return Some(wcs);
    }

    let inv = [[cd[1][1] / det, -cd[0][1] / det], [-cd[1][0] / det, cd[0][0] / det]];
    let forward = Sip::forward_terms(order);
    let mut a = Vec::with_capacity(forward.len());
    let mut b = Vec::with_capacity(forward.len());
    for &(p, q) in forward.exponents() {
        let (x, y) = (xi.get(p, q), eta.get(p, q));
        a.push(inv[0][0] * x + inv[0][1] * y);
        b.push(inv[1][0] * x + inv[1][1] * y);
    }
    let mut sip = Sip {
        order,
        a,
        b,
        ap: Vec::new(),
        bp: Vec::new(),
    };
    if let Some((ap, bp)) = fit_inverse(&sip, detector, crpix) {
        sip.ap = ap;
        sip.bp = bp;
    }
    Some(wcs.with_sip(sip))
}

/// Inverse SIP terms fitted on a pixel grid over the detector.
fn fit_inverse(sip: &Sip, detector: &Detector, crpix: DVec2) -> Option<(Vec<f64>, Vec<f64>)> {
    let forward = Sip::forward_terms(sip.order);
    let inverse = Sip::inverse_terms(sip.order);
    let size = DVec2::new(detector.width as f64, detector.height as f64);
    let step = size / (INVERSE_GRID - 1) as f64;

    let mut distorted = Vec::with_capacity(INVERSE_GRID * INVERSE_GRID);
    let mut offsets = Vec::with_capacity(INVERSE_GRID * INVERSE_GRID);
    for i in 0..INVERSE_GRID {
        for j in 0..INVERSE_GRID {
            let uv = DVec2::new(i as f64, j as f64) * step - crpix;
            let f = DVec2::new(forward.eval(&sip.a, uv), forward.eval(&sip.b, uv));
            distorted.push(uv + f);
            offsets.push(-f);
        }
    }

    // Fit in coordinates scaled to unit size, then undo the scaling.
    let scale = distorted
        .iter()
        .fold(0.0f64, |m, p| m.max(p.x.abs()).max(p.y.abs()))
        .max(1.0);
    let scaled: Vec<DVec2> = distorted.iter().map(|p| *p / scale).collect();
    let targets: Vec<DVec2> = offsets.iter().map(|p| *p / scale).collect();
    let (mut ap, mut bp) = inverse.fit_xy(&scaled, &targets)?;
    for (k, &(p, q)) in inverse.exponents().iter().enumerate() {
        let factor = scale.powi(1 - (p + q) as i32);
        ap[k] *= factor;
        bp[k] *= factor;
    }
    Some((ap, bp))
}
