//! Shared focal-plane flux-correction surface.

use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::math::poly::{PolyBasis, PolyTerms};

/// Magnitude offset polynomial over the normalised focal plane.
///
/// `P(u, v) = Σ c_i B_p(x/u_max) B_q(y/v_max)` with `1 <= p+q <= order`. The
/// constant term is carried by the per-exposure and per-detector offsets.
/// Relative fits keep the degree-1 coefficients at zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FluxFitParams {
    pub order: usize,
    pub absolute: bool,
    pub basis: PolyBasis,
    pub u_max: f64,
    pub v_max: f64,
    pub coeffs: Vec<f64>,
}

/// Round a focal-plane extent up to the next multiple of 10 pixels.
pub fn round_extent(x: f64) -> f64 {
    ((x.abs() / 10.0).floor() + 1.0) * 10.0
}

impl FluxFitParams {
    /// Zero surface over a focal plane whose detections reach `extent`.
    pub fn new(basis: PolyBasis, order: usize, absolute: bool, extent: DVec2) -> Self {
        let terms = PolyTerms::new(basis, 1, order);
        Self {
            order,
            absolute,
            basis,
            u_max: round_extent(extent.x),
            v_max: round_extent(extent.y),
            coeffs: vec![0.0; terms.len()],
        }
    }

    pub fn terms(&self) -> PolyTerms {
        PolyTerms::new(self.basis, 1, self.order)
    }

    #[inline]
    pub fn normalized(&self, fp: DVec2) -> DVec2 {
        DVec2::new(fp.x / self.u_max, fp.y / self.v_max)
    }

    /// Magnitude correction at focal-plane position `fp`.
    pub fn eval(&self, fp: DVec2) -> f64 {
        if self.coeffs.is_empty() {
            return 0.0;
        }
        self.terms().eval(&self.coeffs, self.normalized(fp))
    }

    pub fn is_identity(&self) -> bool {
        self.coeffs.iter().all(|&c| c == 0.0)
    }
}
