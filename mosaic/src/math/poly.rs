//! Two-dimensional polynomial bases.
//!
//! A [`PolyTerms`] describes the set of terms `B_p(u) B_q(v)` with
//! `min_degree <= p + q <= order`, where `B_k` is either the monomial `x^k` or
//! the Chebyshev polynomial `T_k(x)`. Coordinates are expected to be
//! normalised to roughly `[-1, 1]` by the caller.
//!
//! Term order: by total degree ascending, then by `p` descending, so order 2
//! with `min_degree = 0` is `1, u, v, u², uv, v²`.

use glam::DVec2;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Highest supported degree in either variable.
pub const MAX_DEGREE: usize = 10;

/// One-dimensional polynomial family.
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
pub enum PolyBasis {
    /// Plain monomials `x^k`.
    Ordinary,
    /// Chebyshev polynomials of the first kind `T_k(x)`.
    #[default]
    Chebyshev,
}

/// Number of terms with total degree in `0..=order`.
#[inline]
pub fn full_term_count(order: usize) -> usize {
    (order + 1) * (order + 2) / 2
}

/// Values and first derivatives of `B_0(x) ..= B_n(x)`.
fn basis_1d(basis: PolyBasis, x: f64, n: usize) -> ([f64; MAX_DEGREE + 1], [f64; MAX_DEGREE + 1]) {
    let mut val = [0.0; MAX_DEGREE + 1];
    let mut der = [0.0; MAX_DEGREE + 1];
    val[0] = 1.0;
    if n == 0 {
        return (val, der);
    }
    val[1] = x;
    der[1] = 1.0;
    match basis {
        PolyBasis::Ordinary => {
            for k in 2..=n {
                val[k] = val[k - 1] * x;
                der[k] = k as f64 * val[k - 1];
            }
        }
        PolyBasis::Chebyshev => {
            // T_{k+1} = 2x T_k - T_{k-1}, T'_{k+1} = 2 T_k + 2x T'_k - T'_{k-1}
            for k in 2..=n {
                val[k] = 2.0 * x * val[k - 1] - val[k - 2];
                der[k] = 2.0 * val[k - 1] + 2.0 * x * der[k - 1] - der[k - 2];
            }
        }
    }
    (val, der)
}

/// Term set of a 2-D polynomial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolyTerms {
    basis: PolyBasis,
    order: usize,
    exponents: Vec<(usize, usize)>,
}

impl PolyTerms {
    /// Terms with `min_degree <= p + q <= order`.
    ///
    /// Panics if `order` exceeds [`MAX_DEGREE`]; configuration validation
    /// rejects such orders before any fit is built.
    pub fn new(basis: PolyBasis, min_degree: usize, order: usize) -> Self {
        assert!(
            order <= MAX_DEGREE,
            "Polynomial order must be <= {}, got {}",
            MAX_DEGREE,
            order
        );
        let mut exponents = Vec::with_capacity(full_term_count(order));
        for total in min_degree..=order {
            for p in (0..=total).rev() {
                exponents.push((p, total - p));
            }
        }
        Self {
            basis,
            order,
            exponents,
        }
    }

    pub fn basis(&self) -> PolyBasis {
        self.basis
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn exponents(&self) -> &[(usize, usize)] {
        &self.exponents
    }

    pub fn len(&self) -> usize {
        self.exponents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exponents.is_empty()
    }

    /// Index of the term `(p, q)`, if present.
    pub fn index_of(&self, p: usize, q: usize) -> Option<usize> {
        self.exponents.iter().position(|&e| e == (p, q))
    }

    /// Evaluate every term at `(u, v)` into `out` (cleared first).
    pub fn values_into(&self, uv: DVec2, out: &mut Vec<f64>) {
        let (bu, _) = basis_1d(self.basis, uv.x, self.order);
        let (bv, _) = basis_1d(self.basis, uv.y, self.order);
        out.clear();
        out.extend(self.exponents.iter().map(|&(p, q)| bu[p] * bv[q]));
    }

    /// Evaluate every term and its partial derivatives at `(u, v)`.
    pub fn values_and_gradients_into(
        &self,
        uv: DVec2,
        values: &mut Vec<f64>,
        d_du: &mut Vec<f64>,
        d_dv: &mut Vec<f64>,
    ) {
        let (bu, du) = basis_1d(self.basis, uv.x, self.order);
        let (bv, dv) = basis_1d(self.basis, uv.y, self.order);
        values.clear();
        d_du.clear();
        d_dv.clear();
        for &(p, q) in &self.exponents {
            values.push(bu[p] * bv[q]);
            d_du.push(du[p] * bv[q]);
            d_dv.push(bu[p] * dv[q]);
        }
    }

    /// `Σ c_i B_i(u, v)`.
    pub fn eval(&self, coeffs: &[f64], uv: DVec2) -> f64 {
        debug_assert_eq!(coeffs.len(), self.len());
        let (bu, _) = basis_1d(self.basis, uv.x, self.order);
        let (bv, _) = basis_1d(self.basis, uv.y, self.order);
        self.exponents
            .iter()
            .zip(coeffs)
            .map(|(&(p, q), c)| c * bu[p] * bv[q])
            .sum()
    }

    /// Value and gradient `(∂/∂u, ∂/∂v)` of `Σ c_i B_i(u, v)`.
    pub fn eval_with_gradient(&self, coeffs: &[f64], uv: DVec2) -> (f64, DVec2) {
        debug_assert_eq!(coeffs.len(), self.len());
        let (bu, du) = basis_1d(self.basis, uv.x, self.order);
        let (bv, dv) = basis_1d(self.basis, uv.y, self.order);
        let mut value = 0.0;
        let mut grad = DVec2::ZERO;
        for (&(p, q), c) in self.exponents.iter().zip(coeffs) {
            value += c * bu[p] * bv[q];
            grad.x += c * du[p] * bv[q];
            grad.y += c * bu[p] * dv[q];
        }
        (value, grad)
    }

    /// Least-squares fit of two target components sharing the same design.
    ///
    /// Returns `None` when there are fewer points than terms or the normal
    /// matrix is singular.
    pub fn fit_xy(&self, uv: &[DVec2], targets: &[DVec2]) -> Option<(Vec<f64>, Vec<f64>)> {
        debug_assert_eq!(uv.len(), targets.len());
        let n = self.len();
        if uv.len() < n || n == 0 {
            return None;
        }

        let mut ata = DMatrix::<f64>::zeros(n, n);
        let mut atb_x = DVector::<f64>::zeros(n);
        let mut atb_y = DVector::<f64>::zeros(n);
        let mut basis = Vec::with_capacity(n);
        for (&p, &t) in uv.iter().zip(targets) {
            self.values_into(p, &mut basis);
            for j in 0..n {
                for k in j..n {
                    ata[(j, k)] += basis[j] * basis[k];
                }
                atb_x[j] += basis[j] * t.x;
                atb_y[j] += basis[j] * t.y;
            }
        }
        for j in 0..n {
            for k in 0..j {
                ata[(j, k)] = ata[(k, j)];
            }
        }

        let x = solve_normal(&ata, &atb_x)?;
        let y = solve_normal(&ata, &atb_y)?;
        Some((x.iter().copied().collect(), y.iter().copied().collect()))
    }
}

/// Solve a symmetric system with Cholesky, falling back to LU.
pub fn solve_normal(a: &DMatrix<f64>, b: &DVector<f64>) -> Option<DVector<f64>> {
    let solution = match a.clone().cholesky() {
        Some(chol) => chol.solve(b),
        None => a.clone().lu().solve(b)?,
    };
    solution.iter().all(|v| v.is_finite()).then_some(solution)
}
