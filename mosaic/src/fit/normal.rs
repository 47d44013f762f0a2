//! Weighted normal equations with star unknowns eliminated per block.
//!
//! Every linearised residual is `r = r0 + Σ e_p δg_p - δs` where `δg` are the
//! global parameters (exposure, detector, surface terms) and `δs` is one
//! scalar star unknown shared by the rows of a [`StarBlock`]. The star
//! normal matrix is a scalar per block, so eliminating it is a rank-one
//! update of the global system (Schur complement).

use hashbrown::HashMap;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

/// One weighted residual row.
#[derive(Debug, Clone, Default)]
pub(super) struct Row {
    /// Sparse derivatives with respect to global parameters.
    pub entries: Vec<(usize, f64)>,
    pub weight: f64,
    pub residual: f64,
}

/// Rows sharing one scalar star unknown.
#[derive(Debug, Clone, Default)]
pub(super) struct StarBlock {
    pub rows: Vec<Row>,
    /// Prior pulling the star towards a catalog value; `residual` is star
    /// minus catalog.
    pub prior: Option<(f64, f64)>,
    /// Fixed stars add their rows to the global system directly.
    pub fixed: bool,
}

impl StarBlock {
    fn hss(&self) -> f64 {
        self.rows.iter().map(|r| r.weight).sum::<f64>() + self.prior.map_or(0.0, |(w, _)| w)
    }

    fn bs(&self) -> f64 {
        self.rows.iter().map(|r| r.weight * r.residual).sum::<f64>()
            - self.prior.map_or(0.0, |(w, r)| w * r)
    }

    /// Coupling column `H_gs`, merged over rows.
    fn hgs(&self) -> Vec<(usize, f64)> {
        let mut merged: HashMap<usize, f64> = HashMap::new();
        for row in &self.rows {
            for &(p, e) in &row.entries {
                *merged.entry(p).or_insert(0.0) -= row.weight * e;
            }
        }
        let mut hgs: Vec<(usize, f64)> = merged.into_iter().collect();
        hgs.sort_unstable_by_key(|&(p, _)| p);
        hgs
    }

    /// Whether the block constrains its star at all.
    pub fn is_solvable(&self) -> bool {
        !self.fixed && self.hss() > 0.0
    }

    /// Back-substituted star step for the global step `delta`.
    pub fn star_step(&self, delta: &DVector<f64>) -> f64 {
        if !self.is_solvable() {
            return 0.0;
        }
        let coupled: f64 = self.hgs().iter().map(|&(p, h)| h * delta[p]).sum();
        (self.bs() - coupled) / self.hss()
    }
}

#[derive(Debug, Clone)]
pub(super) struct NormalEquations {
    pub h: DMatrix<f64>,
    pub g: DVector<f64>,
}

impl NormalEquations {
    pub fn zeros(n: usize) -> Self {
        Self {
            h: DMatrix::zeros(n, n),
            g: DVector::zeros(n),
        }
    }

    pub fn dim(&self) -> usize {
        self.g.len()
    }

    fn add_row(&mut self, row: &Row) {
        for &(p, ep) in &row.entries {
            self.g[p] -= row.weight * ep * row.residual;
            for &(q, eq) in &row.entries {
                self.h[(p, q)] += row.weight * ep * eq;
            }
        }
    }

    pub fn add_block(&mut self, block: &StarBlock) {
        for row in &block.rows {
            self.add_row(row);
        }
        if !block.is_solvable() {
            return;
        }
        let hss = block.hss();
        let bs = block.bs();
        let hgs = block.hgs();
        for &(p, hp) in &hgs {
            self.g[p] -= hp * bs / hss;
            for &(q, hq) in &hgs {
                self.h[(p, q)] -= hp * hq / hss;
            }
        }
    }

    /// Prior `weight · (current + δ_p)²` pulling parameter `p` towards zero.
    pub fn add_prior(&mut self, p: usize, weight: f64, current: f64) {
        self.h[(p, p)] += weight;
        self.g[p] -= weight * current;
    }

    pub fn merge(mut self, other: Self) -> Self {
        self.h += other.h;
        self.g += other.g;
        self
    }

    /// Parallel assembly over all blocks.
    pub fn assemble(n: usize, blocks: &[StarBlock]) -> Self {
        blocks
            .par_iter()
            .fold(
                || Self::zeros(n),
                |mut acc, block| {
                    acc.add_block(block);
                    acc
                },
            )
            .reduce(|| Self::zeros(n), Self::merge)
    }

    /// Cholesky solve; `None` when the reduced system is not positive definite.
    pub fn solve(self) -> Option<DVector<f64>> {
        if self.dim() == 0 {
            return Some(DVector::zeros(0));
        }
        let delta = self.h.cholesky()?.solve(&self.g);
        delta.iter().all(|v| v.is_finite()).then_some(delta)
    }
}
