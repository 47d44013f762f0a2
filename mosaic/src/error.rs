//! Error types for the calibration run.

use thiserror::Error;

use crate::types::{DataKey, Dataset};

/// Errors produced by ingest, cross-matching, fitting and result writing.
///
/// `MissingData`, `NumericInvalid` and `Write` are recovered locally by the
/// stage that raises them; the remaining variants abort the run.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Missing {dataset} for {key}")]
    MissingData { key: DataKey, dataset: Dataset },

    #[error("Found {} filters in input ({}), expected exactly one", .filters.len(), .filters.join(", "))]
    FilterMismatch { filters: Vec<String> },

    #[error("No exposure has usable detections")]
    NoUsableExposures,

    #[error("Degenerate fit: {reason} ({groups} groups, {detections} detections)")]
    DegenerateFit {
        reason: String,
        groups: usize,
        detections: usize,
    },

    #[error("Fit did not converge after {iterations} iterations (last shift {shift_arcsec:.3e} arcsec)")]
    NotConverged { iterations: usize, shift_arcsec: f64 },

    #[error("Non-finite {what}")]
    NumericInvalid { what: &'static str },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to write {dataset} for {key}: {message}")]
    Write {
        key: DataKey,
        dataset: Dataset,
        message: String,
    },

    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
