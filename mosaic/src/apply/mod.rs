//! Conversion of the fit result into per-(exposure, detector) products and
//! their delivery to the data layer.
//!
//! Every key is independent: keys are written in parallel and a failed write
//! is logged and reported without stopping the others.

pub mod catalog;
pub mod products;

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::result::MosaicResult;
use crate::types::{DataKey, Dataset};
use crate::wcs::Wcs;

pub use catalog::{CatalogRecord, CorrectedCatalog, CorrectionRecord, SourceCatalog, correct_catalog};
pub use products::{DetectorFrame, DetectorSolution, FluxCorrection};

/// Write side of the external data layer.
pub trait DataSink: Sync {
    fn put_wcs(&self, key: DataKey, wcs: &Wcs) -> Result<()>;
    fn put_flux_correction(&self, key: DataKey, correction: &FluxCorrection) -> Result<()>;
}

/// A key whose products were not (fully) written.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteFailure {
    pub key: DataKey,
    pub dataset: Option<Dataset>,
    pub reason: String,
}

/// Outcome of [`ResultApplier::write_all`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteReport {
    pub written: Vec<DataKey>,
    pub failed: Vec<WriteFailure>,
}

impl WriteReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Turns a [`MosaicResult`] into output products.
#[derive(Debug, Clone, Copy)]
pub struct ResultApplier<'a> {
    result: &'a MosaicResult,
}

impl<'a> ResultApplier<'a> {
    pub fn new(result: &'a MosaicResult) -> Self {
        Self { result }
    }

    /// Every fitted exposure crossed with every detector, in key order.
    pub fn keys(&self) -> Vec<DataKey> {
        self.result
            .exposures()
            .flat_map(|e| self.result.detectors.ids().map(move |d| DataKey::new(e, d)))
            .collect()
    }

    pub fn solution(&self, key: DataKey) -> Result<DetectorSolution> {
        let missing = |dataset| Error::MissingData { key, dataset };
        let model = self.result.models.get(&key.exposure).ok_or(missing(Dataset::Wcs))?;
        let detector = self.result.detectors.get(key.detector).ok_or(missing(Dataset::Wcs))?;
        DetectorSolution::new(
            key,
            model,
            detector,
            &self.result.flux,
            self.result.fexp(key.exposure),
            self.result.fchip(key.detector),
        )
        .ok_or(Error::NumericInvalid {
            what: "detector WCS",
        })
    }

    /// Solutions of every key that can be built.
    pub fn solutions(&self) -> Vec<DetectorSolution> {
        self.keys()
            .into_par_iter()
            .filter_map(|key| self.solution(key).ok())
            .collect()
    }

    /// Build and write the products of every key.
    pub fn write_all<S: DataSink + ?Sized>(&self, sink: &S) -> WriteReport {
        let keys = self.keys();
        tracing::info!(keys = keys.len(), "Writing results");

        let outcomes: Vec<std::result::Result<DataKey, WriteFailure>> = keys
            .par_iter()
            .map(|&key| self.write_key(sink, key))
            .collect();

        let mut report = WriteReport::default();
        for outcome in outcomes {
            match outcome {
                Ok(key) => report.written.push(key),
                Err(failure) => {
                    tracing::warn!(key = %failure.key, reason = %failure.reason, "Write failed");
                    report.failed.push(failure);
                }
            }
        }
        tracing::info!(
            written = report.written.len(),
            failed = report.failed.len(),
            "Results written"
        );
        report
    }

    fn write_key<S: DataSink + ?Sized>(
        &self,
        sink: &S,
        key: DataKey,
    ) -> std::result::Result<DataKey, WriteFailure> {
        let fail = |dataset: Option<Dataset>, err: Error| WriteFailure {
            key,
            dataset,
            reason: err.to_string(),
        };
        let solution = self.solution(key).map_err(|e| fail(None, e))?;
        sink.put_wcs(key, &solution.wcs)
            .map_err(|e| fail(Some(Dataset::OutputWcs), e))?;
        sink.put_flux_correction(key, &solution.flux)
            .map_err(|e| fail(Some(Dataset::FluxCorrection), e))?;
        Ok(key)
    }

    /// Correct a catalog with the solution of its key.
    pub fn correct_catalog(&self, catalog: SourceCatalog, add_field: bool) -> Result<CorrectedCatalog> {
        let solution = self.solution(catalog.key)?;
        Ok(correct_catalog(catalog, &solution, add_field))
    }
}
