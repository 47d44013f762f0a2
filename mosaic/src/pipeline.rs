//! End-to-end run: ingest, cross-match, global fit, result writing.

use crate::apply::{DataSink, ResultApplier, WriteReport};
use crate::config::MosaicConfig;
use crate::crossmatch::{CrossMatchEngine, CrossMatchStats};
use crate::error::Result;
use crate::fit::GlobalFitEngine;
use crate::geometry::DetectorSet;
use crate::ingest::{ColorTerm, DataSource, Ingest, IngestStats, SkippedKey};
use crate::result::MosaicResult;
use crate::types::ExposureId;

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct MosaicRun {
    pub result: MosaicResult,
    pub filter: String,
    /// Keys not ingested.
    pub skipped: Vec<SkippedKey>,
    /// Exposures that ended up in no observation group.
    pub dropped_exposures: Vec<ExposureId>,
    pub ingest: IngestStats,
    pub crossmatch: CrossMatchStats,
    pub writes: WriteReport,
}

/// Calibrate `exposures` observed with `detectors` and write the products.
///
/// Missing inputs and failed writes are reported in the returned
/// [`MosaicRun`]; a filter mismatch, a degenerate fit or a non-converged fit
/// (unless best-effort results are allowed) fail the run.
pub fn run_mosaic<S, W>(
    source: &S,
    sink: &W,
    detectors: DetectorSet,
    exposures: &[ExposureId],
    config: &MosaicConfig,
    color_term: Option<&ColorTerm>,
) -> Result<MosaicRun>
where
    S: DataSource + ?Sized,
    W: DataSink + ?Sized,
{
    config.validate()?;

    let ingest = Ingest::new(config)
        .with_color_term(color_term)
        .run(source, detectors, exposures)?;

    let crossmatch = CrossMatchEngine::new(config).run(&ingest.catalogs);

    let sources = config.internal_fitting.then_some(crossmatch.sources);
    let result = GlobalFitEngine::new(config).run(
        crossmatch.matches,
        sources,
        &ingest.detectors,
        &ingest.wcs,
    )?;

    let writes = ResultApplier::new(&result).write_all(sink);

    Ok(MosaicRun {
        result,
        filter: ingest.filter,
        skipped: ingest.skipped,
        dropped_exposures: crossmatch.dropped_exposures,
        ingest: ingest.stats,
        crossmatch: crossmatch.stats,
        writes,
    })
}
