//! Observation ingest: per-(exposure, detector) reads into typed catalogs.
//!
//! Every key is read independently (in parallel); a key with a missing dataset
//! is skipped and reported in [`IngestOutput::skipped`]. Only a filter mismatch
//! across inputs, or having nothing usable at all, aborts the run.

pub mod colorterm;
pub mod source;

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;

use crate::config::MosaicConfig;
use crate::error::{Error, Result};
use crate::geometry::DetectorSet;
use crate::observation::{Detection, ExposureCatalog, ReferenceMatch, ReferenceStar};
use crate::types::{DataKey, Dataset, ExposureId};
use crate::wcs::{Wcs, WcsTable};

pub use colorterm::ColorTerm;
pub use source::{
    LegacyRecord, MatchRecord, MeasuredRecord, ObservationSource, QualityFlags, ReferenceEntry,
    SourceRecord, select_matches, select_sources,
};

/// The external key-value data layer.
///
/// Every read returns [`Error::MissingData`] when the dataset does not exist.
pub trait DataSource: Sync {
    /// Name of the photometric filter of the exposure.
    fn filter(&self, key: DataKey) -> Result<String>;
    /// Input WCS in detector pixels.
    fn wcs(&self, key: DataKey) -> Result<Wcs>;
    fn sources(&self, key: DataKey) -> Result<Vec<SourceRecord>>;
    fn matches(&self, key: DataKey) -> Result<Vec<MatchRecord>>;
}

/// A key that was not ingested.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedKey {
    pub key: DataKey,
    pub dataset: Option<Dataset>,
    pub reason: String,
}

impl SkippedKey {
    fn from_error(key: DataKey, err: &Error) -> Self {
        let dataset = match err {
            Error::MissingData { dataset, .. } => Some(*dataset),
            _ => None,
        };
        Self {
            key,
            dataset,
            reason: err.to_string(),
        }
    }
}

/// Counters of records removed during conversion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub sources_read: usize,
    pub sources_selected: usize,
    pub matches_read: usize,
    pub matches_selected: usize,
    /// Records with a non-finite pixel or sky position.
    pub non_finite: usize,
    /// Matches whose reference side was dropped by the color term.
    pub demoted: usize,
}

impl IngestStats {
    fn merge(mut self, other: Self) -> Self {
        self.sources_read += other.sources_read;
        self.sources_selected += other.sources_selected;
        self.matches_read += other.matches_read;
        self.matches_selected += other.matches_selected;
        self.non_finite += other.non_finite;
        self.demoted += other.demoted;
        self
    }
}

/// Result of ingest.
#[derive(Debug, Clone)]
pub struct IngestOutput {
    /// Detectors observed by at least one exposure.
    pub detectors: DetectorSet,
    /// Initial per-exposure WCS in the focal-plane frame.
    pub wcs: WcsTable,
    pub catalogs: Vec<ExposureCatalog>,
    pub skipped: Vec<SkippedKey>,
    pub filter: String,
    pub stats: IngestStats,
}

/// Data read for one key.
struct KeyData {
    key: DataKey,
    wcs: Wcs,
    detections: Vec<Detection>,
    matches: Vec<ReferenceMatch>,
    stats: IngestStats,
}

/// Observation ingest stage.
#[derive(Debug, Clone)]
pub struct Ingest<'a> {
    config: &'a MosaicConfig,
    color_term: Option<&'a ColorTerm>,
}

impl<'a> Ingest<'a> {
    pub fn new(config: &'a MosaicConfig) -> Self {
        Self {
            config,
            color_term: None,
        }
    }

    pub fn with_color_term(mut self, color_term: Option<&'a ColorTerm>) -> Self {
        self.color_term = color_term;
        self
    }

    /// Read every (exposure, detector) pair of `exposures × detectors`.
    pub fn run<S: DataSource + ?Sized>(
        &self,
        source: &S,
        mut detectors: DetectorSet,
        exposures: &[ExposureId],
    ) -> Result<IngestOutput> {
        let keys: Vec<DataKey> = exposures
            .iter()
            .flat_map(|&e| detectors.ids().map(move |d| DataKey::new(e, d)))
            .collect();
        tracing::info!(
            exposures = exposures.len(),
            detectors = detectors.len(),
            keys = keys.len(),
            "Reading catalogs"
        );

        let filter = check_filters(source, &keys)?;

        let results: Vec<std::result::Result<KeyData, SkippedKey>> = keys
            .par_iter()
            .map(|&key| self.read_key(source, key))
            .collect();

        let mut skipped = Vec::new();
        let mut per_exposure: BTreeMap<ExposureId, Vec<KeyData>> = BTreeMap::new();
        for result in results {
            match result {
                Ok(data) => per_exposure.entry(data.key.exposure).or_default().push(data),
                Err(skip) => {
                    tracing::warn!(key = %skip.key, reason = %skip.reason, "Skipping key");
                    skipped.push(skip);
                }
            }
        }

        let mut wcs_table = WcsTable::new();
        let mut catalogs = Vec::new();
        let mut observed = BTreeSet::new();
        let mut stats = IngestStats::default();
        for (exposure, mut keyed) in per_exposure {
            keyed.sort_by_key(|d| d.key.detector);
            let mut catalog = ExposureCatalog::new(exposure);
            let mut exposure_wcs = None;
            for data in keyed {
                stats = stats.merge(data.stats);
                if exposure_wcs.is_none()
                    && let Some(detector) = detectors.get(data.key.detector)
                {
                    exposure_wcs = Some(data.wcs.to_focal_plane(detector));
                }
                if !data.detections.is_empty() || !data.matches.is_empty() {
                    observed.insert(data.key.detector);
                }
                catalog.detections.extend(data.detections);
                catalog.matches.extend(data.matches);
            }

            let Some(exposure_wcs) = exposure_wcs else {
                continue;
            };
            if catalog.is_empty() {
                tracing::warn!(exposure = %exposure, "Dropping exposure without usable detections");
                continue;
            }
            tracing::debug!(
                exposure = %exposure,
                detections = catalog.detections.len(),
                matches = catalog.matches.len(),
                "Exposure ingested"
            );
            wcs_table.insert(exposure, exposure_wcs);
            catalogs.push(catalog);
        }

        if catalogs.is_empty() {
            return Err(Error::NoUsableExposures);
        }

        let removed = detectors.retain_observed(&observed);
        if !removed.is_empty() {
            tracing::info!(removed = ?removed, "Removed detectors without data");
        }

        tracing::info!(
            exposures = catalogs.len(),
            detectors = detectors.len(),
            sources = stats.sources_selected,
            matches = stats.matches_selected,
            non_finite = stats.non_finite,
            demoted = stats.demoted,
            skipped = skipped.len(),
            "Ingest complete"
        );

        Ok(IngestOutput {
            detectors,
            wcs: wcs_table,
            catalogs,
            skipped,
            filter,
            stats,
        })
    }

    fn read_key<S: DataSource + ?Sized>(
        &self,
        source: &S,
        key: DataKey,
    ) -> std::result::Result<KeyData, SkippedKey> {
        let skip = |err: Error| SkippedKey::from_error(key, &err);
        let wcs = source.wcs(key).map_err(skip)?;
        let records = source.sources(key).map_err(skip)?;
        let match_records = source.matches(key).map_err(skip)?;

        let mut stats = IngestStats {
            sources_read: records.len(),
            matches_read: match_records.len(),
            ..Default::default()
        };

        let mut detections = Vec::new();
        for record in select_sources(&records) {
            match to_detection(key, &wcs, record) {
                Some(d) => detections.push(d),
                None => stats.non_finite += 1,
            }
        }
        stats.sources_selected = detections.len();

        let mut known: BTreeSet<u64> = detections.iter().map(|d| d.source_id).collect();
        let mut matches = Vec::new();
        for record in select_matches(&match_records, self.config.min_selected_matches) {
            let Some(detection) = to_detection(key, &wcs, &record.source) else {
                stats.non_finite += 1;
                continue;
            };
            if record.reference.as_ref().is_some_and(|entry| !entry.sky.is_finite()) {
                stats.non_finite += 1;
                continue;
            }
            let reference = record
                .reference
                .as_ref()
                .and_then(|entry| self.reference_star(entry, &mut stats));
            match reference {
                Some(reference) => matches.push(ReferenceMatch {
                    reference: Some(reference),
                    detection,
                }),
                // Without a usable reference the record is a plain detection.
                None => {
                    if known.insert(detection.source_id) {
                        detections.push(detection);
                    }
                }
            }
        }
        stats.matches_selected = matches.len();

        Ok(KeyData {
            key,
            wcs,
            detections,
            matches,
            stats,
        })
    }

    fn reference_star(&self, entry: &ReferenceEntry, stats: &mut IngestStats) -> Option<ReferenceStar> {
        let (flux, flux_err) = match self.color_term {
            Some(term) => match term.apply(entry) {
                Some(corrected) => corrected,
                None => {
                    stats.demoted += 1;
                    return None;
                }
            },
            None => (entry.flux, entry.flux_err),
        };
        Some(ReferenceStar {
            id: entry.id,
            sky: entry.sky,
            flux,
            flux_err,
        })
    }
}

fn to_detection<R: ObservationSource + ?Sized>(key: DataKey, wcs: &Wcs, record: &R) -> Option<Detection> {
    let pixel = record.pixel();
    if !pixel.is_finite() {
        return None;
    }
    let sky = wcs.pixel_to_sky(pixel);
    if !sky.is_finite() {
        return None;
    }
    Some(Detection::new(
        key,
        record.id(),
        pixel,
        sky,
        record.flux(),
        record.flux_error(),
    ))
}

/// The single filter shared by all readable keys.
fn check_filters<S: DataSource + ?Sized>(source: &S, keys: &[DataKey]) -> Result<String> {
    let filters: BTreeSet<String> = keys
        .par_iter()
        .filter_map(|&key| source.filter(key).ok())
        .collect::<Vec<_>>()
        .into_iter()
        .collect();
    match filters.len() {
        0 => Err(Error::NoUsableExposures),
        1 => Ok(filters.into_iter().next().unwrap_or_default()),
        _ => Err(Error::FilterMismatch {
            filters: filters.into_iter().collect(),
        }),
    }
}
