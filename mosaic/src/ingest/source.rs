//! Input record schemas and point-source selection.
//!
//! Catalogs arrive in one of two schemas: current measurement tables with a
//! continuous extendedness and deblend bookkeeping, and legacy tables that only
//! carry a PSF-star classification. [`ObservationSource`] hides the difference
//! so selection and conversion are written once.

use std::collections::BTreeMap;

use glam::DVec2;
use serde::{Deserialize, Serialize};

/// Quality information used by point-source selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityFlags {
    /// 0 for point-like, 1 for extended; NaN when the schema has no such column.
    pub extendedness: f64,
    /// Classified as a PSF star by upstream processing.
    pub psf_star: bool,
    pub saturated: bool,
    /// Number of deblended children of this record.
    pub deblend_children: u32,
}

impl QualityFlags {
    /// Not extended (or a PSF star) and not a deblend parent.
    /// Saturated records pass only when `include_saturated`.
    pub fn is_point_source(&self, include_saturated: bool) -> bool {
        let stellar = self.psf_star || self.extendedness < 0.5;
        stellar && (include_saturated || !self.saturated) && self.deblend_children == 0
    }
}

/// Uniform view of one measured record.
pub trait ObservationSource {
    fn id(&self) -> u64;
    /// Detector pixel position.
    fn pixel(&self) -> DVec2;
    fn flux(&self) -> f64;
    fn flux_error(&self) -> f64;
    fn quality(&self) -> QualityFlags;
}

/// Record of a measurement table with extendedness and deblend information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasuredRecord {
    pub id: u64,
    pub pixel: DVec2,
    pub flux: f64,
    pub flux_err: f64,
    pub extendedness: f64,
    pub saturated: bool,
    pub deblend_children: u32,
}

impl ObservationSource for MeasuredRecord {
    fn id(&self) -> u64 {
        self.id
    }

    fn pixel(&self) -> DVec2 {
        self.pixel
    }

    fn flux(&self) -> f64 {
        self.flux
    }

    fn flux_error(&self) -> f64 {
        self.flux_err
    }

    fn quality(&self) -> QualityFlags {
        QualityFlags {
            extendedness: self.extendedness,
            psf_star: false,
            saturated: self.saturated,
            deblend_children: self.deblend_children,
        }
    }
}

/// Record of a legacy table classified by a PSF-star flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyRecord {
    pub id: u64,
    pub pixel: DVec2,
    pub flux: f64,
    pub flux_err: f64,
    pub psf_star: bool,
    pub saturated: bool,
}

impl ObservationSource for LegacyRecord {
    fn id(&self) -> u64 {
        self.id
    }

    fn pixel(&self) -> DVec2 {
        self.pixel
    }

    fn flux(&self) -> f64 {
        self.flux
    }

    fn flux_error(&self) -> f64 {
        self.flux_err
    }

    fn quality(&self) -> QualityFlags {
        QualityFlags {
            extendedness: f64::NAN,
            psf_star: self.psf_star,
            saturated: self.saturated,
            deblend_children: 0,
        }
    }
}

/// A record in either schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SourceRecord {
    Measured(MeasuredRecord),
    Legacy(LegacyRecord),
}

impl SourceRecord {
    fn inner(&self) -> &dyn ObservationSource {
        match self {
            SourceRecord::Measured(r) => r,
            SourceRecord::Legacy(r) => r,
        }
    }
}

impl ObservationSource for SourceRecord {
    fn id(&self) -> u64 {
        self.inner().id()
    }

    fn pixel(&self) -> DVec2 {
        self.inner().pixel()
    }

    fn flux(&self) -> f64 {
        self.inner().flux()
    }

    fn flux_error(&self) -> f64 {
        self.inner().flux_error()
    }

    fn quality(&self) -> QualityFlags {
        self.inner().quality()
    }
}

impl From<MeasuredRecord> for SourceRecord {
    fn from(record: MeasuredRecord) -> Self {
        SourceRecord::Measured(record)
    }
}

impl From<LegacyRecord> for SourceRecord {
    fn from(record: LegacyRecord) -> Self {
        SourceRecord::Legacy(record)
    }
}

/// One reference-catalog entry as delivered by the external matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceEntry {
    pub id: u64,
    /// (RA, Dec) in degrees.
    pub sky: DVec2,
    pub flux: f64,
    pub flux_err: f64,
    /// Fluxes in the catalog's native bands, used by color terms.
    #[serde(default)]
    pub band_fluxes: BTreeMap<String, f64>,
}

/// A measured record joined to its reference entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub reference: Option<ReferenceEntry>,
    pub source: SourceRecord,
}

/// Point sources among `records`, saturated ones excluded.
pub fn select_sources(records: &[SourceRecord]) -> Vec<&SourceRecord> {
    records
        .iter()
        .filter(|r| r.quality().is_point_source(false))
        .collect()
}

/// Point-source matches. When fewer than `min_selected` survive, saturated
/// matches are admitted as well so bright-only fields keep their anchors.
pub fn select_matches(records: &[MatchRecord], min_selected: usize) -> Vec<&MatchRecord> {
    let strict: Vec<&MatchRecord> = records
        .iter()
        .filter(|m| m.source.quality().is_point_source(false))
        .collect();
    if strict.len() >= min_selected {
        return strict;
    }
    records
        .iter()
        .filter(|m| m.source.quality().is_point_source(true))
        .collect()
}
