//! Mosaic - joint astrometric and photometric self-calibration.
//!
//! Many overlapping exposures of a multi-detector camera are calibrated
//! together: detections of the same star in different exposures are grouped,
//! then one global fit solves a distortion polynomial per exposure, the
//! placement of every detector in the focal plane, and photometric scale
//! factors plus a focal-plane flux surface.
//!
//! - Ingest reads per-(exposure, detector) catalogs into typed detections
//! - Cross-matching links detections into observation groups
//! - The global fit solves all unknowns with outlier rejection
//! - The result applier writes a WCS and a flux correction per key
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use mosaic::{InMemoryStore, MosaicConfig, run_mosaic};
//!
//! let config = MosaicConfig::from_yaml("fitting_order: 3\n")?;
//! let run = run_mosaic(&store, &store, detectors, &exposures, &config, None)?;
//!
//! println!("RMS {:.3} arcsec", run.result.summary.astrometric_rms_arcsec);
//! ```

pub mod apply;
pub mod config;
pub mod crossmatch;
pub mod error;
pub mod fit;
pub mod geometry;
pub mod ingest;
pub mod logging;
pub mod math;
pub mod observation;
pub mod pipeline;
pub mod result;
pub mod store;
pub mod types;
pub mod wcs;

#[cfg(test)]
pub mod testing;

// ============================================================================
// Configuration and errors
// ============================================================================

pub use config::{DuplicateResolution, MosaicConfig, ReferenceTieBreak};
pub use error::{Error, Result};
pub use math::poly::PolyBasis;

// ============================================================================
// Data model
// ============================================================================

pub use geometry::{Detector, DetectorAlignment, DetectorSet};
pub use observation::{Detection, ExposureCatalog, ObservationGroup, ReferenceMatch, ReferenceStar};
pub use types::{DataKey, Dataset, DetectorId, ExposureId};
pub use wcs::{Sip, Wcs, WcsTable};

// ============================================================================
// Stages
// ============================================================================

pub use apply::{
    CatalogRecord, CorrectedCatalog, CorrectionRecord, DataSink, DetectorSolution, FluxCorrection,
    ResultApplier, SourceCatalog, WriteReport, correct_catalog,
};
pub use crossmatch::{CrossMatchEngine, CrossMatchResult};
pub use fit::{DistortionModel, FluxFitParams, GlobalFitEngine};
pub use ingest::{ColorTerm, DataSource, Ingest, IngestOutput, SkippedKey};
pub use result::{ClipPass, FitSummary, MosaicResult};

// ============================================================================
// Running
// ============================================================================

pub use logging::setup_logging;
pub use pipeline::{MosaicRun, run_mosaic};
pub use store::InMemoryStore;
