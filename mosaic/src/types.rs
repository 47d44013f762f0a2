//! Identifiers shared by every stage of the calibration run.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one telescope exposure (visit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExposureId(pub u32);

/// Identifier of one physical detector in the focal plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DetectorId(pub u32);

/// Key of the external data layer: one (exposure, detector) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DataKey {
    pub exposure: ExposureId,
    pub detector: DetectorId,
}

impl DataKey {
    pub fn new(exposure: ExposureId, detector: DetectorId) -> Self {
        Self { exposure, detector }
    }
}

impl fmt::Display for ExposureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DetectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(exposure {}, detector {})", self.exposure, self.detector)
    }
}

/// Named products of the external data layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Dataset {
    Filter,
    Wcs,
    Sources,
    Matches,
    OutputWcs,
    FluxCorrection,
}
