//! Focal-plane geometry of the camera.
//!
//! Every detector is a rectangle of pixels placed in a common focal-plane frame
//! (in pixel units) by its centre offset and yaw. The set is centred on the mean
//! detector position when built, so focal-plane coordinates are small around
//! the optical axis.

use std::collections::{BTreeMap, BTreeSet};

use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::types::DetectorId;

/// Rotate `p` by `angle` radians counter-clockwise.
#[inline]
pub(crate) fn rotate(p: DVec2, angle: f64) -> DVec2 {
    let (s, c) = angle.sin_cos();
    DVec2::new(c * p.x - s * p.y, s * p.x + c * p.y)
}

/// One physical detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detector {
    pub id: DetectorId,
    /// Focal-plane position of the detector centre, in pixels.
    pub center: DVec2,
    /// Rotation of the detector axes relative to the focal-plane axes, radians.
    pub yaw: f64,
    pub width: u32,
    pub height: u32,
}

impl Detector {
    pub fn new(id: DetectorId, center: DVec2, yaw: f64, width: u32, height: u32) -> Self {
        Self {
            id,
            center,
            yaw,
            width,
            height,
        }
    }

    /// Pixel position of the detector centre.
    #[inline]
    pub fn half_size(&self) -> DVec2 {
        DVec2::new(self.width as f64 / 2.0, self.height as f64 / 2.0)
    }

    #[inline]
    pub fn pixel_to_focal_plane(&self, pixel: DVec2) -> DVec2 {
        self.center + rotate(pixel - self.half_size(), self.yaw)
    }

    #[inline]
    pub fn focal_plane_to_pixel(&self, fp: DVec2) -> DVec2 {
        rotate(fp - self.center, -self.yaw) + self.half_size()
    }

    /// Pixel corners: (0,0), (w,0), (w,h), (0,h).
    pub fn pixel_corners(&self) -> [DVec2; 4] {
        let w = self.width as f64;
        let h = self.height as f64;
        [
            DVec2::new(0.0, 0.0),
            DVec2::new(w, 0.0),
            DVec2::new(w, h),
            DVec2::new(0.0, h),
        ]
    }

    pub fn contains_pixel(&self, pixel: DVec2) -> bool {
        pixel.x >= 0.0
            && pixel.y >= 0.0
            && pixel.x <= self.width as f64
            && pixel.y <= self.height as f64
    }
}

/// Fitted correction of one detector's placement.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DetectorAlignment {
    /// Shift of the detector centre in focal-plane pixels.
    pub offset: DVec2,
    /// Additional yaw in radians.
    pub rotation: f64,
}

impl DetectorAlignment {
    pub fn is_identity(&self) -> bool {
        self.offset == DVec2::ZERO && self.rotation == 0.0
    }
}

/// Read-only table of detectors, keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectorSet {
    detectors: BTreeMap<DetectorId, Detector>,
}

impl DetectorSet {
    /// Build a set from raw camera geometry, subtracting the mean detector centre.
    pub fn new(detectors: impl IntoIterator<Item = Detector>) -> Self {
        let mut detectors: BTreeMap<DetectorId, Detector> =
            detectors.into_iter().map(|d| (d.id, d)).collect();
        if !detectors.is_empty() {
            let mean = detectors.values().map(|d| d.center).sum::<DVec2>()
                / detectors.len() as f64;
            for detector in detectors.values_mut() {
                detector.center -= mean;
            }
        }
        Self { detectors }
    }

    /// Build a set whose centres are already expressed in the final frame.
    pub fn from_centered(detectors: impl IntoIterator<Item = Detector>) -> Self {
        Self {
            detectors: detectors.into_iter().map(|d| (d.id, d)).collect(),
        }
    }

    pub fn get(&self, id: DetectorId) -> Option<&Detector> {
        self.detectors.get(&id)
    }

    pub fn contains(&self, id: DetectorId) -> bool {
        self.detectors.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    /// Detectors in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &Detector> {
        self.detectors.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = DetectorId> + '_ {
        self.detectors.keys().copied()
    }

    /// Drop detectors that no exposure observed. Returns the removed ids.
    pub fn retain_observed(&mut self, observed: &BTreeSet<DetectorId>) -> Vec<DetectorId> {
        let removed: Vec<DetectorId> = self
            .detectors
            .keys()
            .filter(|id| !observed.contains(id))
            .copied()
            .collect();
        for id in &removed {
            self.detectors.remove(id);
        }
        removed
    }

    /// Largest absolute focal-plane x and y over all detector corners.
    pub fn extent(&self) -> DVec2 {
        self.detectors
            .values()
            .flat_map(|d| d.pixel_corners().map(|c| d.pixel_to_focal_plane(c).abs()))
            .fold(DVec2::ZERO, DVec2::max)
    }

    /// Copy of the set with fitted alignments applied. Missing entries are identity.
    pub fn aligned(&self, alignments: &BTreeMap<DetectorId, DetectorAlignment>) -> Self {
        let detectors = self
            .detectors
            .iter()
            .map(|(&id, d)| {
                let alignment = alignments.get(&id).copied().unwrap_or_default();
                let mut d = *d;
                d.center += alignment.offset;
                d.yaw += alignment.rotation;
                (id, d)
            })
            .collect();
        Self { detectors }
    }
}
