//! Synthetic survey generator.
//!
//! Builds a camera of rectangular detectors, a set of dithered exposures with
//! a known cubic distortion, and a star field observed through them. Every
//! (exposure, detector) gets a linear input WCS that ignores the distortion
//! and carries a pointing error, so a fit has something to recover.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use glam::DVec2;
use rand::prelude::*;
use rand::rngs::StdRng;

use crate::fit::DistortionModel;
use crate::geometry::{Detector, DetectorSet};
use crate::ingest::{MatchRecord, MeasuredRecord, ReferenceEntry, SourceRecord};
use crate::math::{MAG_PER_LN_FLUX, mag_to_flux};
use crate::store::InMemoryStore;
use crate::types::{DataKey, DetectorId, ExposureId};
use crate::wcs::{Wcs, deproject};

/// Instrumental zeropoint of the generated fluxes.
pub const ZEROPOINT: f64 = 27.0;

/// Relative flux error of reference entries.
const REFERENCE_FLUX_ERROR: f64 = 0.01;

/// Configuration for survey generation.
#[derive(Debug, Clone)]
pub struct SurveyConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    pub exposures: usize,
    /// Detector columns and rows
    pub detector_grid: (usize, usize),
    /// Detector width and height in pixels
    pub detector_size: (u32, u32),
    /// Gap between neighbouring detectors in pixels
    pub detector_gap: f64,
    /// Arcsec per pixel
    pub pixel_scale: f64,
    /// Field centre (RA, Dec) in degrees
    pub center: DVec2,
    /// Radius of the circular dither pattern in arcsec
    pub dither_arcsec: f64,
    /// Half-width of the square star field in arcsec
    pub star_field_arcsec: f64,
    /// Minimum distance between stars in arcsec
    pub min_separation_arcsec: f64,
    pub reference_stars: usize,
    pub internal_stars: usize,
    /// Gaussian position noise of detections, arcsec per axis
    pub position_noise_arcsec: f64,
    /// Gaussian position noise of the reference catalog, arcsec per axis
    pub reference_noise_arcsec: f64,
    /// Fraction of detections displaced by `outlier_offset_arcsec`
    pub outlier_fraction: f64,
    pub outlier_offset_arcsec: f64,
    /// Radial cubic distortion at the field edge, degrees
    pub cubic_distortion: f64,
    /// Gaussian misplacement of detectors other than the first, pixels per axis
    pub misalignment_px: f64,
    /// Pointing error of the input WCS, arcsec
    pub wcs_error_arcsec: f64,
    /// Magnitude range (brightest, faintest)
    pub mag_range: (f64, f64),
    /// Gaussian magnitude noise of detections
    pub mag_noise: f64,
    pub exposure_mag_sigma: f64,
    pub detector_mag_sigma: f64,
    /// Linear flux surface in magnitudes per 1000 focal-plane pixels
    pub surface_gradient: DVec2,
    pub filter: String,
}

impl Default for SurveyConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            exposures: 4,
            detector_grid: (2, 2),
            detector_size: (1000, 1000),
            detector_gap: 50.0,
            pixel_scale: 0.5,
            center: DVec2::new(150.0, 2.0),
            dither_arcsec: 60.0,
            star_field_arcsec: 600.0,
            min_separation_arcsec: 20.0,
            reference_stars: 120,
            internal_stars: 120,
            position_noise_arcsec: 0.02,
            reference_noise_arcsec: 0.02,
            outlier_fraction: 0.0,
            outlier_offset_arcsec: 2.0,
            cubic_distortion: 1e-4,
            misalignment_px: 1.0,
            wcs_error_arcsec: 0.5,
            mag_range: (17.0, 21.0),
            mag_noise: 0.005,
            exposure_mag_sigma: 0.05,
            detector_mag_sigma: 0.03,
            surface_gradient: DVec2::new(0.02, -0.01),
            filter: "HSC-I".to_string(),
        }
    }
}

impl SurveyConfig {
    /// Two single-detector exposures sharing five reference stars and three
    /// internal stars.
    pub fn two_exposures() -> Self {
        Self {
            exposures: 2,
            detector_grid: (1, 1),
            dither_arcsec: 20.0,
            star_field_arcsec: 150.0,
            min_separation_arcsec: 30.0,
            reference_stars: 5,
            internal_stars: 3,
            cubic_distortion: 2e-5,
            misalignment_px: 0.0,
            ..Default::default()
        }
    }
}

/// Ground truth star.
#[derive(Debug, Clone)]
pub struct TrueStar {
    pub id: u64,
    pub sky: DVec2,
    pub mag: f64,
    /// Listed in the reference catalog
    pub reference: bool,
}

/// Ground truth of a survey.
#[derive(Debug, Clone)]
pub struct SurveyTruth {
    pub models: BTreeMap<ExposureId, DistortionModel>,
    /// Actual detector placement
    pub detectors: DetectorSet,
    pub exposure_mag: BTreeMap<ExposureId, f64>,
    pub detector_mag: BTreeMap<DetectorId, f64>,
    pub surface_gradient: DVec2,
    pub stars: Vec<TrueStar>,
}

impl SurveyTruth {
    /// True sky position of a detector pixel.
    pub fn sky(&self, key: DataKey, pixel: DVec2) -> Option<DVec2> {
        let model = self.models.get(&key.exposure)?;
        let detector = self.detectors.get(key.detector)?;
        Some(model.sky(detector.pixel_to_focal_plane(pixel)))
    }

    pub fn surface(&self, fp: DVec2) -> f64 {
        self.surface_gradient.dot(fp) / 1000.0
    }

    /// Magnitude to add to an instrumental magnitude to get the true one.
    pub fn magnitude_offset(&self, key: DataKey, pixel: DVec2) -> Option<f64> {
        let detector = self.detectors.get(key.detector)?;
        Some(
            self.exposure_mag.get(&key.exposure)?
                + self.detector_mag.get(&key.detector)?
                + self.surface(detector.pixel_to_focal_plane(pixel)),
        )
    }
}

/// A generated survey: inputs in an [`InMemoryStore`] plus the truth.
#[derive(Debug)]
pub struct SyntheticSurvey {
    /// Nominal camera geometry handed to the run
    pub detectors: DetectorSet,
    pub exposures: Vec<ExposureId>,
    pub truth: SurveyTruth,
    pub store: InMemoryStore,
}

fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.random_range(1e-10..1.0);
    let u2: f64 = rng.random_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

fn gaussian2(rng: &mut StdRng) -> DVec2 {
    DVec2::new(gaussian(rng), gaussian(rng))
}

/// Offset on the sky by a tangent-plane displacement in arcsec.
fn offset_sky(sky: DVec2, arcsec: DVec2) -> DVec2 {
    deproject(arcsec / 3600.0, sky)
}

impl SyntheticSurvey {
    pub fn generate(config: &SurveyConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);

        let detectors = camera(config);
        let true_detectors = DetectorSet::from_centered(detectors.iter().enumerate().map(|(i, d)| {
            let mut d = *d;
            if i > 0 {
                d.center += gaussian2(&mut rng) * config.misalignment_px;
            }
            d
        }));
        let scale = {
            let extent = detectors.extent();
            extent.x.max(extent.y).max(1.0)
        };

        let exposures: Vec<ExposureId> =
            (0..config.exposures).map(|e| ExposureId(1000 + e as u32)).collect();
        let models: BTreeMap<ExposureId, DistortionModel> = exposures
            .iter()
            .enumerate()
            .map(|(e, &id)| {
                let angle = 2.0 * PI * e as f64 / config.exposures.max(1) as f64;
                let dither = if config.exposures > 1 {
                    DVec2::new(angle.cos(), angle.sin()) * config.dither_arcsec
                } else {
                    DVec2::ZERO
                };
                (id, true_model(config, id, offset_sky(config.center, dither), scale))
            })
            .collect();

        let exposure_mag = exposures
            .iter()
            .map(|&e| (e, gaussian(&mut rng) * config.exposure_mag_sigma))
            .collect();
        let detector_mag = detectors
            .ids()
            .map(|d| (d, gaussian(&mut rng) * config.detector_mag_sigma))
            .collect();

        let stars = star_field(config, &mut rng);
        let truth = SurveyTruth {
            models,
            detectors: true_detectors,
            exposure_mag,
            detector_mag,
            surface_gradient: config.surface_gradient,
            stars,
        };

        let mut store = InMemoryStore::new();
        for &exposure in &exposures {
            let pointing_error = gaussian2(&mut rng).normalize_or_zero() * config.wcs_error_arcsec;
            for detector in detectors.iter() {
                let key = DataKey::new(exposure, detector.id);
                let model = &truth.models[&exposure];
                let wcs = input_wcs(model, detector, offset_sky(model.crval, pointing_error));
                let (sources, matches) = observe(config, &truth, key, &mut rng);
                store.insert(key, &config.filter, wcs, sources, matches);
            }
        }

        Self {
            detectors,
            exposures,
            truth,
            store,
        }
    }
}

/// Nominal detector grid, centred on the optical axis.
fn camera(config: &SurveyConfig) -> DetectorSet {
    let (nx, ny) = config.detector_grid;
    let (w, h) = config.detector_size;
    let pitch = DVec2::new(w as f64 + config.detector_gap, h as f64 + config.detector_gap);
    DetectorSet::new((0..ny).flat_map(|j| {
        (0..nx).map(move |i| {
            let center = DVec2::new(i as f64, j as f64) * pitch;
            Detector::new(DetectorId((j * nx + i) as u32), center, 0.0, w, h)
        })
    }))
}

/// Linear plate scale plus a radial cubic term.
fn true_model(config: &SurveyConfig, exposure: ExposureId, crval: DVec2, scale: f64) -> DistortionModel {
    let order = 3;
    let terms = DistortionModel::terms(order);
    let mut a = vec![0.0; terms.len()];
    let mut b = vec![0.0; terms.len()];
    let linear = config.pixel_scale / 3600.0 * scale;
    let k = config.cubic_distortion;
    for (coeffs, exponents) in [
        (&mut a, [((1, 0), linear), ((3, 0), k), ((1, 2), k)]),
        (&mut b, [((0, 1), linear), ((2, 1), k), ((0, 3), k)]),
    ] {
        for ((p, q), value) in exponents {
            if let Some(i) = terms.index_of(p, q) {
                coeffs[i] = value;
            }
        }
    }
    let mut model = DistortionModel {
        exposure,
        crval,
        origin: DVec2::ZERO,
        scale,
        order,
        a,
        b,
        ap: Vec::new(),
        bp: Vec::new(),
    };
    model.fit_inverse();
    model
}

/// Linear WCS of one detector from the model's linear terms, pointed at `crval`.
fn input_wcs(model: &DistortionModel, detector: &Detector, crval: DVec2) -> Wcs {
    let cd = model.linear_cd();
    let (sin, cos) = detector.yaw.sin_cos();
    let col0 = DVec2::new(cd[0][0] * cos + cd[0][1] * sin, cd[1][0] * cos + cd[1][1] * sin);
    let col1 = DVec2::new(-cd[0][0] * sin + cd[0][1] * cos, -cd[1][0] * sin + cd[1][1] * cos);
    Wcs::new(
        detector.focal_plane_to_pixel(model.origin),
        crval,
        [[col0.x, col1.x], [col0.y, col1.y]],
        (detector.width, detector.height),
    )
}

/// Reference stars first, then internal stars, all at least
/// `min_separation_arcsec` apart.
fn star_field(config: &SurveyConfig, rng: &mut StdRng) -> Vec<TrueStar> {
    let total = config.reference_stars + config.internal_stars;
    let half = config.star_field_arcsec;
    let min_sep = config.min_separation_arcsec;
    let mut offsets: Vec<DVec2> = Vec::with_capacity(total);
    let mut attempts = 0;
    while offsets.len() < total && attempts < total * 1000 {
        attempts += 1;
        let candidate = DVec2::new(rng.random_range(-half..half), rng.random_range(-half..half));
        if offsets.iter().all(|o| o.distance(candidate) >= min_sep) {
            offsets.push(candidate);
        }
    }

    offsets
        .into_iter()
        .enumerate()
        .map(|(i, offset)| TrueStar {
            id: i as u64 + 1,
            sky: deproject(offset / 3600.0, config.center),
            mag: rng.random_range(config.mag_range.0..config.mag_range.1),
            reference: i < config.reference_stars,
        })
        .collect()
}

/// Source and match records of one key.
fn observe(
    config: &SurveyConfig,
    truth: &SurveyTruth,
    key: DataKey,
    rng: &mut StdRng,
) -> (Vec<SourceRecord>, Vec<MatchRecord>) {
    let mut sources = Vec::new();
    let mut matches = Vec::new();
    let (Some(model), Some(detector)) = (truth.models.get(&key.exposure), truth.detectors.get(key.detector))
    else {
        return (sources, matches);
    };

    for star in &truth.stars {
        let Some(fp) = model.focal_plane(star.sky) else {
            continue;
        };
        let true_pixel = detector.focal_plane_to_pixel(fp);
        let inside = true_pixel.x >= 1.0
            && true_pixel.y >= 1.0
            && true_pixel.x <= detector.width as f64 - 1.0
            && true_pixel.y <= detector.height as f64 - 1.0;
        if !inside {
            continue;
        }

        let mut pixel = true_pixel + gaussian2(rng) * (config.position_noise_arcsec / config.pixel_scale);
        if rng.random_range(0.0..1.0) < config.outlier_fraction {
            let angle = rng.random_range(0.0..2.0 * PI);
            pixel += DVec2::new(angle.cos(), angle.sin()) * (config.outlier_offset_arcsec / config.pixel_scale);
        }

        let offset = truth.magnitude_offset(key, true_pixel).unwrap_or(0.0);
        let mag_inst = star.mag - offset + gaussian(rng) * config.mag_noise;
        let flux = mag_to_flux(mag_inst - ZEROPOINT);
        let record = SourceRecord::Measured(MeasuredRecord {
            id: star.id,
            pixel,
            flux,
            flux_err: flux * config.mag_noise.max(1e-4) / MAG_PER_LN_FLUX,
            extendedness: 0.0,
            saturated: false,
            deblend_children: 0,
        });

        if star.reference {
            let ref_flux = mag_to_flux(star.mag);
            matches.push(MatchRecord {
                reference: Some(ReferenceEntry {
                    id: star.id,
                    sky: offset_sky(star.sky, gaussian2(rng) * config.reference_noise_arcsec),
                    flux: ref_flux,
                    flux_err: ref_flux * REFERENCE_FLUX_ERROR,
                    band_fluxes: BTreeMap::new(),
                }),
                source: record.clone(),
            });
        }
        sources.push(record);
    }
    (sources, matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::DataSource;
    use crate::wcs::angular_separation;

    #[test]
    fn test_generate_is_deterministic() {
        let a = SyntheticSurvey::generate(&SurveyConfig::default());
        let b = SyntheticSurvey::generate(&SurveyConfig::default());
        assert_eq!(a.store.sources, b.store.sources);
        assert_eq!(a.exposures.len(), 4);
        assert_eq!(a.detectors.len(), 4);
        assert_eq!(a.truth.stars.len(), 240);
    }

    #[test]
    fn test_input_wcs_close_to_truth() {
        let config = SurveyConfig::default();
        let survey = SyntheticSurvey::generate(&config);
        for (&key, records) in &survey.store.sources {
            let wcs = survey.store.wcs(key).unwrap();
            for record in records {
                let SourceRecord::Measured(r) = record else {
                    panic!("unexpected schema");
                };
                let truth = survey.truth.sky(key, r.pixel).unwrap();
                let sep = angular_separation(wcs.pixel_to_sky(r.pixel), truth) * 3600.0;
                // Pointing error, cubic distortion and misalignment.
                assert!(sep < 3.0, "input WCS off by {} arcsec on {}", sep, key);
            }
        }
    }

    #[test]
    fn test_every_reference_star_observed() {
        let survey = SyntheticSurvey::generate(&SurveyConfig::two_exposures());
        for &exposure in &survey.exposures {
            let key = DataKey::new(exposure, DetectorId(0));
            assert_eq!(survey.store.matches[&key].len(), 5);
            assert_eq!(survey.store.sources[&key].len(), 8);
        }
    }
}
