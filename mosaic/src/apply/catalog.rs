//! Correction of a measured source catalog with a fitted solution.

use glam::DVec2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::products::DetectorSolution;
use crate::types::DataKey;

/// One measured source of a detector catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub id: u64,
    pub pixel: DVec2,
    /// (RA, Dec) in degrees.
    pub sky: DVec2,
    pub flux: f64,
    pub flux_err: f64,
    /// Magnitude correction applied by the mosaic solution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mosaic_corr: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCatalog {
    pub key: DataKey,
    pub records: Vec<CatalogRecord>,
}

/// What [`correct_catalog`] did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionRecord {
    pub key: DataKey,
    pub records: usize,
    /// Zeropoint to use with the corrected fluxes.
    pub flux_mag0: f64,
    /// Range of the multiplicative flux factor over the records.
    pub min_factor: f64,
    pub max_factor: f64,
    pub field_added: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectedCatalog {
    pub catalog: SourceCatalog,
    pub record: CorrectionRecord,
}

/// Rescale fluxes by the flux surface and the pixel-area distortion, and
/// recompute sky positions from the fitted WCS.
///
/// Flux and flux error are multiplied by `10^(-0.4 P) · J`, where `P` is the
/// surface at the record's focal-plane position and `J` the pixel area
/// relative to the linear WCS. Exposure and detector scales are not applied;
/// they travel in the zeropoint. With `add_field` the applied factor is
/// stored as a magnitude in `mosaic_corr`.
pub fn correct_catalog(
    mut catalog: SourceCatalog,
    solution: &DetectorSolution,
    add_field: bool,
) -> CorrectedCatalog {
    let factors: Vec<f64> = catalog
        .records
        .par_iter_mut()
        .map(|record| {
            let factor = solution.flux.surface_scale(record.pixel)
                * solution.wcs.relative_pixel_area(record.pixel);
            record.flux *= factor;
            record.flux_err *= factor;
            record.sky = solution.wcs.pixel_to_sky(record.pixel);
            if add_field {
                record.mosaic_corr = Some(-2.5 * factor.log10());
            }
            factor
        })
        .collect();

    let (min_factor, max_factor) = factors
        .iter()
        .filter(|f| f.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &f| {
            (lo.min(f), hi.max(f))
        });
    let record = CorrectionRecord {
        key: catalog.key,
        records: factors.len(),
        flux_mag0: solution.flux.flux_mag0,
        min_factor: if factors.is_empty() { 1.0 } else { min_factor },
        max_factor: if factors.is_empty() { 1.0 } else { max_factor },
        field_added: add_field,
    };
    tracing::debug!(
        key = %record.key,
        records = record.records,
        min_factor = record.min_factor,
        max_factor = record.max_factor,
        "Corrected catalog"
    );
    CorrectedCatalog { catalog, record }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::products::{DetectorFrame, FluxCorrection};
    use crate::fit::FluxFitParams;
    use crate::geometry::Detector;
    use crate::math::poly::PolyBasis;
    use crate::types::{DetectorId, ExposureId};
    use crate::wcs::{Sip, Wcs, angular_separation};

    fn key() -> DataKey {
        DataKey::new(ExposureId(1236), DetectorId(50))
    }

    fn detector() -> Detector {
        Detector::new(DetectorId(50), DVec2::new(-1000.0, 500.0), 0.0, 2048, 4176)
    }

    fn linear_wcs() -> Wcs {
        Wcs::from_scale_rotation(
            DVec2::new(1024.0, 2088.0),
            DVec2::new(150.1, 2.2),
            0.168,
            0.0,
            (2048, 4176),
        )
    }

    fn params(coeffs: Vec<f64>) -> FluxFitParams {
        let mut params = FluxFitParams::new(PolyBasis::Chebyshev, 1, false, DVec2::splat(8000.0));
        params.coeffs = coeffs;
        params
    }

    fn solution(wcs: Wcs, flux: FluxCorrection) -> DetectorSolution {
        DetectorSolution {
            key: key(),
            wcs,
            flux,
        }
    }

    fn catalog(wcs: &Wcs) -> SourceCatalog {
        let records = [(10.0, 20.0), (1024.0, 2088.0), (2000.0, 4000.0)]
            .iter()
            .enumerate()
            .map(|(i, &(x, y))| {
                let pixel = DVec2::new(x, y);
                CatalogRecord {
                    id: i as u64,
                    pixel,
                    sky: wcs.pixel_to_sky(pixel),
                    flux: 1000.0 * (i + 1) as f64,
                    flux_err: 10.0,
                    mosaic_corr: None,
                }
            })
            .collect();
        SourceCatalog { key: key(), records }
    }

    #[test]
    fn test_identity_correction_is_idempotent() {
        let wcs = linear_wcs();
        let frame = DetectorFrame::new(detector());
        let solution = solution(wcs.clone(), FluxCorrection::identity(params(vec![0.0, 0.0]), frame));
        let original = catalog(&wcs);

        let once = correct_catalog(original.clone(), &solution, false);
        let twice = correct_catalog(once.catalog.clone(), &solution, false);
        for (a, b) in original.records.iter().zip(&twice.catalog.records) {
            assert!((a.flux - b.flux).abs() < 1e-9 * a.flux);
            assert!((a.flux_err - b.flux_err).abs() < 1e-9 * a.flux_err);
            assert!(angular_separation(a.sky, b.sky) * 3600.0 < 1e-9);
            assert_eq!(b.mosaic_corr, None);
        }
        assert_eq!(once.record.min_factor, 1.0);
        assert_eq!(once.record.max_factor, 1.0);
        assert_eq!(once.record.flux_mag0, 1.0);
    }

    #[test]
    fn test_surface_and_area_scale_fluxes() {
        let wcs = linear_wcs().with_sip(Sip {
            order: 2,
            a: vec![1e-6, 0.0, 0.0],
            b: vec![0.0, 0.0, 2e-6],
            ap: Vec::new(),
            bp: Vec::new(),
        });
        let frame = DetectorFrame::new(detector());
        let flux = FluxCorrection::new(params(vec![0.02, -0.03]), frame, 0.9, 1.1);
        let solution = solution(wcs.clone(), flux.clone());
        let original = catalog(&linear_wcs());

        let corrected = correct_catalog(original.clone(), &solution, true);
        assert!(corrected.record.field_added);
        assert_eq!(corrected.record.records, 3);
        assert!((corrected.record.flux_mag0 - 1.0 / (0.9 * 1.1)).abs() < 1e-12);
        for (before, after) in original.records.iter().zip(&corrected.catalog.records) {
            let factor = flux.surface_scale(before.pixel) * wcs.relative_pixel_area(before.pixel);
            assert!((after.flux - before.flux * factor).abs() < 1e-9 * before.flux);
            assert!((after.flux_err - before.flux_err * factor).abs() < 1e-9);
            let corr = after.mosaic_corr.unwrap();
            assert!((corr + 2.5 * factor.log10()).abs() < 1e-12);
            let expected_sky = wcs.pixel_to_sky(before.pixel);
            assert!(angular_separation(after.sky, expected_sky) < 1e-12);
        }
        assert!(corrected.record.min_factor <= corrected.record.max_factor);
    }

    #[test]
    fn test_empty_catalog() {
        let wcs = linear_wcs();
        let frame = DetectorFrame::new(detector());
        let solution = solution(wcs, FluxCorrection::identity(params(vec![0.0, 0.0]), frame));
        let empty = SourceCatalog {
            key: key(),
            records: Vec::new(),
        };
        let corrected = correct_catalog(empty, &solution, true);
        assert_eq!(corrected.record.records, 0);
        assert_eq!(corrected.record.min_factor, 1.0);
    }
}
