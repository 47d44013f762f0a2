//! Tests for the global fit on synthetic surveys.

use super::*;
use crate::apply::ResultApplier;
use crate::crossmatch::{CrossMatchEngine, CrossMatchResult};
use crate::ingest::{Ingest, IngestOutput};
use crate::math::statistics::mean_std;
use crate::observation::Detection;
use crate::testing::init_tracing;
use crate::testing::synthetic::{SurveyConfig, SyntheticSurvey};
use crate::types::DetectorId;
use glam::DVec2;

fn matched(survey: &SyntheticSurvey, config: &MosaicConfig) -> (IngestOutput, CrossMatchResult) {
    let ingest = Ingest::new(config)
        .run(&survey.store, survey.detectors.clone(), &survey.exposures)
        .unwrap();
    let crossmatch = CrossMatchEngine::new(config).run(&ingest.catalogs);
    (ingest, crossmatch)
}

fn fit(survey: &SyntheticSurvey, config: &MosaicConfig) -> Result<MosaicResult> {
    let (ingest, crossmatch) = matched(survey, config);
    GlobalFitEngine::new(config).run(
        crossmatch.matches,
        Some(crossmatch.sources),
        &ingest.detectors,
        &ingest.wcs,
    )
}

fn round_trip_config() -> MosaicConfig {
    MosaicConfig {
        fitting_order: 3,
        flux_fit_order: 1,
        ..Default::default()
    }
}

/// Largest sky error of a good detection under the fitted solution, arcsec.
fn worst_astrometric_error(survey: &SyntheticSurvey, result: &MosaicResult) -> f64 {
    let applier = ResultApplier::new(result);
    result
        .groups()
        .flat_map(|g| &g.detections)
        .filter(|d| d.good)
        .map(|d| {
            let solution = applier.solution(d.key()).unwrap();
            let truth = survey.truth.sky(d.key(), d.pixel).unwrap();
            angular_separation(solution.wcs.pixel_to_sky(d.pixel), truth) * ARCSEC_PER_DEG
        })
        .fold(0.0, f64::max)
}

/// Fitted minus true magnitude offset of every flux-good detection.
fn photometric_offset_errors(survey: &SyntheticSurvey, result: &MosaicResult) -> Vec<f64> {
    result
        .groups()
        .flat_map(|g| &g.detections)
        .filter(|d| d.flux_good)
        .map(|d| {
            let fp = result.detectors.get(d.detector).unwrap().pixel_to_focal_plane(d.pixel);
            let fitted = -2.5 * result.fexp(d.exposure).log10() - 2.5 * result.fchip(d.detector).log10()
                + result.flux.eval(fp);
            fitted - survey.truth.magnitude_offset(d.key(), d.pixel).unwrap()
        })
        .collect()
}

#[test]
fn test_round_trip_recovers_astrometry() {
    init_tracing();
    let survey = SyntheticSurvey::generate(&SurveyConfig::default());
    let config = round_trip_config();
    let result = fit(&survey, &config).unwrap();
    assert!(result.summary.converged);
    assert!(result.summary.frozen_exposures.is_empty());

    let applier = ResultApplier::new(&result);
    let tolerance = config.cat_rms * ARCSEC_PER_DEG;
    let mut checked = 0;
    for detection in result.groups().flat_map(|g| &g.detections).filter(|d| d.good) {
        let solution = applier.solution(detection.key()).unwrap();
        let truth = survey.truth.sky(detection.key(), detection.pixel).unwrap();
        let sep = angular_separation(solution.wcs.pixel_to_sky(detection.pixel), truth) * ARCSEC_PER_DEG;
        assert!(
            sep < tolerance,
            "{} off by {} arcsec at {:?}",
            detection.key(),
            sep,
            detection.pixel
        );
        checked += 1;
    }
    assert!(checked > 500, "only {} detections checked", checked);
    assert!(result.summary.astrometric_rms_arcsec < 0.05);
}

#[test]
fn test_round_trip_recovers_photometry() {
    init_tracing();
    // A linear surface is indistinguishable from star magnitudes and
    // exposure offsets under translated dithers, so relative fits see none.
    let survey = SyntheticSurvey::generate(&SurveyConfig {
        surface_gradient: DVec2::ZERO,
        ..Default::default()
    });
    let result = fit(&survey, &round_trip_config()).unwrap();
    assert!(result.summary.converged);
    assert!(result.flux.is_identity());

    // Fitted and true offsets may differ by one global constant.
    let diffs = photometric_offset_errors(&survey, &result);
    let (_, std) = mean_std(&diffs);
    assert!(diffs.len() > 500);
    assert!(std < 0.003, "photometric offsets scatter {} mag", std);
    assert!(result.summary.photometric_rms_mag < 0.01);
}

#[test]
fn test_relative_fit_absorbs_linear_surface() {
    init_tracing();
    let survey = SyntheticSurvey::generate(&SurveyConfig::default());
    let result = fit(&survey, &MosaicConfig::default()).unwrap();
    assert!(result.summary.converged);

    // Degree-1 terms stay at zero; higher terms stay near their prior.
    let terms = result.flux.terms();
    for (&(p, q), &c) in terms.exponents().iter().zip(&result.flux.coeffs) {
        if p + q == 1 {
            assert_eq!(c, 0.0, "linear term ({}, {})", p, q);
        } else {
            assert!(c.abs() < 0.02, "term ({}, {}) = {}", p, q, c);
        }
    }
    assert!(result.summary.photometric_rms_mag < 0.01);
}

#[test]
fn test_absolute_fit_recovers_surface() {
    init_tracing();
    let survey = SyntheticSurvey::generate(&SurveyConfig::default());
    let config = MosaicConfig {
        flux_fit_absolute: true,
        ..round_trip_config()
    };
    let result = fit(&survey, &config).unwrap();
    assert!(result.summary.converged);
    assert!(result.flux.absolute);

    let diffs = photometric_offset_errors(&survey, &result);
    let (_, std) = mean_std(&diffs);
    assert!(std < 0.003, "photometric offsets scatter {} mag", std);

    let origin = result.flux.eval(DVec2::ZERO);
    for fp in [DVec2::new(1000.0, 0.0), DVec2::new(0.0, 1000.0), DVec2::new(-800.0, 600.0)] {
        let fitted = result.flux.eval(fp) - origin;
        let truth = survey.truth.surface(fp);
        assert!((fitted - truth).abs() < 0.002, "surface at {:?}: {} vs {}", fp, fitted, truth);
    }
    assert!(worst_astrometric_error(&survey, &result) < config.cat_rms * ARCSEC_PER_DEG);
}

#[test]
fn test_round_trip_without_detector_solve() {
    init_tracing();
    // Fixed detectors cannot absorb a misplacement; give the camera none.
    let survey = SyntheticSurvey::generate(&SurveyConfig {
        misalignment_px: 0.0,
        ..Default::default()
    });
    let config = MosaicConfig {
        solve_ccd: false,
        ..Default::default()
    };
    let result = fit(&survey, &config).unwrap();
    assert!(result.summary.converged);
    assert!(result.alignments.values().all(|a| a.is_identity()));
    assert!(worst_astrometric_error(&survey, &result) < config.cat_rms * ARCSEC_PER_DEG);
    assert!(result.summary.photometric_rms_mag < 0.01);
}

#[test]
fn test_round_trip_without_rotation() {
    init_tracing();
    let survey = SyntheticSurvey::generate(&SurveyConfig {
        misalignment_px: 3.0,
        ..Default::default()
    });
    let config = MosaicConfig {
        allow_rotation: false,
        ..round_trip_config()
    };
    let result = fit(&survey, &config).unwrap();
    assert!(result.summary.converged);
    assert!(result.alignments.values().all(|a| a.rotation == 0.0));
    for detector in survey.truth.detectors.iter() {
        let fitted = result.detectors.get(detector.id).unwrap();
        let error = (fitted.center - detector.center).length();
        assert!(error < 0.2, "detector {} off by {} px", detector.id, error);
    }
    assert!(worst_astrometric_error(&survey, &result) < config.cat_rms * ARCSEC_PER_DEG);
}

#[test]
fn test_two_exposure_scenario() {
    init_tracing();
    let survey = SyntheticSurvey::generate(&SurveyConfig::two_exposures());
    let config = MosaicConfig {
        fitting_order: 2,
        clip_iterations: 2,
        ..Default::default()
    };
    let (ingest, crossmatch) = matched(&survey, &config);

    assert_eq!(crossmatch.matches.len(), 5);
    for group in &crossmatch.matches {
        assert!(group.is_anchored());
        assert_eq!(group.detections.len(), 2);
    }
    assert!(crossmatch.sources.len() <= 3);
    assert!(crossmatch.sources.iter().all(|g| g.detections.len() <= 2));

    let result = GlobalFitEngine::new(&config)
        .run(
            crossmatch.matches,
            Some(crossmatch.sources),
            &ingest.detectors,
            &ingest.wcs,
        )
        .unwrap();
    assert!(result.summary.converged);
    assert_eq!(result.models.len(), 2);

    let bound = config.match_radius_arcsec / 2.1;
    let good: Vec<&Detection> = result
        .groups()
        .flat_map(|g| &g.detections)
        .filter(|d| d.good)
        .collect();
    assert!(!good.is_empty());
    for detection in good {
        assert!(
            detection.residual.length() < bound,
            "residual {:?} arcsec",
            detection.residual
        );
    }
}

#[test]
fn test_too_few_groups_is_degenerate() {
    let survey = SyntheticSurvey::generate(&SurveyConfig::two_exposures());
    let config = MosaicConfig::default();
    let (ingest, mut crossmatch) = matched(&survey, &config);
    crossmatch.matches.truncate(2);

    let err = GlobalFitEngine::new(&config)
        .run(crossmatch.matches, None, &ingest.detectors, &ingest.wcs)
        .unwrap_err();
    match err {
        Error::DegenerateFit { groups, .. } => assert_eq!(groups, 2),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_no_reference_group_is_degenerate() {
    let survey = SyntheticSurvey::generate(&SurveyConfig::two_exposures());
    let config = MosaicConfig::default();
    let (ingest, crossmatch) = matched(&survey, &config);
    assert_eq!(crossmatch.sources.len(), 3);

    let err = GlobalFitEngine::new(&config)
        .run(Vec::new(), Some(crossmatch.sources), &ingest.detectors, &ingest.wcs)
        .unwrap_err();
    assert!(
        matches!(&err, Error::DegenerateFit { reason, .. } if reason.contains("reference")),
        "unexpected {:?}",
        err
    );
}

#[test]
fn test_iteration_cap() {
    let survey = SyntheticSurvey::generate(&SurveyConfig::two_exposures());
    let strict = MosaicConfig {
        max_iterations: 1,
        ..Default::default()
    };
    assert!(matches!(
        fit(&survey, &strict),
        Err(Error::NotConverged { iterations: 1, .. })
    ));

    let lenient = MosaicConfig {
        allow_best_effort: true,
        ..strict
    };
    let result = fit(&survey, &lenient).unwrap();
    assert!(!result.summary.converged);
    assert!(result.summary.best_effort);
    assert_eq!(result.summary.iterations, 1);
}

#[test]
fn test_reference_only_fit_leaves_sources_untouched() {
    init_tracing();
    let survey = SyntheticSurvey::generate(&SurveyConfig::default());
    let (ingest, crossmatch) = matched(&survey, &round_trip_config());
    let sources = crossmatch.sources.clone();
    assert!(!sources.is_empty());

    let config = MosaicConfig {
        internal_fitting: false,
        ..round_trip_config()
    };
    let result = GlobalFitEngine::new(&config)
        .run(crossmatch.matches, Some(sources.clone()), &ingest.detectors, &ingest.wcs)
        .unwrap();
    assert!(result.summary.converged);
    assert_eq!(result.sources, sources);
    for group in &result.matches {
        let reference = group.reference.as_ref().unwrap();
        if let Some(position) = group.position {
            assert_eq!(position, reference.sky);
        }
    }
    assert!(result.summary.astrometric_rms_arcsec < 0.1);
}

#[test]
fn test_outliers_are_clipped() {
    init_tracing();
    let survey = SyntheticSurvey::generate(&SurveyConfig {
        outlier_fraction: 0.05,
        ..Default::default()
    });
    let result = fit(&survey, &round_trip_config()).unwrap();
    assert!(result.summary.converged);
    assert!(result.summary.clipped > 0);

    // Displaced detections sit 2 arcsec off; none of them stays good.
    for detection in result.groups().flat_map(|g| &g.detections).filter(|d| d.good) {
        assert!(detection.residual.length() < 1.0, "residual {:?}", detection.residual);
    }

    // One solver pass per clipping iteration, and the final flags are the
    // ones the last pass left.
    let passes = &result.summary.clip_passes;
    let config = round_trip_config();
    assert_eq!(passes.len(), config.clip_iterations.min(result.summary.iterations));
    assert!(passes.iter().enumerate().all(|(i, p)| p.iteration == i + 1));
    assert!(passes[0].rejected > 0 && passes[0].changed > 0);
    let last = passes.last().unwrap();
    assert_eq!(last.rejected, result.summary.clipped);

    let history = &result.summary.photometric_clip_history;
    assert_eq!(history.len(), config.clip_iterations + 1);
    for pair in history.windows(2) {
        assert!(pair[1] <= pair[0], "clipped std increased: {:?}", history);
    }
}

#[test]
fn test_sparse_exposure_is_frozen() {
    init_tracing();
    let survey = SyntheticSurvey::generate(&SurveyConfig::default());
    let config = round_trip_config();
    let (ingest, mut crossmatch) = matched(&survey, &config);

    // Keep only two detections of the first exposure.
    let sparse = survey.exposures[0];
    let mut kept = 0;
    for group in crossmatch.matches.iter_mut().chain(crossmatch.sources.iter_mut()) {
        group.detections.retain(|d| {
            if d.exposure != sparse {
                return true;
            }
            kept += 1;
            kept <= 2
        });
    }

    let result = GlobalFitEngine::new(&config)
        .run(
            crossmatch.matches,
            Some(crossmatch.sources),
            &ingest.detectors,
            &ingest.wcs,
        )
        .unwrap();
    assert!(result.summary.frozen_exposures.contains(&sparse));
    assert!(result.models.contains_key(&sparse));
}

#[test]
fn test_detector_alignment_recovered() {
    init_tracing();
    let survey = SyntheticSurvey::generate(&SurveyConfig {
        misalignment_px: 3.0,
        ..Default::default()
    });
    let result = fit(&survey, &round_trip_config()).unwrap();

    for detector in survey.truth.detectors.iter() {
        let fitted = result.detectors.get(detector.id).unwrap();
        let error = (fitted.center - detector.center).length();
        assert!(error < 0.2, "detector {} off by {} px", detector.id, error);
    }
}

#[test]
fn test_gauge_moves_past_detector_without_good_detections() {
    init_tracing();
    let survey = SyntheticSurvey::generate(&SurveyConfig {
        misalignment_px: 0.0,
        ..Default::default()
    });
    let config = round_trip_config();
    let (ingest, mut crossmatch) = matched(&survey, &config);
    for detection in crossmatch
        .matches
        .iter_mut()
        .chain(crossmatch.sources.iter_mut())
        .flat_map(|g| g.detections.iter_mut())
        .filter(|d| d.detector == DetectorId(0))
    {
        detection.good = false;
    }

    let result = GlobalFitEngine::new(&config)
        .run(
            crossmatch.matches,
            Some(crossmatch.sources),
            &ingest.detectors,
            &ingest.wcs,
        )
        .unwrap();
    assert!(result.summary.converged);
    // Clipping restores the detections of detector 0, which never moves.
    assert!(result.alignments[&DetectorId(0)].is_identity());
    let restored = result
        .groups()
        .flat_map(|g| &g.detections)
        .filter(|d| d.detector == DetectorId(0) && d.good)
        .count();
    assert!(restored > 0);
    assert!(worst_astrometric_error(&survey, &result) < config.cat_rms * ARCSEC_PER_DEG);
}
