//! Benchmark module for cross-matching.
//! Run with: cargo bench -p mosaic --features bench --bench crossmatch

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput};
use glam::DVec2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::CrossMatchEngine;
use crate::config::MosaicConfig;
use crate::observation::{Detection, ExposureCatalog, ReferenceMatch, ReferenceStar};
use crate::types::{DataKey, DetectorId, ExposureId};
use crate::wcs::deproject;

const EXPOSURES: usize = 8;
const DETECTORS: u32 = 16;
const CENTER: DVec2 = DVec2::new(150.0, 2.0);

/// Register cross-match benchmarks with Criterion.
pub fn benchmarks(c: &mut Criterion) {
    benchmark_crossmatch(c);
}

/// `stars` stars seen by every exposure with 0.1 arcsec scatter; every tenth
/// star carries a reference match.
fn generate_catalogs(stars: usize, seed: u64) -> Vec<ExposureCatalog> {
    let mut rng = StdRng::seed_from_u64(seed);
    let half = 0.5;
    let positions: Vec<DVec2> = (0..stars)
        .map(|_| DVec2::new(rng.random_range(-half..half), rng.random_range(-half..half)))
        .collect();

    (0..EXPOSURES)
        .map(|e| {
            let exposure = ExposureId(e as u32);
            let mut catalog = ExposureCatalog::new(exposure);
            for (i, &offset) in positions.iter().enumerate() {
                let jitter = DVec2::new(rng.random_range(-1.0..1.0), rng.random_range(-1.0..1.0)) * 0.1 / 3600.0;
                let sky = deproject(offset + jitter, CENTER);
                let detector = DetectorId(i as u32 % DETECTORS);
                let key = DataKey::new(exposure, detector);
                let detection = Detection::new(
                    key,
                    i as u64,
                    DVec2::new(100.0, 100.0),
                    sky,
                    rng.random_range(100.0..10000.0),
                    10.0,
                );
                if i % 10 == 0 {
                    catalog.matches.push(ReferenceMatch {
                        reference: Some(ReferenceStar {
                            id: i as u64,
                            sky: deproject(offset, CENTER),
                            flux: 1.0,
                            flux_err: 0.01,
                        }),
                        detection,
                    });
                } else {
                    catalog.detections.push(detection);
                }
            }
            catalog
        })
        .collect()
}

fn benchmark_crossmatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("crossmatch");
    group.sample_size(20);
    let config = MosaicConfig {
        n_brightest: 100_000,
        ..Default::default()
    };

    for stars in [1_000, 10_000, 50_000] {
        let catalogs = generate_catalogs(stars, 42);
        group.throughput(Throughput::Elements((stars * EXPOSURES) as u64));

        group.bench_function(BenchmarkId::new("run", stars), |b| {
            let engine = CrossMatchEngine::new(&config);
            b.iter(|| black_box(engine.run(black_box(&catalogs))))
        });
    }

    group.finish();
}
