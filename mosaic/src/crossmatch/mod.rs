//! Cross-matching of detections into observation groups.
//!
//! All positions are projected onto one tangent plane centred on the mean
//! input direction. Points closer than the match radius are linked and the
//! links closed transitively with a union-find, so a star seen in many
//! exposures ends up in one group even when its extreme measurements are
//! farther apart than the radius.
//!
//! 1. Reference matches from every exposure are linked by their reference
//!    positions. Each component becomes a group headed by one reference star.
//! 2. Detections not consumed by step 1, capped to the brightest
//!    `n_brightest` per (exposure, detector), are linked by their measured
//!    positions into internal groups.
//!
//! Within a group each (exposure, detector) contributes at most one detection.
//! Groups carrying no calibration information (reference without detections,
//! single internal detection) are discarded.

pub mod spatial;
pub mod union_find;

#[cfg(feature = "bench")]
pub mod bench;

use std::collections::BTreeSet;

use glam::DVec2;
use hashbrown::{HashMap, HashSet};
use rayon::prelude::*;

use crate::config::{DuplicateResolution, MosaicConfig, ReferenceTieBreak};
use crate::observation::{Detection, ExposureCatalog, ObservationGroup, ReferenceStar, mean_sky};
use crate::types::{DataKey, ExposureId};
use crate::wcs::project;

pub use spatial::KdTree;
pub use union_find::UnionFind;

/// Counters reported by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrossMatchStats {
    /// Reference matches entering step 1.
    pub reference_nodes: usize,
    /// Detections entering step 2, after the brightness cap.
    pub source_nodes: usize,
    /// Detections removed by the brightness cap.
    pub capped: usize,
    /// Reference groups that chained more than one catalog entry.
    pub ambiguous_references: usize,
    /// Detections dropped because their (exposure, detector) was already present.
    pub duplicates_removed: usize,
    /// Components discarded for being too small.
    pub rejected_groups: usize,
    /// Inputs that could not be projected onto the common tangent plane.
    pub unprojectable: usize,
}

/// Output of the engine.
#[derive(Debug, Clone, Default)]
pub struct CrossMatchResult {
    /// Groups headed by a reference star.
    pub matches: Vec<ObservationGroup>,
    /// Groups of internal re-detections only.
    pub sources: Vec<ObservationGroup>,
    /// Exposures that contribute no detection to any group.
    pub dropped_exposures: Vec<ExposureId>,
    pub stats: CrossMatchStats,
}

/// A point entering one linking step.
struct Node<'a> {
    detection: &'a Detection,
    reference: Option<&'a ReferenceStar>,
    /// Tangent-plane position used for linking.
    link: DVec2,
    /// Tangent-plane position of the detection itself.
    measured: DVec2,
}

/// Groups detections of all exposures into unique-object groups.
#[derive(Debug, Clone)]
pub struct CrossMatchEngine<'a> {
    config: &'a MosaicConfig,
}

impl<'a> CrossMatchEngine<'a> {
    pub fn new(config: &'a MosaicConfig) -> Self {
        Self { config }
    }

    pub fn run(&self, catalogs: &[ExposureCatalog]) -> CrossMatchResult {
        let mut stats = CrossMatchStats::default();
        let Some(center) = tangent_center(catalogs) else {
            return CrossMatchResult::default();
        };
        let radius = self.config.match_radius_deg();

        // Step 1: reference matches, linked by reference position.
        let mut ref_nodes = Vec::new();
        for catalog in catalogs {
            for m in &catalog.matches {
                let Some(reference) = &m.reference else {
                    continue;
                };
                match (project(reference.sky, center), project(m.detection.sky, center)) {
                    (Some(link), Some(measured)) => ref_nodes.push(Node {
                        detection: &m.detection,
                        reference: Some(reference),
                        link,
                        measured,
                    }),
                    _ => stats.unprojectable += 1,
                }
            }
        }
        stats.reference_nodes = ref_nodes.len();
        tracing::info!(nodes = ref_nodes.len(), "Linking reference matches");

        let mut consumed: HashSet<(DataKey, u64)> = HashSet::new();
        let mut matches = Vec::new();
        for component in link_within(&ref_nodes, radius).components() {
            for &i in &component {
                consumed.insert((ref_nodes[i].detection.key(), ref_nodes[i].detection.source_id));
            }
            match self.reference_group(&ref_nodes, &component, &mut stats) {
                Some(group) => matches.push(group),
                None => stats.rejected_groups += 1,
            }
        }

        // Step 2: remaining detections, linked by measured position.
        let mut sources = Vec::new();
        if self.config.internal_fitting {
            let source_nodes = self.source_nodes(catalogs, center, &consumed, &mut stats);
            stats.source_nodes = source_nodes.len();
            tracing::info!(nodes = source_nodes.len(), capped = stats.capped, "Linking internal detections");

            for component in link_within(&source_nodes, radius).components() {
                match self.internal_group(&source_nodes, &component, &mut stats) {
                    Some(group) => sources.push(group),
                    None => stats.rejected_groups += 1,
                }
            }
        }

        let contributing: BTreeSet<ExposureId> = matches
            .iter()
            .chain(&sources)
            .flat_map(|g| g.detections.iter().map(|d| d.exposure))
            .collect();
        let dropped_exposures: Vec<ExposureId> = catalogs
            .iter()
            .map(|c| c.exposure)
            .filter(|e| !contributing.contains(e))
            .collect();
        for exposure in &dropped_exposures {
            tracing::warn!(exposure = %exposure, "Exposure contributes no matched detections");
        }

        tracing::info!(
            match_groups = matches.len(),
            match_detections = count_detections(&matches),
            source_groups = sources.len(),
            source_detections = count_detections(&sources),
            ambiguous = stats.ambiguous_references,
            duplicates = stats.duplicates_removed,
            "Cross-match complete"
        );

        CrossMatchResult {
            matches,
            sources,
            dropped_exposures,
            stats,
        }
    }

    fn reference_group(
        &self,
        nodes: &[Node<'_>],
        component: &[usize],
        stats: &mut CrossMatchStats,
    ) -> Option<ObservationGroup> {
        // Distinct reference stars in first-seen order.
        let mut candidates: Vec<usize> = Vec::new();
        for &i in component {
            let id = nodes[i].reference.map(|r| r.id);
            if !candidates.iter().any(|&c| nodes[c].reference.map(|r| r.id) == id) {
                candidates.push(i);
            }
        }
        if candidates.len() > 1 {
            stats.ambiguous_references += 1;
        }

        let head = match self.config.reference_tie_break {
            ReferenceTieBreak::FirstSeen => candidates[0],
            ReferenceTieBreak::Nearest => {
                let mean_distance = |c: usize| {
                    component
                        .iter()
                        .map(|&i| nodes[i].measured.distance(nodes[c].link))
                        .sum::<f64>()
                        / component.len() as f64
                };
                let mut best = candidates[0];
                let mut best_distance = mean_distance(best);
                for &c in &candidates[1..] {
                    let d = mean_distance(c);
                    if d < best_distance {
                        best = c;
                        best_distance = d;
                    }
                }
                best
            }
        };
        let reference = nodes[head].reference?.clone();
        let detections = self.resolve_duplicates(nodes, component, nodes[head].link, stats);
        if detections.is_empty() {
            return None;
        }
        Some(ObservationGroup::new(Some(reference), detections))
    }

    fn internal_group(
        &self,
        nodes: &[Node<'_>],
        component: &[usize],
        stats: &mut CrossMatchStats,
    ) -> Option<ObservationGroup> {
        if component.len() < 2 {
            return None;
        }
        let centroid =
            component.iter().map(|&i| nodes[i].measured).sum::<DVec2>() / component.len() as f64;
        let detections = self.resolve_duplicates(nodes, component, centroid, stats);
        if detections.len() < 2 {
            return None;
        }
        Some(ObservationGroup::new(None, detections))
    }

    /// One detection per (exposure, detector), sorted by key.
    fn resolve_duplicates(
        &self,
        nodes: &[Node<'_>],
        component: &[usize],
        anchor: DVec2,
        stats: &mut CrossMatchStats,
    ) -> Vec<Detection> {
        let mut best: HashMap<DataKey, usize> = HashMap::new();
        for &i in component {
            let key = nodes[i].detection.key();
            match best.get(&key) {
                None => {
                    best.insert(key, i);
                }
                Some(&current) => {
                    if nodes[current].detection.source_id == nodes[i].detection.source_id {
                        continue;
                    }
                    stats.duplicates_removed += 1;
                    if self.prefer(&nodes[i], &nodes[current], anchor) {
                        best.insert(key, i);
                    }
                }
            }
        }
        let mut detections: Vec<Detection> =
            best.into_values().map(|i| nodes[i].detection.clone()).collect();
        detections.sort_by_key(|d| (d.key(), d.source_id));
        detections
    }

    /// Whether `a` should replace `b` as the detection of its (exposure, detector).
    fn prefer(&self, a: &Node<'_>, b: &Node<'_>, anchor: DVec2) -> bool {
        let da = a.measured.distance_squared(anchor);
        let db = b.measured.distance_squared(anchor);
        match self.config.duplicate_resolution {
            DuplicateResolution::Nearest => da < db,
            DuplicateResolution::Significance => {
                let (sa, sb) = (a.detection.significance(), b.detection.significance());
                sa > sb || (sa == sb && da < db)
            }
        }
    }

    /// Unconsumed detections, at most `n_brightest` per (exposure, detector).
    fn source_nodes<'c>(
        &self,
        catalogs: &'c [ExposureCatalog],
        center: DVec2,
        consumed: &HashSet<(DataKey, u64)>,
        stats: &mut CrossMatchStats,
    ) -> Vec<Node<'c>> {
        let mut per_key: HashMap<DataKey, Vec<&'c Detection>> = HashMap::new();
        let mut seen: HashSet<(DataKey, u64)> = HashSet::new();
        for catalog in catalogs {
            let demoted = catalog
                .matches
                .iter()
                .filter(|m| m.reference.is_none())
                .map(|m| &m.detection);
            for detection in catalog.detections.iter().chain(demoted) {
                let id = (detection.key(), detection.source_id);
                if consumed.contains(&id) || !seen.insert(id) {
                    continue;
                }
                per_key.entry(detection.key()).or_default().push(detection);
            }
        }

        let mut keys: Vec<DataKey> = per_key.keys().copied().collect();
        keys.sort();
        let mut nodes = Vec::new();
        for key in keys {
            let Some(mut detections) = per_key.remove(&key) else {
                continue;
            };
            detections.sort_by(|a, b| brightness(b).total_cmp(&brightness(a)));
            if detections.len() > self.config.n_brightest {
                stats.capped += detections.len() - self.config.n_brightest;
                detections.truncate(self.config.n_brightest);
            }
            for detection in detections {
                match project(detection.sky, center) {
                    Some(p) => nodes.push(Node {
                        detection,
                        reference: None,
                        link: p,
                        measured: p,
                    }),
                    None => stats.unprojectable += 1,
                }
            }
        }
        nodes
    }
}

/// Flux used for the brightness cap; invalid fluxes sort last.
fn brightness(d: &Detection) -> f64 {
    if d.flux.is_finite() { d.flux } else { f64::NEG_INFINITY }
}

fn count_detections(groups: &[ObservationGroup]) -> usize {
    groups.iter().map(|g| g.detections.len()).sum()
}

/// Mean direction of every input position.
fn tangent_center(catalogs: &[ExposureCatalog]) -> Option<DVec2> {
    mean_sky(catalogs.iter().flat_map(|c| {
        c.detections.iter().map(|d| d.sky).chain(c.matches.iter().map(|m| {
            m.reference.as_ref().map_or(m.detection.sky, |r| r.sky)
        }))
    }))
}

/// Union-find over nodes whose link positions are within `radius`.
fn link_within(nodes: &[Node<'_>], radius: f64) -> UnionFind {
    let mut uf = UnionFind::new(nodes.len());
    let points: Vec<DVec2> = nodes.iter().map(|n| n.link).collect();
    let Some(tree) = KdTree::build(&points) else {
        return uf;
    };

    let pairs: Vec<(usize, usize)> = (0..points.len())
        .into_par_iter()
        .map_init(Vec::new, |buf, i| {
            buf.clear();
            tree.radius_indices_into(points[i], radius, buf);
            buf.iter().filter(|&&j| j > i).map(|&j| (i, j)).collect::<Vec<_>>()
        })
        .flatten()
        .collect();

    for (i, j) in pairs {
        uf.union(i, j);
    }
    uf
}
