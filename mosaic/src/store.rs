//! In-memory data layer implementing both [`DataSource`] and [`DataSink`].
//!
//! Inputs are plain maps filled before the run. Outputs land behind a mutex
//! because the applier writes keys from several threads.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;

use crate::apply::{DataSink, FluxCorrection};
use crate::error::{Error, Result};
use crate::ingest::{DataSource, MatchRecord, SourceRecord};
use crate::types::{DataKey, Dataset};
use crate::wcs::Wcs;

#[derive(Debug, Default)]
pub struct InMemoryStore {
    pub filters: BTreeMap<DataKey, String>,
    pub wcs: BTreeMap<DataKey, Wcs>,
    pub sources: BTreeMap<DataKey, Vec<SourceRecord>>,
    pub matches: BTreeMap<DataKey, Vec<MatchRecord>>,
    output_wcs: Mutex<BTreeMap<DataKey, Wcs>>,
    output_flux: Mutex<BTreeMap<DataKey, FluxCorrection>>,
    /// Keys whose writes fail.
    failing: BTreeSet<DataKey>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store every input dataset of one key.
    pub fn insert(
        &mut self,
        key: DataKey,
        filter: &str,
        wcs: Wcs,
        sources: Vec<SourceRecord>,
        matches: Vec<MatchRecord>,
    ) {
        self.filters.insert(key, filter.to_string());
        self.wcs.insert(key, wcs);
        self.sources.insert(key, sources);
        self.matches.insert(key, matches);
    }

    /// Make every write of `key` fail.
    pub fn fail_writes(&mut self, key: DataKey) {
        self.failing.insert(key);
    }

    pub fn output_wcs(&self, key: DataKey) -> Option<Wcs> {
        self.output_wcs.lock().get(&key).cloned()
    }

    pub fn output_flux(&self, key: DataKey) -> Option<FluxCorrection> {
        self.output_flux.lock().get(&key).cloned()
    }

    pub fn written_keys(&self) -> Vec<DataKey> {
        self.output_wcs.lock().keys().copied().collect()
    }

    fn check_writable(&self, key: DataKey, dataset: Dataset) -> Result<()> {
        if self.failing.contains(&key) {
            return Err(Error::Write {
                key,
                dataset,
                message: "store rejected write".to_string(),
            });
        }
        Ok(())
    }
}

fn lookup<T: Clone>(map: &BTreeMap<DataKey, T>, key: DataKey, dataset: Dataset) -> Result<T> {
    map.get(&key)
        .cloned()
        .ok_or(Error::MissingData { key, dataset })
}

impl DataSource for InMemoryStore {
    fn filter(&self, key: DataKey) -> Result<String> {
        lookup(&self.filters, key, Dataset::Filter)
    }

    fn wcs(&self, key: DataKey) -> Result<Wcs> {
        lookup(&self.wcs, key, Dataset::Wcs)
    }

    fn sources(&self, key: DataKey) -> Result<Vec<SourceRecord>> {
        lookup(&self.sources, key, Dataset::Sources)
    }

    fn matches(&self, key: DataKey) -> Result<Vec<MatchRecord>> {
        lookup(&self.matches, key, Dataset::Matches)
    }
}

impl DataSink for InMemoryStore {
    fn put_wcs(&self, key: DataKey, wcs: &Wcs) -> Result<()> {
        self.check_writable(key, Dataset::OutputWcs)?;
        self.output_wcs.lock().insert(key, wcs.clone());
        Ok(())
    }

    fn put_flux_correction(&self, key: DataKey, correction: &FluxCorrection) -> Result<()> {
        self.check_writable(key, Dataset::FluxCorrection)?;
        self.output_flux.lock().insert(key, correction.clone());
        Ok(())
    }
}
