//! Per-event counters for inbound control traffic.
//!
//! Counts are keyed by raw tag so events this build does not understand still
//! show up. Persisted as a flat JSON object (`{"RESTART_CLIENT": 3, ...}`).

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct EventStats {
    counts: DashMap<String, u64>,
}

impl EventStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one occurrence of `tag`. Returns `true` the first time a tag is seen.
    pub fn record(&self, tag: &str) -> bool {
        let first = {
            let mut count = self.counts.entry(tag.to_string()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if first {
            tracing::info!(tag, "Found new event");
        }
        first
    }

    pub fn get(&self, tag: &str) -> u64 {
        self.counts.get(tag).map(|c| *c).unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counts
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    /// Load counters saved by [`EventStats::save`]. A missing file is empty stats.
    pub fn load(path: &Path) -> io::Result<Self> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e),
        };
        let counts: BTreeMap<String, u64> = serde_json::from_slice(&bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Self {
            counts: counts.into_iter().collect(),
        })
    }

    /// Write counters to `path`, replacing it atomically via a sibling temp file.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_vec(&self.snapshot())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)
    }
}
