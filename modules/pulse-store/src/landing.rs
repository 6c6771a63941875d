// Immutable landing zone for raw records.
//
// Objects are newline-delimited JSON, one per (source, observation date, run):
//   raw/{source}/dt={YYYY-MM-DD}/part-{run_id}.ndjson
// A run is landed before merge and never rewritten, which is what makes
// replay and duplicate audits possible.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pulse_common::{FetchRun, IngestError, RawRecord, Result, SourceId};

/// Location of one landed object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LandingObjectKey {
    pub source: SourceId,
    pub date: NaiveDate,
    pub run_id: Uuid,
}

impl LandingObjectKey {
    pub fn to_path(&self) -> String {
        format!(
            "raw/{}/dt={}/part-{}.ndjson",
            self.source,
            self.date.format("%Y-%m-%d"),
            self.run_id
        )
    }

    /// Inverse of [`LandingObjectKey::to_path`]. Returns `None` for foreign paths.
    pub fn parse(path: &str) -> Option<Self> {
        let rest = path.strip_prefix("raw/")?;
        let mut parts = rest.splitn(3, '/');
        let source = parts.next()?;
        let date = parts.next()?.strip_prefix("dt=")?;
        let file = parts.next()?;
        let run = file.strip_prefix("part-")?.strip_suffix(".ndjson")?;
        Some(Self {
            source: SourceId::new(source),
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?,
            run_id: Uuid::parse_str(run).ok()?,
        })
    }
}

/// Group a run's records into landing objects by observation date.
fn partition(run: &FetchRun, records: &[RawRecord]) -> BTreeMap<LandingObjectKey, Vec<RawRecord>> {
    let mut groups: BTreeMap<LandingObjectKey, Vec<RawRecord>> = BTreeMap::new();
    for record in records {
        let key = LandingObjectKey {
            source: run.source_id.clone(),
            date: record.observed_at.date_naive(),
            run_id: run.run_id,
        };
        groups.entry(key).or_default().push(record.clone());
    }
    groups
}

fn encode(records: &[RawRecord]) -> Result<String> {
    let mut out = String::new();
    for record in records {
        let line = serde_json::to_string(record)
            .map_err(|e| IngestError::Storage(format!("encode landed record: {e}")))?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

fn decode(path: &str, body: &str) -> Result<Vec<RawRecord>> {
    body.lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| {
                IngestError::Storage(format!("{path} line {}: corrupt landed record: {e}", i + 1))
            })
        })
        .collect()
}

/// Write-once storage for landed runs.
#[async_trait]
pub trait LandingStore: Send + Sync {
    /// Land every record of `run`. Returns the object paths written.
    async fn put_run(&self, run: &FetchRun, records: &[RawRecord]) -> Result<Vec<String>>;

    /// All records landed by one run, in landing order.
    async fn load_run(&self, source: &SourceId, run_id: Uuid) -> Result<Vec<RawRecord>>;

    /// All records of `source` landed in partitions dated on or after `since`.
    async fn load_since(&self, source: &SourceId, since: NaiveDate) -> Result<Vec<RawRecord>>;

    /// Delete every object landed by one run. Returns the number of objects removed.
    async fn delete_run(&self, source: &SourceId, run_id: Uuid) -> Result<usize>;
}

// --- In memory ---

#[derive(Default)]
pub struct MemoryLandingStore {
    objects: Mutex<HashMap<LandingObjectKey, Vec<RawRecord>>>,
}

impl MemoryLandingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }
}

fn poisoned<T>(_: T) -> IngestError {
    IngestError::Storage("landing store lock poisoned".to_string())
}

#[async_trait]
impl LandingStore for MemoryLandingStore {
    async fn put_run(&self, run: &FetchRun, records: &[RawRecord]) -> Result<Vec<String>> {
        let mut objects = self.objects.lock().map_err(poisoned)?;
        let mut paths = Vec::new();
        for (key, group) in partition(run, records) {
            if objects.contains_key(&key) {
                return Err(IngestError::Storage(format!(
                    "landing object already exists: {}",
                    key.to_path()
                )));
            }
            paths.push(key.to_path());
            objects.insert(key, group);
        }
        Ok(paths)
    }

    async fn load_run(&self, source: &SourceId, run_id: Uuid) -> Result<Vec<RawRecord>> {
        let objects = self.objects.lock().map_err(poisoned)?;
        let mut keys: Vec<_> = objects
            .keys()
            .filter(|k| &k.source == source && k.run_id == run_id)
            .collect();
        keys.sort();
        Ok(keys.into_iter().flat_map(|k| objects[k].clone()).collect())
    }

    async fn load_since(&self, source: &SourceId, since: NaiveDate) -> Result<Vec<RawRecord>> {
        let objects = self.objects.lock().map_err(poisoned)?;
        let mut keys: Vec<_> = objects
            .keys()
            .filter(|k| &k.source == source && k.date >= since)
            .collect();
        keys.sort();
        Ok(keys.into_iter().flat_map(|k| objects[k].clone()).collect())
    }

    async fn delete_run(&self, source: &SourceId, run_id: Uuid) -> Result<usize> {
        let mut objects = self.objects.lock().map_err(poisoned)?;
        let before = objects.len();
        objects.retain(|k, _| !(&k.source == source && k.run_id == run_id));
        Ok(before - objects.len())
    }
}

// --- Filesystem ---

/// Landing zone rooted at a local directory.
pub struct FsLandingStore {
    root: PathBuf,
}

impl FsLandingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every object key under `raw/{source}`, sorted.
    async fn keys_for(&self, source: &SourceId) -> Result<Vec<LandingObjectKey>> {
        let source_dir = self.root.join("raw").join(source.as_str());
        let mut keys = Vec::new();
        let mut partitions = match tokio::fs::read_dir(&source_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };
        while let Some(partition) = partitions.next_entry().await? {
            let Some(dt) = partition.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let mut files = tokio::fs::read_dir(partition.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let Some(name) = file.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                let rel = format!("raw/{source}/{dt}/{name}");
                match LandingObjectKey::parse(&rel) {
                    Some(key) => keys.push(key),
                    None => debug!(path = %rel, "Skipping non-landing file"),
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn read_object(&self, key: &LandingObjectKey) -> Result<Vec<RawRecord>> {
        let rel = key.to_path();
        let body = tokio::fs::read_to_string(self.root.join(&rel)).await?;
        decode(&rel, &body)
    }
}

#[async_trait]
impl LandingStore for FsLandingStore {
    async fn put_run(&self, run: &FetchRun, records: &[RawRecord]) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        for (key, group) in partition(run, records) {
            let rel = key.to_path();
            let path = self.root.join(&rel);
            if tokio::fs::try_exists(&path).await? {
                return Err(IngestError::Storage(format!(
                    "landing object already exists: {rel}"
                )));
            }
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            // Write to a sibling temp file and rename so readers never see a partial object.
            let tmp = path.with_extension("ndjson.tmp");
            tokio::fs::write(&tmp, encode(&group)?).await?;
            tokio::fs::rename(&tmp, &path).await?;
            debug!(path = %rel, records = group.len(), "Landed object");
            paths.push(rel);
        }
        Ok(paths)
    }

    async fn load_run(&self, source: &SourceId, run_id: Uuid) -> Result<Vec<RawRecord>> {
        let mut out = Vec::new();
        for key in self.keys_for(source).await? {
            if key.run_id == run_id {
                out.extend(self.read_object(&key).await?);
            }
        }
        Ok(out)
    }

    async fn load_since(&self, source: &SourceId, since: NaiveDate) -> Result<Vec<RawRecord>> {
        let mut out = Vec::new();
        for key in self.keys_for(source).await? {
            if key.date >= since {
                out.extend(self.read_object(&key).await?);
            }
        }
        Ok(out)
    }

    async fn delete_run(&self, source: &SourceId, run_id: Uuid) -> Result<usize> {
        let mut removed = 0;
        for key in self.keys_for(source).await? {
            if key.run_id != run_id {
                continue;
            }
            match tokio::fs::remove_file(self.root.join(key.to_path())).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %key.to_path(), error = %e, "Failed to purge landing object"),
            }
        }
        if removed > 0 {
            info!(source = %source, run_id = %run_id, removed, "Purged landed run");
        }
        Ok(removed)
    }
}
