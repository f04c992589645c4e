//! Local persistence capability for settings and timer records.
//!
//! The core only talks to [`Persistence`]; [`MemoryStore`] backs tests and
//! [`FileStore`] keeps the records as JSON files under the data directory.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs as async_fs;
use tokio::sync::{Mutex, RwLock};

use crate::config::Settings;

const TIMERS_FILE: &str = "timers.json";
const SETTINGS_FILE: &str = "settings.json";

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Persisted part of a timer run. Live issue/billing data is never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTimerRecord {
    pub id: String,
    pub key: String,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl StoredTimerRecord {
    /// A new open run for `key`.
    pub fn open(key: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        let key = key.into();
        Self {
            id: record_id(&key, started_at),
            key,
            started_at,
            stopped_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.stopped_at.is_none()
    }

    /// Tracked time, measuring an open run up to `now`.
    pub fn duration(&self, now: DateTime<Utc>) -> Duration {
        let end = self.stopped_at.unwrap_or(now);
        (end - self.started_at).max(Duration::zero())
    }
}

/// Stable record id: `timer.<key>.<UTC start timestamp>`.
pub fn record_id(key: &str, started_at: DateTime<Utc>) -> String {
    format!("timer.{}.{}", key, started_at.format("%Y%m%dT%H%M%S%.6fZ"))
}

/// Record query. Start bounds are inclusive below and exclusive above.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub key: Option<String>,
    pub key_prefix: Option<String>,
    pub start_after: Option<DateTime<Utc>>,
    pub start_before: Option<DateTime<Utc>>,
}

impl RecordFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn started_after(mut self, at: DateTime<Utc>) -> Self {
        self.start_after = Some(at);
        self
    }

    pub fn started_before(mut self, at: DateTime<Utc>) -> Self {
        self.start_before = Some(at);
        self
    }

    pub fn matches(&self, record: &StoredTimerRecord) -> bool {
        if let Some(key) = &self.key {
            if &record.key != key {
                return false;
            }
        }
        if let Some(prefix) = &self.key_prefix {
            if !record.key.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(after) = self.start_after {
            if record.started_at < after {
                return false;
            }
        }
        if let Some(before) = self.start_before {
            if record.started_at >= before {
                return false;
            }
        }
        true
    }
}

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn save_settings(&self, settings: &Settings) -> StoreResult<()>;

    /// Last saved settings, `None` before the first save.
    async fn load_settings(&self) -> StoreResult<Option<Settings>>;

    /// Inserts or replaces the record with the same id.
    async fn save_timer_record(&self, record: &StoredTimerRecord) -> StoreResult<()>;

    /// Matching records ordered by start time.
    async fn list_timer_records(&self, filter: &RecordFilter)
        -> StoreResult<Vec<StoredTimerRecord>>;

    async fn delete_timer_record(&self, id: &str) -> StoreResult<()>;

    /// Deletes every record that started before `threshold`, returning how many went.
    async fn delete_timer_records_before(&self, threshold: DateTime<Utc>) -> StoreResult<usize> {
        let stale = self
            .list_timer_records(&RecordFilter::all().started_before(threshold))
            .await?;
        for record in &stale {
            self.delete_timer_record(&record.id).await?;
        }
        Ok(stale.len())
    }
}

fn sorted(mut records: Vec<StoredTimerRecord>) -> Vec<StoredTimerRecord> {
    records.sort_by(|a, b| {
        a.started_at
            .cmp(&b.started_at)
            .then_with(|| a.key.cmp(&b.key))
    });
    records
}

/// Process-local store.
#[derive(Default)]
pub struct MemoryStore {
    settings: RwLock<Option<Settings>>,
    records: RwLock<BTreeMap<String, StoredTimerRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn save_settings(&self, settings: &Settings) -> StoreResult<()> {
        *self.settings.write().await = Some(settings.clone());
        Ok(())
    }

    async fn load_settings(&self) -> StoreResult<Option<Settings>> {
        Ok(self.settings.read().await.clone())
    }

    async fn save_timer_record(&self, record: &StoredTimerRecord) -> StoreResult<()> {
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn list_timer_records(
        &self,
        filter: &RecordFilter,
    ) -> StoreResult<Vec<StoredTimerRecord>> {
        let records = self.records.read().await;
        Ok(sorted(
            records
                .values()
                .filter(|record| filter.matches(record))
                .cloned()
                .collect(),
        ))
    }

    async fn delete_timer_record(&self, id: &str) -> StoreResult<()> {
        self.records.write().await.remove(id);
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct SettingsBlob {
    settings: String,
}

/// JSON-file store. Records are cached in memory and every mutation rewrites
/// `timers.json` through a temporary file so a crash never leaves a torn file.
pub struct FileStore {
    dir: PathBuf,
    records: Mutex<BTreeMap<String, StoredTimerRecord>>,
}

impl FileStore {
    /// Opens (creating if needed) the store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        async_fs::create_dir_all(&dir).await?;

        let timers_path = dir.join(TIMERS_FILE);
        let records = match async_fs::read(&timers_path).await {
            Ok(bytes) => {
                let list: Vec<StoredTimerRecord> = serde_json::from_slice(&bytes)?;
                list.into_iter()
                    .map(|record| (record.id.clone(), record))
                    .collect()
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        debug!("Opened timer store with {} records", records.len());

        Ok(Self {
            dir,
            records: Mutex::new(records),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn flush(&self, records: &BTreeMap<String, StoredTimerRecord>) -> StoreResult<()> {
        let list: Vec<&StoredTimerRecord> = records.values().collect();
        let content = serde_json::to_vec_pretty(&list)?;
        write_atomic(&self.dir.join(TIMERS_FILE), &content).await
    }
}

async fn write_atomic(path: &Path, content: &[u8]) -> StoreResult<()> {
    let tmp = path.with_extension("json.tmp");
    async_fs::write(&tmp, content).await?;
    async_fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl Persistence for FileStore {
    async fn save_settings(&self, settings: &Settings) -> StoreResult<()> {
        let json = serde_json::to_vec(settings)?;
        let blob = SettingsBlob {
            settings: BASE64_STANDARD.encode(json),
        };
        let content = serde_json::to_vec_pretty(&blob)?;
        write_atomic(&self.dir.join(SETTINGS_FILE), &content).await
    }

    async fn load_settings(&self) -> StoreResult<Option<Settings>> {
        let bytes = match async_fs::read(self.dir.join(SETTINGS_FILE)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let decoded = serde_json::from_slice::<SettingsBlob>(&bytes)
            .map_err(|err| err.to_string())
            .and_then(|blob| {
                BASE64_STANDARD
                    .decode(blob.settings)
                    .map_err(|err| err.to_string())
            })
            .and_then(|json| {
                serde_json::from_slice::<Settings>(&json).map_err(|err| err.to_string())
            });

        decoded.map(Some).map_err(|err| {
            StoreError::Serialization(format!("unreadable {}: {}", SETTINGS_FILE, err))
        })
    }

    async fn save_timer_record(&self, record: &StoredTimerRecord) -> StoreResult<()> {
        let mut records = self.records.lock().await;
        let previous = records.insert(record.id.clone(), record.clone());
        if let Err(err) = self.flush(&records).await {
            match previous {
                Some(old) => records.insert(old.id.clone(), old),
                None => records.remove(&record.id),
            };
            return Err(err);
        }
        Ok(())
    }

    async fn list_timer_records(
        &self,
        filter: &RecordFilter,
    ) -> StoreResult<Vec<StoredTimerRecord>> {
        let records = self.records.lock().await;
        Ok(sorted(
            records
                .values()
                .filter(|record| filter.matches(record))
                .cloned()
                .collect(),
        ))
    }

    async fn delete_timer_record(&self, id: &str) -> StoreResult<()> {
        let mut records = self.records.lock().await;
        if let Some(removed) = records.remove(id) {
            if let Err(err) = self.flush(&records).await {
                records.insert(removed.id.clone(), removed);
                return Err(err);
            }
        }
        Ok(())
    }

    async fn delete_timer_records_before(&self, threshold: DateTime<Utc>) -> StoreResult<usize> {
        let mut records = self.records.lock().await;
        let stale: Vec<String> = records
            .values()
            .filter(|record| record.started_at < threshold)
            .map(|record| record.id.clone())
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        let mut kept = records.clone();
        for id in &stale {
            kept.remove(id);
        }
        self.flush(&kept).await?;
        *records = kept;
        Ok(stale.len())
    }
}
