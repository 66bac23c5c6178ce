use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// One of the two external ticket systems whose data is cached and queryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    Jira,
    Freshservice,
}

impl SourceId {
    pub const ALL: [SourceId; 2] = [SourceId::Jira, SourceId::Freshservice];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::Jira => "jira",
            SourceId::Freshservice => "freshservice",
        }
    }

    fn cache_file_name(&self) -> &'static str {
        match self {
            SourceId::Jira => "jira_issues_cache.json",
            SourceId::Freshservice => "fresh_service_tickets.json",
        }
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A uniform ticket record: column name to JSON value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// The full in-memory table for one source at a point in time, replaced
/// wholesale on refresh.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub rows: Vec<Row>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub status: &'static str,
    pub record_count: usize,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub cache_age_secs: Option<u64>,
    pub cache_file: String,
}

/// Load the persisted snapshot unconditionally, regardless of age. Startup
/// availability takes precedence over freshness.
fn load_persisted(id: SourceId, path: &Path) -> Snapshot {
    if !path.exists() {
        info!("No {} cache file found on startup", id);
        return Snapshot::default();
    }
    match std::fs::read(path)
        .map_err(anyhow::Error::from)
        .and_then(|bytes| serde_json::from_slice::<Vec<Row>>(&bytes).map_err(Into::into))
    {
        Ok(rows) => {
            info!("Loaded {} {} records from cache on startup", rows.len(), id);
            let refreshed_at = std::fs::metadata(path)
                .ok()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from);
            Snapshot { rows, refreshed_at }
        }
        Err(e) => {
            warn!("Failed to load {} cache on startup: {}", id, e);
            Snapshot::default()
        }
    }
}

/// Per-source snapshot container. Readers clone the `Arc` inside a short
/// read guard and run queries against the clone with no lock held, so a
/// long query never blocks a refresh replacement.
pub struct SourceCache {
    id: SourceId,
    path: PathBuf,
    ttl: Duration,
    snapshot: RwLock<Arc<Snapshot>>,
}

impl SourceCache {
    fn new(id: SourceId, data_dir: &Path, ttl: Duration) -> Self {
        let path = data_dir.join(id.cache_file_name());
        let initial = load_persisted(id, &path);
        Self {
            id,
            path,
            ttl,
            snapshot: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    /// Consistent snapshot reference; the lock is held only for the clone.
    pub async fn read(&self) -> Arc<Snapshot> {
        self.snapshot.read().await.clone()
    }

    /// Atomically swap in a new table and persist it. A persistence failure
    /// is logged but does not fail the refresh; the in-memory snapshot is
    /// authoritative.
    pub async fn replace(&self, rows: Vec<Row>) -> Result<()> {
        let count = rows.len();
        let bytes = serde_json::to_vec(&rows)?;
        let snap = Arc::new(Snapshot {
            rows,
            refreshed_at: Some(Utc::now()),
        });
        *self.snapshot.write().await = snap;
        if let Err(e) = tokio::fs::write(&self.path, bytes).await {
            warn!("Failed to persist {} snapshot: {}", self.id, e);
        }
        info!("Replaced {} snapshot ({} records)", self.id, count);
        Ok(())
    }

    pub async fn status(&self) -> SourceStatus {
        let snap = self.read().await;
        SourceStatus {
            status: if snap.rows.is_empty() {
                "no_data"
            } else {
                "available"
            },
            record_count: snap.rows.len(),
            last_refreshed_at: snap.refreshed_at,
            cache_age_secs: self.persisted_age().map(|d| d.as_secs()),
            cache_file: self.id.cache_file_name().to_string(),
        }
    }

    /// Age of the persisted blob, from its modification timestamp.
    pub fn persisted_age(&self) -> Option<Duration> {
        let modified = std::fs::metadata(&self.path).ok()?.modified().ok()?;
        modified.elapsed().ok()
    }

    /// A fresh persisted file lets a non-forced refresh skip the live fetch.
    pub fn is_persisted_fresh(&self) -> bool {
        match self.persisted_age() {
            Some(age) => age < self.ttl,
            None => false,
        }
    }
}

/// Owns one `SourceCache` per data source. The only resource shared across
/// in-flight conversations.
pub struct CacheStore {
    jira: SourceCache,
    freshservice: SourceCache,
}

impl CacheStore {
    pub fn open(data_dir: &Path, jira_ttl: Duration, freshservice_ttl: Duration) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;
        Ok(Self {
            jira: SourceCache::new(SourceId::Jira, data_dir, jira_ttl),
            freshservice: SourceCache::new(SourceId::Freshservice, data_dir, freshservice_ttl),
        })
    }

    pub fn source(&self, id: SourceId) -> &SourceCache {
        match id {
            SourceId::Jira => &self.jira,
            SourceId::Freshservice => &self.freshservice,
        }
    }
}
