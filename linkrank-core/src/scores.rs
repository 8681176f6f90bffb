//! Versioned, hot-reloadable score snapshots.

use crate::error::{CoreError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{info, warn};

/// URL to rank, produced wholesale by one ranking run.
pub type RankVector = HashMap<String, f64>;

/// Write `ranks` as a JSON object so readers never see a partial file: the
/// data goes to a temporary file next to the target, is synced, then
/// renamed over it.
pub fn write_snapshot(path: &Path, ranks: &RankVector) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("json.tmp");
    {
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, ranks)?;
        writer.flush()?;
        writer
            .into_inner()
            .map_err(|e| CoreError::Io(e.into_error()))?
            .sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Identifies one version of the snapshot file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SnapshotMarker {
    modified: Option<SystemTime>,
    len: u64,
    #[cfg(unix)]
    inode: u64,
}

impl SnapshotMarker {
    fn of(metadata: &fs::Metadata) -> Self {
        #[cfg(unix)]
        use std::os::unix::fs::MetadataExt;

        Self {
            modified: metadata.modified().ok(),
            len: metadata.len(),
            #[cfg(unix)]
            inode: metadata.ino(),
        }
    }
}

/// One loaded rank vector. Immutable; replaced as a whole on reload.
#[derive(Debug)]
pub struct ScoreSnapshot {
    version: u64,
    scores: RankVector,
    default_score: f64,
    marker: Option<SnapshotMarker>,
}

impl ScoreSnapshot {
    fn empty(default_score: f64) -> Self {
        Self {
            version: 0,
            scores: RankVector::new(),
            default_score,
            marker: None,
        }
    }

    pub fn get(&self, url: &str) -> f64 {
        self.scores.get(url).copied().unwrap_or(self.default_score)
    }

    /// 0 until the first successful load.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReloadStatus {
    Unchanged,
    /// No snapshot file exists; whatever was loaded before stays.
    Missing,
    Reloaded { version: u64, entries: usize },
    /// The file could not be read or parsed; the previous snapshot stays.
    Failed(String),
}

pub struct ScoreStore {
    path: PathBuf,
    default_score: f64,
    current: RwLock<Arc<ScoreSnapshot>>,
    reload_guard: Mutex<()>,
}

impl ScoreStore {
    /// A store with nothing loaded yet. `default_score` is `1 - damping`.
    pub fn new(path: &Path, default_score: f64) -> Self {
        Self {
            path: path.to_path_buf(),
            default_score,
            current: RwLock::new(Arc::new(ScoreSnapshot::empty(default_score))),
            reload_guard: Mutex::new(()),
        }
    }

    /// Create the store and attempt an initial load.
    pub fn open(path: &Path, default_score: f64) -> Self {
        let store = Self::new(path, default_score);
        store.reload();
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The snapshot in effect right now. Holding the `Arc` pins it.
    pub fn snapshot(&self) -> Arc<ScoreSnapshot> {
        self.current.read().clone()
    }

    pub fn get(&self, url: &str) -> f64 {
        self.snapshot().get(url)
    }

    /// Swap in the on-disk snapshot if it changed since the last load.
    ///
    /// Parsing happens before the write lock is taken; the lock only covers
    /// the pointer swap. Errors never propagate.
    pub fn reload(&self) -> ReloadStatus {
        let _guard = self.reload_guard.lock();
        let current = self.snapshot();

        let metadata = match fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if current.version > 0 {
                    warn!(
                        "Score snapshot {} disappeared; keeping version {}",
                        self.path.display(),
                        current.version
                    );
                }
                return ReloadStatus::Missing;
            }
            Err(e) => return self.reload_failed(&current, e.to_string()),
        };

        let marker = SnapshotMarker::of(&metadata);
        if current.marker.as_ref() == Some(&marker) {
            return ReloadStatus::Unchanged;
        }

        let scores = match self.read_scores() {
            Ok(scores) => scores,
            Err(reason) => return self.reload_failed(&current, reason),
        };

        let next = Arc::new(ScoreSnapshot {
            version: current.version + 1,
            scores,
            default_score: self.default_score,
            marker: Some(marker),
        });
        let status = ReloadStatus::Reloaded {
            version: next.version,
            entries: next.len(),
        };

        *self.current.write() = next;
        info!("Loaded score snapshot {:?} from {}", status, self.path.display());
        status
    }

    fn read_scores(&self) -> std::result::Result<RankVector, String> {
        let bytes = fs::read(&self.path).map_err(|e| e.to_string())?;
        let scores: RankVector = serde_json::from_slice(&bytes).map_err(|e| e.to_string())?;
        if let Some((url, score)) = scores.iter().find(|(_, s)| !s.is_finite() || **s < 0.0) {
            return Err(format!("invalid score {} for {}", score, url));
        }
        Ok(scores)
    }

    fn reload_failed(&self, current: &ScoreSnapshot, reason: String) -> ReloadStatus {
        warn!(
            "Could not reload score snapshot {}: {}; keeping version {}",
            self.path.display(),
            reason,
            current.version
        );
        ReloadStatus::Failed(reason)
    }
}
