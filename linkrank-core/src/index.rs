//! Indexing boundary: content messages in, rank-annotated documents out.

use crate::config::IndexConfig;
use crate::data::{Database, now_millis};
use crate::error::Result;
use crate::model::{ContentMessage, IndexedDocument};
use crate::queue::{Outcome, RetryPolicy, WorkQueue};
use crate::scores::ScoreStore;
use parking_lot::Mutex;
use rusqlite::{OptionalExtension, params};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Destination for indexed documents. Upserts are keyed by URL, so
/// republishing a URL replaces the earlier document.
pub trait DocumentSink: Send + Sync {
    fn upsert(&self, document: &IndexedDocument) -> Result<()>;
}

/// Document index kept in the pipeline database.
pub struct SqliteDocumentIndex {
    db: Arc<Database>,
}

impl SqliteDocumentIndex {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn get(&self, url: &str) -> Result<Option<IndexedDocument>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT url, title, content, rank_score FROM documents WHERE url = ?1",
                params![url],
                |row| {
                    Ok(IndexedDocument {
                        url: row.get(0)?,
                        title: row.get(1)?,
                        content: row.get(2)?,
                        rank_score: row.get(3)?,
                    })
                },
            )
            .optional()
        })
    }

    pub fn count(&self) -> Result<u64> {
        let count: i64 = self.db.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))
        })?;
        Ok(count as u64)
    }
}

impl DocumentSink for SqliteDocumentIndex {
    fn upsert(&self, document: &IndexedDocument) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO documents (url, title, content, rank_score, indexed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(url) DO UPDATE SET
                    title = excluded.title,
                    content = excluded.content,
                    rank_score = excluded.rank_score,
                    indexed_at = excluded.indexed_at",
                params![
                    &document.url,
                    &document.title,
                    &document.content,
                    document.rank_score,
                    now_millis()
                ],
            )
        })?;
        Ok(())
    }
}

/// What happened to one content message.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexAction {
    Indexed { url: String, rank_score: f64 },
    /// The message was unusable and has been acknowledged and discarded.
    Dropped { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSummary {
    pub indexed: usize,
    pub dropped: usize,
    pub failed: usize,
}

pub struct Indexer<S: DocumentSink> {
    queue: WorkQueue,
    scores: Arc<ScoreStore>,
    sink: S,
    config: IndexConfig,
    last_refresh: Mutex<Option<Instant>>,
}

impl<S: DocumentSink> Indexer<S> {
    pub fn new(queue: WorkQueue, scores: Arc<ScoreStore>, sink: S, config: IndexConfig) -> Self {
        Self {
            queue,
            scores,
            sink,
            config,
            last_refresh: Mutex::new(None),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Reload scores if the refresh interval has passed since the last check.
    fn refresh_scores(&self) {
        let interval = Duration::from_secs(self.config.score_refresh_secs);
        let mut last = self.last_refresh.lock();
        let due = last.map(|at| at.elapsed() >= interval).unwrap_or(true);
        if due {
            self.scores.reload();
            *last = Some(Instant::now());
        }
    }

    /// Process one message. `Ok(None)` when the queue is empty.
    ///
    /// Sink failures leave the message leased so it is redelivered once the
    /// lease runs out.
    pub fn process_one(&self) -> Result<Option<IndexAction>> {
        let lease = Duration::from_secs(self.config.lease_timeout_secs);
        let Some(delivery) = self.queue.take(lease)? else {
            return Ok(None);
        };

        self.refresh_scores();

        let message: ContentMessage = match serde_json::from_str(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed content message {}: {}", delivery.id, e);
                self.queue
                    .complete(&delivery, Outcome::Skip, &RetryPolicy::terminal())?;
                return Ok(Some(IndexAction::Dropped {
                    reason: e.to_string(),
                }));
            }
        };

        let rank_score = self.scores.get(&message.url);
        let document = IndexedDocument::from_message(message, rank_score);
        self.sink.upsert(&document)?;
        self.queue
            .complete(&delivery, Outcome::Success, &RetryPolicy::terminal())?;

        debug!("Indexed {} with rank {:.4}", document.url, rank_score);
        Ok(Some(IndexAction::Indexed {
            url: document.url,
            rank_score,
        }))
    }

    /// Drain the content queue until shutdown, or until idle when
    /// `exit_when_idle` is set.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<IndexSummary> {
        let mut summary = IndexSummary::default();
        let mut idle_polls = 0usize;
        let idle_poll = Duration::from_millis(self.config.idle_poll_ms);

        info!("Indexer waiting for content on '{}'", self.queue.name());
        while !*shutdown.borrow() {
            match self.process_one() {
                Ok(Some(IndexAction::Indexed { .. })) => {
                    summary.indexed += 1;
                    idle_polls = 0;
                }
                Ok(Some(IndexAction::Dropped { .. })) => {
                    summary.dropped += 1;
                    idle_polls = 0;
                }
                Ok(None) => {
                    idle_polls += 1;
                    if self.config.exit_when_idle && idle_polls >= self.config.max_idle_polls {
                        debug!("Content queue idle, indexer exiting");
                        break;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(idle_poll) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("Indexing failed: {}", e);
                    summary.failed += 1;
                    tokio::time::sleep(idle_poll).await;
                }
            }
        }

        info!(
            "Indexer stopped: {} indexed, {} dropped, {} failed",
            summary.indexed, summary.dropped, summary.failed
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scores::{RankVector, write_snapshot};
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        queue: WorkQueue,
        indexer: Indexer<SqliteDocumentIndex>,
        snapshot_path: std::path::PathBuf,
    }

    fn create_fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::new(&temp_dir.path().join("index.db")).unwrap());
        let queue = WorkQueue::new(db.clone(), "content_for_indexing");
        let snapshot_path = temp_dir.path().join("scores.json");
        let scores = Arc::new(ScoreStore::new(&snapshot_path, 0.15));
        let config = IndexConfig {
            score_refresh_secs: 0,
            exit_when_idle: true,
            max_idle_polls: 1,
            idle_poll_ms: 1,
            ..IndexConfig::default()
        };
        let indexer = Indexer::new(queue.clone(), scores, SqliteDocumentIndex::new(db), config);
        Fixture {
            _temp_dir: temp_dir,
            queue,
            indexer,
            snapshot_path,
        }
    }

    fn publish(queue: &WorkQueue, url: &str, title: &str) {
        let message = ContentMessage {
            url: url.to_string(),
            title: title.to_string(),
            content: "body text".to_string(),
        };
        queue.publish(&serde_json::to_string(&message).unwrap()).unwrap();
    }

    #[test]
    fn test_document_gets_rank_from_snapshot() {
        let fixture = create_fixture();
        let ranks: RankVector = [("http://a.com/".to_string(), 1.7)].into_iter().collect();
        write_snapshot(&fixture.snapshot_path, &ranks).unwrap();

        publish(&fixture.queue, "http://a.com/", "A");
        publish(&fixture.queue, "http://b.com/", "B");

        assert_eq!(
            fixture.indexer.process_one().unwrap(),
            Some(IndexAction::Indexed {
                url: "http://a.com/".to_string(),
                rank_score: 1.7
            })
        );
        assert_eq!(
            fixture.indexer.process_one().unwrap(),
            Some(IndexAction::Indexed {
                url: "http://b.com/".to_string(),
                rank_score: 0.15
            })
        );
        assert_eq!(fixture.indexer.process_one().unwrap(), None);

        let doc = fixture.indexer.sink().get("http://a.com/").unwrap().unwrap();
        assert_eq!(doc.title, "A");
        assert_eq!(doc.rank_score, 1.7);
    }

    #[test]
    fn test_malformed_message_is_dropped() {
        let fixture = create_fixture();
        fixture.queue.publish("{not json").unwrap();
        publish(&fixture.queue, "http://a.com/", "A");

        assert!(matches!(
            fixture.indexer.process_one().unwrap(),
            Some(IndexAction::Dropped { .. })
        ));
        assert!(matches!(
            fixture.indexer.process_one().unwrap(),
            Some(IndexAction::Indexed { .. })
        ));
        assert_eq!(fixture.queue.stats().unwrap().pending, 0);
    }

    #[test]
    fn test_republishing_overwrites() {
        let fixture = create_fixture();
        publish(&fixture.queue, "http://a.com/", "Old");
        publish(&fixture.queue, "http://a.com/", "New");

        fixture.indexer.process_one().unwrap();
        fixture.indexer.process_one().unwrap();

        let sink = fixture.indexer.sink();
        assert_eq!(sink.count().unwrap(), 1);
        assert_eq!(sink.get("http://a.com/").unwrap().unwrap().title, "New");
    }

    #[tokio::test]
    async fn test_run_drains_until_idle() {
        let fixture = create_fixture();
        publish(&fixture.queue, "http://a.com/", "A");
        fixture.queue.publish("garbage").unwrap();

        let (_tx, rx) = watch::channel(false);
        let summary = fixture.indexer.run(rx).await.unwrap();
        assert_eq!(
            summary,
            IndexSummary {
                indexed: 1,
                dropped: 1,
                failed: 0
            }
        );
    }
}
