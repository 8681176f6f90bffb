//! URL admission control: normalization, durable dedup and the frontier queue.

use crate::config::FrontierConfig;
use crate::data::{Database, now_millis};
use crate::error::Result;
use crate::queue::{self, Ack, Delivery, Outcome, QueueStats, RetryPolicy, WorkQueue};
use crate::urls::{Rejection, UrlPolicy};
use rusqlite::{OptionalExtension, TransactionBehavior, params};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Result of [`Frontier::admit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// First sighting; the normalized URL is now on the frontier.
    Enqueued(String),
    /// The normalized URL was admitted before.
    Duplicate(String),
    Rejected(Rejection),
}

impl Admission {
    pub fn is_enqueued(&self) -> bool {
        matches!(self, Admission::Enqueued(_))
    }
}

/// A URL leased to a worker. Consumed by [`Frontier::complete`].
#[derive(Debug)]
pub struct Entry {
    pub url: String,
    delivery: Delivery,
}

impl Entry {
    pub fn deliveries(&self) -> u32 {
        self.delivery.deliveries
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrontierStats {
    pub seen: u64,
    pub queue: QueueStats,
}

pub struct Frontier {
    db: Arc<Database>,
    queue: WorkQueue,
    policy: UrlPolicy,
    lease: Duration,
    retry: RetryPolicy,
}

impl Frontier {
    pub fn new(
        db: Arc<Database>,
        queue_name: &str,
        policy: UrlPolicy,
        config: &FrontierConfig,
    ) -> Self {
        let retry = RetryPolicy {
            max_deliveries: config.max_deliveries.max(1),
            initial_backoff: Duration::from_millis(config.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(config.retry_max_backoff_ms),
        };

        Self {
            queue: WorkQueue::new(db.clone(), queue_name),
            db,
            policy,
            lease: config.lease_timeout(),
            retry,
        }
    }

    /// Admit a URL.
    ///
    /// The dedup insert and the frontier push commit in one write transaction:
    /// of any number of concurrent callers, on this handle or any other handle
    /// on the same database file, exactly one sees `Enqueued`.
    pub fn admit(&self, raw: &str) -> Result<Admission> {
        let url = match self.policy.normalize(raw) {
            Ok(url) => url,
            Err(rejection) => {
                debug!("Rejected {}: {}", raw, rejection);
                return Ok(Admission::Rejected(rejection));
            }
        };

        let inserted = self.db.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO seen_urls (url, admitted_at) VALUES (?1, ?2)",
                params![&url, now_millis()],
            )?;
            if inserted == 1 {
                queue::publish_in(&tx, self.queue.name(), &url)?;
            }
            tx.commit()?;
            Ok(inserted == 1)
        })?;

        if inserted {
            debug!("Admitted {}", url);
            Ok(Admission::Enqueued(url))
        } else {
            Ok(Admission::Duplicate(url))
        }
    }

    /// Lease the next pending URL.
    pub fn take(&self) -> Result<Option<Entry>> {
        Ok(self.queue.take(self.lease)?.map(|delivery| Entry {
            url: delivery.payload.clone(),
            delivery,
        }))
    }

    /// Acknowledge a finished attempt.
    pub fn complete(&self, entry: Entry, outcome: Outcome) -> Result<Ack> {
        self.queue.complete(&entry.delivery, outcome, &self.retry)
    }

    pub fn is_seen(&self, raw: &str) -> Result<bool> {
        let Ok(url) = self.policy.normalize(raw) else {
            return Ok(false);
        };
        let found = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT 1 FROM seen_urls WHERE url = ?1",
                params![&url],
                |_| Ok(()),
            )
            .optional()
        })?;
        Ok(found.is_some())
    }

    pub fn stats(&self) -> Result<FrontierStats> {
        let seen: i64 = self.db.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM seen_urls", [], |row| row.get(0))
        })?;
        Ok(FrontierStats {
            seen: seen as u64,
            queue: self.queue.stats()?,
        })
    }
}
