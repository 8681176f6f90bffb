//! Durable work queue with leased, at-least-once delivery.
//!
//! A message is delivered to one consumer at a time under a lease. Until the
//! consumer acknowledges it with [`WorkQueue::complete`], the lease may expire
//! and the message becomes deliverable again, so a crashed or stalled consumer
//! never loses work.

use crate::data::{Database, now_millis};
use crate::error::Result;
use rusqlite::{OptionalExtension, Transaction, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// How an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// Policy filter, e.g. the page was not HTML.
    Skip,
    /// Transient error while processing.
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Skip => "skip",
            Outcome::Failure => "failure",
        }
    }
}

/// Result of acknowledging a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    Completed,
    /// A failure with delivery budget left; the message comes back later.
    Requeued { retry_in: Duration },
    /// The lease was taken over by another consumer; nothing was changed.
    LeaseLost,
}

/// What to do with failed deliveries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total deliveries allowed, the first one included. `1` means failures
    /// are terminal.
    pub max_deliveries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn terminal() -> Self {
        Self {
            max_deliveries: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Backoff before delivery number `deliveries + 1`.
    pub fn backoff_after(&self, deliveries: u32) -> Duration {
        let exponent = deliveries.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::terminal()
    }
}

/// A leased message. Hand it back to [`WorkQueue::complete`] exactly once.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: i64,
    pub payload: String,
    /// Number of times this message has been handed out, this one included.
    pub deliveries: u32,
    lease_token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub leased: u64,
    pub succeeded: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn done(&self) -> u64 {
        self.succeeded + self.skipped + self.failed
    }
}

#[derive(Clone)]
pub struct WorkQueue {
    db: Arc<Database>,
    name: String,
}

impl WorkQueue {
    pub fn new(db: Arc<Database>, name: impl Into<String>) -> Self {
        Self {
            db,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn publish(&self, payload: &str) -> Result<i64> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let id = publish_in(&tx, &self.name, payload)?;
            tx.commit()?;
            Ok(id)
        })
    }

    /// Lease the oldest deliverable message for `lease`.
    pub fn take(&self, lease: Duration) -> Result<Option<Delivery>> {
        let delivery = self.db.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = now_millis();

            let candidate: Option<(i64, String, u32, String)> = tx
                .query_row(
                    "SELECT id, payload, deliveries, state FROM queue_messages
                     WHERE queue = ?1 AND state IN ('pending', 'leased') AND visible_at <= ?2
                     ORDER BY visible_at, id LIMIT 1",
                    params![&self.name, now],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;

            let Some((id, payload, deliveries, state)) = candidate else {
                return Ok(None);
            };

            if state == "leased" {
                warn!(
                    queue = %self.name,
                    id,
                    "Lease expired after {} deliveries, redelivering",
                    deliveries
                );
            }

            let lease_token = Uuid::new_v4().to_string();
            let expires_at = now.saturating_add(lease.as_millis() as i64);
            tx.execute(
                "UPDATE queue_messages
                 SET state = 'leased', lease_token = ?1, visible_at = ?2, deliveries = deliveries + 1
                 WHERE id = ?3",
                params![&lease_token, expires_at, id],
            )?;
            tx.commit()?;

            Ok(Some(Delivery {
                id,
                payload,
                deliveries: deliveries + 1,
                lease_token,
            }))
        })?;

        if let Some(ref d) = delivery {
            debug!(queue = %self.name, id = d.id, "Leased message");
        }
        Ok(delivery)
    }

    /// Acknowledge a delivery. Only the current lease holder can do this.
    pub fn complete(
        &self,
        delivery: &Delivery,
        outcome: Outcome,
        retry: &RetryPolicy,
    ) -> Result<Ack> {
        let now = now_millis();
        let requeue = outcome == Outcome::Failure && delivery.deliveries < retry.max_deliveries;

        let (changed, ack) = if requeue {
            let retry_in = retry.backoff_after(delivery.deliveries);
            let changed = self.db.with_conn(|conn| {
                conn.execute(
                    "UPDATE queue_messages
                     SET state = 'pending', lease_token = NULL, visible_at = ?1
                     WHERE id = ?2 AND state = 'leased' AND lease_token = ?3",
                    params![
                        now.saturating_add(retry_in.as_millis() as i64),
                        delivery.id,
                        &delivery.lease_token
                    ],
                )
            })?;
            (changed, Ack::Requeued { retry_in })
        } else {
            let changed = self.db.with_conn(|conn| {
                conn.execute(
                    "UPDATE queue_messages
                     SET state = 'done', outcome = ?1, lease_token = NULL, completed_at = ?2
                     WHERE id = ?3 AND state = 'leased' AND lease_token = ?4",
                    params![outcome.as_str(), now, delivery.id, &delivery.lease_token],
                )
            })?;
            (changed, Ack::Completed)
        };

        if changed == 0 {
            warn!(queue = %self.name, id = delivery.id, "Acknowledged a lease that is no longer held");
            return Ok(Ack::LeaseLost);
        }
        Ok(ack)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT state, COALESCE(outcome, ''), COUNT(*) FROM queue_messages
                 WHERE queue = ?1 GROUP BY state, outcome",
            )?;
            let rows = stmt
                .query_map(params![&self.name], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut stats = QueueStats::default();
            for (state, outcome, count) in rows {
                let count = count as u64;
                match (state.as_str(), outcome.as_str()) {
                    ("pending", _) => stats.pending += count,
                    ("leased", _) => stats.leased += count,
                    (_, "success") => stats.succeeded += count,
                    (_, "skip") => stats.skipped += count,
                    _ => stats.failed += count,
                }
            }
            Ok(stats)
        })
    }
}

/// Append a message inside an open transaction.
pub(crate) fn publish_in(tx: &Transaction<'_>, queue: &str, payload: &str) -> rusqlite::Result<i64> {
    let now = now_millis();
    tx.execute(
        "INSERT INTO queue_messages (queue, payload, state, visible_at, enqueued_at)
         VALUES (?1, ?2, 'pending', ?3, ?3)",
        params![queue, payload, now],
    )?;
    Ok(tx.last_insert_rowid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_queue() -> (TempDir, WorkQueue) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("queue.db")).unwrap();
        (temp_dir, WorkQueue::new(Arc::new(db), "test_queue"))
    }

    const LEASE: Duration = Duration::from_secs(60);

    #[test]
    fn test_publish_take_complete() {
        let (_temp_dir, queue) = create_test_queue();
        queue.publish("one").unwrap();
        queue.publish("two").unwrap();

        let first = queue.take(LEASE).unwrap().unwrap();
        assert_eq!(first.payload, "one");
        assert_eq!(first.deliveries, 1);

        let second = queue.take(LEASE).unwrap().unwrap();
        assert_eq!(second.payload, "two");

        // Both are leased, nothing else is deliverable
        assert!(queue.take(LEASE).unwrap().is_none());

        assert_eq!(
            queue.complete(&first, Outcome::Success, &RetryPolicy::terminal()).unwrap(),
            Ack::Completed
        );
        assert_eq!(
            queue.complete(&second, Outcome::Skip, &RetryPolicy::terminal()).unwrap(),
            Ack::Completed
        );

        let stats = queue.stats().unwrap();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.leased, 0);
    }

    #[test]
    fn test_expired_lease_is_redelivered() {
        let (_temp_dir, queue) = create_test_queue();
        queue.publish("crashy").unwrap();

        let first = queue.take(Duration::ZERO).unwrap().unwrap();
        let second = queue.take(LEASE).unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.deliveries, 2);

        // The first holder lost its lease
        assert_eq!(
            queue.complete(&first, Outcome::Success, &RetryPolicy::terminal()).unwrap(),
            Ack::LeaseLost
        );
        assert_eq!(
            queue.complete(&second, Outcome::Success, &RetryPolicy::terminal()).unwrap(),
            Ack::Completed
        );
        assert!(queue.take(LEASE).unwrap().is_none());
    }

    #[test]
    fn test_complete_twice_is_rejected() {
        let (_temp_dir, queue) = create_test_queue();
        queue.publish("once").unwrap();
        let delivery = queue.take(LEASE).unwrap().unwrap();

        let policy = RetryPolicy::terminal();
        assert_eq!(
            queue.complete(&delivery, Outcome::Success, &policy).unwrap(),
            Ack::Completed
        );
        assert_eq!(
            queue.complete(&delivery, Outcome::Success, &policy).unwrap(),
            Ack::LeaseLost
        );
        assert_eq!(queue.stats().unwrap().succeeded, 1);
    }

    #[test]
    fn test_failure_is_terminal_by_default() {
        let (_temp_dir, queue) = create_test_queue();
        queue.publish("broken").unwrap();
        let delivery = queue.take(LEASE).unwrap().unwrap();

        assert_eq!(
            queue.complete(&delivery, Outcome::Failure, &RetryPolicy::default()).unwrap(),
            Ack::Completed
        );
        assert!(queue.take(LEASE).unwrap().is_none());
        assert_eq!(queue.stats().unwrap().failed, 1);
    }

    #[test]
    fn test_failure_is_retried_within_budget() {
        let (_temp_dir, queue) = create_test_queue();
        queue.publish("flaky").unwrap();
        let policy = RetryPolicy {
            max_deliveries: 2,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        };

        let first = queue.take(LEASE).unwrap().unwrap();
        assert_eq!(
            queue.complete(&first, Outcome::Failure, &policy).unwrap(),
            Ack::Requeued {
                retry_in: Duration::ZERO
            }
        );

        let second = queue.take(LEASE).unwrap().unwrap();
        assert_eq!(second.deliveries, 2);
        assert_eq!(
            queue.complete(&second, Outcome::Failure, &policy).unwrap(),
            Ack::Completed
        );
        assert_eq!(queue.stats().unwrap().failed, 1);
    }

    #[test]
    fn test_requeued_message_waits_for_backoff() {
        let (_temp_dir, queue) = create_test_queue();
        queue.publish("later").unwrap();
        let policy = RetryPolicy {
            max_deliveries: 3,
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(600),
        };

        let delivery = queue.take(LEASE).unwrap().unwrap();
        queue.complete(&delivery, Outcome::Failure, &policy).unwrap();
        assert!(queue.take(LEASE).unwrap().is_none());
        assert_eq!(queue.stats().unwrap().pending, 1);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_deliveries: 10,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
        };
        assert_eq!(policy.backoff_after(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_after(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_after(3), Duration::from_secs(4));
        assert_eq!(policy.backoff_after(4), Duration::from_secs(5));
    }

    #[test]
    fn test_queues_are_isolated() {
        let (_temp_dir, queue) = create_test_queue();
        let other = WorkQueue::new(queue.db.clone(), "other_queue");
        other.publish("elsewhere").unwrap();

        assert!(queue.take(LEASE).unwrap().is_none());
        assert_eq!(other.take(LEASE).unwrap().unwrap().payload, "elsewhere");
    }
}
