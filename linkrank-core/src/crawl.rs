//! Crawl worker pool.
//!
//! Each worker repeatedly leases a URL from the frontier, fetches it, sends
//! the page text to the content queue, appends the page's cross-domain edges
//! to its own edge shard, admits discovered links and acknowledges the entry.

use crate::config::{CrawlConfig, FollowMode};
use crate::error::{CoreError, Result};
use crate::frontier::{Admission, Frontier};
use crate::graph::{EdgeLog, EdgeWriter};
use crate::model::ContentMessage;
use crate::queue::{Ack, Outcome, WorkQueue};
use crate::urls::is_cross_domain;
use futures::future::join_all;
use linkrank_scanner::{FetchOutcome, Fetcher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const UNTITLED: &str = "Untitled";

/// Everything a worker needs. Shared by all workers of a crawl.
pub struct CrawlContext {
    pub frontier: Arc<Frontier>,
    pub content: WorkQueue,
    pub edges: EdgeLog,
    pub fetcher: Fetcher,
}

/// Callback for reporting which URL a worker picked up
pub type CrawlProgressCallback = Arc<dyn Fn(usize, String) + Send + Sync>;

/// Callback for reporting individual results as they come in
pub type CrawlResultCallback = Arc<dyn Fn(ProcessedEntry) + Send + Sync>;

/// Result of one attempt at one frontier entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedEntry {
    pub url: String,
    pub outcome: Outcome,
    pub edges_recorded: usize,
    pub admitted: usize,
    pub error: Option<String>,
}

impl ProcessedEntry {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            outcome: Outcome::Failure,
            edges_recorded: 0,
            admitted: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub edges_recorded: usize,
    pub admitted: usize,
    pub lease_lost: usize,
}

impl CrawlSummary {
    fn record(&mut self, entry: &ProcessedEntry) {
        self.processed += 1;
        match entry.outcome {
            Outcome::Success => self.succeeded += 1,
            Outcome::Skip => self.skipped += 1,
            Outcome::Failure => self.failed += 1,
        }
        self.edges_recorded += entry.edges_recorded;
        self.admitted += entry.admitted;
    }

    fn merge(&mut self, other: CrawlSummary) {
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.edges_recorded += other.edges_recorded;
        self.admitted += other.admitted;
        self.lease_lost += other.lease_lost;
    }
}

/// Run `options.workers` workers until `shutdown` flips to `true`, or until
/// the frontier drains when `options.exit_when_idle` is set.
///
/// Shutdown is graceful: a worker finishes and acknowledges its current
/// entry before exiting.
pub async fn execute_crawl(
    ctx: Arc<CrawlContext>,
    options: CrawlConfig,
    shutdown: watch::Receiver<bool>,
    progress_callback: Option<CrawlProgressCallback>,
    result_callback: Option<CrawlResultCallback>,
) -> Result<CrawlSummary> {
    let workers = options.workers.max(1);
    info!("Starting crawl with {} workers", workers);

    let mut worker_handles = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let ctx = ctx.clone();
        let options = options.clone();
        let shutdown = shutdown.clone();
        let progress_cb = progress_callback.clone();
        let result_cb = result_callback.clone();

        let handle = tokio::spawn(async move {
            run_worker(worker_id, ctx, options, shutdown, progress_cb, result_cb).await
        });
        worker_handles.push(handle);
    }

    let mut summary = CrawlSummary::default();
    for joined in join_all(worker_handles).await {
        summary.merge(joined??);
    }

    info!(
        "Crawl stopped. {} processed ({} ok, {} skipped, {} failed), {} edges, {} new URLs",
        summary.processed,
        summary.succeeded,
        summary.skipped,
        summary.failed,
        summary.edges_recorded,
        summary.admitted
    );
    Ok(summary)
}

async fn run_worker(
    worker_id: usize,
    ctx: Arc<CrawlContext>,
    options: CrawlConfig,
    mut shutdown: watch::Receiver<bool>,
    progress_cb: Option<CrawlProgressCallback>,
    result_cb: Option<CrawlResultCallback>,
) -> Result<CrawlSummary> {
    debug!("Worker {} started", worker_id);
    let mut writer = ctx.edges.writer();
    let mut summary = CrawlSummary::default();
    let mut idle_polls = 0usize;
    let idle_poll = Duration::from_millis(options.idle_poll_ms);
    let politeness = Duration::from_millis(options.politeness_delay_ms);

    while !*shutdown.borrow() {
        let entry = match ctx.frontier.take() {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Worker {} could not take from the frontier: {}", worker_id, e);
                if !pause(&mut shutdown, idle_poll).await {
                    break;
                }
                continue;
            }
        };

        let Some(entry) = entry else {
            // Idle means nothing is leased (a busy worker may still admit new
            // URLs) and nothing is waiting out a retry backoff.
            let others_busy = ctx
                .frontier
                .stats()
                .map(|s| s.queue.leased > 0 || s.queue.pending > 0)
                .unwrap_or(true);
            idle_polls = if others_busy { 0 } else { idle_polls + 1 };

            if options.exit_when_idle && idle_polls >= options.max_idle_polls {
                debug!("Worker {} found the frontier drained, exiting", worker_id);
                break;
            }
            if !pause(&mut shutdown, idle_poll).await {
                break;
            }
            continue;
        };
        idle_polls = 0;
        if entry.deliveries() > 1 {
            debug!("Worker {} retrying {} (delivery {})", worker_id, entry.url, entry.deliveries());
        }

        if let Some(ref callback) = progress_cb {
            callback(worker_id, entry.url.clone());
        }

        let processed = process_entry(&ctx, &mut writer, &entry.url, options.follow_mode).await;

        match ctx.frontier.complete(entry, processed.outcome) {
            Ok(Ack::LeaseLost) => summary.lease_lost += 1,
            Ok(_) => {}
            Err(e) => warn!("Worker {} could not acknowledge {}: {}", worker_id, processed.url, e),
        }
        summary.record(&processed);

        if let Some(ref callback) = result_cb {
            callback(processed);
        }

        if !politeness.is_zero() && !pause(&mut shutdown, politeness).await {
            break;
        }
    }

    debug!("Worker {} finished", worker_id);
    Ok(summary)
}

/// Sleep for `duration` unless shutdown is signalled first. Returns `false`
/// when the worker should stop.
async fn pause(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => !*shutdown.borrow(),
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

/// Handle one frontier entry. Never fails: every problem is folded into the
/// returned outcome or logged.
pub async fn process_entry(
    ctx: &CrawlContext,
    writer: &mut EdgeWriter,
    url: &str,
    follow_mode: FollowMode,
) -> ProcessedEntry {
    let mut processed = ProcessedEntry::new(url);

    let page = match ctx.fetcher.fetch(url).await {
        Ok(FetchOutcome::Page(page)) => page,
        Ok(FetchOutcome::NotHtml { content_type, .. }) => {
            info!("Skipping non-HTML {} ({})", url, content_type.as_deref().unwrap_or("unknown"));
            processed.outcome = Outcome::Skip;
            return processed;
        }
        Err(e) => {
            if e.is_transient() {
                warn!("Fetch failed for {}: {}", url, e);
            } else {
                info!("Giving up on {}: {}", url, e);
            }
            processed.outcome = Outcome::Failure;
            processed.error = Some(e.to_string());
            return processed;
        }
    };

    if !page.content.is_empty() {
        let message = ContentMessage {
            url: url.to_string(),
            title: page.title.clone().unwrap_or_else(|| UNTITLED.to_string()),
            content: page.content.clone(),
        };
        let published = serde_json::to_string(&message)
            .map_err(CoreError::from)
            .and_then(|payload| ctx.content.publish(&payload));
        if let Err(e) = published {
            warn!("Could not queue content of {} for indexing: {}", url, e);
        }
    }

    match writer.record_edges(url, page.links.iter().map(String::as_str)) {
        Ok(count) => processed.edges_recorded = count,
        Err(e) => warn!("Could not record edges from {}: {}", url, e),
    }

    for link in &page.links {
        if follow_mode == FollowMode::CrossDomain && !is_cross_domain(url, link) {
            continue;
        }
        match ctx.frontier.admit(link) {
            Ok(Admission::Enqueued(_)) => processed.admitted += 1,
            Ok(_) => {}
            Err(e) => warn!("Could not admit {}: {}", link, e),
        }
    }

    processed.outcome = Outcome::Success;
    processed
}
