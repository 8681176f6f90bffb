// Tests for URL admission across threads and store handles

use linkrank_core::config::FrontierConfig;
use linkrank_core::data::Database;
use linkrank_core::frontier::{Admission, Frontier};
use linkrank_core::queue::Outcome;
use linkrank_core::urls::UrlPolicy;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;

fn open_frontier(db_path: &Path) -> Frontier {
    let db = Database::new(db_path).unwrap();
    Frontier::new(
        Arc::new(db),
        "url_frontier",
        UrlPolicy::default(),
        &FrontierConfig::default(),
    )
}

// ============================================================================
// Concurrent Admission Tests
// ============================================================================

#[test]
fn test_concurrent_admit_from_separate_handles_enqueues_once() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("frontier.db");
    // Create the schema up front so every handle starts from the same file
    let primary = open_frontier(&db_path);

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let db_path = db_path.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let frontier = open_frontier(&db_path);
                barrier.wait();
                // Every thread submits a different spelling of the same URL
                let raw = if i % 2 == 0 {
                    "http://shared.com/page"
                } else {
                    "http://shared.com/page#section"
                };
                frontier.admit(raw).unwrap()
            })
        })
        .collect();

    let results: Vec<Admission> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let enqueued = results.iter().filter(|a| a.is_enqueued()).count();
    let duplicates = results
        .iter()
        .filter(|a| matches!(a, Admission::Duplicate(_)))
        .count();

    assert_eq!(enqueued, 1);
    assert_eq!(duplicates, threads - 1);

    let stats = primary.stats().unwrap();
    assert_eq!(stats.seen, 1);
    assert_eq!(stats.queue.pending, 1);
}

#[test]
fn test_concurrent_admit_of_overlapping_batches() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("frontier.db");
    let primary = open_frontier(&db_path);

    let urls: Vec<String> = (0..40).map(|i| format!("http://site{}.com/", i)).collect();
    let threads = 4;

    let handles: Vec<_> = (0..threads)
        .map(|offset| {
            let db_path = db_path.clone();
            let mut batch = urls.clone();
            batch.rotate_left(offset * 10);
            thread::spawn(move || {
                let frontier = open_frontier(&db_path);
                batch
                    .iter()
                    .filter(|url| frontier.admit(url).unwrap().is_enqueued())
                    .count()
            })
        })
        .collect();

    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, urls.len());
    assert_eq!(primary.stats().unwrap().queue.pending, urls.len() as u64);
}

#[test]
fn test_concurrent_take_delivers_each_url_once() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("frontier.db");
    let primary = open_frontier(&db_path);
    for i in 0..30 {
        primary.admit(&format!("http://site{}.com/", i)).unwrap();
    }

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let db_path = db_path.clone();
            thread::spawn(move || {
                let frontier = open_frontier(&db_path);
                let mut taken = Vec::new();
                while let Some(entry) = frontier.take().unwrap() {
                    taken.push(entry.url.clone());
                    frontier.complete(entry, Outcome::Success).unwrap();
                }
                taken
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }
    let distinct: HashSet<_> = all.iter().collect();

    assert_eq!(all.len(), 30);
    assert_eq!(distinct.len(), 30);

    let stats = primary.stats().unwrap();
    assert_eq!(stats.queue.pending, 0);
    assert_eq!(stats.queue.succeeded, 30);
}

// ============================================================================
// Persistence Tests
// ============================================================================

#[test]
fn test_dedup_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("frontier.db");

    {
        let frontier = open_frontier(&db_path);
        assert!(frontier.admit("http://a.com/x").unwrap().is_enqueued());
    }

    let reopened = open_frontier(&db_path);
    assert!(matches!(
        reopened.admit("http://a.com/x/").unwrap(),
        Admission::Duplicate(_)
    ));
    assert!(reopened.is_seen("http://a.com/x").unwrap());
}
