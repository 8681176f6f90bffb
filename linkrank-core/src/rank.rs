//! Iterative link ranking.
//!
//! Each round is a map/shuffle/reduce over the link graph: sources are joined
//! with their current rank and emit `rank / out_degree` to every destination
//! (map), contributions are grouped by destination (shuffle) and summed
//! (reduce), then damped:
//!
//! ```text
//! new_rank[t] = (1 - d) + d * sum(contributions to t)
//! ```
//!
//! Every node starts at `1.0`, not `1 / N`, and dangling nodes (no outgoing
//! edges) do not redistribute their mass. Both differ from textbook PageRank
//! and are kept for compatibility with scores already in the index.

use crate::config::RankConfig;
use crate::error::{CoreError, Result};
use crate::graph::{EdgeLog, LinkGraph};
use crate::scores::{RankVector, write_snapshot};
use rayon::prelude::*;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Run `config.iterations` rounds over `graph`. Returns one rank per node,
/// indexed like `graph.urls()`.
pub fn compute_ranks(graph: &LinkGraph, config: &RankConfig) -> Vec<f64> {
    compute_ranks_with_progress(graph, config, |_, _| {})
}

pub fn compute_ranks_with_progress<F>(graph: &LinkGraph, config: &RankConfig, on_round: F) -> Vec<f64>
where
    F: Fn(usize, usize),
{
    let n = graph.node_count();
    let adjacency = graph.adjacency();
    let d = config.damping;
    let mut ranks = vec![1.0_f64; n];

    for round in 0..config.iterations {
        let contributions = contributions(&adjacency, &ranks);
        let sums = reduce_by_destination(n, contributions);
        ranks = sums.into_iter().map(|sum| (1.0 - d) + d * sum).collect();

        debug!("Finished round {}/{}", round + 1, config.iterations);
        on_round(round + 1, config.iterations);
    }

    ranks
}

/// Map stage: `(destination, rank[source] / deg(source))` for every edge.
fn contributions(adjacency: &[(usize, Vec<usize>)], ranks: &[f64]) -> Vec<(usize, f64)> {
    adjacency
        .par_iter()
        .flat_map_iter(|(source, destinations)| {
            let share = ranks[*source] / destinations.len() as f64;
            destinations.iter().map(move |&destination| (destination, share))
        })
        .collect()
}

/// Reduce stage. Nodes nobody links to end up with a sum of zero.
fn reduce_by_destination(n: usize, contributions: Vec<(usize, f64)>) -> Vec<f64> {
    let mut sums = vec![0.0_f64; n];
    for (destination, share) in contributions {
        sums[destination] += share;
    }
    sums
}

/// Exclusive marker for a ranking run. Removed on drop.
pub struct RankLock {
    path: PathBuf,
}

impl RankLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                Ok(Self {
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(CoreError::RankInProgress(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for RankLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Could not remove rank lock {}: {}", self.path.display(), e);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankReport {
    pub nodes: usize,
    pub edges: usize,
    pub rounds: usize,
    pub snapshot: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RankOutcome {
    /// No edges yet; the existing snapshot was left alone.
    EmptyGraph,
    Completed(RankReport),
}

/// Batch job turning the accumulated edges into a score snapshot.
pub struct RankEngine {
    edges: EdgeLog,
    snapshot_path: PathBuf,
    lock_path: PathBuf,
    config: RankConfig,
}

impl RankEngine {
    pub fn new(edges: EdgeLog, snapshot_path: &Path, lock_path: &Path, config: RankConfig) -> Self {
        Self {
            edges,
            snapshot_path: snapshot_path.to_path_buf(),
            lock_path: lock_path.to_path_buf(),
            config,
        }
    }

    pub fn config(&self) -> &RankConfig {
        &self.config
    }

    pub fn run(&self) -> Result<RankOutcome> {
        self.run_with_progress(|_, _| {})
    }

    pub fn run_with_progress<F>(&self, on_round: F) -> Result<RankOutcome>
    where
        F: Fn(usize, usize),
    {
        let _lock = RankLock::acquire(&self.lock_path)?;

        let edges = self.edges.snapshot()?;
        if edges.is_empty() {
            info!("No link data to rank; keeping the current snapshot");
            return Ok(RankOutcome::EmptyGraph);
        }

        let graph = LinkGraph::from_edges(&edges);
        info!(
            "Ranking {} pages over {} links, {} rounds, damping {}",
            graph.node_count(),
            graph.edge_count(),
            self.config.iterations,
            self.config.damping
        );

        let ranks = compute_ranks_with_progress(&graph, &self.config, on_round);
        let vector: RankVector = graph
            .urls()
            .zip(ranks)
            .map(|(url, rank)| (url.to_string(), rank))
            .collect();

        write_snapshot(&self.snapshot_path, &vector)?;
        info!(
            "Wrote {} scores to {}",
            vector.len(),
            self.snapshot_path.display()
        );

        Ok(RankOutcome::Completed(RankReport {
            nodes: graph.node_count(),
            edges: graph.edge_count(),
            rounds: self.config.iterations,
            snapshot: self.snapshot_path.clone(),
        }))
    }
}
