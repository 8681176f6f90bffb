//! Link graph accumulation.
//!
//! Edges are appended to per-writer shard files under one directory, so any
//! number of crawl workers (in this process or others) write without
//! coordinating. Reading unions every shard and deduplicates.

use crate::error::Result;
use crate::urls::{UrlPolicy, is_cross_domain};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

const SHARD_EXTENSION: &str = "edges";
/// Per-batch files written by earlier versions of the pipeline.
const LEGACY_EXTENSION: &str = "txt";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Edge {
    pub source: String,
    pub destination: String,
}

impl Edge {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }

    /// Parse a `"source destination"` line.
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let source = parts.next()?;
        let destination = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(source, destination))
    }
}

/// The accumulated edge store.
#[derive(Debug, Clone)]
pub struct EdgeLog {
    dir: PathBuf,
    policy: UrlPolicy,
}

impl EdgeLog {
    pub fn open(dir: &Path, policy: UrlPolicy) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            policy,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// A new writer with its own shard file. The file is created with the
    /// first recorded batch.
    pub fn writer(&self) -> EdgeWriter {
        let path = self
            .dir
            .join(format!("{}.{}", Uuid::new_v4(), SHARD_EXTENSION));
        EdgeWriter {
            file: None,
            path,
            policy: self.policy.clone(),
        }
    }

    fn shard_paths(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_shard = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext == SHARD_EXTENSION || ext == LEGACY_EXTENSION)
                .unwrap_or(false);
            if is_shard && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    pub fn shard_count(&self) -> Result<usize> {
        Ok(self.shard_paths()?.len())
    }

    /// Every distinct edge recorded in shards present when this is called.
    ///
    /// Lines without a terminating newline are a write that was still in
    /// flight or torn by a crash and are ignored, as are malformed lines.
    pub fn snapshot(&self) -> Result<BTreeSet<Edge>> {
        let mut edges = BTreeSet::new();
        let mut malformed = 0usize;

        for path in self.shard_paths()? {
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let text = String::from_utf8_lossy(&bytes);

            for line in text.split_inclusive('\n') {
                let Some(line) = line.strip_suffix('\n') else {
                    debug!("Ignoring unterminated line in {}", path.display());
                    continue;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match Edge::parse_line(line) {
                    Some(edge) => {
                        edges.insert(edge);
                    }
                    None => malformed += 1,
                }
            }
        }

        if malformed > 0 {
            warn!("Skipped {} malformed edge lines in {}", malformed, self.dir.display());
        }
        Ok(edges)
    }
}

/// Append handle owned by a single writer.
pub struct EdgeWriter {
    file: Option<File>,
    path: PathBuf,
    policy: UrlPolicy,
}

impl EdgeWriter {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append the edges from one page.
    ///
    /// Destinations that fail the URL policy or share the source's
    /// registrable domain are dropped. The batch goes to disk as one write.
    /// Returns the number of edges written.
    pub fn record_edges<'a, I>(&mut self, source: &str, destinations: I) -> Result<usize>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let source = match self.policy.normalize(source) {
            Ok(source) => source,
            Err(rejection) => {
                debug!("Not recording edges from {}: {}", source, rejection);
                return Ok(0);
            }
        };

        let kept: BTreeSet<String> = destinations
            .into_iter()
            .filter_map(|d| self.policy.normalize(d).ok())
            .filter(|d| is_cross_domain(&source, d))
            .collect();

        if kept.is_empty() {
            return Ok(0);
        }

        let mut batch = String::new();
        for destination in &kept {
            batch.push_str(&source);
            batch.push(' ');
            batch.push_str(destination);
            batch.push('\n');
        }

        let file = match self.file.take() {
            Some(file) => file,
            None => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?;
                debug!("Opened edge shard {}", self.path.display());
                file
            }
        };
        let file = self.file.insert(file);
        file.write_all(batch.as_bytes())?;
        file.sync_data()?;
        debug!("Recorded {} edges from {}", kept.len(), source);
        Ok(kept.len())
    }
}

/// Link graph built from an edge snapshot. Immutable once built.
pub struct LinkGraph {
    graph: DiGraph<String, ()>,
}

impl LinkGraph {
    pub fn from_edges<'a, I>(edges: I) -> Self
    where
        I: IntoIterator<Item = &'a Edge>,
    {
        let mut graph = DiGraph::new();
        let mut index: HashMap<&'a str, NodeIndex> = HashMap::new();
        let mut seen_edges = BTreeSet::new();

        for edge in edges {
            let s = *index
                .entry(edge.source.as_str())
                .or_insert_with(|| graph.add_node(edge.source.clone()));
            let t = *index
                .entry(edge.destination.as_str())
                .or_insert_with(|| graph.add_node(edge.destination.clone()));
            if seen_edges.insert((s, t)) {
                graph.add_edge(s, t, ());
            }
        }

        Self { graph }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn urls(&self) -> impl Iterator<Item = &str> {
        self.graph.node_weights().map(String::as_str)
    }

    pub fn out_degree(&self, i: usize) -> usize {
        self.graph
            .neighbors_directed(NodeIndex::new(i), Direction::Outgoing)
            .count()
    }

    /// Destinations grouped by source, for every node with outgoing edges.
    /// Node indices are positions in `urls()`.
    pub fn adjacency(&self) -> Vec<(usize, Vec<usize>)> {
        self.graph
            .node_indices()
            .filter_map(|s| {
                let mut destinations: Vec<usize> = self
                    .graph
                    .neighbors_directed(s, Direction::Outgoing)
                    .map(|t| t.index())
                    .collect();
                if destinations.is_empty() {
                    return None;
                }
                destinations.sort_unstable();
                Some((s.index(), destinations))
            })
            .collect()
    }
}
