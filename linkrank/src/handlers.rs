use anyhow::{Context, Result, bail};
use clap::ArgMatches;
use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use linkrank_core::config::{CONFIG_FILE, FollowMode, PipelineConfig, RankConfig};
use linkrank_core::crawl::{
    CrawlContext, CrawlProgressCallback, CrawlResultCallback, CrawlSummary, ProcessedEntry,
    execute_crawl,
};
use linkrank_core::data::Database;
use linkrank_core::frontier::{Admission, Frontier, FrontierStats};
use linkrank_core::graph::EdgeLog;
use linkrank_core::index::{Indexer, SqliteDocumentIndex};
use linkrank_core::queue::{QueueStats, WorkQueue};
use linkrank_core::rank::{RankEngine, RankOutcome};
use linkrank_core::scores::ScoreStore;
use linkrank_scanner::Fetcher;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use url::Url;

// Helper functions for the seed handler

/// Load URLs from either a file or the `--url` arguments
pub fn load_urls_from_source(
    urls: &[Url],
    hosts_file: Option<&PathBuf>,
) -> Result<Vec<String>, String> {
    if let Some(hosts_file_path) = hosts_file {
        load_urls_from_file(hosts_file_path)
    } else if !urls.is_empty() {
        Ok(urls.iter().map(|url| url.as_str().to_string()).collect())
    } else {
        Err("Either --url or --hosts-file must be provided".to_string())
    }
}

/// Load and parse URLs from a file. Blank lines and `#` comments are skipped.
pub fn load_urls_from_file(path: &PathBuf) -> Result<Vec<String>, String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read hosts file {}: {}", path.display(), e))?;

    let urls: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(parse_url_line)
        .collect();

    if urls.is_empty() {
        return Err(format!("No valid URLs found in {}", path.display()));
    }

    Ok(urls)
}

/// Parse a single line as a URL, trying to add http:// if needed
pub fn parse_url_line(line: &str) -> Option<String> {
    if Url::parse(line).is_ok() {
        return Some(line.to_string());
    }

    let with_scheme = format!("http://{}", line);
    if Url::parse(&with_scheme).is_ok() {
        return Some(with_scheme);
    }

    eprintln!("{} Skipping invalid URL '{}'", "⚠".yellow(), line);
    None
}

/// Path component of a URL for compact progress output
pub fn display_path(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => {
            let path = parsed.path();
            let host = parsed.host_str().unwrap_or("");
            if path.is_empty() || path == "/" {
                format!("{}/", host)
            } else {
                format!("{}{}", host, path)
            }
        }
        Err(_) => url.to_string(),
    }
}

pub fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).as_ref())
}

/// Build the pipeline configuration for `data_dir`.
///
/// An explicit `config_file` wins; otherwise `<data_dir>/linkrank.json` is
/// used when it exists. The data directory always comes from the caller.
pub fn load_pipeline_config(data_dir: &Path, config_file: Option<&Path>) -> Result<PipelineConfig> {
    let default_file = data_dir.join(CONFIG_FILE);
    let file = match config_file {
        Some(path) => Some(path.to_path_buf()),
        None if default_file.exists() => Some(default_file),
        None => None,
    };

    let mut config = PipelineConfig::load(file.as_deref()).with_context(|| match &file {
        Some(path) => format!("Failed to load configuration from {}", path.display()),
        None => "Failed to load configuration".to_string(),
    })?;
    config.data_dir = data_dir.to_path_buf();
    Ok(config)
}

/// Admit every URL, returning what happened to each.
pub fn seed_frontier(frontier: &Frontier, urls: &[String]) -> Result<Vec<(String, Admission)>> {
    let mut admissions = Vec::with_capacity(urls.len());
    for url in urls {
        let admission = frontier
            .admit(url)
            .with_context(|| format!("Failed to admit {}", url))?;
        admissions.push((url.clone(), admission));
    }
    Ok(admissions)
}

pub fn format_crawl_summary(summary: &CrawlSummary) -> String {
    let mut report = String::new();
    report.push_str(&format!("{}\n", "━".repeat(60).bright_blue()));
    report.push_str(&format!("{}\n", "Summary:".bright_white().bold()));
    report.push_str(&format!("  Pages processed: {}\n", summary.processed));
    report.push_str(&format!("  Succeeded: {}\n", summary.succeeded));
    report.push_str(&format!("  Skipped (not HTML): {}\n", summary.skipped));
    report.push_str(&format!("  Failed: {}\n", summary.failed));
    report.push_str(&format!("  Cross-domain edges recorded: {}\n", summary.edges_recorded));
    report.push_str(&format!("  New URLs admitted: {}\n", summary.admitted));
    if summary.lease_lost > 0 {
        report.push_str(&format!(
            "  {} Late acknowledgements (lease expired): {}\n",
            "⚠".yellow(),
            summary.lease_lost
        ));
    }
    report
}

/// Counters across every store of one data directory.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub frontier: FrontierStats,
    pub content: QueueStats,
    pub documents: u64,
    pub edge_shards: usize,
    pub edges: usize,
    pub snapshot_version: u64,
    pub snapshot_entries: usize,
}

pub fn collect_stats(config: &PipelineConfig, db: Arc<Database>) -> Result<PipelineStats> {
    let frontier = Frontier::new(
        db.clone(),
        &config.frontier_queue,
        config.url_policy(),
        &config.frontier,
    );
    let content = WorkQueue::new(db.clone(), config.content_queue.clone());
    let documents = SqliteDocumentIndex::new(db);
    let edges = EdgeLog::open(&config.links_dir(), config.url_policy())?;
    let scores = ScoreStore::open(&config.snapshot_path(), config.rank.base_score());
    let snapshot = scores.snapshot();

    Ok(PipelineStats {
        frontier: frontier.stats()?,
        content: content.stats()?,
        documents: documents.count()?,
        edge_shards: edges.shard_count()?,
        edges: edges.snapshot()?.len(),
        snapshot_version: snapshot.version(),
        snapshot_entries: snapshot.len(),
    })
}

fn format_queue(name: &str, stats: &QueueStats) -> String {
    format!(
        "  {:<22} {} pending, {} leased, {} done ({} ok, {} skipped, {} failed)\n",
        name,
        stats.pending,
        stats.leased,
        stats.done(),
        stats.succeeded,
        stats.skipped,
        stats.failed
    )
}

pub fn format_stats(stats: &PipelineStats) -> String {
    let mut report = String::new();
    report.push_str(&format!("{}\n", "Frontier".bright_white().bold()));
    report.push_str(&format!("  {:<22} {}\n", "seen URLs", stats.frontier.seen));
    report.push_str(&format_queue("url_frontier", &stats.frontier.queue));
    report.push_str(&format!("\n{}\n", "Indexing".bright_white().bold()));
    report.push_str(&format_queue("content_for_indexing", &stats.content));
    report.push_str(&format!("  {:<22} {}\n", "documents", stats.documents));
    report.push_str(&format!("\n{}\n", "Link graph".bright_white().bold()));
    report.push_str(&format!("  {:<22} {}\n", "edge shards", stats.edge_shards));
    report.push_str(&format!("  {:<22} {}\n", "distinct edges", stats.edges));
    report.push_str(&format!("\n{}\n", "Scores".bright_white().bold()));
    if stats.snapshot_version == 0 {
        report.push_str("  no snapshot published yet\n");
    } else {
        report.push_str(&format!(
            "  {:<22} {} URLs\n",
            "snapshot",
            stats.snapshot_entries
        ));
    }
    report
}

fn print_divider() {
    println!("{}", "═".repeat(60).bright_blue().bold());
}

fn print_prompt(msg: &str) -> io::Result<String> {
    print!("{} ", msg.bright_cyan().bold());
    io::stdout().flush()?;
    let mut response = String::new();
    io::stdin().read_line(&mut response)?;
    Ok(response.trim().to_lowercase())
}

fn spinner_style() -> Result<ProgressStyle> {
    Ok(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}")?)
}

/// Receiver that flips to `true` on Ctrl-C.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    shutdown_on(async { tokio::signal::ctrl_c().await })
}

/// Receiver that flips to `true` once `signal` resolves. If the listener
/// fails the receiver stays open and `false`, so workers run until idle or
/// until the process is killed.
pub fn shutdown_on<F>(signal: F) -> watch::Receiver<bool>
where
    F: Future<Output = io::Result<()>> + Send + 'static,
{
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match signal.await {
            Ok(()) => {
                info!("Shutdown requested, finishing in-flight work");
                let _ = tx.send(true);
            }
            Err(e) => {
                warn!("Could not listen for Ctrl-C, stop the process to end early: {}", e);
                // Dropping the sender would close the channel, which workers
                // treat as shutdown
                std::future::pending::<()>().await;
            }
        }
    });
    rx
}

/// Remove the database, recorded links, published scores and any stale rank
/// lock under `config.data_dir`. Returns what was removed.
pub fn reset_pipeline_state(config: &PipelineConfig) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();

    let db_path = config.database_path();
    if Database::exists(&db_path) {
        Database::remove(&db_path)
            .with_context(|| format!("Failed to remove {}", db_path.display()))?;
        removed.push(db_path.clone());
    }
    for suffix in ["-wal", "-shm"] {
        let sidecar = PathBuf::from(format!("{}{}", db_path.display(), suffix));
        if sidecar.exists() {
            fs::remove_file(&sidecar)
                .with_context(|| format!("Failed to remove {}", sidecar.display()))?;
        }
    }

    let mut dirs = vec![config.links_dir()];
    dirs.extend(config.snapshot_path().parent().map(Path::to_path_buf));
    for dir in dirs {
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
            removed.push(dir);
        }
    }

    let lock = config.rank_lock_path();
    if lock.exists() {
        fs::remove_file(&lock).with_context(|| format!("Failed to remove {}", lock.display()))?;
        removed.push(lock);
    }

    Ok(removed)
}

async fn open_database(config: &PipelineConfig) -> Result<Arc<Database>> {
    if !config.data_dir.exists() {
        bail!(
            "No linkrank data at {}. Run `linkrank init` first.",
            config.data_dir.display()
        );
    }
    let db = Database::open_with_backoff(&config.database_path(), &config.store).await?;
    Ok(Arc::new(db))
}

pub fn handle_init(args: &ArgMatches, default_data_dir: &Path) -> Result<()> {
    print_divider();
    println!("{}", "  LINKRANK INITIALIZATION".bright_white().bold());
    print_divider();
    println!();

    let data_dir = match args.get_one::<String>("PATH") {
        Some(path) => expand_path(path),
        None => default_data_dir.to_path_buf(),
    };
    let force = args.get_flag("force");
    let config_path = data_dir.join(CONFIG_FILE);

    println!(
        "{} Target: {}",
        "→".blue(),
        data_dir.display().to_string().bright_white()
    );
    println!();

    let config = PipelineConfig {
        data_dir: data_dir.clone(),
        ..PipelineConfig::default()
    };
    let db_path = config.database_path();

    let existing = config_path.exists() || Database::exists(&db_path);
    if existing && !force {
        println!("{}", "⚠ WARNING".yellow().bold());
        println!("linkrank data already exists:");
        for path in [&config_path, &db_path] {
            if path.exists() {
                println!(
                    "  {} {}",
                    "•".yellow(),
                    path.display().to_string().bright_white()
                );
            }
        }
        println!();
        println!(
            "{}",
            "This operation will overwrite the configuration and drop all crawl state: the database, recorded links and published scores.".yellow()
        );

        let response = print_prompt("Do you want to continue? [y/N]:")?;
        println!();

        if response != "y" && response != "yes" {
            println!("{} Initialization cancelled.", "✗".red().bold());
            return Ok(());
        }
    }

    for removed in reset_pipeline_state(&config)? {
        println!(
            "{} Removed {}",
            "✓".green().bold(),
            removed.display().to_string().bright_white()
        );
    }

    println!("{} Creating directory structure...", "→".blue());
    for dir in [data_dir.clone(), config.links_dir()] {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        println!("  {} {}", "✓".green(), dir.display().to_string().bright_white());
    }
    if let Some(scores_dir) = config.snapshot_path().parent() {
        fs::create_dir_all(scores_dir)
            .with_context(|| format!("Failed to create {}", scores_dir.display()))?;
        println!(
            "  {} {}",
            "✓".green(),
            scores_dir.display().to_string().bright_white()
        );
    }

    let rendered = serde_json::to_string_pretty(&PipelineConfig {
        // data_dir is always supplied on the command line
        data_dir: PathBuf::from("."),
        ..config.clone()
    })?;
    fs::write(&config_path, rendered)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    println!(
        "{} Configuration written: {}",
        "✓".green().bold(),
        config_path.display().to_string().bright_white()
    );

    Database::new(&db_path)?;
    println!(
        "{} Database initialized: {}",
        "✓".green().bold(),
        db_path.display().to_string().bright_white()
    );

    println!();
    print_divider();
    println!("{}", "  INITIALIZATION COMPLETE".green().bold());
    print_divider();
    println!();
    Ok(())
}

pub async fn handle_seed(args: &ArgMatches, config: &PipelineConfig) -> Result<()> {
    let urls: Vec<Url> = args
        .get_many::<Url>("url")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    let hosts_file = args.get_one::<PathBuf>("hosts-file");

    let urls = load_urls_from_source(&urls, hosts_file).map_err(anyhow::Error::msg)?;

    let db = open_database(config).await?;
    let frontier = Frontier::new(
        db,
        &config.frontier_queue,
        config.url_policy(),
        &config.frontier,
    );

    let (mut enqueued, mut duplicate, mut rejected) = (0usize, 0usize, 0usize);
    for (raw, admission) in seed_frontier(&frontier, &urls)? {
        match admission {
            Admission::Enqueued(url) => {
                enqueued += 1;
                println!("  {} {}", "✓".green(), url);
            }
            Admission::Duplicate(url) => {
                duplicate += 1;
                println!("  {} {} {}", "•".blue(), url, "(already seen)".dimmed());
            }
            Admission::Rejected(reason) => {
                rejected += 1;
                println!("  {} {} {}", "✗".red(), raw, format!("({})", reason).dimmed());
            }
        }
    }

    println!(
        "\n{} {} admitted, {} already seen, {} rejected",
        "✓".green().bold(),
        enqueued,
        duplicate,
        rejected
    );
    Ok(())
}

pub async fn handle_crawl(args: &ArgMatches, config: &PipelineConfig) -> Result<()> {
    let mut options = config.crawl.clone();
    if let Some(threads) = args.get_one::<usize>("threads") {
        options.workers = *threads;
    }
    if args.get_flag("follow-all") {
        options.follow_mode = FollowMode::All;
    }
    if args.get_flag("until-idle") {
        options.exit_when_idle = true;
    }
    let timeout = args
        .get_one::<u64>("timeout")
        .map(|secs| Duration::from_secs(*secs))
        .unwrap_or_else(|| config.fetch.timeout());

    let db = open_database(config).await?;
    let frontier = Frontier::new(
        db.clone(),
        &config.frontier_queue,
        config.url_policy(),
        &config.frontier,
    );
    let pending = frontier.stats()?.queue.pending;
    let ctx = Arc::new(CrawlContext {
        frontier: Arc::new(frontier),
        content: WorkQueue::new(db, config.content_queue.clone()),
        edges: EdgeLog::open(&config.links_dir(), config.url_policy())?,
        fetcher: Fetcher::with_timeout(timeout, &config.fetch.user_agent)?,
    });

    println!("\n🕷️  Crawling from a frontier of {} pending URL(s)", pending);
    println!("Workers: {}", options.workers);
    let follow_mode_str = match options.follow_mode {
        FollowMode::CrossDomain => "cross-domain links only",
        FollowMode::All => "all links",
    };
    println!("Following: {}", follow_mode_str);
    println!(
        "Mode: {}\n",
        if options.exit_when_idle {
            "until the frontier is drained"
        } else {
            "continuous (Ctrl-C to stop)"
        }
    );

    let multi = MultiProgress::new();
    let style = spinner_style()?;
    let worker_bars: Arc<Vec<ProgressBar>> = Arc::new(
        (0..options.workers.max(1))
            .map(|i| {
                let pb = multi.add(ProgressBar::new_spinner());
                pb.set_style(style.clone());
                pb.enable_steady_tick(Duration::from_millis(100));
                pb.set_message(format!("Worker {}: idle", i));
                pb
            })
            .collect(),
    );
    let totals = multi.add(ProgressBar::new_spinner());
    totals.set_style(ProgressStyle::default_spinner().template("  {pos} pages processed")?);

    let bars = worker_bars.clone();
    let progress_callback: CrawlProgressCallback = Arc::new(move |worker_id: usize, url: String| {
        if let Some(pb) = bars.get(worker_id) {
            pb.set_message(format!("Worker {}: {}", worker_id, display_path(&url)));
        }
    });
    let totals_cb = totals.clone();
    let result_callback: CrawlResultCallback = Arc::new(move |_entry: ProcessedEntry| {
        totals_cb.inc(1);
    });

    let shutdown = shutdown_on_ctrl_c();
    let result = execute_crawl(
        ctx,
        options,
        shutdown,
        Some(progress_callback),
        Some(result_callback),
    )
    .await;

    for pb in worker_bars.iter() {
        pb.finish_and_clear();
    }
    totals.finish_and_clear();
    multi.clear()?;

    let summary = result.context("Crawl failed")?;
    println!("\n{} Crawl stopped\n", "✓".green().bold());
    print!("{}", format_crawl_summary(&summary));
    Ok(())
}

pub fn handle_rank(args: &ArgMatches, config: &PipelineConfig) -> Result<()> {
    let mut rank_config = config.rank.clone();
    if let Some(iterations) = args.get_one::<usize>("iterations") {
        rank_config.iterations = *iterations;
    }
    if let Some(damping) = args.get_one::<f64>("damping") {
        rank_config.damping = *damping;
    }
    if !(0.0..=1.0).contains(&rank_config.damping) {
        bail!(
            "Damping factor must be between 0 and 1, got {}",
            rank_config.damping
        );
    }

    let edges = EdgeLog::open(&config.links_dir(), config.url_policy())?;
    let engine = RankEngine::new(
        edges,
        &config.snapshot_path(),
        &config.rank_lock_path(),
        rank_config.clone(),
    );

    let bar = ProgressBar::new(rank_config.iterations as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.cyan} Round {pos}/{len} [{bar:40.cyan/blue}] {elapsed}")?
            .progress_chars("=> "),
    );

    let outcome = engine.run_with_progress(|round, _total| bar.set_position(round as u64));
    bar.finish_and_clear();

    match outcome.context("Ranking failed")? {
        RankOutcome::EmptyGraph => {
            println!(
                "{} No link data yet; the current score snapshot was left untouched",
                "⚠".yellow().bold()
            );
        }
        RankOutcome::Completed(report) => {
            println!("{} Ranking complete", "✓".green().bold());
            println!("  Pages: {}", report.nodes);
            println!("  Links: {}", report.edges);
            println!("  Rounds: {}", report.rounds);
            println!(
                "  Snapshot: {}",
                report.snapshot.display().to_string().bright_white()
            );
            if let Some(note) = damping_override_note(&config.rank, &rank_config) {
                println!("{}", note.dimmed());
            }
        }
    }
    Ok(())
}

/// `index` and `score` fall back to the configured `1 - rank.damping` for
/// URLs missing from the snapshot, whatever damping the last run used.
pub fn damping_override_note(configured: &RankConfig, run: &RankConfig) -> Option<String> {
    if (configured.damping - run.damping).abs() < f64::EPSILON {
        return None;
    }
    Some(format!(
        "  Note: unranked URLs still score {:.4} (1 - rank.damping); set rank.damping to {} to match this run",
        configured.base_score(),
        run.damping
    ))
}

pub async fn handle_index(args: &ArgMatches, config: &PipelineConfig) -> Result<()> {
    let mut index_config = config.index.clone();
    if args.get_flag("until-idle") {
        index_config.exit_when_idle = true;
    }

    let db = open_database(config).await?;
    let scores = Arc::new(ScoreStore::open(
        &config.snapshot_path(),
        config.rank.base_score(),
    ));
    let indexer = Indexer::new(
        WorkQueue::new(db.clone(), config.content_queue.clone()),
        scores,
        SqliteDocumentIndex::new(db),
        index_config,
    );

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(spinner_style()?);
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message("Indexing crawled content...");

    let result = indexer.run(shutdown_on_ctrl_c()).await;
    spinner.finish_and_clear();

    let summary = result.context("Indexer failed")?;
    println!(
        "{} {} indexed, {} dropped, {} failed",
        "✓".green().bold(),
        summary.indexed,
        summary.dropped,
        summary.failed
    );
    Ok(())
}

pub fn handle_score(args: &ArgMatches, config: &PipelineConfig) -> Result<()> {
    let Some(raw) = args.get_one::<String>("URL") else {
        bail!("A URL is required");
    };
    let url = config.url_policy().normalize(raw).unwrap_or_else(|_| raw.clone());

    let store = ScoreStore::open(&config.snapshot_path(), config.rank.base_score());
    let snapshot = store.snapshot();
    let score = snapshot.get(&url);

    println!("{} {:.6}", url.bright_white(), score);
    if snapshot.version() == 0 {
        println!("{}", "  (no snapshot published yet; default score)".dimmed());
    }
    Ok(())
}

pub async fn handle_stats(config: &PipelineConfig) -> Result<()> {
    let db = open_database(config).await?;
    let stats = collect_stats(config, db)?;
    print!("{}", format_stats(&stats));
    Ok(())
}
