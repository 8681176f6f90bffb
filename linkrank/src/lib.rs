pub mod handlers;

// Re-export commonly used handler functions for convenience
pub use handlers::{
    display_path, expand_path, format_crawl_summary, format_stats, load_pipeline_config,
    load_urls_from_file, load_urls_from_source, parse_url_line, seed_frontier,
};

// Re-export crawl functionality from linkrank-core
pub use linkrank_core::crawl::{
    CrawlContext, CrawlProgressCallback, CrawlResultCallback, CrawlSummary, execute_crawl,
};
