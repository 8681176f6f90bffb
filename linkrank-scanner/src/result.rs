use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A fetched HTML page reduced to what the pipeline needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub status_code: u16,
    pub content_type: Option<String>,
    pub response_time: Duration,
    pub title: Option<String>,
    /// Visible text with scripts and styles removed, whitespace collapsed.
    pub content: String,
    /// Absolute link targets with fragments stripped, in document order,
    /// without duplicates.
    pub links: Vec<String>,
}

impl FetchedPage {
    pub fn new(url: String) -> Self {
        Self {
            url,
            status_code: 0,
            content_type: None,
            response_time: Duration::from_secs(0),
            title: None,
            content: String::new(),
            links: Vec::new(),
        }
    }
}

/// What a single fetch attempt produced.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Page(FetchedPage),
    /// The response was fine but not `text/html`.
    NotHtml {
        url: String,
        content_type: Option<String>,
    },
}

impl FetchOutcome {
    pub fn url(&self) -> &str {
        match self {
            FetchOutcome::Page(page) => &page.url,
            FetchOutcome::NotHtml { url, .. } => url,
        }
    }
}
