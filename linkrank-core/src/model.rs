use serde::{Deserialize, Serialize};

/// Message carried on the content queue from the crawl workers to the indexer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentMessage {
    pub url: String,
    pub title: String,
    pub content: String,
}

/// A document as handed to the search index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub url: String,
    pub title: String,
    pub content: String,
    pub rank_score: f64,
}

impl IndexedDocument {
    pub fn from_message(message: ContentMessage, rank_score: f64) -> Self {
        Self {
            url: message.url,
            title: message.title,
            content: message.content,
            rank_score,
        }
    }
}
