use crate::error::{Result, ScanError};
use crate::result::{FetchOutcome, FetchedPage};
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::debug;
use url::Url;

pub const DEFAULT_USER_AGENT: &str = "linkrank/0.1 (+https://github.com/trapdoorsec/linkrank)";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Elements whose text never counts as page content.
const INVISIBLE_ELEMENTS: [&str; 3] = ["script", "style", "noscript"];

/// Single-page HTTP fetcher. One instance is shared by every crawl worker;
/// the underlying client pools connections.
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    timeout: Duration,
}

impl Fetcher {
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT, DEFAULT_USER_AGENT)
    }

    pub fn with_timeout(timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .connect_timeout(timeout / 2)
            .pool_max_idle_per_host(50)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;

        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fetch `url` and, when it is HTML, extract title, text and links.
    ///
    /// Network errors, timeouts and non-2xx statuses come back as `Err`.
    pub async fn fetch(&self, url: &str) -> Result<FetchOutcome> {
        debug!("Fetching {}", url);
        Url::parse(url).map_err(|e| ScanError::InvalidUrl(format!("{}: {}", url, e)))?;

        let start = Instant::now();
        let response = self.client.get(url).send().await?;
        let response_time = start.elapsed();

        let status = response.status();
        if !status.is_success() {
            return Err(ScanError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let is_html = content_type
            .as_ref()
            .map(|ct| ct.contains("text/html"))
            .unwrap_or(false);

        if !is_html {
            debug!("Skipping non-HTML {} ({:?})", url, content_type);
            return Ok(FetchOutcome::NotHtml {
                url: url.to_string(),
                content_type,
            });
        }

        let body = response.text().await?;

        let mut page = Self::parse_page(url, &body)?;
        page.status_code = status.as_u16();
        page.content_type = content_type;
        page.response_time = response_time;
        Ok(FetchOutcome::Page(page))
    }

    /// Extract title, visible text and outbound links from an HTML document.
    pub fn parse_page(url: &str, html: &str) -> Result<FetchedPage> {
        let document = Html::parse_document(html);
        let mut page = FetchedPage::new(url.to_string());

        let title_selector = selector("title")?;
        page.title = document
            .select(&title_selector)
            .next()
            .map(|t| collapse_whitespace(&t.text().collect::<String>()))
            .filter(|t| !t.is_empty());

        page.content = Self::extract_text(document.root_element());
        page.links = Self::extract_links(&document, url)?;
        Ok(page)
    }

    fn extract_text(root: ElementRef<'_>) -> String {
        let mut parts: Vec<&str> = Vec::new();
        for node in root.descendants() {
            let Some(text) = node.value().as_text() else {
                continue;
            };
            let hidden = node.ancestors().any(|ancestor| {
                ancestor
                    .value()
                    .as_element()
                    .map(|e| INVISIBLE_ELEMENTS.contains(&e.name()))
                    .unwrap_or(false)
            });
            if hidden {
                continue;
            }
            parts.extend(text.split_whitespace());
        }
        parts.join(" ")
    }

    fn extract_links(document: &Html, current_url: &str) -> Result<Vec<String>> {
        let link_selector = selector("a[href]")?;
        let mut seen = HashSet::new();
        let mut links = Vec::new();

        for element in document.select(&link_selector) {
            if let Some(href) = element.value().attr("href")
                && let Some(absolute_url) = resolve_url(current_url, href)
                && seen.insert(absolute_url.clone())
            {
                links.push(absolute_url);
            }
        }

        debug!("Found {} links on {}", links.len(), current_url);
        Ok(links)
    }
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| ScanError::ParseError(format!("selector {}: {}", css, e)))
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolve `href` against `base`, dropping the fragment. Non-navigational
/// schemes and in-page anchors yield `None`.
pub fn resolve_url(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
        || href.starts_with('#')
    {
        return None;
    }

    let base_url = Url::parse(base).ok()?;
    let mut resolved = base_url.join(href).ok()?;
    resolved.set_fragment(None);

    Some(resolved.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    fn html_response(body: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_raw(body.as_bytes().to_vec(), "text/html; charset=utf-8")
    }

    #[test]
    fn test_resolve_url_strips_fragment() {
        assert_eq!(
            resolve_url("http://a.com/dir/page", "other#section"),
            Some("http://a.com/dir/other".to_string())
        );
        assert_eq!(
            resolve_url("http://a.com/", "https://b.com/x#top"),
            Some("https://b.com/x".to_string())
        );
    }

    #[test]
    fn test_resolve_url_skips_non_navigational() {
        assert_eq!(resolve_url("http://a.com/", "#top"), None);
        assert_eq!(resolve_url("http://a.com/", "mailto:x@a.com"), None);
        assert_eq!(resolve_url("http://a.com/", "javascript:void(0)"), None);
        assert_eq!(resolve_url("http://a.com/", "   "), None);
    }

    #[test]
    fn test_parse_page_extracts_title_text_and_links() {
        let html = r#"<html><head><title> Hello
            World </title><style>body { color: red }</style></head>
            <body><p>First   paragraph</p>
            <script>var hidden = 1;</script>
            <a href="/local">Local</a>
            <a href="https://b.com/page#frag">B</a>
            <a href="https://b.com/page">B again</a>
            </body></html>"#;

        let page = Fetcher::parse_page("http://a.com/index.html", html).unwrap();

        assert_eq!(page.title.as_deref(), Some("Hello World"));
        assert!(page.content.contains("First paragraph"));
        assert!(!page.content.contains("hidden"));
        assert!(!page.content.contains("color"));
        assert_eq!(
            page.links,
            vec!["http://a.com/local".to_string(), "https://b.com/page".to_string()]
        );
    }

    #[test]
    fn test_parse_page_without_title() {
        let page = Fetcher::parse_page("http://a.com/", "<html><body>x</body></html>").unwrap();
        assert!(page.title.is_none());
        assert_eq!(page.content, "x");
    }

    #[tokio::test]
    async fn test_fetch_html_page() {
        let mock_server = MockServer::start().await;
        let body = format!(
            r#"<html><head><title>Root</title></head><body>
                <a href="{}/page1">Page 1</a>
                <a href="http://other.example/">Other</a>
            </body></html>"#,
            mock_server.uri()
        );

        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(html_response(&body))
            .mount(&mock_server)
            .await;

        let fetcher = Fetcher::new().unwrap();
        let outcome = fetcher.fetch(&format!("{}/", mock_server.uri())).await.unwrap();

        match outcome {
            FetchOutcome::Page(page) => {
                assert_eq!(page.status_code, 200);
                assert_eq!(page.title.as_deref(), Some("Root"));
                assert_eq!(page.links.len(), 2);
                assert!(page.links.contains(&format!("{}/page1", mock_server.uri())));
            }
            other => panic!("expected a page, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_non_html_is_reported() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(b"{}".to_vec(), "application/json"),
            )
            .mount(&mock_server)
            .await;

        let fetcher = Fetcher::new().unwrap();
        let outcome = fetcher
            .fetch(&format!("{}/data", mock_server.uri()))
            .await
            .unwrap();

        assert!(matches!(outcome, FetchOutcome::NotHtml { .. }));
    }

    #[tokio::test]
    async fn test_fetch_error_status() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let fetcher = Fetcher::new().unwrap();
        let err = fetcher
            .fetch(&format!("{}/missing", mock_server.uri()))
            .await
            .unwrap_err();

        assert!(matches!(err, ScanError::HttpStatus { status: 404, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_fetch_times_out() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(html_response("<html></html>").set_delay(Duration::from_secs(2)))
            .mount(&mock_server)
            .await;

        let fetcher = Fetcher::with_timeout(Duration::from_millis(200), DEFAULT_USER_AGENT).unwrap();
        let err = fetcher
            .fetch(&format!("{}/slow", mock_server.uri()))
            .await
            .unwrap_err();

        assert!(matches!(err, ScanError::HttpError(_)));
    }

    #[tokio::test]
    async fn test_fetch_rejects_unparsable_url() {
        let fetcher = Fetcher::new().unwrap();
        let err = fetcher.fetch("not a url").await.unwrap_err();
        assert!(matches!(err, ScanError::InvalidUrl(_)));
        assert!(!err.is_transient());
    }
}
