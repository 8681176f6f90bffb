//! URL normalization, admission filtering and domain comparison.

use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Media, binary, style and script resources that are never crawled.
pub const DEFAULT_BLOCKED_EXTENSIONS: &[&str] = &[
    ".pdf", ".jpg", ".jpeg", ".png", ".gif", ".zip", ".mp3", ".mp4", ".avi", ".css", ".js",
];

/// Second-level labels that sit under a country TLD as part of the public
/// suffix (`bbc.co.uk`, `vnexpress.com.vn`).
const COUNTRY_SECOND_LEVEL: &[&str] = &["co", "com", "net", "org", "gov", "edu", "ac"];

/// Why a URL was refused admission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("unparsable URL: {0}")]
    Unparsable(String),

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("URL has no host")]
    MissingHost,

    #[error("blocked extension: {0}")]
    BlockedExtension(String),
}

#[derive(Debug, Clone)]
pub struct UrlPolicy {
    blocked_extensions: Vec<String>,
}

impl Default for UrlPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCKED_EXTENSIONS)
    }
}

impl UrlPolicy {
    pub fn new<I, S>(blocked_extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let blocked_extensions = blocked_extensions
            .into_iter()
            .map(|ext| {
                let ext = ext.as_ref().trim().to_lowercase();
                if ext.starts_with('.') {
                    ext
                } else {
                    format!(".{}", ext)
                }
            })
            .filter(|ext| ext.len() > 1)
            .collect();

        Self { blocked_extensions }
    }

    pub fn blocked_extensions(&self) -> &[String] {
        &self.blocked_extensions
    }

    /// Normalize `raw` and check it against the admission rules.
    ///
    /// The result has a lowercase scheme and host, no default port, no
    /// fragment, no empty query and no trailing slash except for the root
    /// path, so equivalent spellings compare equal as plain strings.
    pub fn normalize(&self, raw: &str) -> Result<String, Rejection> {
        let mut url =
            Url::parse(raw.trim()).map_err(|e| Rejection::Unparsable(format!("{}: {}", raw, e)))?;

        match url.scheme() {
            "http" | "https" => {}
            other => return Err(Rejection::UnsupportedScheme(other.to_string())),
        }

        if url.host_str().map(str::is_empty).unwrap_or(true) {
            return Err(Rejection::MissingHost);
        }

        url.set_fragment(None);
        if url.query() == Some("") {
            url.set_query(None);
        }

        let path = url.path().to_string();
        if path.len() > 1 && path.ends_with('/') {
            let trimmed = path.trim_end_matches('/');
            url.set_path(if trimmed.is_empty() { "/" } else { trimmed });
        }

        if let Some(ext) = self.blocked_extension(&url) {
            return Err(Rejection::BlockedExtension(ext.to_string()));
        }

        Ok(url.to_string())
    }

    pub fn is_valid(&self, raw: &str) -> bool {
        self.normalize(raw).is_ok()
    }

    fn blocked_extension(&self, url: &Url) -> Option<&str> {
        let path = url.path().to_lowercase();
        let full = url.as_str().to_lowercase();
        self.blocked_extensions
            .iter()
            .find(|ext| path.ends_with(ext.as_str()) || full.ends_with(ext.as_str()))
            .map(String::as_str)
    }
}

/// Registrable domain of a host: `www.` dropped, then the last two labels,
/// or three under a country-code second-level suffix.
pub fn registrable_domain_of_host(host: &str) -> String {
    let host = host.trim_end_matches('.').to_lowercase();
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.parse::<IpAddr>().is_ok() {
        return host.to_string();
    }

    let host = host.strip_prefix("www.").unwrap_or(host);
    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    let keep = match labels.as_slice() {
        [.., second, tld]
            if labels.len() >= 3
                && tld.len() == 2
                && COUNTRY_SECOND_LEVEL.contains(second) =>
        {
            3
        }
        _ => 2,
    };

    let start = labels.len().saturating_sub(keep);
    labels[start..].join(".")
}

pub fn registrable_domain(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(registrable_domain_of_host(host))
}

/// True when both URLs parse and belong to different registrable domains.
pub fn is_cross_domain(source: &str, destination: &str) -> bool {
    match (registrable_domain(source), registrable_domain(destination)) {
        (Some(a), Some(b)) => a != b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_is_stripped() {
        let policy = UrlPolicy::default();
        assert_eq!(
            policy.normalize("http://a.com/x#frag").unwrap(),
            policy.normalize("http://a.com/x").unwrap()
        );
    }

    #[test]
    fn test_trailing_variations_collapse() {
        let policy = UrlPolicy::default();
        let canonical = policy.normalize("http://a.com/x").unwrap();
        assert_eq!(policy.normalize("HTTP://A.COM/x/").unwrap(), canonical);
        assert_eq!(policy.normalize("http://a.com:80/x?").unwrap(), canonical);
        assert_eq!(policy.normalize("http://a.com").unwrap(), "http://a.com/");
        assert_eq!(policy.normalize("http://a.com/").unwrap(), "http://a.com/");
    }

    #[test]
    fn test_query_is_kept() {
        let policy = UrlPolicy::default();
        assert_eq!(
            policy.normalize("https://a.com/search?q=rust#top").unwrap(),
            "https://a.com/search?q=rust"
        );
    }

    #[test]
    fn test_rejects_non_http_schemes() {
        let policy = UrlPolicy::default();
        assert!(matches!(
            policy.normalize("ftp://a.com/file"),
            Err(Rejection::UnsupportedScheme(_))
        ));
        assert!(matches!(
            policy.normalize("mailto:someone@a.com"),
            Err(Rejection::UnsupportedScheme(_))
        ));
        assert!(matches!(
            policy.normalize("not a url"),
            Err(Rejection::Unparsable(_))
        ));
    }

    #[test]
    fn test_rejects_blocked_extensions() {
        let policy = UrlPolicy::default();
        for url in [
            "http://a.com/doc.pdf",
            "http://a.com/photo.JPG",
            "http://a.com/archive.zip",
            "http://a.com/app.js",
            "http://a.com/doc.pdf#page=2",
        ] {
            assert!(
                matches!(policy.normalize(url), Err(Rejection::BlockedExtension(_))),
                "{} should be blocked",
                url
            );
        }
        assert!(policy.is_valid("http://a.com/json-api"));
        assert!(policy.is_valid("http://a.com/page.html"));
    }

    #[test]
    fn test_custom_extension_list() {
        let policy = UrlPolicy::new(["svg", ".WEBP"]);
        assert_eq!(policy.blocked_extensions(), &[".svg", ".webp"]);
        assert!(!policy.is_valid("http://a.com/icon.svg"));
        assert!(policy.is_valid("http://a.com/doc.pdf"));
    }

    #[test]
    fn test_registrable_domain() {
        assert_eq!(registrable_domain_of_host("www.a.com"), "a.com");
        assert_eq!(registrable_domain_of_host("news.a.com"), "a.com");
        assert_eq!(registrable_domain_of_host("A.COM."), "a.com");
        assert_eq!(registrable_domain_of_host("www.bbc.co.uk"), "bbc.co.uk");
        assert_eq!(registrable_domain_of_host("vnexpress.com.vn"), "vnexpress.com.vn");
        assert_eq!(registrable_domain_of_host("localhost"), "localhost");
        assert_eq!(registrable_domain_of_host("127.0.0.1"), "127.0.0.1");
    }

    #[test]
    fn test_cross_domain() {
        assert!(!is_cross_domain("http://a.com/", "http://a.com/other"));
        assert!(!is_cross_domain("http://a.com/", "https://blog.a.com/post"));
        assert!(is_cross_domain("http://a.com/", "http://b.com/page"));
        assert!(!is_cross_domain("http://a.com/", "garbage"));
    }
}
