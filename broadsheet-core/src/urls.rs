// URL normalisation and link helpers shared by every stage

use url::Url;

const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "mc_cid", "mc_eid", "ref", "cmpid", "outputtype",
];

const NON_ARTICLE_SEGMENTS: &[&str] = &[
    "video", "videos", "gallery", "galleries", "photos", "podcast", "podcasts", "tag", "tags",
    "author", "authors", "topic", "topics", "category", "search", "login", "subscribe",
    "newsletter", "newsletters", "account", "contact", "about", "privacy", "terms",
];

const NON_ARTICLE_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".webp", ".svg", ".pdf", ".mp3", ".mp4", ".zip", ".xml",
    ".css", ".js",
];

/// Bare host used as the source key: lower-cased, `www.` stripped. Accepts a
/// full URL or a host.
pub fn normalize_host(input: &str) -> String {
    let trimmed = input.trim();
    let host = Url::parse(trimmed)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_else(|| {
            trimmed
                .split(['/', '?', '#'])
                .next()
                .unwrap_or(trimmed)
                .to_string()
        });
    let host = host.to_ascii_lowercase();
    host.strip_prefix("www.").map(|h| h.to_string()).unwrap_or(host)
}

/// Dedup key for a URL. Returns `None` for anything that is not an absolute
/// http(s) URL.
pub fn normalize_url(input: &str) -> Option<String> {
    let mut url = Url::parse(input.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let host = normalize_host(url.host_str()?);
    url.set_host(Some(&host)).ok()?;
    // Default ports are already elided by the parser
    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    let mut normalized = url.to_string();
    if url.path() == "/" && url.query().is_none() && normalized.ends_with('/') {
        normalized.pop();
    }
    Some(normalized)
}

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

/// Resolve an `href` against the page it appeared on. Skips script, mail and
/// fragment-only links.
pub fn resolve_link(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
        || href.starts_with('#')
    {
        return None;
    }
    let mut resolved = base.join(href).ok()?;
    if !matches!(resolved.scheme(), "http" | "https") {
        return None;
    }
    resolved.set_fragment(None);
    Some(resolved)
}

/// True when `url` is on `host` or one of its subdomains, ignoring `www.`.
pub fn is_same_site(url: &Url, host: &str) -> bool {
    let Some(candidate) = url.host_str() else {
        return false;
    };
    let candidate = normalize_host(candidate);
    let host = normalize_host(host);
    candidate == host || candidate.ends_with(&format!(".{}", host))
}

pub fn path_segments(url: &Url) -> Vec<String> {
    url.path_segments()
        .map(|segments| {
            segments
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// Media, listing and utility pages that are never articles.
pub fn is_non_article(url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    if NON_ARTICLE_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        return true;
    }
    let segments = path_segments(url);
    if segments.is_empty() {
        return true;
    }
    segments
        .iter()
        .any(|s| NON_ARTICLE_SEGMENTS.contains(&s.to_ascii_lowercase().as_str()))
}

/// Feed-looking URLs, excluded from link-based strategies.
pub fn is_feed_url(url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    path.ends_with(".rss")
        || path.ends_with(".atom")
        || path.ends_with("rss.xml")
        || path.ends_with("atom.xml")
        || path_segments(url)
            .iter()
            .any(|s| matches!(s.to_ascii_lowercase().as_str(), "feed" | "feeds" | "rss"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_tracking_and_sorts() {
        assert_eq!(
            normalize_url("HTTPS://WWW.Example.com/News/Story/?utm_source=x&b=2&a=1&fbclid=z#top")
                .unwrap(),
            "https://example.com/News/Story?a=1&b=2"
        );
    }

    #[test]
    fn test_normalize_root_and_ports() {
        assert_eq!(normalize_url("http://example.com:80/").unwrap(), "http://example.com");
        assert_eq!(normalize_url("https://example.com").unwrap(), "https://example.com");
        assert_eq!(
            normalize_url("https://example.com:8443/a/").unwrap(),
            "https://example.com:8443/a"
        );
    }

    #[test]
    fn test_normalize_equivalent_urls_collide() {
        let a = normalize_url("https://www.example.com/a/b?ref=home").unwrap();
        let b = normalize_url("https://example.com/a/b/").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_normalize_rejects_non_http() {
        assert!(normalize_url("mailto:desk@example.com").is_none());
        assert!(normalize_url("/relative/path").is_none());
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("WWW.Example.COM"), "example.com");
        assert_eq!(normalize_host("https://www.example.com/news"), "example.com");
        assert_eq!(normalize_host("news.example.com/path"), "news.example.com");
    }

    #[test]
    fn test_resolve_link() {
        let base = Url::parse("https://example.com/news/").unwrap();
        assert_eq!(
            resolve_link(&base, "story-1#comments").unwrap().as_str(),
            "https://example.com/news/story-1"
        );
        assert!(resolve_link(&base, "javascript:void(0)").is_none());
        assert!(resolve_link(&base, "#top").is_none());
        assert!(resolve_link(&base, "ftp://example.com/file").is_none());
    }

    #[test]
    fn test_same_site() {
        let url = Url::parse("https://www.example.com/a").unwrap();
        assert!(is_same_site(&url, "example.com"));
        let sub = Url::parse("https://local.example.com/a").unwrap();
        assert!(is_same_site(&sub, "example.com"));
        let other = Url::parse("https://notexample.com/a").unwrap();
        assert!(!is_same_site(&other, "example.com"));
    }

    #[test]
    fn test_non_article_and_feed_urls() {
        let video = Url::parse("https://example.com/video/clip-1").unwrap();
        assert!(is_non_article(&video));
        let pdf = Url::parse("https://example.com/docs/report.pdf").unwrap();
        assert!(is_non_article(&pdf));
        let story = Url::parse("https://example.com/news/2024/city-council-vote").unwrap();
        assert!(!is_non_article(&story));

        assert!(is_feed_url(&Url::parse("https://example.com/feed/").unwrap()));
        assert!(is_feed_url(&Url::parse("https://example.com/rss.xml").unwrap()));
        assert!(!is_feed_url(&story));
    }
}
