// Response classification shared by every fetch path

use crate::result::ResponseClass;
use reqwest::header::HeaderMap;

/// Markers that only appear on interstitial challenge pages.
const STRONG_BODY_SIGNATURES: &[&str] = &[
    "cf-browser-verification",
    "cf_chl_opt",
    "/cdn-cgi/challenge-platform/",
    "_incapsula_resource",
    "captcha-delivery.com",
    "px-captcha",
    "perimeterx",
    "sucuri website firewall",
    "ddos-guard",
    "challenges.cloudflare.com/turnstile",
];

/// Phrases that are suspicious only on small pages; real articles may quote them.
const WEAK_BODY_SIGNATURES: &[&str] = &[
    "just a moment...",
    "checking your browser before accessing",
    "attention required! | cloudflare",
    "enable javascript and cookies to continue",
    "verify you are human",
    "are you a robot",
    "please complete the security check",
    "request unsuccessful. incapsula incident id",
    "pardon our interruption",
];

const WEAK_SIGNATURE_MAX_BODY: usize = 24 * 1024;
const INSPECT_PREFIX: usize = 64 * 1024;

/// Returns true when the response is an automated-traffic check rather than content.
/// Works for any status code, including challenges served as HTTP 200.
pub fn is_bot_challenge(status: u16, headers: &HeaderMap, body: &str) -> bool {
    if headers
        .get("cf-mitigated")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("challenge"))
    {
        return true;
    }
    if headers.contains_key("x-datadome") && status == 403 {
        return true;
    }

    let mut end = body.len().min(INSPECT_PREFIX);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    let prefix = body[..end].to_lowercase();

    if STRONG_BODY_SIGNATURES.iter().any(|sig| prefix.contains(sig)) {
        return true;
    }

    if body.len() <= WEAK_SIGNATURE_MAX_BODY
        && WEAK_BODY_SIGNATURES.iter().any(|sig| prefix.contains(sig))
    {
        return true;
    }

    // Bot-protection front ends answer blocked clients with a bare 403
    status == 403 && is_protected_edge(headers)
}

fn is_protected_edge(headers: &HeaderMap) -> bool {
    let server = headers
        .get("server")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_lowercase();
    server.contains("cloudflare")
        || server.contains("ddos-guard")
        || server.contains("akamaighost")
        || headers.contains_key("x-sucuri-id")
        || headers.contains_key("x-iinfo")
}

/// Classify a completed HTTP exchange.
pub fn classify_response(status: u16, headers: &HeaderMap, body: &str) -> ResponseClass {
    if is_bot_challenge(status, headers, body) {
        return ResponseClass::BotChallenge;
    }

    match status {
        200..=399 => ResponseClass::Success,
        404 | 410 => ResponseClass::NotFound,
        408 => ResponseClass::Transient,
        429 => ResponseClass::RateLimited,
        400..=499 => ResponseClass::ClientError,
        _ => ResponseClass::Transient,
    }
}

/// Classify a request that never produced a response.
pub fn classify_transport_error(_error: &reqwest::Error) -> ResponseClass {
    // Timeouts, resets, DNS and TLS failures are all retried the same way
    ResponseClass::Transient
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_cloudflare_challenge_served_as_200() {
        let body = r#"<html><head><title>Just a moment...</title></head>
            <body><script>window._cf_chl_opt={cvId: '3'};</script></body></html>"#;
        assert_eq!(
            classify_response(200, &HeaderMap::new(), body),
            ResponseClass::BotChallenge
        );
    }

    #[test]
    fn test_cf_mitigated_header() {
        let h = headers(&[("cf-mitigated", "challenge")]);
        assert!(is_bot_challenge(403, &h, ""));
    }

    #[test]
    fn test_weak_phrase_ignored_in_long_article() {
        let mut body = String::from("<html><body><p>Readers were asked: are you a robot?</p>");
        body.push_str(&"<p>Lorem ipsum dolor sit amet.</p>".repeat(2000));
        body.push_str("</body></html>");
        assert_eq!(
            classify_response(200, &HeaderMap::new(), &body),
            ResponseClass::Success
        );
    }

    #[test]
    fn test_plain_403_is_client_error() {
        assert_eq!(
            classify_response(403, &HeaderMap::new(), "Forbidden"),
            ResponseClass::ClientError
        );
    }

    #[test]
    fn test_403_from_cloudflare_edge_is_challenge() {
        let h = headers(&[("server", "cloudflare")]);
        assert_eq!(classify_response(403, &h, ""), ResponseClass::BotChallenge);
    }

    #[test]
    fn test_status_mapping() {
        let h = HeaderMap::new();
        assert_eq!(classify_response(404, &h, ""), ResponseClass::NotFound);
        assert_eq!(classify_response(410, &h, ""), ResponseClass::NotFound);
        assert_eq!(classify_response(429, &h, ""), ResponseClass::RateLimited);
        assert_eq!(classify_response(503, &h, ""), ResponseClass::Transient);
        assert_eq!(classify_response(301, &h, ""), ResponseClass::Success);
    }
}
