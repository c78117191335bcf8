use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

/// Lines that are page furniture rather than story text.
static BOILERPLATE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^advertisement$",
        r"(?i)^(story continues|article continues) below",
        r"(?i)^(subscribe|sign up)( now| today)?\b",
        r"(?i)subscribe to (our|the) newsletter",
        r"(?i)^(share|share this|share on) (article|story|facebook|twitter|x|email)",
        r"(?i)^(click|tap) here to",
        r"(?i)^(©|\(c\)|copyright)\s",
        r"(?i)all rights reserved\.?$",
        r"(?i)^(related|read more|more from)\s*:",
        r"(?i)^this (material|article) may not be published, broadcast, rewritten",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

/// Collapse every whitespace run to a single space and trim the ends.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Hex SHA-256 of the whitespace-normalised text. Used both for verification
/// page hashes and article content hashes.
pub fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(normalize_whitespace(text).as_bytes());
    format!("{:x}", digest)
}

fn is_boilerplate(line: &str) -> bool {
    BOILERPLATE.iter().any(|re| re.is_match(line))
}

/// Article text with page furniture removed: whitespace normalised per
/// paragraph, boilerplate lines dropped, blank runs collapsed.
pub fn clean_body(body: &str) -> String {
    body.lines()
        .map(normalize_whitespace)
        .filter(|line| !line.is_empty() && !is_boilerplate(line))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boilerplate_patterns_compile() {
        assert_eq!(BOILERPLATE.len(), 10);
    }

    #[test]
    fn test_clean_body_drops_boilerplate() {
        let body = "The council met on Tuesday.\n\nAdvertisement\n\n  It approved   the budget.  \n\
            Subscribe now for unlimited access\n\
            Copyright 2024 Example Media. All rights reserved.\n\
            Share this article";
        assert_eq!(
            clean_body(body),
            "The council met on Tuesday.\n\nIt approved the budget."
        );
    }

    #[test]
    fn test_clean_body_keeps_story_mentions() {
        let body = "Residents were asked to subscribe to text alerts.";
        assert_eq!(clean_body(body), body);
    }

    #[test]
    fn test_hash_ignores_whitespace_layout() {
        assert_eq!(
            content_hash("Council  votes\n\n on budget "),
            content_hash("Council votes on budget")
        );
        assert_ne!(content_hash("a b"), content_hash("ab"));
        assert_eq!(content_hash("").len(), 64);
    }
}
