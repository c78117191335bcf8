// Wire-service detection from bylines, author lists and datelines

use regex::Regex;
use std::sync::LazyLock;

/// Dateline markers are only trusted near the top of the story.
const DATELINE_WINDOW: usize = 600;

struct WireService {
    name: &'static str,
    /// Matched against bylines and author names.
    credit: &'static str,
    /// Matched against the opening of the body.
    dateline: &'static str,
}

const SERVICES: &[WireService] = &[
    WireService {
        name: "ap",
        credit: r"(?i)\b(associated press|the ap)\b|^ap$",
        dateline: r"\(AP\)\s*[-—–]",
    },
    WireService {
        name: "reuters",
        credit: r"(?i)\breuters\b",
        dateline: r"\(Reuters\)\s*[-—–]",
    },
    WireService {
        name: "afp",
        credit: r"(?i)\b(agence france-presse|afp)\b",
        dateline: r"\(AFP\)\s*[-—–]",
    },
    WireService {
        name: "bloomberg",
        credit: r"(?i)\bbloomberg( news)?\b",
        dateline: r"\(Bloomberg\)\s*[-—–]",
    },
    WireService {
        name: "upi",
        credit: r"(?i)\b(united press international|upi)\b",
        dateline: r"\(UPI\)\s*[-—–]",
    },
    WireService {
        name: "cnn",
        credit: r"(?i)\bcnn wire\b",
        dateline: r"\(CNN\)\s*[-—–]",
    },
    WireService {
        name: "states_newsroom",
        credit: r"(?i)\bstates newsroom\b",
        dateline: r"(?i)\bstates newsroom\b",
    },
];

struct CompiledService {
    name: &'static str,
    credit: Regex,
    dateline: Regex,
}

static COMPILED: LazyLock<Vec<CompiledService>> = LazyLock::new(|| {
    SERVICES
        .iter()
        .map(|s| CompiledService {
            name: s.name,
            credit: Regex::new(s.credit).unwrap(),
            dateline: Regex::new(s.dateline).unwrap(),
        })
        .collect()
});

fn opening(body: &str) -> &str {
    match body.char_indices().nth(DATELINE_WINDOW) {
        Some((index, _)) => &body[..index],
        None => body,
    }
}

/// Names of wire services credited for a story, in a stable order.
pub fn detect_wire_services(byline: Option<&str>, authors: &[String], body: Option<&str>) -> Vec<String> {
    let credits: Vec<&str> = byline
        .into_iter()
        .chain(authors.iter().map(|a| a.as_str()))
        .map(str::trim)
        .collect();
    let head = body.map(opening).unwrap_or_default();

    COMPILED
        .iter()
        .filter(|service| {
            let credited = credits.iter().any(|c| service.credit.is_match(c));
            let datelined = service.dateline.is_match(head);
            credited || datelined
        })
        .map(|service| service.name.to_string())
        .collect()
}
