//! Relevance scoring primitives.
//!
//! Everything here is pure and synchronous: keyword extraction, Jaccard
//! overlap, recency decay, signal detection for turn importance, and the
//! technical-domain classifier used to build a [`DomainContext`].

use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;

use crate::memory::{DomainContext, TechnicalDomain};

static WORD_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z0-9]+").expect("invalid regex"));

static ERROR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(error|errors|fail|fails|failed|failing|failure|exception|crash|crashed|broken|bug|panic|traceback)\b")
        .expect("invalid regex")
});

static URGENCY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(urgent|urgently|critical|emergency|asap|immediately|outage|down|production|sev1|p0)\b")
        .expect("invalid regex")
});

/// Words that carry no signal for overlap or clustering.
pub const STOPWORDS: &[&str] = &[
    "a", "about", "after", "again", "all", "also", "an", "and", "any", "are", "as", "at", "be",
    "been", "before", "being", "but", "by", "can", "could", "did", "do", "does", "doing", "for",
    "from", "had", "has", "have", "having", "how", "i", "if", "in", "into", "is", "it", "its",
    "just", "me", "my", "no", "not", "of", "on", "or", "our", "out", "over", "should", "so",
    "some", "than", "that", "the", "their", "them", "then", "there", "these", "they", "this",
    "those", "to", "too", "under", "up", "very", "was", "we", "were", "what", "when", "where",
    "which", "while", "who", "why", "will", "with", "would", "you", "your", "none", "null",
    "true", "false",
];

/// Lowercase alphanumeric tokens, in order, including stopwords.
pub fn tokenize(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    WORD_PATTERN
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Whitespace token count, used for the "long query" signals.
pub fn token_count(text: &str) -> usize {
    text.split_whitespace().count()
}

pub fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

/// Distinct non-stopword tokens of at least two characters.
pub fn keywords(text: &str) -> HashSet<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| t.len() > 1 && !is_stopword(t))
        .collect()
}

/// Jaccard index of two keyword sets; 0 when both are empty.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

/// Jaccard keyword overlap between two texts.
pub fn keyword_similarity(query: &str, text: &str) -> f64 {
    jaccard(&keywords(query), &keywords(text))
}

/// Exponential-style recency weight in (0.5, 1.0].
///
/// Fresh items weigh 1.0 and the weight approaches 0.5 as the age grows past
/// `window_hours`, so old but relevant items are demoted, never erased.
pub fn recency_decay(timestamp: DateTime<Utc>, now: DateTime<Utc>, window_hours: f64) -> f64 {
    let age_hours = (now - timestamp).num_milliseconds() as f64 / 3_600_000.0;
    if age_hours <= 0.0 || window_hours <= 0.0 {
        return 1.0;
    }
    0.5 + 0.5 * (-age_hours / window_hours).exp()
}

/// Clamp a score into [0, 1]; NaN becomes 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

pub fn has_error_signal(text: &str) -> bool {
    ERROR_PATTERN.is_match(text)
}

pub fn has_urgency_signal(text: &str) -> bool {
    URGENCY_PATTERN.is_match(text)
}

/// Whether any expertise domain appears as a keyword of `text`.
pub fn mentions_expertise(text: &str, expertise: &BTreeSet<String>) -> bool {
    if expertise.is_empty() {
        return false;
    }
    let words = keywords(text);
    expertise
        .iter()
        .any(|domain| keywords(domain).iter().any(|k| words.contains(k)))
}

impl TechnicalDomain {
    /// Every classifiable domain (excludes `General`).
    pub const ALL: [TechnicalDomain; 6] = [
        TechnicalDomain::Database,
        TechnicalDomain::Network,
        TechnicalDomain::Application,
        TechnicalDomain::System,
        TechnicalDomain::Security,
        TechnicalDomain::Cloud,
    ];

    pub fn keywords(&self) -> &'static [&'static str] {
        match self {
            Self::Database => &[
                "database", "db", "sql", "query", "postgres", "postgresql", "mysql", "mongodb",
                "redis", "index", "table", "transaction", "deadlock", "replication", "schema",
                "migration",
            ],
            Self::Network => &[
                "network", "dns", "latency", "timeout", "packet", "firewall", "tcp", "udp",
                "http", "https", "port", "socket", "bandwidth", "proxy", "connection",
                "routing",
            ],
            Self::Application => &[
                "application", "app", "code", "bug", "exception", "stacktrace", "api",
                "endpoint", "deploy", "deployment", "build", "dependency", "library",
                "framework", "crash",
            ],
            Self::System => &[
                "system", "server", "cpu", "memory", "disk", "kernel", "process", "linux",
                "windows", "os", "service", "daemon", "filesystem", "load", "oom",
            ],
            Self::Security => &[
                "security", "auth", "authentication", "authorization", "permission",
                "certificate", "ssl", "tls", "vulnerability", "breach", "token", "password",
                "encryption", "credential", "attack",
            ],
            Self::Cloud => &[
                "cloud", "aws", "azure", "gcp", "kubernetes", "k8s", "docker", "container",
                "lambda", "s3", "ec2", "cluster", "pod", "terraform", "serverless",
            ],
            Self::General => &[],
        }
    }

    /// Domain weight applied to the raw confidence.
    pub fn weight(&self) -> f64 {
        match self {
            Self::Security => 1.1,
            _ => 1.0,
        }
    }
}

/// Classify the technical domain implied by a query.
///
/// Confidence per domain is `(keyword density + exact-match ratio) × weight`,
/// capped at 1. The winner is boosted ×1.2 when the user already lists it as
/// expertise.
pub fn classify_domain(query: &str, expertise: &BTreeSet<String>) -> DomainContext {
    let tokens: Vec<String> = tokenize(query)
        .into_iter()
        .filter(|t| !is_stopword(t))
        .collect();
    let is_complex = token_count(query) > 10;

    if tokens.is_empty() {
        return DomainContext::general(is_complex);
    }

    let mut scores = Vec::new();
    for domain in TechnicalDomain::ALL {
        let vocab = domain.keywords();
        let matching_tokens = tokens.iter().filter(|t| vocab.contains(&t.as_str())).count();
        if matching_tokens == 0 {
            continue;
        }
        let distinct: HashSet<&str> = tokens
            .iter()
            .map(String::as_str)
            .filter(|t| vocab.contains(t))
            .collect();

        let density = matching_tokens as f64 / tokens.len() as f64;
        let exact_ratio = distinct.len() as f64 / vocab.len() as f64;
        let confidence = clamp_unit((density + exact_ratio) * domain.weight());
        scores.push((domain, confidence));
    }

    // Stable order: highest confidence first, ties keep declaration order.
    scores.sort_by(|a, b| b.1.total_cmp(&a.1));

    let Some(&(primary, raw_confidence)) = scores.first() else {
        return DomainContext::general(is_complex);
    };

    let confidence = if expertise.contains(primary.as_str()) {
        clamp_unit(raw_confidence * 1.2)
    } else {
        raw_confidence
    };

    DomainContext {
        primary_domain: primary,
        confidence,
        matched_domains: scores.iter().map(|(d, _)| *d).collect(),
        multi_domain: scores.len() > 1,
        is_complex,
    }
}
