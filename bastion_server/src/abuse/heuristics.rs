//! Rule-based signals for the fraud scorer
//!
//! Pure functions over fixed signature tables. Windowing and thresholds on
//! counts live in the scorer; this module only inspects payloads.

use once_cell::sync::Lazy;

/// Request body patterns that indicate injection or XSS probing
static REQUEST_SIGNATURES: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "sql injection",
        "xss",
        "script",
        "javascript:",
        "onclick",
        "onload",
        "eval(",
        "document.cookie",
        "window.location",
    ]
});

/// Executable extensions that are never legitimate resume/attachment uploads
static BLOCKED_EXTENSIONS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![".exe", ".bat", ".cmd", ".scr", ".pif", ".vbs", ".js"]
});

/// Filename fragments associated with malware
static MALWARE_KEYWORDS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec!["virus", "malware", "trojan", "keylogger", "backdoor"]
});

/// Phrases typical of spam postings and messages
static SPAM_KEYWORDS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "buy now",
        "click here",
        "free money",
        "casino",
        "viagra",
        "lottery",
        "winner",
        "act now",
        "limited time",
        "make money",
        "work from home",
        "100% free",
        "earn cash",
        "wire transfer",
        "crypto giveaway",
    ]
});

/// Share of all words the most repeated word may take before it counts as spam
const REPETITION_RATIO: f64 = 0.3;

/// Share of letters that may be uppercase before content counts as shouting
const UPPERCASE_RATIO: f64 = 0.7;

/// Signatures found in a request body (case-insensitive)
pub fn scan_request_body(body: &str) -> Vec<&'static str> {
    let body = body.to_lowercase();
    REQUEST_SIGNATURES
        .iter()
        .copied()
        .filter(|sig| body.contains(sig))
        .collect()
}

/// Why an upload looked suspicious
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadFlag {
    /// Too many uploads in the retention horizon
    Volume(usize),
    /// Executable extension
    Extension(&'static str),
    /// Filename contains a malware keyword
    MalwareName(&'static str),
    /// File larger than the size limit
    Oversized(u64),
}

impl UploadFlag {
    pub fn describe(&self) -> String {
        match self {
            UploadFlag::Volume(n) => format!("{} uploads in the last hour", n),
            UploadFlag::Extension(ext) => format!("executable extension {}", ext),
            UploadFlag::MalwareName(kw) => format!("filename contains '{}'", kw),
            UploadFlag::Oversized(size) => format!("file size {} bytes", size),
        }
    }
}

/// Payload checks for an upload. `recent_uploads` includes this one.
pub fn check_upload(
    filename: &str,
    size: u64,
    recent_uploads: usize,
    max_uploads: usize,
    max_bytes: u64,
) -> Vec<UploadFlag> {
    let name = filename.to_lowercase();
    let mut flags = Vec::new();

    if recent_uploads > max_uploads {
        flags.push(UploadFlag::Volume(recent_uploads));
    }
    if let Some(ext) = BLOCKED_EXTENSIONS.iter().copied().find(|ext| name.ends_with(ext)) {
        flags.push(UploadFlag::Extension(ext));
    }
    if let Some(kw) = MALWARE_KEYWORDS.iter().copied().find(|kw| name.contains(kw)) {
        flags.push(UploadFlag::MalwareName(kw));
    }
    if size > max_bytes {
        flags.push(UploadFlag::Oversized(size));
    }

    flags
}

/// Breakdown of a content spam score
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpamScore {
    pub keywords: Vec<&'static str>,
    /// Most repeated word dominates the text
    pub repetitive: bool,
    /// Mostly uppercase letters
    pub shouting: bool,
}

impl SpamScore {
    pub fn score(&self) -> u32 {
        self.keywords.len() as u32 + if self.repetitive { 2 } else { 0 } + u32::from(self.shouting)
    }
}

/// Score free text for spam-like traits
pub fn spam_score(text: &str) -> SpamScore {
    let lower = text.to_lowercase();

    let keywords = SPAM_KEYWORDS
        .iter()
        .copied()
        .filter(|kw| lower.contains(kw))
        .collect();

    SpamScore {
        keywords,
        repetitive: is_repetitive(&lower),
        shouting: is_shouting(text),
    }
}

fn is_repetitive(lower: &str) -> bool {
    let words: Vec<&str> = lower.split_whitespace().collect();
    if words.is_empty() {
        return false;
    }

    let mut counts = std::collections::HashMap::new();
    for word in &words {
        let normalized: String = word.chars().filter(|c| c.is_alphanumeric()).collect();
        if normalized.chars().count() > 3 {
            *counts.entry(normalized).or_insert(0usize) += 1;
        }
    }

    let max = counts.values().copied().max().unwrap_or(0);
    max as f64 / words.len() as f64 > REPETITION_RATIO
}

fn is_shouting(text: &str) -> bool {
    let (letters, upper) = text
        .chars()
        .filter(|c| c.is_alphabetic())
        .fold((0usize, 0usize), |(letters, upper), c| {
            (letters + 1, upper + usize::from(c.is_uppercase()))
        });
    letters > 0 && upper as f64 / letters as f64 > UPPERCASE_RATIO
}

/// First `max_chars` characters of `text`
pub fn excerpt(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
