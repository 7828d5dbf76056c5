//! Demultiplexing of the worker's stdout.
//!
//! The worker writes human-readable narration and the result envelope to the
//! same stream with no framing between them. A line counts as progress when it
//! contains one of [`PROGRESS_KEYWORDS`] as a whole word; anything else that
//! is not blank is a piece of the envelope. A payload that happens to contain
//! a keyword, or narration that contains none, is misclassified. That is an
//! accepted limitation of the worker protocol, and [`LineClassifier`] is the
//! seam for replacing the heuristic once the worker emits explicit markers.

use std::sync::LazyLock;

use regex::Regex;

/// Words that mark a stdout line as progress narration. Case-sensitive.
pub const PROGRESS_KEYWORDS: &[&str] = &[
    "Generating",
    "Generation",
    "Best fitness",
    "Starting genetic",
    "Finalizing",
    "Successfully",
    "Failed",
];

static DEFAULT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    keyword_pattern(PROGRESS_KEYWORDS).expect("built-in progress keywords form a valid pattern")
});

/// Classification of one trimmed, non-empty stdout line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineClass {
    Progress(String),
    ResultFragment(String),
}

pub trait LineClassifier: Send + Sync {
    /// Classify a raw line. Returns `None` for lines that are blank once trimmed.
    fn classify(&self, line: &str) -> Option<LineClass>;
}

/// Keyword heuristic matching the existing worker's narration.
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    pattern: Regex,
}

impl KeywordClassifier {
    pub fn new() -> Self {
        Self {
            pattern: DEFAULT_PATTERN.clone(),
        }
    }

    pub fn with_keywords(keywords: &[&str]) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: keyword_pattern(keywords)?,
        })
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl LineClassifier for KeywordClassifier {
    fn classify(&self, line: &str) -> Option<LineClass> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if self.pattern.is_match(line) {
            Some(LineClass::Progress(line.to_string()))
        } else {
            Some(LineClass::ResultFragment(line.to_string()))
        }
    }
}

// ASCII word boundaries: the worker's narration is ASCII and peers match with
// ASCII `\b`, so accented letters next to a keyword must not change the result.
fn keyword_pattern(keywords: &[&str]) -> Result<Regex, regex::Error> {
    let alternatives: Vec<String> = keywords.iter().map(|k| regex::escape(k)).collect();
    Regex::new(&format!(r"(?-u:\b)(?:{})(?-u:\b)", alternatives.join("|")))
}
