//! Lexical (keyword) scoring for hybrid search.
//!
//! Each query term contributes by where it appears in a file:
//! the file name weighs most, then the leading text, then the directory path.
//! The per-term score is normalized to [0, 1] and the file score is the mean
//! over terms, so a file that matches every term everywhere scores 1.0.

const NAME_WEIGHT: f32 = 1.0;
const PATH_WEIGHT: f32 = 0.5;
const TEXT_WEIGHT: f32 = 0.8;
const MAX_TERM_SCORE: f32 = NAME_WEIGHT + PATH_WEIGHT + TEXT_WEIGHT;

pub(crate) const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "in", "on", "at", "to",
    "for", "of", "with", "by", "from", "as", "and", "or", "but", "not", "no", "so", "if", "then",
];

/// Tokenize into lowercase terms.
/// Filters out very short terms (1 char) and common stop words.
pub fn tokenize(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .map(|s| s.to_lowercase())
        .filter(|s| s.chars().count() > 1 && !STOP_WORDS.contains(&s.as_str()))
        .collect();
    // repeated terms would weigh twice in the mean
    let mut seen = std::collections::HashSet::new();
    terms.retain(|t| seen.insert(t.clone()));
    terms
}

/// The fields of one file that keyword matching looks at.
#[derive(Debug, Clone, Copy)]
pub struct LexicalFields<'a> {
    pub name: &'a str,
    pub path: &'a str,
    pub text: Option<&'a str>,
}

/// Lowercased copy of [`LexicalFields`], built once per file.
struct Lowered {
    name: String,
    path: String,
    text: Option<String>,
}

/// Score a file against already-tokenized query terms. Result is in [0, 1].
pub fn score_terms(terms: &[String], fields: LexicalFields<'_>) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }

    let lowered = Lowered {
        name: fields.name.to_lowercase(),
        path: fields.path.to_lowercase(),
        text: fields.text.map(str::to_lowercase),
    };

    let total: f32 = terms
        .iter()
        .map(|term| {
            let mut hits = 0.0;
            if lowered.name.contains(term.as_str()) {
                hits += NAME_WEIGHT;
            }
            if lowered.path.contains(term.as_str()) {
                hits += PATH_WEIGHT;
            }
            if lowered
                .text
                .as_deref()
                .is_some_and(|text| text.contains(term.as_str()))
            {
                hits += TEXT_WEIGHT;
            }
            hits / MAX_TERM_SCORE
        })
        .sum();

    (total / terms.len() as f32).clamp(0.0, 1.0)
}

/// Tokenize `query` and score one file.
pub fn score(query: &str, fields: LexicalFields<'_>) -> f32 {
    score_terms(&tokenize(query), fields)
}
