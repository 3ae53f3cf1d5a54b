use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

pub const MAX_QUESTION_CHARS: usize = 4000;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

static INJECTION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)ignore\s+(all\s+)?previous",
        r"(?i)disregard\s+(all\s+)?(previous\s+|prior\s+)?instructions",
        r"(?i)forget\s+(all\s+)?(previous|prior)\s+instructions",
        r"(?im)^\s*system\s*:",
        r"(?i)you\s+are\s+now\s+in\s+developer\s+mode",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuestionError {
    #[error("Question must contain at least 1 character")]
    Empty,
    #[error("Question must contain at most 4000 characters (got {chars})")]
    TooLong { chars: usize },
    #[error("Invalid input detected")]
    Suspicious,
}

/// Collapse whitespace runs to single spaces, then apply length and
/// prompt-injection checks. Returns the normalized question.
pub fn validate_question(raw: &str) -> Result<String, QuestionError> {
    if INJECTION_PATTERNS.iter().any(|p| p.is_match(raw)) {
        return Err(QuestionError::Suspicious);
    }
    let question = WHITESPACE.replace_all(raw.trim(), " ").into_owned();
    let chars = question.chars().count();
    if chars == 0 {
        return Err(QuestionError::Empty);
    }
    if chars > MAX_QUESTION_CHARS {
        return Err(QuestionError::TooLong { chars });
    }
    Ok(question)
}
