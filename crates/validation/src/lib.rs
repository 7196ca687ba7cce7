//! Identifier/label/path/command validation and shell-safe quoting.
//!
//! These are the primitives every collaborator boundary (config, host
//! client, sanitizer) is built on: nothing downstream should forward a
//! string that hasn't passed through one of these checks.

use regex::Regex;
use thiserror::Error;

pub const MAX_IDENTIFIER_LEN: usize = 128;
pub const MAX_LABEL_LEN: usize = 64;
pub const MAX_STRING_LENGTH: usize = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

fn identifier_re() -> Regex {
    Regex::new(r"^[A-Za-z0-9_-]+$").expect("static identifier pattern")
}

fn label_re() -> Regex {
    Regex::new(r"^[A-Za-z0-9_:-]+$").expect("static label pattern")
}

pub fn validate_identifier(s: &str) -> Result<(), ValidationError> {
    if s.is_empty() || s.len() > MAX_IDENTIFIER_LEN || !identifier_re().is_match(s) {
        return Err(ValidationError::InvalidInput(format!(
            "not a valid identifier: {s:?}"
        )));
    }
    Ok(())
}

pub fn validate_label(s: &str) -> Result<(), ValidationError> {
    if s.is_empty() || s.len() > MAX_LABEL_LEN || !label_re().is_match(s) {
        return Err(ValidationError::InvalidInput(format!(
            "not a valid label: {s:?}"
        )));
    }
    Ok(())
}

/// Rejects `..` path traversal (raw or URL-encoded) and embedded NUL bytes
/// (raw or URL-encoded). Otherwise any string is a valid path.
pub fn validate_path(s: &str) -> Result<(), ValidationError> {
    let lowered = s.to_ascii_lowercase();
    if s.contains("..") || lowered.contains("%2e%2e") {
        return Err(ValidationError::InvalidInput(format!(
            "path traversal rejected: {s:?}"
        )));
    }
    if s.contains('\0') || lowered.contains("%00") {
        return Err(ValidationError::InvalidInput(format!(
            "embedded nul rejected: {s:?}"
        )));
    }
    Ok(())
}

const SHELL_METACHARS: &[char] = &[
    ';', '&', '|', '$', '`', '(', ')', '<', '>', '\n', '\\', '"', '\'', '*', '?', '~', '{', '}',
    '!', '#',
];

/// A command must start with `/`, contain no whitespace, and contain no
/// shell metacharacters.
pub fn validate_command(s: &str) -> Result<(), ValidationError> {
    if !s.starts_with('/') {
        return Err(ValidationError::InvalidInput(format!(
            "command must start with '/': {s:?}"
        )));
    }
    if s.chars().any(|c| c.is_whitespace()) {
        return Err(ValidationError::InvalidInput(format!(
            "command must not contain whitespace: {s:?}"
        )));
    }
    if s.chars().any(|c| SHELL_METACHARS.contains(&c)) {
        return Err(ValidationError::InvalidInput(format!(
            "command contains shell metacharacters: {s:?}"
        )));
    }
    Ok(())
}

/// Wraps `s` in single quotes, escaping embedded single quotes as `'\''`,
/// so that `sh -c "echo '<result>'"` prints `s` verbatim.
pub fn shell_quote(s: &str) -> Result<String, ValidationError> {
    if s.len() > MAX_STRING_LENGTH {
        return Err(ValidationError::InvalidInput(
            "string exceeds MAX_STRING_LENGTH".to_string(),
        ));
    }
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    Ok(out)
}

/// Keeps only the identifiers that pass [`validate_identifier`].
pub fn filter_valid_identifiers<'a, I: IntoIterator<Item = &'a str>>(items: I) -> Vec<&'a str> {
    items
        .into_iter()
        .filter(|s| validate_identifier(s).is_ok())
        .collect()
}

/// Keeps only the labels that pass [`validate_label`].
pub fn filter_valid_labels<'a, I: IntoIterator<Item = &'a str>>(items: I) -> Vec<&'a str> {
    items
        .into_iter()
        .filter(|s| validate_label(s).is_ok())
        .collect()
}
