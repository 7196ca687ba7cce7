//! Ecosystem context: a small, bounded, cross-PR memory of interesting
//! patterns surfaced by past reviews (praised designs, speculative
//! connections worth flagging again).
//!
//! Extraction is pure; the update path reads-appends-dedupes-evicts and
//! rewrites atomically, never throwing back to the pipeline caller.

use revbot_common::{atomic_write, now_iso8601};
use revbot_findings::Finding;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const MAX_PATTERNS_PER_REPO: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EcosystemPattern {
    pub repo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr: Option<u64>,
    pub pattern: String,
    pub connection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EcosystemContext {
    #[serde(default)]
    pub patterns: Vec<EcosystemPattern>,
    #[serde(default)]
    pub last_updated: String,
}

/// Text up to the first period or `max_units` code units, whichever is
/// shorter.
fn first_sentence(text: &str, max_units: usize) -> String {
    let truncated_at_period = text.split('.').next().unwrap_or(text);
    let chars: Vec<char> = truncated_at_period.chars().collect();
    if chars.len() <= max_units {
        truncated_at_period.to_string()
    } else {
        chars[..max_units].iter().collect()
    }
}

/// Emits one pattern per finding that is either `PRAISE` with
/// `confidence > 0.8`, or `SPECULATION` at any confidence.
pub fn extract_patterns(findings: &[Finding], repo: &str, pr: Option<u64>) -> Vec<EcosystemPattern> {
    findings
        .iter()
        .filter(|f| {
            let severity = f.severity.to_uppercase();
            match severity.as_str() {
                "PRAISE" => f.confidence.map(|c| c > 0.8).unwrap_or(false),
                "SPECULATION" => true,
                _ => false,
            }
        })
        .map(|f| EcosystemPattern {
            repo: repo.to_string(),
            pr,
            pattern: f.title.clone().unwrap_or_else(|| f.id.clone()),
            connection: first_sentence(f.description.as_deref().unwrap_or(""), 200),
            extracted_from: Some(f.id.clone()),
            confidence: f.confidence,
        })
        .collect()
}

/// Reads the existing file (if any), appends `new_patterns` skipping
/// `(repo, pattern)` duplicates, evicts the oldest entries per repo
/// past a cap of 20, and writes atomically. A missing parent
/// directory, invalid JSON, or unreadable file is treated as "start
/// empty" and logged, never propagated. When `new_patterns` is empty,
/// the file is left untouched.
pub fn update(path: &Path, new_patterns: &[EcosystemPattern]) {
    if new_patterns.is_empty() {
        return;
    }

    let mut context = match fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<EcosystemContext>(&contents) {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::warn!(error = %e, "ecosystem context file unreadable, starting fresh");
                EcosystemContext::default()
            }
        },
        Err(_) => EcosystemContext::default(),
    };

    for candidate in new_patterns {
        let is_dup = context
            .patterns
            .iter()
            .any(|p| p.repo == candidate.repo && p.pattern == candidate.pattern);
        if !is_dup {
            context.patterns.push(candidate.clone());
        }
    }

    for repo in context.patterns.iter().map(|p| p.repo.clone()).collect::<std::collections::BTreeSet<_>>() {
        let count = context.patterns.iter().filter(|p| p.repo == repo).count();
        if count > MAX_PATTERNS_PER_REPO {
            let mut seen = 0usize;
            let excess = count - MAX_PATTERNS_PER_REPO;
            context.patterns.retain(|p| {
                if p.repo != repo {
                    return true;
                }
                seen += 1;
                seen > excess
            });
        }
    }

    context.last_updated = now_iso8601();

    match serde_json::to_vec_pretty(&context) {
        Ok(bytes) => {
            if let Err(e) = atomic_write(path, &bytes) {
                tracing::warn!(error = %e, "failed to write ecosystem context");
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to serialize ecosystem context"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(id: &str, severity: &str, confidence: Option<f64>, title: &str, description: &str) -> Finding {
        Finding {
            id: id.to_string(),
            severity: severity.to_string(),
            category: "design".to_string(),
            title: Some(title.to_string()),
            file: None,
            description: Some(description.to_string()),
            suggestion: None,
            confidence,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn extract_includes_high_confidence_praise_and_any_speculation() {
        let findings = vec![
            finding("1", "PRAISE", Some(0.9), "nice pattern", "This is elegant. More text."),
            finding("2", "PRAISE", Some(0.5), "meh pattern", "Not confident enough."),
            finding("3", "SPECULATION", Some(0.1), "maybe connected", "Could relate to caching."),
            finding("4", "HIGH", Some(0.9), "bug", "A real bug."),
        ];
        let patterns = extract_patterns(&findings, "o/r", Some(7));
        let ids: Vec<_> = patterns.iter().map(|p| p.extracted_from.clone().unwrap()).collect();
        assert_eq!(ids, vec!["1".to_string(), "3".to_string()]);
    }

    #[test]
    fn first_sentence_stops_at_period_or_length_cap() {
        assert_eq!(first_sentence("Hello world. more stuff", 200), "Hello world");
        let long = "a".repeat(300);
        assert_eq!(first_sentence(&long, 200).chars().count(), 200);
    }

    #[test]
    fn update_skips_duplicate_repo_pattern_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eco.json");
        let p1 = EcosystemPattern {
            repo: "o/r".to_string(),
            pr: Some(1),
            pattern: "x".to_string(),
            connection: "c".to_string(),
            extracted_from: None,
            confidence: None,
        };
        update(&path, &[p1.clone()]);
        update(&path, &[p1]);
        let ctx: EcosystemContext = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(ctx.patterns.len(), 1);
    }

    #[test]
    fn update_evicts_oldest_past_cap_of_twenty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eco.json");
        let patterns: Vec<EcosystemPattern> = (0..25)
            .map(|i| EcosystemPattern {
                repo: "o/r".to_string(),
                pr: None,
                pattern: format!("p{i}"),
                connection: "c".to_string(),
                extracted_from: None,
                confidence: None,
            })
            .collect();
        update(&path, &patterns);
        let ctx: EcosystemContext = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(ctx.patterns.len(), 20);
        assert_eq!(ctx.patterns[0].pattern, "p5");
    }

    #[test]
    fn update_with_empty_patterns_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eco.json");
        update(&path, &[]);
        assert!(!path.exists());
    }
}
