//! Strict-but-open-world parser for the findings block embedded in a model
//! response: `<!-- bridge-findings-start -->` ... fenced JSON ... `<!-- bridge-findings-end -->`.
//!
//! Required fields (`id`, `severity`, `category`) make the whole block
//! reject if any finding is missing one. Everything else is preserved
//! verbatim so later pipeline stages can carry fields this parser doesn't
//! know about (open-world schema).

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub const START_MARKER: &str = "<!-- bridge-findings-start -->";
pub const END_MARKER: &str = "<!-- bridge-findings-end -->";

#[derive(Debug, Error)]
pub enum FindingsError {
    #[error("start/end markers not found")]
    MarkersNotFound,
    #[error("no fenced code block between markers")]
    NoFencedBlock,
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported schema_version (expected 1)")]
    UnsupportedSchemaVersion,
    #[error("`findings` is not an array")]
    FindingsNotArray,
    #[error("finding at index {0} is missing a required string field: {1}")]
    MissingRequiredField(usize, &'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub id: String,
    pub severity: String,
    pub category: String,
    pub title: Option<String>,
    pub file: Option<String>,
    pub description: Option<String>,
    pub suggestion: Option<String>,
    pub confidence: Option<f64>,
    /// Unknown fields preserved verbatim (open-world schema).
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FindingsBlock {
    pub schema_version: u8,
    pub findings: Vec<Finding>,
}

const RECOGNIZED_FIELDS: &[&str] = &[
    "id",
    "severity",
    "category",
    "title",
    "file",
    "description",
    "suggestion",
    "confidence",
];

/// Rank used to order severities for display/sort purposes:
/// `CRITICAL > HIGH > MEDIUM > LOW > PRAISE > SPECULATION`, unknown
/// severities rank alongside `SPECULATION`.
pub fn severity_rank(severity: &str) -> u8 {
    match severity.to_ascii_uppercase().as_str() {
        "CRITICAL" => 5,
        "HIGH" => 4,
        "MEDIUM" => 3,
        "LOW" => 2,
        "PRAISE" => 1,
        _ => 0,
    }
}

pub fn is_critical(severity: &str) -> bool {
    severity.eq_ignore_ascii_case("CRITICAL")
}

pub fn any_critical(findings: &[Finding]) -> bool {
    findings.iter().any(|f| is_critical(&f.severity))
}

/// Extract the literal substring between `START_MARKER` and `END_MARKER`,
/// not including the markers themselves.
fn extract_marked_region(text: &str) -> Result<&str, FindingsError> {
    let start = text.find(START_MARKER).ok_or(FindingsError::MarkersNotFound)?;
    let after_start = start + START_MARKER.len();
    let end_rel = text[after_start..]
        .find(END_MARKER)
        .ok_or(FindingsError::MarkersNotFound)?;
    Ok(&text[after_start..after_start + end_rel])
}

/// Strip a ` ```json ... ``` ` or bare ` ``` ... ``` ` fence, returning the
/// inner content. Requires an actual fence (unlike a generic markdown
/// stripper) since the region between markers is expected to carry one.
fn strip_fence(region: &str) -> Result<&str, FindingsError> {
    let trimmed = region.trim();
    let rest = trimmed.strip_prefix("```").ok_or(FindingsError::NoFencedBlock)?;
    let after_tag = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => return Err(FindingsError::NoFencedBlock),
    };
    let close = after_tag.rfind("```").ok_or(FindingsError::NoFencedBlock)?;
    Ok(after_tag[..close].trim())
}

fn parse_finding(index: usize, v: &Value) -> Result<Finding, FindingsError> {
    let obj = v
        .as_object()
        .ok_or(FindingsError::MissingRequiredField(index, "id"))?;

    let req_str = |field: &'static str| -> Result<String, FindingsError> {
        obj.get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(FindingsError::MissingRequiredField(index, field))
    };

    let id = req_str("id")?;
    let severity = req_str("severity")?;
    let category = req_str("category")?;

    let opt_str = |field: &str| obj.get(field).and_then(Value::as_str).map(str::to_string);

    let confidence = obj
        .get("confidence")
        .and_then(Value::as_f64)
        .filter(|c| (0.0..=1.0).contains(c));

    let mut extra = obj.clone();
    for field in RECOGNIZED_FIELDS {
        extra.remove(*field);
    }

    Ok(Finding {
        id,
        severity,
        category,
        title: opt_str("title"),
        file: opt_str("file"),
        description: opt_str("description"),
        suggestion: opt_str("suggestion"),
        confidence,
        extra,
    })
}

/// Parse the findings block found anywhere within `text`. Rejects if the
/// markers or fence are absent, `schema_version != 1`, `findings` is not an
/// array, or any element lacks a string `id`/`severity`/`category`.
pub fn parse_findings_block(text: &str) -> Result<FindingsBlock, FindingsError> {
    let region = extract_marked_region(text)?;
    let fenced = strip_fence(region)?;
    let root: Value = serde_json::from_str(fenced)?;

    let schema_version = root.get("schema_version").and_then(Value::as_u64);
    if schema_version != Some(1) {
        return Err(FindingsError::UnsupportedSchemaVersion);
    }

    let raw_findings = root
        .get("findings")
        .and_then(Value::as_array)
        .ok_or(FindingsError::FindingsNotArray)?;

    let findings = raw_findings
        .iter()
        .enumerate()
        .map(|(i, v)| parse_finding(i, v))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(FindingsBlock {
        schema_version: 1,
        findings,
    })
}

/// Render a [`FindingsBlock`] back into its marker-delimited fenced form,
/// the inverse of [`parse_findings_block`].
pub fn render_findings_block(block: &FindingsBlock) -> String {
    let mut root = serde_json::Map::new();
    root.insert("schema_version".to_string(), Value::from(block.schema_version));
    let findings: Vec<Value> = block
        .findings
        .iter()
        .map(|f| {
            let mut obj = f.extra.clone();
            obj.insert("id".to_string(), Value::from(f.id.clone()));
            obj.insert("severity".to_string(), Value::from(f.severity.clone()));
            obj.insert("category".to_string(), Value::from(f.category.clone()));
            if let Some(t) = &f.title {
                obj.insert("title".to_string(), Value::from(t.clone()));
            }
            if let Some(fl) = &f.file {
                obj.insert("file".to_string(), Value::from(fl.clone()));
            }
            if let Some(d) = &f.description {
                obj.insert("description".to_string(), Value::from(d.clone()));
            }
            if let Some(s) = &f.suggestion {
                obj.insert("suggestion".to_string(), Value::from(s.clone()));
            }
            if let Some(c) = f.confidence {
                obj.insert("confidence".to_string(), Value::from(c));
            }
            Value::Object(obj)
        })
        .collect();
    root.insert("findings".to_string(), Value::Array(findings));
    let body = serde_json::to_string_pretty(&Value::Object(root)).unwrap_or_default();
    format!("{START_MARKER}\n```json\n{body}\n```\n{END_MARKER}")
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ConfidenceStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub count: usize,
}

/// Computes stats over the findings that carry a valid `confidence`,
/// silently skipping those that don't.
pub fn confidence_stats(findings: &[Finding]) -> Option<ConfidenceStats> {
    let values: Vec<f64> = findings.iter().filter_map(|f| f.confidence).collect();
    if values.is_empty() {
        return None;
    }
    let count = values.len();
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let mean = values.iter().sum::<f64>() / count as f64;
    Some(ConfidenceStats { min, max, mean, count })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrap(json: &str) -> String {
        format!("before\n{START_MARKER}\n```json\n{json}\n```\n{END_MARKER}\nafter")
    }

    #[test]
    fn parses_valid_block_with_all_fields() {
        let json = r#"{"schema_version":1,"findings":[
            {"id":"F001","severity":"HIGH","category":"security","confidence":0.75,"extra_field":"kept"}
        ]}"#;
        let block = parse_findings_block(&wrap(json)).unwrap();
        assert_eq!(block.findings.len(), 1);
        let f = &block.findings[0];
        assert_eq!(f.id, "F001");
        assert_eq!(f.severity, "HIGH");
        assert_eq!(f.confidence, Some(0.75));
        assert_eq!(f.extra.get("extra_field").unwrap().as_str(), Some("kept"));
    }

    #[test]
    fn rejects_missing_markers() {
        assert!(matches!(
            parse_findings_block("no markers here"),
            Err(FindingsError::MarkersNotFound)
        ));
    }

    #[test]
    fn rejects_wrong_schema_version() {
        let json = r#"{"schema_version":2,"findings":[]}"#;
        assert!(matches!(
            parse_findings_block(&wrap(json)),
            Err(FindingsError::UnsupportedSchemaVersion)
        ));
    }

    #[test]
    fn rejects_non_array_findings() {
        let json = r#"{"schema_version":1,"findings":{}}"#;
        assert!(matches!(
            parse_findings_block(&wrap(json)),
            Err(FindingsError::FindingsNotArray)
        ));
    }

    #[test]
    fn rejects_finding_missing_required_field() {
        let json = r#"{"schema_version":1,"findings":[{"id":"F1","severity":"LOW"}]}"#;
        assert!(matches!(
            parse_findings_block(&wrap(json)),
            Err(FindingsError::MissingRequiredField(0, "category"))
        ));
    }

    #[test]
    fn silently_drops_out_of_range_confidence() {
        let json = r#"{"schema_version":1,"findings":[
            {"id":"F1","severity":"LOW","category":"style","confidence":1.5}
        ]}"#;
        let block = parse_findings_block(&wrap(json)).unwrap();
        assert_eq!(block.findings[0].confidence, None);
    }

    #[test]
    fn silently_drops_wrong_type_confidence() {
        let json = r#"{"schema_version":1,"findings":[
            {"id":"F1","severity":"LOW","category":"style","confidence":"high"}
        ]}"#;
        let block = parse_findings_block(&wrap(json)).unwrap();
        assert_eq!(block.findings[0].confidence, None);
    }

    #[test]
    fn roundtrip_preserves_ids_severity_category_and_unknown_fields() {
        let json = r#"{"schema_version":1,"findings":[
            {"id":"F1","severity":"CRITICAL","category":"security","confidence":0.9,"custom":{"a":1}}
        ]}"#;
        let block = parse_findings_block(&wrap(json)).unwrap();
        let rendered = render_findings_block(&block);
        let reparsed = parse_findings_block(&rendered).unwrap();
        assert_eq!(reparsed.findings[0].id, "F1");
        assert_eq!(reparsed.findings[0].severity, "CRITICAL");
        assert_eq!(reparsed.findings[0].category, "security");
        assert_eq!(reparsed.findings[0].confidence, Some(0.9));
        assert!(reparsed.findings[0].extra.contains_key("custom"));
    }

    #[test]
    fn severity_rank_orders_as_specified() {
        assert!(severity_rank("CRITICAL") > severity_rank("HIGH"));
        assert!(severity_rank("HIGH") > severity_rank("MEDIUM"));
        assert!(severity_rank("MEDIUM") > severity_rank("LOW"));
        assert!(severity_rank("LOW") > severity_rank("PRAISE"));
        assert!(severity_rank("PRAISE") > severity_rank("SPECULATION"));
    }

    #[test]
    fn any_critical_detects_case_insensitively() {
        let findings = vec![Finding {
            id: "F1".into(),
            severity: "critical".into(),
            category: "x".into(),
            title: None,
            file: None,
            description: None,
            suggestion: None,
            confidence: None,
            extra: Default::default(),
        }];
        assert!(any_critical(&findings));
    }

    #[test]
    fn confidence_stats_skips_missing_values() {
        let mk = |conf: Option<f64>| Finding {
            id: "F".into(),
            severity: "LOW".into(),
            category: "x".into(),
            title: None,
            file: None,
            description: None,
            suggestion: None,
            confidence: conf,
            extra: Default::default(),
        };
        let findings = vec![mk(Some(0.2)), mk(None), mk(Some(0.8))];
        let stats = confidence_stats(&findings).unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.min, 0.2);
        assert_eq!(stats.max, 0.8);
    }
}
