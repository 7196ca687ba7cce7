//! Diff prioritization and progressive truncation: fit a PR's changed
//! files into a token budget by excluding framework-owned noise first,
//! then dropping low-priority files, then shrinking hunk context, then
//! falling back to stats-only.
//!
//! Framework-awareness follows the project-type-detection idiom of
//! marker-file probing (see `detect_framework`), generalized from a
//! single marker existence check to a semver-carrying marker so the
//! detected framework also reports a version.

use globset::Glob;
use regex::Regex;
use revbot_host::PullRequestFile;
use std::fs;
use std::path::Path;

/// Per-model token accounting. `coefficient` is tokens-per-character;
/// `0.25` is the corpus-wide default (4 characters per token).
#[derive(Debug, Clone, Copy)]
pub struct Model {
    pub max_input: u64,
    pub max_output: u64,
    pub coefficient: f64,
}

impl Default for Model {
    fn default() -> Self {
        Self { max_input: 128_000, max_output: 4_096, coefficient: 0.25 }
    }
}

pub fn estimate_tokens(len: usize, coefficient: f64) -> u64 {
    (len as f64 * coefficient).ceil() as u64
}

/// Leaves 10% headroom for the model's response.
pub fn effective_target(budget: u64) -> u64 {
    (budget as f64 * 0.9).floor() as u64
}

#[derive(Debug, Clone, Default)]
pub struct FrameworkInfo {
    pub on: bool,
    pub version: Option<String>,
    pub source: Option<String>,
}

const FRAMEWORK_MARKER_FILE: &str = ".loa-version.json";
static SEMVER_RE: &str = r"\d+\.\d+\.\d+";

/// Reads `.loa-version.json` at the repo root, a marker file whose
/// `framework_version` field carries a semver string. `config_override`
/// (the `loaAware` config key) forces framework-awareness on or off
/// regardless of marker presence.
pub fn detect_framework(repo_root: &Path, config_override: Option<bool>) -> FrameworkInfo {
    if let Some(forced) = config_override {
        if !forced {
            return FrameworkInfo { on: false, version: None, source: None };
        }
    }

    let marker_path = repo_root.join(FRAMEWORK_MARKER_FILE);
    let Ok(contents) = fs::read_to_string(&marker_path) else {
        return FrameworkInfo { on: false, version: None, source: None };
    };

    let version = serde_json::from_str::<serde_json::Value>(&contents)
        .ok()
        .and_then(|v| v.get("framework_version").and_then(|fv| fv.as_str()).map(|s| s.to_string()))
        .or_else(|| {
            let re = Regex::new(SEMVER_RE).expect("static semver pattern is valid");
            re.find(contents.trim()).map(|m| m.as_str().to_string())
        });

    FrameworkInfo {
        on: version.is_some(),
        version,
        source: Some(marker_path.display().to_string()),
    }
}

/// System zones and their matching exclude globs, kept in lockstep:
/// every zone prefix below has a corresponding glob pattern. `loa`
/// (life-operating-system-style grimoire framework) is the default
/// recognized framework, matching the marker file above.
fn framework_zone_globs() -> Vec<&'static str> {
    vec!["grimoires/loa/**", "generated/**", "vendor/**", "dist/**", "build/**", "*.generated.*"]
}

fn matches_any_glob(patterns: &[&str], path: &str) -> bool {
    patterns.iter().any(|pattern| {
        Glob::new(pattern)
            .map(|g| g.compile_matcher().is_match(path))
            .unwrap_or(false)
    })
}

fn is_security_sensitive(filename: &str) -> bool {
    let re = Regex::new(
        r"(?i)(auth|login|session|jwt|oauth|crypt|cipher|secret|\.github/workflows|ci\.ya?ml|terraform|\.tf$|cloudformation|pulumi|package-lock\.json|yarn\.lock|Cargo\.lock|poetry\.lock|policy)",
    )
    .expect("static security pattern is valid");
    re.is_match(filename)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// High-risk security file outside framework zones: never excluded, never demoted.
    Exception,
    /// Inside a framework zone (or a non-workflow infra/script file): included as a one-hunk summary.
    Tier2,
    /// Framework docs or unknown-extension files under framework zones: fully excluded.
    Tier1,
    /// Not framework-owned at all.
    Normal,
}

fn is_tier2_extension(filename: &str) -> bool {
    filename.ends_with(".sh")
        || filename.ends_with(".ts")
        || filename.ends_with(".json")
        || filename.starts_with("infra/")
        || (filename.starts_with(".github/") && !filename.starts_with(".github/workflows/"))
}

fn is_tier1_extension(filename: &str) -> bool {
    filename.ends_with(".md")
}

pub fn classify(file: &PullRequestFile, framework: &FrameworkInfo) -> Tier {
    if !framework.on {
        return Tier::Normal;
    }
    let zones = framework_zone_globs();
    let in_zone = matches_any_glob(&zones, &file.filename);

    if is_security_sensitive(&file.filename) && !in_zone {
        return Tier::Exception;
    }
    if !in_zone {
        return Tier::Normal;
    }
    if is_security_sensitive(&file.filename) || is_tier2_extension(&file.filename) {
        return Tier::Tier2;
    }
    Tier::Tier1
}

fn is_adjacent_test(file: &PullRequestFile, all: &[PullRequestFile]) -> bool {
    let path = Path::new(&file.filename);
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return false;
    };
    let Some(dir) = path.parent() else { return false };
    if !(stem.starts_with("test_") || stem.ends_with("_test") || stem.ends_with(".test") || stem.ends_with(".spec")) {
        return false;
    }
    let base = stem
        .trim_start_matches("test_")
        .trim_end_matches("_test")
        .trim_end_matches(".test")
        .trim_end_matches(".spec");
    all.iter().any(|other| {
        other.filename != file.filename
            && Path::new(&other.filename).parent() == Some(dir)
            && Path::new(&other.filename).file_stem().and_then(|s| s.to_str()) == Some(base)
    })
}

fn is_entry_or_config(filename: &str) -> bool {
    let base = Path::new(filename).file_name().and_then(|s| s.to_str()).unwrap_or("");
    matches!(
        base,
        "index.ts" | "index.js" | "main.rs" | "main.go" | "Cargo.toml" | "package.json" | "pyproject.toml" | "go.mod"
    )
}

fn priority(file: &PullRequestFile, all: &[PullRequestFile]) -> u8 {
    if is_security_sensitive(&file.filename) {
        4
    } else if is_adjacent_test(file, all) {
        3
    } else if is_entry_or_config(&file.filename) {
        2
    } else {
        1
    }
}

/// Stable sort: higher priority first; ties broken by larger
/// `additions + deletions`, then by filename ascending.
pub fn prioritize(files: &[PullRequestFile]) -> Vec<PullRequestFile> {
    let mut indexed: Vec<(usize, &PullRequestFile)> = files.iter().enumerate().collect();
    indexed.sort_by(|(ai, a), (bi, b)| {
        let pa = priority(a, files);
        let pb = priority(b, files);
        pb.cmp(&pa)
            .then_with(|| (b.additions + b.deletions).cmp(&(a.additions + a.deletions)))
            .then_with(|| a.filename.cmp(&b.filename))
            .then_with(|| ai.cmp(bi))
    });
    indexed.into_iter().map(|(_, f)| f.clone()).collect()
}

#[derive(Debug, Clone)]
pub struct Hunk {
    pub header: String,
    pub lines: Vec<String>,
}

/// Splits a unified diff patch into `@@ ... @@`-delimited hunks. Lines
/// before the first header are ignored. Empty input yields `[]`.
pub fn parse_hunks(patch: &str) -> Vec<Hunk> {
    let mut hunks = Vec::new();
    let mut current: Option<Hunk> = None;
    for line in patch.lines() {
        if line.starts_with("@@") {
            if let Some(h) = current.take() {
                hunks.push(h);
            }
            current = Some(Hunk { header: line.to_string(), lines: Vec::new() });
        } else if let Some(h) = current.as_mut() {
            h.lines.push(line.to_string());
        }
    }
    if let Some(h) = current.take() {
        hunks.push(h);
    }
    hunks
}

/// Reduces each hunk to `context` lines of unchanged context around
/// every changed (`+`/`-`) line, re-joining into a patch string.
fn reduce_hunk_context(patch: &str, context: usize) -> String {
    let hunks = parse_hunks(patch);
    let mut out = String::new();
    for hunk in hunks {
        out.push_str(&hunk.header);
        out.push('\n');
        let changed: Vec<usize> = hunk
            .lines
            .iter()
            .enumerate()
            .filter(|(_, l)| l.starts_with('+') || l.starts_with('-'))
            .map(|(i, _)| i)
            .collect();
        let mut keep = vec![false; hunk.lines.len()];
        for &i in &changed {
            keep[i] = true;
            for d in 1..=context {
                if i >= d {
                    keep[i - d] = true;
                }
                if i + d < hunk.lines.len() {
                    keep[i + d] = true;
                }
            }
        }
        for (i, line) in hunk.lines.iter().enumerate() {
            if keep[i] {
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    out
}

const SECURITY_FILE_SIZE_CAP_BYTES: usize = 50 * 1024;
const SECURITY_FILE_HUNK_CAP: usize = 10;

fn cap_security_hunks(patch: &str) -> String {
    if patch.len() < SECURITY_FILE_SIZE_CAP_BYTES {
        return patch.to_string();
    }
    let hunks = parse_hunks(patch);
    if hunks.len() <= SECURITY_FILE_HUNK_CAP {
        return patch.to_string();
    }
    let mut out = String::new();
    for hunk in hunks.iter().take(SECURITY_FILE_HUNK_CAP) {
        out.push_str(&hunk.header);
        out.push('\n');
        for line in &hunk.lines {
            out.push_str(line);
            out.push('\n');
        }
    }
    out.push_str(&format!("[{} of {} hunks included]\n", SECURITY_FILE_HUNK_CAP, hunks.len()));
    out
}

#[derive(Debug, Clone)]
pub struct ExcludedFile {
    pub file: String,
    pub stats: String,
}

#[derive(Debug, Clone)]
pub struct TokenEstimate {
    pub persona: u64,
    pub template: u64,
    pub metadata: u64,
    pub diffs: u64,
    pub total: u64,
}

#[derive(Debug, Clone)]
pub struct TruncationResult {
    pub included: Vec<PullRequestFile>,
    pub excluded: Vec<ExcludedFile>,
    pub total_bytes: u64,
    pub level: u8,
    pub disclaimer: Option<String>,
    pub token_estimate: TokenEstimate,
    pub success: bool,
}

fn stats_line(file: &PullRequestFile) -> String {
    format!("+{} -{}", file.additions, file.deletions)
}

fn fixed_tokens(coefficient: f64, system_len: usize, metadata_len: usize) -> u64 {
    estimate_tokens(system_len, coefficient) + estimate_tokens(metadata_len, coefficient)
}

/// Fits `files` into `token_budget` via the three-level progressive
/// state machine described above. `max_diff_bytes` is a hard ceiling on
/// `total_bytes` at Levels 1/2; a file that alone would exceed it is
/// excluded at those levels same as a token-budget overrun, pushing the
/// whole PR toward stats-only when nothing else fits.
pub fn truncate(
    files: &[PullRequestFile],
    token_budget: u64,
    model: &Model,
    system_len: usize,
    metadata_len: usize,
    max_diff_bytes: u64,
) -> TruncationResult {
    let target = effective_target(token_budget);
    let fixed = fixed_tokens(model.coefficient, system_len, metadata_len);
    let prioritized = prioritize(files);

    let level1 = attempt_level(&prioritized, model, fixed, target, 0, max_diff_bytes);
    let has_security_file_included = |r: &TruncationResult| r.included.iter().any(|f| is_security_sensitive(&f.filename));

    if !level1.included.is_empty() && (prioritized.iter().all(|f| !is_security_sensitive(&f.filename)) || has_security_file_included(&level1)) {
        return finish(level1, 1, files.len());
    }

    let level2 = attempt_level(&prioritized, model, fixed, target, 1, max_diff_bytes);
    if !level2.included.is_empty() {
        return finish(level2, 2, files.len());
    }

    let level3 = attempt_stats_only(&prioritized, model, fixed, target);
    if level3.total_bytes_ok {
        return TruncationResult {
            included: level3.included,
            excluded: level3.excluded,
            total_bytes: 0,
            level: 3,
            disclaimer: Some("Summary Review: diffs omitted, stats only".to_string()),
            token_estimate: level3.token_estimate,
            success: true,
        };
    }

    TruncationResult {
        included: Vec::new(),
        excluded: files
            .iter()
            .map(|f| ExcludedFile { file: f.filename.clone(), stats: "excluded by pattern".to_string() })
            .collect(),
        total_bytes: 0,
        level: 3,
        disclaimer: Some("Summary Review: diffs omitted, stats only".to_string()),
        token_estimate: TokenEstimate { persona: 0, template: 0, metadata: 0, diffs: 0, total: fixed },
        success: false,
    }
}

fn finish(mut result: TruncationResult, level: u8, _total_input: usize) -> TruncationResult {
    result.level = level;
    if result.excluded.iter().any(|e| e.stats != "diff unavailable") {
        result.disclaimer = Some("low-priority files excluded".to_string());
    }
    if level == 2 {
        result.disclaimer = Some("hunk context reduced to fit budget".to_string());
    }
    result
}

fn attempt_level(
    prioritized: &[PullRequestFile],
    model: &Model,
    fixed: u64,
    target: u64,
    context_lines: usize,
    max_diff_bytes: u64,
) -> TruncationResult {
    let mut included = Vec::new();
    let mut excluded = Vec::new();
    let mut running = fixed;
    let mut total_bytes = 0u64;

    for file in prioritized {
        let Some(patch) = &file.patch else {
            excluded.push(ExcludedFile { file: file.filename.clone(), stats: "diff unavailable".to_string() });
            continue;
        };

        let candidate_patch = if context_lines > 0 {
            reduce_hunk_context(patch, context_lines)
        } else {
            patch.clone()
        };
        let candidate_patch = if is_security_sensitive(&file.filename) {
            cap_security_hunks(&candidate_patch)
        } else {
            candidate_patch
        };

        let estimate = estimate_tokens(candidate_patch.len(), model.coefficient);
        if running + estimate > target || total_bytes + candidate_patch.len() as u64 > max_diff_bytes {
            excluded.push(ExcludedFile { file: file.filename.clone(), stats: stats_line(file) });
            continue;
        }

        running += estimate;
        total_bytes += candidate_patch.len() as u64;
        let mut included_file = file.clone();
        included_file.patch = Some(candidate_patch);
        included.push(included_file);
    }

    TruncationResult {
        included,
        excluded,
        total_bytes,
        level: 1,
        disclaimer: None,
        token_estimate: TokenEstimate { persona: 0, template: 0, metadata: 0, diffs: running - fixed, total: running },
        success: true,
    }
}

struct StatsOnlyResult {
    included: Vec<PullRequestFile>,
    excluded: Vec<ExcludedFile>,
    token_estimate: TokenEstimate,
    total_bytes_ok: bool,
}

fn attempt_stats_only(prioritized: &[PullRequestFile], model: &Model, fixed: u64, target: u64) -> StatsOnlyResult {
    let mut included = Vec::new();
    let mut running = fixed;
    for file in prioritized {
        let line = stats_line(file);
        let estimate = estimate_tokens(line.len(), model.coefficient);
        if running + estimate > target {
            return StatsOnlyResult {
                included,
                excluded: Vec::new(),
                token_estimate: TokenEstimate { persona: 0, template: 0, metadata: 0, diffs: running - fixed, total: running },
                total_bytes_ok: false,
            };
        }
        running += estimate;
        let mut stats_file = file.clone();
        stats_file.patch = None;
        included.push(stats_file);
    }
    StatsOnlyResult {
        included,
        excluded: Vec::new(),
        token_estimate: TokenEstimate { persona: 0, template: 0, metadata: 0, diffs: running - fixed, total: running },
        total_bytes_ok: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, additions: u64, deletions: u64, patch: Option<&str>) -> PullRequestFile {
        PullRequestFile {
            filename: name.to_string(),
            status: revbot_host::FileStatus::Modified,
            additions,
            deletions,
            patch: patch.map(|s| s.to_string()),
        }
    }

    #[test]
    fn empty_patch_parses_to_no_hunks() {
        assert!(parse_hunks("").is_empty());
    }

    #[test]
    fn parse_hunks_ignores_preamble_and_splits_on_headers() {
        let patch = "diff --git a/x b/x\n--- a/x\n+++ b/x\n@@ -1,2 +1,2 @@\n-a\n+b\n context\n@@ -10,1 +10,1 @@\n+c\n";
        let hunks = parse_hunks(patch);
        assert_eq!(hunks.len(), 2);
        assert_eq!(hunks[0].lines.len(), 3);
    }

    #[test]
    fn prioritize_orders_security_above_everything_and_breaks_ties_by_size_then_name() {
        let files = vec![
            file("src/app.rs", 2, 1, Some("x")),
            file("src/auth/login.rs", 1, 1, Some("x")),
            file("README.md", 50, 0, Some("x")),
        ];
        let ordered = prioritize(&files);
        assert_eq!(ordered[0].filename, "src/auth/login.rs");
    }

    #[test]
    fn classify_without_framework_is_always_normal() {
        let info = FrameworkInfo { on: false, version: None, source: None };
        let f = file("generated/x.ts", 1, 1, Some("x"));
        assert_eq!(classify(&f, &info), Tier::Normal);
    }

    #[test]
    fn classify_security_outside_zone_is_exception() {
        let info = FrameworkInfo { on: true, version: Some("1.0.0".into()), source: None };
        let f = file("src/auth/session.rs", 1, 1, Some("x"));
        assert_eq!(classify(&f, &info), Tier::Exception);
    }

    #[test]
    fn classify_doc_under_zone_is_tier1() {
        let info = FrameworkInfo { on: true, version: Some("1.0.0".into()), source: None };
        let f = file("generated/readme.md", 1, 1, Some("x"));
        assert_eq!(classify(&f, &info), Tier::Tier1);
    }

    #[test]
    fn detect_framework_reads_loa_version_marker() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".loa-version.json"), r#"{"framework_version": "1.31.0"}"#).unwrap();
        let info = detect_framework(dir.path(), None);
        assert!(info.on);
        assert_eq!(info.version.as_deref(), Some("1.31.0"));
    }

    #[test]
    fn detect_framework_config_override_forces_off() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".loa-version.json"), r#"{"framework_version": "1.31.0"}"#).unwrap();
        let info = detect_framework(dir.path(), Some(false));
        assert!(!info.on);
    }

    #[test]
    fn scenario_loa_marker_excludes_grimoire_md_and_passes_through_app_source() {
        let info = FrameworkInfo { on: true, version: Some("1.31.0".into()), source: None };
        let doc = file("grimoires/loa/prd.md", 1, 1, Some("x"));
        let app = file("src/app.ts", 5, 3, Some("x"));
        assert_eq!(classify(&doc, &info), Tier::Tier1);
        assert_eq!(classify(&app, &info), Tier::Normal);
    }

    #[test]
    fn truncate_includes_all_files_when_budget_is_generous() {
        let files = vec![file("a.rs", 1, 1, Some("@@ -1,1 +1,1 @@\n-a\n+b\n"))];
        let model = Model::default();
        let result = truncate(&files, 10_000, &model, 100, 100, u64::MAX);
        assert!(result.success);
        assert_eq!(result.included.len(), 1);
        assert!(result.excluded.is_empty());
    }

    #[test]
    fn truncate_drops_tail_under_tight_budget_and_sets_disclaimer() {
        let files = vec![
            file("src/auth/a.rs", 1, 1, Some(&"x".repeat(200))),
            file("docs/notes.md", 1, 1, Some(&"y".repeat(2000))),
        ];
        let model = Model::default();
        let result = truncate(&files, 120, &model, 10, 10, u64::MAX);
        assert!(result.success);
        assert!(!result.excluded.is_empty());
        assert!(result.disclaimer.is_some());
    }

    #[test]
    fn truncate_falls_back_to_stats_only_when_diffs_never_fit() {
        let files = vec![file("a.rs", 1, 1, Some(&"x".repeat(100_000)))];
        let model = Model { max_input: 100, max_output: 10, coefficient: 0.25 };
        let result = truncate(&files, 30, &model, 1, 1, u64::MAX);
        assert_eq!(result.level, 3);
        if result.success {
            assert!(result.included[0].patch.is_none());
        }
    }

    #[test]
    fn truncate_enforces_max_diff_bytes_ceiling_even_with_generous_token_budget() {
        let huge_patch = format!("@@ -1,1 +1,1 @@\n+{}\n", "x".repeat(5_000));
        let files = vec![file("a.rs", 1, 1, Some(&huge_patch))];
        let model = Model::default();
        let result = truncate(&files, 1_000_000, &model, 100, 100, 1_000);
        assert_eq!(result.level, 3);
        assert!(result.success);
        assert!(result.total_bytes <= 1_000);
        assert!(result.included.iter().all(|f| f.patch.is_none()));
    }

    #[test]
    fn security_file_hunk_cap_marks_truncation() {
        let mut many_hunks = String::new();
        for i in 0..20 {
            many_hunks.push_str(&format!("@@ -{i},1 +{i},1 @@\n-x\n+y\n"));
        }
        let padded = format!("{}{}", many_hunks, "z".repeat(60 * 1024));
        let capped = cap_security_hunks(&padded);
        assert!(capped.contains("10 of 20 hunks included"));
    }
}
