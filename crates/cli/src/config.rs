//! Layered `RunConfig` loader: CLI > environment > config file >
//! auto-detect > built-in default, mirroring the corpus's own
//! CLI-overrides-file-overrides-defaults merge idiom.

use crate::error::CliError;
use revbot_pipeline::{RepoRef, ReviewMode, RunConfig, SanitizerMode};
use revbot_truncate::detect_framework;
use revbot_validation::validate_identifier;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = ".revbot/config.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub repos: Option<Vec<String>>,
    pub target_pr: Option<u64>,
    pub model: Option<String>,
    pub max_input_tokens: Option<u64>,
    pub max_output_tokens: Option<u64>,
    pub max_diff_bytes: Option<u64>,
    pub max_prs: Option<usize>,
    pub max_files_per_pr: Option<usize>,
    pub exclude_patterns: Option<Vec<String>>,
    pub sanitizer_mode: Option<String>,
    pub max_runtime_minutes: Option<u64>,
    pub review_mode: Option<String>,
    pub persona: Option<String>,
    pub persona_file_path: Option<PathBuf>,
    pub ecosystem_context_path: Option<PathBuf>,
    pub pass1_cache_enabled: Option<bool>,
    pub force_full_review: Option<bool>,
    pub loa_aware: Option<bool>,
    pub wal_path: Option<PathBuf>,
    pub context_store_path: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub review_marker: Option<String>,
    pub max_retries: Option<u32>,
    pub compaction_threshold: Option<f64>,
    pub compaction_min_entries: Option<usize>,
    pub repo_root: Option<PathBuf>,
}

/// The subset of `RunConfig` a human can set from the `run` subcommand
/// directly; everything else comes from env, file, auto-detect, or
/// built-in default.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub dry_run: bool,
    pub repos: Vec<String>,
    pub target_pr: Option<u64>,
    pub config_path: Option<PathBuf>,
}

pub fn parse_config(content: &str) -> Result<ConfigFile, CliError> {
    Ok(toml::from_str(content)?)
}

fn file_layer(explicit: Option<&Path>) -> Result<ConfigFile, CliError> {
    match explicit {
        Some(path) => {
            if !path.exists() {
                return Err(CliError::Config(format!("config file not found: {}", path.display())));
            }
            parse_config(&std::fs::read_to_string(path)?)
        }
        None => {
            let path = Path::new(DEFAULT_CONFIG_FILE);
            if path.exists() {
                parse_config(&std::fs::read_to_string(path)?)
            } else {
                Ok(ConfigFile::default())
            }
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_bool(name: &str) -> Option<bool> {
    env_var(name).and_then(|v| match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    })
}

fn env_list(name: &str) -> Option<Vec<String>> {
    env_var(name).map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
}

/// Reads the `REVBOT_*` environment layer into the same shape as the
/// file layer, so both can merge through one `.or()` chain.
fn env_layer() -> ConfigFile {
    ConfigFile {
        repos: env_list("REVBOT_REPOS"),
        target_pr: env_var("REVBOT_TARGET_PR").and_then(|v| v.parse().ok()),
        model: env_var("REVBOT_MODEL"),
        max_input_tokens: env_var("REVBOT_MAX_INPUT_TOKENS").and_then(|v| v.parse().ok()),
        max_output_tokens: env_var("REVBOT_MAX_OUTPUT_TOKENS").and_then(|v| v.parse().ok()),
        max_diff_bytes: env_var("REVBOT_MAX_DIFF_BYTES").and_then(|v| v.parse().ok()),
        max_prs: env_var("REVBOT_MAX_PRS").and_then(|v| v.parse().ok()),
        max_files_per_pr: env_var("REVBOT_MAX_FILES_PER_PR").and_then(|v| v.parse().ok()),
        exclude_patterns: env_list("REVBOT_EXCLUDE_PATTERNS"),
        sanitizer_mode: env_var("REVBOT_SANITIZER_MODE"),
        max_runtime_minutes: env_var("REVBOT_MAX_RUNTIME_MINUTES").and_then(|v| v.parse().ok()),
        review_mode: env_var("REVBOT_REVIEW_MODE"),
        persona: env_var("REVBOT_PERSONA"),
        persona_file_path: env_var("REVBOT_PERSONA_FILE_PATH").map(PathBuf::from),
        ecosystem_context_path: env_var("REVBOT_ECOSYSTEM_CONTEXT_PATH").map(PathBuf::from),
        pass1_cache_enabled: env_bool("REVBOT_PASS1_CACHE_ENABLED"),
        force_full_review: env_bool("REVBOT_FORCE_FULL_REVIEW"),
        loa_aware: env_bool("REVBOT_LOA_AWARE"),
        wal_path: env_var("REVBOT_WAL_PATH").map(PathBuf::from),
        context_store_path: env_var("REVBOT_CONTEXT_STORE_PATH").map(PathBuf::from),
        cache_dir: env_var("REVBOT_CACHE_DIR").map(PathBuf::from),
        review_marker: env_var("REVBOT_REVIEW_MARKER"),
        max_retries: env_var("REVBOT_MAX_RETRIES").and_then(|v| v.parse().ok()),
        compaction_threshold: env_var("REVBOT_COMPACTION_THRESHOLD").and_then(|v| v.parse().ok()),
        compaction_min_entries: env_var("REVBOT_COMPACTION_MIN_ENTRIES").and_then(|v| v.parse().ok()),
        repo_root: env_var("REVBOT_REPO_ROOT").map(PathBuf::from),
    }
}

fn parse_repos(raw: &[String]) -> Result<Vec<RepoRef>, CliError> {
    raw.iter()
        .map(|s| {
            let (owner, repo) = s
                .split_once('/')
                .ok_or_else(|| CliError::Config(format!("invalid repo {s:?}, expected OWNER/NAME")))?;
            validate_identifier(owner)?;
            validate_identifier(repo)?;
            Ok(RepoRef { owner: owner.to_string(), repo: repo.to_string() })
        })
        .collect()
}

fn parse_sanitizer_mode(s: &str) -> Result<SanitizerMode, CliError> {
    match s {
        "default" => Ok(SanitizerMode::Default),
        "strict" => Ok(SanitizerMode::Strict),
        other => Err(CliError::Config(format!("unknown sanitizer_mode: {other} (expected: default, strict)"))),
    }
}

fn parse_review_mode(s: &str) -> Result<ReviewMode, CliError> {
    match s {
        "single-pass" => Ok(ReviewMode::SinglePass),
        "two-pass" => Ok(ReviewMode::TwoPass),
        other => Err(CliError::Config(format!("unknown review_mode: {other} (expected: single-pass, two-pass)"))),
    }
}

/// Resolves a `RunConfig` from CLI overrides plus the environment,
/// config-file, auto-detect, and built-in-default layers, in that
/// precedence order.
pub fn load(cli: CliOverrides) -> Result<RunConfig, CliError> {
    let env = env_layer();
    let file = file_layer(cli.config_path.as_deref())?;

    let repo_root = file.repo_root.clone().or_else(|| env.repo_root.clone()).unwrap_or_else(|| PathBuf::from("."));

    let repo_strings: Vec<String> = if !cli.repos.is_empty() {
        cli.repos.clone()
    } else {
        env.repos.clone().or_else(|| file.repos.clone()).unwrap_or_default()
    };
    let repos = parse_repos(&repo_strings)?;

    let target_pr = cli.target_pr.or(env.target_pr).or(file.target_pr);
    if target_pr.is_some() && repos.len() != 1 {
        return Err(CliError::Config("target_pr requires exactly one configured repo".to_string()));
    }

    let sanitizer_mode = parse_sanitizer_mode(
        &env.sanitizer_mode.clone().or_else(|| file.sanitizer_mode.clone()).unwrap_or_else(|| "default".to_string()),
    )?;
    let review_mode = parse_review_mode(
        &env.review_mode.clone().or_else(|| file.review_mode.clone()).unwrap_or_else(|| "two-pass".to_string()),
    )?;

    let loa_aware_override = env.loa_aware.or(file.loa_aware);
    let loa_aware = Some(loa_aware_override.unwrap_or_else(|| detect_framework(&repo_root, None).on));

    Ok(RunConfig {
        repos,
        target_pr,
        model: env.model.or(file.model).unwrap_or_else(|| "gpt-4o-mini".to_string()),
        max_input_tokens: env.max_input_tokens.or(file.max_input_tokens).unwrap_or(128_000),
        max_output_tokens: env.max_output_tokens.or(file.max_output_tokens).unwrap_or(4_096),
        max_diff_bytes: env.max_diff_bytes.or(file.max_diff_bytes).unwrap_or(200_000),
        max_prs: env.max_prs.or(file.max_prs).unwrap_or(20),
        max_files_per_pr: env.max_files_per_pr.or(file.max_files_per_pr).unwrap_or(50),
        exclude_patterns: env.exclude_patterns.or(file.exclude_patterns).unwrap_or_default(),
        sanitizer_mode,
        max_runtime_minutes: env.max_runtime_minutes.or(file.max_runtime_minutes).unwrap_or(25),
        review_mode,
        persona: env.persona.or(file.persona),
        persona_file_path: env.persona_file_path.or(file.persona_file_path),
        ecosystem_context_path: env.ecosystem_context_path.or(file.ecosystem_context_path),
        pass1_cache_enabled: env.pass1_cache_enabled.or(file.pass1_cache_enabled).unwrap_or(true),
        force_full_review: env.force_full_review.or(file.force_full_review).unwrap_or(false),
        loa_aware,
        wal_path: env.wal_path.or(file.wal_path).unwrap_or_else(|| repo_root.join(".revbot").join("wal.jsonl")),
        context_store_path: env
            .context_store_path
            .or(file.context_store_path)
            .unwrap_or_else(|| repo_root.join(".revbot").join("context.json")),
        cache_dir: env.cache_dir.or(file.cache_dir).unwrap_or_else(|| repo_root.join(".revbot").join("cache")),
        dry_run: cli.dry_run,
        review_marker: env.review_marker.or(file.review_marker).unwrap_or_else(|| "revbot-review".to_string()),
        max_retries: env.max_retries.or(file.max_retries).unwrap_or(3),
        compaction_threshold: env.compaction_threshold.or(file.compaction_threshold).unwrap_or(0.5),
        compaction_min_entries: env.compaction_min_entries.or(file.compaction_min_entries).unwrap_or(50),
        repo_root,
    })
}
