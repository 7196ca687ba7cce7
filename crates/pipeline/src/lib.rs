//! Review pipeline orchestrator: preflight, per-item loop (idempotency,
//! progressive truncation, two-pass convergence/enrichment with a
//! preservation guard, sanitization, idempotent post), and run summary.
//!
//! This is the system's core, built against the capability traits
//! `HostClient` and `LlmClient`; the context store, cache, and WAL are
//! used as their concrete default implementations, matching how a
//! single-writer process owns its own state files.

use revbot_cache::{cache_key, CacheEntry, CacheFindings, FileCache};
use revbot_context_store::JsonContextStore;
use revbot_ecosystem::{extract_patterns, update as update_ecosystem};
use revbot_findings::{confidence_stats, parse_findings_block, ConfidenceStats, Finding, FindingsBlock};
use revbot_host::{HostClient, PullRequestFile};
use revbot_llm::{LlmClient, LlmRequest};
use revbot_sanitizer::sanitize;
use revbot_template::{build_convergence, build_enrichment, build_single_pass, item_hash, prompt_hash};
use revbot_truncate::{detect_framework, truncate as truncate_files, Model, Tier};
use revbot_wal::FileWal;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("context store error: {0}")]
    ContextStore(#[from] revbot_context_store::ContextStoreError),
    #[error("wal error: {0}")]
    Wal(#[from] revbot_wal::WalError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewMode {
    SinglePass,
    TwoPass,
}

impl Default for ReviewMode {
    fn default() -> Self {
        ReviewMode::TwoPass
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanitizerMode {
    Default,
    Strict,
}

impl Default for SanitizerMode {
    fn default() -> Self {
        SanitizerMode::Default
    }
}

#[derive(Debug, Clone)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub repos: Vec<RepoRef>,
    pub target_pr: Option<u64>,
    pub model: String,
    pub max_input_tokens: u64,
    pub max_output_tokens: u64,
    pub max_diff_bytes: u64,
    pub max_prs: usize,
    pub max_files_per_pr: usize,
    pub exclude_patterns: Vec<String>,
    pub sanitizer_mode: SanitizerMode,
    pub max_runtime_minutes: u64,
    pub review_mode: ReviewMode,
    pub persona: Option<String>,
    pub persona_file_path: Option<PathBuf>,
    pub ecosystem_context_path: Option<PathBuf>,
    pub pass1_cache_enabled: bool,
    pub force_full_review: bool,
    pub loa_aware: Option<bool>,
    pub wal_path: PathBuf,
    pub context_store_path: PathBuf,
    pub cache_dir: PathBuf,
    pub dry_run: bool,
    pub review_marker: String,
    pub max_retries: u32,
    pub compaction_threshold: f64,
    pub compaction_min_entries: usize,
    pub repo_root: PathBuf,
}

impl RunConfig {
    pub fn quota_threshold(&self) -> u64 {
        100
    }
}

#[derive(Debug, Clone)]
pub struct ReviewItem {
    pub owner: String,
    pub repo: String,
    pub pr: u64,
    pub files: Vec<PullRequestFile>,
    pub hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Comment,
    RequestChanges,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewResult {
    pub owner: String,
    pub repo: String,
    pub pr: u64,
    pub posted: bool,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass1_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass2_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass1_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass1_cache_hit: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass1_confidence_stats: Option<ConfidenceStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona_hash: Option<String>,
}

impl ReviewResult {
    fn skip(item: &ReviewItem, reason: &str) -> Self {
        Self {
            owner: item.owner.clone(),
            repo: item.repo.clone(),
            pr: item.pr,
            posted: false,
            skipped: true,
            skip_reason: Some(reason.to_string()),
            error: None,
            input_tokens: 0,
            output_tokens: 0,
            pass1_tokens: None,
            pass2_tokens: None,
            pass1_output: None,
            pass1_cache_hit: None,
            pass1_confidence_stats: None,
            persona_id: None,
            persona_hash: None,
        }
    }

    fn error(item: &ReviewItem, message: impl Into<String>) -> Self {
        Self {
            owner: item.owner.clone(),
            repo: item.repo.clone(),
            pr: item.pr,
            posted: false,
            skipped: false,
            skip_reason: None,
            error: Some(message.into()),
            input_tokens: 0,
            output_tokens: 0,
            pass1_tokens: None,
            pass2_tokens: None,
            pass1_output: None,
            pass1_cache_hit: None,
            pass1_confidence_stats: None,
            persona_id: None,
            persona_hash: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub start_time: String,
    pub end_time: String,
    pub reviewed: usize,
    pub skipped: usize,
    pub errors: usize,
    pub results: Vec<ReviewResult>,
}

pub struct Orchestrator {
    host: Arc<dyn HostClient>,
    llm: Arc<dyn LlmClient>,
    config: RunConfig,
}

impl Orchestrator {
    pub fn new(host: Arc<dyn HostClient>, llm: Arc<dyn LlmClient>, config: RunConfig) -> Self {
        Self { host, llm, config }
    }

    pub async fn run(&self, run_id: String) -> RunSummary {
        let start = Instant::now();
        let start_time = revbot_common::now_iso8601();
        let mut results = Vec::new();

        let Ok(mut context_store) = JsonContextStore::load(&self.config.context_store_path) else {
            return self.empty_summary(run_id, start_time);
        };
        let wal = FileWal::new(&self.config.wal_path).with_max_retries(self.config.max_retries);
        let cache = self.config.pass1_cache_enabled.then(|| FileCache::new(&self.config.cache_dir));

        match self.host.remaining_quota().await {
            Ok(remaining) if remaining < self.config.quota_threshold() => {
                return self.empty_summary(run_id, start_time);
            }
            Err(_) => {
                // Treat an unreachable quota probe as a soft failure: proceed, since
                // not every host implementation backs this with a real endpoint.
            }
            _ => {}
        }

        for repo in &self.config.repos {
            match self.host.repo_accessible(&repo.owner, &repo.repo).await {
                Ok(true) => {}
                _ => {
                    let placeholder = ReviewItem { owner: repo.owner.clone(), repo: repo.repo.clone(), pr: 0, files: Vec::new(), hash: String::new() };
                    results.push(ReviewResult::skip(&placeholder, "repo_inaccessible"));
                    continue;
                }
            }

            let pr_numbers = if let Some(target) = self.config.target_pr {
                vec![target]
            } else {
                match self.host.list_open_pull_requests(&repo.owner, &repo.repo).await {
                    Ok(mut prs) => {
                        prs.truncate(self.config.max_prs);
                        prs
                    }
                    Err(_) => Vec::new(),
                }
            };

            for number in pr_numbers {
                if start.elapsed().as_secs() > self.config.max_runtime_minutes * 60 {
                    let placeholder = ReviewItem { owner: repo.owner.clone(), repo: repo.repo.clone(), pr: number, files: Vec::new(), hash: String::new() };
                    results.push(ReviewResult::skip(&placeholder, "runtime_limit"));
                    continue;
                }

                let result = self
                    .review_one(repo, number, &mut context_store, &wal, cache.as_ref())
                    .await;
                results.push(result);
            }
        }

        let _ = wal.maybe_compact(self.config.compaction_min_entries, self.config.compaction_threshold);

        self.summarize(run_id, start_time, results)
    }

    fn empty_summary(&self, run_id: String, start_time: String) -> RunSummary {
        RunSummary {
            run_id,
            start_time: start_time.clone(),
            end_time: revbot_common::now_iso8601(),
            reviewed: 0,
            skipped: 0,
            errors: 0,
            results: Vec::new(),
        }
    }

    fn summarize(&self, run_id: String, start_time: String, results: Vec<ReviewResult>) -> RunSummary {
        let reviewed = results.iter().filter(|r| r.posted).count();
        let skipped = results.iter().filter(|r| r.skipped).count();
        let errors = results.iter().filter(|r| r.error.is_some()).count();
        RunSummary { run_id, start_time, end_time: revbot_common::now_iso8601(), reviewed, skipped, errors, results }
    }

    async fn review_one(
        &self,
        repo: &RepoRef,
        number: u64,
        context_store: &mut JsonContextStore,
        wal: &FileWal,
        cache: Option<&FileCache>,
    ) -> ReviewResult {
        let owner = &repo.owner;
        let repo_name = &repo.repo;

        let pr = match self.host.fetch_pull_request(owner, repo_name, number).await {
            Ok(pr) => pr,
            Err(e) => {
                let placeholder = ReviewItem { owner: owner.clone(), repo: repo_name.clone(), pr: number, files: Vec::new(), hash: String::new() };
                return ReviewResult::error(&placeholder, e.to_string());
            }
        };

        let mut files = match self.host.fetch_pull_request_files(owner, repo_name, number).await {
            Ok(files) => files,
            Err(e) => {
                let placeholder = ReviewItem { owner: owner.clone(), repo: repo_name.clone(), pr: number, files: Vec::new(), hash: String::new() };
                return ReviewResult::error(&placeholder, e.to_string());
            }
        };
        files.truncate(self.config.max_files_per_pr);

        let filenames: Vec<String> = files.iter().map(|f| f.filename.clone()).collect();
        let hash = item_hash(&pr.head_sha, &filenames);
        let item = ReviewItem { owner: owner.clone(), repo: repo_name.clone(), pr: number, files: files.clone(), hash: hash.clone() };

        if context_store.get_last_hash(owner, repo_name, number).as_deref() == Some(hash.as_str()) {
            return ReviewResult::skip(&item, "already_reviewed");
        }

        let claimed = context_store.claim_review(owner, repo_name, number, &hash).unwrap_or(false);
        if !claimed {
            return ReviewResult::skip(&item, "claim_failed");
        }

        match self.host.has_review_for_sha(owner, repo_name, number, &self.config.review_marker, &pr.head_sha).await {
            Ok(true) => return ReviewResult::skip(&item, "already_reviewed"),
            _ => {}
        }

        let mut incremental = false;
        if !self.config.force_full_review {
            if let Some(last_sha) = context_store.get_last_reviewed_sha(owner, repo_name, number) {
                match self.host.diff_filenames(owner, repo_name, &last_sha, &pr.head_sha).await {
                    Ok(changed) => {
                        let changed_set: std::collections::HashSet<_> = changed.into_iter().collect();
                        files.retain(|f| changed_set.contains(&f.filename));
                        incremental = true;
                    }
                    Err(_) => {
                        // Diff-source failure: fall back to full review of all files.
                    }
                }
            }
        }

        let framework = detect_framework(&self.config.repo_root, self.config.loa_aware);
        let mut filtered = Vec::new();
        for file in &files {
            match revbot_truncate::classify(file, &framework) {
                Tier::Tier1 => continue,
                _ => filtered.push(file.clone()),
            }
        }
        if filtered.is_empty() && !files.is_empty() {
            return ReviewResult::skip(&item, "all_files_excluded");
        }

        let model = Model { max_input: self.config.max_input_tokens, max_output: self.config.max_output_tokens, coefficient: 0.25 };
        let truncation = truncate_files(&filtered, self.config.max_input_tokens, &model, 200, 200, self.config.max_diff_bytes);
        if !truncation.success {
            return ReviewResult::skip(&item, "cannot_truncate");
        }

        let (body, input_tokens, output_tokens, pass1_tokens, pass2_tokens, pass1_output, pass1_cache_hit, pass1_stats) =
            match self.config.review_mode {
                ReviewMode::SinglePass => {
                    let prompt = build_single_pass(self.config.persona.as_deref(), &pr, &truncation.included, truncation.disclaimer.as_deref(), incremental);
                    let req = LlmRequest::new(self.config.model.as_str(), prompt.system, prompt.user, self.config.max_output_tokens);
                    match self.llm.dispatch(&req).await {
                        Ok(resp) => (
                            resp.normalized.content,
                            resp.normalized.usage.input_tokens.unwrap_or(0),
                            resp.normalized.usage.output_tokens.unwrap_or(0),
                            None,
                            None,
                            None,
                            None,
                            None,
                        ),
                        Err(e) => return ReviewResult::error(&item, e.to_string()),
                    }
                }
                ReviewMode::TwoPass => {
                    match self.two_pass(&pr, &truncation.included, truncation.disclaimer.as_deref(), incremental, cache).await {
                        Ok(outcome) => outcome,
                        Err(e) => return ReviewResult::error(&item, e),
                    }
                }
            };

        if body.trim().is_empty() || !has_required_headings(&body) {
            return ReviewResult::skip(&item, "invalid_llm_response");
        }

        let sanitized = sanitize(&body);
        let final_body = if !sanitized.safe {
            if self.config.sanitizer_mode == SanitizerMode::Strict {
                return ReviewResult::error(&item, "E_SANITIZER_BLOCKED");
            }
            tracing::warn!(%owner, repo = repo_name.as_str(), pr = number, patterns = ?sanitized.redacted_patterns, "sanitized unsafe review content");
            sanitized.sanitized_content
        } else {
            body
        };

        let recheck = match self.host.has_review_for_sha(owner, repo_name, number, &self.config.review_marker, &pr.head_sha).await {
            Err(_) => self.host.has_review_for_sha(owner, repo_name, number, &self.config.review_marker, &pr.head_sha).await,
            ok => ok,
        };
        match recheck {
            Ok(true) => return ReviewResult::skip(&item, "already_reviewed_recheck"),
            Err(_) => return ReviewResult::skip(&item, "recheck_failed"),
            _ => {}
        }

        let verdict = if any_critical_in_body(&final_body) { Verdict::RequestChanges } else { Verdict::Comment };
        let marked_body = format!("{final_body}\n<!-- {}: {} -->", self.config.review_marker, pr.head_sha);

        let posted = if self.config.dry_run {
            false
        } else {
            let wal_entry = wal
                .append(
                    "post_review",
                    None,
                    serde_json::json!({"owner": owner, "repo": repo_name, "pr": number, "headSha": pr.head_sha}),
                )
                .ok();
            let event = match verdict {
                Verdict::RequestChanges => "REQUEST_CHANGES",
                Verdict::Comment => "COMMENT",
            };
            match self.host.upsert_review_comment(owner, repo_name, number, &marked_body, &self.config.review_marker, event).await {
                Ok(()) => {
                    if let Some(entry) = &wal_entry {
                        let _ = wal.mark_applied(&entry.id);
                    }
                    true
                }
                Err(e) => {
                    if let Some(entry) = &wal_entry {
                        let _ = wal.mark_failed(&entry.id, e.to_string());
                    }
                    return ReviewResult::error(&item, e.to_string());
                }
            }
        };

        let _ = context_store.set_last_hash(owner, repo_name, number, hash.clone());
        let _ = context_store.set_last_reviewed_sha(owner, repo_name, number, pr.head_sha.clone());
        let _ = context_store.finalize_review(owner, repo_name, number);

        if let Some(eco_path) = &self.config.ecosystem_context_path {
            if let Some(raw) = &pass1_output {
                if let Ok(block) = parse_findings_block(raw) {
                    let patterns = extract_patterns(&block.findings, &format!("{owner}/{repo_name}"), Some(number));
                    update_ecosystem(eco_path, &patterns);
                }
            }
        }

        if input_tokens > 0 {
            tracing::info!(
                phase = "calibration",
                actual_input_tokens = input_tokens,
                estimated_tokens = truncation.token_estimate.total,
                model = %self.config.model,
                "calibration observation"
            );
        }

        tracing::debug!(%owner, repo = repo_name.as_str(), pr = number, verdict = ?verdict, "classified review verdict");

        ReviewResult {
            owner: owner.clone(),
            repo: repo_name.clone(),
            pr: number,
            posted,
            skipped: false,
            skip_reason: None,
            error: None,
            input_tokens,
            output_tokens,
            pass1_tokens,
            pass2_tokens,
            pass1_output,
            pass1_cache_hit,
            pass1_confidence_stats: pass1_stats,
            persona_id: None,
            persona_hash: None,
        }
    }

    #[allow(clippy::type_complexity)]
    async fn two_pass(
        &self,
        pr: &revbot_host::PullRequest,
        files: &[PullRequestFile],
        disclaimer: Option<&str>,
        incremental: bool,
        cache: Option<&FileCache>,
    ) -> Result<(String, u64, u64, Option<u64>, Option<u64>, Option<String>, Option<bool>, Option<ConfidenceStats>), String> {
        let prompt = build_convergence(pr, files, disclaimer, incremental);
        let truncation_level = 1u8;
        let p_hash = prompt_hash(&prompt.system, &prompt.user);
        let key = cache_key(&pr.head_sha, truncation_level, &p_hash);

        let (pass1_text, pass1_tokens, cache_hit) = if let Some(cache) = cache {
            if let Some(entry) = cache.get(&key) {
                (entry.findings.raw.clone(), entry.tokens, true)
            } else {
                let req = LlmRequest::new(self.config.model.as_str(), prompt.system, prompt.user, self.config.max_output_tokens);
                let resp = self.llm.dispatch(&req).await.map_err(|e| e.to_string())?;
                let tokens = resp.normalized.usage.output_tokens.unwrap_or(0);
                if let Ok(parsed) = parse_findings_block(&resp.normalized.content) {
                    cache.set(
                        &key,
                        &CacheEntry {
                            findings: CacheFindings { raw: resp.normalized.content.clone(), parsed: serde_json::to_value(&parsed).unwrap_or_default() },
                            tokens,
                            timestamp: revbot_common::now_iso8601(),
                            hit_count: 0,
                        },
                    );
                }
                (resp.normalized.content, tokens, false)
            }
        } else {
            let req = LlmRequest::new(self.config.model.as_str(), prompt.system, prompt.user, self.config.max_output_tokens);
            let resp = self.llm.dispatch(&req).await.map_err(|e| e.to_string())?;
            (resp.normalized.content, resp.normalized.usage.output_tokens.unwrap_or(0), false)
        };

        let pass1_block = parse_findings_block(&pass1_text).map_err(|e| e.to_string())?;
        let stats = confidence_stats(&pass1_block.findings);

        let enrichment_prompt = build_enrichment(self.config.persona.as_deref(), None, pr, files, &pass1_block, &[]);
        let req2 = LlmRequest::new(self.config.model.as_str(), enrichment_prompt.system, enrichment_prompt.user, self.config.max_output_tokens);
        let resp2 = self.llm.dispatch(&req2).await;

        match resp2 {
            Ok(resp2) => {
                let pass2_tokens = resp2.normalized.usage.output_tokens.unwrap_or(0);
                let input_tokens = resp2.normalized.usage.input_tokens.unwrap_or(0);
                let passes = has_required_headings(&resp2.normalized.content) && extract_bridge_findings(&resp2.normalized.content).is_some();
                let preserved = passes
                    && extract_bridge_findings(&resp2.normalized.content)
                        .and_then(|text| parse_findings_block(&text).ok())
                        .map(|pass2_block| preservation_holds(&pass1_block, &pass2_block))
                        .unwrap_or(false);

                if preserved {
                    Ok((
                        resp2.normalized.content,
                        input_tokens,
                        pass2_tokens,
                        Some(pass1_tokens),
                        Some(pass2_tokens),
                        Some(pass1_text),
                        Some(cache_hit),
                        stats,
                    ))
                } else {
                    Ok((unenriched_fallback(&pass1_block), 0, pass1_tokens, Some(pass1_tokens), None, Some(pass1_text), Some(cache_hit), stats))
                }
            }
            Err(_) => Ok((unenriched_fallback(&pass1_block), 0, pass1_tokens, Some(pass1_tokens), None, Some(pass1_text), Some(cache_hit), stats)),
        }
    }
}

fn has_required_headings(body: &str) -> bool {
    body.contains("## Summary") && body.contains("## Findings") && body.contains("## Callouts")
}

fn any_critical_in_body(body: &str) -> bool {
    body.to_uppercase().contains("CRITICAL")
}

fn extract_bridge_findings(body: &str) -> Option<String> {
    let start = body.find(revbot_findings::START_MARKER)?;
    Some(body[start..].to_string())
}

/// Accepts Pass-2 iff the id set, per-id severity, and per-id category
/// are unchanged. Enrichment-only fields and confidence may differ.
fn preservation_holds(pass1: &FindingsBlock, pass2: &FindingsBlock) -> bool {
    if pass1.findings.len() != pass2.findings.len() {
        return false;
    }
    let mut p1: Vec<&Finding> = pass1.findings.iter().collect();
    let mut p2: Vec<&Finding> = pass2.findings.iter().collect();
    p1.sort_by(|a, b| a.id.cmp(&b.id));
    p2.sort_by(|a, b| a.id.cmp(&b.id));
    p1.iter().zip(p2.iter()).all(|(a, b)| a.id == b.id && a.severity == b.severity && a.category == b.category)
}

fn unenriched_fallback(pass1: &FindingsBlock) -> String {
    format!(
        "## Summary\nEnrichment unavailable\n\n## Findings\nSee findings block below.\n\n## Callouts\nNone.\n\n{}",
        revbot_findings::render_findings_block(pass1)
    )
}
