mod cli;
mod config;
mod error;

use clap::Parser;
use cli::{Cli, Command, EcosystemCommand, WalCommand};
use config::CliOverrides;
use error::CliError;
use revbot_ecosystem::EcosystemContext;
use revbot_host::GitHubClient;
use revbot_llm::OpenAiCompatClient;
use revbot_wal::{FileWal, WalStatus};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .init();
}

fn load_dotenv() {
    let repo_env = Path::new(".env");
    if repo_env.exists() {
        let _ = dotenvy::from_path(repo_env);
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    load_dotenv();
    init_logging();
    let cli = Cli::parse();

    match cli.cmd {
        Command::Run { once: _, dry_run, config, repos, target_pr } => {
            let run_config = config::load(CliOverrides { dry_run, repos, target_pr, config_path: config })?;

            let host_token = std::env::var("GITHUB_TOKEN").ok().or_else(|| std::env::var("GH_TOKEN").ok());
            let host = Arc::new(GitHubClient::new(host_token));

            let llm_base_url =
                std::env::var("REVBOT_LLM_BASE_URL").unwrap_or_else(|_| "https://api.openai.com".to_string());
            let llm_api_key = std::env::var("OPENAI_API_KEY").ok();
            let llm = Arc::new(OpenAiCompatClient::new(llm_base_url, llm_api_key));

            let orchestrator = revbot_pipeline::Orchestrator::new(host, llm, run_config);
            let run_id = uuid::Uuid::new_v4().to_string();

            info!(run_id = %run_id, "starting review run");
            let summary = orchestrator.run(run_id).await;

            for result in &summary.results {
                if result.skipped {
                    info!(owner = %result.owner, repo = %result.repo, pr = result.pr, reason = ?result.skip_reason, "skipped");
                } else if let Some(err) = &result.error {
                    info!(owner = %result.owner, repo = %result.repo, pr = result.pr, error = %err, "errored");
                } else {
                    info!(owner = %result.owner, repo = %result.repo, pr = result.pr, posted = result.posted, "reviewed");
                }
            }

            println!("{}", serde_json::to_string(&summary)?);
            Ok(())
        }

        Command::Wal { cmd: WalCommand::Inspect { path } } => {
            let wal = FileWal::new(path);
            let entries = wal.materialized_entries()?;
            let pending = entries.iter().filter(|e| e.status == WalStatus::Pending).count();
            let applied = entries.iter().filter(|e| e.status == WalStatus::Applied).count();
            let failed = entries.iter().filter(|e| e.status == WalStatus::Failed).count();
            println!(
                "{}",
                serde_json::to_string(&serde_json::json!({
                    "total": entries.len(),
                    "pending": pending,
                    "applied": applied,
                    "failed": failed,
                }))?
            );
            Ok(())
        }

        Command::Wal { cmd: WalCommand::Compact { path } } => {
            let wal = FileWal::new(path);
            let compacted = wal.compact()?;
            println!("{}", serde_json::to_string(&serde_json::json!({ "compacted": compacted }))?);
            Ok(())
        }

        Command::Ecosystem { cmd: EcosystemCommand::Show { path } } => {
            let context = match std::fs::read_to_string(&path) {
                Ok(raw) => serde_json::from_str::<EcosystemContext>(&raw).unwrap_or_default(),
                Err(_) => EcosystemContext::default(),
            };
            println!("{}", serde_json::to_string(&context)?);
            Ok(())
        }
    }
}
