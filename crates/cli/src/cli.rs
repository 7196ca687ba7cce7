use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// revbot — automated pull-request review pipeline.
#[derive(Parser, Debug)]
#[command(name = "revbot", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the review pipeline once against the configured repos.
    Run {
        /// Present for parity with interval-scheduled deployments; this
        /// binary always runs a single pass and exits.
        #[arg(long)]
        once: bool,

        /// Go through the full pipeline without posting or mutating state.
        #[arg(long)]
        dry_run: bool,

        /// Path to a TOML config file. Defaults to `.revbot/config.toml`
        /// if present, otherwise built-in defaults.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Repeatable `owner/name` repo selector.
        #[arg(long = "repo")]
        repos: Vec<String>,

        /// Restrict the run to a single PR (requires exactly one repo).
        #[arg(long)]
        target_pr: Option<u64>,
    },

    /// Write-ahead log maintenance.
    Wal {
        #[command(subcommand)]
        cmd: WalCommand,
    },

    /// Ecosystem context inspection.
    Ecosystem {
        #[command(subcommand)]
        cmd: EcosystemCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum WalCommand {
    /// Print materialized pending/applied/failed counts (read-only).
    Inspect {
        #[arg(long)]
        path: PathBuf,
    },
    /// Force compaction of a WAL file.
    Compact {
        #[arg(long)]
        path: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
pub enum EcosystemCommand {
    /// Print the current ecosystem context as JSON.
    Show {
        #[arg(long)]
        path: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_repeated_repo_flags() {
        let cli = Cli::parse_from(["revbot", "run", "--repo", "acme/widgets", "--repo", "acme/gadgets"]);
        match cli.cmd {
            Command::Run { repos, .. } => assert_eq!(repos, vec!["acme/widgets", "acme/gadgets"]),
            _ => panic!("expected Run"),
        }
    }

    #[test]
    fn parses_wal_inspect() {
        let cli = Cli::parse_from(["revbot", "wal", "inspect", "--path", "wal.jsonl"]);
        match cli.cmd {
            Command::Wal { cmd: WalCommand::Inspect { path } } => assert_eq!(path, PathBuf::from("wal.jsonl")),
            _ => panic!("expected Wal Inspect"),
        }
    }

    #[test]
    fn parses_ecosystem_show() {
        let cli = Cli::parse_from(["revbot", "ecosystem", "show", "--path", "eco.json"]);
        match cli.cmd {
            Command::Ecosystem { cmd: EcosystemCommand::Show { path } } => assert_eq!(path, PathBuf::from("eco.json")),
            _ => panic!("expected Ecosystem Show"),
        }
    }
}
