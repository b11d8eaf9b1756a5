//! CLI for the Surge download manager.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use surge_core::config;
use surge_core::store::StateStore;

use commands::{run_get, run_pause, run_remove, run_resume, run_status};

/// Top-level CLI for the Surge download manager.
#[derive(Debug, Parser)]
#[command(name = "surge")]
#[command(about = "Surge: resumable multi-connection download manager", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Download one or more URLs in the foreground. A comma-separated list
    /// (`primary,mirror1,mirror2`) downloads one file with mirror failover.
    Get {
        /// URLs to download; each argument is one download.
        #[arg(required = true)]
        urls: Vec<String>,
        /// Directory where files are saved (default: current directory).
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,
        /// Save under this filename (single download only).
        #[arg(long, value_name = "NAME")]
        filename: Option<String>,
        /// Connections per download (overrides the config file).
        #[arg(long, short = 'c', value_name = "N")]
        connections: Option<usize>,
        /// Force the sequential single-connection engine.
        #[arg(long)]
        sequential: bool,
    },

    /// Resume a paused download by id (a unique prefix is enough).
    Resume {
        /// Download identifier or unique prefix.
        id: String,
    },

    /// Show all downloads the store knows about.
    Status,

    /// Mark a download paused so it is skipped until resumed. Only affects
    /// downloads not currently running in another process.
    Pause {
        /// Download identifier or unique prefix.
        id: String,
    },

    /// Remove a download from the store. With --delete-files, also deletes
    /// its partial and final files.
    Remove {
        /// Download identifier or unique prefix.
        id: String,
        /// Also delete the download's files from disk.
        #[arg(long)]
        delete_files: bool,
    },
}

#[cfg(test)]
mod tests;

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let cfg = config::load_or_init()?;
        tracing::debug!("loaded config: {:?}", cfg);
        let store = StateStore::open_default().await?;
        // Entries stranded by a crash become resume candidates.
        let recovered = store.recover_stranded().await?;
        if recovered > 0 {
            tracing::info!("recovered {} stranded download(s)", recovered);
        }

        match cli.command {
            CliCommand::Get {
                urls,
                dir,
                filename,
                connections,
                sequential,
            } => {
                let mut runtime = cfg;
                if let Some(n) = connections {
                    runtime.connections = n;
                }
                if sequential {
                    runtime.sequential_download = true;
                }
                let dir = dir
                    .or_else(|| std::env::current_dir().ok())
                    .unwrap_or_default();
                run_get(store, runtime, &urls, dir, filename).await?
            }
            CliCommand::Resume { id } => run_resume(store, cfg, &id).await?,
            CliCommand::Status => run_status(&store).await?,
            CliCommand::Pause { id } => run_pause(&store, &id).await?,
            CliCommand::Remove { id, delete_files } => {
                run_remove(&store, &id, delete_files).await?
            }
        }

        Ok(())
    }
}
