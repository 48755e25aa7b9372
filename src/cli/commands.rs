//! CLI command definitions and handlers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use crate::config::EngineConfig;
use crate::engine::{Engine, TriggerOptions};
use crate::model::{Repository, Status};
use crate::runtime::DockerRuntime;
use crate::secrets::MemoryCredentialStore;
use crate::spec::parse_pipeline;
use crate::store::StateStore;

/// pipeforge: run declarative YAML pipelines as container steps.
#[derive(Debug, Parser)]
#[command(name = "pipeforge", version, about)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// SQLite database URL.
    #[arg(long, global = true, env = "PIPEFORGE_DATABASE_URL", default_value = "sqlite:pipeforge.db")]
    pub database_url: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the engine until interrupted.
    Serve {
        /// Number of task workers; defaults to the CPU count.
        #[arg(long)]
        workers: Option<usize>,

        /// Queue capacity.
        #[arg(long, default_value_t = 100)]
        queue_capacity: usize,

        /// Workspace root directory.
        #[arg(long)]
        workspace_root: Option<PathBuf>,
    },

    /// Register or update a repository.
    AddRepo {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        url: String,
        #[arg(long, default_value = "")]
        clone_url: String,
        #[arg(long, default_value = "main")]
        branch: String,
    },

    /// Set a repository's pipeline YAML from a file.
    SetPipeline {
        #[arg(long)]
        repo: i64,
        /// Path to the pipeline YAML.
        file: PathBuf,
    },

    /// Trigger one run and wait for it to finish.
    Trigger {
        #[arg(long)]
        repo: i64,
        #[arg(long, default_value = "")]
        branch: String,
        #[arg(long, default_value = "cli")]
        author: String,
    },

    /// Parse a pipeline YAML file and report structural errors.
    Validate {
        file: PathBuf,
    },

    /// Run database migrations and exit.
    Migrate,
}

/// Parses command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs the parsed command.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Serve {
            workers,
            queue_capacity,
            workspace_root,
        } => {
            let mut config = EngineConfig::new()
                .with_database_url(cli.database_url.clone())
                .with_queue_capacity(queue_capacity);
            if let Some(workers) = workers {
                config = config.with_workers(workers);
            }
            if let Some(root) = workspace_root {
                config = config.with_workspace_root(root);
            }

            let engine = build_engine(config).await?;
            engine.start().await?;

            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            engine.shutdown().await;
            Ok(())
        }

        Command::AddRepo {
            id,
            owner,
            name,
            url,
            clone_url,
            branch,
        } => {
            let store = StateStore::connect(&cli.database_url).await?;
            let full_name = format!("{owner}/{name}");
            store
                .upsert_repository(&Repository {
                    id,
                    owner,
                    name,
                    full_name: full_name.clone(),
                    url,
                    clone_url,
                    branch,
                    active: false,
                })
                .await?;
            println!("repository {full_name} registered as #{id}");
            Ok(())
        }

        Command::SetPipeline { repo, file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            // Reject malformed specs before they reach the database.
            parse_pipeline(&content)?;

            let store = StateStore::connect(&cli.database_url).await?;
            let mut settings = store.get_or_init_pipeline_config(repo).await?;
            settings.content = content;
            store.upsert_pipeline_config(&settings).await?;
            println!("pipeline config updated for repository #{repo}");
            Ok(())
        }

        Command::Trigger {
            repo,
            branch,
            author,
        } => {
            let config = EngineConfig::new().with_database_url(cli.database_url.clone());
            let engine = build_engine(config).await?;
            engine.start().await?;

            let opts = TriggerOptions::manual(author).with_branch(branch);
            let pipeline = engine.trigger_pipeline(repo, opts).await?;
            println!("pipeline #{} (run {}) started", pipeline.id, pipeline.number);

            let status = wait_for_terminal(&engine, pipeline.id).await?;
            engine.shutdown().await;

            println!("pipeline #{} finished: {status}", pipeline.id);
            if status != Status::Success {
                bail!("pipeline ended with status {status}");
            }
            Ok(())
        }

        Command::Validate { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let spec = parse_pipeline(&content)?;

            println!("ok: {} step(s)", spec.steps.len());
            for step in &spec.steps {
                println!("  - {} ({})", step.name, step.kind.as_str());
            }
            Ok(())
        }

        Command::Migrate => {
            // Connecting runs migrations.
            StateStore::connect(&cli.database_url).await?;
            println!("migrations applied");
            Ok(())
        }
    }
}

async fn build_engine(config: EngineConfig) -> anyhow::Result<Arc<Engine>> {
    let store = Arc::new(StateStore::connect(&config.database_url).await?);
    Ok(Engine::new(
        config,
        store,
        Arc::new(DockerRuntime::new()),
        Arc::new(MemoryCredentialStore::new()),
    ))
}

async fn wait_for_terminal(engine: &Engine, pipeline_id: i64) -> anyhow::Result<Status> {
    loop {
        let status = engine
            .store()
            .get_pipeline_status(pipeline_id)
            .await?
            .context("pipeline disappeared")?;
        if status.is_terminal() {
            return Ok(status);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_serve() {
        let cli = Cli::try_parse_from(["pipeforge", "serve", "--workers", "2"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Serve {
                workers: Some(2),
                ..
            }
        ));
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_cli_parses_trigger() {
        let cli = Cli::try_parse_from([
            "pipeforge",
            "trigger",
            "--repo",
            "3",
            "--branch",
            "release",
        ])
        .unwrap();
        match cli.command {
            Command::Trigger { repo, branch, .. } => {
                assert_eq!(repo, 3);
                assert_eq!(branch, "release");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["pipeforge"]).is_err());
    }
}
