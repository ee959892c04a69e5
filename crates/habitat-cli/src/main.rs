use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, Subcommand};
use habitat_core::RunId;
use habitat_migrate::{write_json_report, MigrateConfig, MigrationPipeline, RollbackReport, RollbackScope};
use tracing::warn;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "habitat")]
#[command(about = "Migrate conservation experience content into the relational store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write every combined experience and its child rows.
    Migrate {
        /// Also write the run summary as JSON.
        #[arg(long)]
        report: Option<PathBuf>,
        /// Run the verification pass after writing.
        #[arg(long)]
        verify: bool,
    },
    /// Delete migrated experience rows, deepest tables first.
    Rollback {
        /// Only delete rows written by this run.
        #[arg(long)]
        run_id: Option<Uuid>,
    },
    /// Compare persisted child counts with the corpus.
    Verify {
        /// Exit non-zero when any record fails.
        #[arg(long)]
        strict: bool,
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Migrate or roll back de-duplicated content sources.
    Sources {
        #[command(subcommand)]
        action: Option<SourcesAction>,
    },
}

#[derive(Debug, Subcommand)]
enum SourcesAction {
    Migrate,
    Rollback {
        #[arg(long)]
        run_id: Option<Uuid>,
    },
}

fn scope(run_id: Option<Uuid>) -> RollbackScope {
    run_id
        .map(|id| RollbackScope::Run(RunId(id)))
        .unwrap_or(RollbackScope::AllRows)
}

fn print_rollback(label: &str, report: &RollbackReport) {
    println!("{label} rollback:");
    print!("{}", report.render());
    if !report.is_clean() {
        warn!(failed = report.failures().count(), "rollback finished with errors");
    }
}

/// `Ok(None)` means the arguments named no known command; the caller prints usage.
fn parse_cli<I, T>(args: I) -> Result<Option<Cli>, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    match Cli::try_parse_from(args) {
        Ok(cli) => Ok(Some(cli)),
        Err(err) if matches!(err.kind(), ErrorKind::InvalidSubcommand | ErrorKind::UnknownArgument) => {
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

async fn pipeline() -> Result<MigrationPipeline> {
    let config = MigrateConfig::from_env().context("reading configuration")?;
    MigrationPipeline::from_config(&config).await
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("habitat=info")),
        )
        .init();

    let cli = match parse_cli(std::env::args_os()) {
        Ok(cli) => cli,
        Err(err) => err.exit(),
    };
    let Some(command) = cli.and_then(|cli| cli.command) else {
        Cli::command().print_help()?;
        println!();
        return Ok(ExitCode::SUCCESS);
    };

    match command {
        Commands::Migrate { report, verify } => {
            let pipeline = pipeline().await?;
            let summary = pipeline.migrate().await?;
            print!("{}", summary.render());
            if let Some(path) = report {
                write_json_report(&path, &summary).await?;
                println!("report written to {}", path.display());
            }
            if verify {
                print!("{}", pipeline.verify().await.render());
            }
        }
        Commands::Rollback { run_id } => {
            let pipeline = pipeline().await?;
            print_rollback("experience", &pipeline.rollback(scope(run_id)).await);
        }
        Commands::Verify { strict, report } => {
            let pipeline = pipeline().await?;
            let verification = pipeline.verify().await;
            print!("{}", verification.render());
            if let Some(path) = report {
                write_json_report(&path, &verification).await?;
                println!("report written to {}", path.display());
            }
            if strict && !verification.all_passed() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Sources { action } => {
            let pipeline = pipeline().await?;
            match action.unwrap_or(SourcesAction::Migrate) {
                SourcesAction::Migrate => {
                    let summary = pipeline.migrate_sources().await?;
                    println!(
                        "sources migrated: run_id={} sources={} animal_links={} country_links={}",
                        summary.run_id, summary.content_sources, summary.animal_links, summary.country_links
                    );
                }
                SourcesAction::Rollback { run_id } => {
                    print_rollback("content source", &pipeline.rollback_sources(scope(run_id)).await);
                }
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn sources_defaults_to_migrate() {
        let cli = Cli::try_parse_from(["habitat", "sources"]).expect("parse");
        assert!(matches!(cli.command, Some(Commands::Sources { action: None })));

        let id = Uuid::new_v4().to_string();
        let cli = Cli::try_parse_from(["habitat", "sources", "rollback", "--run-id", &id]).expect("parse");
        assert!(matches!(
            cli.command,
            Some(Commands::Sources { action: Some(SourcesAction::Rollback { run_id: Some(_) }) })
        ));
    }

    #[test]
    fn rollback_scope_follows_run_id() {
        assert_eq!(scope(None), RollbackScope::AllRows);
        let id = Uuid::new_v4();
        assert_eq!(scope(Some(id)), RollbackScope::Run(RunId(id)));
        assert!(Cli::try_parse_from(["habitat", "rollback", "--run-id", "nope"]).is_err());
        assert!(Cli::try_parse_from(["habitat", "explode"]).is_err());
    }

    #[test]
    fn unrecognized_input_falls_back_to_usage() {
        assert!(parse_cli(["habitat", "explode"]).expect("usage").is_none());
        assert!(parse_cli(["habitat", "rollback", "--bogus"]).expect("usage").is_none());
        assert!(parse_cli(["habitat", "sources", "explode"]).expect("usage").is_none());

        let cli = parse_cli(["habitat"]).expect("parse").expect("cli");
        assert!(cli.command.is_none());

        let err = parse_cli(["habitat", "rollback", "--run-id", "nope"]).expect_err("bad uuid");
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
    }
}
