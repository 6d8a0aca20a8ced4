use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rrec_adapters::SpreadsheetAdapter;
use rrec_funnel::{reconcile, ReferenceTotals};
use rrec_storage::{MemoryStore, PgStore};
use rrec_sync::{
    require_input, resolve_organization, run_dedupe, ImportConfig, ImportMode, ImportPipeline,
    SetupError,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "rrec-cli")]
#[command(about = "Recruitment intake import and reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse an intake export and plan the import; writes only with --apply.
    Import {
        path: PathBuf,
        #[arg(long)]
        apply: bool,
        /// Delete the organization's activity rows before recreating them.
        #[arg(long, requires = "apply")]
        replace: bool,
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Report duplicate companies, coordinators and interview collisions.
    Dedupe {
        #[arg(long)]
        merge: bool,
    },
    /// Recompute funnel metrics and compare them with reference totals.
    Validate {
        #[arg(long)]
        reference: Option<PathBuf>,
    },
    Migrate,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            if err.downcast_ref::<SetupError>().is_some() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn connect(config: &ImportConfig) -> Result<PgStore> {
    let url = config.database_url()?;
    PgStore::connect(url)
        .await
        .context("connecting to the database")
}

async fn run(command: Commands) -> Result<()> {
    let mut config = ImportConfig::from_env();

    match command {
        Commands::Import {
            path,
            apply,
            replace,
            batch_size,
        } => {
            require_input(&path)?;
            if let Some(size) = batch_size.filter(|n| *n > 0) {
                config.batch_size = size;
            }
            let codes = config.code_book()?;
            let file = SpreadsheetAdapter::new(codes)
                .load(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            info!(rows = file.rows.len(), issues = file.issues.total(), "export parsed");

            let mode = match (apply, replace) {
                (false, _) => ImportMode::DryRun,
                (true, false) => ImportMode::Apply,
                (true, true) => ImportMode::Replace,
            };
            let summary = if mode.writes() {
                let store = connect(&config).await?;
                let org = resolve_organization(&store, config.organization.as_deref()).await?;
                ImportPipeline::new(&store, &config, org)
                    .run(&file, mode)
                    .await?
            } else {
                let name = config.organization.as_deref().unwrap_or("dry-run");
                let store = MemoryStore::with_organization(name);
                let org = resolve_organization(&store, None).await?;
                ImportPipeline::new(&store, &config, org)
                    .run(&file, mode)
                    .await?
            };
            print!("{}", summary.render());
            if mode == ImportMode::DryRun {
                println!("dry run: nothing was written (pass --apply to write)");
            }
        }
        Commands::Dedupe { merge } => {
            let codes = config.code_book()?;
            let store = connect(&config).await?;
            let org = resolve_organization(&store, config.organization.as_deref()).await?;
            let report = run_dedupe(&store, org.id, config.page_size, &codes, merge).await?;
            print!("{}", report.render());
        }
        Commands::Validate { reference } => {
            let store = connect(&config).await?;
            let org = resolve_organization(&store, config.organization.as_deref()).await?;
            let report = rrec_funnel::compute_from_store(&store, org.id, config.page_size).await?;
            println!("funnel by metric month ({})", org.name);
            print!("{}", report.funnel.render());
            println!();
            println!("work-month plan");
            print!("{}", report.work_months.render());

            let path = reference.unwrap_or(config.reference);
            let totals = ReferenceTotals::load(&path)
                .with_context(|| format!("loading reference totals {}", path.display()))?;
            let result = reconcile(&report.funnel, &totals);
            println!();
            println!("computed vs expected ({})", path.display());
            print!("{}", result.render());
            println!("mismatches: {}", result.mismatches().count());
        }
        Commands::Migrate => {
            let store = connect(&config).await?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}
