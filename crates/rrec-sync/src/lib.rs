//! Import pipeline: spreadsheet rows in, reconciled operational records out.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rrec_adapters::{CodeBook, IntakeFile, ParseIssues};
use rrec_core::{
    Application, Company, Coordinator, Job, JobSeeker, Organization, Record, Source, Table,
};
use rrec_storage::{
    read_all, BatchLoader, ExportArchive, Store, TableLoadReport, DEFAULT_BATCH_SIZE,
    DEFAULT_PAGE_SIZE,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod builder;
pub mod dedupe;
pub mod identity;
pub mod resolver;

pub use builder::{BuildStats, RecordBuilder, RecordGraph};
pub use dedupe::{run_dedupe, DedupeReport};
pub use resolver::{CoordinatorMatch, MasterDataResolver, ResolverStats};

pub const CRATE_NAME: &str = "rrec-sync";

/// Problems that stop a run before any row is touched.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("input file {0} does not exist")]
    MissingInput(PathBuf),
    #[error("DATABASE_URL is not set")]
    MissingDatabaseUrl,
    #[error("no organization record found; create one before importing")]
    NoOrganization,
    #[error("organization `{0}` not found")]
    UnknownOrganization(String),
}

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub database_url: Option<String>,
    pub organization: Option<String>,
    pub batch_size: usize,
    pub page_size: u64,
    pub archive_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub codebook: Option<PathBuf>,
    pub reference: PathBuf,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            organization: None,
            batch_size: DEFAULT_BATCH_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
            archive_dir: PathBuf::from("./archive"),
            reports_dir: PathBuf::from("./reports"),
            codebook: None,
            reference: PathBuf::from("reference/funnel_totals.yaml"),
        }
    }
}

impl ImportConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            organization: std::env::var("RREC_ORGANIZATION")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            batch_size: std::env::var("RREC_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.batch_size),
            page_size: std::env::var("RREC_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.page_size),
            archive_dir: std::env::var("RREC_ARCHIVE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.archive_dir),
            reports_dir: std::env::var("RREC_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            codebook: std::env::var("RREC_CODEBOOK").ok().map(PathBuf::from),
            reference: std::env::var("RREC_REFERENCE")
                .map(PathBuf::from)
                .unwrap_or(defaults.reference),
        }
    }

    pub fn database_url(&self) -> Result<&str, SetupError> {
        self.database_url
            .as_deref()
            .ok_or(SetupError::MissingDatabaseUrl)
    }

    /// The configured code book, or the built-in vocabulary.
    pub fn code_book(&self) -> Result<CodeBook> {
        match &self.codebook {
            Some(path) => CodeBook::load(path),
            None => Ok(CodeBook::default()),
        }
    }
}

pub fn require_input(path: &Path) -> Result<(), SetupError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(SetupError::MissingInput(path.to_path_buf()))
    }
}

/// Picks the named organization, or the oldest one when no name is given.
pub async fn resolve_organization(store: &dyn Store, name: Option<&str>) -> Result<Organization> {
    let organizations = store
        .organizations()
        .await
        .context("listing organizations")?;
    let found = match name {
        Some(name) => organizations
            .into_iter()
            .find(|o| o.name == name)
            .ok_or_else(|| SetupError::UnknownOrganization(name.to_string()))?,
        None => organizations
            .into_iter()
            .next()
            .ok_or(SetupError::NoOrganization)?,
    };
    Ok(found)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    /// Parse and plan against an in-memory store; nothing is persisted.
    DryRun,
    /// Best-effort idempotent: known applications are skipped.
    Apply,
    /// Deletes the organization's activity rows first, then recreates them.
    Replace,
}

impl ImportMode {
    pub fn writes(self) -> bool {
        !matches!(self, ImportMode::DryRun)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplaceStats {
    pub deleted: BTreeMap<Table, u64>,
    pub placeholder_seekers_removed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub run_id: Uuid,
    pub mode: ImportMode,
    pub organization: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_file: String,
    pub content_hash: Option<String>,
    pub archived_to: Option<String>,
    pub report_path: Option<String>,
    pub parse: ParseIssues,
    pub build: BuildStats,
    pub resolver: ResolverStats,
    pub replaced: Option<ReplaceStats>,
    pub tables: Vec<TableLoadReport>,
    pub orphans_skipped: BTreeMap<Table, usize>,
}

impl ImportSummary {
    pub fn inserted(&self, table: Table) -> usize {
        self.tables
            .iter()
            .find(|t| t.table == table)
            .map_or(0, |t| t.inserted)
    }

    pub fn failed_rows(&self) -> usize {
        self.tables.iter().map(|t| t.failed.len()).sum()
    }

    /// Counters for the end-of-run printout.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "import {:?} run={} org={} file={}",
            self.mode, self.run_id, self.organization, self.source_file
        );
        let p = &self.parse;
        let _ = writeln!(
            out,
            "  parsed rows={} blank={} unreadable={} bad_dates={} bad_amounts={} bad_year_months={} bad_ages={} missing_phones={} unknown_codes={}",
            p.rows_read,
            p.blank_rows,
            p.unreadable_rows,
            p.bad_dates,
            p.bad_amounts,
            p.bad_year_months,
            p.bad_ages,
            p.missing_phones,
            p.unknown_codes
        );
        let b = &self.build;
        let _ = writeln!(
            out,
            "  built rows={} skipped_no_date={} skipped_duplicate={} seekers_new={} seekers_matched={} placeholders={} revenue_without_referral={}",
            b.rows_built,
            b.skipped_without_applied_date,
            b.skipped_duplicate_application,
            b.seekers_created,
            b.seekers_matched,
            b.placeholder_phones,
            b.revenue_without_referral
        );
        let r = &self.resolver;
        let _ = writeln!(
            out,
            "  coordinators exact={} prefix={} ambiguous={} unmatched={}",
            r.coordinators_exact,
            r.coordinators_prefix,
            r.coordinators_ambiguous,
            r.coordinators_unmatched
        );
        if let Some(replaced) = &self.replaced {
            let deleted: Vec<String> = replaced
                .deleted
                .iter()
                .map(|(t, n)| format!("{t}={n}"))
                .collect();
            let _ = writeln!(
                out,
                "  replaced {} placeholder_seekers={}",
                deleted.join(" "),
                replaced.placeholder_seekers_removed
            );
        }
        for t in &self.tables {
            let _ = writeln!(
                out,
                "  {:<13} attempted={} inserted={} fallbacks={} failed={} orphans={}",
                t.table.as_str(),
                t.attempted,
                t.inserted,
                t.batch_fallbacks,
                t.failed.len(),
                self.orphans_skipped.get(&t.table).copied().unwrap_or_default()
            );
        }
        if let Some(path) = &self.archived_to {
            let _ = writeln!(out, "  archived export: {path}");
        }
        if let Some(path) = &self.report_path {
            let _ = writeln!(out, "  report: {path}");
        }
        out
    }
}

/// Rows already stored for the organization that the builder matches against.
struct Existing {
    sources: Vec<Source>,
    companies: Vec<Company>,
    jobs: Vec<Job>,
    coordinators: Vec<Coordinator>,
    seekers: Vec<JobSeeker>,
    applications: Vec<Application>,
}

pub struct ImportPipeline<'a> {
    store: &'a dyn Store,
    config: &'a ImportConfig,
    organization: Organization,
}

impl<'a> ImportPipeline<'a> {
    pub fn new(store: &'a dyn Store, config: &'a ImportConfig, organization: Organization) -> Self {
        Self {
            store,
            config,
            organization,
        }
    }

    pub async fn run(&self, file: &IntakeFile, mode: ImportMode) -> Result<ImportSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let org = self.organization.id;
        info!(%run_id, ?mode, organization = %self.organization.name, "import started");

        let replaced = if mode == ImportMode::Replace {
            Some(
                self.clear_activity()
                    .instrument(info_span!("replace", %run_id))
                    .await?,
            )
        } else {
            None
        };

        let existing = self
            .load_existing()
            .instrument(info_span!("load_existing", %run_id))
            .await?;

        let mut resolver = MasterDataResolver::new(org, started_at).seed(
            &existing.sources,
            &existing.companies,
            &existing.jobs,
            &existing.coordinators,
        );
        let (graph, build) = {
            let mut builder = RecordBuilder::new(
                org,
                started_at,
                &mut resolver,
                identity::SeekerIndex::from_seekers(&existing.seekers),
                identity::application_keys(&existing.applications, &existing.seekers),
            );
            builder.add_rows(&file.rows);
            builder.finish()
        };
        let reference = resolver.take_new();
        info!(
            applications = graph.applications.len(),
            interviews = graph.interviews.len(),
            referrals = graph.referrals.len(),
            sales = graph.sales.len(),
            "record graph built"
        );

        let mut writer = GraphWriter::new(self.store, self.config.batch_size);
        let span = info_span!("write", %run_id);
        async {
            writer.write(&reference.sources).await?;
            writer.write(&reference.companies).await?;
            writer.write(&reference.jobs).await?;
            writer.write(&graph.job_seekers).await?;
            writer.write(&graph.applications).await?;
            writer.write(&graph.interviews).await?;
            writer.write(&graph.referrals).await?;
            writer.write(&graph.sales).await?;
            anyhow::Ok(())
        }
        .instrument(span)
        .await?;

        let mut summary = ImportSummary {
            run_id,
            mode,
            organization: self.organization.name.clone(),
            started_at,
            finished_at: started_at,
            source_file: file.path.display().to_string(),
            content_hash: None,
            archived_to: None,
            report_path: None,
            parse: file.issues.clone(),
            build,
            resolver: resolver.stats().clone(),
            replaced,
            tables: writer.reports,
            orphans_skipped: writer.orphans,
        };

        if mode.writes() {
            let archive = ExportArchive::new(&self.config.archive_dir);
            let archived = archive
                .archive(started_at, &file.path, &file.bytes)
                .await
                .context("archiving source export")?;
            summary.content_hash = Some(archived.content_hash);
            summary.archived_to = Some(archived.absolute_path.display().to_string());
        }
        summary.finished_at = Utc::now();
        if mode.writes() {
            let path = write_report(&self.config.reports_dir, &summary).await?;
            summary.report_path = Some(path.display().to_string());
        }

        if summary.failed_rows() > 0 {
            warn!(failed = summary.failed_rows(), "some rows could not be written");
        }
        info!(%run_id, "import finished");
        Ok(summary)
    }

    /// Deletes activity rows leaf to root, then the placeholder job seekers
    /// left without an application.
    async fn clear_activity(&self) -> Result<ReplaceStats> {
        let org = self.organization.id;
        let mut stats = ReplaceStats::default();
        for table in Table::REIMPORT_DELETE_ORDER {
            let deleted = self
                .store
                .delete_all(table, org)
                .await
                .with_context(|| format!("clearing {table}"))?;
            info!(%table, deleted, "cleared for re-import");
            stats.deleted.insert(table, deleted);
        }

        let seekers: Vec<JobSeeker> = read_all(self.store, org, self.config.page_size)
            .await
            .context("reading job seekers")?;
        let applications: Vec<Application> = read_all(self.store, org, self.config.page_size)
            .await
            .context("reading applications")?;
        let owners: HashSet<Uuid> = applications.iter().map(|a| a.job_seeker_id).collect();
        let orphans: Vec<Uuid> = seekers
            .iter()
            .filter(|s| s.has_placeholder_phone() && !owners.contains(&s.id))
            .map(|s| s.id)
            .collect();
        stats.placeholder_seekers_removed = self
            .store
            .delete_ids(Table::JobSeekers, &orphans)
            .await
            .context("removing orphaned placeholder job seekers")?;
        Ok(stats)
    }

    async fn load_existing(&self) -> Result<Existing> {
        let (store, org, page) = (self.store, self.organization.id, self.config.page_size);
        Ok(Existing {
            sources: read_all(store, org, page).await.context("reading sources")?,
            companies: read_all(store, org, page).await.context("reading companies")?,
            jobs: read_all(store, org, page).await.context("reading jobs")?,
            coordinators: read_all(store, org, page).await.context("reading coordinators")?,
            seekers: read_all(store, org, page).await.context("reading job seekers")?,
            applications: read_all(store, org, page).await.context("reading applications")?,
        })
    }
}

/// Writes tables in foreign-key order, skipping rows whose parent failed.
struct GraphWriter<'a> {
    loader: BatchLoader<'a>,
    failed: HashSet<Uuid>,
    reports: Vec<TableLoadReport>,
    orphans: BTreeMap<Table, usize>,
}

impl<'a> GraphWriter<'a> {
    fn new(store: &'a dyn Store, batch_size: usize) -> Self {
        Self {
            loader: BatchLoader::new(store, batch_size),
            failed: HashSet::new(),
            reports: Vec::new(),
            orphans: BTreeMap::new(),
        }
    }

    fn has_failed_parent(&self, row: &JsonValue, table: Table) -> bool {
        table.parents().iter().any(|(column, _)| {
            row.get(*column)
                .and_then(JsonValue::as_str)
                .and_then(|id| id.parse::<Uuid>().ok())
                .is_some_and(|id| self.failed.contains(&id))
        })
    }

    async fn write<T: Record + Clone>(&mut self, rows: &[T]) -> Result<()> {
        let mut ready = Vec::with_capacity(rows.len());
        let mut orphaned = 0;
        for row in rows {
            let value = serde_json::to_value(row).context("encoding row")?;
            if self.has_failed_parent(&value, T::TABLE) {
                self.failed.insert(row.id());
                orphaned += 1;
            } else {
                ready.push(row.clone());
            }
        }
        if orphaned > 0 {
            warn!(table = %T::TABLE, orphaned, "skipping rows whose parent failed to insert");
            self.orphans.insert(T::TABLE, orphaned);
        }

        let report = self
            .loader
            .insert_all(&ready)
            .await
            .with_context(|| format!("writing {}", T::TABLE))?;
        self.failed.extend(report.failed.iter().map(|f| f.id));
        info!(
            table = %T::TABLE,
            inserted = report.inserted,
            failed = report.failed.len(),
            "table written"
        );
        self.reports.push(report);
        Ok(())
    }
}

async fn write_report(reports_dir: &Path, summary: &ImportSummary) -> Result<PathBuf> {
    let dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join("import_summary.json");
    let bytes = serde_json::to_vec_pretty(summary).context("serializing import summary")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
