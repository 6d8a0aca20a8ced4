//! Duplicate detection and merging for companies and coordinators, plus the
//! interview vocabulary-collision pass.
//!
//! Grouping only decides which rows describe the same thing; choosing the
//! surviving row is [`pick_master`]'s job, kept separate so the policy can be
//! exercised on its own.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rrec_adapters::CodeBook;
use rrec_core::{Application, Company, Coordinator, Interview, Job, JobSeeker, Referral, Table};
use rrec_storage::{read_all, Store};
use serde::Serialize;
use strsim::jaro_winkler;
use tracing::{info, warn};
use uuid::Uuid;

use crate::identity::{plan_interview_collisions, InterviewCollision};
use crate::resolver::name_key;

const LEGAL_FORMS: [&str; 8] = [
    "株式会社",
    "有限会社",
    "合同会社",
    "(株)",
    "（株）",
    "(有)",
    "（有）",
    "㈱",
];

/// Grouping key for reference names: [`name_key`] without legal-form
/// markers or punctuation, so `株式会社 東和物流` and `東和物流(株)` meet.
pub fn entity_key(name: &str) -> String {
    let mut key = name_key(name);
    for form in LEGAL_FORMS {
        key = key.replace(form, "");
    }
    key.chars()
        .filter(|c| !matches!(c, '.' | ',' | '・' | '、' | '。' | '-'))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Company,
    Coordinator,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Rows that point at this entity.
    pub activity: usize,
}

/// Highest activity wins; ties go to the earliest created row.
pub fn pick_master(members: &[Candidate]) -> Option<&Candidate> {
    members
        .iter()
        .min_by_key(|c| (Reverse(c.activity), c.created_at, c.id))
}

/// Candidates whose [`entity_key`] is identical, in groups of two or more.
pub fn group_exact(candidates: &[Candidate]) -> Vec<(String, Vec<Candidate>)> {
    let mut groups: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
    for candidate in candidates {
        let key = entity_key(&candidate.name);
        if key.is_empty() {
            continue;
        }
        groups.entry(key).or_default().push(candidate.clone());
    }
    groups
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrefixCandidate {
    pub kind: ReferenceKind,
    pub shorter: String,
    pub longer: String,
    pub similarity: f64,
}

/// Distinct keys where one starts with the other. Report-only: a shared
/// prefix is a hint, not proof.
pub fn prefix_candidates(kind: ReferenceKind, candidates: &[Candidate]) -> Vec<PrefixCandidate> {
    let mut keys: BTreeMap<String, &str> = BTreeMap::new();
    for candidate in candidates {
        let key = entity_key(&candidate.name);
        if !key.is_empty() {
            keys.entry(key).or_insert(candidate.name.as_str());
        }
    }
    let mut out = Vec::new();
    for (short_key, short_name) in &keys {
        for (long_key, long_name) in &keys {
            if long_key.len() > short_key.len() && long_key.starts_with(short_key.as_str()) {
                out.push(PrefixCandidate {
                    kind,
                    shorter: short_name.to_string(),
                    longer: long_name.to_string(),
                    similarity: jaro_winkler(short_key, long_key),
                });
            }
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    pub kind: ReferenceKind,
    pub key: String,
    pub master: Candidate,
    pub duplicates: Vec<Candidate>,
}

fn duplicate_groups(kind: ReferenceKind, candidates: &[Candidate]) -> Vec<DuplicateGroup> {
    group_exact(candidates)
        .into_iter()
        .filter_map(|(key, members)| {
            let master = pick_master(&members)?.clone();
            let duplicates = members.into_iter().filter(|m| m.id != master.id).collect();
            Some(DuplicateGroup {
                kind,
                key,
                master,
                duplicates,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub companies_removed: usize,
    pub coordinators_removed: usize,
    pub jobs_folded: usize,
    pub jobs_moved: u64,
    pub referrals_repointed: u64,
    pub applications_repointed: u64,
    pub interviews_demoted: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupeReport {
    pub companies: Vec<DuplicateGroup>,
    pub coordinators: Vec<DuplicateGroup>,
    pub prefix_candidates: Vec<PrefixCandidate>,
    pub interview_collisions: Vec<InterviewCollision>,
    pub merged: Option<MergeOutcome>,
}

impl DedupeReport {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "duplicate groups");
        for group in self.companies.iter().chain(&self.coordinators) {
            let dupes: Vec<&str> = group.duplicates.iter().map(|d| d.name.as_str()).collect();
            let _ = writeln!(
                out,
                "  {:?} `{}` (activity {}) <- {}",
                group.kind,
                group.master.name,
                group.master.activity,
                dupes.join(", ")
            );
        }
        if !self.prefix_candidates.is_empty() {
            let _ = writeln!(out, "prefix candidates (review manually)");
            for c in &self.prefix_candidates {
                let _ = writeln!(
                    out,
                    "  {:?} `{}` ~ `{}` similarity={:.3}",
                    c.kind, c.shorter, c.longer, c.similarity
                );
            }
        }
        let demoted: usize = self.interview_collisions.iter().map(|c| c.demote.len()).sum();
        let _ = writeln!(
            out,
            "interview collisions: {} group(s), {} interview(s) to demote",
            self.interview_collisions.len(),
            demoted
        );
        match &self.merged {
            Some(m) => {
                let _ = writeln!(
                    out,
                    "merged: companies_removed={} coordinators_removed={} jobs_folded={} jobs_moved={} referrals_repointed={} applications_repointed={} interviews_demoted={}",
                    m.companies_removed,
                    m.coordinators_removed,
                    m.jobs_folded,
                    m.jobs_moved,
                    m.referrals_repointed,
                    m.applications_repointed,
                    m.interviews_demoted
                );
            }
            None => {
                let _ = writeln!(out, "report only; pass --merge to consolidate");
            }
        }
        out
    }
}

struct Snapshot {
    companies: Vec<Company>,
    jobs: Vec<Job>,
    coordinators: Vec<Coordinator>,
    seekers: Vec<JobSeeker>,
    applications: Vec<Application>,
    interviews: Vec<Interview>,
    referrals: Vec<Referral>,
}

async fn load_snapshot(store: &dyn Store, organization_id: Uuid, page_size: u64) -> Result<Snapshot> {
    Ok(Snapshot {
        companies: read_all(store, organization_id, page_size).await.context("reading companies")?,
        jobs: read_all(store, organization_id, page_size).await.context("reading jobs")?,
        coordinators: read_all(store, organization_id, page_size)
            .await
            .context("reading coordinators")?,
        seekers: read_all(store, organization_id, page_size).await.context("reading job seekers")?,
        applications: read_all(store, organization_id, page_size)
            .await
            .context("reading applications")?,
        interviews: read_all(store, organization_id, page_size).await.context("reading interviews")?,
        referrals: read_all(store, organization_id, page_size).await.context("reading referrals")?,
    })
}

fn company_candidates(snapshot: &Snapshot) -> Vec<Candidate> {
    let mut referrals_per_job: HashMap<Uuid, usize> = HashMap::new();
    for job_id in snapshot.referrals.iter().filter_map(|r| r.job_id) {
        *referrals_per_job.entry(job_id).or_default() += 1;
    }
    let mut activity: HashMap<Uuid, usize> = HashMap::new();
    for job in &snapshot.jobs {
        *activity.entry(job.company_id).or_default() +=
            1 + referrals_per_job.get(&job.id).copied().unwrap_or_default();
    }
    snapshot
        .companies
        .iter()
        .map(|c| Candidate {
            id: c.id,
            name: c.name.clone(),
            created_at: c.created_at,
            activity: activity.get(&c.id).copied().unwrap_or_default(),
        })
        .collect()
}

fn coordinator_candidates(snapshot: &Snapshot) -> Vec<Candidate> {
    let mut activity: HashMap<Uuid, usize> = HashMap::new();
    for id in snapshot.applications.iter().filter_map(|a| a.coordinator_id) {
        *activity.entry(id).or_default() += 1;
    }
    snapshot
        .coordinators
        .iter()
        .map(|c| Candidate {
            id: c.id,
            name: c.full_name.clone(),
            created_at: c.created_at,
            activity: activity.get(&c.id).copied().unwrap_or_default(),
        })
        .collect()
}

/// Detects duplicates and, when `merge` is set, consolidates them.
pub async fn run_dedupe(
    store: &dyn Store,
    organization_id: Uuid,
    page_size: u64,
    codes: &CodeBook,
    merge: bool,
) -> Result<DedupeReport> {
    let snapshot = load_snapshot(store, organization_id, page_size).await?;
    let companies = company_candidates(&snapshot);
    let coordinators = coordinator_candidates(&snapshot);

    let mut prefix = prefix_candidates(ReferenceKind::Company, &companies);
    prefix.extend(prefix_candidates(ReferenceKind::Coordinator, &coordinators));

    let mut report = DedupeReport {
        companies: duplicate_groups(ReferenceKind::Company, &companies),
        coordinators: duplicate_groups(ReferenceKind::Coordinator, &coordinators),
        prefix_candidates: prefix,
        interview_collisions: plan_interview_collisions(
            &snapshot.interviews,
            &snapshot.applications,
            &snapshot.seekers,
            codes,
        ),
        merged: None,
    };
    info!(
        company_groups = report.companies.len(),
        coordinator_groups = report.coordinators.len(),
        prefix_candidates = report.prefix_candidates.len(),
        interview_collisions = report.interview_collisions.len(),
        "duplicate detection finished"
    );

    if merge {
        report.merged = Some(apply_merges(store, &snapshot, &report).await?);
    }
    Ok(report)
}

async fn apply_merges(
    store: &dyn Store,
    snapshot: &Snapshot,
    report: &DedupeReport,
) -> Result<MergeOutcome> {
    let mut outcome = MergeOutcome::default();

    for group in &report.companies {
        let master = group.master.id;
        let mut titles: HashMap<String, Uuid> = snapshot
            .jobs
            .iter()
            .filter(|j| j.company_id == master)
            .map(|j| (name_key(&j.title), j.id))
            .collect();

        for duplicate in &group.duplicates {
            for job in snapshot.jobs.iter().filter(|j| j.company_id == duplicate.id) {
                let key = name_key(&job.title);
                match titles.get(&key) {
                    Some(target) => {
                        outcome.referrals_repointed += store
                            .reassign(Table::Referrals, "job_id", job.id, *target)
                            .await
                            .context("re-pointing referrals")?;
                        store
                            .delete_ids(Table::Jobs, &[job.id])
                            .await
                            .context("deleting folded job")?;
                        outcome.jobs_folded += 1;
                    }
                    None => {
                        titles.insert(key, job.id);
                    }
                }
            }
            outcome.jobs_moved += store
                .reassign(Table::Jobs, "company_id", duplicate.id, master)
                .await
                .context("moving jobs to master company")?;
            store
                .delete_ids(Table::Companies, &[duplicate.id])
                .await
                .context("deleting duplicate company")?;
            outcome.companies_removed += 1;
            info!(master = %group.master.name, removed = %duplicate.name, "merged company");
        }
    }

    for group in &report.coordinators {
        for duplicate in &group.duplicates {
            outcome.applications_repointed += store
                .reassign(
                    Table::Applications,
                    "coordinator_id",
                    duplicate.id,
                    group.master.id,
                )
                .await
                .context("re-pointing applications")?;
            store
                .delete_ids(Table::Coordinators, &[duplicate.id])
                .await
                .context("deleting duplicate coordinator")?;
            outcome.coordinators_removed += 1;
            info!(master = %group.master.name, removed = %duplicate.name, "merged coordinator");
        }
    }

    let demote: Vec<Uuid> = report
        .interview_collisions
        .iter()
        .flat_map(|c| c.demote.iter().copied())
        .collect();
    if !demote.is_empty() {
        outcome.interviews_demoted = store
            .clear_interview_outcomes(&demote)
            .await
            .context("clearing duplicate interview outcomes")?;
        if outcome.interviews_demoted as usize != demote.len() {
            warn!(
                planned = demote.len(),
                cleared = outcome.interviews_demoted,
                "some interviews vanished before they could be demoted"
            );
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use rrec_core::{ApplicationProgress, Gender, InquiryStatus, InterviewResult, ReferralStatus};
    use rrec_storage::{BatchLoader, MemoryStore};

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, day, 0, 0, 0).single().unwrap()
    }

    fn candidate(name: &str, activity: usize, day: u32) -> Candidate {
        Candidate {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: at(day),
            activity,
        }
    }

    #[test]
    fn master_is_most_active_then_oldest() {
        let busy = candidate("東和物流", 5, 20);
        let old = candidate("東和物流", 2, 1);
        let tied_new = candidate("東和物流", 2, 9);
        let members = [old.clone(), busy.clone(), tied_new.clone()];
        assert_eq!(pick_master(&members), Some(&busy));

        let tie = [tied_new, old.clone()];
        assert_eq!(pick_master(&tie), Some(&old));
        assert_eq!(pick_master(&[]), None);
    }

    #[test]
    fn legal_forms_and_spacing_do_not_split_groups() {
        let a = candidate("株式会社 東和物流", 0, 1);
        let b = candidate("東和物流（株）", 0, 2);
        let c = candidate("北辰製作所", 0, 3);
        let groups = group_exact(&[a, b, c]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].0, "東和物流");
        assert_eq!(groups[0].1.len(), 2);
    }

    #[test]
    fn prefixes_are_reported_with_a_score() {
        let found = prefix_candidates(
            ReferenceKind::Coordinator,
            &[candidate("Yamada", 0, 1), candidate("Yamada Taro", 0, 2)],
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].shorter, "Yamada");
        assert_eq!(found[0].longer, "Yamada Taro");
        assert!(found[0].similarity > 0.8 && found[0].similarity < 1.0);
    }

    #[tokio::test]
    async fn merge_folds_companies_jobs_and_coordinators() {
        let store = MemoryStore::with_organization("test");
        let org = store.organization_id().unwrap();
        let loader = BatchLoader::new(&store, 50);

        let company = |name: &str, day| Company {
            id: Uuid::new_v4(),
            organization_id: org,
            name: name.to_string(),
            created_at: at(day),
        };
        let master = company("東和物流", 1);
        let dupe = company("株式会社東和物流", 2);
        let job = |company: &Company, title: &str| Job {
            id: Uuid::new_v4(),
            organization_id: org,
            company_id: company.id,
            title: title.to_string(),
            created_at: at(3),
        };
        let master_forklift = job(&master, "フォークリフト");
        let dupe_forklift = job(&dupe, "フォークリフト");
        let dupe_packing = job(&dupe, "梱包");

        let coordinator = |name: &str, day| Coordinator {
            id: Uuid::new_v4(),
            organization_id: org,
            full_name: name.to_string(),
            created_at: at(day),
        };
        let sato = coordinator("佐藤 一郎", 1);
        let sato_again = coordinator("佐藤一郎", 5);

        let seeker = JobSeeker {
            id: Uuid::new_v4(),
            organization_id: org,
            phone: "09012345678".to_string(),
            name: None,
            gender: Gender::Unknown,
            age: None,
            has_license: false,
            created_at: at(1),
        };
        let app = Application {
            id: Uuid::new_v4(),
            organization_id: org,
            job_seeker_id: seeker.id,
            source_id: None,
            coordinator_id: Some(sato_again.id),
            applied_at: NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            status: InquiryStatus::Contacted,
            progress: ApplicationProgress::Referred,
            notes: None,
            created_at: at(15),
        };
        let referral = Referral {
            id: Uuid::new_v4(),
            organization_id: org,
            application_id: app.id,
            job_id: Some(dupe_forklift.id),
            status: ReferralStatus::Referred,
            referred_at: NaiveDate::from_ymd_opt(2025, 1, 17).unwrap(),
            dispatch_interview_at: None,
            hired_at: None,
            start_work_date: None,
            work_month: None,
            created_at: at(17),
        };
        let interviews: Vec<Interview> = ["completed", "完了"]
            .iter()
            .enumerate()
            .map(|(n, label)| Interview {
                id: Uuid::new_v4(),
                organization_id: org,
                application_id: app.id,
                scheduled_at: at(17),
                conducted_at: Some(at(17)),
                result: Some(InterviewResult::Completed),
                result_label: Some(label.to_string()),
                created_at: at(17 + n as u32),
            })
            .collect();

        loader.insert_all(&[master.clone(), dupe.clone()]).await.unwrap();
        loader
            .insert_all(&[master_forklift.clone(), dupe_forklift, dupe_packing.clone()])
            .await
            .unwrap();
        loader.insert_all(&[sato.clone(), sato_again.clone()]).await.unwrap();
        loader.insert_all(&[seeker]).await.unwrap();
        loader.insert_all(&[app]).await.unwrap();
        loader.insert_all(&interviews).await.unwrap();
        loader.insert_all(&[referral]).await.unwrap();

        let dry = run_dedupe(&store, org, 10, &CodeBook::default(), false)
            .await
            .unwrap();
        assert_eq!(dry.companies.len(), 1);
        assert_eq!(dry.companies[0].master.id, dupe.id, "dupe carries more activity");
        assert_eq!(dry.coordinators[0].master.id, sato_again.id);
        assert_eq!(dry.interview_collisions.len(), 1);
        assert!(dry.merged.is_none());
        assert_eq!(store.len(Table::Companies).await, 2);

        let merged = run_dedupe(&store, org, 10, &CodeBook::default(), true)
            .await
            .unwrap()
            .merged
            .unwrap();
        assert_eq!(merged.companies_removed, 1);
        assert_eq!(merged.coordinators_removed, 1);
        assert_eq!(merged.jobs_folded, 1);
        assert_eq!(merged.interviews_demoted, 1);

        let companies: Vec<Company> = store.rows().await;
        assert_eq!(companies, vec![dupe.clone()]);
        let jobs: Vec<Job> = store.rows().await;
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.company_id == dupe.id));
        assert!(jobs.iter().any(|j| j.id == dupe_packing.id));
        let apps: Vec<Application> = store.rows().await;
        assert_eq!(apps[0].coordinator_id, Some(sato_again.id));

        let interviews: Vec<Interview> = store.rows().await;
        let kept: Vec<_> = interviews.iter().filter(|i| i.conducted_at.is_some()).collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].result_label.as_deref(), Some("完了"));
        assert_eq!(interviews.len(), 2, "demoted interviews are never deleted");
    }
}
