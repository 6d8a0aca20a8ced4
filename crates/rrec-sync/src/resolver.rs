//! Get-or-create resolution of low-cardinality reference data.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rrec_core::{Company, Coordinator, Job, Source};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

/// Key used for name lookups: whitespace removed, case folded.
pub fn name_key(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorMatch {
    Exact(Uuid),
    /// The sheet held a family name and exactly one full name starts with it.
    Prefix(Uuid),
    /// More than one full name starts with the given name.
    Ambiguous(usize),
    NoMatch,
}

impl CoordinatorMatch {
    pub fn id(self) -> Option<Uuid> {
        match self {
            CoordinatorMatch::Exact(id) | CoordinatorMatch::Prefix(id) => Some(id),
            CoordinatorMatch::Ambiguous(_) | CoordinatorMatch::NoMatch => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolverStats {
    pub sources_created: usize,
    pub companies_created: usize,
    pub jobs_created: usize,
    pub coordinators_exact: usize,
    pub coordinators_prefix: usize,
    pub coordinators_ambiguous: usize,
    pub coordinators_unmatched: usize,
}

/// Reference rows created during a run, waiting to be written.
#[derive(Debug, Clone, Default)]
pub struct NewReferenceData {
    pub sources: Vec<Source>,
    pub companies: Vec<Company>,
    pub jobs: Vec<Job>,
}

/// In-memory name maps per reference category, seeded from stored rows.
///
/// Sources, companies and jobs are created on first sight. Coordinators are
/// staff records and are only ever matched, never created.
#[derive(Debug)]
pub struct MasterDataResolver {
    organization_id: Uuid,
    created_at: DateTime<Utc>,
    sources: HashMap<String, Uuid>,
    companies: HashMap<String, Uuid>,
    jobs: HashMap<(Uuid, String), Uuid>,
    coordinators: Vec<(String, Uuid)>,
    pending: NewReferenceData,
    stats: ResolverStats,
}

impl MasterDataResolver {
    pub fn new(organization_id: Uuid, created_at: DateTime<Utc>) -> Self {
        Self {
            organization_id,
            created_at,
            sources: HashMap::new(),
            companies: HashMap::new(),
            jobs: HashMap::new(),
            coordinators: Vec::new(),
            pending: NewReferenceData::default(),
            stats: ResolverStats::default(),
        }
    }

    pub fn seed(
        mut self,
        sources: &[Source],
        companies: &[Company],
        jobs: &[Job],
        coordinators: &[Coordinator],
    ) -> Self {
        // First stored row wins when names collide after normalization.
        for source in sources {
            self.sources.entry(name_key(&source.name)).or_insert(source.id);
        }
        for company in companies {
            self.companies
                .entry(name_key(&company.name))
                .or_insert(company.id);
        }
        for job in jobs {
            self.jobs
                .entry((job.company_id, name_key(&job.title)))
                .or_insert(job.id);
        }
        self.coordinators = coordinators
            .iter()
            .map(|c| (name_key(&c.full_name), c.id))
            .collect();
        self
    }

    pub fn source_id(&mut self, name: &str) -> Uuid {
        let key = name_key(name);
        if let Some(id) = self.sources.get(&key) {
            return *id;
        }
        let source = Source {
            id: Uuid::new_v4(),
            organization_id: self.organization_id,
            name: name.trim().to_string(),
            created_at: self.created_at,
        };
        debug!(name = %source.name, "creating source");
        self.sources.insert(key, source.id);
        self.stats.sources_created += 1;
        let id = source.id;
        self.pending.sources.push(source);
        id
    }

    pub fn company_id(&mut self, name: &str) -> Uuid {
        let key = name_key(name);
        if let Some(id) = self.companies.get(&key) {
            return *id;
        }
        let company = Company {
            id: Uuid::new_v4(),
            organization_id: self.organization_id,
            name: name.trim().to_string(),
            created_at: self.created_at,
        };
        debug!(name = %company.name, "creating company");
        self.companies.insert(key, company.id);
        self.stats.companies_created += 1;
        let id = company.id;
        self.pending.companies.push(company);
        id
    }

    /// Jobs are identified by `(company, title)`.
    pub fn job_id(&mut self, company_id: Uuid, title: &str) -> Uuid {
        let key = (company_id, name_key(title));
        if let Some(id) = self.jobs.get(&key) {
            return *id;
        }
        let job = Job {
            id: Uuid::new_v4(),
            organization_id: self.organization_id,
            company_id,
            title: title.trim().to_string(),
            created_at: self.created_at,
        };
        self.jobs.insert(key, job.id);
        self.stats.jobs_created += 1;
        let id = job.id;
        self.pending.jobs.push(job);
        id
    }

    /// Exact full-name match first, then full names starting with `name`.
    pub fn match_coordinator(&self, name: &str) -> CoordinatorMatch {
        let key = name_key(name);
        if key.is_empty() {
            return CoordinatorMatch::NoMatch;
        }
        if let Some((_, id)) = self.coordinators.iter().find(|(full, _)| *full == key) {
            return CoordinatorMatch::Exact(*id);
        }
        let candidates: Vec<Uuid> = self
            .coordinators
            .iter()
            .filter(|(full, _)| full.starts_with(&key))
            .map(|(_, id)| *id)
            .collect();
        match candidates.as_slice() {
            [] => CoordinatorMatch::NoMatch,
            [only] => CoordinatorMatch::Prefix(*only),
            many => CoordinatorMatch::Ambiguous(many.len()),
        }
    }

    /// Like [`Self::match_coordinator`], recording the outcome in the stats.
    pub fn coordinator_id(&mut self, name: &str) -> Option<Uuid> {
        let found = self.match_coordinator(name);
        match found {
            CoordinatorMatch::Exact(_) => self.stats.coordinators_exact += 1,
            CoordinatorMatch::Prefix(_) => self.stats.coordinators_prefix += 1,
            CoordinatorMatch::Ambiguous(count) => {
                warn!(name, candidates = count, "coordinator name is ambiguous, leaving unassigned");
                self.stats.coordinators_ambiguous += 1;
            }
            CoordinatorMatch::NoMatch => {
                debug!(name, "no coordinator matches");
                self.stats.coordinators_unmatched += 1;
            }
        }
        found.id()
    }

    pub fn stats(&self) -> &ResolverStats {
        &self.stats
    }

    pub fn take_new(&mut self) -> NewReferenceData {
        std::mem::take(&mut self.pending)
    }
}
