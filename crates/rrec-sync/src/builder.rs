//! Turns normalized intake rows into dependency-ordered entity graphs.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};
use rrec_adapters::IntakeRow;
use rrec_core::{
    Application, ApplicationProgress, InquiryStatus, Interview, InterviewResult, JobSeeker,
    Referral, ReferralStatus, Sale, SaleStatus, TransitionPolicy, YearMonth,
};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::identity::{placeholder_phone, ApplicationKey, SeekerIndex};
use crate::resolver::MasterDataResolver;

/// Entities produced by a build, grouped per table in insert order.
#[derive(Debug, Clone, Default)]
pub struct RecordGraph {
    pub job_seekers: Vec<JobSeeker>,
    pub applications: Vec<Application>,
    pub interviews: Vec<Interview>,
    pub referrals: Vec<Referral>,
    pub sales: Vec<Sale>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildStats {
    pub rows_seen: usize,
    pub rows_built: usize,
    pub skipped_without_applied_date: usize,
    pub skipped_duplicate_application: usize,
    pub seekers_created: usize,
    pub seekers_matched: usize,
    pub placeholder_phones: usize,
    pub jobs_without_company: usize,
    /// Referrals to a company whose job title was blank; they get the
    /// company's [`UNSPECIFIED_JOB_TITLE`] job.
    pub jobs_without_title: usize,
    pub revenue_without_referral: usize,
}

/// Title of the job a referral is attached to when the sheet names the
/// company but not the position.
pub const UNSPECIFIED_JOB_TITLE: &str = "未定";

/// Referral status precedence kept from the spreadsheet era: a completed
/// payment wins over the progress code, which wins over the bare referral
/// marker.
pub fn derive_referral_status(row: &IntakeRow) -> ReferralStatus {
    if row.payment_complete {
        ReferralStatus::FullPaid
    } else if let Some(progress) = row.progress {
        progress
    } else {
        ReferralStatus::Referred
    }
}

pub fn derive_application_progress(
    inquiry: InquiryStatus,
    interview: Option<&Interview>,
    referral: Option<&Referral>,
) -> ApplicationProgress {
    if let Some(referral) = referral {
        return if referral.status.is_absorbing() {
            ApplicationProgress::Closed
        } else if referral.status.is_working() {
            ApplicationProgress::Working
        } else if referral.status.is_hired() {
            ApplicationProgress::Hired
        } else {
            ApplicationProgress::Referred
        };
    }
    if interview.is_some() {
        return ApplicationProgress::Screening;
    }
    match inquiry {
        InquiryStatus::NotInterested | InquiryStatus::Invalid => ApplicationProgress::Closed,
        _ => ApplicationProgress::New,
    }
}

/// Month a referral's revenue is booked to: its work month when known,
/// otherwise the month it was made.
pub fn revenue_month(referral: &Referral) -> YearMonth {
    referral
        .work_month()
        .map(|(month, _)| month)
        .unwrap_or_else(|| YearMonth::from_date(referral.referred_at))
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

/// Builds entity graphs row by row, matching job seekers and applications
/// against what is already stored and what earlier rows produced.
pub struct RecordBuilder<'a> {
    organization_id: Uuid,
    created_at: DateTime<Utc>,
    resolver: &'a mut MasterDataResolver,
    seekers: SeekerIndex,
    applications: HashSet<ApplicationKey>,
    graph: RecordGraph,
    stats: BuildStats,
}

impl<'a> RecordBuilder<'a> {
    pub fn new(
        organization_id: Uuid,
        created_at: DateTime<Utc>,
        resolver: &'a mut MasterDataResolver,
        seekers: SeekerIndex,
        existing_applications: impl IntoIterator<Item = ApplicationKey>,
    ) -> Self {
        Self {
            organization_id,
            created_at,
            resolver,
            seekers,
            applications: existing_applications.into_iter().collect(),
            graph: RecordGraph::default(),
            stats: BuildStats::default(),
        }
    }

    pub fn add_rows<'r>(&mut self, rows: impl IntoIterator<Item = &'r IntakeRow>) {
        for row in rows {
            self.add_row(row);
        }
    }

    /// Adds one row's entities. Returns false when the row was skipped.
    pub fn add_row(&mut self, row: &IntakeRow) -> bool {
        self.stats.rows_seen += 1;
        let Some(applied_at) = row.applied_at else {
            debug!(line = row.line, "row has no applied date, skipping");
            self.stats.skipped_without_applied_date += 1;
            return false;
        };

        let phone = if row.phone.is_empty() {
            self.stats.placeholder_phones += 1;
            placeholder_phone()
        } else {
            row.phone.clone()
        };
        let key = ApplicationKey {
            phone: phone.clone(),
            applied_at,
        };
        if !self.applications.insert(key) {
            debug!(line = row.line, %applied_at, "application already known, skipping");
            self.stats.skipped_duplicate_application += 1;
            return false;
        }

        let job_seeker_id = self.job_seeker(row, &phone);
        let source_id = row.source.as_deref().map(|s| self.resolver.source_id(s));
        let coordinator_id = row
            .coordinator
            .as_deref()
            .and_then(|c| self.resolver.coordinator_id(c));
        let inquiry = row.inquiry_status.unwrap_or_default();

        let mut application = Application {
            id: Uuid::new_v4(),
            organization_id: self.organization_id,
            job_seeker_id,
            source_id,
            coordinator_id,
            applied_at,
            status: inquiry,
            progress: ApplicationProgress::New,
            notes: row.notes.clone(),
            created_at: self.created_at,
        };
        let interview = self.interview(row, application.id, applied_at);
        let referral = self.referral(row, application.id, applied_at);
        application.progress =
            derive_application_progress(inquiry, interview.as_ref(), referral.as_ref());

        match &referral {
            Some(referral) => self.sales(row, referral),
            None => {
                let has_revenue = row.expected_amount.is_some()
                    || row.confirmed_amount.is_some()
                    || row.paid_amount.is_some();
                if has_revenue {
                    self.stats.revenue_without_referral += 1;
                }
            }
        }

        self.graph.applications.push(application);
        self.graph.interviews.extend(interview);
        self.graph.referrals.extend(referral);
        self.stats.rows_built += 1;
        true
    }

    fn job_seeker(&mut self, row: &IntakeRow, phone: &str) -> Uuid {
        if let Some(id) = self.seekers.get(phone) {
            self.stats.seekers_matched += 1;
            return id;
        }
        let seeker = JobSeeker {
            id: Uuid::new_v4(),
            organization_id: self.organization_id,
            phone: phone.to_string(),
            name: row.name.clone(),
            gender: row.gender,
            age: row.age,
            has_license: row.has_license,
            created_at: self.created_at,
        };
        self.seekers.insert(phone, seeker.id);
        self.stats.seekers_created += 1;
        let id = seeker.id;
        self.graph.job_seekers.push(seeker);
        id
    }

    /// Only rows with a recognized screening outcome get an interview.
    fn interview(
        &self,
        row: &IntakeRow,
        application_id: Uuid,
        applied_at: NaiveDate,
    ) -> Option<Interview> {
        let result = row.screening_result?;
        let scheduled_at = midnight(row.screening_date.unwrap_or(applied_at));
        Some(Interview {
            id: Uuid::new_v4(),
            organization_id: self.organization_id,
            application_id,
            scheduled_at,
            conducted_at: (result == InterviewResult::Completed).then_some(scheduled_at),
            result: Some(result),
            result_label: row.screening_label.clone(),
            created_at: self.created_at,
        })
    }

    fn referral(
        &mut self,
        row: &IntakeRow,
        application_id: Uuid,
        applied_at: NaiveDate,
    ) -> Option<Referral> {
        if !row.connected {
            return None;
        }
        let company_id = row.company.as_deref().map(|c| self.resolver.company_id(c));
        let job_id = match (company_id, row.job_title.as_deref()) {
            (Some(company_id), Some(title)) => Some(self.resolver.job_id(company_id, title)),
            (Some(company_id), None) => {
                self.stats.jobs_without_title += 1;
                Some(self.resolver.job_id(company_id, UNSPECIFIED_JOB_TITLE))
            }
            (None, Some(_)) => {
                self.stats.jobs_without_company += 1;
                None
            }
            (None, None) => None,
        };

        // Snapshot assignment: the sheet holds the current state, not its history.
        let status = ReferralStatus::Referred
            .transition(derive_referral_status(row), TransitionPolicy::BulkImport)
            .unwrap_or(ReferralStatus::Referred);
        Some(Referral {
            id: Uuid::new_v4(),
            organization_id: self.organization_id,
            application_id,
            job_id,
            status,
            referred_at: row.screening_date.unwrap_or(applied_at),
            dispatch_interview_at: row.dispatch_interview_date,
            hired_at: row.hired_date,
            start_work_date: row.start_work_date,
            work_month: row.work_month,
            created_at: self.created_at,
        })
    }

    /// One sale per populated revenue column.
    fn sales(&mut self, row: &IntakeRow, referral: &Referral) {
        let confirmed_on = referral
            .start_work_date
            .or_else(|| referral.work_month.map(YearMonth::first_day))
            .unwrap_or(referral.referred_at);
        let columns = [
            (
                SaleStatus::Expected,
                row.expected_amount,
                revenue_month(referral).first_day(),
            ),
            (SaleStatus::Confirmed, row.confirmed_amount, confirmed_on),
            (
                SaleStatus::Paid,
                row.paid_amount,
                row.paid_date.unwrap_or(confirmed_on),
            ),
        ];
        for (status, amount, date) in columns {
            if let Some(amount) = amount {
                self.graph.sales.push(Sale::new(
                    self.organization_id,
                    referral.id,
                    status,
                    amount,
                    date,
                    self.created_at,
                ));
            }
        }
    }

    pub fn stats(&self) -> &BuildStats {
        &self.stats
    }

    pub fn finish(self) -> (RecordGraph, BuildStats) {
        (self.graph, self.stats)
    }
}
