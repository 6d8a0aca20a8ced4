//! Monthly funnel metrics recomputed from persisted rows.
//!
//! Each metric buckets by its own date field, so one referral can land in
//! different months for different metrics.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Write as _};

use anyhow::{Context, Result};
use rrec_core::{Interview, Referral, Sale, SaleStatus, YearMonth};
use rrec_storage::{read_all, Store};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

pub mod reference;
pub mod work_month;

pub use reference::{reconcile, Delta, Reconciliation, ReferenceError, ReferenceTotals};
pub use work_month::{WorkMonthRow, WorkMonthTable};

pub const CRATE_NAME: &str = "rrec-funnel";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    InterviewsCompleted,
    Referrals,
    DispatchInterviewScheduled,
    DispatchInterviewDone,
    Hired,
    ProspectiveRevenue,
    ConfirmedWorking,
    PaidAmount,
}

impl Metric {
    pub const ALL: [Metric; 8] = [
        Metric::InterviewsCompleted,
        Metric::Referrals,
        Metric::DispatchInterviewScheduled,
        Metric::DispatchInterviewDone,
        Metric::Hired,
        Metric::ProspectiveRevenue,
        Metric::ConfirmedWorking,
        Metric::PaidAmount,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::InterviewsCompleted => "interviews_completed",
            Metric::Referrals => "referrals",
            Metric::DispatchInterviewScheduled => "dispatch_interview_scheduled",
            Metric::DispatchInterviewDone => "dispatch_interview_done",
            Metric::Hired => "hired",
            Metric::ProspectiveRevenue => "prospective_revenue",
            Metric::ConfirmedWorking => "confirmed_working",
            Metric::PaidAmount => "paid_amount",
        }
    }

    /// Revenue metrics sum sale amounts; the rest count rows.
    pub fn is_amount(self) -> bool {
        matches!(
            self,
            Metric::ProspectiveRevenue | Metric::ConfirmedWorking | Metric::PaidAmount
        )
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metric values per calendar month. Months with no activity are absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FunnelTable {
    months: BTreeMap<YearMonth, BTreeMap<Metric, Decimal>>,
}

impl FunnelTable {
    pub fn add(&mut self, month: YearMonth, metric: Metric, value: Decimal) {
        *self
            .months
            .entry(month)
            .or_default()
            .entry(metric)
            .or_default() += value;
    }

    pub fn get(&self, month: YearMonth, metric: Metric) -> Decimal {
        self.months
            .get(&month)
            .and_then(|m| m.get(&metric))
            .copied()
            .unwrap_or_default()
    }

    pub fn months(&self) -> impl Iterator<Item = YearMonth> + '_ {
        self.months.keys().copied()
    }

    pub fn total(&self, metric: Metric) -> Decimal {
        self.months.values().filter_map(|m| m.get(&metric)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.months.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "{:<8}", "month");
        for metric in Metric::ALL {
            let _ = write!(out, " {:>width$}", metric.as_str(), width = metric.as_str().len());
        }
        out.push('\n');
        for (month, values) in &self.months {
            let _ = write!(out, "{:<8}", month.to_string());
            for metric in Metric::ALL {
                let value = values.get(&metric).copied().unwrap_or_default();
                let _ = write!(
                    out,
                    " {:>width$}",
                    value.normalize().to_string(),
                    width = metric.as_str().len()
                );
            }
            out.push('\n');
        }
        out
    }
}

fn month_of(date: chrono::NaiveDate) -> YearMonth {
    YearMonth::from_date(date)
}

/// Recomputes every funnel metric.
pub fn compute(interviews: &[Interview], referrals: &[Referral], sales: &[Sale]) -> FunnelTable {
    let mut table = FunnelTable::default();

    for interview in interviews {
        if interview.conducted_at.is_some() {
            table.add(
                month_of(interview.scheduled_at.date_naive()),
                Metric::InterviewsCompleted,
                Decimal::ONE,
            );
        }
    }

    for referral in referrals {
        let month = month_of(referral.referred_at);
        table.add(month, Metric::Referrals, Decimal::ONE);
        if referral.dispatch_interview_at.is_some() {
            table.add(month, Metric::DispatchInterviewScheduled, Decimal::ONE);
        }
        if referral.status.passed_dispatch_interview() {
            table.add(month, Metric::DispatchInterviewDone, Decimal::ONE);
        }
        if referral.hired_at.is_some() {
            table.add(month, Metric::Hired, Decimal::ONE);
        }
    }

    let started: HashMap<Uuid, bool> = referrals
        .iter()
        .map(|r| (r.id, r.start_work_date.is_some()))
        .collect();
    for sale in sales {
        let (metric, date) = match sale.status {
            SaleStatus::Expected => (Metric::ProspectiveRevenue, sale.expected_date),
            SaleStatus::Confirmed => {
                if !started.get(&sale.referral_id).copied().unwrap_or(false) {
                    continue;
                }
                (Metric::ConfirmedWorking, sale.confirmed_date)
            }
            SaleStatus::Paid => (Metric::PaidAmount, sale.paid_date),
            SaleStatus::Invoiced => continue,
        };
        match date {
            Some(date) => table.add(month_of(date), metric, sale.amount),
            None => debug!(sale = %sale.id, %metric, "sale has no date for its status"),
        }
    }

    table
}

/// Both aggregations, computed from one read of the organization's rows.
#[derive(Debug, Clone)]
pub struct FunnelReport {
    pub funnel: FunnelTable,
    pub work_months: WorkMonthTable,
}

pub async fn compute_from_store(
    store: &dyn Store,
    organization_id: Uuid,
    page_size: u64,
) -> Result<FunnelReport> {
    let interviews: Vec<Interview> = read_all(store, organization_id, page_size)
        .await
        .context("reading interviews")?;
    let referrals: Vec<Referral> = read_all(store, organization_id, page_size)
        .await
        .context("reading referrals")?;
    let sales: Vec<Sale> = read_all(store, organization_id, page_size)
        .await
        .context("reading sales")?;
    info!(
        interviews = interviews.len(),
        referrals = referrals.len(),
        sales = sales.len(),
        "recomputing funnel"
    );

    Ok(FunnelReport {
        funnel: compute(&interviews, &referrals, &sales),
        work_months: WorkMonthTable::compute(&referrals, &sales),
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};
    use rrec_core::{Interview, InterviewResult, Referral, ReferralStatus, Sale, SaleStatus};
    use rust_decimal::Decimal;
    use uuid::Uuid;

    pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    pub fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).single().unwrap()
    }

    pub fn interview(day: NaiveDate, conducted: bool) -> Interview {
        let scheduled_at = day.and_time(chrono::NaiveTime::MIN).and_utc();
        Interview {
            id: Uuid::new_v4(),
            organization_id: Uuid::nil(),
            application_id: Uuid::new_v4(),
            scheduled_at,
            conducted_at: conducted.then_some(scheduled_at),
            result: Some(if conducted {
                InterviewResult::Completed
            } else {
                InterviewResult::Cancelled
            }),
            result_label: None,
            created_at: at(2025, 1, 1),
        }
    }

    pub fn referral(referred_at: NaiveDate, status: ReferralStatus) -> Referral {
        Referral {
            id: Uuid::new_v4(),
            organization_id: Uuid::nil(),
            application_id: Uuid::new_v4(),
            job_id: None,
            status,
            referred_at,
            dispatch_interview_at: None,
            hired_at: None,
            start_work_date: None,
            work_month: None,
            created_at: at(2025, 1, 1),
        }
    }

    pub fn sale(referral: &Referral, status: SaleStatus, amount: i64, on: NaiveDate) -> Sale {
        Sale::new(
            Uuid::nil(),
            referral.id,
            status,
            Decimal::from(amount),
            on,
            at(2025, 1, 1),
        )
    }
}
