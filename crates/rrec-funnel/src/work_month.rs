//! Planning view bucketed by work month instead of referral month.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

use rrec_core::{Referral, Sale, SaleStatus, YearMonth};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkMonthRow {
    /// Live referrals expected to start work in the month, working ones included.
    pub prospective_count: u32,
    pub prospective_amount: Decimal,
    pub working_count: u32,
    pub working_amount: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkMonthTable {
    pub months: BTreeMap<YearMonth, WorkMonthRow>,
    /// Referrals whose work month could not be resolved; excluded above.
    pub unresolved: usize,
    /// How many referrals each extractor resolved.
    pub resolved_by: BTreeMap<&'static str, usize>,
}

/// Amount a referral is worth for planning: the furthest-along sale wins,
/// several sales at that stage add up.
fn referral_value(sales: &[&Sale]) -> Decimal {
    const STAGES: [SaleStatus; 4] = [
        SaleStatus::Paid,
        SaleStatus::Invoiced,
        SaleStatus::Confirmed,
        SaleStatus::Expected,
    ];
    STAGES
        .iter()
        .map(|stage| {
            sales
                .iter()
                .filter(|s| s.status == *stage)
                .map(|s| s.amount)
                .sum::<Decimal>()
        })
        .find(|amount| !amount.is_zero())
        .unwrap_or_default()
}

impl WorkMonthTable {
    pub fn compute(referrals: &[Referral], sales: &[Sale]) -> Self {
        let mut by_referral: HashMap<Uuid, Vec<&Sale>> = HashMap::new();
        for sale in sales {
            by_referral.entry(sale.referral_id).or_default().push(sale);
        }

        let mut table = WorkMonthTable::default();
        for referral in referrals {
            if referral.status.is_absorbing() {
                continue;
            }
            let Some((month, extractor)) = referral.work_month() else {
                table.unresolved += 1;
                continue;
            };
            *table.resolved_by.entry(extractor).or_default() += 1;

            let value = by_referral
                .get(&referral.id)
                .map(|s| referral_value(s))
                .unwrap_or_default();
            let row = table.months.entry(month).or_default();
            row.prospective_count += 1;
            row.prospective_amount += value;
            if referral.status.is_working() {
                row.working_count += 1;
                row.working_amount += value;
            }
        }
        table
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<8} {:>11} {:>14} {:>8} {:>14}",
            "work_mo", "prospective", "prospective_¥", "working", "working_¥"
        );
        for (month, row) in &self.months {
            let _ = writeln!(
                out,
                "{:<8} {:>11} {:>14} {:>8} {:>14}",
                month.to_string(),
                row.prospective_count,
                row.prospective_amount.normalize().to_string(),
                row.working_count,
                row.working_amount.normalize().to_string()
            );
        }
        let _ = writeln!(out, "unresolved work month: {}", self.unresolved);
        out
    }
}
