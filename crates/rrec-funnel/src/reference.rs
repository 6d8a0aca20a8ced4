//! Trusted monthly totals and the computed-vs-expected comparison.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use rrec_core::YearMonth;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::{FunnelTable, Metric};

#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("failed to read reference totals {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid reference totals: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("unsupported reference totals version {0}")]
    Version(u32),
}

/// Expected metric values per month, as kept alongside the legacy sheet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceTotals {
    pub version: u32,
    #[serde(default)]
    pub months: BTreeMap<YearMonth, BTreeMap<Metric, Decimal>>,
}

impl ReferenceTotals {
    pub const VERSION: u32 = 1;

    pub fn from_yaml_str(text: &str) -> Result<Self, ReferenceError> {
        let totals: Self = serde_yaml::from_str(text)?;
        if totals.version != Self::VERSION {
            return Err(ReferenceError::Version(totals.version));
        }
        Ok(totals)
    }

    pub fn load(path: &Path) -> Result<Self, ReferenceError> {
        let text = std::fs::read_to_string(path).map_err(|source| ReferenceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delta {
    pub month: YearMonth,
    pub metric: Metric,
    pub expected: Decimal,
    pub computed: Decimal,
    /// `computed - expected`.
    pub delta: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub rows: Vec<Delta>,
    /// Computed months the reference says nothing about.
    pub unreferenced_months: Vec<YearMonth>,
}

impl Reconciliation {
    pub fn mismatches(&self) -> impl Iterator<Item = &Delta> {
        self.rows.iter().filter(|d| !d.delta.is_zero())
    }

    pub fn is_clean(&self) -> bool {
        self.mismatches().next().is_none()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<8} {:<28} {:>14} {:>14} {:>12}",
            "month", "metric", "expected", "computed", "delta"
        );
        for d in &self.rows {
            let marker = if d.delta.is_zero() { "" } else { "  <-" };
            let _ = writeln!(
                out,
                "{:<8} {:<28} {:>14} {:>14} {:>12}{marker}",
                d.month.to_string(),
                d.metric.as_str(),
                d.expected.normalize().to_string(),
                d.computed.normalize().to_string(),
                signed(d.delta)
            );
        }
        if !self.unreferenced_months.is_empty() {
            let months: Vec<String> = self
                .unreferenced_months
                .iter()
                .map(ToString::to_string)
                .collect();
            let _ = writeln!(out, "no reference for: {}", months.join(", "));
        }
        out
    }
}

fn signed(value: Decimal) -> String {
    let value = value.normalize();
    if value.is_sign_positive() && !value.is_zero() {
        format!("+{value}")
    } else {
        value.to_string()
    }
}

/// Diffs every referenced month and metric. Mismatches are reported, never
/// raised; deciding whether a delta is a defect is left to a person.
pub fn reconcile(computed: &FunnelTable, reference: &ReferenceTotals) -> Reconciliation {
    let mut out = Reconciliation::default();
    for (month, metrics) in &reference.months {
        for (metric, expected) in metrics {
            let value = computed.get(*month, *metric);
            let delta = value - *expected;
            if !delta.is_zero() {
                warn!(%month, %metric, %expected, computed = %value, %delta, "funnel total differs from reference");
            }
            out.rows.push(Delta {
                month: *month,
                metric: *metric,
                expected: *expected,
                computed: value,
                delta,
            });
        }
    }
    out.unreferenced_months = computed
        .months()
        .filter(|m| !reference.months.contains_key(m))
        .collect();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute;
    use crate::fixtures::*;

    fn jan() -> YearMonth {
        YearMonth::new(2025, 1).unwrap()
    }

    #[test]
    fn two_missing_interviews_show_as_minus_two() {
        let interviews: Vec<_> = (0..256)
            .map(|i| interview(date(2025, 1, 1 + (i % 28) as u32), true))
            .collect();
        let computed = compute(&interviews, &[], &[]);
        let reference = ReferenceTotals::from_yaml_str(
            "version: 1\nmonths:\n  \"2025-01\":\n    interviews_completed: 258\n",
        )
        .unwrap();

        let result = reconcile(&computed, &reference);
        assert_eq!(
            result.rows,
            vec![Delta {
                month: jan(),
                metric: Metric::InterviewsCompleted,
                expected: Decimal::from(258),
                computed: Decimal::from(256),
                delta: Decimal::from(-2),
            }]
        );
        assert!(!result.is_clean());
        assert!(result.render().contains("-2"));
    }

    #[test]
    fn matching_totals_are_clean_and_extra_months_are_listed() {
        let mut computed = FunnelTable::default();
        computed.add(jan(), Metric::Referrals, Decimal::from(3));
        computed.add(YearMonth::new(2025, 2).unwrap(), Metric::Referrals, Decimal::ONE);
        let reference = ReferenceTotals::from_yaml_str(
            "version: 1\nmonths:\n  \"2025-01\":\n    referrals: 3\n",
        )
        .unwrap();

        let result = reconcile(&computed, &reference);
        assert!(result.is_clean());
        assert_eq!(result.unreferenced_months, vec![YearMonth::new(2025, 2).unwrap()]);
    }

    #[test]
    fn malformed_reference_files_are_rejected() {
        assert!(matches!(
            ReferenceTotals::from_yaml_str("version: 2\nmonths: {}\n"),
            Err(ReferenceError::Version(2))
        ));
        assert!(matches!(
            ReferenceTotals::from_yaml_str("version: 1\nmonths:\n  \"2025-13\": {}\n"),
            Err(ReferenceError::Parse(_))
        ));
        assert!(matches!(
            ReferenceTotals::from_yaml_str("version: 1\nmonths:\n  \"2025-01\":\n    walk_ins: 4\n"),
            Err(ReferenceError::Parse(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ReferenceTotals::load(&dir.path().join("missing.yaml")),
            Err(ReferenceError::Io { .. })
        ));
    }

    #[test]
    fn shipped_reference_file_parses() {
        let totals = ReferenceTotals::from_yaml_str(include_str!(
            "../../../reference/funnel_totals.yaml"
        ))
        .unwrap();
        assert_eq!(
            totals.months[&jan()][&Metric::InterviewsCompleted],
            Decimal::from(258)
        );
    }
}
