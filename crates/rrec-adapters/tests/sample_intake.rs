use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use rrec_adapters::{CodeBook, ParseIssues, SpreadsheetAdapter};
use rrec_core::{InquiryStatus, InterviewResult, ReferralStatus, YearMonth};
use rust_decimal::Decimal;

fn fixture() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/intake/sample.csv")
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[test]
fn sample_export_parses_with_counted_issues() {
    let file = SpreadsheetAdapter::new(CodeBook::default())
        .load(fixture())
        .expect("sample export loads");

    assert_eq!(file.rows.len(), 6);
    assert_eq!(
        file.issues,
        ParseIssues {
            rows_read: 6,
            blank_rows: 1,
            unreadable_rows: 0,
            bad_dates: 1,
            bad_amounts: 0,
            bad_year_months: 0,
            bad_ages: 1,
            missing_phones: 1,
            unknown_codes: 1,
        }
    );
}

#[test]
fn placed_candidate_row_carries_every_stage() {
    let file = SpreadsheetAdapter::default().load(fixture()).expect("load");
    let row = &file.rows[0];

    assert_eq!(row.phone, "09012345678");
    assert_eq!(row.applied_at, Some(date(2025, 1, 15)));
    assert_eq!(row.inquiry_status, Some(InquiryStatus::Contacted));
    assert_eq!(row.coordinator.as_deref(), Some("佐藤"));
    assert_eq!(row.screening_result, Some(InterviewResult::Completed));
    assert!(row.connected);
    assert_eq!(row.company.as_deref(), Some("東和物流"));
    assert_eq!(row.progress, Some(ReferralStatus::Working));
    assert_eq!(row.start_work_date, Some(date(2025, 2, 3)));
    assert_eq!(row.paid_amount, Some(Decimal::from(300_000)));
    assert_eq!(row.paid_date, Some(date(2025, 3, 31)));
    assert!(row.payment_complete);
}

#[test]
fn repeat_inquiry_shares_the_normalized_phone() {
    let file = SpreadsheetAdapter::default().load(fixture()).expect("load");
    let first = &file.rows[0];
    let repeat = &file.rows[3];

    assert_eq!(repeat.phone, first.phone);
    assert_eq!(repeat.applied_at, Some(date(2025, 1, 20)));
    assert_eq!(repeat.screening_result, Some(InterviewResult::Cancelled));
    assert!(!repeat.connected);
}

#[test]
fn marker_only_work_month_and_degraded_cells() {
    let file = SpreadsheetAdapter::default().load(fixture()).expect("load");
    let row = &file.rows[4];

    assert_eq!(row.applied_at, None);
    assert_eq!(row.age, None);
    assert_eq!(row.progress, None);
    assert_eq!(row.work_month, YearMonth::new(2025, 2));
}
