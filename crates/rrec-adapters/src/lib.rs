//! Spreadsheet intake adapter: reads the agency's delimited export, checks its
//! column layout and turns every data row into a normalized [`IntakeRow`].

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord};
use rrec_core::{Gender, InquiryStatus, InterviewResult, ReferralStatus, YearMonth};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod codes;
pub mod layout;
pub mod normalize;

pub use codes::{CodeBook, CodeRule};
pub use layout::{Column, ColumnLayout, LayoutError, Row};

pub const CRATE_NAME: &str = "rrec-adapters";

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error("reading header row {row}: {source}")]
    Header { row: usize, source: csv::Error },
}

/// One data row after normalization. Unparseable cells are already `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntakeRow {
    pub line: u64,
    pub applied_at: Option<NaiveDate>,
    pub source: Option<String>,
    pub name: Option<String>,
    /// Normalized phone; empty when the sheet had none.
    pub phone: String,
    pub gender: Gender,
    pub age: Option<i32>,
    pub has_license: bool,
    pub inquiry_status: Option<InquiryStatus>,
    pub coordinator: Option<String>,
    pub screening_date: Option<NaiveDate>,
    pub screening_result: Option<InterviewResult>,
    pub screening_label: Option<String>,
    pub connected: bool,
    pub company: Option<String>,
    pub job_title: Option<String>,
    pub dispatch_interview_date: Option<NaiveDate>,
    pub progress: Option<ReferralStatus>,
    pub hired_date: Option<NaiveDate>,
    pub start_work_date: Option<NaiveDate>,
    pub work_month: Option<YearMonth>,
    pub expected_amount: Option<Decimal>,
    pub confirmed_amount: Option<Decimal>,
    pub paid_amount: Option<Decimal>,
    pub paid_date: Option<NaiveDate>,
    pub payment_complete: bool,
    pub notes: Option<String>,
}

/// Cells that were present but could not be read. Counted, never raised.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParseIssues {
    pub rows_read: usize,
    pub blank_rows: usize,
    pub unreadable_rows: usize,
    pub bad_dates: usize,
    pub bad_amounts: usize,
    pub bad_year_months: usize,
    pub bad_ages: usize,
    pub missing_phones: usize,
    pub unknown_codes: usize,
}

impl ParseIssues {
    pub fn total(&self) -> usize {
        self.unreadable_rows
            + self.bad_dates
            + self.bad_amounts
            + self.bad_year_months
            + self.bad_ages
            + self.missing_phones
            + self.unknown_codes
    }

    fn date(&mut self, raw: &str) -> Option<NaiveDate> {
        let parsed = normalize::parse_date(raw);
        if parsed.is_none() && !raw.is_empty() {
            self.bad_dates += 1;
        }
        parsed
    }

    fn amount(&mut self, raw: &str) -> Option<Decimal> {
        let parsed = normalize::parse_amount(raw);
        if parsed.is_none() && !raw.is_empty() {
            self.bad_amounts += 1;
        }
        parsed
    }

    fn year_month(&mut self, raw: &str) -> Option<YearMonth> {
        let parsed = normalize::parse_year_month(raw);
        if parsed.is_none() && !raw.is_empty() {
            self.bad_year_months += 1;
        }
        parsed
    }

    fn age(&mut self, raw: &str) -> Option<i32> {
        let parsed = normalize::parse_age(raw);
        if parsed.is_none() && !raw.is_empty() {
            self.bad_ages += 1;
        }
        parsed
    }

    fn code<T>(&mut self, raw: &str, found: Option<T>) -> Option<T> {
        if found.is_none() && !raw.is_empty() {
            self.unknown_codes += 1;
        }
        found
    }
}

/// A parsed export plus the raw bytes, which apply runs archive.
#[derive(Debug, Clone)]
pub struct IntakeFile {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
    pub rows: Vec<IntakeRow>,
    pub issues: ParseIssues,
}

#[derive(Debug, Clone, Default)]
pub struct SpreadsheetAdapter {
    layout: ColumnLayout,
    codes: CodeBook,
}

impl SpreadsheetAdapter {
    pub fn new(codes: CodeBook) -> Self {
        Self {
            layout: ColumnLayout::standard(),
            codes,
        }
    }

    pub fn with_layout(mut self, layout: ColumnLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn codes(&self) -> &CodeBook {
        &self.codes
    }

    /// Reads and parses an export file. `.tsv` files are tab separated,
    /// everything else comma separated.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<IntakeFile> {
        let path = path.as_ref();
        let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let (rows, issues) = self
            .parse(&bytes, delimiter_for(path))
            .with_context(|| format!("parsing {}", path.display()))?;
        info!(
            path = %path.display(),
            rows = rows.len(),
            issues = issues.total(),
            "intake file parsed"
        );
        Ok(IntakeFile {
            path: path.to_path_buf(),
            bytes,
            rows,
            issues,
        })
    }

    pub fn parse(
        &self,
        bytes: &[u8],
        delimiter: u8,
    ) -> Result<(Vec<IntakeRow>, ParseIssues), AdapterError> {
        let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(delimiter)
            .from_reader(bytes);

        let mut records = reader.records();
        let mut header_rows = 0;
        for row in 0..ColumnLayout::HEADER_ROWS {
            let Some(record) = records.next() else {
                return Err(LayoutError::MissingHeaderRows {
                    expected: ColumnLayout::HEADER_ROWS,
                    found: header_rows,
                }
                .into());
            };
            let record = record.map_err(|source| AdapterError::Header { row, source })?;
            header_rows += 1;
            if row == ColumnLayout::LABEL_ROW {
                self.layout.validate(&record)?;
            }
        }

        let mut issues = ParseIssues::default();
        let mut rows = Vec::new();
        for record in records {
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    warn!(error = %err, "skipping unreadable intake row");
                    issues.unreadable_rows += 1;
                    continue;
                }
            };
            if let Some(row) = self.read_record(&record, &mut issues) {
                rows.push(row);
            }
        }
        debug!(rows = rows.len(), ?issues, "intake rows normalized");
        Ok((rows, issues))
    }

    fn read_record(&self, record: &StringRecord, issues: &mut ParseIssues) -> Option<IntakeRow> {
        let row = self.layout.row(record);
        if row.is_blank() {
            issues.blank_rows += 1;
            return None;
        }
        issues.rows_read += 1;

        let codes = &self.codes;
        let text = |column| normalize::clean_text(row.get(column));

        let phone = normalize::normalize_phone(row.get(Column::Phone));
        if phone.is_empty() {
            issues.missing_phones += 1;
        }
        let screening_raw = row.get(Column::ScreeningResult);
        let progress_raw = row.get(Column::Progress);
        let inquiry_raw = row.get(Column::InquiryStatus);

        Some(IntakeRow {
            line: row.line().unwrap_or_default(),
            applied_at: issues.date(row.get(Column::AppliedDate)),
            source: text(Column::Source),
            name: text(Column::Name),
            phone,
            gender: normalize::parse_gender(row.get(Column::Gender)),
            age: issues.age(row.get(Column::Age)),
            has_license: normalize::parse_boolean(row.get(Column::License)),
            inquiry_status: issues.code(inquiry_raw, codes.inquiry_status(inquiry_raw)),
            coordinator: text(Column::Coordinator),
            screening_date: issues.date(row.get(Column::ScreeningDate)),
            screening_result: issues.code(screening_raw, codes.screening_result(screening_raw)),
            screening_label: normalize::clean_text(screening_raw),
            connected: codes.is_connected(row.get(Column::Connection)),
            company: text(Column::Company),
            job_title: text(Column::JobTitle),
            dispatch_interview_date: issues.date(row.get(Column::DispatchInterviewDate)),
            progress: issues.code(progress_raw, codes.progress(progress_raw)),
            hired_date: issues.date(row.get(Column::HiredDate)),
            start_work_date: issues.date(row.get(Column::StartWorkDate)),
            work_month: issues.year_month(row.get(Column::WorkMonth)),
            expected_amount: issues.amount(row.get(Column::ExpectedAmount)),
            confirmed_amount: issues.amount(row.get(Column::ConfirmedAmount)),
            paid_amount: issues.amount(row.get(Column::PaidAmount)),
            paid_date: issues.date(row.get(Column::PaidDate)),
            payment_complete: codes.is_payment_complete(row.get(Column::PaymentStatus)),
            notes: text(Column::Notes),
        })
    }
}

pub fn delimiter_for(path: &Path) -> u8 {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("tsv") | Some("tab") => b'\t',
        _ => b',',
    }
}
