//! Named columns of the intake spreadsheet.
//!
//! The export addresses columns by position only. [`ColumnLayout`] pairs every
//! position with the header text expected above it, and [`ColumnLayout::validate`]
//! checks the header row once at load so a reordered sheet fails loudly instead
//! of silently shifting data into the wrong fields.

use csv::StringRecord;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    AppliedDate,
    Source,
    Name,
    Phone,
    Gender,
    Age,
    License,
    InquiryStatus,
    Coordinator,
    ScreeningDate,
    ScreeningResult,
    Connection,
    Company,
    JobTitle,
    DispatchInterviewDate,
    Progress,
    HiredDate,
    StartWorkDate,
    WorkMonth,
    ExpectedAmount,
    ConfirmedAmount,
    PaidAmount,
    PaidDate,
    PaymentStatus,
    Notes,
}

impl Column {
    pub const ALL: [Column; 25] = [
        Column::AppliedDate,
        Column::Source,
        Column::Name,
        Column::Phone,
        Column::Gender,
        Column::Age,
        Column::License,
        Column::InquiryStatus,
        Column::Coordinator,
        Column::ScreeningDate,
        Column::ScreeningResult,
        Column::Connection,
        Column::Company,
        Column::JobTitle,
        Column::DispatchInterviewDate,
        Column::Progress,
        Column::HiredDate,
        Column::StartWorkDate,
        Column::WorkMonth,
        Column::ExpectedAmount,
        Column::ConfirmedAmount,
        Column::PaidAmount,
        Column::PaidDate,
        Column::PaymentStatus,
        Column::Notes,
    ];

    /// Label printed in the second header row of the export.
    pub fn header(self) -> &'static str {
        match self {
            Column::AppliedDate => "応募日",
            Column::Source => "媒体",
            Column::Name => "氏名",
            Column::Phone => "電話番号",
            Column::Gender => "性別",
            Column::Age => "年齢",
            Column::License => "免許",
            Column::InquiryStatus => "対応状況",
            Column::Coordinator => "担当",
            Column::ScreeningDate => "面談日",
            Column::ScreeningResult => "面談結果",
            Column::Connection => "紹介",
            Column::Company => "紹介先",
            Column::JobTitle => "案件",
            Column::DispatchInterviewDate => "職場見学日",
            Column::Progress => "進捗",
            Column::HiredDate => "採用日",
            Column::StartWorkDate => "就業開始日",
            Column::WorkMonth => "就業月",
            Column::ExpectedAmount => "見込売上",
            Column::ConfirmedAmount => "確定売上",
            Column::PaidAmount => "入金額",
            Column::PaidDate => "入金日",
            Column::PaymentStatus => "入金状況",
            Column::Notes => "備考",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("export has {found} row(s); expected {expected} header rows before the data")]
    MissingHeaderRows { expected: usize, found: usize },
    #[error("header row has {found} column(s); the layout needs at least {expected}")]
    TooFewColumns { expected: usize, found: usize },
    #[error("column {index} should be `{expected}` but the header reads `{found}`")]
    HeaderMismatch {
        index: usize,
        expected: &'static str,
        found: String,
    },
}

/// Zero-based source position of every [`Column`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnLayout {
    indexes: [usize; Column::ALL.len()],
}

impl ColumnLayout {
    /// Non-data rows at the top of the export.
    pub const HEADER_ROWS: usize = 2;
    /// Which of the header rows carries the column labels.
    pub const LABEL_ROW: usize = 1;

    /// The layout of the agency's current intake sheet.
    pub fn standard() -> Self {
        let mut indexes = [0; Column::ALL.len()];
        for (position, column) in Column::ALL.iter().enumerate() {
            indexes[column.slot()] = position;
        }
        Self { indexes }
    }

    /// Moves a column to another source position.
    pub fn with_index(mut self, column: Column, index: usize) -> Self {
        self.indexes[column.slot()] = index;
        self
    }

    pub fn index(&self, column: Column) -> usize {
        self.indexes[column.slot()]
    }

    pub fn width(&self) -> usize {
        self.indexes.iter().max().map_or(0, |max| max + 1)
    }

    /// Checks the label row against the expected header text. A cell matches
    /// when, ignoring whitespace and case, it contains the expected label, so
    /// annotations such as `電話番号(携帯)` are accepted.
    pub fn validate(&self, labels: &StringRecord) -> Result<(), LayoutError> {
        if labels.len() < self.width() {
            return Err(LayoutError::TooFewColumns {
                expected: self.width(),
                found: labels.len(),
            });
        }
        for column in Column::ALL {
            let index = self.index(column);
            let found = labels.get(index).unwrap_or_default();
            if !squash(found).contains(&squash(column.header())) {
                return Err(LayoutError::HeaderMismatch {
                    index,
                    expected: column.header(),
                    found: found.trim().to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn row<'a>(&'a self, record: &'a StringRecord) -> Row<'a> {
        Row {
            layout: self,
            record,
        }
    }
}

impl Default for ColumnLayout {
    fn default() -> Self {
        Self::standard()
    }
}

fn squash(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// A data record viewed through a [`ColumnLayout`].
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    layout: &'a ColumnLayout,
    record: &'a StringRecord,
}

impl<'a> Row<'a> {
    /// Trimmed cell text; cells past the end of a short record read as empty.
    pub fn get(&self, column: Column) -> &'a str {
        self.record
            .get(self.layout.index(column))
            .map(str::trim)
            .unwrap_or_default()
    }

    pub fn is_blank(&self) -> bool {
        self.record.iter().all(|cell| cell.trim().is_empty())
    }

    /// One-based line in the source file, when the reader tracked it.
    pub fn line(&self) -> Option<u64> {
        self.record.position().map(|p| p.line())
    }
}
