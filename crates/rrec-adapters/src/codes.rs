//! Free-text status vocabularies used by the spreadsheet.
//!
//! Each vocabulary is an ordered rule list; the first rule with a matching
//! needle wins, so narrower or negating phrases ("不採用", "未紹介") must be
//! listed before the broader words they contain ("採用", "紹介").

use std::path::Path;

use anyhow::{Context, Result};
use rrec_core::{InquiryStatus, InterviewResult, ReferralStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeRule<T> {
    pub value: T,
    pub contains_any: Vec<String>,
}

impl<T> CodeRule<T> {
    fn new(value: T, needles: &[&str]) -> Self {
        Self {
            value,
            contains_any: needles.iter().map(|n| n.to_string()).collect(),
        }
    }
}

/// First rule whose needle occurs in `raw`, compared case-insensitively.
pub fn lookup<T: Copy>(rules: &[CodeRule<T>], raw: &str) -> Option<T> {
    let text = raw.trim().to_lowercase();
    if text.is_empty() {
        return None;
    }
    rules
        .iter()
        .find(|rule| {
            rule.contains_any
                .iter()
                .any(|needle| text.contains(&needle.to_lowercase()))
        })
        .map(|rule| rule.value)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBook {
    pub inquiry_status: Vec<CodeRule<InquiryStatus>>,
    pub screening_result: Vec<CodeRule<InterviewResult>>,
    pub progress: Vec<CodeRule<ReferralStatus>>,
    pub connection: Vec<CodeRule<bool>>,
    pub payment: Vec<CodeRule<bool>>,
    /// Wording of a completed screening in the current vocabulary. Older
    /// records used other words for the same outcome.
    pub canonical_completed_label: String,
}

impl CodeBook {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing code book")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn inquiry_status(&self, raw: &str) -> Option<InquiryStatus> {
        lookup(&self.inquiry_status, raw)
    }

    pub fn screening_result(&self, raw: &str) -> Option<InterviewResult> {
        lookup(&self.screening_result, raw)
    }

    pub fn progress(&self, raw: &str) -> Option<ReferralStatus> {
        lookup(&self.progress, raw)
    }

    pub fn is_connected(&self, raw: &str) -> bool {
        lookup(&self.connection, raw).unwrap_or(false)
    }

    pub fn is_payment_complete(&self, raw: &str) -> bool {
        lookup(&self.payment, raw).unwrap_or(false)
    }

    pub fn is_canonical_completed_label(&self, label: &str) -> bool {
        label.trim() == self.canonical_completed_label
    }
}

impl Default for CodeBook {
    fn default() -> Self {
        use InquiryStatus as Q;
        use InterviewResult as I;
        use ReferralStatus as R;

        Self {
            inquiry_status: vec![
                CodeRule::new(Q::Invalid, &["いたずら", "無効", "重複", "invalid"]),
                CodeRule::new(Q::NotInterested, &["辞退", "不要", "興味なし", "not interested"]),
                CodeRule::new(Q::Unreachable, &["不通", "つながらない", "unreachable", "no answer"]),
                CodeRule::new(Q::Contacted, &["通電", "連絡済", "対応済", "面談", "contacted"]),
                CodeRule::new(Q::Pending, &["未対応", "保留", "pending"]),
            ],
            screening_result: vec![
                CodeRule::new(I::Declined, &["辞退", "declined"]),
                CodeRule::new(I::Cancelled, &["キャンセル", "cancel"]),
                CodeRule::new(I::Completed, &["完了", "面談済", "completed", "done"]),
            ],
            progress: vec![
                CodeRule::new(R::Cancelled, &["キャンセル", "cancel"]),
                CodeRule::new(R::Declined, &["辞退", "不採用", "見送", "declined", "rejected"]),
                CodeRule::new(R::FullPaid, &["全額入金", "full_paid", "full paid"]),
                CodeRule::new(R::Working, &["就業中", "稼働中", "working"]),
                CodeRule::new(R::Assigned, &["配属済", "assigned"]),
                CodeRule::new(R::PreAssignment, &["配属前", "就業前", "pre_assignment", "pre-assignment"]),
                CodeRule::new(R::Hired, &["採用", "内定", "hired"]),
                CodeRule::new(R::InterviewDone, &["面接済", "見学済", "interview_done", "interview done"]),
                CodeRule::new(
                    R::InterviewScheduled,
                    &["面接予定", "見学予定", "面接調整", "interview_scheduled", "interview scheduled"],
                ),
                CodeRule::new(R::Referred, &["紹介済", "referred"]),
            ],
            connection: vec![
                CodeRule::new(false, &["未紹介", "紹介なし", "not referred", "not_referred"]),
                CodeRule::new(true, &["紹介", "referred", "connected", "○", "〇"]),
            ],
            payment: vec![
                CodeRule::new(false, &["未入金", "一部", "partial", "unpaid"]),
                CodeRule::new(true, &["入金済", "完済", "全額", "paid"]),
            ],
            canonical_completed_label: "完了".to_string(),
        }
    }
}
