//! Identity keys for job seekers and applications, and the interview
//! collision pass.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use rrec_adapters::CodeBook;
use rrec_core::{
    Application, Interview, InterviewResult, JobSeeker, PHONE_MAX_LEN, PLACEHOLDER_PHONE_PREFIX,
};
use serde::Serialize;
use uuid::Uuid;

/// A phone no spreadsheet row can produce: normalized phones never contain
/// the hyphen in [`PLACEHOLDER_PHONE_PREFIX`].
pub fn placeholder_phone() -> String {
    let suffix_len = PHONE_MAX_LEN - PLACEHOLDER_PHONE_PREFIX.len() - 1;
    let random = Uuid::new_v4().simple().to_string();
    format!("{PLACEHOLDER_PHONE_PREFIX}{}", &random[..suffix_len])
}

/// Applications are unique per `(normalized phone, applied date)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ApplicationKey {
    pub phone: String,
    pub applied_at: NaiveDate,
}

/// Phone → job seeker lookup seeded from stored rows.
#[derive(Debug, Default)]
pub struct SeekerIndex {
    by_phone: HashMap<String, Uuid>,
}

impl SeekerIndex {
    pub fn from_seekers(seekers: &[JobSeeker]) -> Self {
        Self {
            by_phone: seekers.iter().map(|s| (s.phone.clone(), s.id)).collect(),
        }
    }

    pub fn get(&self, phone: &str) -> Option<Uuid> {
        self.by_phone.get(phone).copied()
    }

    pub fn insert(&mut self, phone: &str, id: Uuid) {
        self.by_phone.insert(phone.to_string(), id);
    }

    pub fn len(&self) -> usize {
        self.by_phone.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_phone.is_empty()
    }
}

/// Keys of stored applications, recovered through their job seeker's phone.
pub fn application_keys(applications: &[Application], seekers: &[JobSeeker]) -> Vec<ApplicationKey> {
    let phones: HashMap<Uuid, &str> = seekers.iter().map(|s| (s.id, s.phone.as_str())).collect();
    applications
        .iter()
        .filter_map(|app| {
            phones.get(&app.job_seeker_id).map(|phone| ApplicationKey {
                phone: phone.to_string(),
                applied_at: app.applied_at,
            })
        })
        .collect()
}

/// Completed screenings recorded twice for one person and day under
/// different outcome wording. `keep` holds the canonical wording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterviewCollision {
    pub phone: String,
    pub scheduled_on: NaiveDate,
    pub keep: Uuid,
    pub demote: Vec<Uuid>,
}

/// Finds vocabulary collisions among completed interviews.
///
/// Demoted interviews keep their rows (other records may point at them);
/// only their outcome is cleared.
pub fn plan_interview_collisions(
    interviews: &[Interview],
    applications: &[Application],
    seekers: &[JobSeeker],
    codes: &CodeBook,
) -> Vec<InterviewCollision> {
    let seeker_of: HashMap<Uuid, Uuid> = applications
        .iter()
        .map(|a| (a.id, a.job_seeker_id))
        .collect();
    let phone_of: HashMap<Uuid, &JobSeeker> = seekers.iter().map(|s| (s.id, s)).collect();

    let mut groups: BTreeMap<(String, NaiveDate), Vec<&Interview>> = BTreeMap::new();
    for interview in interviews {
        if interview.result != Some(InterviewResult::Completed) || interview.conducted_at.is_none() {
            continue;
        }
        let Some(seeker) = seeker_of
            .get(&interview.application_id)
            .and_then(|id| phone_of.get(id))
        else {
            continue;
        };
        if seeker.has_placeholder_phone() {
            continue;
        }
        groups
            .entry((seeker.phone.clone(), interview.scheduled_at.date_naive()))
            .or_default()
            .push(interview);
    }

    let label = |i: &Interview| i.result_label.as_deref().map(str::trim).unwrap_or_default().to_string();

    let mut out = Vec::new();
    for ((phone, scheduled_on), mut members) in groups {
        members.sort_by_key(|i| (i.created_at, i.id));
        let mut wordings: Vec<String> = members.iter().map(|i| label(i)).collect();
        wordings.sort();
        wordings.dedup();
        if wordings.len() < 2 {
            continue;
        }
        let keep = members
            .iter()
            .find(|i| codes.is_canonical_completed_label(&label(i)))
            .unwrap_or(&members[0]);
        let keep_label = label(keep);
        let demote = members
            .iter()
            .filter(|i| label(i) != keep_label)
            .map(|i| i.id)
            .collect();
        out.push(InterviewCollision {
            phone,
            scheduled_on,
            keep: keep.id,
            demote,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use rrec_core::{ApplicationProgress, Gender, InquiryStatus};

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, day, hour, 0, 0).single().unwrap()
    }

    fn seeker(phone: &str) -> JobSeeker {
        JobSeeker {
            id: Uuid::new_v4(),
            organization_id: Uuid::nil(),
            phone: phone.to_string(),
            name: None,
            gender: Gender::Unknown,
            age: None,
            has_license: false,
            created_at: at(1, 0),
        }
    }

    fn application(seeker: &JobSeeker, day: u32) -> Application {
        Application {
            id: Uuid::new_v4(),
            organization_id: Uuid::nil(),
            job_seeker_id: seeker.id,
            source_id: None,
            coordinator_id: None,
            applied_at: NaiveDate::from_ymd_opt(2025, 1, day).unwrap(),
            status: InquiryStatus::Contacted,
            progress: ApplicationProgress::Screening,
            notes: None,
            created_at: at(day, 0),
        }
    }

    fn completed(app: &Application, day: u32, label: &str, created_hour: u32) -> Interview {
        Interview {
            id: Uuid::new_v4(),
            organization_id: Uuid::nil(),
            application_id: app.id,
            scheduled_at: at(day, 0),
            conducted_at: Some(at(day, 0)),
            result: Some(InterviewResult::Completed),
            result_label: Some(label.to_string()),
            created_at: at(day, created_hour),
        }
    }

    #[test]
    fn placeholder_phones_fit_and_never_look_normalized() {
        let a = placeholder_phone();
        let b = placeholder_phone();
        assert_ne!(a, b);
        assert!(a.starts_with(PLACEHOLDER_PHONE_PREFIX));
        assert!(a.chars().count() <= PHONE_MAX_LEN);
        assert_ne!(rrec_adapters::normalize::normalize_phone(&a), a);
    }

    #[test]
    fn stored_applications_yield_phone_date_keys() {
        let s = seeker("09012345678");
        let app = application(&s, 15);
        let keys = application_keys(&[app], &[s]);
        assert_eq!(
            keys,
            vec![ApplicationKey {
                phone: "09012345678".to_string(),
                applied_at: NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            }]
        );
    }

    #[test]
    fn differently_worded_completions_keep_the_canonical_one() {
        let s = seeker("09012345678");
        let first = application(&s, 10);
        let second = application(&s, 12);
        let legacy = completed(&first, 17, "completed", 1);
        let canonical = completed(&second, 17, "完了", 2);
        let elsewhere = completed(&first, 18, "completed", 3);

        let plan = plan_interview_collisions(
            &[legacy.clone(), canonical.clone(), elsewhere],
            &[first, second],
            &[s],
            &CodeBook::default(),
        );
        assert_eq!(
            plan,
            vec![InterviewCollision {
                phone: "09012345678".to_string(),
                scheduled_on: NaiveDate::from_ymd_opt(2025, 1, 17).unwrap(),
                keep: canonical.id,
                demote: vec![legacy.id],
            }]
        );
    }

    #[test]
    fn identical_wording_is_not_a_collision() {
        let s = seeker("09012345678");
        let a = application(&s, 10);
        let b = application(&s, 11);
        let plan = plan_interview_collisions(
            &[completed(&a, 17, "完了", 1), completed(&b, 17, "完了", 2)],
            &[a, b],
            &[s],
            &CodeBook::default(),
        );
        assert!(plan.is_empty());
    }
}
