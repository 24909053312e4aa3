use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// Pipeline status of a job as it moves from discovery to outcome.
///
/// This is a validated label set, not an enforced transition graph: users
/// correct mis-tracked jobs by hand, so any status may follow any other.
/// Unknown labels are rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Discovered,
    Saved,
    Applying,
    Applied,
    Screening,
    Interview,
    Offer,
    Rejected,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Discovered => "discovered",
            JobStatus::Saved => "saved",
            JobStatus::Applying => "applying",
            JobStatus::Applied => "applied",
            JobStatus::Screening => "screening",
            JobStatus::Interview => "interview",
            JobStatus::Offer => "offer",
            JobStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Offer | JobStatus::Rejected)
    }

    /// True once the employer has responded in some form.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            JobStatus::Screening | JobStatus::Interview | JobStatus::Offer | JobStatus::Rejected
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "discovered" => Ok(JobStatus::Discovered),
            "saved" => Ok(JobStatus::Saved),
            "applying" => Ok(JobStatus::Applying),
            "applied" => Ok(JobStatus::Applied),
            "screening" => Ok(JobStatus::Screening),
            "interview" => Ok(JobStatus::Interview),
            "offer" => Ok(JobStatus::Offer),
            "rejected" => Ok(JobStatus::Rejected),
            other => Err(Error::validation(format!(
                "unknown job status '{other}' (expected one of: discovered, saved, applying, \
                 applied, screening, interview, offer, rejected)"
            ))),
        }
    }
}

/// AI-derived assessment of candidate/job fit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchAnalysis {
    pub strengths: Vec<String>,
    pub concerns: Vec<String>,
    pub missing_skills: Vec<String>,
    pub recommendations: Vec<String>,
}

/// A discovered job posting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub external_id: String,
    pub platform: String,
    pub title: String,
    pub company: String,
    pub location: Option<String>,
    pub remote: bool,
    pub description: String,
    pub url: Option<String>,
    pub contact_email: Option<String>,
    pub pay_min: Option<i64>,
    pub pay_max: Option<i64>,
    pub tags: Vec<String>,
    pub match_score: u8,
    pub analysis: Option<MatchAnalysis>,
    pub status: JobStatus,
    pub fetched_at: DateTime<Utc>,
    pub saved_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
    pub response_at: Option<DateTime<Utc>>,
    pub application_id: Option<Uuid>,
}

impl Job {
    /// Natural key used for deduplication across searches.
    pub fn dedup_key(&self) -> (String, String) {
        dedup_key(&self.external_id, &self.platform)
    }
}

pub fn dedup_key(external_id: &str, platform: &str) -> (String, String) {
    (external_id.to_lowercase(), platform.to_lowercase())
}

/// A posting as returned by a platform adapter, before scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawJob {
    pub external_id: String,
    pub platform: String,
    pub title: String,
    pub company: String,
    pub location: Option<String>,
    pub remote: bool,
    pub description: String,
    pub url: Option<String>,
    pub pay_min: Option<i64>,
    pub pay_max: Option<i64>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Submitted,
    Failed,
    PendingReview,
    Withdrawn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationMethod {
    DirectWebsite,
    Email,
    LinkedinEasy,
    ManualRequired,
}

impl fmt::Display for ApplicationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApplicationMethod::DirectWebsite => "direct_website",
            ApplicationMethod::Email => "email",
            ApplicationMethod::LinkedinEasy => "linkedin_easy",
            ApplicationMethod::ManualRequired => "manual_required",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplicationMetadata {
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub fields_filled: u32,
    pub fields_total: u32,
    pub requires_manual_review: bool,
}

/// One application attempt record per job. Retries reuse the record and
/// bump `metadata.attempt_count` instead of creating duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: Uuid,
    pub job_id: Uuid,
    pub user_id: String,
    pub status: ApplicationStatus,
    pub method: ApplicationMethod,
    pub applied_at: DateTime<Utc>,
    pub cv_document: Option<String>,
    pub cover_letter_document: Option<String>,
    pub error: Option<String>,
    pub screenshot_key: Option<String>,
    pub confirmation: Option<String>,
    pub metadata: ApplicationMetadata,
}

impl Application {
    /// An active application blocks further attempts for the same job.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            ApplicationStatus::Submitted | ApplicationStatus::PendingReview
        )
    }
}

/// Per-user policy gating the automatic (rule-driven) application path.
/// Manual applications bypass it entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoApplyRule {
    pub enabled: bool,
    pub min_match_score: u8,
    /// Allowed platforms; empty means all platforms.
    pub platforms: Vec<String>,
    pub excluded_companies: Vec<String>,
    pub require_remote: bool,
    pub min_pay: Option<i64>,
    pub max_applications_per_day: u32,
}

impl Default for AutoApplyRule {
    fn default() -> Self {
        Self {
            enabled: false,
            min_match_score: 70,
            platforms: Vec::new(),
            excluded_companies: Vec::new(),
            require_remote: false,
            min_pay: None,
            max_applications_per_day: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NewJobs,
    ApplicationSubmitted,
    ApplicationFailed,
    ManualReview,
    StatusChange,
    TaskCompleted,
    Digest,
    FollowUp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub priority: NotificationPriority,
    pub read: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Stored notification inbox. The unread counter is maintained on every
/// send/mark-read so the unread count never needs a scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inbox {
    pub notifications: Vec<Notification>,
    pub unread: u32,
}

/// External-channel delivery preferences. In-app recording is unconditional;
/// these only control what is additionally pushed out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationPrefs {
    pub sms: bool,
    pub whatsapp: bool,
    pub email_digest: bool,
    pub phone_number: Option<String>,
    pub email: Option<String>,
    /// Quiet hours in the user's local clock, hours 0-23. A window may wrap
    /// midnight (e.g. 22 -> 7).
    pub quiet_hours_start: Option<u32>,
    pub quiet_hours_end: Option<u32>,
    /// Offset from UTC, minutes. Stands in for a named timezone.
    pub utc_offset_minutes: i32,
}

/// Search query fanned out to the platform adapters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    pub keywords: Vec<String>,
    pub location: Option<String>,
    pub remote: Option<bool>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserSettings {
    pub auto_apply: AutoApplyRule,
    pub notifications: NotificationPrefs,
    /// Default query used by the scheduled search refresh.
    pub search: SearchQuery,
}

/// Candidate profile consumed by scoring and form filling. Profile CRUD
/// lives outside the core; this is the read-side shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandidateProfile {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub headline: Option<String>,
    pub summary: String,
    pub skills: Vec<String>,
    pub years_experience: Option<u32>,
    pub resume_text: String,
    pub cv_document: Option<String>,
    pub cover_letter_document: Option<String>,
    pub location: Option<String>,
    pub linkedin_url: Option<String>,
}
