use base64::Engine as _;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ai::{AiClient, FormMapping, complete_structured, form_mapping_prompt};
use crate::browser::{BrowserDriver, BrowserSession};
use crate::error::{Error, Result};
use crate::messaging::MessagingChannel;
use crate::models::{
    Application, ApplicationMetadata, ApplicationMethod, ApplicationStatus, AutoApplyRule,
    CandidateProfile, Job, JobStatus, NotificationKind, NotificationPriority, UserSettings,
};
use crate::notify::{NotificationDraft, NotificationManager};
use crate::store::{self, DocumentStore, keys};

static EMAIL_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email regex")
});

#[derive(Debug, Clone)]
pub struct ApplicantConfig {
    /// Minimum mapping confidence for a field to be filled; anything below
    /// is left blank and flags the application for manual review.
    pub confidence_threshold: f64,
    /// Wall-clock budget for one browser attempt. On expiry the attempt is
    /// recorded as failed with whatever evidence was captured.
    pub apply_timeout: Duration,
}

impl Default for ApplicantConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            apply_timeout: Duration::from_secs(180),
        }
    }
}

/// Summary of one scheduler-driven auto-apply sweep.
#[derive(Debug, Clone, Default)]
pub struct AutoApplySummary {
    pub considered: usize,
    pub attempted: usize,
    pub submitted: usize,
}

/// Drives application attempts.
///
/// An attempt that fails is a normal business outcome: it produces a
/// `failed` or `pending_review` Application record, never an error to the
/// caller. Only a missing job/profile or a broken store surfaces as `Err`.
pub struct AutoApplicant {
    store: Arc<dyn DocumentStore>,
    ai: Arc<dyn AiClient>,
    browser: Arc<dyn BrowserDriver>,
    channels: Vec<Arc<dyn MessagingChannel>>,
    notifier: Arc<NotificationManager>,
    config: ApplicantConfig,
}

impl AutoApplicant {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        ai: Arc<dyn AiClient>,
        browser: Arc<dyn BrowserDriver>,
        channels: Vec<Arc<dyn MessagingChannel>>,
        notifier: Arc<NotificationManager>,
        config: ApplicantConfig,
    ) -> Self {
        Self {
            store,
            ai,
            browser,
            channels,
            notifier,
            config,
        }
    }

    /// One application attempt for a job. Re-invoking while a previous
    /// attempt is still active returns the existing record untouched.
    pub async fn apply_to_job(&self, user_id: &str, job_id: Uuid) -> Result<Application> {
        let job = self.load_job(user_id, job_id).await?;
        let profile: CandidateProfile =
            store::get_doc(self.store.as_ref(), &keys::profile(user_id))
                .await?
                .ok_or_else(|| Error::not_found(format!("candidate profile for {user_id}")))?;

        let applications = self.load_applications(user_id).await?;
        if let Some(active) = applications
            .iter()
            .find(|a| a.job_id == job_id && a.is_active())
        {
            info!(job = %job_id, application = %active.id, "active application exists, short-circuiting");
            return Ok(active.clone());
        }
        let prior_failed = applications
            .iter()
            .find(|a| a.job_id == job_id && a.status == ApplicationStatus::Failed)
            .cloned();

        let method = detect_method(&job);
        let now = Utc::now();
        let (id, attempt_count) = match &prior_failed {
            Some(prior) => (prior.id, prior.metadata.attempt_count + 1),
            None => (Uuid::new_v4(), 1),
        };

        let mut application = Application {
            id,
            job_id,
            user_id: user_id.to_string(),
            status: ApplicationStatus::Failed,
            method,
            applied_at: now,
            cv_document: profile.cv_document.clone(),
            cover_letter_document: profile.cover_letter_document.clone(),
            error: None,
            screenshot_key: None,
            confirmation: None,
            metadata: ApplicationMetadata {
                attempt_count,
                last_attempt_at: Some(now),
                fields_filled: 0,
                fields_total: 0,
                requires_manual_review: false,
            },
        };

        match method {
            ApplicationMethod::ManualRequired => {
                // No automation attempted: hand the job straight to the user.
                application.status = ApplicationStatus::PendingReview;
                application.metadata.requires_manual_review = true;
            }
            ApplicationMethod::Email => {
                self.apply_by_email(&job, &profile, &mut application).await;
            }
            ApplicationMethod::DirectWebsite | ApplicationMethod::LinkedinEasy => {
                self.apply_in_browser(user_id, &job, &profile, &mut application)
                    .await;
            }
        }

        self.persist_application(user_id, &application).await?;
        self.sync_job_after_attempt(user_id, &application).await?;
        self.notify_outcome(user_id, &job, &application).await;

        Ok(application)
    }

    /// Rule-gated sweep over unapplied jobs; this is the only path that
    /// consults the user's AutoApplyRule. Invoked by the scheduler.
    pub async fn auto_apply_candidates(&self, user_id: &str) -> Result<AutoApplySummary> {
        let settings: UserSettings =
            store::get_doc(self.store.as_ref(), &keys::settings(user_id))
                .await?
                .unwrap_or_default();
        let rule = settings.auto_apply;
        let mut summary = AutoApplySummary::default();
        if !rule.enabled {
            return Ok(summary);
        }

        let jobs: Vec<Job> = store::get_doc(self.store.as_ref(), &keys::jobs_index(user_id))
            .await?
            .unwrap_or_default();
        let applications = self.load_applications(user_id).await?;
        let mut applied_today = applications_today(&applications, Utc::now());

        for job in jobs {
            if !matches!(job.status, JobStatus::Discovered | JobStatus::Saved)
                || job.application_id.is_some()
            {
                continue;
            }
            summary.considered += 1;

            if applied_today >= rule.max_applications_per_day {
                info!(user = user_id, cap = rule.max_applications_per_day, "daily cap reached");
                break;
            }
            if let Err(reason) = rule_allows(&rule, &job) {
                info!(job = %job.id, reason = %reason, "rule blocked auto-apply");
                continue;
            }

            summary.attempted += 1;
            match self.apply_to_job(user_id, job.id).await {
                Ok(application) => {
                    applied_today += 1;
                    if application.status == ApplicationStatus::Submitted {
                        summary.submitted += 1;
                    }
                }
                Err(e) => warn!(job = %job.id, error = %e, "auto-apply attempt errored"),
            }
        }

        Ok(summary)
    }

    async fn apply_by_email(
        &self,
        job: &Job,
        profile: &CandidateProfile,
        application: &mut Application,
    ) {
        let Some(to) = job
            .contact_email
            .clone()
            .or_else(|| extract_contact_email(&job.description))
        else {
            application.error = Some("no contact address".to_string());
            return;
        };
        let Some(channel) = self.channels.iter().find(|c| c.name() == "email") else {
            application.error = Some("no email channel configured".to_string());
            return;
        };

        let subject = format!("Application for {} - {}", job.title, profile.name);
        let body = render_application_email(job, profile);
        match channel.send_message(&to, Some(&subject), &body).await {
            Ok(message_id) => {
                application.status = ApplicationStatus::Submitted;
                application.confirmation = Some(format!("email sent ({message_id})"));
            }
            Err(e) => {
                application.error = Some(e.to_string());
            }
        }
    }

    async fn apply_in_browser(
        &self,
        user_id: &str,
        job: &Job,
        profile: &CandidateProfile,
        application: &mut Application,
    ) {
        let Some(url) = job.url.clone() else {
            application.error = Some("job has no url".to_string());
            return;
        };

        // Mark the job in flight before touching the browser so a crash
        // mid-attempt is visible in the pipeline.
        if let Err(e) = self
            .set_job_status(user_id, job.id, JobStatus::Applying)
            .await
        {
            warn!(error = %e, "could not mark job applying");
        }

        let session = match self.browser.open(&url).await {
            Ok(session) => session,
            Err(e) => {
                application.error = Some(e.to_string());
                return;
            }
        };

        let drive = self.drive_form(session.as_ref(), profile, application);
        match tokio::time::timeout(self.config.apply_timeout, drive).await {
            Ok(Ok(outcome)) => {
                if outcome.success {
                    application.status = ApplicationStatus::Submitted;
                    application.confirmation = outcome.message;
                } else {
                    application.error =
                        Some(outcome.message.unwrap_or_else(|| "submission rejected".into()));
                }
            }
            Ok(Err(e)) => {
                application.error = Some(e.to_string());
            }
            Err(_) => {
                application.error = Some(format!(
                    "attempt timed out after {:?}",
                    self.config.apply_timeout
                ));
            }
        }

        // Screenshot is diagnostic evidence, captured win or lose.
        match session.screenshot().await {
            Ok(bytes) => match self.store_screenshot(user_id, application.id, &bytes).await {
                Ok(key) => application.screenshot_key = Some(key),
                Err(e) => warn!(error = %e, "screenshot not stored"),
            },
            Err(e) => warn!(error = %e, "screenshot not captured"),
        }
        if let Err(e) = session.close().await {
            warn!(error = %e, "browser session close failed");
        }
    }

    async fn drive_form(
        &self,
        session: &dyn BrowserSession,
        profile: &CandidateProfile,
        application: &mut Application,
    ) -> Result<crate::browser::SubmitOutcome> {
        let snapshot = session.inspect_form().await?;
        let (system, user) = form_mapping_prompt(profile, &snapshot.describe());
        let mapping: FormMapping =
            complete_structured(self.ai.as_ref(), &system, &user).await?;

        let threshold = self.config.confidence_threshold;
        let (accepted, skipped): (Vec<_>, Vec<_>) = mapping
            .fields
            .into_iter()
            .partition(|field| field.confidence >= threshold);

        application.metadata.fields_total = (accepted.len() + skipped.len()) as u32;
        if !skipped.is_empty() || !mapping.custom_answers.is_empty() {
            // Low-confidence fields stay blank; a human should look at them.
            application.metadata.requires_manual_review = true;
        }

        let filled = session.fill(&accepted).await?;
        application.metadata.fields_filled = filled;

        session.submit().await
    }

    async fn store_screenshot(
        &self,
        user_id: &str,
        application_id: Uuid,
        bytes: &[u8],
    ) -> Result<String> {
        let key = keys::screenshot(user_id, &application_id);
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        self.store
            .put(
                &key,
                serde_json::json!({
                    "content_type": "image/png",
                    "base64": encoded,
                }),
            )
            .await?;
        Ok(key)
    }

    async fn persist_application(&self, user_id: &str, application: &Application) -> Result<()> {
        let record = application.clone();
        store::merge_doc(
            self.store.as_ref(),
            &keys::applications_index(user_id),
            move |mut applications: Vec<Application>| {
                match applications.iter_mut().find(|a| a.id == record.id) {
                    Some(existing) => *existing = record.clone(),
                    None => applications.push(record.clone()),
                }
                applications
            },
        )
        .await
        .map(|_: Vec<Application>| ())
    }

    /// Reflect the attempt on the job record: `applied` only on success,
    /// back to `saved` on failure so the job stays actionable.
    async fn sync_job_after_attempt(&self, user_id: &str, application: &Application) -> Result<()> {
        let application = application.clone();
        let now = Utc::now();
        store::merge_doc(
            self.store.as_ref(),
            &keys::jobs_index(user_id),
            move |mut jobs: Vec<Job>| {
                for job in &mut jobs {
                    if job.id != application.job_id {
                        continue;
                    }
                    job.application_id = Some(application.id);
                    job.updated_at = now;
                    match application.status {
                        ApplicationStatus::Submitted => {
                            job.status = JobStatus::Applied;
                            if job.applied_at.is_none() {
                                job.applied_at = Some(now);
                            }
                        }
                        ApplicationStatus::Failed => {
                            if job.status == JobStatus::Applying {
                                job.status = JobStatus::Saved;
                            }
                        }
                        ApplicationStatus::PendingReview | ApplicationStatus::Withdrawn => {}
                    }
                }
                jobs
            },
        )
        .await
        .map(|_: Vec<Job>| ())
    }

    async fn notify_outcome(&self, user_id: &str, job: &Job, application: &Application) {
        let draft = match application.status {
            ApplicationStatus::Submitted => NotificationDraft::new(
                NotificationKind::ApplicationSubmitted,
                format!("Applied: {}", job.title),
                format!(
                    "Application sent to {} via {}",
                    job.company, application.method
                ),
            ),
            ApplicationStatus::PendingReview => NotificationDraft::new(
                NotificationKind::ManualReview,
                format!("Needs you: {}", job.title),
                format!("{} at {} requires a manual application", job.title, job.company),
            )
            .priority(NotificationPriority::High),
            ApplicationStatus::Failed => NotificationDraft::new(
                NotificationKind::ApplicationFailed,
                format!("Attempt failed: {}", job.title),
                application
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_string()),
            )
            .priority(NotificationPriority::High),
            ApplicationStatus::Withdrawn => return,
        };
        if let Err(e) = self.notifier.send(user_id, draft).await {
            warn!(error = %e, "outcome notification failed");
        }
    }

    async fn load_job(&self, user_id: &str, job_id: Uuid) -> Result<Job> {
        let jobs: Vec<Job> = store::get_doc(self.store.as_ref(), &keys::jobs_index(user_id))
            .await?
            .unwrap_or_default();
        jobs.into_iter()
            .find(|j| j.id == job_id)
            .ok_or_else(|| Error::not_found(format!("job {job_id}")))
    }

    async fn load_applications(&self, user_id: &str) -> Result<Vec<Application>> {
        Ok(
            store::get_doc(self.store.as_ref(), &keys::applications_index(user_id))
                .await?
                .unwrap_or_default(),
        )
    }

    async fn set_job_status(&self, user_id: &str, job_id: Uuid, status: JobStatus) -> Result<()> {
        let now = Utc::now();
        store::merge_doc(
            self.store.as_ref(),
            &keys::jobs_index(user_id),
            move |mut jobs: Vec<Job>| {
                for job in &mut jobs {
                    if job.id == job_id {
                        job.status = status;
                        job.updated_at = now;
                    }
                }
                jobs
            },
        )
        .await
        .map(|_: Vec<Job>| ())
    }
}

/// Pick the application method for a job, in preference order: a direct
/// site form, a contact address for a templated mail, LinkedIn's native
/// flow, and finally the manual bucket.
pub fn detect_method(job: &Job) -> ApplicationMethod {
    if let Some(url) = &job.url {
        if url.contains("linkedin.com") {
            return ApplicationMethod::LinkedinEasy;
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            return ApplicationMethod::DirectWebsite;
        }
    }
    if job.contact_email.is_some() || extract_contact_email(&job.description).is_some() {
        return ApplicationMethod::Email;
    }
    ApplicationMethod::ManualRequired
}

pub fn extract_contact_email(text: &str) -> Option<String> {
    EMAIL_RE.find(text).map(|m| m.as_str().to_string())
}

/// Check a job against the auto-apply policy. Returns the blocking reason
/// so sweeps can log why a job was skipped. The daily cap is enforced by
/// the caller, which owns the counter.
pub fn rule_allows(rule: &AutoApplyRule, job: &Job) -> std::result::Result<(), String> {
    if !rule.enabled {
        return Err("auto-apply disabled".to_string());
    }
    if !rule.platforms.is_empty()
        && !rule
            .platforms
            .iter()
            .any(|p| p.eq_ignore_ascii_case(&job.platform))
    {
        return Err(format!("platform {} not in allow-list", job.platform));
    }
    if rule
        .excluded_companies
        .iter()
        .any(|c| c.eq_ignore_ascii_case(&job.company))
    {
        return Err(format!("company {} excluded", job.company));
    }
    if rule.require_remote && !job.remote {
        return Err("job is not remote".to_string());
    }
    if let Some(min_pay) = rule.min_pay {
        // No published salary counts as below the floor.
        let best = job.pay_max.or(job.pay_min).unwrap_or(0);
        if best < min_pay {
            return Err(format!("pay {best} below floor {min_pay}"));
        }
    }
    if job.match_score < rule.min_match_score {
        return Err(format!(
            "score {} below minimum {}",
            job.match_score, rule.min_match_score
        ));
    }
    Ok(())
}

/// Applications whose `applied_at` falls on the same UTC calendar day as
/// `now`. UTC day boundaries are a documented simplification.
pub fn applications_today(applications: &[Application], now: DateTime<Utc>) -> u32 {
    let today = now.date_naive();
    applications
        .iter()
        .filter(|a| a.applied_at.date_naive() == today)
        .count() as u32
}

fn render_application_email(job: &Job, profile: &CandidateProfile) -> String {
    let mut body = format!(
        "Hello,\n\nI would like to apply for the {} position at {}.\n\n",
        job.title, job.company
    );
    if let Some(headline) = &profile.headline {
        body.push_str(&format!("{headline}\n\n"));
    }
    body.push_str(&profile.summary);
    if !profile.skills.is_empty() {
        body.push_str(&format!("\n\nKey skills: {}", profile.skills.join(", ")));
    }
    body.push_str(&format!(
        "\n\nBest regards,\n{}\n{}",
        profile.name, profile.email
    ));
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::ScriptedAi;
    use crate::browser::testing::MockBrowser;
    use crate::messaging::testing::MockChannel;
    use crate::models::SearchQuery;
    use crate::store::MemoryStore;
    use std::sync::atomic::Ordering;

    const MAPPING: &str = r#"{
        "fields": [
            {"selector": "[name='name']", "label": "Full name", "value": "Ada", "confidence": 0.9},
            {"selector": "[name='email']", "label": "Email", "value": "ada@example.com", "confidence": 0.5},
            {"selector": "[name='salary']", "label": "Desired salary", "value": "?", "confidence": 0.49}
        ],
        "custom_answers": []
    }"#;

    struct Fixture {
        store: Arc<MemoryStore>,
        notifier: Arc<NotificationManager>,
        job_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(NotificationManager::new(store.clone(), vec![]));
        let job_id = seed_job(&store, |_| {}).await;
        seed_profile(&store).await;
        Fixture {
            store,
            notifier,
            job_id,
        }
    }

    async fn seed_profile(store: &MemoryStore) {
        let profile = CandidateProfile {
            name: "Ada".into(),
            email: "ada@example.com".into(),
            summary: "Backend engineer".into(),
            skills: vec!["rust".into()],
            cv_document: Some("docs/cv.pdf".into()),
            ..Default::default()
        };
        store::put_doc(store, &keys::profile("u1"), &profile)
            .await
            .unwrap();
    }

    async fn seed_job(store: &MemoryStore, mutate: impl Fn(&mut Job)) -> Uuid {
        let now = Utc::now();
        let mut job = Job {
            id: Uuid::new_v4(),
            external_id: "1".into(),
            platform: "remoteok".into(),
            title: "Backend Engineer".into(),
            company: "Acme".into(),
            location: Some("Remote".into()),
            remote: true,
            description: "Rust services".into(),
            url: Some("https://jobs.example.com/apply/1".into()),
            contact_email: None,
            pay_min: Some(140_000),
            pay_max: Some(180_000),
            tags: vec![],
            match_score: 82,
            analysis: None,
            status: JobStatus::Saved,
            fetched_at: now,
            saved_at: Some(now),
            updated_at: now,
            applied_at: None,
            response_at: None,
            application_id: None,
        };
        mutate(&mut job);
        let id = job.id;
        store::merge_doc(store, &keys::jobs_index("u1"), move |mut jobs: Vec<Job>| {
            jobs.push(job.clone());
            jobs
        })
        .await
        .unwrap();
        id
    }

    fn applicant_with(
        fixture: &Fixture,
        browser: Arc<MockBrowser>,
        ai: ScriptedAi,
        channels: Vec<Arc<dyn MessagingChannel>>,
    ) -> AutoApplicant {
        AutoApplicant::new(
            fixture.store.clone(),
            Arc::new(ai),
            browser,
            channels,
            fixture.notifier.clone(),
            ApplicantConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_direct_website_success_fills_above_threshold() {
        let fixture = fixture().await;
        let browser = Arc::new(MockBrowser::succeeding(MockBrowser::simple_form()));
        let applicant = applicant_with(&fixture, browser.clone(), ScriptedAi::always(MAPPING), vec![]);

        let application = applicant.apply_to_job("u1", fixture.job_id).await.unwrap();
        assert_eq!(application.status, ApplicationStatus::Submitted);
        assert_eq!(application.method, ApplicationMethod::DirectWebsite);
        assert_eq!(application.metadata.fields_total, 3);
        // 0.49 is rejected at the 0.5 cutoff, 0.5 itself is accepted
        assert_eq!(application.metadata.fields_filled, 2);
        assert!(application.metadata.requires_manual_review);
        assert_eq!(application.confirmation.as_deref(), Some("application submitted"));
        assert!(application.screenshot_key.is_some());

        let filled = browser.state.filled.lock().unwrap();
        assert!(filled.iter().all(|f| f.confidence >= 0.5));
        assert_eq!(filled.len(), 2);
        drop(filled);

        // job moved to applied and linked to the application
        let jobs: Vec<Job> = store::get_doc(fixture.store.as_ref(), &keys::jobs_index("u1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(jobs[0].status, JobStatus::Applied);
        assert_eq!(jobs[0].application_id, Some(application.id));
        assert!(jobs[0].applied_at.is_some());

        // screenshot document really exists
        let shot = fixture
            .store
            .get(application.screenshot_key.as_deref().unwrap())
            .await
            .unwrap();
        assert!(shot.is_some());
    }

    #[tokio::test]
    async fn test_manual_required_never_touches_browser() {
        let fixture = fixture().await;
        let job_id = seed_job(&fixture.store, |job| {
            job.id = Uuid::new_v4();
            job.external_id = "2".into();
            job.url = None;
            job.description = "apply at our office".into();
        })
        .await;
        let browser = Arc::new(MockBrowser::succeeding(MockBrowser::simple_form()));
        let applicant = applicant_with(&fixture, browser.clone(), ScriptedAi::failing(), vec![]);

        let application = applicant.apply_to_job("u1", job_id).await.unwrap();
        assert_eq!(application.status, ApplicationStatus::PendingReview);
        assert_eq!(application.method, ApplicationMethod::ManualRequired);
        assert!(application.metadata.requires_manual_review);
        assert_eq!(browser.state.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_apply_twice_returns_same_application() {
        let fixture = fixture().await;
        let browser = Arc::new(MockBrowser::succeeding(MockBrowser::simple_form()));
        let applicant = applicant_with(&fixture, browser.clone(), ScriptedAi::always(MAPPING), vec![]);

        let first = applicant.apply_to_job("u1", fixture.job_id).await.unwrap();
        let second = applicant.apply_to_job("u1", fixture.job_id).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(browser.state.opens.load(Ordering::SeqCst), 1);

        let applications: Vec<Application> =
            store::get_doc(fixture.store.as_ref(), &keys::applications_index("u1"))
                .await
                .unwrap()
                .unwrap();
        assert_eq!(applications.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_attempt_reverts_job_and_retry_reuses_record() {
        let fixture = fixture().await;
        let failing = Arc::new(MockBrowser::failing_submit(MockBrowser::simple_form()));
        let applicant = applicant_with(&fixture, failing, ScriptedAi::always(MAPPING), vec![]);

        let first = applicant.apply_to_job("u1", fixture.job_id).await.unwrap();
        assert_eq!(first.status, ApplicationStatus::Failed);
        assert_eq!(first.metadata.attempt_count, 1);
        assert!(first.error.is_some());
        // failure still captured evidence
        assert!(first.screenshot_key.is_some());

        let jobs: Vec<Job> = store::get_doc(fixture.store.as_ref(), &keys::jobs_index("u1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(jobs[0].status, JobStatus::Saved);

        // retry succeeds: same record id, attempt count bumped
        let succeeding = Arc::new(MockBrowser::succeeding(MockBrowser::simple_form()));
        let applicant = applicant_with(&fixture, succeeding, ScriptedAi::always(MAPPING), vec![]);
        let second = applicant.apply_to_job("u1", fixture.job_id).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.metadata.attempt_count, 2);
        assert_eq!(second.status, ApplicationStatus::Submitted);

        let applications: Vec<Application> =
            store::get_doc(fixture.store.as_ref(), &keys::applications_index("u1"))
                .await
                .unwrap()
                .unwrap();
        assert_eq!(applications.len(), 1);
    }

    #[tokio::test]
    async fn test_browser_unavailable_records_failure() {
        let fixture = fixture().await;
        let browser = Arc::new(MockBrowser::failing_open());
        let applicant = applicant_with(&fixture, browser, ScriptedAi::always(MAPPING), vec![]);

        let application = applicant.apply_to_job("u1", fixture.job_id).await.unwrap();
        assert_eq!(application.status, ApplicationStatus::Failed);
        assert!(application.error.as_deref().unwrap().contains("webdriver"));
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_a_failed_attempt() {
        let fixture = fixture().await;
        let browser = Arc::new(
            MockBrowser::succeeding(MockBrowser::simple_form())
                .with_submit_delay(Duration::from_secs(30)),
        );
        let applicant = AutoApplicant::new(
            fixture.store.clone(),
            Arc::new(ScriptedAi::always(MAPPING)),
            browser,
            vec![],
            fixture.notifier.clone(),
            ApplicantConfig {
                apply_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        );

        let application = applicant.apply_to_job("u1", fixture.job_id).await.unwrap();
        assert_eq!(application.status, ApplicationStatus::Failed);
        assert!(application.error.as_deref().unwrap().contains("timed out"));
        // evidence still captured after the timeout
        assert!(application.screenshot_key.is_some());
    }

    #[tokio::test]
    async fn test_email_method_sends_through_channel() {
        let fixture = fixture().await;
        let job_id = seed_job(&fixture.store, |job| {
            job.id = Uuid::new_v4();
            job.external_id = "3".into();
            job.url = None;
            job.description = "Send your CV to careers@acme.example".into();
        })
        .await;
        let email = Arc::new(MockChannel::new("email"));
        let browser = Arc::new(MockBrowser::succeeding(MockBrowser::simple_form()));
        let applicant = applicant_with(
            &fixture,
            browser.clone(),
            ScriptedAi::failing(),
            vec![email.clone()],
        );

        let application = applicant.apply_to_job("u1", job_id).await.unwrap();
        assert_eq!(application.method, ApplicationMethod::Email);
        assert_eq!(application.status, ApplicationStatus::Submitted);
        assert_eq!(browser.state.opens.load(Ordering::SeqCst), 0);

        let sent = email.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "careers@acme.example");
        assert!(sent[0].subject.as_deref().unwrap().contains("Backend Engineer"));
    }

    #[tokio::test]
    async fn test_missing_job_is_not_found() {
        let fixture = fixture().await;
        let browser = Arc::new(MockBrowser::succeeding(MockBrowser::simple_form()));
        let applicant = applicant_with(&fixture, browser, ScriptedAi::failing(), vec![]);
        let err = applicant.apply_to_job("u1", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_detect_method_precedence() {
        let fixture_job = |mutate: &dyn Fn(&mut Job)| {
            let now = Utc::now();
            let mut job = Job {
                id: Uuid::new_v4(),
                external_id: "x".into(),
                platform: "remoteok".into(),
                title: "T".into(),
                company: "C".into(),
                location: None,
                remote: false,
                description: String::new(),
                url: None,
                contact_email: None,
                pay_min: None,
                pay_max: None,
                tags: vec![],
                match_score: 0,
                analysis: None,
                status: JobStatus::Discovered,
                fetched_at: now,
                saved_at: None,
                updated_at: now,
                applied_at: None,
                response_at: None,
                application_id: None,
            };
            mutate(&mut job);
            job
        };

        let direct = fixture_job(&|j| j.url = Some("https://acme.example/careers/1".into()));
        assert_eq!(detect_method(&direct), ApplicationMethod::DirectWebsite);

        let linkedin =
            fixture_job(&|j| j.url = Some("https://www.linkedin.com/jobs/view/1".into()));
        assert_eq!(detect_method(&linkedin), ApplicationMethod::LinkedinEasy);

        let email = fixture_job(&|j| j.description = "mail us: hiring@acme.example".into());
        assert_eq!(detect_method(&email), ApplicationMethod::Email);

        let manual = fixture_job(&|_| {});
        assert_eq!(detect_method(&manual), ApplicationMethod::ManualRequired);
    }

    #[test]
    fn test_rule_allows_score_gate() {
        let rule = AutoApplyRule {
            enabled: true,
            min_match_score: 70,
            ..Default::default()
        };
        let now = Utc::now();
        let mut job = Job {
            id: Uuid::new_v4(),
            external_id: "x".into(),
            platform: "remoteok".into(),
            title: "T".into(),
            company: "C".into(),
            location: None,
            remote: true,
            description: String::new(),
            url: None,
            contact_email: None,
            pay_min: None,
            pay_max: Some(150_000),
            tags: vec![],
            match_score: 65,
            analysis: None,
            status: JobStatus::Discovered,
            fetched_at: now,
            saved_at: None,
            updated_at: now,
            applied_at: None,
            response_at: None,
            application_id: None,
        };

        assert!(rule_allows(&rule, &job).unwrap_err().contains("score 65"));
        job.match_score = 70;
        assert!(rule_allows(&rule, &job).is_ok());

        let disabled = AutoApplyRule {
            enabled: false,
            ..rule.clone()
        };
        assert!(rule_allows(&disabled, &job).is_err());

        let platform_limited = AutoApplyRule {
            platforms: vec!["remotive".into()],
            ..rule.clone()
        };
        assert!(
            rule_allows(&platform_limited, &job)
                .unwrap_err()
                .contains("allow-list")
        );

        let excluded = AutoApplyRule {
            excluded_companies: vec!["c".into()],
            ..rule.clone()
        };
        assert!(rule_allows(&excluded, &job).unwrap_err().contains("excluded"));

        let remote_only = AutoApplyRule {
            require_remote: true,
            ..rule.clone()
        };
        job.remote = false;
        assert!(rule_allows(&remote_only, &job).is_err());
        job.remote = true;

        let well_paid = AutoApplyRule {
            min_pay: Some(200_000),
            ..rule.clone()
        };
        assert!(rule_allows(&well_paid, &job).unwrap_err().contains("below floor"));
    }

    #[test]
    fn test_applications_today_counts_utc_day() {
        let now = Utc::now();
        let mk = |applied_at: DateTime<Utc>| Application {
            id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            user_id: "u1".into(),
            status: ApplicationStatus::Submitted,
            method: ApplicationMethod::DirectWebsite,
            applied_at,
            cv_document: None,
            cover_letter_document: None,
            error: None,
            screenshot_key: None,
            confirmation: None,
            metadata: ApplicationMetadata::default(),
        };
        let applications = vec![
            mk(now),
            mk(now - chrono::Duration::hours(1)),
            mk(now - chrono::Duration::days(2)),
        ];
        // the hour-old one may straddle midnight; only assert the stable bounds
        let count = applications_today(&applications, now);
        assert!((1..=2).contains(&count));
        assert_eq!(applications_today(&applications[2..], now), 0);
    }

    #[tokio::test]
    async fn test_auto_apply_respects_rule_but_manual_does_not() {
        let fixture = fixture().await;
        // score 65 with a rule demanding 70
        let job_id = seed_job(&fixture.store, |job| {
            job.id = Uuid::new_v4();
            job.external_id = "low".into();
            job.match_score = 65;
        })
        .await;
        // drop the original fixture job so only the low-score one is eligible
        let only = job_id;
        store::merge_doc(
            fixture.store.as_ref(),
            &keys::jobs_index("u1"),
            move |mut jobs: Vec<Job>| {
                jobs.retain(|j| j.id == only);
                jobs
            },
        )
        .await
        .map(|_: Vec<Job>| ())
        .unwrap();

        let settings = UserSettings {
            auto_apply: AutoApplyRule {
                enabled: true,
                min_match_score: 70,
                ..Default::default()
            },
            search: SearchQuery::default(),
            ..Default::default()
        };
        store::put_doc(fixture.store.as_ref(), &keys::settings("u1"), &settings)
            .await
            .unwrap();

        let browser = Arc::new(MockBrowser::succeeding(MockBrowser::simple_form()));
        let applicant = applicant_with(&fixture, browser.clone(), ScriptedAi::always(MAPPING), vec![]);

        let summary = applicant.auto_apply_candidates("u1").await.unwrap();
        assert_eq!(summary.considered, 1);
        assert_eq!(summary.attempted, 0);
        assert_eq!(browser.state.opens.load(Ordering::SeqCst), 0);

        // the manual path ignores the rule entirely
        let application = applicant.apply_to_job("u1", job_id).await.unwrap();
        assert_eq!(application.status, ApplicationStatus::Submitted);
    }

    #[tokio::test]
    async fn test_auto_apply_stops_at_daily_cap() {
        let fixture = fixture().await;
        for i in 0..3 {
            seed_job(&fixture.store, |job| {
                job.id = Uuid::new_v4();
                job.external_id = format!("cap-{i}");
            })
            .await;
        }

        let settings = UserSettings {
            auto_apply: AutoApplyRule {
                enabled: true,
                min_match_score: 50,
                max_applications_per_day: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        store::put_doc(fixture.store.as_ref(), &keys::settings("u1"), &settings)
            .await
            .unwrap();

        let browser = Arc::new(MockBrowser::succeeding(MockBrowser::simple_form()));
        let applicant = applicant_with(&fixture, browser.clone(), ScriptedAi::always(MAPPING), vec![]);

        let summary = applicant.auto_apply_candidates("u1").await.unwrap();
        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.submitted, 2);
        assert_eq!(browser.state.opens.load(Ordering::SeqCst), 2);
    }
}
