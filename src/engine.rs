use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::PlatformAdapter;
use crate::ai::{AiClient, complete_structured, match_prompt, MatchVerdict};
use crate::error::{Error, Result};
use crate::models::{
    CandidateProfile, dedup_key, Job, JobStatus, NotificationKind, NotificationPriority, RawJob,
    SearchQuery,
};
use crate::notify::{NotificationDraft, NotificationManager};
use crate::store::{self, DocumentStore, keys};

/// Same-company titles at or above this similarity are treated as the same
/// posting published twice.
const NEAR_DUP_THRESHOLD: f64 = 0.93;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformResult {
    pub platform: String,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub query: SearchQuery,
    pub total_results: usize,
    pub new_jobs: usize,
    pub platform_results: Vec<PlatformResult>,
    /// The newly persisted jobs, scored.
    pub jobs: Vec<Job>,
    pub searched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilters {
    pub status: Option<JobStatus>,
    pub min_score: Option<u8>,
    pub platform: Option<String>,
}

/// Job discovery and pipeline tracking.
///
/// Fans a query out to every adapter, captures per-platform failures
/// without failing the search, dedups against the stored index, scores
/// what is genuinely new, and persists the result.
pub struct DiscoveryEngine {
    store: Arc<dyn DocumentStore>,
    ai: Arc<dyn AiClient>,
    adapters: Vec<Arc<dyn PlatformAdapter>>,
    notifier: Arc<NotificationManager>,
}

impl DiscoveryEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        ai: Arc<dyn AiClient>,
        adapters: Vec<Arc<dyn PlatformAdapter>>,
        notifier: Arc<NotificationManager>,
    ) -> Self {
        Self {
            store,
            ai,
            adapters,
            notifier,
        }
    }

    pub async fn search_jobs(&self, user_id: &str, query: &SearchQuery) -> Result<SearchOutcome> {
        let fetches = self.adapters.iter().map(|adapter| {
            let adapter = adapter.clone();
            let query = query.clone();
            async move {
                let name = adapter.name().to_string();
                let outcome = match tokio::time::timeout(adapter.timeout(), adapter.fetch(&query))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::external(
                        name.clone(),
                        format!("timed out after {:?}", adapter.timeout()),
                    )),
                };
                (name, outcome)
            }
        });

        let mut platform_results = Vec::new();
        let mut raw_jobs: Vec<RawJob> = Vec::new();
        for (platform, outcome) in futures::future::join_all(fetches).await {
            match outcome {
                Ok(jobs) => {
                    platform_results.push(PlatformResult {
                        platform,
                        count: jobs.len(),
                        error: None,
                    });
                    raw_jobs.extend(jobs);
                }
                Err(e) => {
                    warn!(platform = %platform, error = %e, "adapter failed, continuing");
                    platform_results.push(PlatformResult {
                        platform,
                        count: 0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        let total_results = raw_jobs.len();

        let existing = self.load_index(user_id).await?;
        let mut seen: HashSet<(String, String)> =
            existing.iter().map(|job| job.dedup_key()).collect();

        let mut fresh: Vec<RawJob> = Vec::new();
        for raw in raw_jobs {
            let key = dedup_key(&raw.external_id, &raw.platform);
            if !seen.insert(key) {
                continue;
            }
            if is_near_duplicate(&raw, existing.iter()) {
                continue;
            }
            fresh.push(raw);
        }

        let profile: Option<CandidateProfile> =
            store::get_doc(self.store.as_ref(), &keys::profile(user_id)).await?;
        if profile.is_none() && !fresh.is_empty() {
            warn!(user = user_id, "no candidate profile stored, skipping scoring");
        }

        let now = Utc::now();
        let mut new_jobs = Vec::with_capacity(fresh.len());
        for raw in fresh {
            let (score, analysis) = match &profile {
                Some(profile) => {
                    let (system, user) = match_prompt(profile, &raw);
                    match complete_structured::<MatchVerdict>(self.ai.as_ref(), &system, &user)
                        .await
                    {
                        Ok(verdict) => (verdict.clamped_score(), Some(verdict.into_analysis())),
                        Err(e) => {
                            // Zero-confidence default: one bad scoring call
                            // must not sink the batch.
                            warn!(title = %raw.title, error = %e, "scoring failed, defaulting to 0");
                            (0, None)
                        }
                    }
                }
                None => (0, None),
            };

            new_jobs.push(Job {
                id: Uuid::new_v4(),
                external_id: raw.external_id,
                platform: raw.platform,
                title: raw.title,
                company: raw.company,
                location: raw.location,
                remote: raw.remote,
                description: raw.description,
                url: raw.url,
                contact_email: None,
                pay_min: raw.pay_min,
                pay_max: raw.pay_max,
                tags: raw.tags,
                match_score: score,
                analysis,
                status: JobStatus::Discovered,
                fetched_at: now,
                saved_at: None,
                updated_at: now,
                applied_at: None,
                response_at: None,
                application_id: None,
            });
        }

        if !new_jobs.is_empty() {
            let additions = new_jobs.clone();
            store::merge_doc(
                self.store.as_ref(),
                &keys::jobs_index(user_id),
                move |mut jobs: Vec<Job>| {
                    let present: HashSet<(String, String)> =
                        jobs.iter().map(|j| j.dedup_key()).collect();
                    for job in &additions {
                        if !present.contains(&job.dedup_key()) {
                            jobs.push(job.clone());
                        }
                    }
                    jobs
                },
            )
            .await?;

            if let Some(top) = new_jobs.iter().max_by_key(|j| j.match_score) {
                let draft = NotificationDraft::new(
                    NotificationKind::NewJobs,
                    format!("{} new job(s) found", new_jobs.len()),
                    format!(
                        "Best match: {} at {} ({}%)",
                        top.title, top.company, top.match_score
                    ),
                )
                .data(serde_json::json!({ "count": new_jobs.len() }));
                if let Err(e) = self.notifier.send(user_id, draft).await {
                    warn!(error = %e, "new-jobs notification failed");
                }
            }
        }

        info!(
            user = user_id,
            total = total_results,
            new = new_jobs.len(),
            platforms = platform_results.len(),
            "search finished"
        );

        Ok(SearchOutcome {
            query: query.clone(),
            total_results,
            new_jobs: new_jobs.len(),
            platform_results,
            jobs: new_jobs,
            searched_at: now,
        })
    }

    /// Read the job index with optional filters. No ranking: ordering is
    /// the caller's concern. An absent index is an empty list.
    pub async fn list_jobs(&self, user_id: &str, filters: &JobFilters) -> Result<Vec<Job>> {
        let mut jobs = self.load_index(user_id).await?;
        if let Some(status) = filters.status {
            jobs.retain(|j| j.status == status);
        }
        if let Some(min_score) = filters.min_score {
            jobs.retain(|j| j.match_score >= min_score);
        }
        if let Some(platform) = &filters.platform {
            let platform = platform.to_lowercase();
            jobs.retain(|j| j.platform.to_lowercase() == platform);
        }
        Ok(jobs)
    }

    pub async fn get_job(&self, user_id: &str, job_id: Uuid) -> Result<Job> {
        self.load_index(user_id)
            .await?
            .into_iter()
            .find(|j| j.id == job_id)
            .ok_or_else(|| Error::not_found(format!("job {job_id}")))
    }

    /// Move a job through the pipeline. Any known label may follow any
    /// other; a same-status call is a silent no-op.
    pub async fn update_job_status(
        &self,
        user_id: &str,
        job_id: Uuid,
        new_status: JobStatus,
    ) -> Result<Job> {
        let current = self.get_job(user_id, job_id).await?;
        if current.status == new_status {
            return Ok(current);
        }

        let now = Utc::now();
        let updated: Vec<Job> = store::merge_doc(
            self.store.as_ref(),
            &keys::jobs_index(user_id),
            move |mut jobs: Vec<Job>| {
                for job in &mut jobs {
                    if job.id != job_id {
                        continue;
                    }
                    job.status = new_status;
                    job.updated_at = now;
                    if new_status == JobStatus::Saved && job.saved_at.is_none() {
                        job.saved_at = Some(now);
                    }
                    if new_status == JobStatus::Applied && job.applied_at.is_none() {
                        job.applied_at = Some(now);
                    }
                    if new_status.is_response() && job.response_at.is_none() {
                        job.response_at = Some(now);
                    }
                }
                jobs
            },
        )
        .await?;

        let job = updated
            .into_iter()
            .find(|j| j.id == job_id)
            .ok_or_else(|| Error::not_found(format!("job {job_id}")))?;

        if matches!(new_status, JobStatus::Interview | JobStatus::Offer) {
            let draft = NotificationDraft::new(
                NotificationKind::StatusChange,
                format!("{}: {}", job.title, new_status),
                format!("{} at {} moved to {}", job.title, job.company, new_status),
            )
            .priority(NotificationPriority::High);
            if let Err(e) = self.notifier.send(user_id, draft).await {
                warn!(error = %e, "status notification failed");
            }
        }

        Ok(job)
    }

    pub(crate) async fn load_index(&self, user_id: &str) -> Result<Vec<Job>> {
        Ok(
            store::get_doc(self.store.as_ref(), &keys::jobs_index(user_id))
                .await?
                .unwrap_or_default(),
        )
    }
}

/// Secondary duplicate guard for postings that change ids across fetches:
/// same company and a near-identical title.
fn is_near_duplicate<'a>(raw: &RawJob, existing: impl Iterator<Item = &'a Job>) -> bool {
    let company = raw.company.to_lowercase();
    let title = raw.title.to_lowercase();
    if company.is_empty() {
        return false;
    }
    for job in existing {
        if job.company.to_lowercase() != company {
            continue;
        }
        if strsim::jaro_winkler(&job.title.to_lowercase(), &title) >= NEAR_DUP_THRESHOLD {
            return true;
        }
    }
    false
}
