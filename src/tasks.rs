use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::applicant::AutoApplicant;
use crate::engine::DiscoveryEngine;
use crate::error::Result;
use crate::models::{Job, JobStatus, NotificationKind, UserSettings};
use crate::notify::{NotificationDraft, NotificationManager};
use crate::scheduler::{TaskDef, TaskHandler};
use crate::store::{self, DocumentStore, keys};

pub const SEARCH_REFRESH: &str = "search_refresh";
pub const EMAIL_SYNC: &str = "email_sync";
pub const NOTIFICATION_DIGEST: &str = "notification_digest";
pub const FOLLOW_UPS: &str = "follow_ups";

/// Interview follow-up nudge after this many days of silence.
const FOLLOW_UP_AFTER_DAYS: i64 = 3;

/// Periodic discovery sweep: run the user's saved query, then hand the
/// fresh jobs to the rule-gated auto-applicant.
pub struct SearchRefreshTask {
    pub user_id: String,
    pub engine: Arc<DiscoveryEngine>,
    pub applicant: Arc<AutoApplicant>,
    pub store: Arc<dyn DocumentStore>,
}

#[async_trait]
impl TaskHandler for SearchRefreshTask {
    async fn run(&self) -> Result<String> {
        let settings: UserSettings =
            store::get_doc(self.store.as_ref(), &keys::settings(&self.user_id))
                .await?
                .unwrap_or_default();

        let outcome = self.engine.search_jobs(&self.user_id, &settings.search).await?;
        let failed_sources = outcome
            .platform_results
            .iter()
            .filter(|r| r.error.is_some())
            .count();

        let auto = self.applicant.auto_apply_candidates(&self.user_id).await?;

        let mut summary = format!(
            "{} new job(s) from {} source(s)",
            outcome.new_jobs,
            outcome.platform_results.len()
        );
        if failed_sources > 0 {
            summary.push_str(&format!(" ({failed_sources} source(s) failed)"));
        }
        if auto.attempted > 0 {
            summary.push_str(&format!(
                ", auto-applied to {} of {}",
                auto.submitted, auto.attempted
            ));
        }
        Ok(summary)
    }
}

/// Inbox alert ingestion. Runs the same discovery path as a search, but
/// against an engine wired only to the email adapter, so alert postings
/// get the normal dedup and scoring treatment.
pub struct EmailSyncTask {
    pub user_id: String,
    pub engine: Arc<DiscoveryEngine>,
}

#[async_trait]
impl TaskHandler for EmailSyncTask {
    async fn run(&self) -> Result<String> {
        let outcome = self
            .engine
            .search_jobs(&self.user_id, &Default::default())
            .await?;
        Ok(format!("{} job(s) ingested from alerts", outcome.new_jobs))
    }
}

/// Daily unread rollup delivered over the email channel.
pub struct NotificationDigestTask {
    pub user_id: String,
    pub notifier: Arc<NotificationManager>,
}

#[async_trait]
impl TaskHandler for NotificationDigestTask {
    async fn run(&self) -> Result<String> {
        self.notifier.send_digest(&self.user_id).await
    }
}

/// Nudges the user about interviews that have gone quiet.
pub struct FollowUpsTask {
    pub user_id: String,
    pub store: Arc<dyn DocumentStore>,
    pub notifier: Arc<NotificationManager>,
}

#[async_trait]
impl TaskHandler for FollowUpsTask {
    async fn run(&self) -> Result<String> {
        let now = Utc::now();
        let jobs: Vec<Job> =
            store::get_doc(self.store.as_ref(), &keys::jobs_index(&self.user_id))
                .await?
                .unwrap_or_default();

        let stale: Vec<Job> = jobs
            .into_iter()
            .filter(|job| {
                job.status == JobStatus::Interview
                    && now - job.updated_at >= chrono::Duration::days(FOLLOW_UP_AFTER_DAYS)
            })
            .collect();

        for job in &stale {
            let draft = NotificationDraft::new(
                NotificationKind::FollowUp,
                format!("Follow up: {}", job.title),
                format!(
                    "No movement on the {} interview at {} since {} - worth a nudge?",
                    job.title,
                    job.company,
                    job.updated_at.format("%Y-%m-%d")
                ),
            );
            if let Err(e) = self.notifier.send(&self.user_id, draft).await {
                warn!(job = %job.id, error = %e, "follow-up notification failed");
            }
        }

        if !stale.is_empty() {
            // Touch the nagged jobs so the next sweep waits another window
            // instead of repeating itself daily.
            let ids: Vec<uuid::Uuid> = stale.iter().map(|j| j.id).collect();
            store::merge_doc(
                self.store.as_ref(),
                &keys::jobs_index(&self.user_id),
                move |mut jobs: Vec<Job>| {
                    for job in &mut jobs {
                        if ids.contains(&job.id) {
                            job.updated_at = now;
                        }
                    }
                    jobs
                },
            )
            .await
            .map(|_: Vec<Job>| ())?;
        }

        Ok(format!("{} follow-up(s) raised", stale.len()))
    }
}

/// The standard registry created at process start. The email sync task is
/// only registered when an email-wired engine is configured.
pub fn standard_registry(
    user_id: &str,
    engine: Arc<DiscoveryEngine>,
    email_engine: Option<Arc<DiscoveryEngine>>,
    applicant: Arc<AutoApplicant>,
    notifier: Arc<NotificationManager>,
    store: Arc<dyn DocumentStore>,
) -> Vec<TaskDef> {
    let mut defs = vec![
        TaskDef {
            name: SEARCH_REFRESH,
            period: Duration::from_secs(4 * 60 * 60),
            default_enabled: true,
            handler: Arc::new(SearchRefreshTask {
                user_id: user_id.to_string(),
                engine,
                applicant,
                store: store.clone(),
            }),
        },
        TaskDef {
            name: NOTIFICATION_DIGEST,
            period: Duration::from_secs(24 * 60 * 60),
            default_enabled: true,
            handler: Arc::new(NotificationDigestTask {
                user_id: user_id.to_string(),
                notifier: notifier.clone(),
            }),
        },
        TaskDef {
            name: FOLLOW_UPS,
            period: Duration::from_secs(24 * 60 * 60),
            default_enabled: true,
            handler: Arc::new(FollowUpsTask {
                user_id: user_id.to_string(),
                store,
                notifier,
            }),
        },
    ];

    if let Some(email_engine) = email_engine {
        defs.insert(
            1,
            TaskDef {
                name: EMAIL_SYNC,
                period: Duration::from_secs(2 * 60 * 60),
                default_enabled: true,
                handler: Arc::new(EmailSyncTask {
                    user_id: user_id.to_string(),
                    engine: email_engine,
                }),
            },
        );
    }

    defs
}
