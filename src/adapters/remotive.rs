use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::{PlatformAdapter, extract_pay_range, matches_keywords};
use crate::error::{Error, Result};
use crate::models::{RawJob, SearchQuery};

const DEFAULT_API_URL: &str = "https://remotive.com/api/remote-jobs";

/// Remotive public API. Salary arrives as free text, so the range is
/// re-extracted from it.
pub struct RemotiveAdapter {
    client: reqwest::Client,
    api_url: String,
}

impl RemotiveAdapter {
    pub fn new() -> Self {
        Self::with_url(DEFAULT_API_URL)
    }

    pub fn with_url(api_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
        }
    }
}

impl Default for RemotiveAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    jobs: Vec<ApiJob>,
}

#[derive(Debug, Deserialize)]
struct ApiJob {
    id: i64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    company_name: String,
    #[serde(default)]
    candidate_required_location: String,
    #[serde(default)]
    salary: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tags: Vec<String>,
}

fn normalize(response: ApiResponse, query: &SearchQuery) -> Vec<RawJob> {
    let mut jobs = Vec::new();
    for job in response.jobs {
        if job.title.is_empty() {
            continue;
        }
        if !matches_keywords(query, &[&job.title, &job.description, &job.tags.join(" ")]) {
            continue;
        }
        let (pay_min, pay_max) = extract_pay_range(&job.salary);
        jobs.push(RawJob {
            external_id: job.id.to_string(),
            platform: "remotive".to_string(),
            title: job.title,
            company: job.company_name,
            location: if job.candidate_required_location.is_empty() {
                None
            } else {
                Some(job.candidate_required_location)
            },
            remote: true,
            description: job.description,
            url: if job.url.is_empty() {
                None
            } else {
                Some(job.url)
            },
            pay_min,
            pay_max,
            tags: job.tags,
        });
        if let Some(limit) = query.limit {
            if jobs.len() >= limit {
                break;
            }
        }
    }
    jobs
}

#[async_trait]
impl PlatformAdapter for RemotiveAdapter {
    fn name(&self) -> &str {
        "remotive"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(15)
    }

    async fn fetch(&self, query: &SearchQuery) -> Result<Vec<RawJob>> {
        let mut request = self.client.get(&self.api_url);
        if let Some(first) = query.keywords.first() {
            request = request.query(&[("search", first.as_str())]);
        }
        if let Some(limit) = query.limit {
            request = request.query(&[("limit", limit.to_string())]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::external("remotive", e))?;

        if !response.status().is_success() {
            return Err(Error::external(
                "remotive",
                format!("api returned status {}", response.status()),
            ));
        }

        let body: ApiResponse = response
            .json()
            .await
            .map_err(|e| Error::external("remotive", format!("unreadable response: {e}")))?;

        Ok(normalize(body, query))
    }
}
