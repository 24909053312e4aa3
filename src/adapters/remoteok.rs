use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::{PlatformAdapter, matches_keywords};
use crate::error::{Error, Result};
use crate::models::{RawJob, SearchQuery};

const DEFAULT_API_URL: &str = "https://remoteok.com/api";

/// Remote OK public JSON feed. Every posting on the platform is remote.
pub struct RemoteOkAdapter {
    client: reqwest::Client,
    api_url: String,
}

impl RemoteOkAdapter {
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

impl Default for RemoteOkAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Feed entry. The first element of the feed is a legal notice without an
/// id or position, which `normalize` drops.
#[derive(Debug, Deserialize)]
struct FeedEntry {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    position: String,
    #[serde(default)]
    company: String,
    #[serde(default)]
    location: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    salary_min: Option<i64>,
    #[serde(default)]
    salary_max: Option<i64>,
}

fn normalize(entries: Vec<FeedEntry>, query: &SearchQuery) -> Vec<RawJob> {
    let mut jobs = Vec::new();
    for entry in entries {
        let Some(id) = entry.id.as_ref().map(stringify_id) else {
            continue;
        };
        if id.is_empty() || entry.position.is_empty() {
            continue;
        }
        if !matches_keywords(
            query,
            &[
                &entry.position,
                &entry.description,
                &entry.tags.join(" "),
            ],
        ) {
            continue;
        }
        jobs.push(RawJob {
            external_id: id,
            platform: "remoteok".to_string(),
            title: entry.position,
            company: entry.company,
            location: if entry.location.is_empty() {
                None
            } else {
                Some(entry.location)
            },
            remote: true,
            description: entry.description,
            url: if entry.url.is_empty() {
                None
            } else {
                Some(entry.url)
            },
            pay_min: entry.salary_min.filter(|v| *v > 0),
            pay_max: entry.salary_max.filter(|v| *v > 0),
            tags: entry.tags,
        });
        if let Some(limit) = query.limit {
            if jobs.len() >= limit {
                break;
            }
        }
    }
    jobs
}

fn stringify_id(id: &serde_json::Value) -> String {
    match id {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

#[async_trait]
impl PlatformAdapter for RemoteOkAdapter {
    fn name(&self) -> &str {
        "remoteok"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(15)
    }

    async fn fetch(&self, query: &SearchQuery) -> Result<Vec<RawJob>> {
        let response = self
            .client
            .get(&self.api_url)
            .header("User-Agent", "autohunt/0.1")
            .send()
            .await
            .map_err(|e| Error::external("remoteok", e))?;

        if !response.status().is_success() {
            return Err(Error::external(
                "remoteok",
                format!("feed returned status {}", response.status()),
            ));
        }

        let entries: Vec<FeedEntry> = response
            .json()
            .await
            .map_err(|e| Error::external("remoteok", format!("unreadable feed: {e}")))?;

        Ok(normalize(entries, query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed() -> Vec<FeedEntry> {
        serde_json::from_str(
            r#"[
              {"legal": "API terms: link back to the post"},
              {"id": 1001, "position": "Senior Backend Engineer", "company": "Acme",
               "location": "Worldwide", "description": "Rust and Postgres services",
               "url": "https://remoteok.com/remote-jobs/1001",
               "tags": ["backend", "rust"], "salary_min": 120000, "salary_max": 160000},
              {"id": "1002", "position": "Frontend Developer", "company": "Pixel",
               "location": "", "description": "React dashboards",
               "url": "", "tags": ["frontend"], "salary_min": 0, "salary_max": 0}
            ]"#,
        )
        .unwrap()
    }

    #[test]
    fn test_normalize_drops_legal_notice_and_keeps_postings() {
        let jobs = normalize(feed(), &SearchQuery::default());
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].external_id, "1001");
        assert_eq!(jobs[0].platform, "remoteok");
        assert_eq!(jobs[0].pay_max, Some(160_000));
        assert!(jobs[0].remote);
        // numeric and string ids both normalize
        assert_eq!(jobs[1].external_id, "1002");
        assert_eq!(jobs[1].location, None);
        assert_eq!(jobs[1].url, None);
        assert_eq!(jobs[1].pay_min, None);
    }

    #[test]
    fn test_normalize_filters_by_keywords() {
        let query = SearchQuery {
            keywords: vec!["rust".to_string()],
            ..Default::default()
        };
        let jobs = normalize(feed(), &query);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].title, "Senior Backend Engineer");
    }

    #[test]
    fn test_normalize_honours_limit() {
        let query = SearchQuery {
            limit: Some(1),
            ..Default::default()
        };
        let jobs = normalize(feed(), &query);
        assert_eq!(jobs.len(), 1);
    }
}
