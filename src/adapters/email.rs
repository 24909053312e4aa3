use async_trait::async_trait;
use mailparse::MailHeaderMap;
use scraper::{Html, Selector};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use super::{PlatformAdapter, extract_pay_range, matches_keywords};
use crate::error::{Error, Result};
use crate::models::{RawJob, SearchQuery};

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl EmailConfig {
    pub fn gmail(username: &str, app_password: &str) -> Self {
        Self {
            server: "imap.gmail.com".to_string(),
            port: 993,
            username: username.to_string(),
            password: app_password.trim().to_string(),
        }
    }

    pub fn from_gmail_password_file(username: &str, password_file: &Path) -> Result<Self> {
        let password = std::fs::read_to_string(password_file).map_err(|e| {
            Error::validation(format!(
                "failed to read password file {password_file:?}: {e}"
            ))
        })?;
        Ok(Self::gmail(username, &password))
    }
}

/// Job-alert ingestion over IMAP. LinkedIn and Indeed alert mails carry job
/// cards as HTML links; this adapter extracts them into normal postings so
/// the engine dedups and scores them like any other source.
pub struct EmailAlertsAdapter {
    config: EmailConfig,
    lookback_days: u32,
}

impl EmailAlertsAdapter {
    pub fn new(config: EmailConfig, lookback_days: u32) -> Self {
        Self {
            config,
            lookback_days,
        }
    }
}

#[async_trait]
impl PlatformAdapter for EmailAlertsAdapter {
    fn name(&self) -> &str {
        "email"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn fetch(&self, query: &SearchQuery) -> Result<Vec<RawJob>> {
        let config = self.config.clone();
        let days = self.lookback_days;
        // The imap client is synchronous; keep it off the runtime threads.
        let mut jobs = tokio::task::spawn_blocking(move || fetch_alerts(&config, days))
            .await
            .map_err(|e| Error::internal(format!("email fetch task: {e}")))??;

        jobs.retain(|job| matches_keywords(query, &[&job.title, &job.description]));
        if let Some(limit) = query.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }
}

fn fetch_alerts(config: &EmailConfig, days: u32) -> Result<Vec<RawJob>> {
    let tls = native_tls::TlsConnector::builder()
        .build()
        .map_err(|e| Error::external("email", e))?;

    let addr = (config.server.as_str(), config.port);
    let tcp = std::net::TcpStream::connect(addr)
        .map_err(|e| Error::external("email", format!("connect failed: {e}")))?;
    tcp.set_read_timeout(Some(Duration::from_secs(30)))
        .map_err(Error::internal)?;
    tcp.set_write_timeout(Some(Duration::from_secs(30)))
        .map_err(Error::internal)?;
    let tls_stream = tls
        .connect(&config.server, tcp)
        .map_err(|e| Error::external("email", format!("tls failed: {e}")))?;

    let client = imap::Client::new(tls_stream);
    let mut session = client
        .login(&config.username, &config.password)
        .map_err(|e| Error::external("email", format!("login failed: {}", e.0)))?;

    session
        .select("INBOX")
        .map_err(|e| Error::external("email", e))?;

    let since = chrono::Utc::now() - chrono::Duration::days(days as i64);
    let date_str = since.format("%d-%b-%Y").to_string();

    let searches = [
        format!("FROM \"jobs-noreply@linkedin.com\" SINCE {date_str}"),
        format!("FROM \"linkedin.com\" SUBJECT \"job\" SINCE {date_str}"),
        format!("FROM \"indeed.com\" SINCE {date_str}"),
    ];

    let mut jobs = Vec::new();
    let mut seen_messages: HashSet<String> = HashSet::new();

    for query in &searches {
        let message_ids = match session.search(query) {
            Ok(ids) => ids,
            Err(e) => {
                warn!(query = %query, error = %e, "imap search failed");
                continue;
            }
        };

        for id in message_ids {
            if !seen_messages.insert(id.to_string()) {
                continue;
            }
            let messages = match session.fetch(id.to_string(), "RFC822") {
                Ok(m) => m,
                Err(e) => {
                    warn!(message = %id, error = %e, "imap fetch failed");
                    continue;
                }
            };
            for message in messages.iter() {
                let Some(body) = message.body() else { continue };
                match parse_alert(body) {
                    Ok(parsed) => jobs.extend(parsed),
                    Err(e) => warn!(message = %id, error = %e, "unparseable alert mail"),
                }
            }
        }
    }

    let _ = session.logout();

    // Alert digests repeat postings; collapse within the batch.
    let mut seen_jobs = HashSet::new();
    jobs.retain(|job| seen_jobs.insert(job.external_id.clone()));
    Ok(jobs)
}

/// Parse one raw alert mail into postings.
fn parse_alert(raw: &[u8]) -> Result<Vec<RawJob>> {
    let parsed = mailparse::parse_mail(raw).map_err(|e| Error::external("email", e))?;

    let from = parsed
        .headers
        .get_first_value("From")
        .unwrap_or_default()
        .to_lowercase();
    let body = alert_body(&parsed)?;

    if from.contains("linkedin.com") {
        Ok(parse_card_links(&body, "linkedin", "linkedin.com/comm/jobs"))
    } else if from.contains("indeed.com") {
        Ok(parse_card_links(&body, "indeed", "indeed.com"))
    } else {
        Ok(parse_generic_alert(&body))
    }
}

/// Prefer the HTML part of a multipart mail, then plain text.
fn alert_body(parsed: &mailparse::ParsedMail) -> Result<String> {
    if parsed.subparts.is_empty() {
        return parsed.get_body().map_err(|e| Error::external("email", e));
    }

    for want in ["text/html", "text/plain"] {
        for part in &parsed.subparts {
            let content_type = part
                .headers
                .get_first_value("Content-Type")
                .unwrap_or_default();
            if content_type.contains(want) {
                return part.get_body().map_err(|e| Error::external("email", e));
            }
        }
    }

    if let Some(part) = parsed.subparts.first() {
        return part.get_body().map_err(|e| Error::external("email", e));
    }

    Err(Error::external("email", "no body in alert mail"))
}

/// Extract job cards from anchor tags pointing at the platform's job pages.
fn parse_card_links(body: &str, platform: &str, href_marker: &str) -> Vec<RawJob> {
    let document = Html::parse_document(body);
    let selector = format!("a[href*='{href_marker}']");
    let Ok(selector) = Selector::parse(&selector) else {
        return Vec::new();
    };

    let mut jobs = Vec::new();
    for element in document.select(&selector) {
        let href = element.value().attr("href").unwrap_or("");
        let text = element.text().collect::<Vec<_>>().join(" ");
        let text = text.trim();

        if text.is_empty() || is_navigation_artifact(text) || is_search_link(href) {
            continue;
        }
        // Indeed wraps real postings in /viewjob or click-tracking links;
        // everything else on that domain is chrome.
        if platform == "indeed"
            && !(href.contains("/viewjob") || href.contains("/rc/clk") || href.contains("jk="))
        {
            continue;
        }

        let (title, company, location) = split_title_company_location(text);
        if title.is_empty() {
            continue;
        }

        let url = strip_tracking(href);
        let (pay_min, pay_max) = extract_pay_range(text);
        jobs.push(RawJob {
            external_id: external_id_for(url.as_deref(), &title, company.as_deref()),
            platform: platform.to_string(),
            title,
            company: company.unwrap_or_default(),
            location: location.clone(),
            remote: location
                .as_deref()
                .is_some_and(|l| l.to_lowercase().contains("remote")),
            description: text.to_string(),
            url,
            pay_min,
            pay_max,
            tags: Vec::new(),
        });
    }

    jobs.dedup_by(|a, b| a.title.to_lowercase() == b.title.to_lowercase());
    jobs
}

/// Last-resort extraction for alert mails from unknown senders: scan the
/// visible text for title-shaped phrases.
fn parse_generic_alert(body: &str) -> Vec<RawJob> {
    let document = Html::parse_document(body);
    let text = document.root_element().text().collect::<Vec<_>>().join(" ");

    let Ok(re) = regex::Regex::new(
        r"(?i)(senior|staff|principal|lead|junior|sr\.?|jr\.?)?\s*(software|devops|platform|infrastructure|site reliability|sre|cloud|backend|frontend|full[- ]?stack|data|ml|machine learning)\s*(engineer|developer|architect|manager|lead|specialist)",
    ) else {
        return Vec::new();
    };

    let mut jobs = Vec::new();
    for cap in re.captures_iter(&text) {
        let Some(title) = cap.get(0).map(|m| m.as_str().trim().to_string()) else {
            continue;
        };
        if title.len() <= 5 {
            continue;
        }
        let (pay_min, pay_max) = extract_pay_range(&text);
        jobs.push(RawJob {
            external_id: external_id_for(None, &title, None),
            platform: "email".to_string(),
            title,
            company: String::new(),
            location: None,
            remote: false,
            description: text.chars().take(500).collect(),
            url: None,
            pay_min,
            pay_max,
            tags: Vec::new(),
        });
    }

    jobs.dedup_by(|a, b| a.title.to_lowercase() == b.title.to_lowercase());
    jobs
}

fn is_navigation_artifact(text: &str) -> bool {
    let text_lower = text.to_lowercase();
    let text_trimmed = text.trim();

    if text_trimmed.len() < 10 {
        return true;
    }

    let artifacts = [
        "search for jobs",
        "see all jobs",
        "view all",
        "search other jobs",
        "jobs",
    ];
    if artifacts.iter().any(|a| text_lower == *a) {
        return true;
    }

    if text_lower.starts_with("jobs similar to")
        || text_lower.starts_with("jobs in ")
        || text_lower.starts_with("manage job")
        || text_lower.contains("unsubscribe")
        || text_lower.contains("privacy")
    {
        return true;
    }

    // "Engineering Manager jobs" is a search-results link, not a posting
    if text_trimmed.ends_with(" jobs") || text_trimmed.ends_with(" Jobs") {
        return true;
    }

    false
}

fn is_search_link(url: &str) -> bool {
    url.contains("/jobs/search") || url.contains("/search?") || url.contains("/jobs/alerts")
}

/// Alert links wrap postings in tracking redirects; the query string is all
/// tracking garbage.
fn strip_tracking(url: &str) -> Option<String> {
    if url.is_empty() {
        return None;
    }
    let clean = match url.find('?') {
        Some(idx) => &url[..idx],
        None => url,
    };
    Some(clean.to_string())
}

fn external_id_for(url: Option<&str>, title: &str, company: Option<&str>) -> String {
    if let Some(url) = url {
        return url.trim_end_matches('/').to_lowercase();
    }
    format!(
        "{}|{}",
        title.to_lowercase(),
        company.unwrap_or_default().to_lowercase()
    )
}

/// LinkedIn card text reads "Title             Company · Location": runs of
/// spaces split title from company, the middot splits company from
/// location. Other shapes fall back to "Title at Company" style patterns.
fn split_title_company_location(text: &str) -> (String, Option<String>, Option<String>) {
    let text = text.trim();

    if let Some(middot_idx) = text.find('·') {
        let before = text[..middot_idx].trim();
        let location = text[middot_idx + '·'.len_utf8()..].trim().to_string();

        if let Ok(re) = regex::Regex::new(r"\s{2,}") {
            if let Some(space) = re.find_iter(before).last() {
                let title = before[..space.start()].trim().to_string();
                let company = before[space.end()..].trim().to_string();
                if !title.is_empty() && !company.is_empty() {
                    return (title, Some(company), Some(location));
                }
            }
        }
    }

    let (title, company) = split_title_company(text);
    (title, company, None)
}

fn split_title_company(text: &str) -> (String, Option<String>) {
    let text = text.trim();

    if let Some(idx) = text.to_lowercase().find(" at ") {
        let title = text[..idx].trim().to_string();
        let company = text[idx + 4..].trim().to_string();
        if !company.is_empty() {
            return (title, Some(company));
        }
    }

    if let Some(idx) = text.rfind(" - ") {
        let title = text[..idx].trim().to_string();
        let company = text[idx + 3..].trim().to_string();
        if !company.is_empty()
            && !company.to_lowercase().contains("engineer")
            && !company.to_lowercase().contains("developer")
        {
            return (title, Some(company));
        }
    }

    if let Some(idx) = text.rfind(", ") {
        let candidate = text[idx + 2..].trim();
        if !candidate.is_empty()
            && candidate.len() < 50
            && !candidate.contains("Remote")
            && !candidate.contains("Hybrid")
        {
            return (text[..idx].trim().to_string(), Some(candidate.to_string()));
        }
    }

    (text.to_string(), None)
}
