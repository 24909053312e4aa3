use async_trait::async_trait;
use std::sync::LazyLock;
use std::time::Duration;

use crate::error::Result;
use crate::models::{RawJob, SearchQuery};

mod email;
mod remoteok;
mod remotive;

pub use email::{EmailAlertsAdapter, EmailConfig};
pub use remoteok::RemoteOkAdapter;
pub use remotive::RemotiveAdapter;

/// One job source. Each adapter normalizes its platform's postings into
/// [`RawJob`] and raises a typed error the engine can attribute to it.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Per-adapter fetch budget; the engine enforces it with a timeout so
    /// one slow source cannot stall the whole search.
    fn timeout(&self) -> Duration {
        Duration::from_secs(20)
    }

    async fn fetch(&self, query: &SearchQuery) -> Result<Vec<RawJob>>;
}

/// True when the posting text matches the query keywords (any keyword, case
/// insensitive). An empty keyword list matches everything.
pub fn matches_keywords(query: &SearchQuery, haystacks: &[&str]) -> bool {
    if query.keywords.is_empty() {
        return true;
    }
    let combined = haystacks.join(" ").to_lowercase();
    query
        .keywords
        .iter()
        .any(|kw| combined.contains(&kw.to_lowercase()))
}

static PAY_RANGE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    // $150,000 - $200,000 / $150k-200k / $150k
    regex::Regex::new(r"\$\s*(\d+(?:,\d{3})*)\s*(k)?").expect("pay regex")
});

/// Pull a salary range out of free text. Bare numbers under 1000 are read
/// as thousands ("$150" in a job posting means $150k).
pub fn extract_pay_range(text: &str) -> (Option<i64>, Option<i64>) {
    let mut amounts = Vec::new();
    for cap in PAY_RANGE_RE.captures_iter(text) {
        let digits: String = cap[1].chars().filter(|c| c.is_ascii_digit()).collect();
        let Ok(num) = digits.parse::<i64>() else {
            continue;
        };
        let value = if cap.get(2).is_some() || num < 1000 {
            num * 1000
        } else {
            num
        };
        amounts.push(value);
        if amounts.len() == 2 {
            break;
        }
    }

    match amounts.as_slice() {
        [] => (None, None),
        [min] => (Some(*min), None),
        [a, b] if a > b => (Some(*b), Some(*a)),
        [a, b] => (Some(*a), Some(*b)),
        _ => unreachable!(),
    }
}
