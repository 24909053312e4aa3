use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::env;

use crate::error::{Error, Result};
use crate::models::{CandidateProfile, MatchAnalysis, RawJob};

/// Completion client over an AI provider.
///
/// `complete_text` is the raw capability; structured output goes through
/// [`complete_structured`], which enforces a strict-JSON contract and
/// surfaces non-conforming responses as validation errors.
#[async_trait]
pub trait AiClient: Send + Sync {
    async fn complete_text(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;
    fn model_name(&self) -> &str;
}

/// Request a schema-shaped completion and parse it.
///
/// The provider is instructed to emit a single JSON object; anything that
/// does not parse into `T` is a validation error, not an internal one, so
/// batch callers can degrade per item.
pub async fn complete_structured<T: DeserializeOwned>(
    ai: &dyn AiClient,
    system_prompt: &str,
    user_prompt: &str,
) -> Result<T> {
    let system = format!(
        "{system_prompt}\n\nRespond with a single JSON object and nothing else: \
         no prose, no markdown fences, no trailing commentary."
    );
    let text = ai.complete_text(&system, user_prompt).await?;
    let json = extract_json(&text)
        .ok_or_else(|| Error::validation("AI response contained no JSON object"))?;
    serde_json::from_str(&json)
        .map_err(|e| Error::validation(format!("AI response did not match expected shape: {e}")))
}

/// Pull the JSON object out of a model reply, tolerating code fences and
/// stray text around the braces.
pub fn extract_json(text: &str) -> Option<String> {
    let trimmed = text.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.strip_suffix("```").unwrap_or(rest))
        .unwrap_or(trimmed);
    let start = unfenced.find('{')?;
    let end = unfenced.rfind('}')?;
    if end < start {
        return None;
    }
    Some(unfenced[start..=end].to_string())
}

pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

// --- Prompt contracts ---

/// Scoring verdict returned by the match prompt.
#[derive(Debug, Clone, Deserialize)]
pub struct MatchVerdict {
    pub match_score: f64,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub concerns: Vec<String>,
    #[serde(default)]
    pub missing_skills: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl MatchVerdict {
    pub fn clamped_score(&self) -> u8 {
        self.match_score.clamp(0.0, 100.0).round() as u8
    }

    pub fn into_analysis(self) -> MatchAnalysis {
        MatchAnalysis {
            strengths: self.strengths,
            concerns: self.concerns,
            missing_skills: self.missing_skills,
            recommendations: self.recommendations,
        }
    }
}

pub fn match_prompt(profile: &CandidateProfile, job: &RawJob) -> (String, String) {
    let system = "You are an expert technical recruiter. Compare a candidate against a job \
                  posting and produce a fit assessment as JSON with exactly these keys: \
                  match_score (number 0-100), strengths (string array), concerns (string array), \
                  missing_skills (string array), recommendations (string array)."
        .to_string();
    let user = format!(
        "Candidate:\nName: {}\nHeadline: {}\nSkills: {}\nSummary: {}\n\nResume:\n{}\n\n\
         Job Title: {}\nCompany: {}\nLocation: {}\nRemote: {}\n\nJob Posting:\n{}",
        profile.name,
        profile.headline.as_deref().unwrap_or("-"),
        profile.skills.join(", "),
        truncate_chars(&profile.summary, 1_500),
        truncate_chars(&profile.resume_text, 6_000),
        job.title,
        job.company,
        job.location.as_deref().unwrap_or("-"),
        job.remote,
        truncate_chars(&job.description, 8_000),
    );
    (system, user)
}

/// One form control mapped to a candidate value, with the model's
/// confidence that the value belongs in that control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormField {
    pub selector: String,
    pub label: String,
    pub value: String,
    pub confidence: f64,
}

/// Free-text answer to an open application question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomAnswer {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormMapping {
    #[serde(default)]
    pub fields: Vec<FormField>,
    #[serde(default)]
    pub custom_answers: Vec<CustomAnswer>,
}

pub fn form_mapping_prompt(profile: &CandidateProfile, form_description: &str) -> (String, String) {
    let system = "You map candidate details onto a job application form. Given the form's \
                  controls and the candidate profile, return JSON with exactly these keys: \
                  fields (array of {selector, label, value, confidence}) and custom_answers \
                  (array of {question, answer}). confidence is 0-1: how certain you are that \
                  the value belongs in that control. Use only values present in the profile; \
                  never invent facts. Leave out controls you cannot map."
        .to_string();
    let user = format!(
        "Candidate profile:\nName: {}\nEmail: {}\nPhone: {}\nLocation: {}\nLinkedIn: {}\n\
         Skills: {}\nYears of experience: {}\nSummary: {}\n\nForm controls:\n{}",
        profile.name,
        profile.email,
        profile.phone.as_deref().unwrap_or("-"),
        profile.location.as_deref().unwrap_or("-"),
        profile.linkedin_url.as_deref().unwrap_or("-"),
        profile.skills.join(", "),
        profile
            .years_experience
            .map(|y| y.to_string())
            .unwrap_or_else(|| "-".to_string()),
        truncate_chars(&profile.summary, 1_500),
        truncate_chars(form_description, 8_000),
    );
    (system, user)
}

// --- Provider selection ---

#[derive(Debug, Clone)]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
}

#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub provider: ProviderKind,
    pub model_id: String,
    pub short_name: String,
}

pub fn resolve_model(name: &str) -> Result<ModelSpec> {
    match name {
        // Anthropic API (requires ANTHROPIC_API_KEY)
        "sonnet" | "claude-sonnet" => Ok(ModelSpec {
            provider: ProviderKind::Anthropic,
            model_id: "claude-sonnet-4-5-20250929".to_string(),
            short_name: "claude-sonnet".to_string(),
        }),
        "haiku" | "claude-haiku" => Ok(ModelSpec {
            provider: ProviderKind::Anthropic,
            model_id: "claude-haiku-4-5-20251001".to_string(),
            short_name: "claude-haiku".to_string(),
        }),
        // OpenAI (requires OPENAI_API_KEY)
        "gpt-4o" => Ok(ModelSpec {
            provider: ProviderKind::OpenAi,
            model_id: "gpt-4o".to_string(),
            short_name: "gpt-4o".to_string(),
        }),
        "gpt-4o-mini" => Ok(ModelSpec {
            provider: ProviderKind::OpenAi,
            model_id: "gpt-4o-mini".to_string(),
            short_name: "gpt-4o-mini".to_string(),
        }),
        _ => Err(Error::validation(format!(
            "unknown model '{name}'. Available: sonnet (default), haiku, gpt-4o, gpt-4o-mini"
        ))),
    }
}

pub fn create_client(spec: &ModelSpec) -> Result<Box<dyn AiClient>> {
    match spec.provider {
        ProviderKind::Anthropic => Ok(Box::new(AnthropicClient::new(spec.model_id.clone())?)),
        ProviderKind::OpenAi => Ok(Box::new(OpenAiClient::new(spec.model_id.clone())?)),
    }
}

// --- Anthropic provider ---

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const MAX_TOKENS: u32 = 4096;

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<AnthropicMessage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug)]
pub struct AnthropicClient {
    api_key: String,
    model_id: String,
    client: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(model_id: String) -> Result<Self> {
        let api_key = env::var("ANTHROPIC_API_KEY").map_err(|_| {
            Error::validation(
                "ANTHROPIC_API_KEY environment variable not set. \
                 Set it with: export ANTHROPIC_API_KEY=your-key-here",
            )
        })?;
        Ok(Self {
            api_key,
            model_id,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl AiClient for AnthropicClient {
    async fn complete_text(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let request = AnthropicRequest {
            model: self.model_id.clone(),
            max_tokens: MAX_TOKENS,
            system: system_prompt.to_string(),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: user_prompt.to_string(),
            }],
        };

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::external("anthropic", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(Error::external(
                "anthropic",
                format!("request failed with status {status}: {error_text}"),
            ));
        }

        let api_response: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| Error::external("anthropic", format!("unreadable response: {e}")))?;

        api_response
            .content
            .first()
            .map(|block| block.text.clone())
            .ok_or_else(|| Error::external("anthropic", "no content in response"))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- OpenAI provider ---

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<OpenAiMessage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

pub struct OpenAiClient {
    api_key: String,
    model_id: String,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(model_id: String) -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY").map_err(|_| {
            Error::validation(
                "OPENAI_API_KEY environment variable not set. \
                 Set it with: export OPENAI_API_KEY=your-key-here",
            )
        })?;
        Ok(Self {
            api_key,
            model_id,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl AiClient for OpenAiClient {
    async fn complete_text(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let request = OpenAiRequest {
            model: self.model_id.clone(),
            max_tokens: MAX_TOKENS,
            messages: vec![
                OpenAiMessage {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                OpenAiMessage {
                    role: "user".to_string(),
                    content: user_prompt.to_string(),
                },
            ],
        };

        let response = self
            .client
            .post(OPENAI_API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::external("openai", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(Error::external(
                "openai",
                format!("request failed with status {status}: {error_text}"),
            ));
        }

        let api_response: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| Error::external("openai", format!("unreadable response: {e}")))?;

        api_response
            .choices
            .first()
            .map(|choice| choice.message.content.clone())
            .ok_or_else(|| Error::external("openai", "no choices in response"))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- Test double ---

#[cfg(test)]
pub struct ScriptedAi {
    replies: std::sync::Mutex<std::collections::VecDeque<Result<String>>>,
    fallback: Option<String>,
    pub calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl ScriptedAi {
    /// Returns the same reply for every call.
    pub fn always(reply: &str) -> Self {
        Self {
            replies: std::sync::Mutex::new(std::collections::VecDeque::new()),
            fallback: Some(reply.to_string()),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Pops scripted replies in order, then falls back to an error.
    pub fn queue(replies: Vec<Result<String>>) -> Self {
        Self {
            replies: std::sync::Mutex::new(replies.into()),
            fallback: None,
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self::queue(Vec::new())
    }
}

#[cfg(test)]
#[async_trait]
impl AiClient for ScriptedAi {
    async fn complete_text(&self, _system: &str, _user: &str) -> Result<String> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if let Some(reply) = self.replies.lock().unwrap().pop_front() {
            return reply;
        }
        match &self.fallback {
            Some(reply) => Ok(reply.clone()),
            None => Err(Error::external("scripted-ai", "no reply scripted")),
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_model_known() {
        let spec = resolve_model("sonnet").unwrap();
        assert_eq!(spec.model_id, "claude-sonnet-4-5-20250929");
        assert!(matches!(spec.provider, ProviderKind::Anthropic));

        let spec = resolve_model("gpt-4o").unwrap();
        assert!(matches!(spec.provider, ProviderKind::OpenAi));
    }

    #[test]
    fn test_resolve_model_unknown() {
        assert!(resolve_model("gpt-3").is_err());
    }

    #[test]
    fn test_extract_json_plain_and_fenced() {
        assert_eq!(
            extract_json(r#"{"a": 1}"#).as_deref(),
            Some(r#"{"a": 1}"#)
        );
        assert_eq!(
            extract_json("```json\n{\"a\": 1}\n```").as_deref(),
            Some("{\"a\": 1}")
        );
        assert_eq!(
            extract_json("Sure, here you go: {\"a\": 1} hope that helps").as_deref(),
            Some("{\"a\": 1}")
        );
        assert!(extract_json("no json here").is_none());
    }

    #[test]
    fn test_truncate_chars_is_char_safe() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 100), "short");
    }

    #[test]
    fn test_match_verdict_clamps_score() {
        let v = MatchVerdict {
            match_score: 140.0,
            strengths: vec![],
            concerns: vec![],
            missing_skills: vec![],
            recommendations: vec![],
        };
        assert_eq!(v.clamped_score(), 100);
        let v = MatchVerdict {
            match_score: -3.0,
            ..v
        };
        assert_eq!(v.clamped_score(), 0);
    }

    #[tokio::test]
    async fn test_complete_structured_rejects_malformed() {
        let ai = ScriptedAi::always("this is not json at all");
        let err = complete_structured::<MatchVerdict>(&ai, "sys", "user")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_complete_structured_parses_fenced_reply() {
        let ai = ScriptedAi::always(
            "```json\n{\"match_score\": 82, \"strengths\": [\"rust\"], \"concerns\": [], \
             \"missing_skills\": [], \"recommendations\": []}\n```",
        );
        let verdict: MatchVerdict = complete_structured(&ai, "sys", "user").await.unwrap();
        assert_eq!(verdict.clamped_score(), 82);
        assert_eq!(verdict.strengths, vec!["rust"]);
    }

    #[test]
    fn test_anthropic_client_requires_api_key() {
        let original = env::var("ANTHROPIC_API_KEY").ok();
        unsafe {
            env::remove_var("ANTHROPIC_API_KEY");
        }

        let result = AnthropicClient::new("claude-sonnet-4-5-20250929".to_string());

        if let Some(val) = original {
            unsafe {
                env::set_var("ANTHROPIC_API_KEY", val);
            }
        }

        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("ANTHROPIC_API_KEY")
        );
    }

    #[test]
    fn test_match_prompt_mentions_job_and_candidate() {
        let profile = CandidateProfile {
            name: "Ada".into(),
            skills: vec!["rust".into()],
            ..Default::default()
        };
        let job = RawJob {
            external_id: "1".into(),
            platform: "remoteok".into(),
            title: "Backend Engineer".into(),
            company: "Acme".into(),
            location: None,
            remote: true,
            description: "Build services".into(),
            url: None,
            pay_min: None,
            pay_max: None,
            tags: vec![],
        };
        let (system, user) = match_prompt(&profile, &job);
        assert!(system.contains("match_score"));
        assert!(user.contains("Backend Engineer"));
        assert!(user.contains("Ada"));
    }
}
