use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Outbound message channel (SMS, WhatsApp, email digest).
///
/// Delivery is best-effort from the domain's point of view: callers log
/// and swallow errors, so implementations should fail fast rather than
/// retry internally.
#[async_trait]
pub trait MessagingChannel: Send + Sync {
    fn name(&self) -> &str;
    async fn send_message(
        &self,
        to: &str,
        subject: Option<&str>,
        body: &str,
    ) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwilioKind {
    Sms,
    WhatsApp,
}

/// Twilio Messages API channel. The same client serves SMS and WhatsApp;
/// WhatsApp recipients get the `whatsapp:` address prefix.
pub struct TwilioChannel {
    account_sid: String,
    auth_token: String,
    from: String,
    kind: TwilioKind,
    client: reqwest::Client,
}

impl TwilioChannel {
    pub fn new(
        account_sid: impl Into<String>,
        auth_token: impl Into<String>,
        from: impl Into<String>,
        kind: TwilioKind,
    ) -> Self {
        Self {
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
            from: from.into(),
            kind,
            client: reqwest::Client::new(),
        }
    }

    /// Build from TWILIO_ACCOUNT_SID / TWILIO_AUTH_TOKEN / TWILIO_FROM.
    pub fn from_env(kind: TwilioKind) -> Result<Self> {
        let account_sid = std::env::var("TWILIO_ACCOUNT_SID")
            .map_err(|_| Error::validation("TWILIO_ACCOUNT_SID environment variable not set"))?;
        let auth_token = std::env::var("TWILIO_AUTH_TOKEN")
            .map_err(|_| Error::validation("TWILIO_AUTH_TOKEN environment variable not set"))?;
        let from = std::env::var("TWILIO_FROM")
            .map_err(|_| Error::validation("TWILIO_FROM environment variable not set"))?;
        Ok(Self::new(account_sid, auth_token, from, kind))
    }

    fn address(&self, number: &str) -> String {
        match self.kind {
            TwilioKind::Sms => number.to_string(),
            TwilioKind::WhatsApp => format!("whatsapp:{number}"),
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct TwilioResponse {
    sid: String,
}

#[async_trait]
impl MessagingChannel for TwilioChannel {
    fn name(&self) -> &str {
        match self.kind {
            TwilioKind::Sms => "sms",
            TwilioKind::WhatsApp => "whatsapp",
        }
    }

    async fn send_message(
        &self,
        to: &str,
        subject: Option<&str>,
        body: &str,
    ) -> Result<String> {
        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
            self.account_sid
        );

        let text = match subject {
            Some(subject) => format!("{subject}\n{body}"),
            None => body.to_string(),
        };

        let mut form: HashMap<&str, String> = HashMap::new();
        form.insert("To", self.address(to));
        form.insert("From", self.address(&self.from));
        form.insert("Body", text);

        let response = self
            .client
            .post(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::external("twilio", e))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(Error::external(
                "twilio",
                format!("returned {status}: {error_body}"),
            ));
        }

        let parsed: TwilioResponse = response
            .json()
            .await
            .map_err(|e| Error::external("twilio", format!("unreadable response: {e}")))?;
        Ok(parsed.sid)
    }
}

/// SendGrid mail channel, used for the notification digest.
pub struct SendGridChannel {
    api_key: String,
    from: String,
    client: reqwest::Client,
}

impl SendGridChannel {
    pub fn new(api_key: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            from: from.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("SENDGRID_API_KEY")
            .map_err(|_| Error::validation("SENDGRID_API_KEY environment variable not set"))?;
        let from = std::env::var("SENDGRID_FROM")
            .map_err(|_| Error::validation("SENDGRID_FROM environment variable not set"))?;
        Ok(Self::new(api_key, from))
    }
}

#[async_trait]
impl MessagingChannel for SendGridChannel {
    fn name(&self) -> &str {
        "email"
    }

    async fn send_message(
        &self,
        to: &str,
        subject: Option<&str>,
        body: &str,
    ) -> Result<String> {
        let payload = serde_json::json!({
            "personalizations": [{"to": [{"email": to}]}],
            "from": {"email": self.from},
            "subject": subject.unwrap_or("Job search update"),
            "content": [{"type": "text/plain", "value": body}],
        });

        let response = self
            .client
            .post("https://api.sendgrid.com/v3/mail/send")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::external("sendgrid", e))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(Error::external(
                "sendgrid",
                format!("returned {status}: {error_body}"),
            ));
        }

        // SendGrid replies 202 with an empty body; the message id is a header.
        Ok(response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("accepted")
            .to_string())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whatsapp_address_prefix() {
        let channel = TwilioChannel::new("sid", "token", "+15550100", TwilioKind::WhatsApp);
        assert_eq!(channel.address("+15550123"), "whatsapp:+15550123");
        assert_eq!(channel.name(), "whatsapp");

        let channel = TwilioChannel::new("sid", "token", "+15550100", TwilioKind::Sms);
        assert_eq!(channel.address("+15550123"), "+15550123");
        assert_eq!(channel.name(), "sms");
    }
}
