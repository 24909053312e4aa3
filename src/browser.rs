use async_trait::async_trait;
use std::fmt::Write as _;
use std::time::Duration;
use thirtyfour::prelude::*;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::ai::FormField;
use crate::error::{Error, Result};

/// One interactive control found on an application page.
#[derive(Debug, Clone)]
pub struct FormControl {
    pub selector: String,
    pub label: String,
    pub kind: String,
    pub required: bool,
}

/// Structural description of the rendered application form, fed to the AI
/// client to infer a field mapping.
#[derive(Debug, Clone, Default)]
pub struct FormSnapshot {
    pub url: String,
    pub title: String,
    pub controls: Vec<FormControl>,
}

impl FormSnapshot {
    /// Plain-text rendering for the form-mapping prompt.
    pub fn describe(&self) -> String {
        let mut out = format!("Page: {} ({})\n", self.title, self.url);
        for control in &self.controls {
            let _ = writeln!(
                out,
                "- selector: {} | kind: {} | label: {}{}",
                control.selector,
                control.kind,
                control.label,
                if control.required { " | required" } else { "" },
            );
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub success: bool,
    pub message: Option<String>,
}

/// A live page session. Implementations must tolerate `close` being called
/// at most once and after any failure.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn inspect_form(&self) -> Result<FormSnapshot>;
    /// Fill the given fields; returns how many were actually filled.
    async fn fill(&self, fields: &[FormField]) -> Result<u32>;
    async fn submit(&self) -> Result<SubmitOutcome>;
    async fn screenshot(&self) -> Result<Vec<u8>>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn BrowserSession>>;
}

// --- WebDriver implementation ---

const DEFAULT_WEBDRIVER_URL: &str = "http://localhost:9515";

/// Browser driver speaking to a WebDriver endpoint (chromedriver or a
/// remote grid).
pub struct WebDriverBrowser {
    server_url: String,
}

impl WebDriverBrowser {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
        }
    }

    pub fn from_env() -> Self {
        let url = std::env::var("WEBDRIVER_URL")
            .unwrap_or_else(|_| DEFAULT_WEBDRIVER_URL.to_string());
        Self::new(url)
    }
}

#[async_trait]
impl BrowserDriver for WebDriverBrowser {
    async fn open(&self, url: &str) -> Result<Box<dyn BrowserSession>> {
        let mut caps = DesiredCapabilities::chrome();
        caps.set_headless()
            .map_err(|e| Error::external("browser", e))?;

        let driver = WebDriver::new(&self.server_url, caps)
            .await
            .map_err(|e| {
                Error::external(
                    "browser",
                    format!("failed to start session against {}: {e}", self.server_url),
                )
            })?;

        if let Err(e) = driver.goto(url).await {
            let _ = driver.clone().quit().await;
            return Err(Error::external("browser", format!("navigation failed: {e}")));
        }

        // Give dynamic forms a moment to render before inspection.
        tokio::time::sleep(Duration::from_secs(2)).await;

        Ok(Box::new(WebDriverSession {
            driver: Mutex::new(Some(driver)),
        }))
    }
}

struct WebDriverSession {
    driver: Mutex<Option<WebDriver>>,
}

impl WebDriverSession {
    async fn driver(&self) -> Result<WebDriver> {
        self.driver
            .lock()
            .await
            .as_ref()
            .cloned()
            .ok_or_else(|| Error::internal("browser session already closed"))
    }
}

#[async_trait]
impl BrowserSession for WebDriverSession {
    async fn inspect_form(&self) -> Result<FormSnapshot> {
        let driver = self.driver().await?;
        let title = driver.title().await.unwrap_or_default();
        let url = driver
            .current_url()
            .await
            .map(|u| u.to_string())
            .unwrap_or_default();

        let elements = driver
            .find_all(By::Css("input, textarea, select"))
            .await
            .map_err(|e| Error::external("browser", format!("form scan failed: {e}")))?;

        let mut controls = Vec::new();
        for element in elements {
            let kind = element
                .attr("type")
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| "text".to_string());
            if matches!(kind.as_str(), "hidden" | "submit" | "button" | "image") {
                continue;
            }

            let name = element.attr("name").await.ok().flatten();
            let id = element.attr("id").await.ok().flatten();
            let placeholder = element.attr("placeholder").await.ok().flatten();
            let aria_label = element.attr("aria-label").await.ok().flatten();

            // Selector preference mirrors how stable the attribute tends
            // to be across page loads.
            let selector = if let Some(name) = &name {
                format!("[name='{name}']")
            } else if let Some(id) = &id {
                format!("#{id}")
            } else if let Some(placeholder) = &placeholder {
                format!("[placeholder='{placeholder}']")
            } else {
                continue;
            };

            let label = aria_label
                .or(placeholder)
                .or(name)
                .or(id)
                .unwrap_or_default();
            let required = element.attr("required").await.ok().flatten().is_some();

            controls.push(FormControl {
                selector,
                label,
                kind,
                required,
            });
        }

        debug!(url = %url, controls = controls.len(), "inspected application form");
        Ok(FormSnapshot {
            url,
            title,
            controls,
        })
    }

    async fn fill(&self, fields: &[FormField]) -> Result<u32> {
        let driver = self.driver().await?;
        let mut filled = 0u32;

        for field in fields {
            let element = match driver.find(By::Css(field.selector.as_str())).await {
                Ok(el) => el,
                Err(e) => {
                    warn!(selector = %field.selector, error = %e, "form control not found");
                    continue;
                }
            };

            let kind = element
                .attr("type")
                .await
                .ok()
                .flatten()
                .unwrap_or_default();
            let result = if kind == "checkbox" || kind == "radio" {
                element.click().await
            } else {
                let _ = element.clear().await;
                element.send_keys(&field.value).await
            };

            match result {
                Ok(()) => filled += 1,
                Err(e) => warn!(selector = %field.selector, error = %e, "fill failed"),
            }
        }

        Ok(filled)
    }

    async fn submit(&self) -> Result<SubmitOutcome> {
        let driver = self.driver().await?;

        // Ordered fallbacks: application pages vary wildly in markup.
        let submit_selectors = [
            "button[type='submit']",
            "input[type='submit']",
            "button[aria-label*='Submit']",
            "button[aria-label*='Apply']",
        ];

        let mut clicked = false;
        for selector in submit_selectors {
            if let Ok(element) = driver.find(By::Css(selector)).await {
                if element.click().await.is_ok() {
                    clicked = true;
                    break;
                }
            }
        }
        if !clicked {
            if let Ok(element) = driver
                .find(By::XPath(
                    "//button[contains(., 'Submit') or contains(., 'Apply')]",
                ))
                .await
            {
                clicked = element.click().await.is_ok();
            }
        }

        if !clicked {
            return Ok(SubmitOutcome {
                success: false,
                message: Some("no submit control found".to_string()),
            });
        }

        tokio::time::sleep(Duration::from_secs(2)).await;

        let body_text = match driver.find(By::Css("body")).await {
            Ok(body) => body.text().await.unwrap_or_default(),
            Err(_) => String::new(),
        };
        let lower = body_text.to_lowercase();

        let confirmations = [
            "application submitted",
            "application received",
            "successfully submitted",
            "thank you for applying",
            "thank you for your application",
        ];
        if let Some(phrase) = confirmations.iter().find(|p| lower.contains(**p)) {
            return Ok(SubmitOutcome {
                success: true,
                message: Some((*phrase).to_string()),
            });
        }

        let failures = ["please correct", "required field", "something went wrong"];
        if let Some(phrase) = failures.iter().find(|p| lower.contains(**p)) {
            return Ok(SubmitOutcome {
                success: false,
                message: Some((*phrase).to_string()),
            });
        }

        // Submitted without a recognizable confirmation: optimistic, the
        // screenshot is kept as evidence either way.
        Ok(SubmitOutcome {
            success: true,
            message: None,
        })
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        let driver = self.driver().await?;
        driver
            .screenshot_as_png()
            .await
            .map_err(|e| Error::external("browser", format!("screenshot failed: {e}")))
    }

    async fn close(&self) -> Result<()> {
        if let Some(driver) = self.driver.lock().await.take() {
            driver
                .quit()
                .await
                .map_err(|e| Error::external("browser", format!("quit failed: {e}")))?;
        }
        Ok(())
    }
}

// --- Test doubles ---

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct MockState {
        pub opens: AtomicUsize,
        pub filled: StdMutex<Vec<FormField>>,
        pub submits: AtomicUsize,
        pub closes: AtomicUsize,
    }

    /// Scripted browser driver. All sessions share the driver's state so
    /// tests can assert on what was opened, filled, and submitted.
    pub struct MockBrowser {
        pub state: Arc<MockState>,
        snapshot: FormSnapshot,
        submit_success: bool,
        fail_open: bool,
        submit_delay: Option<Duration>,
    }

    impl MockBrowser {
        pub fn succeeding(snapshot: FormSnapshot) -> Self {
            Self {
                state: Arc::new(MockState::default()),
                snapshot,
                submit_success: true,
                fail_open: false,
                submit_delay: None,
            }
        }

        pub fn failing_submit(snapshot: FormSnapshot) -> Self {
            Self {
                state: Arc::new(MockState::default()),
                snapshot,
                submit_success: false,
                fail_open: false,
                submit_delay: None,
            }
        }

        pub fn failing_open() -> Self {
            Self {
                state: Arc::new(MockState::default()),
                snapshot: FormSnapshot::default(),
                submit_success: false,
                fail_open: true,
                submit_delay: None,
            }
        }

        pub fn with_submit_delay(mut self, delay: Duration) -> Self {
            self.submit_delay = Some(delay);
            self
        }

        pub fn simple_form() -> FormSnapshot {
            FormSnapshot {
                url: "https://jobs.example.com/apply/1".to_string(),
                title: "Apply".to_string(),
                controls: vec![
                    FormControl {
                        selector: "[name='name']".to_string(),
                        label: "Full name".to_string(),
                        kind: "text".to_string(),
                        required: true,
                    },
                    FormControl {
                        selector: "[name='email']".to_string(),
                        label: "Email".to_string(),
                        kind: "email".to_string(),
                        required: true,
                    },
                ],
            }
        }
    }

    #[async_trait]
    impl BrowserDriver for MockBrowser {
        async fn open(&self, _url: &str) -> Result<Box<dyn BrowserSession>> {
            self.state.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail_open {
                return Err(Error::external("browser", "no webdriver available"));
            }
            Ok(Box::new(MockSession {
                state: self.state.clone(),
                snapshot: self.snapshot.clone(),
                submit_success: self.submit_success,
                submit_delay: self.submit_delay,
            }))
        }
    }

    struct MockSession {
        state: Arc<MockState>,
        snapshot: FormSnapshot,
        submit_success: bool,
        submit_delay: Option<Duration>,
    }

    #[async_trait]
    impl BrowserSession for MockSession {
        async fn inspect_form(&self) -> Result<FormSnapshot> {
            Ok(self.snapshot.clone())
        }

        async fn fill(&self, fields: &[FormField]) -> Result<u32> {
            let mut filled = self.state.filled.lock().unwrap();
            filled.extend(fields.iter().cloned());
            Ok(fields.len() as u32)
        }

        async fn submit(&self) -> Result<SubmitOutcome> {
            if let Some(delay) = self.submit_delay {
                tokio::time::sleep(delay).await;
            }
            self.state.submits.fetch_add(1, Ordering::SeqCst);
            Ok(SubmitOutcome {
                success: self.submit_success,
                message: if self.submit_success {
                    Some("application submitted".to_string())
                } else {
                    Some("required field missing".to_string())
                },
            })
        }

        async fn screenshot(&self) -> Result<Vec<u8>> {
            Ok(vec![0x89, 0x50, 0x4e, 0x47])
        }

        async fn close(&self) -> Result<()> {
            self.state.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
