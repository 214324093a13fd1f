//! HTTP remote classifier.
//!
//! Talks to an OpenAI-compatible chat-completions endpoint. One request
//! carries a whole batch; the model is asked for a JSON array with one
//! verdict per item.

use std::collections::HashMap;
use std::fmt::Write;
use std::time::Duration;

use async_trait::async_trait;
use mailsort_core::mail::truncate_chars;
use mailsort_core::{ClassifyRequest, ItemId, RemoteClassifier, RemoteError, RemoteVerdict};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::settings::RemoteSettings;

/// Subject characters sent per item.
const SUBJECT_CHARS: usize = 100;
/// Body characters sent per item.
const BODY_CHARS: usize = 300;
/// Characters of an error body kept in [`RemoteError::Status`].
const ERROR_EXCERPT_CHARS: usize = 200;

const SYSTEM_PROMPT: &str = "You are an email classifier. Output ONLY valid JSON.";

/// Remote classifier over HTTP.
#[derive(Debug, Clone)]
pub struct HttpClassifier {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct Completion {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

impl HttpClassifier {
    /// Creates a classifier for `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::NotConfigured`] when no API key is set, or
    /// [`RemoteError::Network`] if the HTTP client cannot be built.
    pub fn new(settings: &RemoteSettings, timeout: Duration) -> Result<Self, RemoteError> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or(RemoteError::NotConfigured)?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: settings.endpoint.clone(),
            model: settings.model.clone(),
            api_key,
            timeout,
        })
    }

    fn map_error(&self, error: &reqwest::Error) -> RemoteError {
        if error.is_timeout() {
            RemoteError::Timeout(self.timeout)
        } else {
            RemoteError::Network(error.to_string())
        }
    }
}

#[async_trait]
impl RemoteClassifier for HttpClassifier {
    async fn classify(
        &self,
        request: &ClassifyRequest,
    ) -> Result<HashMap<ItemId, RemoteVerdict>, RemoteError> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": build_prompt(request) },
            ],
        });

        debug!(items = request.items.len(), endpoint = %self.endpoint, "sending batch");
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RemoteError::Status {
                status: status.as_u16(),
                message: truncate_chars(&text, ERROR_EXCERPT_CHARS),
            });
        }

        let completion: Completion = response
            .json()
            .await
            .map_err(|e| RemoteError::Malformed(e.to_string()))?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| RemoteError::Malformed("no choices in response".into()))?;

        parse_verdicts(&content)
    }
}

/// Render the user prompt for one batch.
#[must_use]
pub fn build_prompt(request: &ClassifyRequest) -> String {
    let mut prompt = format!(
        "You are an email classification assistant. Classify each email into EXACTLY ONE category.\n\n\
         VALID CATEGORIES ONLY: {}\n\n\
         RULES:\n\
         1. Return ONLY valid category names from the list above\n\
         2. Return one JSON object per email\n\
         3. Never create new categories\n\
         4. Give a confidence between 0 and 1\n",
        request.vocabulary.join(", ")
    );

    if !request.examples.is_empty() {
        prompt.push_str("\nPast decisions by the user:\n");
        for example in &request.examples {
            let _ = writeln!(
                prompt,
                "- From: {} | Subject: {} -> {}",
                sanitize(&example.sender, SUBJECT_CHARS),
                sanitize(&example.subject, SUBJECT_CHARS),
                example.category
            );
        }
    }

    let _ = write!(prompt, "\nClassify these {} emails:\n", request.items.len());
    for item in &request.items {
        let _ = write!(
            prompt,
            "\nEmail id: {}\nFrom: {}\nSubject: {}\nBody: {}\n",
            item.id,
            sanitize(&item.sender, SUBJECT_CHARS),
            sanitize(&item.subject, SUBJECT_CHARS),
            sanitize(&item.body, BODY_CHARS),
        );
    }

    prompt.push_str(
        "\nReturn ONLY a JSON array with one object per email:\n\
         [{\"email_id\": \"id_from_input\", \"category\": \"CATEGORY_NAME\", \"confidence\": 0.85}, ...]\n\n\
         IMPORTANT: Output ONLY valid JSON, no other text.\n",
    );
    prompt
}

/// Parse the model's answer into verdicts.
///
/// Markdown code fences are stripped. Entries without an id or category are
/// skipped, so those items fall back locally.
///
/// # Errors
///
/// Returns [`RemoteError::Malformed`] if the content is not a JSON array.
pub fn parse_verdicts(content: &str) -> Result<HashMap<ItemId, RemoteVerdict>, RemoteError> {
    let json = strip_fences(content);
    let entries: Vec<Value> =
        serde_json::from_str(json).map_err(|e| RemoteError::Malformed(e.to_string()))?;

    Ok(entries
        .iter()
        .filter_map(|entry| {
            let id = match entry.get("email_id").or_else(|| entry.get("id"))? {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            };
            let label = entry.get("category")?.as_str()?.to_string();
            let confidence = match entry.get("confidence") {
                Some(Value::Number(n)) => n.as_f64()?,
                Some(Value::String(s)) => s.trim().parse().ok()?,
                _ => 0.0,
            };
            Some((ItemId::new(id), RemoteVerdict { label, confidence }))
        })
        .collect())
}

fn strip_fences(content: &str) -> &str {
    let inner = if let Some((_, rest)) = content.split_once("```json") {
        rest.split("```").next().unwrap_or(rest)
    } else if let Some((_, rest)) = content.split_once("```") {
        rest.split("```").next().unwrap_or(rest)
    } else {
        content
    };
    inner.trim()
}

fn sanitize(text: &str, max: usize) -> String {
    let flat: String = text
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    truncate_chars(&flat.replace('"', "\\\""), max)
}
