//! OpenAI-compatible chat completions backend for [`DescriptionGenerator`].

use std::time::Duration;

use async_openai::types::chat::CreateChatCompletionResponse;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::{Client, StatusCode};
use serde_json::json;
use tracing::{instrument, trace};
use url::Url;

use super::{DescriptionError, DescriptionGenerator};
use crate::config::DescriptionConfig;

/// Sends the image as a base64 data URI in a single user turn, next to the fixed instruction.
#[derive(Debug, Clone)]
pub struct OpenAiDescriber {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
    model: String,
    prompt: String,
    max_tokens: u32,
    timeout: Duration,
}

impl OpenAiDescriber {
    pub fn new(client: Client, config: &DescriptionConfig) -> Self {
        Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            prompt: config.prompt.clone(),
            max_tokens: config.max_tokens,
            timeout: config.timeout,
        }
    }

    /// Build with a dedicated HTTP client whose timeout matches the configured per-call timeout.
    pub fn from_config(config: &DescriptionConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self::new(client, config))
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.endpoint.as_str().trim_end_matches('/'))
    }
}

#[async_trait]
impl DescriptionGenerator for OpenAiDescriber {
    #[instrument(skip_all, fields(model = %self.model, size = image.len()))]
    async fn describe(&self, image: &[u8], mime_type: &str) -> Result<String, DescriptionError> {
        let data_uri = format!("data:{};base64,{}", mime_type, STANDARD.encode(image));
        let payload = json!({
            "model": self.model,
            "messages": [
                {
                    "role": "user",
                    "content": [
                        { "type": "text", "text": self.prompt },
                        { "type": "image_url", "image_url": { "url": data_uri } }
                    ]
                }
            ],
            "max_tokens": self.max_tokens
        });

        let mut request = self.client.post(self.completions_url()).json(&payload);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DescriptionError::Timeout(self.timeout)
            } else {
                DescriptionError::Provider {
                    status: None,
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(DescriptionError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DescriptionError::Provider {
                status: Some(status.as_u16()),
                message: body.chars().take(200).collect(),
            });
        }

        let body = response.bytes().await.map_err(|e| DescriptionError::Provider {
            status: Some(status.as_u16()),
            message: e.to_string(),
        })?;
        let completion: CreateChatCompletionResponse =
            serde_json::from_slice(&body).map_err(|e| DescriptionError::Malformed(e.to_string()))?;
        trace!(choices = completion.choices.len(), "completion received");

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(DescriptionError::Empty)
    }
}
