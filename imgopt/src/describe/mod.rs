//! Accessibility descriptions for uploaded images.
//!
//! Generation is delegated to an external vision model through the [`DescriptionGenerator`]
//! trait. A missing description never fails a request: [`describe_with_fallback`] bounds the call
//! with a timeout and folds every error into [`DescriptionResult::Fallback`], so callers and tests
//! can still tell a generated description from the placeholder.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use utoipa::ToSchema;

use crate::config::DescriptionConfig;
use crate::metrics;

mod openai;

pub use openai::OpenAiDescriber;

/// Instruction sent alongside every image.
pub const DEFAULT_PROMPT: &str = "Act as an SEO expert. Describe this image in a concise sentence (under 150 characters) \
     for an HTML alt tag. Be descriptive and do not include phrases like 'Image of...'. Write in English.";

pub const DEFAULT_FALLBACK_TEXT: &str = "Description not available";

#[derive(Debug, Error)]
pub enum DescriptionError {
    #[error("description request timed out after {0:?}")]
    Timeout(Duration),

    #[error("description provider rate limited the request")]
    RateLimited,

    #[error("description provider error (status {status:?}): {message}")]
    Provider { status: Option<u16>, message: String },

    #[error("malformed provider response: {0}")]
    Malformed(String),

    #[error("provider returned no description")]
    Empty,

    #[error("description generation is disabled")]
    Disabled,
}

/// Why the placeholder was used instead of a generated description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    Timeout,
    RateLimited,
    Provider,
    Malformed,
    Empty,
    Disabled,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::Timeout => "timeout",
            FallbackReason::RateLimited => "rate_limited",
            FallbackReason::Provider => "provider",
            FallbackReason::Malformed => "malformed",
            FallbackReason::Empty => "empty",
            FallbackReason::Disabled => "disabled",
        }
    }
}

impl From<&DescriptionError> for FallbackReason {
    fn from(err: &DescriptionError) -> Self {
        match err {
            DescriptionError::Timeout(_) => FallbackReason::Timeout,
            DescriptionError::RateLimited => FallbackReason::RateLimited,
            DescriptionError::Provider { .. } => FallbackReason::Provider,
            DescriptionError::Malformed(_) => FallbackReason::Malformed,
            DescriptionError::Empty => FallbackReason::Empty,
            DescriptionError::Disabled => FallbackReason::Disabled,
        }
    }
}

/// Outcome of the description step. Exactly one per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptionResult {
    Generated(String),
    Fallback { reason: FallbackReason, text: String },
}

impl DescriptionResult {
    pub fn text(&self) -> &str {
        match self {
            DescriptionResult::Generated(text) => text,
            DescriptionResult::Fallback { text, .. } => text,
        }
    }

    pub fn is_generated(&self) -> bool {
        matches!(self, DescriptionResult::Generated(_))
    }
}

/// Vision-to-text capability: image bytes in, short free-form text out.
#[async_trait]
pub trait DescriptionGenerator: Send + Sync {
    async fn describe(&self, image: &[u8], mime_type: &str) -> Result<String, DescriptionError>;
}

/// Used when description generation is switched off in configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledDescriber;

#[async_trait]
impl DescriptionGenerator for DisabledDescriber {
    async fn describe(&self, _image: &[u8], _mime_type: &str) -> Result<String, DescriptionError> {
        Err(DescriptionError::Disabled)
    }
}

/// Per-call limits applied around any [`DescriptionGenerator`].
#[derive(Debug, Clone)]
pub struct DescriptionSettings {
    pub timeout: Duration,
    pub max_chars: usize,
    pub fallback_text: String,
}

impl From<&DescriptionConfig> for DescriptionSettings {
    fn from(config: &DescriptionConfig) -> Self {
        Self {
            timeout: config.timeout,
            max_chars: config.max_chars,
            fallback_text: config.fallback_text.clone(),
        }
    }
}

impl Default for DescriptionSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(8),
            max_chars: 150,
            fallback_text: DEFAULT_FALLBACK_TEXT.to_string(),
        }
    }
}

/// Run the generator under a timeout and never fail: errors become a
/// [`DescriptionResult::Fallback`] carrying the configured placeholder.
pub async fn describe_with_fallback(
    generator: &dyn DescriptionGenerator,
    image: &[u8],
    mime_type: &str,
    settings: &DescriptionSettings,
) -> DescriptionResult {
    let outcome = match tokio::time::timeout(settings.timeout, generator.describe(image, mime_type)).await {
        Ok(result) => result.and_then(|text| clamp_description(&text, settings.max_chars).ok_or(DescriptionError::Empty)),
        Err(_) => Err(DescriptionError::Timeout(settings.timeout)),
    };

    match outcome {
        Ok(text) => {
            debug!(chars = text.chars().count(), "description generated");
            DescriptionResult::Generated(text)
        }
        Err(e) => {
            let reason = FallbackReason::from(&e);
            if reason == FallbackReason::Disabled {
                debug!("description generation disabled, using fallback text");
            } else {
                warn!(reason = reason.as_str(), error = %e, "description unavailable, using fallback text");
            }
            metrics::record_description_fallback(reason);
            DescriptionResult::Fallback {
                reason,
                text: settings.fallback_text.clone(),
            }
        }
    }
}

/// Trim and cut to at most `max_chars` characters, on a character boundary. `None` if nothing
/// printable is left.
fn clamp_description(text: &str, max_chars: usize) -> Option<String> {
    let trimmed = text.trim().trim_matches('"').trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.char_indices().nth(max_chars) {
        Some((cut, _)) => Some(trimmed[..cut].trim_end().to_string()),
        None => Some(trimmed.to_string()),
    }
}
