use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::describe::{DescriptionResult, FallbackReason};
use crate::errors::Error;
use crate::pipeline::RequestOutcome;
use crate::transcode::TargetFormat;
use crate::types::RequestId;

/// Whether `altText` came from the vision model or is the placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AltTextSource {
    Generated,
    Fallback,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeResponse {
    /// Alt text for the image, or the fallback text
    pub alt_text: String,
    pub alt_text_source: AltTextSource,
    /// Why the fallback text was used
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt_text_fallback_reason: Option<FallbackReason>,
    /// Size of the upload in bytes
    pub original_size: usize,
    pub jpeg_size: usize,
    pub webp_size: usize,
    /// Base64 of the JPEG output
    pub jpeg_base64: String,
    /// Base64 of the WebP output
    pub webp_base64: String,
    pub jpeg_width: u32,
    pub jpeg_height: u32,
    pub webp_width: u32,
    pub webp_height: u32,
    /// Credits left after this request; absent when credit accounting is disabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_credits: Option<i64>,
    #[schema(value_type = String, format = "uuid")]
    pub request_id: RequestId,
}

impl TryFrom<RequestOutcome> for OptimizeResponse {
    type Error = Error;

    fn try_from(outcome: RequestOutcome) -> Result<Self, Self::Error> {
        let missing = |format: TargetFormat| Error::Internal {
            operation: format!("produce {format} output"),
        };
        let jpeg = outcome.output(TargetFormat::Jpeg).ok_or_else(|| missing(TargetFormat::Jpeg))?;
        let webp = outcome.output(TargetFormat::WebP).ok_or_else(|| missing(TargetFormat::WebP))?;

        let (alt_text_source, alt_text_fallback_reason) = match &outcome.description {
            DescriptionResult::Generated(_) => (AltTextSource::Generated, None),
            DescriptionResult::Fallback { reason, .. } => (AltTextSource::Fallback, Some(*reason)),
        };

        Ok(Self {
            alt_text: outcome.description.text().to_string(),
            alt_text_source,
            alt_text_fallback_reason,
            original_size: outcome.original_size,
            jpeg_size: jpeg.byte_len(),
            webp_size: webp.byte_len(),
            jpeg_base64: jpeg.to_base64(),
            webp_base64: webp.to_base64(),
            jpeg_width: jpeg.width,
            jpeg_height: jpeg.height,
            webp_width: webp.width,
            webp_height: webp.height,
            remaining_credits: outcome.remaining_credits,
            request_id: outcome.request_id,
        })
    }
}
