//! Decode an uploaded image once and re-encode it into the web delivery formats.
//!
//! The pipeline only ever talks to the [`Transcoder`] trait. [`ImageTranscoder`] is the production
//! implementation; tests wrap or replace it to observe call counts or inject failures.
//!
//! Every output is re-encoded even when the input already satisfies the size constraints, so the
//! compression level of a delivered file depends only on its [`EncodingSpec`], never on how the
//! upload was produced.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

mod raster;

pub use raster::ImageTranscoder;

/// Output encodings produced for every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    Jpeg,
    #[serde(rename = "webp")]
    WebP,
}

impl TargetFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            TargetFormat::Jpeg => "image/jpeg",
            TargetFormat::WebP => "image/webp",
        }
    }
}

impl std::fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetFormat::Jpeg => write!(f, "jpeg"),
            TargetFormat::WebP => write!(f, "webp"),
        }
    }
}

/// Immutable description of one output: format, width ceiling and encoder quality (1-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingSpec {
    pub format: TargetFormat,
    pub max_width: u32,
    pub quality: u8,
}

impl EncodingSpec {
    pub const fn new(format: TargetFormat, max_width: u32, quality: u8) -> Self {
        Self {
            format,
            max_width,
            quality,
        }
    }

    /// Dimensions after applying the width ceiling. Never enlarges; keeps the aspect ratio and
    /// never lets the height collapse to zero.
    pub fn target_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        if width <= self.max_width || width == 0 {
            return (width, height);
        }
        let scaled = (u64::from(height) * u64::from(self.max_width) + u64::from(width) / 2) / u64::from(width);
        (self.max_width, scaled.clamp(1, u64::from(u32::MAX)) as u32)
    }
}

/// A decoded upload, shared read-only between the concurrent encodes of one request.
#[derive(Debug)]
pub struct SourceImage {
    image: DynamicImage,
}

impl SourceImage {
    pub fn new(image: DynamicImage) -> Self {
        Self { image }
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// One encoded output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeResult {
    pub format: TargetFormat,
    pub width: u32,
    pub height: u32,
    pub bytes: Bytes,
}

impl TranscodeResult {
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }

    /// Self-describing inline form (`data:<mime>;base64,<payload>`).
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.format.mime_type(), self.to_base64())
    }
}

/// Internal failure detail. Callers outside this module only ever see "transcode failed"; the
/// variants exist for logs and tests.
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("input of {size} bytes exceeds the {limit} byte ceiling")]
    InputTooLarge { size: usize, limit: usize },

    #[error("input is empty")]
    EmptyInput,

    #[error("input is not a recognised image format")]
    UnrecognizedFormat,

    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("decode did not finish within {0:?}")]
    DecodeTimedOut(Duration),

    #[error("failed to encode {format}: {message}")]
    Encode { format: TargetFormat, message: String },

    #[error("transcode task failed: {0}")]
    Task(String),
}

/// Decode/encode capability used by the pipeline.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Decode raw upload bytes into a shareable source image.
    async fn decode(&self, bytes: Bytes) -> Result<Arc<SourceImage>, TranscodeError>;

    /// Resize (without enlargement) and encode the source according to `spec`.
    async fn encode(&self, source: Arc<SourceImage>, spec: EncodingSpec) -> Result<TranscodeResult, TranscodeError>;
}
