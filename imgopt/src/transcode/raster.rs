//! `image`-crate backed transcoder.
//!
//! Decoding and encoding are CPU-bound, so both run on tokio's blocking pool. Decode is the only
//! step fed untrusted headers, so it is the one bounded by [`image::Limits`] and a timeout.

use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader, Limits};
use tracing::{debug, instrument};

use super::{EncodingSpec, SourceImage, TargetFormat, TranscodeError, TranscodeResult, Transcoder};
use crate::config::TranscodeConfig;
use crate::metrics;

/// Production [`Transcoder`].
#[derive(Debug, Clone)]
pub struct ImageTranscoder {
    max_input_bytes: usize,
    max_dimension: u32,
    max_decode_alloc_bytes: u64,
    decode_timeout: Duration,
}

impl ImageTranscoder {
    pub fn new(config: &TranscodeConfig) -> Self {
        Self {
            max_input_bytes: config.max_input_bytes,
            max_dimension: config.max_dimension,
            max_decode_alloc_bytes: config.max_decode_alloc_bytes,
            decode_timeout: config.decode_timeout,
        }
    }

    fn limits(&self) -> Limits {
        let mut limits = Limits::default();
        limits.max_image_width = Some(self.max_dimension);
        limits.max_image_height = Some(self.max_dimension);
        limits.max_alloc = Some(self.max_decode_alloc_bytes);
        limits
    }
}

#[async_trait]
impl Transcoder for ImageTranscoder {
    #[instrument(skip_all, fields(size = bytes.len()))]
    async fn decode(&self, bytes: Bytes) -> Result<Arc<SourceImage>, TranscodeError> {
        if bytes.is_empty() {
            return Err(TranscodeError::EmptyInput);
        }
        if bytes.len() > self.max_input_bytes {
            return Err(TranscodeError::InputTooLarge {
                size: bytes.len(),
                limit: self.max_input_bytes,
            });
        }

        let limits = self.limits();
        let task = tokio::task::spawn_blocking(move || decode_bytes(&bytes, limits));

        // A timed-out decode keeps running on the blocking pool until it finishes; its result is
        // dropped.
        let image = match tokio::time::timeout(self.decode_timeout, task).await {
            Ok(joined) => joined.map_err(|e| TranscodeError::Task(e.to_string()))??,
            Err(_) => return Err(TranscodeError::DecodeTimedOut(self.decode_timeout)),
        };

        debug!(width = image.width(), height = image.height(), "decoded upload");
        Ok(Arc::new(SourceImage::new(image)))
    }

    #[instrument(skip_all, fields(format = %spec.format, max_width = spec.max_width, quality = spec.quality))]
    async fn encode(&self, source: Arc<SourceImage>, spec: EncodingSpec) -> Result<TranscodeResult, TranscodeError> {
        let started = Instant::now();
        let result = tokio::task::spawn_blocking(move || encode_source(&source, &spec))
            .await
            .map_err(|e| TranscodeError::Task(e.to_string()))??;

        metrics::record_transcode_duration(spec.format, started.elapsed());
        debug!(
            width = result.width,
            height = result.height,
            bytes = result.byte_len(),
            "encoded output"
        );
        Ok(result)
    }
}

/// Decode `bytes` with the given resource limits, sniffing the container format from content.
pub(crate) fn decode_bytes(bytes: &[u8], limits: Limits) -> Result<DynamicImage, TranscodeError> {
    let mut reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| TranscodeError::Decode(image::ImageError::IoError(e)))?;
    if reader.format().is_none() {
        return Err(TranscodeError::UnrecognizedFormat);
    }
    reader.limits(limits);
    reader.decode().map_err(TranscodeError::Decode)
}

/// Resize (never enlarging) and encode one output synchronously.
pub(crate) fn encode_source(source: &SourceImage, spec: &EncodingSpec) -> Result<TranscodeResult, TranscodeError> {
    let image = source.image();
    let (width, height) = spec.target_dimensions(image.width(), image.height());

    let resized;
    let frame = if (width, height) == (image.width(), image.height()) {
        image
    } else {
        resized = image.resize_exact(width, height, FilterType::Lanczos3);
        &resized
    };

    let bytes = match spec.format {
        TargetFormat::Jpeg => encode_jpeg(frame, spec.quality)?,
        TargetFormat::WebP => encode_webp(frame, spec.quality)?,
    };

    Ok(TranscodeResult {
        format: spec.format,
        width,
        height,
        bytes: Bytes::from(bytes),
    })
}

fn encode_jpeg(frame: &DynamicImage, quality: u8) -> Result<Vec<u8>, TranscodeError> {
    // JPEG has no alpha channel
    let rgb = DynamicImage::ImageRgb8(frame.to_rgb8());
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    rgb.write_with_encoder(encoder).map_err(|e| TranscodeError::Encode {
        format: TargetFormat::Jpeg,
        message: e.to_string(),
    })?;
    Ok(buf)
}

fn encode_webp(frame: &DynamicImage, quality: u8) -> Result<Vec<u8>, TranscodeError> {
    let (width, height) = (frame.width(), frame.height());
    let memory = if frame.color().has_alpha() {
        let rgba = frame.to_rgba8();
        webp::Encoder::from_rgba(rgba.as_raw(), width, height).encode_simple(false, f32::from(quality))
    } else {
        let rgb = frame.to_rgb8();
        webp::Encoder::from_rgb(rgb.as_raw(), width, height).encode_simple(false, f32::from(quality))
    }
    .map_err(|e| TranscodeError::Encode {
        format: TargetFormat::WebP,
        message: format!("{e:?}"),
    })?;
    Ok(memory.to_vec())
}
