use axum::{
    Json,
    extract::{Multipart, State, multipart::MultipartRejection},
    http::{HeaderMap, StatusCode},
};
use bytes::BytesMut;
use tracing::{debug, instrument};

use crate::AppState;
use crate::api::models::optimize::OptimizeResponse;
use crate::errors::{Error, ErrorBody, Result};
use crate::pipeline::ImageAsset;

/// Multipart field carrying the upload.
pub const IMAGE_FIELD: &str = "image";

#[utoipa::path(
    post,
    path = "/api/optimize",
    tag = "optimize",
    summary = "Optimise an image",
    description = "Upload one image as the `image` field of a multipart form. Returns a resized JPEG and WebP encoding \
                   of it along with generated alt text. Costs one credit when credit accounting is enabled; failed \
                   requests are not charged.",
    request_body(
        content_type = "multipart/form-data",
        description = "Image file in the `image` field"
    ),
    responses(
        (status = 200, description = "Image optimised", body = OptimizeResponse),
        (status = 400, description = "No image provided or malformed form", body = ErrorBody),
        (status = 401, description = "Not authenticated", body = ErrorBody),
        (status = 402, description = "No credits left", body = ErrorBody),
        (status = 413, description = "Image too large", body = ErrorBody),
        (status = 429, description = "Too many optimisations in progress", body = ErrorBody),
        (status = 500, description = "Image could not be processed", body = ErrorBody)
    ),
    security(
        ("BearerAuth" = []),
        ("CookieAuth" = []),
        ("ProxyHeader" = [])
    )
)]
#[instrument(skip_all)]
pub async fn optimize_image(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<OptimizeResponse>> {
    let _permit = match &state.limiters.optimizations {
        Some(limiter) => Some(limiter.acquire().await?),
        None => None,
    };

    let mut multipart = multipart.map_err(|e| {
        debug!(error = %e.body_text(), "request is not a multipart form");
        Error::BadRequest {
            message: "Expected a multipart/form-data body".to_string(),
        }
    })?;
    let asset = read_image_field(&mut multipart, state.config.transcode.max_input_bytes).await?;

    let outcome = state.pipeline.run(&headers, asset).await?;
    Ok(Json(OptimizeResponse::try_from(outcome)?))
}

/// Read the `image` field, aborting as soon as it exceeds `max_bytes`. Other fields are skipped.
async fn read_image_field(multipart: &mut Multipart, max_bytes: usize) -> Result<ImageAsset> {
    while let Some(field) = multipart.next_field().await.map_err(|e| multipart_error(e, max_bytes))? {
        if field.name() != Some(IMAGE_FIELD) {
            debug!(field = ?field.name(), "skipping multipart field");
            continue;
        }

        let content_type = field.content_type().map(str::to_string);
        let mut buffer = BytesMut::new();
        let mut field = field;
        while let Some(chunk) = field.chunk().await.map_err(|e| multipart_error(e, max_bytes))? {
            if buffer.len() + chunk.len() > max_bytes {
                debug!(max_bytes, "upload exceeds size limit, aborting");
                return Err(Error::PayloadTooLarge { limit: max_bytes });
            }
            buffer.extend_from_slice(&chunk);
        }

        if buffer.is_empty() {
            return Err(Error::MissingInput);
        }
        return Ok(ImageAsset::new(buffer.freeze(), content_type.as_deref()));
    }

    Err(Error::MissingInput)
}

fn multipart_error(e: axum::extract::multipart::MultipartError, max_bytes: usize) -> Error {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return Error::PayloadTooLarge { limit: max_bytes };
    }
    debug!(error = %e.body_text(), "malformed multipart body");
    Error::BadRequest {
        message: "Failed to parse multipart data".to_string(),
    }
}
