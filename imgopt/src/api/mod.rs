//! HTTP surface.
//!
//! - **[`handlers`]**: Axum route handlers
//! - **[`models`]**: Request/response bodies
//!
//! # Routes
//!
//! - `POST /api/optimize`: multipart upload (field `image`), returns both encodings and alt text
//! - `GET /api/credits/balance`: the caller's remaining credits (quota accounting only)
//! - `GET /healthz`: liveness
//! - `GET /openapi.json`: OpenAPI document
//! - `GET /internal/metrics`: Prometheus exposition (when `enable_metrics` is set)

pub mod handlers;
pub mod models;
