//! OpenAPI document served at `/openapi.json`.

use utoipa::{
    Modify, OpenApi,
    openapi::security::{ApiKey, ApiKeyValue, HttpAuthScheme, HttpBuilder, SecurityScheme},
};

use crate::api;
use crate::describe::FallbackReason;
use crate::errors::ErrorBody;

/// Registers the three ways a caller can be identified.
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.security_schemes.insert(
                "BearerAuth".to_string(),
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .description(Some(
                            "Session token in the `Authorization` header:\n\n\
                            ```\nAuthorization: Bearer YOUR_SESSION_TOKEN\n```",
                        ))
                        .build(),
                ),
            );
            components.security_schemes.insert(
                "CookieAuth".to_string(),
                SecurityScheme::ApiKey(ApiKey::Cookie(ApiKeyValue::with_description(
                    "imgopt_session",
                    "Session token cookie (name is configurable via `auth.session.cookie_name`)",
                ))),
            );
            components.security_schemes.insert(
                "ProxyHeader".to_string(),
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::with_description(
                    "x-imgopt-user",
                    "User UUID set by a trusted authenticating proxy (name is configurable via \
                     `auth.proxy_header.header_name`)",
                ))),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "imgopt",
        description = "Image optimisation: one upload in, a resized JPEG and WebP plus alt text out."
    ),
    modifiers(&SecurityAddon),
    paths(
        api::handlers::optimize::optimize_image,
        api::handlers::credits::get_balance,
        api::handlers::health::healthz,
    ),
    components(
        schemas(
            api::models::optimize::OptimizeResponse,
            api::models::optimize::AltTextSource,
            api::models::credits::BalanceResponse,
            FallbackReason,
            ErrorBody,
        )
    ),
    tags(
        (name = "optimize", description = "Convert an uploaded image into web-ready encodings."),
        (name = "credits", description = "Per-user optimisation credits."),
        (name = "health", description = "Service liveness."),
    )
)]
pub struct ApiDoc;
