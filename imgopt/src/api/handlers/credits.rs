use axum::{Json, extract::State, http::HeaderMap};
use tracing::info;

use crate::AppState;
use crate::api::models::credits::BalanceResponse;
use crate::errors::{Error, ErrorBody, Result};

#[utoipa::path(
    get,
    path = "/api/credits/balance",
    tag = "credits",
    summary = "Get remaining credits",
    description = "Number of optimisations the authenticated user can still pay for. Only available when credit \
                   accounting is enabled.",
    responses(
        (status = 200, description = "Current balance", body = BalanceResponse),
        (status = 401, description = "Not authenticated", body = ErrorBody),
        (status = 500, description = "Credit store unavailable", body = ErrorBody)
    ),
    security(
        ("BearerAuth" = []),
        ("CookieAuth" = []),
        ("ProxyHeader" = [])
    )
)]
pub async fn get_balance(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<BalanceResponse>> {
    let Some(ledger) = state.pipeline.ledger() else {
        return Err(Error::BadRequest {
            message: "Credit accounting is disabled".to_string(),
        });
    };

    let user_id = state
        .pipeline
        .authenticator()
        .authenticate(&headers)
        .await
        .map_err(|e| {
            info!(error = %e, "credentials rejected");
            Error::Unauthenticated { message: None }
        })?
        .ok_or(Error::Unauthenticated { message: None })?;

    let balance = ledger.balance(user_id).await.map_err(|e| Error::Internal {
        operation: format!("read credit balance: {e}"),
    })?;

    Ok(Json(BalanceResponse { user_id, balance }))
}
