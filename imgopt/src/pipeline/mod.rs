//! Per-request orchestration of one optimisation.
//!
//! ```text
//! Received -> Authorizing -> Processing -> Finalizing -> Succeeded
//!                  |              |             |
//!                  +--------------+-------------+------> Failed
//! ```
//!
//! - **Authorizing**: identify the user and reserve a credit. Nothing is decoded for a user who
//!   cannot pay.
//! - **Processing**: decode once, then run both encodes and the description call concurrently,
//!   bounded by the request timeout. All branches are awaited before the outcome is decided.
//! - **Finalizing**: commit the reservation if both encodes succeeded, release it otherwise. A
//!   failed commit does not fail the request; it is reported for reconciliation.
//!
//! Every collaborator is injected, so tests swap in counting transcoders, canned describers and
//! in-memory credit stores.

use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use bon::Builder;
use bytes::Bytes;
use thiserror::Error;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::describe::{DescriptionGenerator, DescriptionResult, DescriptionSettings, describe_with_fallback};
use crate::errors::Error;
use crate::metrics;
use crate::quota::{QuotaError, QuotaLedger, ReconciliationEvent, ReconciliationKind, Reservation};
use crate::transcode::{EncodingSpec, TargetFormat, TranscodeError, TranscodeResult, Transcoder};
use crate::types::{RequestId, UserId, abbrev_uuid};

const OCTET_STREAM: &str = "application/octet-stream";

/// An uploaded image as received from the client.
#[derive(Debug, Clone)]
pub struct ImageAsset {
    pub bytes: Bytes,
    /// Declared MIME type, or one sniffed from the content when the declaration is not an image
    /// type.
    pub mime_type: String,
}

impl ImageAsset {
    pub fn new(bytes: Bytes, declared_mime: Option<&str>) -> Self {
        let mime_type = declared_mime
            .filter(|mime| mime.starts_with("image/"))
            .map(str::to_string)
            .or_else(|| {
                image::guess_format(&bytes)
                    .ok()
                    .map(|format| format.to_mime_type().to_string())
            })
            .unwrap_or_else(|| OCTET_STREAM.to_string());
        Self { bytes, mime_type }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Everything a successful request returns.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub request_id: RequestId,
    pub user_id: Option<UserId>,
    pub description: DescriptionResult,
    pub original_size: usize,
    /// In the order of the pipeline's output specs
    pub outputs: [TranscodeResult; 2],
    /// Present only when quota accounting is active
    pub remaining_credits: Option<i64>,
}

impl RequestOutcome {
    pub fn output(&self, format: TargetFormat) -> Option<&TranscodeResult> {
        self.outputs.iter().find(|output| output.format == format)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no authenticated user")]
    Unauthenticated,

    #[error("insufficient credits")]
    InsufficientCredits,

    #[error("transcode failed: {0}")]
    TranscodeFailed(#[from] TranscodeError),

    #[error("processing did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("credit reservation failed: {0}")]
    Quota(QuotaError),
}

impl PipelineError {
    fn outcome(&self) -> &'static str {
        match self {
            PipelineError::Unauthenticated => "unauthenticated",
            PipelineError::InsufficientCredits => "insufficient_credits",
            PipelineError::TranscodeFailed(_) => "transcode_failed",
            PipelineError::TimedOut(_) => "timed_out",
            PipelineError::Quota(_) => "quota_error",
        }
    }
}

impl From<PipelineError> for Error {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Unauthenticated => Error::Unauthenticated { message: None },
            PipelineError::InsufficientCredits => Error::InsufficientCredits,
            PipelineError::TranscodeFailed(TranscodeError::InputTooLarge { limit, .. }) => Error::PayloadTooLarge { limit },
            PipelineError::TranscodeFailed(e) => Error::TranscodeFailed { reason: e.to_string() },
            PipelineError::TimedOut(timeout) => Error::Internal {
                operation: format!("finish optimisation within {timeout:?}"),
            },
            PipelineError::Quota(e) => Error::Internal {
                operation: format!("reserve credit: {e}"),
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Received,
    Authorizing,
    Processing,
    Finalizing,
    Succeeded,
    Failed,
}

fn enter(stage: Stage) {
    debug!(stage = ?stage, "pipeline stage");
}

#[derive(Clone, Builder)]
pub struct Pipeline {
    authenticator: Arc<dyn Authenticator>,
    /// None disables quota accounting: anonymous requests are served and nothing is charged
    ledger: Option<QuotaLedger>,
    transcoder: Arc<dyn Transcoder>,
    describer: Arc<dyn DescriptionGenerator>,
    specs: [EncodingSpec; 2],
    #[builder(default)]
    description: DescriptionSettings,
    #[builder(default = Duration::from_secs(60))]
    request_timeout: Duration,
}

impl Pipeline {
    pub fn ledger(&self) -> Option<&QuotaLedger> {
        self.ledger.as_ref()
    }

    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.authenticator
    }

    /// Run one optimisation end to end.
    pub async fn run(&self, headers: &HeaderMap, asset: ImageAsset) -> Result<RequestOutcome, PipelineError> {
        let request_id = Uuid::new_v4();
        let span = info_span!("optimize", request_id = %request_id, size = asset.size());

        let result = self.run_stages(request_id, headers, asset).instrument(span).await;
        match &result {
            Ok(_) => metrics::record_optimization("succeeded"),
            Err(e) => metrics::record_optimization(e.outcome()),
        }
        result
    }

    async fn run_stages(&self, request_id: RequestId, headers: &HeaderMap, asset: ImageAsset) -> Result<RequestOutcome, PipelineError> {
        enter(Stage::Received);

        enter(Stage::Authorizing);
        let user_id = self.identify(headers).await;
        let reservation = match (&self.ledger, user_id) {
            (None, _) => None,
            (Some(_), None) => {
                enter(Stage::Failed);
                return Err(PipelineError::Unauthenticated);
            }
            (Some(ledger), Some(user_id)) => match ledger.reserve(user_id, request_id).await {
                Ok(reservation) => Some(reservation),
                Err(QuotaError::InsufficientCredits) => {
                    info!(user_id = %abbrev_uuid(&user_id), "rejected: insufficient credits");
                    enter(Stage::Failed);
                    return Err(PipelineError::InsufficientCredits);
                }
                Err(e) => {
                    warn!(user_id = %abbrev_uuid(&user_id), error = %e, "credit reservation failed");
                    enter(Stage::Failed);
                    return Err(PipelineError::Quota(e));
                }
            },
        };

        enter(Stage::Processing);
        let processed = tokio::time::timeout(self.request_timeout, self.process(&asset)).await;

        enter(Stage::Finalizing);
        let (outputs, description) = match processed {
            Ok(Ok(processed)) => processed,
            Ok(Err(e)) => {
                warn!(error = %e, "transcode failed, credit not charged");
                self.release(request_id, reservation).await;
                enter(Stage::Failed);
                return Err(PipelineError::TranscodeFailed(e));
            }
            Err(_) => {
                warn!(timeout = ?self.request_timeout, "processing timed out, credit not charged");
                self.release(request_id, reservation).await;
                enter(Stage::Failed);
                return Err(PipelineError::TimedOut(self.request_timeout));
            }
        };

        let remaining_credits = match reservation {
            Some(reservation) => Some(self.commit(request_id, reservation).await),
            None => None,
        };

        enter(Stage::Succeeded);
        let source = if description.is_generated() { "generated" } else { "fallback" };
        info!(
            user_id = ?user_id.map(|id| abbrev_uuid(&id)),
            description = source,
            remaining_credits = ?remaining_credits,
            "optimisation complete"
        );

        Ok(RequestOutcome {
            request_id,
            user_id,
            description,
            original_size: asset.size(),
            outputs,
            remaining_credits,
        })
    }

    async fn identify(&self, headers: &HeaderMap) -> Option<UserId> {
        match self.authenticator.authenticate(headers).await {
            Ok(user_id) => user_id,
            Err(e) => {
                info!(error = %e, "credentials rejected");
                None
            }
        }
    }

    /// Decode once, then encode both outputs while the image is described. Waits for every
    /// branch to finish before deciding; a failure of either encode fails the request.
    async fn process(&self, asset: &ImageAsset) -> Result<([TranscodeResult; 2], DescriptionResult), TranscodeError> {
        let [first_spec, second_spec] = self.specs;

        let transcode = async {
            let source = self.transcoder.decode(asset.bytes.clone()).await?;
            let (first, second) = tokio::join!(
                self.transcoder.encode(source.clone(), first_spec),
                self.transcoder.encode(source, second_spec),
            );
            Ok::<_, TranscodeError>([first?, second?])
        };
        let describe = describe_with_fallback(self.describer.as_ref(), &asset.bytes, &asset.mime_type, &self.description);

        let (outputs, description) = tokio::join!(transcode, describe);
        Ok((outputs?, description))
    }

    /// Commit after success. Never fails the request: returns the best known balance and reports
    /// billing problems for reconciliation.
    async fn commit(&self, request_id: RequestId, reservation: Reservation) -> i64 {
        let user_id = reservation.user_id();
        let fallback = if reservation.is_charged() {
            reservation.snapshot() - 1
        } else {
            reservation.snapshot()
        };
        let Some(ledger) = &self.ledger else {
            return fallback;
        };

        match ledger.commit(reservation).await {
            Ok(remaining) => remaining,
            Err(e) => {
                ReconciliationEvent::new(ReconciliationKind::CommitFailed, user_id, Some(request_id), e.to_string()).emit();
                ledger.balance(user_id).await.unwrap_or(fallback).max(0)
            }
        }
    }

    async fn release(&self, request_id: RequestId, reservation: Option<Reservation>) {
        let (Some(ledger), Some(reservation)) = (&self.ledger, reservation) else {
            return;
        };
        let user_id = reservation.user_id();
        if let Err(e) = ledger.release(reservation).await {
            ReconciliationEvent::new(ReconciliationKind::RefundFailed, user_id, Some(request_id), e.to_string()).emit();
        }
    }
}
