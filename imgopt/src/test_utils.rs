//! Fixtures and test doubles shared by unit and HTTP tests.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use axum_test::TestServer;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::json;

use crate::auth::{AuthError, Authenticator, session::create_session_token};
use crate::config::{Config, DescriptionConfig, TranscodeConfig};
use crate::describe::{DescriptionError, DescriptionGenerator, DescriptionSettings};
use crate::limits::Limiters;
use crate::pipeline::Pipeline;
use crate::quota::{CreditStore, InMemoryCreditStore, QuotaLedger, StoreError};
use crate::transcode::{
    EncodingSpec, ImageTranscoder, SourceImage, TargetFormat, TranscodeError, TranscodeResult, Transcoder,
};
use crate::types::UserId;
use crate::{AppState, build_router};

pub const TEST_SECRET: &str = "test-secret-key-for-testing-only";

/// Smooth gradient with a little deterministic texture, so encoders have something to work with.
fn test_pattern(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let grain = ((x.wrapping_mul(31) ^ y.wrapping_mul(17)) & 0x0f) as u8;
        Rgb([
            ((x * 255 / width.max(1)) as u8).saturating_add(grain),
            ((y * 255 / height.max(1)) as u8).saturating_add(grain),
            (((x + y) / 8) % 256) as u8,
        ])
    })
}

pub fn jpeg_fixture(width: u32, height: u32) -> Bytes {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, 95)
        .encode_image(&test_pattern(width, height))
        .expect("fixture JPEG encodes");
    Bytes::from(buffer)
}

pub fn png_fixture(width: u32, height: u32) -> Bytes {
    let mut cursor = Cursor::new(Vec::new());
    test_pattern(width, height)
        .write_to(&mut cursor, ImageFormat::Png)
        .expect("fixture PNG encodes");
    Bytes::from(cursor.into_inner())
}

pub fn test_transcode_config() -> TranscodeConfig {
    TranscodeConfig::default()
}

pub fn test_description_config() -> DescriptionConfig {
    DescriptionConfig {
        timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

/// The description client is built on rustls without a bundled provider.
pub fn install_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

/// A chat completion response body as an OpenAI-compatible server returns it.
pub fn chat_completion_body(content: Option<&str>) -> serde_json::Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "created": 1_700_000_000,
        "model": "gpt-4o",
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": content,
                "refusal": null
            },
            "finish_reason": "stop",
            "logprobs": null
        }],
        "usage": {
            "prompt_tokens": 812,
            "completion_tokens": 14,
            "total_tokens": 826
        }
    })
}

/// Real transcoder that counts how often it is asked to work.
pub struct CountingTranscoder {
    inner: ImageTranscoder,
    failing_format: Option<TargetFormat>,
    pub decodes: AtomicUsize,
    pub encodes: AtomicUsize,
}

impl CountingTranscoder {
    pub fn new(config: &TranscodeConfig) -> Self {
        Self {
            inner: ImageTranscoder::new(config),
            failing_format: None,
            decodes: AtomicUsize::new(0),
            encodes: AtomicUsize::new(0),
        }
    }

    /// Make every encode to `format` fail while the other format still succeeds.
    pub fn failing_on(mut self, format: TargetFormat) -> Self {
        self.failing_format = Some(format);
        self
    }
}

#[async_trait]
impl Transcoder for CountingTranscoder {
    async fn decode(&self, bytes: Bytes) -> Result<Arc<SourceImage>, TranscodeError> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        self.inner.decode(bytes).await
    }

    async fn encode(&self, source: Arc<SourceImage>, spec: EncodingSpec) -> Result<TranscodeResult, TranscodeError> {
        self.encodes.fetch_add(1, Ordering::SeqCst);
        if self.failing_format == Some(spec.format) {
            return Err(TranscodeError::Encode {
                format: spec.format,
                message: "encoder rejected frame".to_string(),
            });
        }
        self.inner.encode(source, spec).await
    }
}

/// Serves reads from memory but fails every balance update.
pub struct ReadOnlyCreditStore {
    inner: InMemoryCreditStore,
}

impl ReadOnlyCreditStore {
    pub fn with_balances(balances: impl IntoIterator<Item = (UserId, i64)>) -> Self {
        Self {
            inner: InMemoryCreditStore::with_balances(balances),
        }
    }
}

#[async_trait]
impl CreditStore for ReadOnlyCreditStore {
    async fn open_account(&self, user_id: UserId, initial: i64) -> Result<i64, StoreError> {
        self.inner.open_account(user_id, initial).await
    }

    async fn balance(&self, user_id: UserId) -> Result<Option<i64>, StoreError> {
        self.inner.balance(user_id).await
    }

    async fn compare_and_swap(&self, _user_id: UserId, _expected: i64, _new: i64) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("primary is read-only".to_string()))
    }
}

/// Identifies every request as the same user.
pub struct StaticAuthenticator {
    user: Option<UserId>,
}

impl StaticAuthenticator {
    pub fn user(user: UserId) -> Self {
        Self { user: Some(user) }
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, _headers: &HeaderMap) -> Result<Option<UserId>, AuthError> {
        Ok(self.user)
    }
}

pub struct FixedDescriber {
    text: String,
    /// Completed calls
    pub calls: AtomicUsize,
}

impl FixedDescriber {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DescriptionGenerator for FixedDescriber {
    async fn describe(&self, _image: &[u8], _mime_type: &str) -> Result<String, DescriptionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.text.clone())
    }
}

pub struct FailingDescriber {
    error: Box<dyn Fn() -> DescriptionError + Send + Sync>,
}

impl FailingDescriber {
    pub fn new(error: impl Fn() -> DescriptionError + Send + Sync + 'static) -> Self {
        Self { error: Box::new(error) }
    }
}

#[async_trait]
impl DescriptionGenerator for FailingDescriber {
    async fn describe(&self, _image: &[u8], _mime_type: &str) -> Result<String, DescriptionError> {
        Err((self.error)())
    }
}

pub struct SlowDescriber {
    delay: Duration,
}

impl SlowDescriber {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl DescriptionGenerator for SlowDescriber {
    async fn describe(&self, _image: &[u8], _mime_type: &str) -> Result<String, DescriptionError> {
        tokio::time::sleep(self.delay).await;
        Ok("A description that arrived too late.".to_string())
    }
}

pub fn create_test_config() -> Config {
    let mut config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        secret_key: Some(TEST_SECRET.to_string()),
        enable_metrics: true,
        ..Default::default()
    };
    config.description = test_description_config();
    config
}

/// `Authorization` header value carrying a fresh session token for `user`.
pub fn bearer_for(user: UserId) -> String {
    let token = create_session_token(user, TEST_SECRET, Duration::from_secs(3600)).expect("test token is created");
    format!("Bearer {token}")
}

/// HTTP server over the real router, with an in-memory store and counting transcoder exposed.
pub struct TestApp {
    pub server: TestServer,
    pub store: Arc<InMemoryCreditStore>,
    pub transcoder: Arc<CountingTranscoder>,
    pub config: Config,
}

pub fn create_test_app(describer: Arc<dyn DescriptionGenerator>) -> TestApp {
    create_test_app_with_config(create_test_config(), describer)
}

/// Builds the app the way [`crate::Application::new`] does, swapping in test collaborators.
pub fn create_test_app_with_config(config: Config, describer: Arc<dyn DescriptionGenerator>) -> TestApp {
    let store = Arc::new(InMemoryCreditStore::default());
    let transcoder = Arc::new(CountingTranscoder::new(&config.transcode));

    let ledger = config.quota.enabled.then(|| {
        QuotaLedger::new(
            store.clone(),
            config.quota.charge_policy,
            config.quota.max_retries,
            config.quota.initial_credits,
        )
    });
    let pipeline = Pipeline::builder()
        .authenticator(crate::auth::from_config(&config).expect("test auth config is valid"))
        .maybe_ledger(ledger)
        .transcoder(transcoder.clone())
        .describer(describer)
        .specs(config.transcode.specs())
        .description(DescriptionSettings::from(&config.description))
        .request_timeout(config.request_timeout)
        .build();

    let state = AppState::builder()
        .config(config.clone())
        .pipeline(Arc::new(pipeline))
        .limiters(Limiters::new(&config.limits))
        .build();
    let router = build_router(&state).expect("test router builds");

    TestApp {
        server: TestServer::new(router).expect("Failed to create test server"),
        store,
        transcoder,
        config,
    }
}
