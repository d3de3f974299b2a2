//! Fixed-window rate limiting over a pluggable [`CounterStore`].
//!
//! # Algorithm
//!
//! 1. Compose a key from the limiter name and every dimension's value,
//!    joined with `:`. Blank optional values are skipped. A blank *required*
//!    value short-circuits with [`LimitRejection::MissingDimension`] before
//!    the store is touched.
//! 2. If no dimension produced a value, the request is not limited.
//! 3. Increment the key in the store. A store failure is
//!    [`LimitRejection::Store`], never "not limited".
//! 4. `remaining = max(0, limit - count)`; the request is rejected when
//!    `count > limit`, so exactly `limit` requests pass per window.
//!
//! # Response Headers
//!
//! Governed by [`HeaderMode`]:
//! - `RateLimit-Limit`: configured limit
//! - `RateLimit-Remaining`: requests left in the current window
//! - `RateLimit-Reset`: Unix timestamp (seconds) at which the window resets
//! - `Retry-After`: seconds until reset, only on rejection
//!
//! # Stacking
//!
//! Limiters with distinct names keep independent counters, so several
//! [`RateLimitLayer`]s may wrap the same route: any of them can reject, and
//! each one still counted the request.
//!
//! # Example
//!
//! ```rust,ignore
//! let limiter = RateLimiter::new(store, 100, Duration::from_secs(60), vec![
//!     Dimension::client_ip(TrustedProxyConfig::default()),
//!     Dimension::endpoint(),
//! ])?
//! .with_name("per-ip");
//!
//! let app = Router::new()
//!     .route("/api", get(handler))
//!     .layer(RateLimitLayer::new(limiter));
//! ```

mod dimension;

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Response};
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tower::{Layer, Service};
use tracing::{debug, error, warn};

pub use dimension::{Dimension, RequestView};

use crate::error::ApiError;
use crate::metrics;
use crate::middleware::response::ResponseState;
use crate::store::{CounterStore, Increment, StoreError};

pub const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
pub const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
pub const RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");

/// Error type for rate limiter construction.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("at least one rate limit dimension must be configured")]
    NoDimensions,
    #[error("rate limit must be greater than 0")]
    ZeroLimit,
    #[error("rate limit window must be non-zero")]
    ZeroWindow,
}

/// Per-request reasons a limiter could not reach a decision.
#[derive(Error, Debug)]
pub enum LimitRejection {
    #[error("missing required rate limit dimension `{label}`")]
    MissingDimension { label: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LimitRejection {
    /// Client-facing error: 400 naming the dimension, or 500 for the store.
    pub fn to_api_error(&self) -> ApiError {
        match self {
            LimitRejection::MissingDimension { label } => ApiError::MISSING_DIMENSION
                .with_message(format!("Missing required value for rate limiting: {label}"))
                .with_param(label.clone()),
            LimitRejection::Store(_) => ApiError::INTERNAL,
        }
    }
}

/// When rate limit headers are attached to responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderMode {
    #[default]
    Always,
    OnLimitExceeded,
    Never,
}

impl FromStr for HeaderMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(HeaderMode::Always),
            "on_limit_exceeded" | "on-limit-exceeded" => Ok(HeaderMode::OnLimitExceeded),
            "never" => Ok(HeaderMode::Never),
            other => Err(format!(
                "unknown header mode `{other}` (expected always, on_limit_exceeded or never)"
            )),
        }
    }
}

/// Counter state after one increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub limit: u64,
    pub count: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    /// Time until the window resets.
    pub reset_after: Duration,
}

impl Quota {
    fn new(limit: u64, increment: Increment) -> Self {
        let reset_after = increment.ttl;
        let reset_at = chrono::Duration::from_std(reset_after)
            .ok()
            .and_then(|delta| Utc::now().checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            limit,
            count: increment.count,
            remaining: limit.saturating_sub(increment.count),
            reset_at,
            reset_after,
        }
    }

    /// Whole seconds until reset, rounded up, at least 1.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.reset_after.as_secs();
        let rounded = if self.reset_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        };
        rounded.max(1)
    }
}

/// Outcome of [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// No dimension produced a value; the request is not counted.
    Unlimited,
    Allowed(Quota),
    Exceeded(Quota),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Decision::Exceeded(_))
    }

    pub fn quota(&self) -> Option<&Quota> {
        match self {
            Decision::Unlimited => None,
            Decision::Allowed(quota) | Decision::Exceeded(quota) => Some(quota),
        }
    }

    /// Headers to attach under `mode`.
    pub fn headers(&self, mode: HeaderMode) -> HeaderMap {
        let mut headers = HeaderMap::new();

        let (quota, exceeded) = match self {
            Decision::Unlimited => return headers,
            Decision::Allowed(quota) => (quota, false),
            Decision::Exceeded(quota) => (quota, true),
        };

        let visible = match mode {
            HeaderMode::Always => true,
            HeaderMode::OnLimitExceeded => exceeded,
            HeaderMode::Never => false,
        };
        if !visible {
            return headers;
        }

        headers.insert(RATELIMIT_LIMIT, HeaderValue::from(quota.limit));
        headers.insert(RATELIMIT_REMAINING, HeaderValue::from(quota.remaining));
        headers.insert(RATELIMIT_RESET, HeaderValue::from(quota.reset_at.timestamp()));
        if exceeded {
            headers.insert(RETRY_AFTER, HeaderValue::from(quota.retry_after_secs()));
        }

        headers
    }
}

/// Fixed-window limiter keyed by an ordered list of dimensions.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    name: Option<String>,
    limit: u64,
    window: Duration,
    dimensions: Vec<Dimension>,
    header_mode: HeaderMode,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("limit", &self.limit)
            .field("window", &self.window)
            .field("dimensions", &self.dimensions)
            .field("header_mode", &self.header_mode)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a limiter allowing `limit` requests per `window` per key.
    ///
    /// # Errors
    ///
    /// - [`RateLimitError::NoDimensions`] if `dimensions` is empty
    /// - [`RateLimitError::ZeroLimit`] if `limit` is 0
    /// - [`RateLimitError::ZeroWindow`] if `window` is zero
    pub fn new(
        store: Arc<dyn CounterStore>,
        limit: u64,
        window: Duration,
        dimensions: Vec<Dimension>,
    ) -> Result<Self, RateLimitError> {
        if dimensions.is_empty() {
            return Err(RateLimitError::NoDimensions);
        }
        if limit == 0 {
            return Err(RateLimitError::ZeroLimit);
        }
        if window.is_zero() {
            return Err(RateLimitError::ZeroWindow);
        }

        Ok(Self {
            store,
            name: None,
            limit,
            window,
            dimensions,
            header_mode: HeaderMode::default(),
        })
    }

    /// Prefix every key with `name`, isolating this limiter's counters.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into()).filter(|name| !name.is_empty());
        self
    }

    pub fn with_header_mode(mut self, header_mode: HeaderMode) -> Self {
        self.header_mode = header_mode;
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn header_mode(&self) -> HeaderMode {
        self.header_mode
    }

    /// Compose the counter key. `Ok(None)` means nothing to limit on.
    pub fn compose_key(&self, view: &RequestView<'_>) -> Result<Option<String>, LimitRejection> {
        let mut parts = Vec::with_capacity(self.dimensions.len());

        for dimension in &self.dimensions {
            match dimension.extract(view) {
                Some(value) => parts.push(value),
                None if dimension.is_required() => {
                    return Err(LimitRejection::MissingDimension {
                        label: dimension.label().to_string(),
                    });
                }
                None => {}
            }
        }

        if parts.is_empty() {
            return Ok(None);
        }

        let body = parts.join(":");
        Ok(Some(match &self.name {
            Some(name) => format!("{name}:{body}"),
            None => body,
        }))
    }

    /// Count an already-composed key.
    pub async fn check_key(&self, key: Option<&str>) -> Result<Decision, LimitRejection> {
        let Some(key) = key else {
            return Ok(Decision::Unlimited);
        };

        let increment = self.store.increment(key, self.window).await?;
        let quota = Quota::new(self.limit, increment);

        if increment.count > self.limit {
            Ok(Decision::Exceeded(quota))
        } else {
            Ok(Decision::Allowed(quota))
        }
    }

    /// Compose the key for `view` and count it.
    pub async fn check(&self, view: &RequestView<'_>) -> Result<Decision, LimitRejection> {
        let key = self.compose_key(view)?;
        self.check_key(key.as_deref()).await
    }

    /// Handler-level limiting through a [`ResponseState`].
    ///
    /// Writes the rate limit headers (per [`HeaderMode`]) into `state`, and
    /// on rejection the matching error. Returns `true` if the handler may
    /// proceed.
    pub async fn apply(&self, view: &RequestView<'_>, state: &ResponseState) -> bool {
        let result = self.check(view).await;
        self.record(&result);

        match result {
            Ok(decision) => {
                state.extend_headers(decision.headers(self.header_mode));
                if decision.is_allowed() {
                    true
                } else {
                    state.set_error(ApiError::RATE_LIMITED);
                    false
                }
            }
            Err(rejection) => {
                state.set_error(rejection.to_api_error());
                false
            }
        }
    }

    fn record(&self, result: &Result<Decision, LimitRejection>) {
        let limiter = self.name.as_deref().unwrap_or("default");
        let outcome = match result {
            Ok(Decision::Unlimited) => "unlimited",
            Ok(Decision::Allowed(_)) => "allowed",
            Ok(Decision::Exceeded(quota)) => {
                warn!(
                    limiter = limiter,
                    count = quota.count,
                    limit = quota.limit,
                    retry_after_secs = quota.retry_after_secs(),
                    "Rate limit exceeded"
                );
                "exceeded"
            }
            Err(LimitRejection::MissingDimension { label }) => {
                debug!(limiter = limiter, dimension = %label, "Missing required rate limit dimension");
                "missing_dimension"
            }
            Err(LimitRejection::Store(e)) => {
                error!(limiter = limiter, error = %e, "Rate limit counter store failed");
                "store_error"
            }
        };
        metrics::record_rate_limit_decision(limiter, outcome);
    }
}

/// Rate limiting layer for Tower middleware stack.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
}

impl RateLimitLayer {
    pub fn new(limiter: RateLimiter) -> Self {
        Self::from_shared(Arc::new(limiter))
    }

    /// Share one limiter between the layer and handler-level callers.
    pub fn from_shared(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

/// Rate limiting service wrapper.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let limiter = self.limiter.clone();
        let mut inner = self.inner.clone();

        // Compose before moving the request into the future
        let key = limiter.compose_key(&RequestView::from(&req));

        Box::pin(async move {
            let result = match key {
                Ok(key) => limiter.check_key(key.as_deref()).await,
                Err(rejection) => Err(rejection),
            };
            limiter.record(&result);

            match result {
                Ok(Decision::Unlimited) => inner.call(req).await,
                Ok(decision @ Decision::Allowed(_)) => {
                    let mut response = inner.call(req).await?;
                    response
                        .headers_mut()
                        .extend(decision.headers(limiter.header_mode));
                    Ok(response)
                }
                Ok(decision @ Decision::Exceeded(_)) => {
                    let mut response = ApiError::RATE_LIMITED.into_response();
                    response
                        .headers_mut()
                        .extend(decision.headers(limiter.header_mode));
                    Ok(response)
                }
                Err(rejection) => Ok(rejection.to_api_error().into_response()),
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;
    use tower::ServiceExt;

    use crate::middleware::ip::TrustedProxyConfig;
    use crate::store::MemoryStore;

    /// Store that fails every call and counts how often it was asked.
    #[derive(Default)]
    struct FailingStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CounterStore for FailingStore {
        async fn increment(&self, _: &str, _: Duration) -> Result<Increment, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Backend("connection refused".into()))
        }
        async fn get(&self, _: &str) -> Result<u64, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Backend("connection refused".into()))
        }
        async fn reset(&self, _: &str) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Backend("connection refused".into()))
        }
        async fn close(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn ip_limiter(limit: u64) -> RateLimiter {
        RateLimiter::new(
            Arc::new(MemoryStore::new()),
            limit,
            Duration::from_secs(60),
            vec![Dimension::client_ip(TrustedProxyConfig::default())],
        )
        .unwrap()
    }

    fn from_ip(ip: &str) -> Request<Body> {
        Request::builder()
            .uri("/")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_zero_dimensions_rejected_at_construction() {
        let result = RateLimiter::new(
            Arc::new(FailingStore::default()),
            10,
            Duration::from_secs(1),
            vec![],
        );
        assert!(matches!(result, Err(RateLimitError::NoDimensions)));
    }

    #[test]
    fn test_zero_limit_and_window_rejected() {
        let store: Arc<dyn CounterStore> = Arc::new(FailingStore::default());
        let dims = || vec![Dimension::endpoint()];

        assert!(matches!(
            RateLimiter::new(store.clone(), 0, Duration::from_secs(1), dims()),
            Err(RateLimitError::ZeroLimit)
        ));
        assert!(matches!(
            RateLimiter::new(store, 1, Duration::ZERO, dims()),
            Err(RateLimitError::ZeroWindow)
        ));
    }

    #[test]
    fn test_construction_error_messages() {
        assert_eq!(
            RateLimitError::NoDimensions.to_string(),
            "at least one rate limit dimension must be configured"
        );
        assert_eq!(
            RateLimitError::ZeroLimit.to_string(),
            "rate limit must be greater than 0"
        );
        let err: Box<dyn std::error::Error> = Box::new(RateLimitError::ZeroWindow);
        assert_eq!(err.to_string(), "rate limit window must be non-zero");
    }

    #[tokio::test]
    async fn test_unrepresentable_window_is_allowed() {
        let limiter = RateLimiter::new(
            Arc::new(MemoryStore::new()),
            2,
            Duration::from_secs(u64::MAX / 2),
            vec![Dimension::endpoint()],
        )
        .unwrap();
        let req = from_ip("203.0.113.9");
        let view = RequestView::from(&req);

        let decision = limiter.check(&view).await.unwrap();
        let Decision::Allowed(quota) = decision else {
            panic!("expected allowed, got {decision:?}");
        };
        assert_eq!(quota.remaining, 1);
        assert!(quota.reset_at > Utc::now());
        assert!(decision.headers(HeaderMode::Always).contains_key(RATELIMIT_RESET));
    }

    #[tokio::test]
    async fn test_two_per_minute_scenario() {
        let limiter = ip_limiter(2);
        let req = from_ip("203.0.113.5");
        let view = RequestView::from(&req);

        let first = limiter.check(&view).await.unwrap();
        assert!(matches!(first, Decision::Allowed(q) if q.remaining == 1));

        let second = limiter.check(&view).await.unwrap();
        assert!(matches!(second, Decision::Allowed(q) if q.remaining == 0));

        let third = limiter.check(&view).await.unwrap();
        let Decision::Exceeded(quota) = third else {
            panic!("expected rejection, got {third:?}");
        };
        assert_eq!(quota.remaining, 0);
        assert!(quota.retry_after_secs() > 0);
        assert!(third.headers(HeaderMode::Always).contains_key(RETRY_AFTER));
    }

    #[test]
    fn test_compose_key_with_name_and_skipped_optional() {
        let limiter = RateLimiter::new(
            Arc::new(FailingStore::default()),
            1,
            Duration::from_secs(1),
            vec![
                Dimension::header("x-tenant-id"),
                Dimension::header("x-user-id"),
                Dimension::endpoint(),
            ],
        )
        .unwrap()
        .with_name("api");

        let req = Request::builder()
            .uri("/orders")
            .header("x-user-id", "u1")
            .body(Body::empty())
            .unwrap();

        let key = limiter.compose_key(&RequestView::from(&req)).unwrap();
        assert_eq!(key.as_deref(), Some("api:u1:GET /orders"));
    }

    #[tokio::test]
    async fn test_all_optional_empty_skips_limiting() {
        let store = Arc::new(FailingStore::default());
        let limiter = RateLimiter::new(
            store.clone(),
            1,
            Duration::from_secs(1),
            vec![Dimension::header("x-api-key")],
        )
        .unwrap()
        .with_name("keyed");

        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let decision = limiter.check(&RequestView::from(&req)).await.unwrap();

        assert_eq!(decision, Decision::Unlimited);
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_required_dimension_never_touches_store() {
        let store = Arc::new(FailingStore::default());
        let limiter = RateLimiter::new(
            store.clone(),
            5,
            Duration::from_secs(60),
            vec![
                Dimension::endpoint(),
                Dimension::required_header("x-tenant-id"),
            ],
        )
        .unwrap();

        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let err = limiter.check(&RequestView::from(&req)).await.unwrap_err();

        assert!(matches!(&err, LimitRejection::MissingDimension { label } if label == "x-tenant-id"));
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);

        let api = err.to_api_error();
        assert_eq!(api.status, StatusCode::BAD_REQUEST);
        assert_eq!(api.param.as_deref(), Some("x-tenant-id"));
    }

    #[tokio::test]
    async fn test_store_error_is_not_treated_as_allowed() {
        let limiter = RateLimiter::new(
            Arc::new(FailingStore::default()),
            5,
            Duration::from_secs(60),
            vec![Dimension::endpoint()],
        )
        .unwrap();

        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let err = limiter.check(&RequestView::from(&req)).await.unwrap_err();

        assert!(matches!(err, LimitRejection::Store(_)));
        assert_eq!(err.to_api_error().status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_exact_limit_under_concurrency() {
        for _ in 0..5 {
            let limiter = Arc::new(ip_limiter(50));

            let handles: Vec<_> = (0..200)
                .map(|_| {
                    let limiter = limiter.clone();
                    tokio::spawn(async move {
                        let req = from_ip("198.51.100.1");
                        limiter
                            .check(&RequestView::from(&req))
                            .await
                            .unwrap()
                            .is_allowed()
                    })
                })
                .collect();

            let mut allowed = 0;
            for handle in handles {
                if handle.await.unwrap() {
                    allowed += 1;
                }
            }
            assert_eq!(allowed, 50);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_keys_isolated_under_concurrency() {
        let limiter = Arc::new(ip_limiter(10));

        let handles: Vec<_> = (0..60)
            .map(|i| {
                let limiter = limiter.clone();
                let ip = if i % 2 == 0 { "10.0.0.1" } else { "10.0.0.2" };
                tokio::spawn(async move {
                    let req = from_ip(ip);
                    let allowed = limiter
                        .check(&RequestView::from(&req))
                        .await
                        .unwrap()
                        .is_allowed();
                    (ip, allowed)
                })
            })
            .collect();

        let mut per_ip = HashMap::new();
        for handle in handles {
            let (ip, allowed) = handle.await.unwrap();
            if allowed {
                *per_ip.entry(ip).or_insert(0) += 1;
            }
        }
        assert_eq!(per_ip.get("10.0.0.1"), Some(&10));
        assert_eq!(per_ip.get("10.0.0.2"), Some(&10));
    }

    #[test]
    fn test_header_modes() {
        let quota = Quota::new(
            5,
            Increment {
                count: 6,
                ttl: Duration::from_millis(1500),
            },
        );
        let allowed = Decision::Allowed(Quota { count: 1, remaining: 4, ..quota });
        let exceeded = Decision::Exceeded(quota);

        let headers = allowed.headers(HeaderMode::Always);
        assert_eq!(headers[RATELIMIT_LIMIT], "5");
        assert_eq!(headers[RATELIMIT_REMAINING], "4");
        assert!(headers.contains_key(RATELIMIT_RESET));
        assert!(!headers.contains_key(RETRY_AFTER));

        assert!(allowed.headers(HeaderMode::OnLimitExceeded).is_empty());
        let on_exceeded = exceeded.headers(HeaderMode::OnLimitExceeded);
        assert_eq!(on_exceeded[RETRY_AFTER], "2");
        assert_eq!(on_exceeded[RATELIMIT_REMAINING], "0");

        assert!(exceeded.headers(HeaderMode::Never).is_empty());
        assert!(Decision::Unlimited.headers(HeaderMode::Always).is_empty());
    }

    #[test]
    fn test_header_mode_from_str() {
        assert_eq!("always".parse::<HeaderMode>(), Ok(HeaderMode::Always));
        assert_eq!(
            "ON_LIMIT_EXCEEDED".parse::<HeaderMode>(),
            Ok(HeaderMode::OnLimitExceeded)
        );
        assert_eq!("never".parse::<HeaderMode>(), Ok(HeaderMode::Never));
        assert!("sometimes".parse::<HeaderMode>().is_err());
    }

    #[tokio::test]
    async fn test_apply_writes_into_response_state() {
        let limiter = ip_limiter(1);
        let req = from_ip("192.0.2.1");
        let view = RequestView::from(&req);

        let state = ResponseState::new();
        assert!(limiter.apply(&view, &state).await);
        assert!(state.error().is_none());

        let state = ResponseState::new();
        assert!(!limiter.apply(&view, &state).await);
        assert!(state.error().unwrap().is(&ApiError::RATE_LIMITED));
        assert!(state.headers().contains_key(RETRY_AFTER));
    }

    #[tokio::test]
    async fn test_layer_rejects_with_envelope_and_headers() {
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(RateLimitLayer::new(ip_limiter(1)));

        let ok = app.clone().oneshot(from_ip("192.0.2.9")).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(ok.headers()[RATELIMIT_REMAINING], "0");

        let rejected = app.oneshot(from_ip("192.0.2.9")).await.unwrap();
        assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(rejected.headers().contains_key(RETRY_AFTER));

        let bytes = axum::body::to_bytes(rejected.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], "rate_limit_exceeded");
    }

    #[tokio::test]
    async fn test_layer_store_failure_is_server_error() {
        let limiter = RateLimiter::new(
            Arc::new(FailingStore::default()),
            5,
            Duration::from_secs(60),
            vec![Dimension::endpoint()],
        )
        .unwrap();
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(RateLimitLayer::new(limiter));

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
