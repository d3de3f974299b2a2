//! Service level objective attachment and classification.
//!
//! A request carries at most one [`SloConfig`], attached either by an
//! [`SloLayer`] on the route or by the handler itself through the
//! [`SloTracker`] extractor. The first attachment wins and is never changed.
//! The lifecycle layer reads it once, when the response is finalized, and
//! classifies the elapsed time as `PASS` (`elapsed <= target`) or `FAIL`.

use std::convert::Infallible;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{Extensions, HeaderName, Request};
use tower::{Layer, Service};

/// Response header carrying the classification.
pub const SLO_RESULT_HEADER: HeaderName = HeaderName::from_static("x-slo-result");

/// Latency tier with its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SloTier {
    /// 100ms
    Critical,
    /// 250ms
    High,
    /// 500ms
    Medium,
    /// 1s
    Low,
    Custom(Duration),
}

impl SloTier {
    pub fn target(&self) -> Duration {
        match self {
            SloTier::Critical => Duration::from_millis(100),
            SloTier::High => Duration::from_millis(250),
            SloTier::Medium => Duration::from_millis(500),
            SloTier::Low => Duration::from_secs(1),
            SloTier::Custom(target) => *target,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SloTier::Critical => "critical",
            SloTier::High => "high",
            SloTier::Medium => "medium",
            SloTier::Low => "low",
            SloTier::Custom(_) => "custom",
        }
    }
}

impl fmt::Display for SloTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The objective attached to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SloConfig {
    pub tier: SloTier,
    pub target: Duration,
}

impl From<SloTier> for SloConfig {
    fn from(tier: SloTier) -> Self {
        Self {
            tier,
            target: tier.target(),
        }
    }
}

/// Result of comparing elapsed time against the attached target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SloOutcome {
    pub config: SloConfig,
    pub elapsed: Duration,
    pub passed: bool,
}

impl SloOutcome {
    pub fn result(&self) -> &'static str {
        if self.passed { "PASS" } else { "FAIL" }
    }
}

/// Request-scoped, write-once SLO slot.
///
/// Clones share the slot. Extract it in a handler to attach an objective
/// that is not known at routing time.
#[derive(Debug, Clone, Default)]
pub struct SloTracker {
    slot: Arc<OnceLock<SloConfig>>,
}

impl SloTracker {
    /// Attach `tier`. Returns `false` if an objective was already attached.
    pub fn track(&self, tier: SloTier) -> bool {
        self.slot.set(SloConfig::from(tier)).is_ok()
    }

    pub fn track_with_custom_target(&self, target: Duration) -> bool {
        self.track(SloTier::Custom(target))
    }

    pub fn get(&self) -> Option<SloConfig> {
        self.slot.get().copied()
    }

    /// Classify `elapsed`, or `None` if nothing was attached.
    pub fn classify(&self, elapsed: Duration) -> Option<SloOutcome> {
        self.get().map(|config| SloOutcome {
            config,
            elapsed,
            passed: elapsed <= config.target,
        })
    }
}

/// The request's tracker, inserting an empty one if none is attached yet.
pub(crate) fn tracker(extensions: &mut Extensions) -> SloTracker {
    if let Some(tracker) = extensions.get::<SloTracker>() {
        return tracker.clone();
    }
    let tracker = SloTracker::default();
    extensions.insert(tracker.clone());
    tracker
}

/// Attach `tier` to the request owning `extensions`.
pub fn track(extensions: &mut Extensions, tier: SloTier) -> bool {
    tracker(extensions).track(tier)
}

pub fn track_with_custom_target(extensions: &mut Extensions, target: Duration) -> bool {
    tracker(extensions).track_with_custom_target(target)
}

/// The objective attached to the request owning `extensions`, if any.
pub fn get(extensions: &Extensions) -> Option<SloConfig> {
    extensions.get::<SloTracker>().and_then(SloTracker::get)
}

impl<S> FromRequestParts<S> for SloTracker
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(tracker(&mut parts.extensions))
    }
}

/// Attach one tier to every request routed through this layer.
#[derive(Debug, Clone, Copy)]
pub struct SloLayer {
    tier: SloTier,
}

impl SloLayer {
    pub fn new(tier: SloTier) -> Self {
        Self { tier }
    }
}

impl<S> Layer<S> for SloLayer {
    type Service = SloService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SloService {
            inner,
            tier: self.tier,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SloService<S> {
    inner: S,
    tier: SloTier,
}

impl<S, B> Service<Request<B>> for SloService<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        track(req.extensions_mut(), self.tier);
        self.inner.call(req)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Body;
    use axum::routing;
    use tower::ServiceExt;

    #[test]
    fn test_tier_targets() {
        assert_eq!(SloTier::Critical.target(), Duration::from_millis(100));
        assert_eq!(SloTier::High.target(), Duration::from_millis(250));
        assert_eq!(SloTier::Medium.target(), Duration::from_millis(500));
        assert_eq!(SloTier::Low.target(), Duration::from_secs(1));
        assert_eq!(
            SloTier::Custom(Duration::from_millis(42)).target(),
            Duration::from_millis(42)
        );
    }

    #[test]
    fn test_first_attachment_wins() {
        let tracker = SloTracker::default();
        assert!(tracker.get().is_none());
        assert!(tracker.track(SloTier::High));
        assert!(!tracker.track_with_custom_target(Duration::from_secs(9)));
        assert_eq!(tracker.get().unwrap().tier, SloTier::High);
    }

    #[test]
    fn test_classify_boundary_passes() {
        let tracker = SloTracker::default();
        assert!(tracker.classify(Duration::ZERO).is_none());

        tracker.track(SloTier::Critical);
        let at_target = tracker.classify(Duration::from_millis(100)).unwrap();
        assert!(at_target.passed);
        assert_eq!(at_target.result(), "PASS");

        let over = tracker.classify(Duration::from_millis(101)).unwrap();
        assert_eq!(over.result(), "FAIL");
    }

    #[test]
    fn test_free_functions_share_extension_slot() {
        let mut extensions = Extensions::new();
        assert!(get(&extensions).is_none());

        assert!(track_with_custom_target(
            &mut extensions,
            Duration::from_millis(30)
        ));
        assert!(!track(&mut extensions, SloTier::Low));

        let config = get(&extensions).unwrap();
        assert_eq!(config.tier.as_str(), "custom");
        assert_eq!(config.target, Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_layer_attaches_before_handler() {
        let app = Router::new().route(
            "/",
            routing::get(|tracker: SloTracker| async move {
                tracker.get().map(|c| c.tier.to_string()).unwrap_or_default()
            })
            .layer(SloLayer::new(SloTier::Medium)),
        );

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"medium");
    }
}
