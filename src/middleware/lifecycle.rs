//! Request lifecycle controller: timeouts, panic recovery, abandonment and
//! drain.
//!
//! Every request moves through `Running → {Completed | TimedOut} → Finalized`
//! and is finalized exactly once through its [`ResponseState`].
//!
//! # Modes
//!
//! **No timeout** (`budget = None`): the inner service runs on the request's
//! own task. A panic is caught and becomes [`ApiError::INTERNAL`].
//!
//! **Deadline** (`budget = Some(T)`): the inner service runs on its own
//! spawned task, holding a [`RequestDeadline`] whose token is a child of any
//! deadline already on the request. The controller races handler completion
//! against the deadline:
//!
//! - Completion first: the handler's outcome (or its panic, as
//!   [`ApiError::INTERNAL`]) is finalized.
//! - Deadline first: the token is cancelled and [`ApiError::TIMEOUT`] is
//!   finalized immediately. A detached watcher then gives the handler up to
//!   `grace` to finish; past that the request is [`Abandoned`] and the
//!   abandonment callback fires once. The handler task is never aborted.
//!
//! Deadline-mode handler tasks are counted by an [`InFlightTracker`] until
//! they exit, so shutdown can [`InFlightTracker::drain`] them.
//!
//! # Example
//!
//! ```rust,ignore
//! let app = Router::new()
//!     .route("/slow", get(slow))
//!     .layer(
//!         LifecycleLayer::new(TimeoutPolicy::with_budget(Duration::from_secs(2)))
//!             .on_abandon(|abandoned| warn!(path = %abandoned.path, "abandoned")),
//!     );
//!
//! // On shutdown
//! InFlightTracker::global().drain(Duration::from_secs(30)).await?;
//! ```

use std::any::Any;
use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::extract::OptionalFromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderValue, Method, Request, Response};
use axum::response::IntoResponse;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, sleep_until, timeout, timeout_at};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tower::{Layer, Service};
use tracing::{debug, error, info, warn};

use crate::error::ApiError;
use crate::metrics;
use crate::middleware::response::ResponseState;
use crate::middleware::slo::{self, SLO_RESULT_HEADER};

/// Default grace period after a timeout before a handler is abandoned.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// How long a request may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    /// `None` runs handlers inline without a deadline.
    pub budget: Option<Duration>,
    pub grace: Duration,
    /// Classify requests against their attached SLO at finalization.
    pub slo_enabled: bool,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            budget: None,
            grace: DEFAULT_GRACE,
            slo_enabled: true,
        }
    }
}

impl TimeoutPolicy {
    pub fn with_budget(budget: Duration) -> Self {
        Self {
            budget: Some(budget),
            ..Self::default()
        }
    }

    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn slo_enabled(mut self, enabled: bool) -> Self {
        self.slo_enabled = enabled;
        self
    }
}

/// The request's deadline and its cancellation scope.
///
/// Inserted into request extensions in deadline mode. Handlers should stop
/// work once the token is cancelled; nothing stops them forcibly.
#[derive(Debug, Clone)]
pub struct RequestDeadline {
    deadline: Instant,
    token: CancellationToken,
}

impl RequestDeadline {
    pub fn new(deadline: Instant, token: CancellationToken) -> Self {
        Self { deadline, token }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the request times out or an enclosing scope is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Child scope expiring at the earlier of `self.deadline` and `deadline`.
    fn child(&self, deadline: Instant) -> Self {
        Self {
            deadline: self.deadline.min(deadline),
            token: self.token.child_token(),
        }
    }
}

impl<S> OptionalFromRequestParts<S> for RequestDeadline
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Option<Self>, Self::Rejection> {
        Ok(parts.extensions.get::<RequestDeadline>().cloned())
    }
}

/// A handler that outlived its timeout and grace period.
#[derive(Debug, Clone)]
pub struct Abandoned {
    pub method: Method,
    pub path: String,
    /// Time since the request entered the controller.
    pub elapsed: Duration,
}

type AbandonCallback = Arc<dyn Fn(&Abandoned) + Send + Sync>;

/// Error returned by [`InFlightTracker::drain`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainError {
    #[error("drain deadline exceeded with {outstanding} handler(s) still running")]
    DeadlineExceeded { outstanding: usize },
}

#[derive(Debug, Default)]
struct TrackerInner {
    outstanding: AtomicUsize,
    idle: Notify,
}

/// Count of deadline-mode handler tasks that have not exited.
///
/// Cheap to clone; clones share the count. Production code uses
/// [`InFlightTracker::global`].
#[derive(Debug, Clone, Default)]
pub struct InFlightTracker {
    inner: Arc<TrackerInner>,
}

static GLOBAL_TRACKER: LazyLock<InFlightTracker> = LazyLock::new(InFlightTracker::default);

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide tracker used by [`LifecycleLayer::new`].
    pub fn global() -> &'static InFlightTracker {
        &GLOBAL_TRACKER
    }

    /// Current count, without waiting.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Count one unit of work until the guard is dropped.
    pub fn enter(&self) -> InFlightGuard {
        let outstanding = self.inner.outstanding.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::set_inflight_handlers(outstanding);
        InFlightGuard {
            inner: self.inner.clone(),
        }
    }

    /// Wait until the count reaches zero, or `within` elapses.
    ///
    /// # Errors
    ///
    /// [`DrainError::DeadlineExceeded`] with the count still running.
    pub async fn drain(&self, within: Duration) -> Result<(), DrainError> {
        let deadline = deadline_after(Instant::now(), within);

        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register before reading the count so a wakeup in between is kept
            notified.as_mut().enable();

            let outstanding = self.outstanding();
            if outstanding == 0 {
                return Ok(());
            }
            debug!(outstanding, "Waiting for in-flight handlers");

            if timeout_at(deadline, notified).await.is_err() {
                return match self.outstanding() {
                    0 => Ok(()),
                    outstanding => Err(DrainError::DeadlineExceeded { outstanding }),
                };
            }
        }
    }
}

/// Decrements its [`InFlightTracker`] on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    inner: Arc<TrackerInner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let outstanding = self.inner.outstanding.fetch_sub(1, Ordering::AcqRel) - 1;
        metrics::set_inflight_handlers(outstanding);
        if outstanding == 0 {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Lifecycle layer for Tower middleware stack.
#[derive(Clone)]
pub struct LifecycleLayer {
    policy: TimeoutPolicy,
    tracker: InFlightTracker,
    on_abandon: Option<AbandonCallback>,
}

impl LifecycleLayer {
    /// Layer counting handlers on [`InFlightTracker::global`].
    pub fn new(policy: TimeoutPolicy) -> Self {
        Self {
            policy,
            tracker: InFlightTracker::global().clone(),
            on_abandon: None,
        }
    }

    pub fn with_tracker(mut self, tracker: InFlightTracker) -> Self {
        self.tracker = tracker;
        self
    }

    /// Called once per abandoned handler, from the watcher task.
    pub fn on_abandon<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Abandoned) + Send + Sync + 'static,
    {
        self.on_abandon = Some(Arc::new(callback));
        self
    }
}

impl<S> Layer<S> for LifecycleLayer {
    type Service = LifecycleService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LifecycleService {
            inner,
            policy: self.policy,
            tracker: self.tracker.clone(),
            on_abandon: self.on_abandon.clone(),
        }
    }
}

/// Lifecycle service wrapper.
#[derive(Clone)]
pub struct LifecycleService<S> {
    inner: S,
    policy: TimeoutPolicy,
    tracker: InFlightTracker,
    on_abandon: Option<AbandonCallback>,
}

type Panic = Box<dyn Any + Send>;
type Outcome = Result<Result<Response<Body>, Infallible>, Panic>;

impl<S> Service<Request<Body>> for LifecycleService<S>
where
    S: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let started = Instant::now();
        let inner = self.inner.clone();
        let policy = self.policy;
        let tracker = self.tracker.clone();
        let on_abandon = self.on_abandon.clone();

        let state = ResponseState::new();
        req.extensions_mut().insert(state.clone());
        let slo = slo::tracker(req.extensions_mut());

        Box::pin(async move {
            let mut response = match policy.budget {
                None => run_inline(inner, req, &state).await,
                Some(budget) => {
                    let scope = Scope {
                        started,
                        budget,
                        grace: policy.grace,
                        tracker,
                        on_abandon,
                    };
                    run_with_deadline(inner, req, &state, scope).await
                }
            };

            let elapsed = started.elapsed();
            metrics::record_request_duration(response.status().as_u16(), elapsed);

            if policy.slo_enabled
                && let Some(outcome) = slo.classify(elapsed)
            {
                let tier = outcome.config.tier.as_str();
                let result = outcome.result();
                metrics::record_slo(tier, result);
                if outcome.passed {
                    debug!(tier, elapsed_ms = elapsed.as_millis(), result, "SLO classified");
                } else {
                    info!(
                        tier,
                        elapsed_ms = elapsed.as_millis(),
                        target_ms = outcome.config.target.as_millis(),
                        result,
                        "SLO missed"
                    );
                }
                response
                    .headers_mut()
                    .insert(SLO_RESULT_HEADER, HeaderValue::from_static(result));
            }

            Ok(response)
        })
    }
}

async fn run_inline<S>(mut inner: S, req: Request<Body>, state: &ResponseState) -> Response<Body>
where
    S: Service<Request<Body>, Response = Response<Body>, Error = Infallible>,
{
    let outcome = AssertUnwindSafe(async move { inner.call(req).await })
        .catch_unwind()
        .await;
    finalize(state, outcome)
}

/// Stand-in deadline for budgets too long to represent as an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(started: Instant, budget: Duration) -> Instant {
    started
        .checked_add(budget)
        .or_else(|| started.checked_add(FAR_FUTURE))
        .unwrap_or(started)
}

/// Per-request deadline-mode settings.
struct Scope {
    started: Instant,
    budget: Duration,
    grace: Duration,
    tracker: InFlightTracker,
    on_abandon: Option<AbandonCallback>,
}

async fn run_with_deadline<S>(
    mut inner: S,
    mut req: Request<Body>,
    state: &ResponseState,
    scope: Scope,
) -> Response<Body>
where
    S: Service<Request<Body>, Response = Response<Body>, Error = Infallible> + Send + 'static,
    S::Future: Send + 'static,
{
    let deadline = deadline_after(scope.started, scope.budget);
    let request_deadline = match req.extensions().get::<RequestDeadline>() {
        Some(ambient) => ambient.child(deadline),
        None => RequestDeadline::new(deadline, CancellationToken::new()),
    };
    req.extensions_mut().insert(request_deadline.clone());

    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let guard = scope.tracker.enter();
    let mut handle: JoinHandle<Outcome> = tokio::spawn(async move {
        let _guard = guard;
        AssertUnwindSafe(async move { inner.call(req).await })
            .catch_unwind()
            .await
    });

    let token = request_deadline.token().clone();
    let expired = {
        let token = token.clone();
        async move {
            tokio::select! {
                () = sleep_until(request_deadline.deadline()) => {}
                () = token.cancelled() => {}
            }
        }
    };

    tokio::select! {
        biased;

        joined = &mut handle => finalize(state, flatten(joined)),
        () = expired => {
            token.cancel();
            log_timeout(state, &method, &path, &scope);
            let response = state.finalize_error(ApiError::TIMEOUT).unwrap_or_else(|| {
                // The handler path cannot finalize while the controller is racing it
                ApiError::TIMEOUT.into_response()
            });
            watch_grace(handle, method, path, scope);
            response
        }
    }
}

fn log_timeout(state: &ResponseState, method: &Method, path: &str, scope: &Scope) {
    metrics::record_timeout();
    warn!(
        method = %method,
        path = %path,
        budget_ms = scope.budget.as_millis(),
        already_written = state.is_written(),
        "Request timed out"
    );
}

fn flatten(joined: Result<Outcome, JoinError>) -> Outcome {
    match joined {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => Err(e.into_panic()),
        Err(e) => Err(Box::new(e.to_string())),
    }
}

/// Finalize a completed handler, converting a panic into an internal error.
fn finalize(state: &ResponseState, outcome: Outcome) -> Response<Body> {
    let finalized = match outcome {
        Ok(Ok(response)) => state.finalize(response),
        Ok(Err(never)) => match never {},
        Err(panic) => {
            metrics::record_panic("handler");
            error!(panic = %panic_message(&panic), "Handler panicked");
            state.finalize_error(ApiError::INTERNAL)
        }
    };

    finalized.unwrap_or_else(|| {
        warn!("Response state was already finalized");
        ApiError::INTERNAL.into_response()
    })
}

/// Wait up to `grace` for a timed-out handler, then mark it abandoned.
fn watch_grace(handle: JoinHandle<Outcome>, method: Method, path: String, scope: Scope) {
    tokio::spawn(async move {
        match timeout(scope.grace, handle).await {
            Ok(joined) => match flatten(joined) {
                Ok(_) => debug!(path = %path, "Timed-out handler finished within grace period"),
                Err(panic) => {
                    metrics::record_panic("after_timeout");
                    warn!(
                        path = %path,
                        panic = %panic_message(&panic),
                        "Timed-out handler panicked during grace period"
                    );
                }
            },
            Err(_) => {
                let abandoned = Abandoned {
                    method,
                    path,
                    elapsed: scope.started.elapsed(),
                };
                metrics::record_abandoned();
                warn!(
                    method = %abandoned.method,
                    path = %abandoned.path,
                    elapsed_ms = abandoned.elapsed.as_millis(),
                    outstanding = scope.tracker.outstanding(),
                    "Handler abandoned after grace period"
                );

                if let Some(callback) = scope.on_abandon
                    && std::panic::catch_unwind(AssertUnwindSafe(|| callback(&abandoned))).is_err()
                {
                    error!("Abandonment callback panicked");
                }
            }
        }
    });
}

fn panic_message(panic: &Panic) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
