//! Fuzz testing for client address resolution and rate limit key composition.
//!
//! Forwarding headers and CIDR lists come straight from clients and
//! operators. This target checks that parsing and key composition:
//!
//! - Never panic on any input
//! - Never produce a key for a blank required dimension
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! cargo +nightly install cargo-fuzz
//! cargo +nightly fuzz run fuzz_client_key -- -max_total_time=60
//! ```

#![no_main]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use libfuzzer_sys::fuzz_target;
use lifeguard::middleware::{
    CidrRange, Dimension, LimitRejection, RateLimiter, RequestView, TrustedProxyConfig,
};
use lifeguard::store::MemoryStore;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };

    if let Some(range) = CidrRange::parse(s) {
        let _ = range.prefix_len();
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(_) => return,
    };
    runtime.block_on(async {
        let trusted = TrustedProxyConfig::new(&[s.to_string()]);
        let Ok(limiter) = RateLimiter::new(
            Arc::new(MemoryStore::new()),
            10,
            Duration::from_secs(60),
            vec![
                Dimension::client_ip(trusted),
                Dimension::required_header("x-tenant-id"),
            ],
        ) else {
            return;
        };

        let Ok(request) = Request::builder()
            .header("x-forwarded-for", s)
            .header("x-tenant-id", s)
            .body(Body::empty())
        else {
            return;
        };

        match limiter.compose_key(&RequestView::from(&request)) {
            Ok(Some(key)) => assert!(!key.is_empty()),
            Ok(None) => {}
            Err(LimitRejection::MissingDimension { label }) => assert_eq!(label, "x-tenant-id"),
            Err(LimitRejection::Store(_)) => unreachable!("compose never touches the store"),
        }
    });
});
