//! Key dimensions: how request attributes become parts of a rate limit key.
//!
//! A [`Dimension`] is a label, a required flag and one extractor closure.
//! Extracted values are trimmed; blank values count as absent.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use axum::extract::Query;
use axum::http::request::Parts;
use axum::http::{Extensions, HeaderMap, Method, Request, Uri};

use crate::middleware::ip::{TrustedProxyConfig, client_ip};

/// Borrowed view over the parts of a request that dimensions may read.
#[derive(Debug, Clone, Copy)]
pub struct RequestView<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
    pub extensions: &'a Extensions,
}

impl<'a, B> From<&'a Request<B>> for RequestView<'a> {
    fn from(req: &'a Request<B>) -> Self {
        Self {
            method: req.method(),
            uri: req.uri(),
            headers: req.headers(),
            extensions: req.extensions(),
        }
    }
}

impl<'a> From<&'a Parts> for RequestView<'a> {
    fn from(parts: &'a Parts) -> Self {
        Self {
            method: &parts.method,
            uri: &parts.uri,
            headers: &parts.headers,
            extensions: &parts.extensions,
        }
    }
}

type Extractor = Arc<dyn Fn(&RequestView<'_>) -> Option<String> + Send + Sync>;

/// One named component of a composed rate limit key.
#[derive(Clone)]
pub struct Dimension {
    label: Cow<'static, str>,
    required: bool,
    extract: Extractor,
}

impl fmt::Debug for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dimension")
            .field("label", &self.label)
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}

impl Dimension {
    /// A dimension backed by an arbitrary extractor.
    pub fn custom<F>(label: impl Into<Cow<'static, str>>, required: bool, extract: F) -> Self
    where
        F: Fn(&RequestView<'_>) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            required,
            extract: Arc::new(extract),
        }
    }

    /// Client address, see [`crate::middleware::ip`]. Optional.
    pub fn client_ip(trusted_proxies: TrustedProxyConfig) -> Self {
        Self::custom("ip", false, move |view| {
            client_ip(view.headers, view.extensions, &trusted_proxies)
        })
    }

    /// Value of header `name`; the label is the header name.
    pub fn header(name: impl Into<String>) -> Self {
        Self::header_dimension(name.into(), false)
    }

    /// Like [`Dimension::header`], but a request without the header is
    /// rejected with a client error.
    pub fn required_header(name: impl Into<String>) -> Self {
        Self::header_dimension(name.into(), true)
    }

    fn header_dimension(name: String, required: bool) -> Self {
        let name = name.to_ascii_lowercase();
        Self::custom(name.clone(), required, move |view| {
            view.headers
                .get(name.as_str())
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        })
    }

    /// `"METHOD /path"`. Always present.
    pub fn endpoint() -> Self {
        Self::custom("endpoint", false, |view| {
            Some(format!("{} {}", view.method, view.uri.path()))
        })
    }

    /// Decoded query parameter `name`.
    pub fn query_param(name: impl Into<String>) -> Self {
        Self::query_dimension(name.into(), false)
    }

    pub fn required_query_param(name: impl Into<String>) -> Self {
        Self::query_dimension(name.into(), true)
    }

    fn query_dimension(name: String, required: bool) -> Self {
        Self::custom(name.clone(), required, move |view| {
            Query::<HashMap<String, String>>::try_from_uri(view.uri)
                .ok()
                .and_then(|Query(mut params)| params.remove(&name))
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Extract this dimension's value; `None` when absent or blank.
    pub fn extract(&self, view: &RequestView<'_>) -> Option<String> {
        (self.extract)(view)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request(uri: &str, headers: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder().method(Method::POST).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_header_dimension_is_case_insensitive() {
        let req = request("/", &[("X-Tenant-Id", "  acme  ")]);
        let dim = Dimension::header("X-Tenant-Id");

        assert_eq!(dim.label(), "x-tenant-id");
        assert!(!dim.is_required());
        assert_eq!(dim.extract(&RequestView::from(&req)).as_deref(), Some("acme"));
    }

    #[test]
    fn test_blank_value_is_absent() {
        let req = request("/", &[("x-tenant-id", "   ")]);
        let dim = Dimension::required_header("x-tenant-id");

        assert!(dim.is_required());
        assert!(dim.extract(&RequestView::from(&req)).is_none());
    }

    #[test]
    fn test_endpoint_dimension() {
        let req = request("/orders/42?x=1", &[]);
        assert_eq!(
            Dimension::endpoint()
                .extract(&RequestView::from(&req))
                .as_deref(),
            Some("POST /orders/42")
        );
    }

    #[test]
    fn test_query_param_dimension_decodes() {
        let req = request("/search?api_key=a%20b&other=1", &[]);
        let view = RequestView::from(&req);

        assert_eq!(
            Dimension::query_param("api_key").extract(&view).as_deref(),
            Some("a b")
        );
        assert!(Dimension::query_param("missing").extract(&view).is_none());
    }

    #[test]
    fn test_client_ip_dimension() {
        let req = request("/", &[("x-forwarded-for", "203.0.113.5")]);
        let dim = Dimension::client_ip(TrustedProxyConfig::default());

        assert_eq!(dim.label(), "ip");
        assert_eq!(
            dim.extract(&RequestView::from(&req)).as_deref(),
            Some("203.0.113.5")
        );
    }

    #[test]
    fn test_view_from_parts_matches_request() {
        let req = request("/a?b=c", &[("x-k", "v")]);
        let (parts, _) = req.into_parts();
        let view = RequestView::from(&parts);

        assert_eq!(
            Dimension::header("x-k").extract(&view).as_deref(),
            Some("v")
        );
    }
}
