//! Outbound HTTP.
//!
//! The fetch primitive itself belongs to the host platform; [`Fetcher`] is
//! the contract svcbase drives it through. Service-to-service bindings are
//! simply named fetchers.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::method::Method;

/// Inbound headers that may travel to a sub-request. Nothing else does.
pub const SUB_REQUEST_HEADERS: [&str; 5] = [
    "cf-connecting-ip",
    "cf-ipcountry",
    "x-real-ip",
    "x-requested-with",
    "user-agent",
];

#[derive(Clone, Debug, PartialEq)]
pub struct OutboundRequest {
    pub url: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OutboundResponse {
    pub url: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl OutboundResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    async fn fetch(&self, request: OutboundRequest) -> Result<OutboundResponse>;
}

/// A [`Fetcher`] backed by an async closure. Handy for bindings in tests.
pub struct FnFetcher<F>(F);

impl<F, Fut> FnFetcher<F>
where
    F: Fn(OutboundRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<OutboundResponse>> + Send + 'static,
{
    pub fn new(f: F) -> Arc<Self> {
        Arc::new(Self(f))
    }
}

#[async_trait]
impl<F, Fut> Fetcher for FnFetcher<F>
where
    F: Fn(OutboundRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<OutboundResponse>> + Send + 'static,
{
    async fn fetch(&self, request: OutboundRequest) -> Result<OutboundResponse> {
        (self.0)(request).await
    }
}

/// The subset of `inbound` headers allowed to reach a sub-request.
pub fn forwarded_headers(inbound: &[(String, String)]) -> Vec<(String, String)> {
    inbound
        .iter()
        .filter(|(name, _)| SUB_REQUEST_HEADERS.iter().any(|allowed| name.eq_ignore_ascii_case(allowed)))
        .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
        .collect()
}
