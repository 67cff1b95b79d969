//! Service assembly and the request path.
//!
//! ```rust,no_run
//! use svcbase::{Method, Outcome, RoutePattern, Service, ServiceConfig};
//! # use std::sync::Arc;
//! # use svcbase::{Invocation, Request, RouteDescriptor};
//! # async fn profile(_: Invocation, _: Arc<RouteDescriptor>, _: Request) -> Outcome { Outcome::not_found() }
//!
//! # fn main() -> svcbase::Result<()> {
//! let service = Service::builder("profile")
//!     .config(ServiceConfig::from_env(&["IDP_URL"])?)
//!     .secret("client-secret-from-vault")
//!     .route(RoutePattern::new("profile_id", "Read a profile", Method::Get, "/profile/:user", profile))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::channel::Channels;
use crate::config::{ServiceConfig, TraceLevel};
use crate::crypto::{AesGcmCipher, CipherProvider};
use crate::durable::DurableStub;
use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::invocation::{Invocation, ServiceCore};
use crate::kv::{KvNamespace, MemoryKv};
use crate::request::Request;
use crate::response::{ApiError, Outcome, Response};
use crate::router::{RoutePattern, RouteTable, build_route_table};
use crate::trace::{self, REQUEST_ID_HEADER, RedactionSet, SensitiveFields, ServiceIdentity, TRACE_HEADER};

/// A fully assembled service: shared collaborators plus its route table.
pub struct Service {
    core: Arc<ServiceCore>,
    routes: RouteTable,
}

pub struct ServiceBuilder {
    name: String,
    config: ServiceConfig,
    channels: Channels,
    kv: Option<Arc<dyn KvNamespace>>,
    cipher: Arc<dyn CipherProvider>,
    secrets: Vec<String>,
    sensitive: SensitiveFields,
    http: Option<Arc<dyn Fetcher>>,
    bindings: HashMap<String, Arc<dyn Fetcher>>,
    durables: HashMap<String, Arc<dyn DurableStub>>,
    routes: Vec<RoutePattern>,
}

impl ServiceBuilder {
    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn channels(mut self, channels: Channels) -> Self {
        self.channels = channels;
        self
    }

    /// Key-value namespace behind [`Invocation::store`]. In-memory by default.
    pub fn kv(mut self, kv: Arc<dyn KvNamespace>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn cipher(mut self, cipher: Arc<dyn CipherProvider>) -> Self {
        self.cipher = cipher;
        self
    }

    /// A value known at startup that must never appear in a record.
    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.secrets.push(secret.into());
        self
    }

    pub fn sensitive_fields(mut self, fields: SensitiveFields) -> Self {
        self.sensitive = fields;
        self
    }

    /// Fetcher used by [`Invocation::call_http`].
    pub fn http(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.http = Some(fetcher);
        self
    }

    /// Another service reachable through [`Invocation::call_service`].
    pub fn binding(mut self, name: &str, fetcher: Arc<dyn Fetcher>) -> Self {
        self.bindings.insert(name.to_owned(), fetcher);
        self
    }

    pub fn durable(mut self, name: &str, stub: Arc<dyn DurableStub>) -> Self {
        self.durables.insert(name.to_owned(), stub);
        self
    }

    pub fn route(mut self, route: RoutePattern) -> Self {
        self.routes.push(route);
        self
    }

    pub fn routes(mut self, routes: impl IntoIterator<Item = RoutePattern>) -> Self {
        self.routes.extend(routes);
        self
    }

    pub fn build(self) -> Result<Service> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("service name must not be empty".into()));
        }
        let routes = build_route_table(self.routes)?;
        let core = ServiceCore {
            name: self.name,
            config: self.config,
            channels: self.channels,
            kv: self.kv.unwrap_or_else(|| Arc::new(MemoryKv::new())),
            cipher: self.cipher,
            secrets: RedactionSet::new(self.secrets),
            sensitive: self.sensitive,
            http: self.http,
            bindings: self.bindings,
            durables: self.durables,
        };
        debug!(service = %core.name, routes = routes.len(), "service assembled");
        Ok(Service { core: Arc::new(core), routes })
    }
}

impl Service {
    pub fn builder(name: &str) -> ServiceBuilder {
        ServiceBuilder {
            name: name.to_owned(),
            config: ServiceConfig::default(),
            channels: Channels::default(),
            kv: None,
            cipher: Arc::new(AesGcmCipher),
            secrets: Vec::new(),
            sensitive: SensitiveFields::default(),
            http: None,
            bindings: HashMap::new(),
            durables: HashMap::new(),
            routes: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.core.config
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Starts an invocation continuing the caller's context found in `headers`.
    pub fn invocation(&self, headers: &[(String, String)]) -> Invocation {
        let header = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        };
        let identity = ServiceIdentity::new(&self.core.config).propagated(
            header(REQUEST_ID_HEADER),
            header(TRACE_HEADER).and_then(TraceLevel::parse_propagated),
        );
        Invocation::start(Arc::clone(&self.core), identity, headers)
    }

    /// Starts an invocation with an explicit identity.
    pub(crate) fn invocation_as(&self, identity: ServiceIdentity) -> Invocation {
        Invocation::start(Arc::clone(&self.core), identity, &[])
    }

    /// Handles one request end to end.
    ///
    /// Never fails: an unmatched route is a `404`, a handler error a `400`,
    /// and every record of the invocation is delivered before returning.
    pub async fn handle_request(&self, req: Request) -> Response {
        let inv = self.invocation(req.headers());
        let level = inv.identity().trace;
        let (url, method, ip, body) = (req.url().to_owned(), req.method(), req.ip().to_owned(), req.body().to_owned());

        inv.trace_message(
            &trace::request_message(level, &url, method.as_str(), req.headers(), &body),
            "service_in",
            None,
        );

        let outcome = match self.routes.dispatch(&inv, req).await {
            Some(Ok(outcome)) => outcome,
            Some(Err(e)) => {
                warn!(service = %self.core.name, correlation_id = %inv.identity().id, code = e.code(), "handler failed: {e}");
                let text = inv.exception_message(&e, &url, &body);
                Outcome::bad_request("VERIFICATION_FAILED", "Bad params", Some(Value::String(text)))
            }
            None => {
                debug!(service = %self.core.name, %url, "no route matched");
                Outcome::not_found()
            }
        };

        let (response, error) = match outcome {
            Outcome::Success { status, result } => (Response::json(status, &result), None),
            Outcome::Failure { status, error } => {
                let error = serde_json::to_value(ApiError::from_shape(&error, &url)).unwrap_or(Value::Null);
                (Response::json(status, &error), Some(error))
            }
        };

        inv.trace_message(
            &trace::response_message(level, &url, response.status(), response.headers(), response.body()),
            "service_out",
            error,
        );
        inv.access_log(&url, method, response.status(), &ip);
        inv.finish().await;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_name_is_rejected() {
        assert!(Service::builder(" ").build().is_err());
    }

    #[tokio::test]
    async fn propagated_context_is_continued() {
        let service = Service::builder("svc")
            .config(ServiceConfig { trace: TraceLevel::On, ..ServiceConfig::default() })
            .build()
            .unwrap();
        let headers = vec![
            ("F2X_Request_Id".to_owned(), "corr-1".to_owned()),
            ("f2x_trace".to_owned(), "2".to_owned()),
        ];
        let inv = service.invocation(&headers);
        assert_eq!(inv.identity().id, "corr-1");
        assert_eq!(inv.identity().trace, TraceLevel::Verbose);
    }

    #[tokio::test]
    async fn garbage_trace_header_keeps_the_default() {
        let service = Service::builder("svc")
            .config(ServiceConfig { trace: TraceLevel::On, ..ServiceConfig::default() })
            .build()
            .unwrap();
        let inv = service.invocation(&[("f2x_trace".to_owned(), "loud".to_owned())]);
        assert_eq!(inv.identity().trace, TraceLevel::On);
    }
}
