//! Context of one invocation: who is calling, what must be masked, where
//! records go.
//!
//! An [`Invocation`] is created when a request, cron tick or queue batch
//! enters the service and handed to every handler. Clones share the same
//! redaction set and outbox, so a secret discovered by one sub-request is
//! masked in every record the invocation emits afterwards. Nothing in it is
//! shared with other invocations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::channel::{ChannelKind, Channels, Outbox};
use crate::config::{ExceptionPolicy, ServiceConfig};
use crate::crypto::CipherProvider;
use crate::durable::DurableStub;
use crate::error::{Error, Result};
use crate::fetch::{Fetcher, OutboundRequest, OutboundResponse, forwarded_headers};
use crate::kv::KvNamespace;
use crate::method::Method;
use crate::response::ApiError;
use crate::store::KeyedStore;
use crate::trace::{
    self, AccessRecord, EXCEPTION_LIMIT, ExceptionRecord, ExceptionReport, REQUEST_ID_HEADER, RedactionSet,
    SensitiveFields, ServiceIdentity, TRACE_HEADER, TraceRecord,
};

/// Display name of the fetcher used by [`Invocation::call_http`].
pub(crate) const HTTP_BINDING: &str = "http";

/// Everything a service is assembled from. Immutable once built.
pub(crate) struct ServiceCore {
    pub(crate) name: String,
    pub(crate) config: ServiceConfig,
    pub(crate) channels: Channels,
    pub(crate) kv: Arc<dyn KvNamespace>,
    pub(crate) cipher: Arc<dyn CipherProvider>,
    pub(crate) secrets: RedactionSet,
    pub(crate) sensitive: SensitiveFields,
    pub(crate) http: Option<Arc<dyn Fetcher>>,
    pub(crate) bindings: HashMap<String, Arc<dyn Fetcher>>,
    pub(crate) durables: HashMap<String, Arc<dyn DurableStub>>,
}

#[derive(Clone)]
pub struct Invocation {
    core: Arc<ServiceCore>,
    identity: ServiceIdentity,
    redaction: Arc<Mutex<RedactionSet>>,
    outbox: Outbox,
    inbound_headers: Arc<[(String, String)]>,
}

impl Invocation {
    /// Starts an invocation. Must be called inside a tokio runtime.
    pub(crate) fn start(core: Arc<ServiceCore>, identity: ServiceIdentity, inbound_headers: &[(String, String)]) -> Self {
        let redaction = Arc::new(Mutex::new(core.secrets.clone()));
        let outbox = Outbox::spawn(core.channels.clone());
        Self { core, identity, redaction, outbox, inbound_headers: inbound_headers.into() }
    }

    /// A sibling invocation acting as `identity`.
    ///
    /// It starts from the service's static secrets and shares this
    /// invocation's outbox, so records of both stay in emission order.
    pub(crate) fn with_identity(&self, identity: ServiceIdentity) -> Self {
        Self {
            core: Arc::clone(&self.core),
            identity,
            redaction: Arc::new(Mutex::new(self.core.secrets.clone())),
            outbox: self.outbox.clone(),
            inbound_headers: Arc::clone(&self.inbound_headers),
        }
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    pub fn service_name(&self) -> &str {
        &self.core.name
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.core.config
    }

    /// The service's keyed store. Durable calls carry the propagation headers.
    pub fn store(&self) -> KeyedStore {
        KeyedStore::new(&self.core.name, Arc::clone(&self.core.kv), Arc::clone(&self.core.cipher))
            .with_headers(self.propagation_headers())
    }

    /// The durable record stub bound under `name`.
    pub fn durable(&self, name: &str) -> Option<Arc<dyn DurableStub>> {
        self.core.durables.get(name).cloned()
    }

    // ── Redaction ────────────────────────────────────────────────────────────

    /// Snapshot of everything masked so far.
    pub fn redaction(&self) -> RedactionSet {
        self.redaction.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn mask(&self, text: &str) -> String {
        self.redaction.lock().unwrap_or_else(PoisonError::into_inner).mask(text)
    }

    /// Masks `secret` in every record emitted from now on.
    pub fn add_secret(&self, secret: &str) {
        let mut set = self.redaction.lock().unwrap_or_else(PoisonError::into_inner);
        *set = set.clone().with(secret);
    }

    /// Adds every sensitive value found in `body` to the redaction set.
    pub fn observe(&self, body: &str) {
        let mut set = self.redaction.lock().unwrap_or_else(PoisonError::into_inner);
        let before = set.len();
        *set = set.extended_from(&self.core.sensitive, body);
        if set.len() > before {
            debug!(correlation_id = %self.identity.id, discovered = set.len() - before, "secrets discovered");
        }
    }

    fn mask_value(&self, record: &impl Serialize) -> Value {
        let masked = self.mask(&serde_json::to_string(record).unwrap_or_default());
        serde_json::from_str(&masked).unwrap_or(Value::String(masked))
    }

    // ── Records ──────────────────────────────────────────────────────────────

    /// Emits a trace record of type `kind`. Nothing is emitted at level 0.
    pub fn trace_message(&self, message: &str, kind: &str, error: Option<Value>) {
        if !self.identity.trace.is_on() {
            return;
        }
        let record = TraceRecord {
            service_name: self.core.name.clone(),
            kind: kind.to_owned(),
            id: self.identity.id.clone(),
            time: trace::now(),
            error,
            message: message.to_owned(),
            trace: self.identity.trace,
        };
        let masked = self.mask_value(&record);
        self.outbox.emit(ChannelKind::Trace, masked);
    }

    /// Reports `error` and returns the text shown to the caller.
    ///
    /// With exception reporting on, the full report including the cause
    /// chain goes to the exception channel. The returned text carries the
    /// cause chain only when tracing is on. Both are masked and truncated.
    pub fn exception_message(&self, error: &Error, url: &str, body: &str) -> String {
        let report = ExceptionReport::new(error, url, body);
        let full = report.clone().with_stack(error);

        if self.identity.exception == ExceptionPolicy::Report {
            let message = trace::truncate_chars(&self.mask(&trace::pretty(&full)), EXCEPTION_LIMIT);
            let record = ExceptionRecord { service_name: self.core.name.clone(), time: trace::now(), message };
            self.outbox.emit(ChannelKind::Exception, serde_json::to_value(record).unwrap_or(Value::Null));
        }

        let shown = if self.identity.trace.is_on() { full } else { report };
        trace::truncate_chars(&self.mask(&trace::pretty(&shown)), EXCEPTION_LIMIT)
    }

    /// Emits an access-log record when the log policy covers `status`.
    pub fn access_log(&self, url: &str, method: Method, status: u16, ip: &str) {
        if !self.identity.log.allows(status) {
            return;
        }
        let record = AccessRecord {
            service_name: self.core.name.clone(),
            time: trace::now(),
            request_url: url.to_owned(),
            request_method: method.as_lower().to_owned(),
            status_code: status,
            ip: ip.to_owned(),
            is_error: if (200..300).contains(&status) { "0" } else { "1" },
        };
        let masked = self.mask_value(&record);
        self.outbox.emit(ChannelKind::Access, masked);
    }

    // ── Outbound calls ───────────────────────────────────────────────────────

    /// Headers that carry this invocation's context to a callee.
    pub fn propagation_headers(&self) -> Vec<(String, String)> {
        vec![
            ("content-type".to_owned(), "application/json".to_owned()),
            (REQUEST_ID_HEADER.to_owned(), self.identity.id.clone()),
            (TRACE_HEADER.to_owned(), self.identity.trace.to_string()),
        ]
    }

    /// Allow-listed inbound headers, then `extra`, then the propagation pair.
    /// A later source replaces an earlier header of the same name.
    fn outbound_headers(&self, extra: &[(String, String)]) -> Vec<(String, String)> {
        let mut headers = forwarded_headers(&self.inbound_headers);
        for (name, value) in extra.iter().cloned().chain(self.propagation_headers()) {
            let name = name.to_ascii_lowercase();
            headers.retain(|(existing, _)| *existing != name);
            headers.push((name, value));
        }
        headers
    }

    /// Calls an arbitrary URL and returns the raw response.
    pub async fn call_http(
        &self,
        url: &str,
        method: Method,
        body: Option<String>,
        headers: &[(String, String)],
    ) -> Result<OutboundResponse> {
        let fetcher = self
            .core
            .http
            .as_ref()
            .ok_or_else(|| Error::fetch(url, format!("no `{HTTP_BINDING}` fetcher configured")))?;
        self.send(fetcher.as_ref(), url, method, body, headers).await
    }

    /// Calls another service through its binding and parses the JSON answer.
    ///
    /// A non-2xx answer fails with [`Error::Upstream`] carrying the callee's
    /// error code and message, or `API_ERROR` when it sent none. An empty
    /// body reads as `null`.
    pub async fn call_service(
        &self,
        binding: &str,
        path: &str,
        method: Method,
        body: Option<Value>,
        headers: &[(String, String)],
    ) -> Result<Value> {
        let url = format!("https://{binding}/{}", path.trim_start_matches('/'));
        let fetcher = self
            .core
            .bindings
            .get(binding)
            .ok_or_else(|| Error::fetch(&url, format!("no binding named `{binding}`")))?;
        let body = body.map(|b| serde_json::to_string(&b)).transpose()?;
        let response = self.send(fetcher.as_ref(), &url, method, body, headers).await?;
        if !response.is_success() {
            return Err(upstream_error(&url, &response));
        }
        if response.body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&response.body)?)
    }

    async fn send(
        &self,
        fetcher: &dyn Fetcher,
        url: &str,
        method: Method,
        body: Option<String>,
        headers: &[(String, String)],
    ) -> Result<OutboundResponse> {
        let request = OutboundRequest { url: url.to_owned(), method, headers: self.outbound_headers(headers), body };
        let level = self.identity.trace;
        self.trace_message(
            &trace::request_message(level, url, method.as_str(), &request.headers, request.body.as_deref().unwrap_or_default()),
            "http_request",
            None,
        );

        let response = fetcher.fetch(request).await?;
        self.observe(&response.body);
        self.trace_message(
            &trace::response_message(level, url, response.status, &response.headers, &response.body),
            "http_response",
            None,
        );
        Ok(response)
    }

    /// Sends `message` to the work queue `queue`, tagged with this
    /// invocation's correlation id and trace level.
    pub async fn send_queue(&self, queue: &str, message: Value) -> Result<()> {
        let target = self
            .core
            .channels
            .queues
            .get(queue)
            .ok_or_else(|| Error::channel(queue, "no such queue"))?;
        target
            .send(json!({ "id": self.identity.id, "trace": self.identity.trace, "message": message }))
            .await
            .inspect_err(|e| warn!(queue, error = %e, "queue send failed"))
    }

    /// Waits until every record of this invocation has been delivered.
    pub async fn finish(&self) {
        self.outbox.flush().await;
    }
}

/// Re-codes a failed callee answer. The shape is read from `error` when the
/// body nests it there.
fn upstream_error(url: &str, response: &OutboundResponse) -> Error {
    let body: Value = serde_json::from_str(&response.body).unwrap_or(Value::Null);
    let shape = body.get("error").filter(|nested| nested.is_object()).unwrap_or(&body);
    let api = ApiError::from_shape(shape, url);
    warn!(url, status = response.status, code = %api.code, "callee answered with an error");
    Error::Upstream { code: api.code, message: api.message }
}

#[cfg(test)]
mod tests {
    use crate::channel::MemoryQueue;
    use crate::config::{LogPolicy, TraceLevel};
    use crate::crypto::AesGcmCipher;
    use crate::fetch::FnFetcher;
    use crate::kv::MemoryKv;

    use super::*;

    struct Sinks {
        trace: Arc<MemoryQueue>,
        exception: Arc<MemoryQueue>,
        access: Arc<MemoryQueue>,
        work: Arc<MemoryQueue>,
    }

    fn invocation(config: ServiceConfig, http: Option<Arc<dyn Fetcher>>) -> (Invocation, Sinks) {
        invocation_with(config, http, HashMap::new())
    }

    fn invocation_with(
        config: ServiceConfig,
        http: Option<Arc<dyn Fetcher>>,
        bindings: HashMap<String, Arc<dyn Fetcher>>,
    ) -> (Invocation, Sinks) {
        let sinks = Sinks {
            trace: MemoryQueue::new(),
            exception: MemoryQueue::new(),
            access: MemoryQueue::new(),
            work: MemoryQueue::new(),
        };
        let work: Arc<dyn crate::channel::Queue> = sinks.work.clone();
        let channels = Channels {
            trace: sinks.trace.clone(),
            exception: sinks.exception.clone(),
            access: sinks.access.clone(),
            queues: HashMap::from([("jobs".to_owned(), work)]),
        };
        let identity = ServiceIdentity::new(&config);
        let core = ServiceCore {
            name: "auth".into(),
            config,
            channels,
            kv: Arc::new(MemoryKv::new()),
            cipher: Arc::new(AesGcmCipher),
            secrets: RedactionSet::new(["static-secret"]),
            sensitive: SensitiveFields::default(),
            http,
            bindings,
            durables: HashMap::new(),
        };
        let inbound = [
            ("user-agent".to_owned(), "app/1".to_owned()),
            ("authorization".to_owned(), "Bearer x".to_owned()),
        ];
        (Invocation::start(Arc::new(core), identity, &inbound), sinks)
    }

    fn traced() -> ServiceConfig {
        ServiceConfig { trace: TraceLevel::On, ..ServiceConfig::default() }
    }

    #[tokio::test]
    async fn level_zero_emits_no_traces() {
        let (inv, sinks) = invocation(ServiceConfig::default(), None);
        inv.trace_message("hello", "service_in", None);
        inv.finish().await;
        assert!(sinks.trace.messages().is_empty());
    }

    #[tokio::test]
    async fn trace_records_are_masked() {
        let (inv, sinks) = invocation(traced(), None);
        inv.trace_message("key=static-secret", "service_in", None);
        inv.finish().await;
        let records = sinks.trace.messages();
        assert_eq!(records[0]["message"], "key=MASKED");
        assert_eq!(records[0]["type"], "service_in");
        assert_eq!(records[0]["serviceName"], "auth");
        assert_eq!(records[0]["trace"], 1);
    }

    #[tokio::test]
    async fn secrets_from_responses_are_masked_afterwards() {
        let http = FnFetcher::new(|req: OutboundRequest| async move {
            Ok(OutboundResponse {
                url: req.url,
                status: 200,
                headers: Vec::new(),
                body: r#"{"access_token":"tok-777"}"#.to_owned(),
            })
        });
        let (inv, sinks) = invocation(traced(), Some(http));
        inv.call_http("https://idp/token", Method::Post, None, &[]).await.unwrap();
        inv.trace_message("echo tok-777", "custom", None);
        inv.finish().await;

        let records = sinks.trace.messages();
        let kinds: Vec<_> = records.iter().map(|r| r["type"].as_str().unwrap().to_owned()).collect();
        assert_eq!(kinds, ["http_request", "http_response", "custom"]);
        for record in &records {
            assert!(!record.to_string().contains("tok-777"));
        }
        assert!(inv.redaction().contains("tok-777"));
    }

    #[tokio::test]
    async fn outbound_headers_are_allow_listed_and_propagated() {
        let http = FnFetcher::new(|req: OutboundRequest| async move {
            Ok(OutboundResponse { url: req.url, status: 200, headers: req.headers, body: String::new() })
        });
        let (inv, _) = invocation(traced(), Some(http));
        let extra = [("f2x_trace".to_owned(), "0".to_owned()), ("x-api".to_owned(), "1".to_owned())];
        let response = inv.call_http("https://idp/x", Method::Get, None, &extra).await.unwrap();

        assert_eq!(response.header("user-agent"), Some("app/1"));
        assert_eq!(response.header("authorization"), None);
        assert_eq!(response.header("x-api"), Some("1"));
        assert_eq!(response.header("f2x_trace"), Some("1"));
        assert_eq!(response.header("f2x_request_id"), Some(inv.identity().id.as_str()));
    }

    #[tokio::test]
    async fn call_http_without_fetcher_fails() {
        let (inv, _) = invocation(traced(), None);
        let err = inv.call_http("https://x", Method::Get, None, &[]).await.unwrap_err();
        assert_eq!(err.code(), "FETCH_FAILED");
    }

    #[tokio::test]
    async fn exception_report_respects_policies() {
        let config = ServiceConfig { exception: ExceptionPolicy::Report, ..ServiceConfig::default() };
        let (inv, sinks) = invocation(config, None);
        let err = Error::from(std::io::Error::other("static-secret leaked"));
        let shown = inv.exception_message(&err, "https://auth/x", "{}");
        inv.finish().await;

        assert!(!shown.contains("caused by"));
        assert!(!shown.contains("static-secret"));
        let reported = sinks.exception.messages();
        assert_eq!(reported.len(), 1);
        let message = reported[0]["message"].as_str().unwrap();
        assert!(message.contains("caused by"));
        assert!(message.contains("MASKED"));
    }

    #[tokio::test]
    async fn exception_text_is_capped() {
        let config = ServiceConfig {
            trace: TraceLevel::On,
            exception: ExceptionPolicy::Report,
            ..ServiceConfig::default()
        };
        let (inv, sinks) = invocation(config, None);
        let body = "x".repeat(EXCEPTION_LIMIT * 2);
        let shown = inv.exception_message(&Error::Validation("too big".into()), "https://auth/x", &body);
        inv.finish().await;

        assert_eq!(shown.chars().count(), EXCEPTION_LIMIT);
        let reported = sinks.exception.messages();
        assert_eq!(reported[0]["message"].as_str().unwrap().chars().count(), EXCEPTION_LIMIT);
    }

    #[tokio::test]
    async fn traced_callers_see_the_cause_chain() {
        let (inv, sinks) = invocation(traced(), None);
        let err = Error::from(std::io::Error::other("disk gone"));
        let shown = inv.exception_message(&err, "https://auth/x", "");
        inv.finish().await;

        assert!(shown.contains("caused by: disk gone"));
        assert!(sinks.exception.messages().is_empty());
    }

    fn profile_binding() -> HashMap<String, Arc<dyn Fetcher>> {
        let profile = FnFetcher::new(|req: OutboundRequest| async move {
            let (status, body) = match req.url.as_str() {
                "https://profile/users/1" => (200, r#"{"id":1,"session":"sess-55"}"#),
                "https://profile/users/1/avatar" => (204, ""),
                "https://profile/users/2" => (404, r#"{"error":{"code":"USER_MISSING","message":"no such user"}}"#),
                _ => (500, "oops"),
            };
            Ok(OutboundResponse { url: req.url, status, headers: Vec::new(), body: body.to_owned() })
        });
        HashMap::from([("profile".to_owned(), profile as Arc<dyn Fetcher>)])
    }

    #[tokio::test]
    async fn call_service_targets_the_binding() {
        let (inv, sinks) = invocation_with(traced(), None, profile_binding());
        let user = inv.call_service("profile", "/users/1", Method::Get, None, &[]).await.unwrap();
        assert_eq!(user["id"], 1);
        inv.trace_message("session sess-55", "custom", None);
        inv.finish().await;

        let records = sinks.trace.messages();
        let kinds: Vec<_> = records.iter().map(|r| r["type"].as_str().unwrap().to_owned()).collect();
        assert_eq!(kinds, ["http_request", "http_response", "custom"]);
        assert!(records[0]["message"].as_str().unwrap().contains("https://profile/users/1"));
        for record in &records {
            assert!(!record.to_string().contains("sess-55"));
        }
        assert!(inv.redaction().contains("sess-55"));
    }

    #[tokio::test]
    async fn call_service_reads_empty_bodies_as_null() {
        let (inv, _) = invocation_with(traced(), None, profile_binding());
        let answer = inv.call_service("profile", "users/1/avatar", Method::Put, Some(json!({"png": ""})), &[]).await;
        assert_eq!(answer.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn call_service_failures_are_coded() {
        let (inv, _) = invocation_with(traced(), None, profile_binding());

        let missing = inv.call_service("billing", "x", Method::Get, None, &[]).await.unwrap_err();
        assert_eq!(missing.code(), "FETCH_FAILED");
        assert!(missing.to_string().contains("https://billing/x"));

        let upstream = inv.call_service("profile", "users/2", Method::Get, None, &[]).await.unwrap_err();
        assert_eq!(upstream.code(), "USER_MISSING");
        assert!(upstream.to_string().contains("no such user"));

        let bare = inv.call_service("profile", "boom", Method::Get, None, &[]).await.unwrap_err();
        assert_eq!(bare.code(), "API_ERROR");
    }

    #[tokio::test]
    async fn access_log_follows_policy() {
        let config = ServiceConfig { log: LogPolicy::Error, ..ServiceConfig::default() };
        let (inv, sinks) = invocation(config, None);
        inv.access_log("https://auth/ok", Method::Get, 200, "1.2.3.4");
        inv.access_log("https://auth/bad", Method::Post, 404, "1.2.3.4");
        inv.finish().await;

        let records = sinks.access.messages();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["statusCode"], 404);
        assert_eq!(records[0]["isError"], "1");
        assert_eq!(records[0]["requestMethod"], "post");
    }

    #[tokio::test]
    async fn send_queue_wraps_context() {
        let (inv, sinks) = invocation(traced(), None);
        inv.send_queue("jobs", json!({"n": 1})).await.unwrap();
        let sent = sinks.work.messages();
        assert_eq!(sent[0]["id"], inv.identity().id.as_str());
        assert_eq!(sent[0]["trace"], 1);
        assert_eq!(sent[0]["message"]["n"], 1);
        assert!(inv.send_queue("missing", Value::Null).await.is_err());
    }

    #[tokio::test]
    async fn store_is_namespaced_by_service() {
        let (inv, _) = invocation(traced(), None);
        inv.store().set("k", "v", None, None, None).await.unwrap();
        assert_eq!(inv.core.kv.get("auth_k").await.unwrap().as_deref(), Some("v"));
    }
}
