use std::sync::Arc;

use serde_json::{Value, json};
use svcbase::{
    Channels, Error, Invocation, LogPolicy, MemoryQueue, Method, OutboundRequest, OutboundResponse, Outcome, Request,
    RouteDescriptor, RoutePattern, Service, ServiceConfig, TraceLevel, FnFetcher,
};

struct Sinks {
    trace: Arc<MemoryQueue>,
    access: Arc<MemoryQueue>,
    seen: Arc<MemoryQueue>,
}

async fn hello(_: Invocation, _: Arc<RouteDescriptor>, req: Request) -> Outcome {
    Outcome::ok(json!({ "hello": req.param("name") }))
}

async fn shadowed(_: Invocation, _: Arc<RouteDescriptor>, _: Request) -> Outcome {
    Outcome::ok(json!({ "hello": "shadowed" }))
}

async fn fails(_: Invocation, _: Arc<RouteDescriptor>, _: Request) -> svcbase::Result<Outcome> {
    Err(Error::Validation("missing code".into()))
}

async fn panics(_: Invocation, _: Arc<RouteDescriptor>, _: Request) -> Outcome {
    panic!("handler blew up")
}

async fn bare_failure(_: Invocation, _: Arc<RouteDescriptor>, _: Request) -> Outcome {
    Outcome::Failure { status: 502, error: json!({}) }
}

async fn exchange(inv: Invocation, _: Arc<RouteDescriptor>, _: Request) -> svcbase::Result<Outcome> {
    let response = inv.call_http("https://idp.example/token", Method::Post, None, &[]).await?;
    let body: Value = serde_json::from_str(&response.body)?;
    Ok(Outcome::ok(json!({ "token": body["access_token"] })))
}

fn service(config: ServiceConfig) -> (Service, Sinks) {
    let sinks = Sinks { trace: MemoryQueue::new(), access: MemoryQueue::new(), seen: MemoryQueue::new() };
    let seen = sinks.seen.clone();
    let idp = FnFetcher::new(move |req: OutboundRequest| {
        let seen = seen.clone();
        async move {
            let headers: serde_json::Map<String, Value> =
                req.headers.iter().map(|(k, v)| (k.clone(), Value::String(v.clone()))).collect();
            svcbase::Queue::send(seen.as_ref(), Value::Object(headers)).await?;
            Ok(OutboundResponse {
                url: req.url,
                status: 200,
                headers: Vec::new(),
                body: r#"{"access_token":"at-very-secret","token_type":"bearer"}"#.to_owned(),
            })
        }
    });

    let service = Service::builder("auth")
        .config(config)
        .channels(Channels { trace: sinks.trace.clone(), access: sinks.access.clone(), ..Channels::default() })
        .secret("client-secret-1")
        .http(idp)
        .route(RoutePattern::new("hello", "Greets", Method::Get, "/hello/:name", hello).category("demo"))
        .route(RoutePattern::new("shadowed", "Never reached", Method::Get, "/hello/:who", shadowed))
        .route(RoutePattern::new("fails", "Always fails", Method::Post, "/fails", fails))
        .route(RoutePattern::new("panics", "Panics", Method::Post, "/panics", panics))
        .route(RoutePattern::new("bare", "Bare failure", Method::Get, "/bare", bare_failure))
        .route(
            RoutePattern::new("exchange", "Token exchange", Method::Post, "/exchange", exchange)
                .test_fixture(json!({ "body": { "code": "abc" } })),
        )
        .build()
        .unwrap();
    (service, sinks)
}

fn traced(level: TraceLevel) -> ServiceConfig {
    ServiceConfig { trace: level, ..ServiceConfig::default() }
}

fn request(method: Method, path: &str) -> Request {
    Request::new(method, &format!("https://auth{path}")).unwrap()
}

fn kinds(records: &[Value]) -> Vec<&str> {
    records.iter().map(|r| r["type"].as_str().unwrap()).collect()
}

#[tokio::test]
async fn introspection_lists_every_route() {
    let (service, _) = service(ServiceConfig::default());
    let response = service.handle_request(request(Method::Post, "/std/requests")).await;
    assert_eq!(response.status(), 200);

    let body = response.body_json().unwrap();
    let ids: Vec<_> = body["params"].as_array().unwrap().iter().map(|p| p["id"].as_str().unwrap()).collect();
    assert!(ids.contains(&"all_requests_id"));
    assert!(ids.contains(&"request_params_id"));
    assert_eq!(ids[0], "hello");
    assert_eq!(body["params"][0]["url"], "https://auth/hello/:name");
    assert_eq!(body["params"][0]["method"], "get");
    assert_eq!(body["vars"]["TRACE"], "0");
    assert_eq!(body["vars"]["LOG"], "no");
    assert_eq!(body["vars"]["INSTANCE"], "stage");
}

#[tokio::test]
async fn introspection_describes_one_route() {
    let (service, _) = service(ServiceConfig::default());
    let response = service.handle_request(request(Method::Post, "/std/requests/exchange")).await;
    assert_eq!(response.status(), 200);
    let body = response.body_json().unwrap();
    assert_eq!(body["id"], "exchange");
    assert_eq!(body["test"]["body"]["code"], "abc");

    let missing = service.handle_request(request(Method::Post, "/std/requests/nope")).await;
    assert_eq!(missing.status(), 404);
    assert_eq!(missing.body_json().unwrap()["code"], "NOT_FOUND");
}

#[tokio::test]
async fn unknown_path_is_not_found() {
    let (service, _) = service(ServiceConfig::default());
    let response = service.handle_request(request(Method::Get, "/nowhere")).await;
    assert_eq!(response.status(), 404);
    assert_eq!(
        response.body_json().unwrap(),
        json!({ "code": "NOT_FOUND", "message": "Data not found", "trace": null })
    );
}

#[tokio::test]
async fn earlier_route_wins() {
    let (service, _) = service(ServiceConfig::default());
    let response = service.handle_request(request(Method::Get, "/hello/ada")).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.body_json().unwrap(), json!({ "hello": "ada" }));
}

#[tokio::test]
async fn handler_errors_become_verification_failures() {
    let (service, _) = service(ServiceConfig::default());
    let response = service.handle_request(request(Method::Post, "/fails")).await;
    assert_eq!(response.status(), 400);
    let body = response.body_json().unwrap();
    assert_eq!(body["code"], "VERIFICATION_FAILED");
    assert_eq!(body["message"], "Bad params");
    assert!(body["trace"].as_str().unwrap().contains("missing code"));
}

#[tokio::test]
async fn handler_panics_are_contained() {
    let (service, _) = service(ServiceConfig::default());
    let response = service.handle_request(request(Method::Post, "/panics")).await;
    assert_eq!(response.status(), 400);
    assert_eq!(response.body_json().unwrap()["code"], "VERIFICATION_FAILED");
}

#[tokio::test]
async fn bare_failures_get_default_error_shape() {
    let (service, _) = service(ServiceConfig::default());
    let response = service.handle_request(request(Method::Get, "/bare")).await;
    assert_eq!(response.status(), 502);
    let body = response.body_json().unwrap();
    assert_eq!(body["code"], "API_ERROR");
    assert_eq!(body["message"], "Error on https://auth/bare");
}

#[tokio::test]
async fn inbound_trace_level_escalates() {
    let (service, sinks) = service(traced(TraceLevel::On));
    let req = request(Method::Get, "/hello/ada").header_pair("f2x_trace", "2");
    service.handle_request(req).await;
    let records = sinks.trace.messages();
    assert_eq!(kinds(&records), ["service_in", "service_out"]);
    assert!(records[0]["message"].as_str().unwrap().contains("requestHeaders"));
    assert_eq!(records[0]["trace"], 2);
}

#[tokio::test]
async fn inbound_trace_level_never_lowers() {
    let (service, sinks) = service(traced(TraceLevel::Verbose));
    let req = request(Method::Get, "/hello/ada").header_pair("f2x_trace", "0");
    service.handle_request(req).await;
    let records = sinks.trace.messages();
    assert_eq!(records.len(), 2);
    assert!(records[0]["message"].as_str().unwrap().contains("requestHeaders"));
    assert!(records[1]["message"].as_str().unwrap().contains("responseHeaders"));
}

#[tokio::test]
async fn out_of_range_trace_header_is_ignored() {
    let (service, sinks) = service(traced(TraceLevel::On));
    let req = request(Method::Get, "/hello/ada").header_pair("f2x_trace", "7");
    service.handle_request(req).await;
    let records = sinks.trace.messages();
    assert_eq!(records[0]["trace"], 1);
    assert!(!records[0]["message"].as_str().unwrap().contains("requestHeaders"));
}

#[tokio::test]
async fn level_one_omits_headers() {
    let (service, sinks) = service(traced(TraceLevel::On));
    service.handle_request(request(Method::Get, "/hello/ada")).await;
    let records = sinks.trace.messages();
    assert!(!records[0]["message"].as_str().unwrap().contains("requestHeaders"));
}

#[tokio::test]
async fn secrets_seen_downstream_are_masked_for_the_rest_of_the_invocation() {
    let (service, sinks) = service(traced(TraceLevel::On));
    let response = service.handle_request(request(Method::Post, "/exchange")).await;

    // The client still gets the real token.
    assert_eq!(response.body_json().unwrap()["token"], "at-very-secret");

    let records = sinks.trace.messages();
    assert_eq!(kinds(&records), ["service_in", "http_request", "http_response", "service_out"]);
    for record in &records {
        assert!(!record.to_string().contains("at-very-secret"), "leaked in {record}");
    }
    assert!(records[3]["message"].as_str().unwrap().contains("MASKED"));
}

#[tokio::test]
async fn static_secrets_are_masked() {
    let (service, sinks) = service(traced(TraceLevel::On));
    let req = request(Method::Post, "/fails").body_text(r#"{"client_secret":"client-secret-1"}"#);
    service.handle_request(req).await;
    for record in sinks.trace.messages() {
        assert!(!record.to_string().contains("client-secret-1"));
    }
}

#[tokio::test]
async fn correlation_id_is_continued_and_forwarded() {
    let (service, sinks) = service(traced(TraceLevel::On));
    let req = request(Method::Post, "/exchange")
        .header_pair("f2x_request_id", "corr-42")
        .header_pair("user-agent", "app/2")
        .header_pair("cookie", "sid=1");
    service.handle_request(req).await;

    for record in sinks.trace.messages() {
        assert_eq!(record["id"], "corr-42");
    }
    let forwarded = &sinks.seen.messages()[0];
    assert_eq!(forwarded["f2x_request_id"], "corr-42");
    assert_eq!(forwarded["f2x_trace"], "1");
    assert_eq!(forwarded["content-type"], "application/json");
    assert_eq!(forwarded["user-agent"], "app/2");
    assert!(forwarded.get("cookie").is_none());
}

#[tokio::test]
async fn access_log_follows_policy() {
    let config = ServiceConfig { log: LogPolicy::Error, ..ServiceConfig::default() };
    let (service, sinks) = service(config);
    service.handle_request(request(Method::Get, "/hello/ada").client_ip("9.9.9.9")).await;
    service.handle_request(request(Method::Get, "/nowhere").client_ip("9.9.9.9")).await;

    let records = sinks.access.messages();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["requestUrl"], "https://auth/nowhere");
    assert_eq!(records[0]["requestMethod"], "get");
    assert_eq!(records[0]["statusCode"], 404);
    assert_eq!(records[0]["ip"], "9.9.9.9");
    assert_eq!(records[0]["isError"], "1");
    assert_eq!(records[0]["serviceName"], "auth");
}

#[tokio::test]
async fn all_policy_logs_successes() {
    let config = ServiceConfig { log: LogPolicy::All, ..ServiceConfig::default() };
    let (service, sinks) = service(config);
    service.handle_request(request(Method::Get, "/hello/ada")).await;
    let records = sinks.access.messages();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["isError"], "0");
}

#[tokio::test]
async fn invocations_do_not_share_redaction() {
    let (service, sinks) = service(traced(TraceLevel::On));
    service.handle_request(request(Method::Post, "/exchange")).await;
    let first = sinks.trace.messages().len();

    let req = request(Method::Post, "/fails").body_text("at-very-secret");
    service.handle_request(req).await;
    let later: Vec<_> = sinks.trace.messages().into_iter().skip(first).collect();
    assert!(later[0].to_string().contains("at-very-secret"));
}
