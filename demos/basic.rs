//! A small token-keeping service on svcbase.
//!
//! Run with:
//!   RUST_LOG=info TRACE=1 LOG=all cargo run --example basic
//!
//! Try:
//!   curl -X POST http://localhost:3000/std/requests
//!   curl -X PUT  http://localhost:3000/tokens/alice?pass=pw -d 'tok-123'
//!   curl         http://localhost:3000/tokens/alice?pass=pw
//!   curl -X POST http://localhost:3000/session -d '{"user":"alice"}'
//!   curl         http://localhost:3000/session

use std::sync::Arc;

use serde_json::json;
use svcbase::{
    DurableRecordActor, Invocation, Method, Outcome, Request, RouteDescriptor, RoutePattern, Server, Service,
    ServiceConfig,
};
use tracing_subscriber::EnvFilter;

const SESSION: &str = "session";

#[tokio::main]
async fn main() -> svcbase::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let (actor, session) = DurableRecordActor::new(SESSION, 32);
    tokio::spawn(actor.run());

    let service = Service::builder("tokens")
        .config(ServiceConfig::from_env(&["INSTANCE_REGION"])?)
        .durable(SESSION, Arc::new(session))
        .route(
            RoutePattern::new("put_token", "Store a token", Method::Put, "/tokens/:user", put_token)
                .search("pass=:pass")
                .category("tokens"),
        )
        .route(
            RoutePattern::new("get_token", "Read a token", Method::Get, "/tokens/:user", get_token)
                .search("pass=:pass")
                .category("tokens")
                .test_fixture(json!({ "url": "/tokens/alice?pass=pw" })),
        )
        .route(RoutePattern::new("open_session", "Open the session", Method::Post, "/session", open_session))
        .route(RoutePattern::new("read_session", "Read the session", Method::Get, "/session", read_session))
        .build()?;

    Server::bind("0.0.0.0:3000").serve(service).await
}

// PUT /tokens/:user?pass=:pass
//
// Stored encrypted for a day under `tokens_<user>`.
async fn put_token(inv: Invocation, _: Arc<RouteDescriptor>, req: Request) -> svcbase::Result<Outcome> {
    let user = req.param("user").unwrap_or_default();
    inv.add_secret(req.body());
    inv.store()
        .set(user, req.body(), Some(86_400), None, req.param("pass"))
        .await?;
    Ok(Outcome::with_status(201, json!({ "user": user })))
}

// GET /tokens/:user?pass=:pass
async fn get_token(inv: Invocation, _: Arc<RouteDescriptor>, req: Request) -> svcbase::Result<Outcome> {
    let user = req.param("user").unwrap_or_default();
    match inv.store().get(user, req.param("pass")).await? {
        Some(token) => Ok(Outcome::ok(json!({ "user": user, "token": token }))),
        None => Ok(Outcome::not_found()),
    }
}

// POST /session
//
// The durable record expires after ten minutes.
async fn open_session(inv: Invocation, _: Arc<RouteDescriptor>, req: Request) -> svcbase::Result<Outcome> {
    let Some(stub) = inv.durable(SESSION) else {
        return Ok(Outcome::not_found());
    };
    let record = inv
        .store()
        .set_durable(stub.as_ref(), SESSION, req.body(), Some(600), None, None)
        .await?;
    Ok(Outcome::json(&record)?)
}

// GET /session
async fn read_session(inv: Invocation, _: Arc<RouteDescriptor>, _: Request) -> Outcome {
    let Some(stub) = inv.durable(SESSION) else {
        return Outcome::not_found();
    };
    match inv.store().get_durable(stub.as_ref(), SESSION, None).await {
        Some(value) => Outcome::ok(json!({ "session": value })),
        None => Outcome::not_found(),
    }
}
