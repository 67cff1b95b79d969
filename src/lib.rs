//! # svcbase
//!
//! The shared base of small backend services: one way to route a request,
//! keep per-service state and tell the outside world what happened.
//!
//! ## What a service gets
//!
//! - **Routing**: an ordered table of method + URL patterns, first match
//!   wins. Every table describes itself on `POST /std/requests` and
//!   `POST /std/requests/:req_id`.
//! - **Uniform envelopes**: handlers return an [`Outcome`]; clients always
//!   receive JSON, either the result or `{code, message, trace, data?}`.
//! - **Keyed state**: [`KeyedStore`] over a key-value namespace or a durable
//!   single-record actor, encrypted per key when a passphrase is given.
//! - **Traces**: inbound, outbound and sub-request records on queue
//!   channels, with secrets masked, including ones first seen in a
//!   downstream response. Correlation id and trace level travel with every
//!   sub-request and queue message.
//!
//! What stays outside: the storage engine, the queue transport, the fetch
//! primitive and process wiring. Each is reached through a trait
//! ([`KvNamespace`], [`Queue`], [`Fetcher`], [`DurableStub`]) with an
//! in-memory implementation for tests.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use svcbase::{Invocation, Method, Outcome, Request, RouteDescriptor, RoutePattern, Server, Service, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> svcbase::Result<()> {
//!     let service = Service::builder("notes")
//!         .config(ServiceConfig::from_env(&[])?)
//!         .route(RoutePattern::new("get_note", "Read a note", Method::Get, "/notes/:id", get_note))
//!         .build()?;
//!
//!     Server::bind("0.0.0.0:3000").serve(service).await
//! }
//!
//! async fn get_note(inv: Invocation, _: Arc<RouteDescriptor>, req: Request) -> svcbase::Result<Outcome> {
//!     let id = req.param("id").unwrap_or_default();
//!     match inv.store().get(id, None).await? {
//!         Some(text) => Ok(Outcome::ok(json!({ "id": id, "text": text }))),
//!         None => Ok(Outcome::not_found()),
//!     }
//! }
//! ```

mod error;
mod handler;
mod invocation;
mod method;
mod pattern;
mod request;
mod response;
mod router;
mod server;
mod service;

pub mod channel;
pub mod config;
pub mod crypto;
pub mod durable;
pub mod fetch;
pub mod kv;
pub mod lifecycle;
pub mod store;
pub mod trace;

pub use channel::{Channels, MemoryQueue, Queue};
pub use config::{ExceptionPolicy, LogPolicy, ServiceConfig, TraceLevel};
pub use crypto::{AesGcmCipher, CipherProvider};
pub use durable::{DurableRecord, DurableRecordActor, DurableRecordClient, DurableStub};
pub use error::{Error, Result};
pub use fetch::{Fetcher, FnFetcher, OutboundRequest, OutboundResponse};
pub use handler::Handler;
pub use invocation::Invocation;
pub use kv::{KvNamespace, MemoryKv};
pub use lifecycle::{CronRun, QueueBatch, QueueMessage};
pub use method::Method;
pub use pattern::UrlPattern;
pub use request::Request;
pub use response::{ApiError, IntoOutcome, Lang, Outcome, Response, ResponseBuilder};
pub use router::{ALL_REQUESTS_ID, REQUEST_PARAMS_ID, RouteDescriptor, RoutePattern, RouteTable, build_route_table};
pub use server::Server;
pub use service::{Service, ServiceBuilder};
pub use store::{KeyedStore, StoredRecord};
pub use trace::{RedactionSet, SensitiveFields, ServiceIdentity};
