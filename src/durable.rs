//! Single-record durable actor and its wire protocol.
//!
//! One actor owns exactly one record. Every request is processed in arrival
//! order by the actor's own task, so a reader never observes a torn write and
//! two writers never interleave. Callers talk to it through [`DurableStub`],
//! a small JSON request/response protocol on the synthetic path `v1/kv`:
//!
//! | Method | Body | Response |
//! |---|---|---|
//! | `GET` | | `200 {key,value,expire,meta}` or `404 {"error":"NOT_FOUND"}` |
//! | `POST` | `{key,value,expire?,meta?}` | `200` echo of the stored record |
//! | `DELETE` | | `200 "DELETE SUCCESS"` |
//!
//! A write with `expire > 0` (milliseconds) arms a single wake-up timer at
//! `now + expire`; a later write re-arms or cancels it. When the timer fires
//! the record is cleared exactly as a `DELETE` would.
//!
//! ```text
//! EMPTY ──write──▶ STORED ──write(expire>0)──▶ ARMED
//!   ▲                 │                          │
//!   └──── delete ─────┴──── delete / timer ──────┘
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::kv::Metadata;
use crate::method::Method;

pub const DURABLE_PATH: &str = "v1/kv";
pub const DELETE_SUCCESS: &str = "DELETE SUCCESS";

/// The record held by one actor.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DurableRecord {
    pub key: String,
    pub value: String,
    /// Milliseconds until the record is cleared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Metadata>,
}

#[derive(Clone, Debug)]
pub struct StubRequest {
    pub method: Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StubResponse {
    pub status: u16,
    pub body: String,
}

impl StubResponse {
    fn json(status: u16, body: &impl Serialize) -> Self {
        let body = serde_json::to_string(body).unwrap_or_else(|_| "null".to_owned());
        Self { status, body }
    }
}

/// Handle to a remote durable record.
#[async_trait]
pub trait DurableStub: Send + Sync {
    async fn fetch(&self, request: StubRequest) -> Result<StubResponse>;
}

enum Command {
    Fetch { request: StubRequest, respond_to: oneshot::Sender<StubResponse> },
    Alarm { respond_to: oneshot::Sender<()> },
}

/// Server half: owns the record and the timer.
pub struct DurableRecordActor {
    name: String,
    receiver: mpsc::Receiver<Command>,
    record: Option<DurableRecord>,
    alarm: Option<Instant>,
}

impl DurableRecordActor {
    /// Creates the actor and a client for it. Spawn [`run`](Self::run) to serve.
    pub fn new(name: impl Into<String>, buffer_size: usize) -> (Self, DurableRecordClient) {
        let (sender, receiver) = mpsc::channel(buffer_size);
        let actor = Self { name: name.into(), receiver, record: None, alarm: None };
        (actor, DurableRecordClient { sender })
    }

    /// Processes commands until every client is dropped.
    pub async fn run(mut self) {
        info!(actor = %self.name, "durable record started");

        loop {
            let deadline = self.alarm;
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;

                msg = self.receiver.recv() => match msg {
                    Some(Command::Fetch { request, respond_to }) => {
                        let response = self.handle(request);
                        let _ = respond_to.send(response);
                    }
                    Some(Command::Alarm { respond_to }) => {
                        self.on_alarm();
                        let _ = respond_to.send(());
                    }
                    None => break,
                },

                () = timer => self.on_alarm(),
            }
        }

        info!(actor = %self.name, "durable record stopped");
    }

    fn handle(&mut self, request: StubRequest) -> StubResponse {
        if request.path.trim_start_matches('/') != DURABLE_PATH {
            return StubResponse::json(404, &json!({ "error": "NOT_FOUND" }));
        }

        match request.method {
            Method::Get => match &self.record {
                Some(record) => StubResponse::json(200, record),
                None => StubResponse::json(404, &json!({ "error": "NOT_FOUND" })),
            },
            Method::Post => self.write(request.body.as_deref().unwrap_or_default()),
            Method::Delete => {
                self.clear();
                debug!(actor = %self.name, "record deleted");
                StubResponse::json(200, &DELETE_SUCCESS)
            }
            other => StubResponse::json(405, &json!({ "error": format!("{other} not allowed") })),
        }
    }

    fn write(&mut self, body: &str) -> StubResponse {
        let record: DurableRecord = match serde_json::from_str(body) {
            Ok(record) => record,
            Err(e) => {
                warn!(actor = %self.name, error = %e, "rejected malformed write");
                return StubResponse::json(400, &json!({ "error": e.to_string() }));
            }
        };

        self.alarm = record
            .expire
            .filter(|ms| *ms > 0)
            .and_then(|ms| Instant::now().checked_add(Duration::from_millis(ms)));
        debug!(actor = %self.name, key = %record.key, armed = self.alarm.is_some(), "record stored");

        let response = StubResponse::json(200, &record);
        self.record = Some(record);
        response
    }

    fn on_alarm(&mut self) {
        debug!(actor = %self.name, "alarm fired");
        self.clear();
    }

    fn clear(&mut self) {
        self.record = None;
        self.alarm = None;
    }
}

/// Client half. Cheap to clone; every clone talks to the same actor.
#[derive(Clone)]
pub struct DurableRecordClient {
    sender: mpsc::Sender<Command>,
}

impl DurableRecordClient {
    /// Fires the wake-up timer now, whether or not one is armed.
    pub async fn fire_alarm(&self) -> Result<()> {
        let (respond_to, rx) = oneshot::channel();
        self.sender
            .send(Command::Alarm { respond_to })
            .await
            .map_err(|_| Error::Store("durable record actor is gone".into()))?;
        rx.await.map_err(|_| Error::Store("durable record actor dropped the alarm".into()))
    }
}

#[async_trait]
impl DurableStub for DurableRecordClient {
    async fn fetch(&self, request: StubRequest) -> Result<StubResponse> {
        let (respond_to, rx) = oneshot::channel();
        self.sender
            .send(Command::Fetch { request, respond_to })
            .await
            .map_err(|_| Error::Store("durable record actor is gone".into()))?;
        rx.await.map_err(|_| Error::Store("durable record actor dropped the request".into()))
    }
}
