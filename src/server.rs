//! Standalone HTTP server and graceful shutdown.
//!
//! Hosted platforms hand requests straight to [`Service::handle_request`];
//! everywhere else [`Server`] puts a service behind hyper.
//!
//! # Graceful shutdown
//!
//! On **SIGTERM** or Ctrl-C the server:
//! 1. Stops accepting connections.
//! 2. Lets every in-flight connection finish, which includes delivering the
//!    trace records of its invocations.
//! 3. Returns from [`Server::serve`].
//!
//! Give the orchestrator a termination grace period longer than the slowest
//! request.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::method::Method;
use crate::request::Request;
use crate::response::{ApiError, Response};
use crate::service::Service;

/// Headers consulted for the client address, in order, before the peer address.
const CLIENT_IP_HEADERS: [&str; 3] = ["ip", "x-real-ip", "cf-connecting-ip"];

pub struct Server {
    addr: String,
}

impl Server {
    /// Configures the address [`serve`](Server::serve) binds to.
    ///
    /// ```rust,no_run
    /// use svcbase::Server;
    /// let server = Server::bind("0.0.0.0:3000");
    /// ```
    pub fn bind(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// Accepts connections and hands every request to `service`.
    ///
    /// Fails with [`Error::Config`] on an invalid address. Returns after a
    /// full graceful shutdown.
    pub async fn serve(self, service: Service) -> Result<()> {
        let addr: SocketAddr = self
            .addr
            .parse()
            .map_err(|e| Error::Config(format!("invalid socket address `{}`: {e}", self.addr)))?;
        let listener = TcpListener::bind(addr).await?;
        let service = Arc::new(service);

        info!(%addr, service = %service.name(), "listening");

        let mut tasks = tokio::task::JoinSet::new();
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                // Shutdown is checked first so a signal stops accepting at once.
                biased;

                () = &mut shutdown => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, peer) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let service = Arc::clone(&service);
                    let io = TokioIo::new(stream);

                    tasks.spawn(async move {
                        let svc = service_fn(move |req| {
                            let service = Arc::clone(&service);
                            async move { dispatch(service, req, peer).await }
                        });

                        if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                            .serve_connection(io, svc)
                            .await
                        {
                            error!(%peer, "connection error: {e}");
                        }
                    });
                }

                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        while tasks.join_next().await.is_some() {}

        info!(service = %service.name(), "stopped");
        Ok(())
    }
}

// ── Request dispatch ──────────────────────────────────────────────────────────

async fn dispatch(
    service: Arc<Service>,
    req: hyper::Request<hyper::body::Incoming>,
    peer: SocketAddr,
) -> std::result::Result<http::Response<Full<Bytes>>, Infallible> {
    let method = match Method::try_from(req.method()) {
        Ok(method) => method,
        Err(e) => return Ok(rejected(405, &e, peer).into_http()),
    };
    let response = match read_request(method, req, peer).await {
        Ok(request) => service.handle_request(request).await,
        Err(e) => rejected(400, &e, peer),
    };
    Ok(response.into_http())
}

fn rejected(status: u16, e: &Error, peer: SocketAddr) -> Response {
    warn!(%peer, status, "rejected request: {e}");
    Response::json(status, &ApiError::new(e.code(), e.to_string()))
}

async fn read_request(method: Method, req: hyper::Request<hyper::body::Incoming>, peer: SocketAddr) -> Result<Request> {
    let (parts, body) = req.into_parts();

    let host = parts
        .headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| parts.uri.authority().map(|a| a.as_str()));
    let target = parts.uri.path_and_query().map_or("/", |pq| pq.as_str());
    let url = match host {
        Some(host) => format!("http://{host}{target}"),
        None => target.to_owned(),
    };

    let mut request = Request::new(method, &url)?;
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            request = request.header_pair(name.as_str(), value);
        }
    }

    let body = body
        .collect()
        .await
        .map_err(|e| Error::Validation(format!("cannot read request body: {e}")))?
        .to_bytes();
    let ip = client_ip(request.headers(), peer);
    Ok(request.body_text(String::from_utf8_lossy(&body).into_owned()).client_ip(ip))
}

fn client_ip(headers: &[(String, String)], peer: SocketAddr) -> String {
    CLIENT_IP_HEADERS
        .iter()
        .find_map(|name| {
            headers
                .iter()
                .find(|(k, v)| k.eq_ignore_ascii_case(name) && !v.is_empty())
                .map(|(_, v)| v.clone())
        })
        .unwrap_or_else(|| peer.ip().to_string())
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on SIGTERM or Ctrl-C. A handler that cannot be installed never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
