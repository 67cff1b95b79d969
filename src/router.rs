//! Ordered route table with self-description.
//!
//! Routes are tried in registration order; the first whose method and URL
//! pattern match wins, and exactly one handler runs per request. Every table
//! ends with two introspection routes, appended by [`build_route_table`]:
//!
//! | id | path | answers with |
//! |---|---|---|
//! | `all_requests_id` | `/std/requests` | every route plus the service's runtime variables |
//! | `request_params_id` | `/std/requests/:req_id` | one route's descriptor and its test fixture |

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::handler::{BoxedHandler, Handler};
use crate::invocation::Invocation;
use crate::method::Method;
use crate::pattern::UrlPattern;
use crate::request::Request;
use crate::response::Outcome;

pub const ALL_REQUESTS_ID: &str = "all_requests_id";
pub const REQUEST_PARAMS_ID: &str = "request_params_id";

/// Everything a route declares about itself.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RouteDescriptor {
    pub id: String,
    pub description: String,
    pub pathname: String,
    pub method: Method,
    pub search: Option<String>,
    pub category: Option<String>,
    /// Literal fixture published for contract testing.
    pub test: Option<Value>,
}

impl RouteDescriptor {
    /// Public URL of the route on `service`.
    pub fn url(&self, service: &str) -> String {
        match &self.search {
            Some(search) => format!("https://{service}{}?{search}", self.pathname),
            None => format!("https://{service}{}", self.pathname),
        }
    }
}

enum RouteAction {
    Handler(BoxedHandler),
    AllRequests,
    RequestParams,
}

/// A route before compilation: descriptor plus handler.
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use svcbase::{Invocation, Method, Outcome, Request, RouteDescriptor, RoutePattern};
/// # async fn token(_: Invocation, _: Arc<RouteDescriptor>, _: Request) -> Outcome { Outcome::not_found() }
/// RoutePattern::new("token_id", "Exchange a code for a token", Method::Post, "/token", token)
///     .search("code=:code")
///     .category("auth");
/// ```
pub struct RoutePattern {
    descriptor: RouteDescriptor,
    action: RouteAction,
}

impl RoutePattern {
    pub fn new(id: &str, description: &str, method: Method, pathname: &str, handler: impl Handler) -> Self {
        Self::with_action(id, description, method, pathname, RouteAction::Handler(handler.into_boxed_handler()))
    }

    fn with_action(id: &str, description: &str, method: Method, pathname: &str, action: RouteAction) -> Self {
        Self {
            descriptor: RouteDescriptor {
                id: id.to_owned(),
                description: description.to_owned(),
                pathname: pathname.to_owned(),
                method,
                search: None,
                category: None,
                test: None,
            },
            action,
        }
    }

    pub fn search(mut self, template: &str) -> Self {
        self.descriptor.search = Some(template.to_owned());
        self
    }

    pub fn category(mut self, category: &str) -> Self {
        self.descriptor.category = Some(category.to_owned());
        self
    }

    pub fn test_fixture(mut self, fixture: Value) -> Self {
        self.descriptor.test = Some(fixture);
        self
    }
}

struct CompiledRoute {
    descriptor: Arc<RouteDescriptor>,
    pattern: UrlPattern,
    action: RouteAction,
}

/// The compiled, ordered route table of one service.
pub struct RouteTable {
    routes: Vec<CompiledRoute>,
}

/// Compiles `user_routes` in order and appends the two introspection routes.
pub fn build_route_table(user_routes: Vec<RoutePattern>) -> Result<RouteTable> {
    let builtins = [
        RoutePattern::with_action(
            ALL_REQUESTS_ID,
            "Describe every supported request",
            Method::Post,
            "/std/requests",
            RouteAction::AllRequests,
        ),
        RoutePattern::with_action(
            REQUEST_PARAMS_ID,
            "Describe one request and its test fixture",
            Method::Post,
            "/std/requests/:req_id",
            RouteAction::RequestParams,
        ),
    ];

    let routes = user_routes
        .into_iter()
        .chain(builtins)
        .map(|route| {
            let pattern = UrlPattern::new(&route.descriptor.pathname, route.descriptor.search.as_deref())?;
            Ok(CompiledRoute { descriptor: Arc::new(route.descriptor), pattern, action: route.action })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(RouteTable { routes })
}

impl RouteTable {
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &RouteDescriptor> {
        self.routes.iter().map(|route| route.descriptor.as_ref())
    }

    pub fn find(&self, id: &str) -> Option<&RouteDescriptor> {
        self.descriptors().find(|descriptor| descriptor.id == id)
    }

    /// Id of the first route matching `method`, `path` and `query`.
    pub fn resolve(&self, method: Method, path: &str, query: Option<&str>) -> Option<&str> {
        self.lookup(method, path, query).map(|(route, _)| route.descriptor.id.as_str())
    }

    fn lookup(&self, method: Method, path: &str, query: Option<&str>) -> Option<(&CompiledRoute, HashMap<String, String>)> {
        self.routes
            .iter()
            .filter(|route| route.descriptor.method == method)
            .find_map(|route| route.pattern.matches(path, query).map(|params| (route, params)))
    }

    /// Runs the first matching route. `None` when nothing matches.
    ///
    /// A user handler runs in its own task: a panic is reported like any
    /// other handler error.
    pub(crate) async fn dispatch(&self, inv: &Invocation, req: Request) -> Option<Result<Outcome>> {
        let (route, params) = self.lookup(req.method(), req.path(), req.query())?;
        debug!(route = %route.descriptor.id, correlation_id = %inv.identity().id, "route matched");
        let req = req.with_params(params);

        let outcome = match &route.action {
            RouteAction::Handler(handler) => {
                let fut = handler.call(inv.clone(), Arc::clone(&route.descriptor), req);
                match tokio::spawn(fut).await {
                    Ok(outcome) => outcome,
                    Err(join) => {
                        error!(route = %route.descriptor.id, "handler task failed: {join}");
                        Err(Error::Validation(format!("handler `{}` failed: {join}", route.descriptor.id)))
                    }
                }
            }
            RouteAction::AllRequests => Ok(self.all_requests(inv)),
            RouteAction::RequestParams => Ok(self.request_params(inv, req.param("req_id").unwrap_or_default())),
        };
        Some(outcome)
    }

    fn all_requests(&self, inv: &Invocation) -> Outcome {
        let name = inv.service_name();
        let params: Vec<Value> = self
            .descriptors()
            .map(|d| {
                json!({
                    "id": d.id,
                    "name": name,
                    "descr": d.description,
                    "url": d.url(name),
                    "method": d.method.as_lower(),
                    "category": d.category,
                })
            })
            .collect();
        Outcome::ok(json!({ "vars": inv.config().published_vars(), "params": params }))
    }

    fn request_params(&self, inv: &Invocation, req_id: &str) -> Outcome {
        let name = inv.service_name();
        match self.find(req_id) {
            Some(d) => Outcome::ok(json!({
                "name": name,
                "id": d.id,
                "descr": d.description,
                "url": d.url(name),
                "method": d.method.as_lower(),
                "category": d.category,
                "test": d.test,
            })),
            None => Outcome::not_found(),
        }
    }
}
