//! Building blocks for the `switchboard-consume` binary.
//!
//! Routes are bound to handlers by name. Bindings come from the `routes`
//! table of the rpc configuration, an optional routes file and `--route`
//! flags, applied in that order so later sources override earlier ones.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{json, Value};
use switchboard_core::time::{rfc3339_now, unix_timestamp};
use switchboard_core::RpcConfig;
use switchboard_rpc::{Handler, HandlerResult, Meta, Responder};
use tracing::debug;

/// Route answered by every responder started from the command line
pub const PING_ROUTE: &str = "ping";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BindingError {
    #[error("expected ROUTE=HANDLER, got {0:?}")]
    MissingSeparator(String),
    #[error("route name is empty in {0:?}")]
    EmptyRoute(String),
    #[error("handler name is empty in {0:?}")]
    EmptyHandler(String),
}

/// One `route=handler` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteBinding {
    pub route: String,
    pub handler: String,
}

impl RouteBinding {
    pub fn new(route: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            handler: handler.into(),
        }
    }
}

impl FromStr for RouteBinding {
    type Err = BindingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (route, handler) = s
            .split_once('=')
            .ok_or_else(|| BindingError::MissingSeparator(s.to_owned()))?;
        let (route, handler) = (route.trim(), handler.trim());
        if route.is_empty() {
            return Err(BindingError::EmptyRoute(s.to_owned()));
        }
        if handler.is_empty() {
            return Err(BindingError::EmptyHandler(s.to_owned()));
        }
        Ok(Self::new(route, handler))
    }
}

impl fmt::Display for RouteBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.route, self.handler)
    }
}

/// Handlers that bindings can refer to by name
#[derive(Clone, Default)]
pub struct HandlerCatalog {
    handlers: IndexMap<String, Arc<dyn Handler>>,
}

impl HandlerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding `echo` (returns its payload) and `time` (returns the
    /// responder's clock).
    pub fn builtin() -> Self {
        Self::new()
            .with("echo", |payload: Value, _meta: Meta| async move { Ok(payload) })
            .with("time", |_payload: Value, _meta: Meta| async move {
                Ok(json!({ "at": rfc3339_now(), "unix": unix_timestamp() }))
            })
    }

    pub fn with<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value, Meta) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(name, Arc::new(handler));
        self
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

/// Liveness handler reporting which endpoint answered
pub fn ping_handler(endpoint: &str) -> Arc<dyn Handler> {
    let endpoint = endpoint.to_owned();
    Arc::new(move |_payload: Value, _meta: Meta| {
        let endpoint = endpoint.clone();
        async move {
            Ok(json!({
                "ok": true,
                "at": rfc3339_now(),
                "endpoint": endpoint,
            }))
        }
    })
}

#[derive(Debug, Default, Deserialize)]
struct RoutesFile {
    #[serde(default)]
    routes: IndexMap<String, String>,
}

/// Read bindings from a TOML file with a `[routes]` table of
/// `route = "handler"` entries.
pub fn load_routes_file(path: &Path) -> anyhow::Result<Vec<RouteBinding>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading routes file {}", path.display()))?;
    parse_routes(&contents).with_context(|| format!("parsing routes file {}", path.display()))
}

fn parse_routes(contents: &str) -> anyhow::Result<Vec<RouteBinding>> {
    let file: RoutesFile = toml::from_str(contents)?;
    Ok(file
        .routes
        .into_iter()
        .map(|(route, handler)| RouteBinding::new(route, handler))
        .collect())
}

/// Assemble the responder for `endpoint`.
///
/// Unknown handler names are an error. The `ping` route is bound last and
/// cannot be overridden.
pub fn build_responder(
    endpoint: &str,
    config: &RpcConfig,
    file_routes: &[RouteBinding],
    cli_routes: &[RouteBinding],
    catalog: &HandlerCatalog,
) -> anyhow::Result<Responder> {
    let queue = config.queue_for(endpoint);
    let mut responder = Responder::new(queue).durable(config.broker.durable);

    let configured = config
        .routes_for(endpoint)
        .map(|(route, handler)| RouteBinding::new(route, handler));
    let bindings = configured.chain(file_routes.iter().cloned()).chain(cli_routes.iter().cloned());

    for binding in bindings {
        let Some(handler) = catalog.get(&binding.handler) else {
            let known: Vec<_> = catalog.names().collect();
            bail!(
                "route {:?} refers to unknown handler {:?} (known: {})",
                binding.route,
                binding.handler,
                known.join(", ")
            );
        };
        debug!(route = %binding.route, handler = %binding.handler, "binding route");
        responder = responder.handle_arc(binding.route, handler);
    }

    Ok(responder.handle_arc(PING_ROUTE, ping_handler(endpoint)))
}
