//! HTTP serving for routed plugins.
//!
//! Every plugin with a route gets a handler that forwards the request to an
//! [`EventBridge`]. Plugin code is synchronous, so each request runs on the
//! blocking pool.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, OnceLock};

use axum::extract::Query;
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{on, MethodFilter};
use axum::Router;
use tokio::net::TcpListener;

use crate::bridge::{EventBridge, Request, RequestMethod};
use crate::error::Result;
use crate::pipeline::Pipeline;

/// Web application built from a pipeline's routed plugins.
pub struct WebApp {
    pipeline: Arc<Pipeline>,
    debug: bool,
    router: OnceLock<Router>,
}

impl WebApp {
    /// Create an application; the router is built on first use.
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            pipeline,
            debug: false,
            router: OnceLock::new(),
        }
    }

    /// Use an already built router instead of building one.
    pub fn with_router(pipeline: Arc<Pipeline>, router: Router) -> Self {
        let app = Self::new(pipeline);
        let _ = app.router.set(router);
        app
    }

    /// Expose error text in 500 responses.
    ///
    /// Has no effect once the router is built.
    pub fn with_debug(mut self, debug: bool) -> Self {
        if self.router.get().is_some() {
            tracing::warn!("router already built, debug setting ignored");
        }
        self.debug = debug;
        self
    }

    /// Get the pipeline.
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Check if error responses carry the error text.
    pub fn is_debug(&self) -> bool {
        self.debug
    }

    /// The router, building it if needed.
    pub fn router(&self) -> Router {
        self.router
            .get_or_init(|| build_router(&self.pipeline, self.debug))
            .clone()
    }

    /// Bind `host:port` and serve until the server stops.
    pub async fn serve(&self, host: &str, port: u16) -> Result<()> {
        let listener = TcpListener::bind((host, port)).await?;
        self.serve_on(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve_on(&self, listener: TcpListener) -> Result<()> {
        let router = self.router();
        tracing::info!(addr = ?listener.local_addr().ok(), debug = self.debug, "serving");
        axum::serve(listener, router).await?;
        Ok(())
    }
}

impl std::fmt::Debug for WebApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebApp")
            .field("routes", &self.pipeline.registry().routed().len())
            .field("debug", &self.debug)
            .field("built", &self.router.get().is_some())
            .finish()
    }
}

/// Register every routed plugin of `pipeline` on a new router.
///
/// Routes that do not start with `/` or that were already registered by an
/// earlier plugin are skipped.
pub fn build_router(pipeline: &Arc<Pipeline>, debug: bool) -> Router {
    let mut router = Router::new();
    let mut seen = HashSet::new();

    for plugin in pipeline.registry().routed() {
        let Some(route) = plugin.route().map(str::to_string) else {
            continue;
        };
        if !route.starts_with('/') {
            tracing::warn!(
                plugin = plugin.id(),
                route = %route,
                "route must start with '/', skipping"
            );
            continue;
        }
        if !seen.insert(route.clone()) {
            tracing::warn!(
                plugin = plugin.id(),
                route = %route,
                "route already registered, skipping"
            );
            continue;
        }

        let filter = method_filter(plugin.methods());
        let bridge = EventBridge::new(pipeline.clone(), plugin.clone());
        tracing::debug!(plugin = plugin.id(), route = %route, "registered route");

        router = router.route(
            &route,
            on(
                filter,
                move |method: Method,
                      uri: Uri,
                      Query(query): Query<BTreeMap<String, String>>,
                      body: String| {
                    let bridge = bridge.clone();
                    async move { dispatch(bridge, method, uri, query, body, debug).await }
                },
            ),
        );
    }
    router
}

fn method_filter(methods: &[RequestMethod]) -> MethodFilter {
    let mut filters = methods.iter().map(|m| match m {
        RequestMethod::Get => MethodFilter::GET,
        RequestMethod::Post => MethodFilter::POST,
        RequestMethod::Put => MethodFilter::PUT,
        RequestMethod::Patch => MethodFilter::PATCH,
        RequestMethod::Delete => MethodFilter::DELETE,
    });
    let first = filters.next().unwrap_or(MethodFilter::GET);
    filters.fold(first, MethodFilter::or)
}

async fn dispatch(
    bridge: EventBridge,
    method: Method,
    uri: Uri,
    query: BTreeMap<String, String>,
    body: String,
    debug: bool,
) -> Response {
    let Some(method) = RequestMethod::parse(method.as_str()) else {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    };
    let request = Request {
        method,
        path: uri.path().to_string(),
        query,
        body,
    };

    let outcome = tokio::task::spawn_blocking(move || bridge.handle(&request)).await;
    match outcome {
        Ok(Ok(payload)) => {
            ([(header::CONTENT_TYPE, payload.content_type)], payload.body).into_response()
        }
        Ok(Err(err)) => error_response(err.to_string(), debug),
        Err(join) => {
            tracing::error!(error = %join, "request handler panicked");
            error_response(join.to_string(), debug)
        }
    }
}

fn error_response(message: String, debug: bool) -> Response {
    let body = if debug {
        message
    } else {
        "Internal Server Error".to_string()
    };
    (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_filter() {
        assert_eq!(method_filter(&[]), MethodFilter::GET);
        assert_eq!(
            method_filter(&[RequestMethod::Get, RequestMethod::Post]),
            MethodFilter::GET.or(MethodFilter::POST)
        );
    }
}
