//! Bridge from externally delivered requests back into the execute stage.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::pipeline::Pipeline;
use crate::plugin::PluginHandle;

/// Request methods a plugin route may accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RequestMethod {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// PATCH
    Patch,
    /// DELETE
    Delete,
}

impl RequestMethod {
    /// Parse an HTTP method name, case-insensitively.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "PATCH" => Some(Self::Patch),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }

    /// Upper-case method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for RequestMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request data handed to [`crate::Plugin::respond`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Request {
    /// Request method.
    pub method: RequestMethod,
    /// Request path.
    pub path: String,
    /// Query parameters.
    pub query: BTreeMap<String, String>,
    /// Raw body.
    pub body: String,
}

impl Request {
    /// Create a request with an empty body and query.
    pub fn new(method: RequestMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: BTreeMap::new(),
            body: String::new(),
        }
    }

    /// Create a GET request.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(RequestMethod::Get, path)
    }

    /// Create a POST request with a body.
    pub fn post(path: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(RequestMethod::Post, path).with_body(body)
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Add a query parameter.
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }
}

/// Response body returned to the web collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Payload {
    /// Body text.
    pub body: String,
    /// MIME type of the body.
    pub content_type: String,
}

impl Payload {
    /// Plain text payload.
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            content_type: "text/plain; charset=utf-8".to_string(),
        }
    }

    /// HTML payload.
    pub fn html(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            content_type: "text/html; charset=utf-8".to_string(),
        }
    }

    /// JSON payload.
    pub fn json(value: &serde_json::Value) -> Self {
        Self {
            body: value.to_string(),
            content_type: "application/json".to_string(),
        }
    }
}

/// Wraps one plugin's `respond` so that a produced event re-runs the execute stage.
///
/// External callers go through [`EventBridge::handle`] and never call
/// `respond` directly. The response and the triggered pass happen under the
/// pipeline's single lock, so overlapping requests are serialized.
#[derive(Clone)]
pub struct EventBridge {
    pipeline: Arc<Pipeline>,
    plugin: PluginHandle,
}

impl EventBridge {
    /// Bridge `plugin` into `pipeline`.
    pub fn new(pipeline: Arc<Pipeline>, plugin: PluginHandle) -> Self {
        Self { pipeline, plugin }
    }

    /// Bridge the loaded plugin registered under `id`.
    pub fn for_plugin(pipeline: Arc<Pipeline>, id: &str) -> Result<Self> {
        let plugin = pipeline
            .registry()
            .get(id)
            .ok_or_else(|| Error::plugin_not_found(id))?;
        Ok(Self::new(pipeline, plugin))
    }

    /// The wrapped plugin.
    pub fn plugin(&self) -> &PluginHandle {
        &self.plugin
    }

    /// Answer `request`; when an event is produced, run one execute pass first.
    pub fn handle(&self, request: &Request) -> Result<Payload> {
        self.pipeline.respond(&self.plugin, request)
    }
}

impl std::fmt::Debug for EventBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBridge")
            .field("plugin", &self.plugin.id())
            .finish()
    }
}
