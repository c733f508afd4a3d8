//! HTTP value objects exchanged with inbound endpoints, and the path table
//! applications mount their inbound endpoints on.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use workflow::{Context, FlowError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            "HEAD" => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            other => Err(format!("unsupported HTTP method '{other}'")),
        }
    }
}

/// An inbound HTTP call, already decoded by the transport.
///
/// `path` is relative to the service root, e.g. `/shop/order`. Parameters
/// merge the query string and form fields.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub params: HashMap<String, String>,
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HashMap::new(),
            params: HashMap::new(),
            body: None,
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Header lookup; names are case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// The reply an inbound endpoint produces. Defaults to `200` with no body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self {
            status: 200,
            headers: BTreeMap::new(),
            body: None,
        }
    }
}

impl HttpResponse {
    pub fn ok(body: Value) -> Self {
        Self::default().with_body(body)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

// ---------------------------------------------------------------------------
// Path mounting
// ---------------------------------------------------------------------------

/// Where applications mount the paths of their inbound endpoints.
pub trait HttpRegistrar: Send + Sync {
    /// Route requests for `path` to `application_id`.
    fn register_http_path(&self, path: &str, application_id: &str, ctx: &Context) -> Result<(), FlowError>;

    fn unregister_http_path(&self, path: &str, ctx: &Context) -> Result<(), FlowError>;
}

/// In-process [`HttpRegistrar`]: a table from mounted path to application id.
///
/// Cheap to clone; clones share the table. The HTTP server resolves each
/// request path through it before handing the request to the application.
#[derive(Debug, Clone, Default)]
pub struct HttpRoutes {
    paths: Arc<RwLock<HashMap<String, String>>>,
}

impl HttpRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    /// The application mounted at `path`.
    pub fn resolve(&self, path: &str) -> Option<String> {
        self.paths
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    /// Every mounted `(path, application id)`, sorted by path.
    pub fn routes(&self) -> Vec<(String, String)> {
        let mut routes: Vec<_> = self
            .paths
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(path, app)| (path.clone(), app.clone()))
            .collect();
        routes.sort();
        routes
    }
}

impl HttpRegistrar for HttpRoutes {
    fn register_http_path(&self, path: &str, application_id: &str, _ctx: &Context) -> Result<(), FlowError> {
        self.paths
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_owned(), application_id.to_owned());
        info!(path, application_id, "http path mounted");
        Ok(())
    }

    fn unregister_http_path(&self, path: &str, _ctx: &Context) -> Result<(), FlowError> {
        if self
            .paths
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path)
            .is_some()
        {
            info!(path, "http path unmounted");
        }
        Ok(())
    }
}
