//! Immutable request template shared by every worker.

use std::fmt;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use http::{Method, Request, Uri};
use http_body_util::Full;

use crate::config::ConfigError;

/// Optional header values applied on top of the defaults.
#[derive(Debug, Clone, Default)]
pub struct HeaderOverrides {
    pub authorization: Option<String>,
    pub geolocation: Option<String>,
    pub content_type: Option<String>,
    pub api_user_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

/// A validated `http://` target.
#[derive(Debug, Clone)]
pub struct Target {
    raw: String,
    uri: Uri,
    host: String,
    port: u16,
}

impl Target {
    /// Parse and validate an absolute `http://` URL.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let uri: Uri = raw.parse().map_err(|e: http::uri::InvalidUri| {
            ConfigError::InvalidTarget {
                url: raw.to_string(),
                reason: e.to_string(),
            }
        })?;

        match uri.scheme_str() {
            Some("http") => {}
            Some(other) => {
                return Err(ConfigError::UnsupportedScheme {
                    url: raw.to_string(),
                    scheme: other.to_string(),
                })
            }
            None => {
                return Err(ConfigError::InvalidTarget {
                    url: raw.to_string(),
                    reason: "URL must be absolute (http://host[:port]/path)".to_string(),
                })
            }
        }

        let host = match uri.host() {
            Some(h) if !h.is_empty() => h.trim_start_matches('[').trim_end_matches(']').to_string(),
            _ => {
                return Err(ConfigError::InvalidTarget {
                    url: raw.to_string(),
                    reason: "missing host".to_string(),
                })
            }
        };
        let port = uri.port_u16().unwrap_or(80);

        Ok(Self {
            raw: raw.to_string(),
            uri,
            host,
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` key used to decide whether a connection can be reused.
    pub fn authority(&self) -> String {
        match self.uri.authority() {
            Some(a) => a.as_str().to_string(),
            None => format!("{}:{}", self.host, self.port),
        }
    }

    /// Path and query in origin form, `/` when the URL has no path.
    pub fn origin_form(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("/")
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

// ---------------------------------------------------------------------------
// RequestTemplate
// ---------------------------------------------------------------------------

/// Method, headers, targets and body to send. Built once, then shared
/// read-only by all workers.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    targets: Vec<Target>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
    keep_alive: bool,
}

impl RequestTemplate {
    pub fn builder() -> TemplateBuilder {
        TemplateBuilder::default()
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Build the request for `target`.
    ///
    /// The request line uses origin form and the `Host` header carries the
    /// authority, as an HTTP/1.1 client connection expects.
    pub fn request_for(&self, target: &Target) -> Result<Request<Full<Bytes>>, http::Error> {
        let mut builder = Request::builder()
            .method(self.method.clone())
            .uri(target.origin_form())
            .header(HOST, target.authority());

        if let Some(headers) = builder.headers_mut() {
            for (name, value) in &self.headers {
                headers.insert(name.clone(), value.clone());
            }
        }

        builder.body(Full::new(self.body.clone()))
    }
}

/// Builder for [`RequestTemplate`]; all validation happens in [`build`](Self::build).
#[derive(Debug, Default)]
pub struct TemplateBuilder {
    targets: Vec<String>,
    method: Option<String>,
    headers: HeaderOverrides,
    body: Option<Bytes>,
    keep_alive: Option<bool>,
}

impl TemplateBuilder {
    pub fn targets(mut self, targets: Vec<String>) -> Self {
        self.targets = targets;
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.targets.push(target.into());
        self
    }

    pub fn method(mut self, method: &str) -> Self {
        self.method = Some(method.to_string());
        self
    }

    pub fn headers(mut self, headers: HeaderOverrides) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }

    pub fn build(self) -> Result<RequestTemplate, ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::MissingTarget);
        }
        let targets = self
            .targets
            .iter()
            .map(|raw| Target::parse(raw))
            .collect::<Result<Vec<_>, _>>()?;

        let method_str = self.method.unwrap_or_else(|| "GET".to_string()).to_uppercase();
        let method = Method::from_bytes(method_str.as_bytes())
            .map_err(|_| ConfigError::InvalidMethod(method_str.clone()))?;

        let keep_alive = self.keep_alive.unwrap_or(true);

        let mut headers = HeaderMap::new();
        headers.insert(
            CONNECTION,
            HeaderValue::from_static(if keep_alive { "keep-alive" } else { "close" }),
        );
        let overrides = [
            ("authorization", self.headers.authorization),
            ("geolocation", self.headers.geolocation),
            ("content-type", self.headers.content_type),
            ("apiusername", self.headers.api_user_name),
        ];
        for (name, value) in overrides {
            let Some(value) = value.filter(|v| !v.is_empty()) else {
                continue;
            };
            let value = HeaderValue::from_str(&value).map_err(|e| ConfigError::InvalidHeader {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
            headers.insert(HeaderName::from_static(name), value);
        }

        Ok(RequestTemplate {
            targets,
            method,
            headers,
            body: self.body.unwrap_or_default(),
            keep_alive,
        })
    }
}
