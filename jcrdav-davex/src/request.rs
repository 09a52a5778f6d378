//! HTTP plumbing: request building, per-connection extras and mapping of
//! error answers onto the repository error taxonomy.

use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::Method;
use std::collections::BTreeMap;
use tracing::debug;

use jcrdav_core::error::{Error, Result};
use jcrdav_core::Credentials;

use crate::xml::{self, Element};

pub(crate) const XML_CONTENT_TYPE: &str = "text/xml; charset=utf-8";
pub(crate) const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";

/// One request to send
#[derive(Debug, Clone)]
pub(crate) struct DavRequest {
    method: &'static str,
    url: String,
    headers: Vec<(&'static str, String)>,
    body: Option<(String, Bytes)>,
}

impl DavRequest {
    pub(crate) fn new(method: &'static str, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub(crate) fn depth(self, depth: &str) -> Self {
        self.header("Depth", depth)
    }

    pub(crate) fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub(crate) fn xml(self, body: String) -> Self {
        self.body(XML_CONTENT_TYPE, body)
    }

    pub(crate) fn body(mut self, content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        self.body = Some((content_type.into(), body.into()));
        self
    }
}

/// A received answer, fully buffered
#[derive(Debug, Clone)]
pub(crate) struct Reply {
    pub status: u16,
    pub content_type: Option<String>,
    pub location: Option<String>,
    pub body: Bytes,
}

impl Reply {
    pub(crate) fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub(crate) fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub(crate) fn dom(&self) -> Result<Element> {
        Ok(xml::parse(&self.text())?)
    }

    pub(crate) fn json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Turn a non-2xx answer into an error about `context`
    pub(crate) fn error_for_status(self, context: &str) -> Result<Reply> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(map_error(self.status, &self.text(), context))
        }
    }
}

/// HTTP client plus everything attached to each request
#[derive(Debug, Clone)]
pub(crate) struct Connection {
    http: reqwest::Client,
    pub credentials: Option<Credentials>,
    pub default_headers: BTreeMap<String, String>,
    pub send_expect: bool,
    pub user_data: Option<String>,
}

impl Connection {
    pub(crate) fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            credentials: None,
            default_headers: BTreeMap::new(),
            send_expect: false,
            user_data: None,
        }
    }

    /// Send `request` and return the answer whatever its status
    pub(crate) async fn send_raw(&self, request: DavRequest) -> Result<Reply> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| Error::protocol(format!("invalid method {}: {}", request.method, e)))?;
        debug!("{} {}", request.method, request.url);

        let mut builder = self.http.request(method, &request.url);
        if let Some(credentials) = &self.credentials {
            builder = builder.basic_auth(&credentials.user_id, Some(&credentials.password));
        }
        for (name, value) in &self.default_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(data) = &self.user_data {
            builder = builder.header("Link", format!("<data:,{}>", urlencoding::encode(data)));
        }
        if self.send_expect && request.body.is_some() {
            builder = builder.header("Expect", "100-continue");
        }
        for (name, value) in request.headers {
            builder = builder.header(name, value);
        }
        if let Some((content_type, body)) = request.body {
            builder = builder.header(CONTENT_TYPE, content_type).body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::protocol(format!("{} {} failed: {}", request.method, request.url, e)))?;
        let status = response.status().as_u16();
        let header = |name| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_type = header(CONTENT_TYPE);
        let location = header(LOCATION);
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::protocol(format!("Failed to read answer of {}: {}", request.url, e)))?;

        Ok(Reply {
            status,
            content_type,
            location,
            body,
        })
    }

    /// Send `request`, failing on any non-2xx answer
    pub(crate) async fn send(&self, request: DavRequest) -> Result<Reply> {
        let context = format!("{} {}", request.method, request.url);
        self.send_raw(request).await?.error_for_status(&context)
    }
}

/// Extract `(class, message)` from a `dcr:exception` error body
fn exception_of(body: &str) -> Option<(String, String)> {
    if !body.trim_start().starts_with('<') {
        return None;
    }
    let dom = xml::parse(body).ok()?;
    let exception = if dom.local_name() == "exception" {
        &dom
    } else {
        dom.find("exception")?
    };
    let class = exception.child_text("class")?.trim().to_string();
    let message = exception.child_text("message").unwrap_or_default().trim().to_string();
    Some((class, message))
}

/// Map an error answer onto the error taxonomy
pub(crate) fn map_error(status: u16, body: &str, context: &str) -> Error {
    if let Some((class, message)) = exception_of(body) {
        let message = if message.is_empty() {
            context.to_string()
        } else {
            message
        };
        let simple = class.rsplit('.').next().unwrap_or(&class);
        return match simple {
            "ItemNotFoundException" => Error::ItemNotFound(message),
            "PathNotFoundException" | "NoSuchWorkspaceException" => Error::PathNotFound(message),
            "ItemExistsException" => Error::ItemExists(message),
            "InvalidItemStateException" => Error::InvalidItemState(message),
            "UnsupportedRepositoryOperationException" => Error::Unsupported(message),
            "NamespaceException" => Error::Namespace(message),
            "LockException" => Error::LockConflict(message),
            "AccessDeniedException" | "LoginException" => Error::AccessDenied(message),
            "ValueFormatException" => Error::ValueFormat(message),
            _ => Error::Protocol(format!("{}: {}", class, message)),
        };
    }

    match status {
        404 => Error::PathNotFound(context.to_string()),
        401 | 403 => Error::AccessDenied(context.to_string()),
        423 => Error::LockConflict(context.to_string()),
        _ => {
            let detail = body.trim();
            let message = if detail.is_empty() {
                context.to_string()
            } else {
                format!("{}: {}", context, detail.chars().take(200).collect::<String>())
            };
            Error::Http { status, message }
        }
    }
}

/// Percent-encode one path segment, keeping namespace colons readable
pub(crate) fn encode_segment(segment: &str) -> String {
    urlencoding::encode(segment).replace("%3A", ":")
}

/// Percent-encode an absolute repository path segment by segment
pub(crate) fn encode_path(path: &str) -> String {
    path.split('/').map(encode_segment).collect::<Vec<_>>().join("/")
}

pub(crate) fn decode(text: &str) -> String {
    urlencoding::decode(text)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| text.to_string())
}

/// Strip `base` from `href`, accepting both absolute URLs and bare paths
pub(crate) fn strip_base<'a>(href: &'a str, base: &str) -> Option<&'a str> {
    if let Some(rest) = href.strip_prefix(base) {
        return Some(rest);
    }
    let url = reqwest::Url::parse(base).ok()?;
    href.strip_prefix(url.path())
}

/// Repository path from the remainder of an href below the workspace root
pub(crate) fn href_path(rest: &str) -> String {
    let trimmed = rest.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jcrdav_core::ErrorKind;

    fn exception(class: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><D:error xmlns:D="DAV:"><dcr:exception xmlns:dcr="http://www.day.com/jcr/webdav/1.0"><dcr:class>{}</dcr:class><dcr:message>boom</dcr:message></dcr:exception></D:error>"#,
            class
        )
    }

    #[test]
    fn test_exception_classes_map_to_kinds() {
        let cases = [
            ("javax.jcr.PathNotFoundException", ErrorKind::NotFound),
            ("javax.jcr.ItemNotFoundException", ErrorKind::NotFound),
            ("javax.jcr.ItemExistsException", ErrorKind::Exists),
            ("javax.jcr.InvalidItemStateException", ErrorKind::State),
            ("javax.jcr.UnsupportedRepositoryOperationException", ErrorKind::Capability),
            ("javax.jcr.NamespaceException", ErrorKind::Capability),
            ("javax.jcr.lock.LockException", ErrorKind::Access),
            ("javax.jcr.AccessDeniedException", ErrorKind::Access),
            ("javax.jcr.nodetype.ConstraintViolationException", ErrorKind::Protocol),
        ];
        for (class, kind) in cases {
            assert_eq!(map_error(500, &exception(class), "ctx").kind(), kind, "{}", class);
        }
        let err = map_error(409, &exception("javax.jcr.ItemExistsException"), "ctx");
        assert_eq!(err.to_string(), "Item already exists: boom");
    }

    #[test]
    fn test_status_fallbacks() {
        assert_eq!(map_error(404, "", "GET /x").kind(), ErrorKind::NotFound);
        assert_eq!(map_error(401, "", "GET /x").kind(), ErrorKind::Access);
        assert_eq!(map_error(423, "locked", "GET /x").kind(), ErrorKind::Access);
        match map_error(500, "oops", "GET /x") {
            Error::Http { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "GET /x: oops");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_path_encoding() {
        assert_eq!(encode_path("/a b/jcr:content"), "/a%20b/jcr:content");
        assert_eq!(encode_path("/"), "/");
        assert_eq!(decode("/a%20b/jcr%3aroot"), "/a b/jcr:root");
    }

    #[test]
    fn test_strip_base() {
        let base = "http://localhost:8080/server/default/jcr:root";
        assert_eq!(strip_base("http://localhost:8080/server/default/jcr:root/a/", base), Some("/a/"));
        assert_eq!(strip_base("/server/default/jcr:root/a", base), Some("/a"));
        assert_eq!(strip_base("/elsewhere/a", base), None);
        assert_eq!(href_path("/a/"), "/a");
        assert_eq!(href_path("/"), "/");
    }
}
