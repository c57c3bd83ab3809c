//! HTTP response wrapper.

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version, header};
use serde::de::DeserializeOwned;

use crate::{Error, Result};

/// HTTP response wrapper.
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
}

impl Response {
    /// Create a response.
    pub fn new(status: StatusCode, version: Version, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            version,
            headers,
            body,
        }
    }

    /// Get the status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Check if the response was successful (2xx).
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Get the protocol version the server answered with.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Get the response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a specific header value.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers
            .get(name.as_ref())
            .and_then(|v| v.to_str().ok())
    }

    /// Get the response body as bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    /// Consume the response and return the body as bytes.
    pub fn into_bytes(self) -> Bytes {
        self.body
    }

    /// Get the response body as text.
    pub fn text(&self) -> Result<String> {
        String::from_utf8(self.body.to_vec()).map_err(|e| Error::Decode(e.to_string()))
    }

    /// Parse the response body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| Error::Decode(e.to_string()))
    }

    /// Get the content length if available.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }

    /// Check if the server asked to close the connection.
    pub fn connection_close(&self) -> bool {
        has_token(&self.headers, "close")
    }

    /// Check if the server acknowledged keep-alive explicitly.
    pub fn connection_keep_alive(&self) -> bool {
        has_token(&self.headers, "keep-alive")
    }

    /// Whether the connection cannot carry another request after this
    /// response.
    pub(crate) fn ends_connection(&self) -> bool {
        if self.connection_close() {
            return true;
        }
        self.version <= Version::HTTP_10 && !self.connection_keep_alive()
    }
}

/// Check the `Connection` header for a token, case-insensitively.
pub(crate) fn has_token(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn response(version: Version, connection: Option<&'static str>) -> Response {
        let mut headers = HeaderMap::new();
        if let Some(value) = connection {
            headers.insert(header::CONNECTION, HeaderValue::from_static(value));
        }
        Response::new(StatusCode::OK, version, headers, Bytes::from_static(b"{\"ok\":true}"))
    }

    #[test]
    fn test_connection_tokens() {
        assert!(response(Version::HTTP_11, Some("Close")).connection_close());
        assert!(response(Version::HTTP_11, Some("upgrade, keep-alive")).connection_keep_alive());
        assert!(!response(Version::HTTP_11, None).connection_close());
    }

    #[test]
    fn test_ends_connection() {
        assert!(!response(Version::HTTP_11, None).ends_connection());
        assert!(response(Version::HTTP_11, Some("close")).ends_connection());
        assert!(response(Version::HTTP_10, None).ends_connection());
        assert!(!response(Version::HTTP_10, Some("keep-alive")).ends_connection());
    }

    #[test]
    fn test_body_accessors() {
        let response = response(Version::HTTP_11, None);
        assert_eq!(response.text().unwrap(), "{\"ok\":true}");
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["ok"], true);
    }
}
