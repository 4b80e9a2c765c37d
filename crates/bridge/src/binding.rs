//! Request binding: the target identity and per-request options carried in headers.
//!
//! Header names are case-insensitive; each may also be sent with an `X-` prefix.

use crate::error::{BridgeError, Result};
use axum::http::HeaderMap;
use serde::Serialize;
use serde_json::Value;
use sha2::Digest as _;
use std::collections::BTreeMap;
use unrelated_api_descriptor::capability::ApiKind;
use unrelated_api_descriptor::resolve::TargetKey;

pub const TARGET_URL: &str = "target-url";
pub const API_TYPE: &str = "api-type";
pub const TARGET_HEADERS: &str = "target-headers";
pub const API_NAME: &str = "api-name";
pub const BASE_URL: &str = "base-url";
pub const ALLOW_UNSAFE_PATHS: &str = "allow-unsafe-paths";
pub const POLL_PATHS: &str = "poll-paths";
pub const INCLUDE_RESULT: &str = "include-result";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBinding {
    pub target_url: String,
    pub api_kind: ApiKind,
    /// Forwarded to the target on every call (typically auth).
    pub target_headers: BTreeMap<String, String>,
    pub api_name: Option<String>,
    pub base_url: Option<String>,
    pub allow_unsafe_paths: Vec<String>,
    pub poll_paths: Vec<String>,
    pub include_result: bool,
}

impl RequestBinding {
    /// Parse the binding from request headers.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Binding`] when a required header is missing or any header is
    /// malformed.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self> {
        let target_url = header(headers, TARGET_URL)?
            .filter(|v| !v.is_empty())
            .ok_or_else(|| BridgeError::Binding("missing required header Target-URL".to_string()))?;
        let api_kind = header(headers, API_TYPE)?
            .ok_or_else(|| BridgeError::Binding("missing required header API-Type".to_string()))?
            .parse::<ApiKind>()
            .map_err(BridgeError::Binding)?;

        let target_headers = match header(headers, TARGET_HEADERS)? {
            Some(raw) => parse_header_map(&raw)?,
            None => BTreeMap::new(),
        };
        let allow_unsafe_paths = match header(headers, ALLOW_UNSAFE_PATHS)? {
            Some(raw) => parse_patterns(ALLOW_UNSAFE_PATHS, &raw)?,
            None => Vec::new(),
        };
        let poll_paths = match header(headers, POLL_PATHS)? {
            Some(raw) => parse_patterns(POLL_PATHS, &raw)?,
            None => Vec::new(),
        };
        let include_result = header(headers, INCLUDE_RESULT)?.is_some_and(|v| {
            matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
        });

        Ok(Self {
            target_url,
            api_kind,
            target_headers,
            api_name: header(headers, API_NAME)?.filter(|v| !v.is_empty()),
            base_url: header(headers, BASE_URL)?.filter(|v| !v.is_empty()),
            allow_unsafe_paths,
            poll_paths,
            include_result,
        })
    }

    /// Session fingerprint: sha256 over every field that changes what a session may do.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let identity = serde_json::json!({
            "targetUrl": self.target_url,
            "apiKind": self.api_kind,
            "targetHeaders": self.target_headers,
            "baseUrl": self.base_url,
            "allowUnsafePaths": self.allow_unsafe_paths,
            "pollPaths": self.poll_paths,
        });
        hex::encode(sha2::Sha256::digest(identity.to_string().as_bytes()))
    }

    #[must_use]
    pub fn target_key(&self) -> TargetKey {
        TargetKey {
            kind: self.api_kind,
            target_url: self.target_url.clone(),
            base_url: self.base_url.clone(),
            auth_headers: self.target_headers.clone(),
        }
    }
}

fn header(headers: &HeaderMap, name: &str) -> Result<Option<String>> {
    let value = headers
        .get(name)
        .or_else(|| headers.get(format!("x-{name}").as_str()));
    let Some(value) = value else {
        return Ok(None);
    };
    value
        .to_str()
        .map(|v| Some(v.trim().to_string()))
        .map_err(|_| BridgeError::Binding(format!("header {name} is not valid ASCII")))
}

fn parse_header_map(raw: &str) -> Result<BTreeMap<String, String>> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| BridgeError::Binding(format!("{TARGET_HEADERS} must be a JSON object: {e}")))?;
    let Value::Object(map) = value else {
        return Err(BridgeError::Binding(format!(
            "{TARGET_HEADERS} must be a JSON object"
        )));
    };
    Ok(map
        .into_iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (k, v)
        })
        .collect())
}

fn parse_patterns(name: &str, raw: &str) -> Result<Vec<String>> {
    serde_json::from_str::<Vec<String>>(raw)
        .map(|v| v.into_iter().filter(|p| !p.is_empty()).collect())
        .map_err(|e| BridgeError::Binding(format!("{name} must be a JSON array of strings: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(*k, HeaderValue::from_str(v).expect("header value"));
        }
        h
    }

    #[test]
    fn parses_full_binding() {
        let b = RequestBinding::from_headers(&headers(&[
            ("Target-URL", "https://api.example.com/openapi.json"),
            ("API-Type", "REST"),
            ("Target-Headers", r#"{"Authorization": "Bearer t", "X-Retry": 2}"#),
            ("Allow-Unsafe-Paths", r#"["/api/search/*"]"#),
            ("Poll-Paths", r#"["/jobs/*"]"#),
            ("Include-Result", "yes"),
            ("X-Base-URL", "https://api.example.com/v2"),
        ]))
        .expect("binding");
        assert_eq!(b.api_kind, ApiKind::Rest);
        assert_eq!(b.target_headers["Authorization"], "Bearer t");
        assert_eq!(b.target_headers["X-Retry"], "2");
        assert_eq!(b.allow_unsafe_paths, vec!["/api/search/*"]);
        assert_eq!(b.poll_paths, vec!["/jobs/*"]);
        assert!(b.include_result);
        assert_eq!(b.base_url.as_deref(), Some("https://api.example.com/v2"));
    }

    #[test]
    fn missing_or_malformed_headers_are_binding_errors() {
        let err = RequestBinding::from_headers(&headers(&[("API-Type", "graphql")]))
            .expect_err("missing url");
        assert_eq!(err.kind(), ErrorKind::Binding);

        let err = RequestBinding::from_headers(&headers(&[
            ("Target-URL", "https://x.example.com/graphql"),
            ("API-Type", "soap"),
        ]))
        .expect_err("bad type");
        assert_eq!(err.kind(), ErrorKind::Binding);

        let err = RequestBinding::from_headers(&headers(&[
            ("Target-URL", "https://x.example.com/graphql"),
            ("API-Type", "graphql"),
            ("Allow-Unsafe-Paths", "/users/*"),
        ]))
        .expect_err("not json");
        assert!(err.to_string().contains("allow-unsafe-paths"));
    }

    #[test]
    fn fingerprint_tracks_policy_headers() {
        let base = [
            ("Target-URL", "https://x.example.com/graphql"),
            ("API-Type", "graphql"),
        ];
        let a = RequestBinding::from_headers(&headers(&base)).expect("a");
        let mut extended = base.to_vec();
        extended.push(("Allow-Unsafe-Paths", r#"["createUser"]"#));
        let b = RequestBinding::from_headers(&headers(&extended)).expect("b");
        let mut with_result = base.to_vec();
        with_result.push(("Include-Result", "true"));
        let c = RequestBinding::from_headers(&headers(&with_result)).expect("c");

        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }
}
