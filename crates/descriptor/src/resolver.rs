//! `$ref` resolution for OpenAPI documents.
//!
//! `openapiv3` keeps references as `ReferenceOr<T>`. Targets split their specs across files
//! and URLs, so a reference is resolved relative to the document that contains it: local
//! pointers (`#/components/...`), relative or absolute files, `file://` URLs and http(s) URLs.
//! Remote documents are fetched through the outbound safety policy and cached per resolution.

use crate::error::{DescriptorError, Result};
use openapiv3::{OpenAPI, ReferenceOr};
use parking_lot::Mutex;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use unrelated_http_tools::error::HttpToolsError;
use unrelated_http_tools::request::read_body_limited;
use unrelated_http_tools::safety::OutboundHttpSafety;
use url::Url;

/// Longest `$ref` chain followed before giving up.
const MAX_REF_HOPS: usize = 32;
/// External documents one resolution may load, besides the root.
const MAX_EXTERNAL_DOCS: usize = 16;

/// Where a document lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DocId {
    Url(Url),
    File(PathBuf),
}

impl DocId {
    /// Parse a spec location: an http(s) URL, a `file://` URL or a filesystem path.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed URLs and non-local file URLs.
    pub fn parse(location: &str) -> Result<Self> {
        if is_http(location) {
            let url = Url::parse(location)
                .map_err(|e| DescriptorError::invalid_spec(location, format!("invalid spec URL: {e}")))?;
            return Ok(Self::Url(without_fragment(url)));
        }
        if location.starts_with("file://") {
            let path = Url::parse(location)
                .ok()
                .and_then(|u| u.to_file_path().ok())
                .ok_or_else(|| DescriptorError::invalid_spec(location, "not a local file URL"))?;
            return Ok(Self::file(path));
        }
        Ok(Self::file(PathBuf::from(location)))
    }

    fn file(path: PathBuf) -> Self {
        Self::File(std::fs::canonicalize(&path).unwrap_or(path))
    }

    /// Resolve the document part of a `$ref` against this document.
    fn join(&self, doc_part: &str) -> Result<Self> {
        if doc_part.is_empty() {
            return Ok(self.clone());
        }
        if is_http(doc_part) || doc_part.starts_with("file://") {
            return Self::parse(doc_part);
        }
        match self {
            Self::Url(base) => base
                .join(doc_part)
                .map(|u| Self::Url(without_fragment(u)))
                .map_err(|e| {
                    DescriptorError::invalid_spec(base.as_str(), format!("bad relative $ref '{doc_part}': {e}"))
                }),
            Self::File(base) => {
                let path = Path::new(doc_part);
                let joined = if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    base.parent().unwrap_or_else(|| Path::new(".")).join(path)
                };
                Ok(Self::file(joined))
            }
        }
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(u) => write!(f, "{u}"),
            Self::File(p) => write!(f, "{}", p.display()),
        }
    }
}

pub(crate) fn is_http(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

fn without_fragment(mut url: Url) -> Url {
    url.set_fragment(None);
    url
}

/// A parsed `$ref`: target document plus optional JSON pointer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RefTarget {
    doc: DocId,
    pointer: Option<String>,
}

impl RefTarget {
    fn parse(from: &DocId, reference: &str) -> Result<Self> {
        let (doc_part, fragment) = reference.split_once('#').unwrap_or((reference, ""));
        let pointer = match fragment {
            "" => None,
            f if f.starts_with('/') => Some(f.to_string()),
            _ => {
                return Err(DescriptorError::invalid_spec(
                    from.to_string(),
                    format!("$ref fragment is not a JSON pointer: {reference}"),
                ));
            }
        };
        Ok(Self {
            doc: from.join(doc_part)?,
            pointer,
        })
    }
}

pub struct RefResolver<'a> {
    root: DocId,
    client: &'a Client,
    safety: &'a OutboundHttpSafety,
    docs: Mutex<HashMap<DocId, Arc<Value>>>,
}

impl<'a> RefResolver<'a> {
    /// Seed the resolver with the already-parsed root document.
    ///
    /// # Errors
    ///
    /// Returns an error if the root spec cannot be re-encoded as JSON.
    pub fn new(
        root: DocId,
        spec: &OpenAPI,
        client: &'a Client,
        safety: &'a OutboundHttpSafety,
    ) -> Result<Self> {
        let value = serde_json::to_value(spec)
            .map_err(|e| DescriptorError::invalid_spec(root.to_string(), e.to_string()))?;
        let docs = HashMap::from([(root.clone(), Arc::new(value))]);
        Ok(Self {
            root,
            client,
            safety,
            docs: Mutex::new(docs),
        })
    }

    #[must_use]
    pub fn root(&self) -> &DocId {
        &self.root
    }

    /// Follow `node` until it is an item, returning the item and the document it came from
    /// (nested references inside it resolve relative to that document).
    ///
    /// # Errors
    ///
    /// Returns an error for cyclic or overlong chains, missing targets, unreachable documents
    /// and targets of the wrong shape.
    pub async fn resolve<T>(&self, from: &DocId, node: &ReferenceOr<T>) -> Result<(DocId, T)>
    where
        T: Clone + DeserializeOwned,
    {
        let mut doc = from.clone();
        let mut reference = match node {
            ReferenceOr::Item(item) => return Ok((doc, item.clone())),
            ReferenceOr::Reference { reference } => reference.clone(),
        };
        let mut visited = HashSet::new();
        loop {
            let target = RefTarget::parse(&doc, &reference)?;
            if !visited.insert(target.clone()) {
                return Err(DescriptorError::invalid_spec(
                    doc.to_string(),
                    format!("cyclic $ref: {reference}"),
                ));
            }
            if visited.len() > MAX_REF_HOPS {
                return Err(DescriptorError::invalid_spec(
                    doc.to_string(),
                    format!("$ref chain longer than {MAX_REF_HOPS} at {reference}"),
                ));
            }

            let value = self.select(&target, &reference).await?;
            let next: ReferenceOr<T> = serde_json::from_value(value).map_err(|e| {
                DescriptorError::invalid_spec(
                    target.doc.to_string(),
                    format!("$ref '{reference}' points at the wrong kind of object: {e}"),
                )
            })?;
            doc = target.doc;
            match next {
                ReferenceOr::Item(item) => return Ok((doc, item)),
                ReferenceOr::Reference { reference: r } => reference = r,
            }
        }
    }

    async fn select(&self, target: &RefTarget, reference: &str) -> Result<Value> {
        let document = self.document(&target.doc).await?;
        match &target.pointer {
            None => Ok((*document).clone()),
            Some(pointer) => document.pointer(pointer).cloned().ok_or_else(|| {
                DescriptorError::invalid_spec(
                    target.doc.to_string(),
                    format!("$ref '{reference}' not found (no value at '{pointer}')"),
                )
            }),
        }
    }

    async fn document(&self, doc: &DocId) -> Result<Arc<Value>> {
        {
            let docs = self.docs.lock();
            if let Some(found) = docs.get(doc) {
                return Ok(Arc::clone(found));
            }
            if docs.len() > MAX_EXTERNAL_DOCS {
                return Err(DescriptorError::invalid_spec(
                    self.root.to_string(),
                    format!("$refs span more than {MAX_EXTERNAL_DOCS} external documents"),
                ));
            }
        }

        let text = match doc {
            DocId::File(path) => tokio::fs::read_to_string(path)
                .await
                .map_err(|e| DescriptorError::unreachable(doc.to_string(), e.to_string()))?,
            DocId::Url(url) => self.fetch(url).await?,
        };
        let value: Value = serde_yaml::from_str(&text).map_err(|e| {
            DescriptorError::invalid_spec(doc.to_string(), format!("unparseable document: {e}"))
        })?;
        let value = Arc::new(value);
        self.docs.lock().insert(doc.clone(), Arc::clone(&value));
        Ok(value)
    }

    async fn fetch(&self, url: &Url) -> Result<String> {
        let location = url.as_str();
        self.safety
            .check_url(url)
            .await
            .map_err(|e| DescriptorError::from_http(location, &e))?;
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| DescriptorError::from_http(location, &HttpToolsError::from(e)))?;
        if !resp.status().is_success() {
            return Err(DescriptorError::unreachable(
                location,
                format!("$ref document returned {}", resp.status()),
            ));
        }
        let bytes = read_body_limited(resp, self.safety.max_response_bytes)
            .await
            .map_err(|e| DescriptorError::from_http(location, &e))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
