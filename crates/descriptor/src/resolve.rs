//! Target resolution: fetch + normalize + render, under a startup timeout.

use crate::capability::{ApiKind, CapabilityModel, TargetDescriptor};
use crate::context::fit_context;
use crate::error::{DescriptorError, Result};
use crate::{graphql, openapi};
use reqwest::Client;
use sha2::Digest as _;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use unrelated_http_tools::safety::OutboundHttpSafety;

/// Identity of a target for resolution and caching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetKey {
    pub kind: ApiKind,
    /// GraphQL endpoint or OpenAPI spec location.
    pub target_url: String,
    /// `Base-URL` override (REST only).
    pub base_url: Option<String>,
    pub auth_headers: BTreeMap<String, String>,
}

impl TargetKey {
    /// Cache key: kind, target and base URL in the clear, auth headers as a digest.
    #[must_use]
    pub fn cache_key(&self) -> String {
        let headers = serde_json::to_string(&self.auth_headers).unwrap_or_default();
        let digest = hex::encode(sha2::Sha256::digest(headers.as_bytes()));
        format!(
            "{}|{}|{}|{}",
            self.kind,
            self.target_url,
            self.base_url.as_deref().unwrap_or_default(),
            &digest[..16]
        )
    }
}

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub timeout: Duration,
    pub max_schema_chars: usize,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_schema_chars: 32_000,
        }
    }
}

#[derive(Clone)]
pub struct Resolver {
    client: Client,
    safety: Arc<OutboundHttpSafety>,
    settings: ResolverSettings,
}

impl Resolver {
    #[must_use]
    pub fn new(client: Client, safety: Arc<OutboundHttpSafety>, settings: ResolverSettings) -> Self {
        Self {
            client,
            safety,
            settings,
        }
    }

    /// Resolve `key` into a descriptor.
    ///
    /// # Errors
    ///
    /// Returns `Unreachable`, `InvalidSpec` or `Timeout` resolution errors.
    pub async fn resolve(&self, key: &TargetKey) -> Result<TargetDescriptor> {
        let started = Instant::now();
        let timeout = self.settings.timeout;
        let descriptor = match tokio::time::timeout(timeout, self.resolve_inner(key)).await {
            Ok(r) => r?,
            Err(_) => {
                return Err(DescriptorError::Timeout {
                    location: key.target_url.clone(),
                    secs: timeout.as_secs(),
                });
            }
        };
        tracing::info!(
            kind = %key.kind,
            target_url = %key.target_url,
            operations = descriptor.capability.operations.len(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "target resolved"
        );
        Ok(descriptor)
    }

    async fn resolve_inner(&self, key: &TargetKey) -> Result<TargetDescriptor> {
        let max_chars = self.settings.max_schema_chars;
        let (raw, base_url, capability) = match key.kind {
            ApiKind::Graphql => {
                let schema = graphql::fetch_introspection(
                    &self.client,
                    &self.safety,
                    &key.target_url,
                    &key.auth_headers,
                )
                .await?;
                let capability = CapabilityModel {
                    operations: graphql::operations(&schema),
                    schema_context: fit_context(graphql::build_schema_context(&schema), max_chars),
                    title: None,
                };
                (schema, Some(key.target_url.clone()), capability)
            }
            ApiKind::Rest => {
                let desc = openapi::describe(
                    &key.target_url,
                    key.base_url.as_deref(),
                    &self.client,
                    &self.safety,
                )
                .await?;
                let capability = CapabilityModel {
                    operations: desc.operations,
                    schema_context: fit_context(desc.context, max_chars),
                    title: desc.title,
                };
                (desc.raw, desc.base_url, capability)
            }
        };

        let raw_schema = serde_json::to_string_pretty(&raw).unwrap_or_else(|_| raw.to_string());
        Ok(TargetDescriptor {
            kind: key.kind,
            target_url: key.target_url.clone(),
            base_url,
            auth_headers: key.auth_headers.clone(),
            raw_schema: Arc::new(raw_schema),
            capability,
            resolved_at: Instant::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(headers: &[(&str, &str)]) -> TargetKey {
        TargetKey {
            kind: ApiKind::Rest,
            target_url: "https://api.example.com/openapi.json".to_string(),
            base_url: None,
            auth_headers: headers
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        }
    }

    #[test]
    fn cache_key_hides_credentials_but_separates_them() {
        let a = key(&[("Authorization", "Bearer secret-a")]);
        let b = key(&[("Authorization", "Bearer secret-b")]);
        assert_ne!(a.cache_key(), b.cache_key());
        assert!(!a.cache_key().contains("secret"));
        assert_eq!(a.cache_key(), a.clone().cache_key());
    }
}
