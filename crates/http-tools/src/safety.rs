//! Outbound request guard.
//!
//! Target URLs arrive in request headers, so every outbound request (spec fetch, introspection,
//! planned call, poll check) is validated against an [`OutboundHttpSafety`] first. Redirects,
//! when followed at all, are re-checked hop by hop.

use crate::error::HttpToolsError;
use reqwest::Client;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio::net::lookup_host;
use url::Url;

const MAX_REDIRECT_HOPS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectPolicy {
    None,
    /// Follow up to five hops, each re-checked against the scheme, allowlist and literal-IP
    /// rules.
    Follow,
}

#[derive(Debug, Clone)]
pub struct OutboundHttpSafety {
    /// Lowercase hosts; `*.example.com` admits any subdomain. `None` admits every host.
    pub allowed_hosts: Option<HashSet<String>>,
    /// Admit loopback, private, link-local and reserved destinations.
    pub allow_private_networks: bool,
    pub max_response_bytes: Option<usize>,
    pub redirects: RedirectPolicy,
}

impl Default for OutboundHttpSafety {
    fn default() -> Self {
        Self::restrictive()
    }
}

impl OutboundHttpSafety {
    /// Anything goes; for local development and loopback mocks.
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            allowed_hosts: None,
            allow_private_networks: true,
            max_response_bytes: None,
            redirects: RedirectPolicy::Follow,
        }
    }

    /// Public destinations only, 8 MiB bodies, no redirects.
    #[must_use]
    pub fn restrictive() -> Self {
        Self {
            allowed_hosts: None,
            allow_private_networks: false,
            max_response_bytes: Some(8 * 1024 * 1024),
            redirects: RedirectPolicy::None,
        }
    }

    /// Build the shared client. With [`RedirectPolicy::Follow`] every hop passes
    /// [`Self::check_static`]; DNS-based checks only apply to the first request.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn build_client(&self) -> Result<Client, HttpToolsError> {
        let redirect = match self.redirects {
            RedirectPolicy::None => reqwest::redirect::Policy::none(),
            RedirectPolicy::Follow => {
                let guard = self.clone();
                reqwest::redirect::Policy::custom(move |attempt| {
                    if attempt.previous().len() >= MAX_REDIRECT_HOPS {
                        return attempt.error(HttpToolsError::Blocked(format!(
                            "more than {MAX_REDIRECT_HOPS} redirects"
                        )));
                    }
                    match guard.check_static(attempt.url()) {
                        Ok(_) => attempt.follow(),
                        Err(e) => attempt.error(e),
                    }
                })
            }
        };
        Ok(Client::builder().redirect(redirect).build()?)
    }

    /// Checks that need no network: scheme, host presence, allowlist, literal IPs.
    ///
    /// Returns the host when it still needs DNS-level checking.
    ///
    /// # Errors
    ///
    /// Returns [`HttpToolsError::Blocked`] when the URL is rejected.
    pub fn check_static<'u>(&self, url: &'u Url) -> Result<Option<&'u str>, HttpToolsError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(HttpToolsError::Blocked(format!(
                "scheme '{}' is not http(s)",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| HttpToolsError::Blocked("URL has no host".to_string()))?;
        if !self.host_allowed(host) {
            return Err(HttpToolsError::Blocked(format!(
                "host '{host}' not in allowlist"
            )));
        }
        if self.allow_private_networks {
            return Ok(None);
        }
        let literal = host.trim_start_matches('[').trim_end_matches(']');
        match literal.parse::<IpAddr>() {
            Ok(ip) => match deny_reason(ip) {
                Some(reason) => Err(HttpToolsError::Blocked(format!(
                    "destination {ip} is a {reason} address"
                ))),
                None => Ok(None),
            },
            Err(_) => Ok(Some(host)),
        }
    }

    /// Full check before a request: [`Self::check_static`], then every resolved address of a
    /// named host must be public unless private networks are allowed.
    ///
    /// # Errors
    ///
    /// [`HttpToolsError::Blocked`] for rejected destinations, [`HttpToolsError::Transport`]
    /// when the host does not resolve.
    pub async fn check_url(&self, url: &Url) -> Result<(), HttpToolsError> {
        let Some(host) = self.check_static(url)? else {
            return Ok(());
        };
        let port = url.port_or_known_default().unwrap_or(443);
        let addrs: Vec<IpAddr> = lookup_host((host, port))
            .await
            .map_err(|e| HttpToolsError::Transport(format!("cannot resolve '{host}': {e}")))?
            .map(|a| a.ip())
            .collect();
        if addrs.is_empty() {
            return Err(HttpToolsError::Transport(format!(
                "'{host}' resolved to no addresses"
            )));
        }
        if let Some((ip, reason)) = addrs
            .iter()
            .find_map(|ip| deny_reason(*ip).map(|r| (ip, r)))
        {
            return Err(HttpToolsError::Blocked(format!(
                "host '{host}' resolves to {reason} address {ip}"
            )));
        }
        Ok(())
    }

    fn host_allowed(&self, host: &str) -> bool {
        let Some(allowed) = &self.allowed_hosts else {
            return true;
        };
        let host = host.to_ascii_lowercase();
        allowed.iter().any(|entry| match entry.strip_prefix("*.") {
            Some(suffix) => host
                .strip_suffix(suffix)
                .is_some_and(|head| head.ends_with('.')),
            None => *entry == host,
        })
    }
}

/// `scheme://host[:port]/path`: credentials, query and fragment removed for logs and errors.
#[must_use]
pub fn redact_url(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}://{host}:{port}{}", url.scheme(), url.path()),
        None => format!("{}://{host}{}", url.scheme(), url.path()),
    }
}

/// `reqwest` error text with the embedded URL redacted.
#[must_use]
pub fn sanitize_reqwest_error(e: &reqwest::Error) -> String {
    let text = e.to_string();
    match e.url() {
        Some(url) => text.replace(url.as_str(), &redact_url(url)),
        None => text,
    }
}

fn deny_reason(ip: IpAddr) -> Option<&'static str> {
    match ip {
        IpAddr::V4(v4) => ipv4_reason(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => ipv4_reason(v4),
            None => ipv6_reason(v6),
        },
    }
}

fn ipv4_reason(ip: Ipv4Addr) -> Option<&'static str> {
    let [a, b, ..] = ip.octets();
    if ip.is_loopback() {
        Some("loopback")
    } else if ip.is_private() {
        Some("private")
    } else if ip.is_link_local() {
        Some("link-local")
    } else if ip.is_unspecified() || ip.is_broadcast() || ip.is_multicast() || a >= 240 {
        Some("reserved")
    } else if a == 100 && (64..=127).contains(&b) {
        Some("shared (CGNAT)")
    } else {
        None
    }
}

fn ipv6_reason(ip: Ipv6Addr) -> Option<&'static str> {
    if ip.is_loopback() {
        Some("loopback")
    } else if ip.is_unique_local() {
        Some("private")
    } else if ip.is_unicast_link_local() {
        Some("link-local")
    } else if ip.is_unspecified() || ip.is_multicast() {
        Some("reserved")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).expect("url")
    }

    #[tokio::test]
    async fn loopback_and_metadata_addresses_are_blocked() {
        let safety = OutboundHttpSafety::restrictive();
        let err = safety
            .check_url(&url("http://127.0.0.1:1234/"))
            .await
            .expect_err("loopback");
        assert!(matches!(err, HttpToolsError::Blocked(_)));
        assert!(err.to_string().contains("loopback"));

        let err = safety
            .check_url(&url("http://[::ffff:169.254.169.254]/latest"))
            .await
            .expect_err("mapped metadata");
        assert!(err.to_string().contains("link-local"));
    }

    #[tokio::test]
    async fn permissive_policy_admits_loopback() {
        OutboundHttpSafety::permissive()
            .check_url(&url("http://127.0.0.1:1234/"))
            .await
            .expect("allowed");
    }

    #[test]
    fn allowlist_supports_subdomain_wildcards() {
        let mut safety = OutboundHttpSafety::permissive();
        safety.allowed_hosts = Some(HashSet::from([
            "rickandmortyapi.com".to_string(),
            "*.example.com".to_string(),
        ]));
        assert!(safety.check_static(&url("https://rickandmortyapi.com/graphql")).is_ok());
        assert!(safety.check_static(&url("https://API.example.com/v1")).is_ok());
        let err = safety
            .check_static(&url("https://example.com/"))
            .expect_err("bare suffix");
        assert!(err.to_string().contains("not in allowlist"));
        assert!(safety.check_static(&url("https://badexample.com/")).is_err());
    }

    #[test]
    fn static_check_defers_named_hosts_to_dns() {
        let safety = OutboundHttpSafety::restrictive();
        assert_eq!(
            safety.check_static(&url("https://api.example.com/x")).expect("ok"),
            Some("api.example.com")
        );
        assert_eq!(safety.check_static(&url("https://8.8.8.8/")).expect("ok"), None);
        assert!(safety.check_static(&url("http://100.64.0.1/")).is_err());
        assert!(safety.check_static(&url("file:///etc/passwd")).is_err());
    }

    #[test]
    fn redaction_keeps_only_origin_and_path() {
        assert_eq!(
            redact_url(&url("https://user:pw@api.example.com:8443/v1?token=abc#frag")),
            "https://api.example.com:8443/v1"
        );
    }
}
