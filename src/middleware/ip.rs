//! Client address extraction for the `ip` rate limit dimension.
//!
//! # Sources
//!
//! Checked in order, first match wins:
//!
//! 1. `X-Forwarded-For` (first entry of the comma-separated chain)
//! 2. `X-Real-IP`
//! 3. The peer address from axum's `ConnectInfo<SocketAddr>` extension
//!
//! # IP Spoofing
//!
//! Forwarding headers are client-controlled unless a reverse proxy overwrites
//! them. When [`TrustedProxyConfig`] has ranges configured and the peer
//! address is known, the headers are honoured only if the peer is inside
//! one of those ranges; otherwise the peer address itself is the key.
//!
//! Without `ConnectInfo` (e.g. `Router::into_make_service`), there is no peer
//! address to validate against and the headers are trusted as-is.

use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::{Extensions, HeaderMap};
use tracing::{debug, warn};

/// Parsed CIDR network range for trusted proxy validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse `"10.0.0.0/8"`, `"::1/128"`, or a bare address (implicit /32 or /128).
    ///
    /// Returns `None` if the format is invalid.
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();
        let (addr, prefix) = match cidr.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (cidr, None),
        };

        let network: IpAddr = addr.parse().ok()?;
        let max_prefix = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };

        let prefix_len = match prefix {
            Some(prefix) => prefix.parse::<u8>().ok().filter(|len| *len <= max_prefix)?,
            None => max_prefix,
        };

        Some(Self {
            network,
            prefix_len,
        })
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Check if an IP address is contained within this range.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = u32::MAX
                    .checked_shl(32 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

/// Ranges whose forwarding headers are believed.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxyConfig {
    ranges: Vec<CidrRange>,
}

impl TrustedProxyConfig {
    /// Build from CIDR strings. Invalid entries are logged and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();

        Self { ranges }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// An unconfigured list trusts every peer.
    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.ranges.is_empty() || self.ranges.iter().any(|range| range.contains(ip))
    }
}

fn forwarded_for(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
}

fn real_ip(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
}

fn peer_addr(extensions: &Extensions) -> Option<IpAddr> {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Resolve the client address, or `None` if nothing identifies the client.
pub fn client_ip(
    headers: &HeaderMap,
    extensions: &Extensions,
    trusted_proxies: &TrustedProxyConfig,
) -> Option<String> {
    let peer = peer_addr(extensions);

    if let Some(peer) = peer
        && !trusted_proxies.is_trusted(&peer)
    {
        if forwarded_for(headers).is_some() || real_ip(headers).is_some() {
            debug!(peer = %peer, "Ignoring forwarding headers from untrusted peer");
        }
        return Some(peer.to_string());
    }

    forwarded_for(headers)
        .or_else(|| real_ip(headers))
        .map(str::to_string)
        .or_else(|| peer.map(|ip| ip.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, value.parse().unwrap());
        }
        map
    }

    fn with_peer(addr: &str) -> Extensions {
        let mut extensions = Extensions::new();
        extensions.insert(ConnectInfo(addr.parse::<SocketAddr>().unwrap()));
        extensions
    }

    #[test]
    fn test_cidr_parse_variants() {
        assert_eq!(CidrRange::parse("10.0.0.0/8").unwrap().prefix_len(), 8);
        assert_eq!(CidrRange::parse("::1/128").unwrap().prefix_len(), 128);
        assert_eq!(CidrRange::parse(" 192.168.1.1 ").unwrap().prefix_len(), 32);
        assert!(CidrRange::parse("not-an-ip").is_none());
        assert!(CidrRange::parse("10.0.0.0/33").is_none());
        assert!(CidrRange::parse("10.0.0.0/").is_none());
    }

    #[test]
    fn test_cidr_contains() {
        let cidr = CidrRange::parse("192.168.1.0/24").unwrap();
        assert!(cidr.contains(&"192.168.1.254".parse().unwrap()));
        assert!(!cidr.contains(&"192.168.2.1".parse().unwrap()));
        assert!(!cidr.contains(&"::1".parse().unwrap()));

        let everything = CidrRange::parse("0.0.0.0/0").unwrap();
        assert!(everything.contains(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_xff_first_entry_wins() {
        let h = headers(&[
            ("x-forwarded-for", " 203.0.113.5 , 10.0.0.1"),
            ("x-real-ip", "192.168.1.1"),
        ]);
        let ip = client_ip(&h, &Extensions::new(), &TrustedProxyConfig::default());
        assert_eq!(ip.as_deref(), Some("203.0.113.5"));
    }

    #[test]
    fn test_real_ip_fallback() {
        let h = headers(&[("x-real-ip", "::1")]);
        let ip = client_ip(&h, &Extensions::new(), &TrustedProxyConfig::default());
        assert_eq!(ip.as_deref(), Some("::1"));
    }

    #[test]
    fn test_empty_xff_falls_through() {
        let h = headers(&[("x-forwarded-for", "   "), ("x-real-ip", "10.1.1.1")]);
        let ip = client_ip(&h, &Extensions::new(), &TrustedProxyConfig::default());
        assert_eq!(ip.as_deref(), Some("10.1.1.1"));
    }

    #[test]
    fn test_peer_address_used_without_headers() {
        let ip = client_ip(
            &HeaderMap::new(),
            &with_peer("198.51.100.7:4242"),
            &TrustedProxyConfig::default(),
        );
        assert_eq!(ip.as_deref(), Some("198.51.100.7"));
    }

    #[test]
    fn test_nothing_identifies_client() {
        let ip = client_ip(
            &HeaderMap::new(),
            &Extensions::new(),
            &TrustedProxyConfig::default(),
        );
        assert!(ip.is_none());
    }

    #[test]
    fn test_untrusted_peer_headers_ignored() {
        let trusted = TrustedProxyConfig::new(&["10.0.0.0/8".to_string()]);
        let h = headers(&[("x-forwarded-for", "1.2.3.4")]);

        let spoofed = client_ip(&h, &with_peer("198.51.100.7:1000"), &trusted);
        assert_eq!(spoofed.as_deref(), Some("198.51.100.7"));

        let proxied = client_ip(&h, &with_peer("10.2.3.4:1000"), &trusted);
        assert_eq!(proxied.as_deref(), Some("1.2.3.4"));
    }

    #[test]
    fn test_trusted_proxy_config_skips_invalid() {
        let config = TrustedProxyConfig::new(&["bogus".to_string(), "172.16.0.0/12".to_string()]);
        assert!(config.is_enabled());
        assert!(config.is_trusted(&"172.31.255.255".parse().unwrap()));
        assert!(!config.is_trusted(&"8.8.8.8".parse().unwrap()));
    }
}
