// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Request filtering.
//!
//! A [`Matcher`] is compiled once from the configuration when the connection is verified and
//! is immutable afterwards. All checks are pure and cheap enough for the request path.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use axum::http::header::USER_AGENT;
use axum::http::{HeaderName, StatusCode};
use regex::Regex;
use tracing::debug;

use crate::config::{Config, ConfigError};
use crate::event::RequestInfo;

/// Extensions reported when neither `trackAllResources` nor `trackExtensions` is set.
pub const CONTENT_EXTENSIONS: [&str; 12] = [
    "", ".htm", ".html", ".xhtml", ".jsf", ".md", ".php", ".rss", ".rtf", ".txt", ".xml", ".pdf",
];

/// An IP network: address plus prefix length. Host bits of the address are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpPrefix {
    addr: IpAddr,
    len: u8,
}

impl IpPrefix {
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask_u32(self.len);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask_u128(self.len);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask_u32(len: u8) -> u32 {
    u32::MAX.checked_shl(32 - u32::from(len)).unwrap_or(0)
}

fn prefix_mask_u128(len: u8) -> u128 {
    u128::MAX.checked_shl(128 - u32::from(len)).unwrap_or(0)
}

impl FromStr for IpPrefix {
    type Err = ConfigError;

    /// Accepts `10.0.0.0/8`, `2001:db8::/32` or a bare address, which covers only itself.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidIpRange {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = value.trim();
        let (addr, len) = match trimmed.split_once('/') {
            Some((addr, len)) => (addr, Some(len)),
            None => (trimmed, None),
        };
        let addr: IpAddr = addr.parse().map_err(|_| invalid("not an IP address"))?;
        let max_len = if addr.is_ipv4() { 32 } else { 128 };
        let len = match len {
            Some(len) => len
                .parse::<u8>()
                .ok()
                .filter(|len| *len <= max_len)
                .ok_or_else(|| invalid("bad prefix length"))?,
            None => max_len,
        };
        Ok(Self { addr, len })
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

/// Which resources and statuses are reported, and which requests are ignored.
#[derive(Debug, Clone)]
pub struct Matcher {
    ignore_hosts: Vec<String>,
    ignore_prefixes: Vec<IpPrefix>,
    ignore_user_agents: Vec<String>,
    ignore_urls: Vec<Regex>,
    header_ip: HeaderName,
    track_all_resources: bool,
    track_extensions: Vec<String>,
    track_errors: bool,
}

impl Matcher {
    /// Compiles the ignore rules. Any malformed IP range or pattern fails the whole set.
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let ignore_prefixes = config
            .ignore_ips
            .iter()
            .map(|value| value.parse::<IpPrefix>())
            .collect::<Result<Vec<_>, _>>()?;

        let ignore_urls = config
            .ignore_urls
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| ConfigError::InvalidUrlPattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let header_ip = HeaderName::from_bytes(config.header_ip.trim().as_bytes())
            .map_err(|_| ConfigError::InvalidHeaderName(config.header_ip.clone()))?;

        Ok(Self {
            ignore_hosts: config.ignore_hosts.clone(),
            ignore_prefixes,
            ignore_user_agents: config.ignore_user_agents.clone(),
            ignore_urls,
            header_ip,
            track_all_resources: config.track_all_resources,
            track_extensions: config.track_extensions.clone(),
            track_errors: config.track_errors,
        })
    }

    /// Applies the ignore rules in order: host, client IP, user agent, URL.
    #[must_use]
    pub fn should_track_request(&self, request: &RequestInfo) -> bool {
        if !self.ignore_hosts.is_empty() {
            let hostname = request.hostname();
            let ignored = self.ignore_hosts.iter().any(|host| {
                host.eq_ignore_ascii_case(&request.host) || host.eq_ignore_ascii_case(&hostname)
            });
            if ignored {
                debug!(host = %request.host, "ignoring host");
                return false;
            }
        }

        if !self.ignore_prefixes.is_empty() {
            let Some(ip) = self.client_ip(request) else {
                debug!(header = %self.header_ip, "invalid client IP");
                return false;
            };
            if self.ignore_prefixes.iter().any(|prefix| prefix.contains(ip)) {
                debug!(%ip, "ignoring IP");
                return false;
            }
        }

        if !self.ignore_user_agents.is_empty() {
            let user_agent = request.header(USER_AGENT.as_str());
            if self
                .ignore_user_agents
                .iter()
                .any(|ignored| user_agent.contains(ignored.as_str()))
            {
                debug!(user_agent, "ignoring user-agent");
                return false;
            }
        }

        if self.ignore_urls.iter().any(|regex| regex.is_match(&request.url)) {
            debug!(url = %request.url, "ignoring location");
            return false;
        }

        true
    }

    /// Address checked against `ignoreIPs`: the configured header, else the connection address.
    fn client_ip(&self, request: &RequestInfo) -> Option<IpAddr> {
        let header = request.header(self.header_ip.as_str()).trim();
        if header.is_empty() {
            request.remote_addr.map(|addr| addr.ip())
        } else {
            header.parse().ok()
        }
    }

    #[must_use]
    pub fn should_track_resource(&self, path: &str) -> bool {
        if self.track_all_resources {
            return true;
        }

        let extension = path_extension(path);
        if !self.track_extensions.is_empty() {
            return self.track_extensions.iter().any(|ext| ext == extension);
        }
        CONTENT_EXTENSIONS.contains(&extension)
    }

    #[must_use]
    pub fn should_track_status(&self, status: StatusCode) -> bool {
        if status.as_u16() >= 400 && !self.track_errors {
            debug!(status = status.as_u16(), "not reporting error");
            return false;
        }
        true
    }
}

/// Extension of the last path segment including the dot, or `""`.
fn path_extension(path: &str) -> &str {
    let segment = path.rsplit('/').next().unwrap_or_default();
    segment.rfind('.').map_or("", |idx| &segment[idx..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::tests::request_info;

    fn matcher(config: Config) -> Matcher {
        Matcher::new(&config).expect("rules should compile")
    }

    #[test]
    fn test_path_extension() {
        assert_eq!(path_extension(""), "");
        assert_eq!(path_extension("/"), "");
        assert_eq!(path_extension("/about"), "");
        assert_eq!(path_extension("/products.html"), ".html");
        assert_eq!(path_extension("/archive.tar.gz"), ".gz");
        assert_eq!(path_extension("/v1.2/readme"), "");
    }

    #[test]
    fn test_should_track_resource_default() {
        let matcher = matcher(Config::default());
        assert!(matcher.should_track_resource(""));
        assert!(matcher.should_track_resource("/about"));
        assert!(matcher.should_track_resource("/products.html"));
        assert!(matcher.should_track_resource("/blog.php"));
        assert!(matcher.should_track_resource("/feed.rss"));
        assert!(!matcher.should_track_resource("/favicon.ico"));
        assert!(!matcher.should_track_resource("/photo.jpg"));
        assert!(!matcher.should_track_resource("/background.png"));
    }

    #[test]
    fn test_should_track_resource_custom_extensions() {
        let matcher = matcher(Config {
            track_extensions: vec![".png".to_string()],
            ..Config::default()
        });
        assert!(matcher.should_track_resource("/background.png"));
        assert!(!matcher.should_track_resource("/about"));
        assert!(!matcher.should_track_resource("/index.html"));

        let matcher = self::matcher(Config {
            track_all_resources: true,
            track_extensions: vec![".png".to_string()],
            ..Config::default()
        });
        assert!(matcher.should_track_resource("/favicon.ico"));
    }

    #[test]
    fn test_should_track_status() {
        let matcher = matcher(Config::default());
        assert!(matcher.should_track_status(StatusCode::OK));
        assert!(matcher.should_track_status(StatusCode::MOVED_PERMANENTLY));
        assert!(!matcher.should_track_status(StatusCode::NOT_FOUND));
        assert!(!matcher.should_track_status(StatusCode::INTERNAL_SERVER_ERROR));

        let matcher = self::matcher(Config {
            track_errors: true,
            ..Config::default()
        });
        assert!(matcher.should_track_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_invalid_ip_range_is_rejected() {
        let err = Matcher::new(&Config {
            ignore_ips: vec!["127.0.0.1-127.0.0.10".to_string()],
            ..Config::default()
        })
        .expect_err("range syntax is not supported");
        assert!(matches!(err, ConfigError::InvalidIpRange { .. }));

        assert!("10.0.0.0/33".parse::<IpPrefix>().is_err());
        assert!("::1/129".parse::<IpPrefix>().is_err());
    }

    #[test]
    fn test_invalid_url_pattern_is_rejected() {
        let err = Matcher::new(&Config {
            ignore_urls: vec!["(unclosed".to_string()],
            ..Config::default()
        })
        .expect_err("pattern should not compile");
        assert!(matches!(err, ConfigError::InvalidUrlPattern { .. }));
    }

    #[test]
    fn test_ip_prefix_contains() {
        let prefix: IpPrefix = "10.0.0.1/24".parse().expect("prefix");
        assert!(prefix.contains("10.0.0.255".parse().expect("ip")));
        assert!(!prefix.contains("10.0.1.1".parse().expect("ip")));
        assert!(!prefix.contains("::ffff:10.0.0.1".parse().expect("ip")));

        let all: IpPrefix = "0.0.0.0/0".parse().expect("prefix");
        assert!(all.contains("8.8.8.8".parse().expect("ip")));

        let v6: IpPrefix = "2001:db8::/32".parse().expect("prefix");
        assert!(v6.contains("2001:db8:1::1".parse().expect("ip")));
        assert!(!v6.contains("2001:db9::1".parse().expect("ip")));

        let single: IpPrefix = "127.0.0.1".parse().expect("prefix");
        assert_eq!(single.to_string(), "127.0.0.1/32");
    }

    #[test]
    fn test_should_track_ips() {
        let matcher = matcher(Config {
            ignore_ips: vec!["127.0.0.1".to_string(), "10.0.0.1/24".to_string()],
            ..Config::default()
        });
        let cases = [
            ("192.168.0.1", true),
            ("127.0.0.1", false),
            ("10.0.0.1", false),
            ("10.0.0.255", false),
            ("10.0.1.1", true),
            ("10.10.10.1", true),
            ("1.1.1.1", true),
            ("8.8.8.8", true),
            ("not-an-ip", false),
        ];
        for (ip, expected) in cases {
            let info = request_info("http://localhost/", &[("x-real-ip", ip)]);
            assert_eq!(matcher.should_track_request(&info), expected, "{ip}");
        }
    }

    #[test]
    fn test_ignore_ips_falls_back_to_remote_addr() {
        let matcher = matcher(Config {
            ignore_ips: vec!["192.0.2.0/24".to_string()],
            ..Config::default()
        });
        // request_info connects from 192.0.2.10
        assert!(!matcher.should_track_request(&request_info("/", &[])));

        let matcher = self::matcher(Config {
            ignore_ips: vec!["192.0.2.0/24".to_string()],
            header_ip: "CF-Connecting-IP".to_string(),
            ..Config::default()
        });
        let info = request_info("/", &[("cf-connecting-ip", "203.0.113.9")]);
        assert!(matcher.should_track_request(&info));
    }

    #[test]
    fn test_should_track_hosts() {
        let matcher = matcher(Config {
            ignore_hosts: vec!["localhost".to_string(), "internal.example.com".to_string()],
            ..Config::default()
        });
        let cases = [
            ("http://localhost/about", false),
            ("http://LOCALHOST/about", false),
            ("http://localhost:8080/about", false),
            ("https://about.localhost/", true),
            ("https://internal.example.com/welcome", false),
            ("https://EXAMPLE.COM", true),
        ];
        for (url, expected) in cases {
            assert_eq!(matcher.should_track_request(&request_info(url, &[])), expected, "{url}");
        }
    }

    #[test]
    fn test_should_track_urls() {
        let matcher = matcher(Config {
            ignore_urls: vec!["/about".to_string(), "^/admin".to_string(), "world$".to_string()],
            ..Config::default()
        });
        let cases = [
            ("/", true),
            ("/about", false),
            ("/aboutus", false),
            ("/category/about", false),
            ("/world/news", true),
            ("/hello-world", false),
            ("/admin/secret", false),
        ];
        for (url, expected) in cases {
            assert_eq!(matcher.should_track_request(&request_info(url, &[])), expected, "{url}");
        }
    }

    #[test]
    fn test_should_track_user_agents() {
        let matcher = matcher(Config {
            ignore_user_agents: vec!["Googlebot".to_string(), "Uptime-Kuma".to_string()],
            ..Config::default()
        });
        let cases = [
            ("Mozilla/5.0 (Windows; Windows NT 6.0; WOW64) Gecko/20100101 Firefox/60.7", true),
            ("Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36", true),
            ("Uptime-Kuma/1.18.5", false),
            ("Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) HeadlessChrome/90.0.4430.212 Safari/537.36 Uptime-Kuma/1.23.1", false),
            ("Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)", false),
        ];
        for (ua, expected) in cases {
            let info = request_info("http://localhost/", &[("user-agent", ua)]);
            assert_eq!(matcher.should_track_request(&info), expected, "{ua}");
        }
    }
}
