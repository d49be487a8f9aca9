// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event records reported to the collector and the request attributes they are built from.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::LazyLock;

use axum::extract::ConnectInfo;
use axum::http::header::{ACCEPT_LANGUAGE, HOST, REFERER, USER_AGENT};
use axum::http::{HeaderMap, Request, StatusCode};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

const EVENT_TYPE: &str = "event";

static ACCEPT_LANGUAGE_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"([a-zA-Z\-]+)(?:;q=\d\.\d)?(?:,\s)?").ok());

/// Headers consulted, in order, for the client address reported in the event.
const CLIENT_IP_HEADERS: [&str; 2] = ["cf-connecting-ip", "x-vercel-ip"];

/// A pageview as accepted by the collector's batch endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub website: String,
    pub hostname: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub language: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub referrer: String,
    pub url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ip: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user_agent: String,
    /// Unix timestamp in seconds.
    #[serde(skip_serializing_if = "is_zero")]
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

/// Wire wrapper of one event in a batch: `{"payload": {...}, "type": "event"}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub payload: Event,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl Envelope {
    #[must_use]
    pub fn event(payload: Event) -> Self {
        Self {
            payload,
            kind: EVENT_TYPE,
        }
    }
}

/// The parts of an inbound request the feeder needs once the response is known.
///
/// Captured before the request is handed to the inner service, which consumes it.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// Raw `Host` value, port included.
    pub host: String,
    /// Request target as received (path and query, or absolute form).
    pub url: String,
    pub path: String,
    pub headers: HeaderMap,
    pub remote_addr: Option<SocketAddr>,
}

impl RequestInfo {
    /// Reads the `Host` header, falling back to the URI authority (HTTP/2).
    ///
    /// The remote address comes from axum's [`ConnectInfo`] extension when the server was
    /// started with `into_make_service_with_connect_info::<SocketAddr>()`.
    pub fn from_request<B>(request: &Request<B>) -> Self {
        let host = request
            .headers()
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .or_else(|| request.uri().authority().map(|a| a.as_str().to_string()))
            .unwrap_or_default();

        Self {
            host,
            url: request.uri().to_string(),
            path: request.uri().path().to_string(),
            headers: request.headers().clone(),
            remote_addr: request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        }
    }

    #[must_use]
    pub fn hostname(&self) -> String {
        parse_domain_from_host(&self.host)
    }

    /// First value of `name`, empty when missing or not valid UTF-8.
    #[must_use]
    pub fn header(&self, name: &str) -> &str {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
    }
}

impl Event {
    /// Builds the event for a tracked request.
    ///
    /// Responses with status >= 400 get `data.status_code`; configured headers present on the
    /// request are copied into `data` under their mapped names.
    #[must_use]
    pub fn from_request(
        info: &RequestInfo,
        website: &str,
        status: StatusCode,
        capture_headers: &HashMap<String, String>,
    ) -> Self {
        let mut data = Map::new();
        for (header_name, data_key) in capture_headers {
            let value = info.header(header_name);
            if !value.is_empty() {
                debug!(header = %header_name, key = %data_key, "captured header");
                data.insert(data_key.clone(), Value::String(value.to_string()));
            }
        }
        if status.as_u16() >= 400 {
            data.insert("status_code".to_string(), Value::from(status.as_u16()));
        }

        Self {
            website: website.to_string(),
            hostname: info.hostname(),
            language: parse_accept_language(info.header(ACCEPT_LANGUAGE.as_str())),
            referrer: info.header(REFERER.as_str()).to_string(),
            url: info.url.clone(),
            ip: extract_remote_ip(info),
            user_agent: info.header(USER_AGENT.as_str()).to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            data,
        }
    }
}

/// Normalizes a `Host` value: port and trailing dot removed, lower-cased.
///
/// Bracketed IPv6 literals keep their address without brackets.
#[must_use]
pub fn parse_domain_from_host(host: &str) -> String {
    let host = host.trim();
    let name = if let Some(rest) = host.strip_prefix('[') {
        rest.split(']').next().unwrap_or_default()
    } else {
        host.split(':').next().unwrap_or_default()
    };
    name.trim_end_matches('.').to_lowercase()
}

/// First language tag of an `Accept-Language` value, e.g. `en-US` for `en-US,en;q=0.9`.
#[must_use]
pub fn parse_accept_language(accept_language: &str) -> String {
    ACCEPT_LANGUAGE_PATTERN
        .as_ref()
        .and_then(|pattern| pattern.captures(accept_language))
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

/// Client address reported in the event: CDN headers, then the first `X-Forwarded-For`
/// entry, then `X-Real-IP`, then the connection address without port.
#[must_use]
pub fn extract_remote_ip(info: &RequestInfo) -> String {
    for name in CLIENT_IP_HEADERS {
        let value = info.header(name);
        if !value.is_empty() {
            return value.to_string();
        }
    }

    let forwarded = info.header("x-forwarded-for");
    if !forwarded.is_empty() {
        return forwarded.split(',').next().unwrap_or_default().trim().to_string();
    }

    let real_ip = info.header("x-real-ip");
    if !real_ip.is_empty() {
        return real_ip.to_string();
    }

    info.remote_addr
        .map(|addr| addr.ip().to_string())
        .unwrap_or_default()
}
