// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Feeder configuration.
//!
//! Configuration sources are applied in the following order (later sources override earlier):
//!
//! 1. **Defaults** - see [`Config::default`]
//! 2. **YAML file** - optional, keys use the camelCase names of the plugin configuration
//! 3. **Environment variables** - `UMAMI_FEEDER_*` (highest priority)
//!
//! Environment variable names are the snake case form of the configuration key, e.g.
//! `UMAMI_FEEDER_UMAMI_HOST` sets `umamiHost` and `UMAMI_FEEDER_IGNORE_IPS` sets `ignoreIPs`.
//! Lists and maps use figment's inline syntax: `[a, b]` and `{key=value}`.
//!
//! The configuration is validated by the connection state machine, not here: a config that
//! loads may still disable the feeder once it is verified.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix of the environment variables read by [`Config::load`].
pub const ENV_PREFIX: &str = "UMAMI_FEEDER_";

pub const DEFAULT_QUEUE_SIZE: usize = 1000;
pub const DEFAULT_BATCH_SIZE: usize = 20;
pub const DEFAULT_BATCH_MAX_WAIT: Duration = Duration::from_secs(5);
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(15);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HEADER_IP: &str = "X-Real-IP";

/// Errors raised while loading or verifying the configuration.
///
/// Every variant other than [`ConfigError::Load`] is a permanent failure of the connection
/// state machine: the feeder is disabled and not retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("umamiHost is not set")]
    MissingHost,
    #[error("either umamiToken or websites must be set")]
    MissingCredentials,
    #[error("umamiToken is required to create new websites")]
    TokenRequiredForCreate,
    #[error("invalid ignoreIP given {value}: {reason}")]
    InvalidIpRange { value: String, reason: String },
    #[error("failed to compile ignoreURL {pattern}: {source}")]
    InvalidUrlPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid header name {0}")]
    InvalidHeaderName(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Set to `false` to disable the feeder.
    pub enabled: bool,
    /// Deprecated inverse of `enabled`.
    pub disabled: bool,
    /// Enables debug logging and logging of collector responses.
    pub debug: bool,
    /// Amount of events waiting to be submitted before new ones are dropped.
    pub queue_size: usize,
    /// Amount of events submitted in one request.
    pub batch_size: usize,
    /// Maximum time an event waits in a partial batch.
    #[serde(with = "duration_str")]
    pub batch_max_wait: Duration,

    /// Base URL of the Umami instance.
    pub umami_host: String,
    /// API token; either this, username/password, or `websites` must be set.
    pub umami_token: String,
    pub umami_username: String,
    pub umami_password: String,
    /// Team whose websites are fetched and created.
    pub umami_team_id: String,

    /// Static hostname to website id mappings. They take precedence over fetched websites.
    pub websites: HashMap<String, String>,
    /// Create websites for unknown hostnames, requires a token.
    pub create_new_websites: bool,

    /// Report responses with status >= 400.
    pub track_errors: bool,
    /// Report every resource, not only content-like ones.
    pub track_all_resources: bool,
    /// Replaces the built-in list of tracked extensions, e.g. `[".html", ""]`.
    pub track_extensions: Vec<String>,

    pub ignore_user_agents: Vec<String>,
    /// Regular expressions matched against the request URL.
    #[serde(rename = "ignoreURLs")]
    pub ignore_urls: Vec<String>,
    pub ignore_hosts: Vec<String>,
    /// Single addresses or CIDR ranges.
    #[serde(rename = "ignoreIPs")]
    pub ignore_ips: Vec<String>,
    /// Header carrying the client address for `ignoreIPs`.
    pub header_ip: String,

    /// Request header name to event data field name.
    pub capture_headers: HashMap<String, String>,

    /// Base delay of the connection retry backoff.
    #[serde(with = "duration_str")]
    pub retry_base_delay: Duration,
    /// Timeout of each call to the collector.
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            disabled: false,
            debug: false,
            queue_size: DEFAULT_QUEUE_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_max_wait: DEFAULT_BATCH_MAX_WAIT,
            umami_host: String::new(),
            umami_token: String::new(),
            umami_username: String::new(),
            umami_password: String::new(),
            umami_team_id: String::new(),
            websites: HashMap::new(),
            create_new_websites: false,
            track_errors: false,
            track_all_resources: false,
            track_extensions: Vec::new(),
            ignore_user_agents: Vec::new(),
            ignore_urls: Vec::new(),
            ignore_hosts: Vec::new(),
            ignore_ips: Vec::new(),
            header_ip: DEFAULT_HEADER_IP.to_string(),
            capture_headers: HashMap::new(),
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl Config {
    /// Loads defaults, then the optional YAML file, then `UMAMI_FEEDER_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment
            .merge(
                Env::prefixed(ENV_PREFIX).map(|key| env_key_to_field(key.as_str()).into()),
            )
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))
    }

    /// The feeder runs only when `enabled` is set and the deprecated `disabled` is not.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled && !self.disabled
    }

    pub(crate) fn has_credentials(&self) -> bool {
        !self.umami_username.is_empty() && !self.umami_password.is_empty()
    }

    pub(crate) fn team_id(&self) -> Option<&str> {
        Some(self.umami_team_id.as_str()).filter(|id| !id.is_empty())
    }
}

/// Maps `UMAMI_HOST` to `umamiHost`.
fn env_key_to_field(key: &str) -> String {
    let lower = key.to_ascii_lowercase();
    match lower.as_str() {
        "ignore_urls" => return "ignoreURLs".to_string(),
        "ignore_ips" => return "ignoreIPs".to_string(),
        _ => {}
    }

    let mut field = String::with_capacity(lower.len());
    let mut upper_next = false;
    for c in lower.chars() {
        if c == '_' {
            upper_next = !field.is_empty();
        } else if upper_next {
            field.push(c.to_ascii_uppercase());
            upper_next = false;
        } else {
            field.push(c);
        }
    }
    field
}

/// Durations are written as human readable strings ("5s", "250ms"); plain integers are seconds.
mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => {
                humantime::parse_duration(text.trim()).map_err(serde::de::Error::custom)
            }
        }
    }
}
