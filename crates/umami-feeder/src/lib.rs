// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Request-observation middleware feeding an Umami analytics collector.
//!
//! Requests passing the configured filters are reported as pageview events once their final
//! status is known. Events go through a bounded queue to a single dispatcher that submits them
//! in batches, so the request path never waits on the collector. The pipeline only starts
//! after the connection state machine has logged in, primed the website cache and verified
//! the ignore rules.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod event;
pub mod feeder;
pub mod http;
pub mod logger;
pub mod matcher;
pub mod middleware;
mod pending;
pub mod queue;
pub mod resolver;

pub use config::{Config, ConfigError};
pub use connection::{retry_delay, BootstrapError, ConnectionState};
pub use dispatcher::{BatchDispatcher, BatchSink, CollectorSink};
pub use event::{Envelope, Event, RequestInfo};
pub use feeder::UmamiFeeder;
pub use http::{CollectorClient, CollectorError, Website};
pub use matcher::{IpPrefix, Matcher};
pub use middleware::{StatusCapture, UmamiLayer, UmamiService};
pub use resolver::SiteResolver;
