// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tracing::{error, info};

use umami_feeder::{logger, Config, UmamiFeeder, UmamiLayer};

const CONFIG_PATH_ENV: &str = "UMAMI_FEEDER_CONFIG";
const ROOT_ENV: &str = "UMAMI_FEEDER_ROOT";
const LISTEN_ENV: &str = "UMAMI_FEEDER_LISTEN";
const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

#[tokio::main]
pub async fn main() {
    let config_path = env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("UMAMI_FEEDER | ERROR | {e}");
            return;
        }
    };

    if let Err(e) = logger::init(config.debug) {
        eprintln!("UMAMI_FEEDER | ERROR | {e}");
        return;
    }

    let root = env::var(ROOT_ENV).unwrap_or_else(|_| ".".to_string());
    let listen = env::var(LISTEN_ENV).unwrap_or_else(|_| DEFAULT_LISTEN.to_string());

    let cancel = CancellationToken::new();
    let feeder = match UmamiFeeder::new(config, cancel.clone()) {
        Ok(feeder) => feeder,
        Err(e) => {
            error!(error = %e, "unable to build umami client");
            return;
        }
    };

    let app = Router::new()
        .fallback_service(ServeDir::new(&root))
        .layer(UmamiLayer::new(feeder.clone()));

    let listener = match TcpListener::bind(&listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(address = %listen, error = %e, "unable to bind listener");
            return;
        }
    };
    info!(address = %listen, root = %root, "serving files");

    let shutdown = cancel.clone();
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "unable to listen for shutdown signal");
                }
                info!("shutdown signal received");
            }
            () = shutdown.cancelled() => {}
        }
    })
    .await;
    if let Err(e) = served {
        error!(error = %e, "server error");
    }

    feeder.shutdown().await;
    info!("stopped");
}
