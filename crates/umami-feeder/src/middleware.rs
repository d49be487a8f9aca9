// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tower middleware reporting responses to the feeder.
//!
//! ```rust,ignore
//! let app = Router::new()
//!     .route("/", get(handler))
//!     .layer(UmamiLayer::new(feeder));
//! ```
//!
//! The request is matched before it reaches the inner service. Tracked requests have their
//! final status observed once the inner service answers; the response itself is passed through
//! untouched. Inner service errors produce no event.

use std::task::{Context, Poll};

use axum::http::{Request, Response, StatusCode};
use futures::future::BoxFuture;
use tower::{Layer, Service};

use crate::event::RequestInfo;
use crate::feeder::UmamiFeeder;

#[derive(Clone)]
pub struct UmamiLayer {
    feeder: UmamiFeeder,
}

impl UmamiLayer {
    #[must_use]
    pub fn new(feeder: UmamiFeeder) -> Self {
        Self { feeder }
    }
}

impl<S> Layer<S> for UmamiLayer {
    type Service = UmamiService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        UmamiService {
            inner,
            feeder: self.feeder.clone(),
        }
    }
}

#[derive(Clone)]
pub struct UmamiService<S> {
    inner: S,
    feeder: UmamiFeeder,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for UmamiService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let capture = StatusCapture::for_request(&self.feeder, &request);
        let response = self.inner.call(request);

        Box::pin(async move {
            let response = response.await?;
            if let Some(mut capture) = capture {
                capture.observe(response.status());
            }
            Ok(response)
        })
    }
}

/// Reports a tracked request with the first status observed for it.
pub struct StatusCapture {
    pending: Option<RequestInfo>,
    feeder: UmamiFeeder,
}

impl StatusCapture {
    /// `None` when the feeder is inactive or the request is not tracked.
    #[must_use]
    pub fn for_request<B>(feeder: &UmamiFeeder, request: &Request<B>) -> Option<Self> {
        if !feeder.is_active() {
            return None;
        }
        let info = RequestInfo::from_request(request);
        feeder.should_track(&info).then(|| Self {
            pending: Some(info),
            feeder: feeder.clone(),
        })
    }

    /// Hands the request to the feeder on the first call; later calls are ignored.
    ///
    /// Returns whether this call was the first one.
    pub fn observe(&mut self, status: StatusCode) -> bool {
        match self.pending.take() {
            Some(info) => {
                self.feeder.capture(info, status);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::connection::ConnectionState;
    use crate::dispatcher::tests::RecordingSink;
    use std::collections::HashMap;
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;
    use tower::{service_fn, ServiceExt};

    async fn active_feeder(sink: Arc<RecordingSink>) -> UmamiFeeder {
        let config = Config {
            umami_host: "http://127.0.0.1:1".to_string(),
            websites: HashMap::from([("example.com".to_string(), "site-1".to_string())]),
            batch_max_wait: Duration::from_secs(60),
            ..Config::default()
        };
        let feeder =
            UmamiFeeder::with_sink(config, sink, CancellationToken::new()).expect("feeder");
        let mut states = feeder.subscribe_state();
        tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == ConnectionState::Active))
            .await
            .expect("feeder should activate")
            .expect("state channel open");
        feeder
    }

    fn request(uri: &str) -> Request<String> {
        Request::builder()
            .uri(uri)
            .header("host", "example.com")
            .body(String::new())
            .expect("request")
    }

    #[tokio::test]
    async fn test_status_observed_once() {
        let sink = Arc::new(RecordingSink::default());
        let feeder = active_feeder(Arc::clone(&sink)).await;

        let mut capture =
            StatusCapture::for_request(&feeder, &request("/")).expect("request should be tracked");
        assert!(capture.observe(StatusCode::OK));
        assert!(!capture.observe(StatusCode::INTERNAL_SERVER_ERROR));

        feeder.shutdown().await;
        assert_eq!(sink.batch_sizes(), vec![1]);
    }

    #[tokio::test]
    async fn test_untracked_request_has_no_capture() {
        let sink = Arc::new(RecordingSink::default());
        let feeder = active_feeder(sink).await;

        assert!(StatusCapture::for_request(&feeder, &request("/logo.png")).is_none());

        let other_host = Request::builder()
            .uri("/")
            .header("host", "unknown.example.com")
            .body(())
            .expect("request");
        assert!(StatusCapture::for_request(&feeder, &other_host).is_none());
        feeder.shutdown().await;
    }

    #[tokio::test]
    async fn test_layer_reports_responses() {
        let sink = Arc::new(RecordingSink::default());
        let feeder = active_feeder(Arc::clone(&sink)).await;

        let inner = service_fn(|req: Request<String>| async move {
            let status = if req.uri().path() == "/missing" {
                StatusCode::NOT_FOUND
            } else {
                StatusCode::OK
            };
            Ok::<_, Infallible>(
                Response::builder()
                    .status(status)
                    .body(String::from("hello"))
                    .expect("response"),
            )
        });
        let service = UmamiLayer::new(feeder.clone()).layer(inner);

        let response = service
            .clone()
            .oneshot(request("/about?lang=en"))
            .await
            .expect("infallible");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.into_body(), "hello");

        let response = service
            .clone()
            .oneshot(request("/missing"))
            .await
            .expect("infallible");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        service
            .oneshot(request("/style.css"))
            .await
            .expect("infallible");

        feeder.shutdown().await;
        assert_eq!(sink.urls(), vec!["/about?lang=en".to_string()]);
    }

    #[tokio::test]
    async fn test_inner_error_produces_no_event() {
        let sink = Arc::new(RecordingSink::default());
        let feeder = active_feeder(Arc::clone(&sink)).await;

        let inner = service_fn(|_req: Request<String>| async move {
            Err::<Response<String>, _>("handler failed")
        });
        let result = UmamiLayer::new(feeder.clone())
            .layer(inner)
            .oneshot(request("/"))
            .await;
        assert!(result.is_err());

        feeder.shutdown().await;
        assert!(sink.batch_sizes().is_empty());
    }

    #[tokio::test]
    async fn test_inactive_feeder_passes_through() {
        let sink = Arc::new(RecordingSink::default());
        let config = Config {
            enabled: false,
            ..Config::default()
        };
        let feeder = UmamiFeeder::with_sink(
            config,
            Arc::clone(&sink) as Arc<dyn crate::dispatcher::BatchSink>,
            CancellationToken::new(),
        )
        .expect("feeder");

        let inner = service_fn(|_req: Request<String>| async move {
            Ok::<_, Infallible>(Response::new(String::from("ok")))
        });
        let response = UmamiLayer::new(feeder.clone())
            .layer(inner)
            .oneshot(request("/"))
            .await
            .expect("infallible");
        assert_eq!(response.status(), StatusCode::OK);

        feeder.shutdown().await;
        assert!(sink.batch_sizes().is_empty());
    }
}
