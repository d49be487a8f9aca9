// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP client for the Umami collector API.
//!
//! Every call sends and receives JSON. Responses outside of the 2xx range are turned into
//! [`CollectorError::Status`] carrying the response body so the caller can log it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::event::Envelope;

const LOGIN_ENDPOINT: &str = "/api/auth/login";
const WEBSITES_ENDPOINT: &str = "/api/websites";
const BATCH_ENDPOINT: &str = "/api/batch";
const WEBSITES_PAGE_SIZE: u32 = 200;

#[derive(Debug, Error)]
pub enum CollectorError {
    /// Transport-level issue (DNS, TLS, socket, timeout, etc.).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The collector answered with a non-2xx status.
    #[error("request failed with status {status} ({body})")]
    Status { status: u16, body: String },
    /// Response payload is not the expected JSON document.
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A website as known by the collector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Website {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WebsitesResponse {
    data: Vec<Website>,
    count: u64,
    page: u64,
    page_size: u64,
    order_by: Option<String>,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateWebsiteRequest<'a> {
    name: &'a str,
    domain: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    team_id: Option<&'a str>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Reusable client bound to one collector base URL.
#[derive(Debug, Clone)]
pub struct CollectorClient {
    client: Client,
    base_url: String,
}

impl CollectorClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CollectorError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("umami-feeder/", env!("CARGO_PKG_VERSION"))),
        );
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self { client, base_url })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Exchanges username and password for a bearer token.
    ///
    /// An empty token is returned as-is; the caller decides whether that is an error.
    pub async fn login(&self, username: &str, password: &str) -> Result<String, CollectorError> {
        let body = LoginRequest { username, password };
        let response: LoginResponse = self
            .send_and_parse(Method::POST, LOGIN_ENDPOINT, Some(&body), None)
            .await?;
        Ok(response.token)
    }

    /// Lists the websites visible to the token, scoped to a team when one is given.
    pub async fn fetch_websites(
        &self,
        token: &str,
        team_id: Option<&str>,
    ) -> Result<Vec<Website>, CollectorError> {
        let path = match team_id {
            Some(team_id) => format!("/api/teams/{team_id}/websites?pageSize={WEBSITES_PAGE_SIZE}"),
            None => format!("{WEBSITES_ENDPOINT}?pageSize={WEBSITES_PAGE_SIZE}"),
        };
        let response: WebsitesResponse = self
            .send_and_parse::<(), _>(Method::GET, &path, None, Some(token))
            .await?;
        debug!(
            count = response.count,
            page = response.page,
            page_size = response.page_size,
            order_by = response.order_by.as_deref().unwrap_or_default(),
            "websites fetched"
        );
        Ok(response.data)
    }

    /// Creates a website named after its domain.
    pub async fn create_website(
        &self,
        token: &str,
        team_id: Option<&str>,
        domain: &str,
    ) -> Result<Website, CollectorError> {
        let body = CreateWebsiteRequest {
            name: domain,
            domain,
            team_id,
        };
        self.send_and_parse(Method::POST, WEBSITES_ENDPOINT, Some(&body), Some(token))
            .await
    }

    /// Submits a batch of events. The batch endpoint does not require authentication.
    pub async fn send_batch(&self, batch: &[Envelope]) -> Result<Response, CollectorError> {
        self.send_json(Method::POST, BATCH_ENDPOINT, Some(batch), None)
            .await
    }

    async fn send_and_parse<B, T>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        token: Option<&str>,
    ) -> Result<T, CollectorError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.send_json(method, path, body, token).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Sends the request and classifies the status. Non-2xx bodies are captured for diagnostics.
    async fn send_json<B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        token: Option<&str>,
    ) -> Result<Response, CollectorError>
    where
        B: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!(method = %method, url = %url, "umami HTTP request");

        let mut builder = self.client.request(method, url);
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CollectorError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use mockito::{Matcher, Server};

    fn client(server: &mockito::ServerGuard) -> CollectorClient {
        CollectorClient::new(server.url(), Duration::from_secs(5)).expect("client should build")
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let client = CollectorClient::new("http://umami:3000/", Duration::from_secs(1))
            .expect("client should build");
        assert_eq!(client.base_url(), "http://umami:3000");
    }

    #[tokio::test]
    async fn test_login_returns_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/auth/login")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(serde_json::json!({
                "username": "admin",
                "password": "umami"
            })))
            .with_status(200)
            .with_body(r#"{"token":"secret-token","user":{"id":"1"}}"#)
            .create_async()
            .await;

        let token = client(&server)
            .login("admin", "umami")
            .await
            .expect("login should succeed");

        assert_eq!(token, "secret-token");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_login_failure_captures_body() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/api/auth/login")
            .with_status(401)
            .with_body("Incorrect username and/or password.")
            .create_async()
            .await;

        let err = client(&server)
            .login("admin", "wrong")
            .await
            .expect_err("login should fail");

        match err {
            CollectorError::Status { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body, "Incorrect username and/or password.");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_websites_uses_bearer_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/websites")
            .match_query(Matcher::UrlEncoded("pageSize".into(), "200".into()))
            .match_header("authorization", "Bearer secret-token")
            .with_status(200)
            .with_body(
                r#"{"data":[
                    {"id":"a1","name":"example.com","teamId":null,"domain":"example.com","createdAt":"2024-05-01T10:00:00.000Z"},
                    {"id":"b2","name":"blog","domain":"blog.example.com"}
                ],"count":2,"page":1,"pageSize":200,"orderBy":"name"}"#,
            )
            .create_async()
            .await;

        let websites = client(&server)
            .fetch_websites("secret-token", None)
            .await
            .expect("fetch should succeed");

        assert_eq!(websites.len(), 2);
        assert_eq!(websites[0].id, "a1");
        assert_eq!(websites[0].domain, "example.com");
        assert!(websites[0].created_at.is_some());
        assert_eq!(websites[1].domain, "blog.example.com");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_websites_for_team() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/teams/team-1/websites")
            .match_query(Matcher::UrlEncoded("pageSize".into(), "200".into()))
            .with_status(200)
            .with_body(r#"{"data":[],"count":0,"page":1,"pageSize":200}"#)
            .create_async()
            .await;

        let websites = client(&server)
            .fetch_websites("secret-token", Some("team-1"))
            .await
            .expect("fetch should succeed");

        assert!(websites.is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_websites_rejects_invalid_json() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/websites")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("<html>not json</html>")
            .create_async()
            .await;

        let err = client(&server)
            .fetch_websites("secret-token", None)
            .await
            .expect_err("fetch should fail");
        assert!(matches!(err, CollectorError::Decode(_)));
    }

    #[tokio::test]
    async fn test_create_website_body() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/websites")
            .match_header("authorization", "Bearer secret-token")
            .match_body(Matcher::Json(serde_json::json!({
                "name": "new.example.com",
                "domain": "new.example.com",
                "teamId": "team-1"
            })))
            .with_status(200)
            .with_body(r#"{"id":"c3","name":"new.example.com","domain":"new.example.com","teamId":"team-1"}"#)
            .create_async()
            .await;

        let website = client(&server)
            .create_website("secret-token", Some("team-1"), "new.example.com")
            .await
            .expect("create should succeed");

        assert_eq!(website.id, "c3");
        assert_eq!(website.team_id.as_deref(), Some("team-1"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_batch_posts_envelopes() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/batch")
            .match_header("authorization", Matcher::Missing)
            .match_body(Matcher::PartialJson(serde_json::json!([
                {"type": "event", "payload": {"website": "a1", "hostname": "example.com", "url": "/"}}
            ])))
            .with_status(200)
            .with_body(r#"{"size":1}"#)
            .create_async()
            .await;

        let event = Event {
            website: "a1".to_string(),
            hostname: "example.com".to_string(),
            url: "/".to_string(),
            ..Event::default()
        };
        let response = client(&server)
            .send_batch(&[Envelope::event(event)])
            .await
            .expect("batch should be accepted");

        assert!(response.status().is_success());
        mock.assert_async().await;
    }
}
