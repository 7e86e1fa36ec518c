//! A small HTTP client wrapper that shares one cookie jar between ordinary
//! GET/POST calls and the `Cookie` header the WebSocket handshake needs.
//!
//! `reqwest`'s built-in cookie store is opaque (write-only from the
//! caller's point of view), but the auth probe needs to *read* specific
//! cookies back out (`rscid`, `rsconnect`, `session_state`) and the
//! WebSocket open needs to serialize the whole jar into a `Cookie` header.
//! `reqwest_cookie_store` wraps the same `cookie_store` crate reqwest uses
//! internally behind a `Mutex`, giving us that access.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use reqwest_cookie_store::CookieStoreMutex;
use url::Url;

use core::error::ShinyError;

/// A GET/POST response reduced to what the replay engine cares about:
/// status and body. Headers are inspected separately by the auth probe.
pub struct SimpleResponse {
    pub status: StatusCode,
    pub headers: reqwest::header::HeaderMap,
    pub body: String,
}

#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    jar: Arc<CookieStoreMutex>,
}

impl HttpClient {
    pub fn new(user_agent: &str) -> Result<Self, ShinyError> {
        let jar = Arc::new(CookieStoreMutex::new(cookie_store::CookieStore::default()));
        let client = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .user_agent(user_agent.to_string())
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ShinyError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self { client, jar })
    }

    pub async fn get(&self, url: &str) -> Result<SimpleResponse, reqwest::Error> {
        self.request(Method::GET, url, None, None).await
    }

    pub async fn post_bytes(
        &self,
        url: &str,
        body: Vec<u8>,
    ) -> Result<SimpleResponse, reqwest::Error> {
        self.request(Method::POST, url, Some(body), None).await
    }

    pub async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<SimpleResponse, reqwest::Error> {
        let bytes = serde_json::to_vec(body).expect("json::Value always serializes");
        self.request(Method::POST, url, Some(bytes), Some("application/json"))
            .await
    }

    pub async fn post_form(
        &self,
        url: &str,
        form: &[(String, String)],
    ) -> Result<SimpleResponse, reqwest::Error> {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(form)
            .finish();
        self.request(
            Method::POST,
            url,
            Some(encoded.into_bytes()),
            Some("application/x-www-form-urlencoded"),
        )
        .await
    }

    async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
        content_type: Option<&str>,
    ) -> Result<SimpleResponse, reqwest::Error> {
        let mut builder = self.client.request(method, url);
        if let Some(ct) = content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, ct);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }
        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;
        Ok(SimpleResponse {
            status,
            headers,
            body,
        })
    }

    /// Every cookie currently held for `url`, as a `name=value; ...` string
    /// suitable for a WebSocket handshake's `Cookie` header.
    pub fn cookie_header(&self, url: &Url) -> String {
        let store = self.jar.lock().expect("cookie jar mutex poisoned");
        store
            .get_request_values(url)
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// The value of a single named cookie visible for `url`, if present.
    pub fn find_cookie(&self, url: &Url, name: &str) -> Option<String> {
        let store = self.jar.lock().expect("cookie jar mutex poisoned");
        store
            .get_request_values(url)
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.to_string())
    }
}
