//! Request plumbing shared by the Jira and Harvest clients.

use crate::config::HttpOptions;
use crate::error::{ApiError, Result};
use crate::rate_limiter::RateLimiter;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Client as HttpClient, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// Authenticated HTTP transport bound to one API root.
#[derive(Clone)]
pub(crate) struct Transport {
    http: HttpClient,
    api_root: String,
    limiter: RateLimiter,
}

impl Transport {
    pub(crate) fn new(
        api_root: String,
        options: &HttpOptions,
        mut headers: HeaderMap,
        limiter: RateLimiter,
    ) -> Result<Self> {
        headers.insert(USER_AGENT, header_value(&options.user_agent)?);

        let http = HttpClient::builder()
            .default_headers(headers)
            .timeout(options.timeout)
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(|err| ApiError::InvalidConfig(err.to_string()))?;

        Ok(Self {
            http,
            api_root,
            limiter,
        })
    }

    pub(crate) fn api_root(&self) -> &str {
        &self.api_root
    }

    pub(crate) fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub(crate) async fn get<T>(&self, path: &str, query: &[(&str, String)]) -> Result<T>
    where
        T: DeserializeOwned,
    {
        self.limiter.hit().await;
        debug!(method = "GET", path, "api request");
        let mut request = self.http.get(self.url_for(path));
        if !query.is_empty() {
            request = request.query(query);
        }
        let response = request.send().await?;
        parse_json(response).await
    }

    pub(crate) async fn send<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.limiter.hit().await;
        debug!(method = %method, path, "api request");
        let mut request = self.http.request(method, self.url_for(path));
        if let Some(payload) = body {
            request = request.json(payload);
        }
        let response = request.send().await?;
        parse_json(response).await
    }

    fn url_for(&self, path: &str) -> String {
        let mut url = self.api_root.clone();
        url.push_str(path.trim_start_matches('/'));
        url
    }
}

pub(crate) fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|err| ApiError::InvalidConfig(err.to_string()))
}

pub(crate) fn header_name(name: &'static str) -> HeaderName {
    HeaderName::from_static(name)
}

async fn parse_json<T>(response: Response) -> Result<T>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if status.is_success() {
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(ApiError::from)
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Authentication(format!(
            "Access denied ({}) - {}",
            status,
            error_message(&body)
        )))
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::http(status, error_message(&body)))
    }
}

/// Pulls the human readable part out of a JSON error body when there is one.
fn error_message(body: &str) -> String {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let message = parsed.as_ref().and_then(|value| {
        ["message", "error_description", "error"]
            .iter()
            .find_map(|field| value.get(*field).and_then(Value::as_str))
            .map(str::to_string)
            .or_else(|| {
                value
                    .get("errorMessages")
                    .and_then(Value::as_array)
                    .and_then(|items| items.first())
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
    });
    message.unwrap_or_else(|| body.trim().to_string())
}
