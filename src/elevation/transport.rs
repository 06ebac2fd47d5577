//! HTTP transport behind a trait so the acquisition state machine can be
//! driven by scripted responses in tests.

use std::future::Future;

use log::debug;

use crate::config::HttpConfig;
use crate::error::AcquisitionError;

use super::request::sanitize_url;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// Content-Type header as received, empty if absent
    pub content_type: String,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// First 500 characters of the body as lossy UTF-8.
    pub fn body_preview(&self) -> String {
        String::from_utf8_lossy(&self.body).chars().take(500).collect()
    }
}

/// Performs a GET. Non-success statuses are returned as responses; only
/// failures to get any response at all are errors.
pub trait Transport: Send + Sync {
    fn get(&self, request: &HttpRequest) -> impl Future<Output = Result<HttpResponse, AcquisitionError>> + Send;
}

/// `reqwest`-backed transport.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpConfig) -> Result<Self, AcquisitionError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| AcquisitionError::Transport {
                status: None,
                message: format!("failed to create HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

impl Transport for ReqwestTransport {
    async fn get(&self, request: &HttpRequest) -> Result<HttpResponse, AcquisitionError> {
        debug!("GET {}", sanitize_url(&request.url));

        let mut builder = self.client.get(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|e| AcquisitionError::Transport {
            status: None,
            message: sanitize_url(&e.without_url().to_string()),
        })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response
            .bytes()
            .await
            .map_err(|e| AcquisitionError::Transport {
                status: Some(status),
                message: format!("failed to read body: {}", e.without_url()),
            })?
            .to_vec();

        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }
}
