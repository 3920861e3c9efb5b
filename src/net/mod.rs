//! Network access for the mediator.

#[cfg(test)]
pub(crate) mod fake;

use color_eyre::{eyre::eyre, Result};
use std::future::Future;

use crate::cache::{Request, Response};
use crate::config::NetworkConfig;

/// A request that could not complete.
///
/// Any HTTP status counts as completion; these variants only cover the
/// cases where no response arrived at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
  #[error("connection failed: {0}")]
  Connect(String),

  #[error("request timed out: {0}")]
  Timeout(String),

  #[error("request failed: {0}")]
  Request(String),

  #[error("failed to read response body: {0}")]
  Body(String),
}

impl From<reqwest::Error> for NetworkError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      Self::Timeout(e.to_string())
    } else if e.is_connect() {
      Self::Connect(e.to_string())
    } else if e.is_body() || e.is_decode() {
      Self::Body(e.to_string())
    } else {
      Self::Request(e.to_string())
    }
  }
}

/// Something that can perform a single request.
///
/// Implementations make exactly one attempt; retries are left to callers.
pub trait Network: Send + Sync + 'static {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response, NetworkError>> + Send;
}

/// HTTP network backed by reqwest.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(config: &NetworkConfig) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(&config.user_agent)
      .timeout(config.timeout())
      .gzip(true)
      .deflate(true)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Network for HttpNetwork {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response, NetworkError>> + Send {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone())
      .headers(request.headers.clone());
    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }

    async move {
      let response = builder.send().await?;
      let status = response.status();
      let headers = response.headers().clone();
      let body = response.bytes().await.map_err(|e| NetworkError::Body(e.to_string()))?;

      Ok(Response {
        status,
        headers,
        body,
      })
    }
  }
}
