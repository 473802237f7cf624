//! Remote loyalty-points service.
//!
//! The engine only needs two things from the remote side: read a viewer's
//! points and add a signed delta. [`LoyaltyClient`] is that seam;
//! [`HttpLoyaltyClient`] talks to a channel-scoped REST API.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum LoyaltyError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("{status}: {message}")]
    Server { status: StatusCode, message: String },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait LoyaltyClient: fmt::Debug + Send + Sync {
    /// Current points of `handle`.
    async fn balance(&self, handle: &str) -> Result<i64, LoyaltyError>;

    /// Adds `delta` (may be negative) to the points of `handle`.
    async fn add_points(&self, handle: &str, delta: i64) -> Result<(), LoyaltyError>;
}

#[derive(Clone, Debug)]
pub struct HttpLoyaltyClient {
    client: Client,
    base_url: String,
    channel: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct PointsBody {
    points: i64,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

impl HttpLoyaltyClient {
    pub fn new(
        base_url: impl Into<String>,
        channel: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, LoyaltyError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            channel: channel.into(),
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn error_from(resp: reqwest::Response) -> LoyaltyError {
        let status = resp.status();
        let message = match resp.json::<ErrorBody>().await {
            Ok(err) => err.message,
            Err(_) => "loyalty service error".to_string(),
        };
        classify(status, message)
    }
}

/// A 4xx is a refusal of this request; anything else is the server's fault.
fn classify(status: StatusCode, message: String) -> LoyaltyError {
    if status.is_client_error() {
        LoyaltyError::Rejected(format!("{status}: {message}"))
    } else {
        LoyaltyError::Server { status, message }
    }
}

#[async_trait]
impl LoyaltyClient for HttpLoyaltyClient {
    async fn balance(&self, handle: &str) -> Result<i64, LoyaltyError> {
        let resp = self
            .client
            .get(self.url(&format!("points/{}/{handle}", self.channel)))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::error_from(resp).await);
        }
        Ok(resp.json::<PointsBody>().await?.points)
    }

    async fn add_points(&self, handle: &str, delta: i64) -> Result<(), LoyaltyError> {
        let resp = self
            .client
            .put(self.url(&format!("points/{}/{handle}/{delta}", self.channel)))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::error_from(resp).await);
        }
        Ok(())
    }
}
