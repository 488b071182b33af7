use async_trait::async_trait;
use log::{info, warn};
use reqwest::{Client, StatusCode, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Middleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use crate::config::PiSettings;

/// Errors from the external Pi payment processor, split by retryability.
/// `Unavailable` is transient (network, timeout, 5xx) and safe to retry;
/// `Rejected` is a terminal refusal and the payment should be cancelled.
#[derive(thiserror::Error, Debug)]
pub enum ProcessorError {
    #[error("payment processor unavailable: {0}")]
    Unavailable(String),
    #[error("payment processor rejected request: {0}")]
    Rejected(String),
}

/// Payment state as reported by the processor.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProcessorPaymentStatus {
    #[serde(default)]
    pub developer_approved: bool,
    #[serde(default)]
    pub transaction_verified: bool,
    #[serde(default)]
    pub developer_completed: bool,
    #[serde(default)]
    pub cancelled: bool,
}

/// On-chain transaction details, present once the payer has submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorTransaction {
    pub txid: String,
    #[serde(default)]
    pub verified: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorPayment {
    pub identifier: String,
    pub amount: f64,
    #[serde(default)]
    pub status: ProcessorPaymentStatus,
    #[serde(default)]
    pub transaction: Option<ProcessorTransaction>,
}

/// The two-phase (approve/complete) payment protocol this service consumes.
/// Both directions are expected to be idempotent: the processor retries our
/// callbacks and we retry these calls.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn lookup(&self, payment_id: &str) -> Result<ProcessorPayment, ProcessorError>;
    async fn approve(&self, payment_id: &str) -> Result<(), ProcessorError>;
    async fn complete(&self, payment_id: &str, txid: &str) -> Result<(), ProcessorError>;
    async fn cancel(&self, payment_id: &str) -> Result<(), ProcessorError>;
}

pub struct PiClient {
    client: ClientWithMiddleware,
    base_url: Url,
    api_key: String,
}

impl PiClient {
    pub fn new(client: ClientWithMiddleware, settings: &PiSettings) -> Result<Self, anyhow::Error> {
        let base_url = Url::parse(&settings.base_url)?;
        Ok(Self {
            client,
            base_url,
            api_key: settings.api_key.clone(),
        })
    }

    fn payment_url(&self, payment_id: &str, action: Option<&str>) -> Result<Url, ProcessorError> {
        let mut path = format!("v2/payments/{}", payment_id);
        if let Some(action) = action {
            path = format!("{}/{}", path, action);
        }
        self.base_url
            .join(&path)
            .map_err(|e| ProcessorError::Rejected(format!("invalid payment url: {}", e)))
    }

    async fn post(
        &self,
        url: Url,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, ProcessorError> {
        let response = self
            .client
            .post(url.clone())
            .header("Authorization", format!("Key {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProcessorError::Unavailable(e.to_string()))?;

        classify_status(url, response)
    }
}

fn classify_status(
    url: Url,
    response: reqwest::Response,
) -> Result<reqwest::Response, ProcessorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        warn!("processor call {} failed with {}", url, status);
        return Err(ProcessorError::Unavailable(format!(
            "{} returned {}",
            url, status
        )));
    }
    Err(ProcessorError::Rejected(format!(
        "{} returned {}",
        url, status
    )))
}

#[async_trait]
impl PaymentProcessor for PiClient {
    async fn lookup(&self, payment_id: &str) -> Result<ProcessorPayment, ProcessorError> {
        let url = self.payment_url(payment_id, None)?;
        let response = self
            .client
            .get(url.clone())
            .header("Authorization", format!("Key {}", self.api_key))
            .send()
            .await
            .map_err(|e| ProcessorError::Unavailable(e.to_string()))?;

        classify_status(url, response)?
            .json::<ProcessorPayment>()
            .await
            .map_err(|e| ProcessorError::Rejected(format!("invalid payment payload: {}", e)))
    }

    async fn approve(&self, payment_id: &str) -> Result<(), ProcessorError> {
        let url = self.payment_url(payment_id, Some("approve"))?;
        self.post(url, json!({})).await?;
        info!("approved payment {} upstream", payment_id);
        Ok(())
    }

    async fn complete(&self, payment_id: &str, txid: &str) -> Result<(), ProcessorError> {
        let url = self.payment_url(payment_id, Some("complete"))?;
        self.post(url, json!({ "txid": txid })).await?;
        info!("completed payment {} upstream (txid {})", payment_id, txid);
        Ok(())
    }

    async fn cancel(&self, payment_id: &str) -> Result<(), ProcessorError> {
        let url = self.payment_url(payment_id, Some("cancel"))?;
        self.post(url, json!({})).await?;
        info!("cancelled payment {} upstream", payment_id);
        Ok(())
    }
}

/// Shared outbound HTTP client: bounded per-request timeout plus transient
/// retries with exponential backoff.
pub fn build_processor_client(request_timeout: Duration) -> ClientWithMiddleware {
    let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
    let client = Client::builder()
        .timeout(request_timeout)
        .build()
        .unwrap_or_else(|_| Client::new());

    ClientBuilder::new(client)
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .with(LoggingMiddleware)
        .build()
}

struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(
        &self,
        req: reqwest::Request,
        extensions: &mut hyper::http::Extensions,
        next: reqwest_middleware::Next<'_>,
    ) -> reqwest_middleware::Result<reqwest::Response> {
        let method = req.method().clone();
        let url = req.url().clone();

        let result = next.run(req, extensions).await;

        match &result {
            Ok(response) => {
                info!("{} {} -> Status: {}", method, url, response.status());
            }
            Err(error) => {
                warn!("{} {} -> Error: {:?}", method, url, error);
            }
        }

        result
    }
}
