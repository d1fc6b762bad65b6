use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::config::PolicyConfig;
use crate::error::FilterError;
use crate::message::MessageDocument;

/// Outcome of the forward check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardDirective {
    Reject,
    Forward { forward_to: String, from: String },
}

/// The two policy lookups. A failed attempt is returned as is, there are no
/// retries here.
#[async_trait]
pub trait PolicyClient: Send + Sync {
    async fn check_exists(&self, email: &str) -> Result<bool, FilterError>;

    async fn check_forward(
        &self,
        email: &str,
        message: &MessageDocument,
    ) -> Result<ForwardDirective, FilterError>;
}

#[derive(Debug, Serialize)]
struct ExistsQuery<'a> {
    email: &'a str,
}

#[derive(Debug, Deserialize)]
struct ExistsResult {
    exists: bool,
}

#[derive(Debug, Serialize)]
struct ForwardQuery<'a> {
    email: &'a str,
    eml: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForwardResult {
    forward: bool,
    #[serde(default)]
    forward_to: Option<String>,
    #[serde(default)]
    from: Option<String>,
}

impl TryFrom<ForwardResult> for ForwardDirective {
    type Error = FilterError;

    fn try_from(result: ForwardResult) -> Result<Self, Self::Error> {
        if !result.forward {
            return Ok(ForwardDirective::Reject);
        }

        let forward_to = result
            .forward_to
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| FilterError::DataContract("forward=true without forwardTo".to_string()))?;
        let from = result
            .from
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| FilterError::DataContract("forward=true without from".to_string()))?;

        Ok(ForwardDirective::Forward { forward_to, from })
    }
}

/// JSON-over-HTTP policy client. Endpoints are read from the live config on
/// every call, so a reload applies to the next lookup.
#[derive(Clone)]
pub struct HttpPolicyClient {
    config: watch::Receiver<PolicyConfig>,
    client: Client,
}

impl HttpPolicyClient {
    pub fn new(config: watch::Receiver<PolicyConfig>) -> Result<Self, FilterError> {
        let client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FilterError::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    async fn post<Q, R>(&self, url: Url, query: &Q) -> Result<R, FilterError>
    where
        Q: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let timeout = self.config.borrow().request_timeout;
        debug!(url = %url, "Sending policy query");

        let response = self
            .client
            .post(url.clone())
            .timeout(timeout)
            .json(query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FilterError::Network(format!(
                "{} answered with HTTP {}",
                url, status
            )));
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|e| FilterError::Protocol(format!("{} returned unexpected body: {}", url, e)))
    }
}

#[async_trait]
impl PolicyClient for HttpPolicyClient {
    async fn check_exists(&self, email: &str) -> Result<bool, FilterError> {
        let url = self.config.borrow().check_email_url.clone();
        let result: ExistsResult = self.post(url, &ExistsQuery { email }).await?;
        Ok(result.exists)
    }

    async fn check_forward(
        &self,
        email: &str,
        message: &MessageDocument,
    ) -> Result<ForwardDirective, FilterError> {
        let url = self.config.borrow().forward_params_url.clone();
        let eml = message.eml();
        let result: ForwardResult = self
            .post(url, &ForwardQuery { email, eml: &eml })
            .await?;
        ForwardDirective::try_from(result)
    }
}
