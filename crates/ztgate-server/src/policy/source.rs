//! Where rule tables come from.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;
use ztgate_core::{FetchError, RuleTable};

/// The rule-distribution collaborator: one call returns the full table.
pub trait RuleSource: Send + Sync {
    fn fetch(&self) -> Pin<Box<dyn Future<Output = Result<RuleTable, FetchError>> + Send + '_>>;
}

/// Fetches the rule document over HTTP with a bearer service token.
pub struct HttpRuleSource {
    url: String,
    token: Option<String>,
    http_client: reqwest::Client,
}

impl HttpRuleSource {
    pub fn new(url: String, token: Option<String>, timeout: Duration) -> Self {
        Self {
            url,
            token,
            http_client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    async fn get(&self) -> Result<RuleTable, FetchError> {
        let mut req = self.http_client.get(&self.url);
        if let Some(ref token) = self.token {
            req = req.bearer_auth(token);
        }

        let response = req
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let table: RuleTable =
            serde_json::from_slice(&body).map_err(|e| FetchError::Decode(e.to_string()))?;
        debug!(url = %self.url, identities = table.rules.len(), "fetched rule table");
        Ok(table)
    }
}

impl RuleSource for HttpRuleSource {
    fn fetch(&self) -> Pin<Box<dyn Future<Output = Result<RuleTable, FetchError>> + Send + '_>> {
        Box::pin(self.get())
    }
}
