//! Live rating notifications
//!
//! Fire-and-forget push of rating changes to the workspace's transactor.
//! Durable state is the stored aggregate, so failures here are only logged.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use super::token::TokenIssuer;
use crate::model::RatingChanged;
use crate::types::Result;

/// Best-effort sink for rating changes
pub trait LiveNotifier: Send + Sync {
    /// Must not block and must not fail the caller
    fn broadcast(&self, changes: Vec<RatingChanged>);
}

/// Builds the notifier of a workspace's calculator
pub trait NotifierFactory: Send + Sync {
    fn create(&self, workspace: &str) -> Result<Arc<dyn LiveNotifier>>;
}

/// Notifier that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl LiveNotifier for NoopNotifier {
    fn broadcast(&self, changes: Vec<RatingChanged>) {
        debug!(count = changes.len(), "Live broadcast disabled, dropping changes");
    }
}

impl NotifierFactory for NoopNotifier {
    fn create(&self, _workspace: &str) -> Result<Arc<dyn LiveNotifier>> {
        Ok(Arc::new(NoopNotifier))
    }
}

/// Rewrite a websocket transactor URL to its HTTP API base
pub fn transactor_http_endpoint(url: &str) -> String {
    let url = url.trim_end_matches('/');
    if let Some(rest) = url.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if let Some(rest) = url.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else {
        url.to_string()
    }
}

/// Pushes changes to `PUT {endpoint}/api/v1/broadcast?workspace=<id>`
pub struct TransactorBroadcaster {
    http: reqwest::Client,
    endpoint: String,
    workspace: String,
    token: String,
}

impl TransactorBroadcaster {
    pub fn new(http: reqwest::Client, endpoint: &str, workspace: &str, token: String) -> Self {
        Self {
            http,
            endpoint: transactor_http_endpoint(endpoint),
            workspace: workspace.to_string(),
            token,
        }
    }

    pub fn broadcast_url(&self) -> String {
        format!("{}/api/v1/broadcast", self.endpoint)
    }
}

impl LiveNotifier for TransactorBroadcaster {
    fn broadcast(&self, changes: Vec<RatingChanged>) {
        if changes.is_empty() {
            return;
        }

        let request = self
            .http
            .put(self.broadcast_url())
            .query(&[("workspace", self.workspace.as_str())])
            .bearer_auth(&self.token)
            .json(&changes);
        let workspace = self.workspace.clone();
        let count = changes.len();

        tokio::spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(workspace = %workspace, count, "Broadcast rating changes");
                }
                Ok(response) => {
                    error!(workspace = %workspace, status = %response.status(), "Failed to send broadcast");
                }
                Err(e) => {
                    error!(workspace = %workspace, "Failed to send broadcast: {}", e);
                }
            }
        });
    }
}

/// Creates transactor broadcasters, or no-op notifiers when no endpoint is set
pub struct TransactorNotifierFactory {
    http: reqwest::Client,
    endpoint: Option<String>,
    tokens: TokenIssuer,
}

impl TransactorNotifierFactory {
    pub fn new(endpoint: Option<String>, tokens: TokenIssuer) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            http,
            endpoint: endpoint.filter(|e| !e.trim().is_empty()),
            tokens,
        }
    }
}

impl NotifierFactory for TransactorNotifierFactory {
    fn create(&self, workspace: &str) -> Result<Arc<dyn LiveNotifier>> {
        match &self.endpoint {
            Some(endpoint) => {
                let token = self.tokens.system_token(None)?;
                Ok(Arc::new(TransactorBroadcaster::new(
                    self.http.clone(),
                    endpoint,
                    workspace,
                    token,
                )))
            }
            None => Ok(Arc::new(NoopNotifier)),
        }
    }
}
