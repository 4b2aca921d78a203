//! Account service client
//!
//! JSON-RPC over HTTP: every call is a `POST {method, params}` with a bearer
//! token, answered by `{result}` or `{error}`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::token::TokenIssuer;
use crate::model::{AccountId, IdentityId, ModelVersion};
use crate::types::{RatingError, Result};

/// Maps author identities to accounts
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Account of one identity; `None` when the identity is unknown
    async fn resolve_single(&self, identity: &str) -> Result<Option<AccountId>>;

    /// Accounts of the identities the service knows about
    async fn resolve_batch(&self, identities: &[IdentityId]) -> Result<HashMap<IdentityId, AccountId>>;
}

/// Workspace metadata used by the version gate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInfo {
    pub uuid: String,
    pub version_major: u32,
    pub version_minor: u32,
    pub version_patch: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl WorkspaceInfo {
    pub fn version(&self) -> ModelVersion {
        ModelVersion::new(self.version_major, self.version_minor, self.version_patch)
    }
}

/// Looks up workspace metadata
#[async_trait]
pub trait WorkspaceDirectory: Send + Sync {
    /// `None` when the workspace does not exist
    async fn workspace_info(&self, workspace: &str) -> Result<Option<WorkspaceInfo>>;
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SocialIdRecord {
    #[serde(rename = "_id")]
    id: IdentityId,
    #[serde(default)]
    person_uuid: Option<AccountId>,
}

/// HTTP client for the account service
#[derive(Clone)]
pub struct AccountClient {
    http: reqwest::Client,
    url: String,
    tokens: TokenIssuer,
}

impl AccountClient {
    pub fn new(url: impl Into<String>, tokens: TokenIssuer, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("rating-service/0.1")
            .build()
            .unwrap_or_default();

        Self {
            http,
            url: url.into(),
            tokens,
        }
    }

    async fn call<T: DeserializeOwned>(&self, token: &str, method: &str, params: Value) -> Result<Option<T>> {
        debug!(method, "Account service call");

        let response = self
            .http
            .post(&self.url)
            .bearer_auth(token)
            .json(&RpcRequest { method, params })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RatingError::Http(format!(
                "{} returned {}",
                method,
                response.status()
            )));
        }

        let body: RpcResponse<T> = response.json().await?;
        parse_response(method, body)
    }
}

fn parse_response<T>(method: &str, body: RpcResponse<T>) -> Result<Option<T>> {
    match body.error {
        Some(error) => Err(RatingError::Http(format!("{} failed: {}", method, error))),
        None => Ok(body.result),
    }
}

#[async_trait]
impl IdentityService for AccountClient {
    async fn resolve_single(&self, identity: &str) -> Result<Option<AccountId>> {
        let token = self.tokens.system_token(None)?;
        self.call(&token, "findPersonBySocialId", json!([identity])).await
    }

    async fn resolve_batch(&self, identities: &[IdentityId]) -> Result<HashMap<IdentityId, AccountId>> {
        let token = self.tokens.system_token(None)?;
        let records: Option<Vec<SocialIdRecord>> = self
            .call(&token, "findFullSocialIds", json!([identities]))
            .await?;

        Ok(records
            .unwrap_or_default()
            .into_iter()
            .filter_map(|r| r.person_uuid.map(|account| (r.id, account)))
            .collect())
    }
}

#[async_trait]
impl WorkspaceDirectory for AccountClient {
    async fn workspace_info(&self, workspace: &str) -> Result<Option<WorkspaceInfo>> {
        let token = self.tokens.system_token(Some(workspace))?;
        self.call(&token, "getWorkspaceInfo", json!([false])).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let request = RpcRequest {
            method: "findFullSocialIds",
            params: json!([["email:a", "email:b"]]),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["method"], "findFullSocialIds");
        assert_eq!(value["params"][0][1], "email:b");
    }

    #[test]
    fn test_parse_response() {
        let ok: RpcResponse<String> = serde_json::from_str(r#"{"result":"acc-1"}"#).unwrap();
        assert_eq!(parse_response("m", ok).unwrap(), Some("acc-1".to_string()));

        let empty: RpcResponse<String> = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(parse_response("m", empty).unwrap(), None);

        let failed: RpcResponse<String> =
            serde_json::from_str(r#"{"error":{"code":"NotFound"}}"#).unwrap();
        assert!(matches!(parse_response("m", failed), Err(RatingError::Http(_))));
    }

    #[test]
    fn test_workspace_info() {
        let info: WorkspaceInfo = serde_json::from_str(
            r#"{"uuid":"ws-1","versionMajor":0,"versionMinor":7,"versionPatch":0,"url":"acme"}"#,
        )
        .unwrap();
        assert_eq!(info.version(), ModelVersion::new(0, 7, 0));
        assert_eq!(info.data_id, None);
    }

    #[test]
    fn test_social_id_records() {
        let records: Vec<SocialIdRecord> = serde_json::from_str(
            r#"[{"_id":"email:a","personUuid":"acc-1"},{"_id":"email:b"}]"#,
        )
        .unwrap();
        assert_eq!(records[0].person_uuid.as_deref(), Some("acc-1"));
        assert!(records[1].person_uuid.is_none());
        assert_eq!(records[1].id, "email:b");
    }
}
