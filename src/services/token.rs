//! Service tokens
//!
//! HS256 tokens for the system account, scoped to a workspace when calling
//! the account service and unscoped for live broadcasts.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::model::SYSTEM_ACCOUNT;
use crate::types::{RatingError, Result};

/// Service name carried in every token
pub const SERVICE_NAME: &str = "rating";

/// Extra claims identifying the calling service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceExtra {
    pub service: String,
}

/// Payload of a service token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceClaims {
    pub account: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    pub extra: ServiceExtra,
    /// Issued at (Unix timestamp)
    pub iat: u64,
}

/// Signs service tokens with the shared server secret
#[derive(Clone)]
pub struct TokenIssuer {
    secret: String,
}

impl TokenIssuer {
    pub fn new(secret: impl Into<String>) -> Result<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(RatingError::Config("SERVER_SECRET is required".into()));
        }
        Ok(Self { secret })
    }

    /// Token for the system account, optionally scoped to a workspace
    pub fn system_token(&self, workspace: Option<&str>) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| RatingError::Auth(format!("System time error: {}", e)))?
            .as_secs();

        let claims = ServiceClaims {
            account: SYSTEM_ACCOUNT.to_string(),
            workspace: workspace.map(str::to_string),
            extra: ServiceExtra {
                service: SERVICE_NAME.to_string(),
            },
            iat: now,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| RatingError::Auth(format!("Failed to generate token: {}", e)))
    }

    /// Decode a token signed with the same secret
    pub fn verify(&self, token: &str) -> Result<ServiceClaims> {
        // Service tokens carry no expiry
        let mut validation = Validation::default();
        validation.validate_exp = false;
        validation.required_spec_claims = HashSet::new();

        decode::<ServiceClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|e| RatingError::Auth(format!("Invalid token: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_secret_rejected() {
        assert!(matches!(TokenIssuer::new(""), Err(RatingError::Config(_))));
    }

    #[test]
    fn test_workspace_token() {
        let issuer = TokenIssuer::new("secret").unwrap();
        let token = issuer.system_token(Some("ws-1")).unwrap();
        let claims = issuer.verify(&token).unwrap();

        assert_eq!(claims.account, SYSTEM_ACCOUNT);
        assert_eq!(claims.workspace.as_deref(), Some("ws-1"));
        assert_eq!(claims.extra.service, "rating");
    }

    #[test]
    fn test_wrong_secret() {
        let token = TokenIssuer::new("a").unwrap().system_token(None).unwrap();
        assert!(TokenIssuer::new("b").unwrap().verify(&token).is_err());
    }
}
