use chrono::Utc;
use costlink_config::Vendor;
use jsonwebtoken::{encode, EncodingKey, Header};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::{CallTimeout, Gateway};

/// Claims of the short-lived token presented to the context endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct VendorClaims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("vendor credentials are not configured")]
    Unconfigured,
    #[error("invalid context url: {0}")]
    InvalidUrl(String),
    #[error("token signing failed: {0}")]
    Signing(String),
    #[error("context endpoint rejected the session: {0}")]
    Rejected(String),
    #[error("context response carries no accountId")]
    MissingAccount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedContext {
    pub account_id: String,
    pub account_name: Option<String>,
}

pub struct ContextVerifier {
    vendor: Vendor,
}

impl ContextVerifier {
    pub fn new(vendor: Vendor) -> Self {
        Self { vendor }
    }

    pub fn vendor_token(&self) -> Result<String, ContextError> {
        let now = Utc::now().timestamp();
        let claims = VendorClaims {
            sub: self.vendor.app_uid.clone(),
            iat: now,
            exp: now + self.vendor.token_ttl_secs,
            jti: uuid::Uuid::new_v4().to_string(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.vendor.secret_key.as_bytes()),
        )
        .map_err(|e| ContextError::Signing(e.to_string()))
    }

    fn context_url(&self, session_key: &str) -> Result<Url, ContextError> {
        let mut url = Url::parse(&self.vendor.context_url)
            .map_err(|e| ContextError::InvalidUrl(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| ContextError::InvalidUrl(self.vendor.context_url.clone()))?
            .pop_if_empty()
            .push(session_key);
        Ok(url)
    }

    pub async fn verify(
        &self,
        gateway: &Gateway,
        session_key: &str,
    ) -> Result<VerifiedContext, ContextError> {
        if self.vendor.secret_key.trim().is_empty() || self.vendor.app_uid.trim().is_empty() {
            return Err(ContextError::Unconfigured);
        }
        let url = self.context_url(session_key)?;
        let token = self.vendor_token()?;

        let response = gateway
            .call(Method::POST, url.as_str(), &token, None, CallTimeout::Lookup)
            .await;
        if !response.is_success() {
            return Err(ContextError::Rejected(response.error_message()));
        }

        let body = response.json().ok_or(ContextError::MissingAccount)?;
        let account_id = body
            .get("accountId")
            .and_then(|v| v.as_str())
            .filter(|v| !v.trim().is_empty())
            .ok_or(ContextError::MissingAccount)?;
        Ok(VerifiedContext {
            account_id: account_id.to_string(),
            account_name: body
                .get("accountName")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, DecodingKey, Validation};

    fn vendor() -> Vendor {
        Vendor {
            app_id: "app-1".to_string(),
            app_uid: "costlink.vendor".to_string(),
            secret_key: "s3cret".to_string(),
            context_url: "https://vendor.example/api/vendor/1.0/context/".to_string(),
            token_ttl_secs: 300,
        }
    }

    #[test]
    fn vendor_token_is_short_lived_and_unique() {
        let verifier = ContextVerifier::new(vendor());
        let t1 = verifier.vendor_token().unwrap();
        let t2 = verifier.vendor_token().unwrap();

        let key = DecodingKey::from_secret(b"s3cret");
        let c1 = decode::<VendorClaims>(&t1, &key, &Validation::default())
            .unwrap()
            .claims;
        let c2 = decode::<VendorClaims>(&t2, &key, &Validation::default())
            .unwrap()
            .claims;
        assert_eq!(c1.sub, "costlink.vendor");
        assert_eq!(c1.exp - c1.iat, 300);
        assert_ne!(c1.jti, c2.jti);
    }

    #[test]
    fn session_key_is_an_escaped_path_segment() {
        let verifier = ContextVerifier::new(vendor());
        let url = verifier.context_url("a/b c").unwrap();
        assert_eq!(url.path(), "/api/vendor/1.0/context/a%2Fb%20c");
    }

    #[tokio::test]
    async fn missing_secret_short_circuits() {
        let mut v = vendor();
        v.secret_key = String::new();
        let verifier = ContextVerifier::new(v);
        let gateway = Gateway::new(&costlink_config::Erp {
            base_url: "http://127.0.0.1:9".to_string(),
            data_timeout_ms: 100,
            lookup_timeout_ms: 100,
        })
        .unwrap();
        let err = verifier.verify(&gateway, "ctx").await.unwrap_err();
        assert!(matches!(err, ContextError::Unconfigured));
    }
}
