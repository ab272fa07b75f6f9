//! Signed access tokens
//!
//! RS256 JWTs issued for a backend credential. The backend validates them
//! with the public key uploaded as the credential.

use super::admin_key::AdminKey;
use crate::config::TokenPolicy;
use crate::domain::ports::RemoteCredential;
use crate::error::Result;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Claims carried by an access token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub iss: String,
    /// Backend project the token grants access to
    pub sub: String,
    /// Identity of the caller the token was issued for
    pub aud: String,
    /// Granted roles, `<project>:admin`
    pub roles: Vec<String>,
    pub iat: i64,
    pub exp: i64,
}

impl TokenClaims {
    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.iat, 0).single()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.exp, 0).single()
    }

    /// Point in time after which the token should be replaced
    pub fn renewal_threshold(&self, renewal_window: chrono::Duration) -> Option<DateTime<Utc>> {
        self.expires_at().map(|exp| exp - renewal_window)
    }

    /// True when these are the claims [`issue`] would produce for
    /// `credential` under `policy`, ignoring the validity period
    pub fn grants(&self, credential: &RemoteCredential, policy: &TokenPolicy) -> bool {
        self.sub == credential.project_name
            && self.iss == policy.issuer
            && self.aud == policy.audience
            && self.roles == [admin_role(&credential.project_name)]
    }
}

fn admin_role(project: &str) -> String {
    format!("{}:admin", project)
}

/// A signed token together with its claims
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub claims: TokenClaims,
}

/// Sign a new token for `credential`, valid from `now` for the policy lifetime
pub fn issue(
    key: &AdminKey,
    credential: &RemoteCredential,
    policy: &TokenPolicy,
    now: DateTime<Utc>,
) -> Result<AccessToken> {
    let claims = TokenClaims {
        iss: policy.issuer.clone(),
        sub: credential.project_name.clone(),
        aud: policy.audience.clone(),
        roles: vec![admin_role(&credential.project_name)],
        iat: now.timestamp(),
        exp: (now + policy.lifetime).timestamp(),
    };

    let header = Header {
        kid: Some(credential.id.clone()),
        ..Header::new(Algorithm::RS256)
    };
    let token = encode(&header, &claims, key.encoding_key())?;

    Ok(AccessToken { token, claims })
}

/// Credential id in the token header, without verifying the signature
pub fn key_id(token: &str) -> Option<String> {
    jsonwebtoken::decode_header(token).ok()?.kid
}

/// Parse a persisted token. Returns `None` when the token is malformed or was
/// not signed by `key`. Expiry is not checked here.
pub fn parse(key: &AdminKey, token: &str) -> Option<TokenClaims> {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::from(["exp".to_string(), "sub".to_string()]);

    decode::<TokenClaims>(token, key.decoding_key(), &validation)
        .ok()
        .map(|data| data.claims)
}
