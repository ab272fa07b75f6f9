//! Access token lifecycle
//!
//! The signed token lives in a secret next to the CSI workloads. A missing
//! token is issued and an unreadable one is deleted and reissued once the
//! deletion is visible. A valid token is kept only while it still matches
//! the current credential and stays outside the renewal window.

use crate::auth::{token, AdminKey, TokenClaims};
use crate::config::{OperatorConfig, TokenPolicy};
use crate::domain::ports::{DeleteOutcome, ObjectRef, RemoteCredential, ResourceClientRef};
use crate::error::{Error, Result};
use crate::manifests::MANAGED_BY_LABEL;
use crate::reconciler::sync::apply_owned;
use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Key of the token inside the secret
pub const TOKEN_KEY: &str = "jwt";

/// Secret type understood by the CSI plugin
pub const TOKEN_SECRET_TYPE: &str = "kubernetes.io/lb-csi";

/// Why a new token was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationReason {
    /// No secret existed
    Missing,
    /// The stored token was absent or did not verify
    Corrupt,
    /// The stored token entered its renewal window
    Expiring,
    /// The stored token was issued for another credential or caller
    Mismatch,
}

impl RotationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationReason::Missing => "missing",
            RotationReason::Corrupt => "corrupt",
            RotationReason::Expiring => "expiring",
            RotationReason::Mismatch => "mismatch",
        }
    }
}

impl fmt::Display for RotationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`TokenManager::ensure_token`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenOutcome {
    /// The stored token is still good
    Kept { expires_at: DateTime<Utc> },
    /// A new token was written
    Issued {
        reason: RotationReason,
        expires_at: DateTime<Utc>,
    },
}

/// Keeps the token secret valid
pub struct TokenManager {
    client: ResourceClientRef,
    key: Arc<AdminKey>,
    policy: TokenPolicy,
    namespace: String,
    secret_name: String,
    poll_interval: Duration,
    deletion_timeout: Duration,
}

impl TokenManager {
    pub fn new(client: ResourceClientRef, key: Arc<AdminKey>, config: &OperatorConfig) -> Self {
        Self {
            client,
            key,
            policy: config.token.clone(),
            namespace: config.workload_namespace.clone(),
            secret_name: config.token_secret_name.clone(),
            poll_interval: config.deletion_poll_interval,
            deletion_timeout: config.deletion_timeout,
        }
    }

    /// Name of the token secret
    pub fn secret_name(&self) -> &str {
        &self.secret_name
    }

    pub fn admin_key(&self) -> &AdminKey {
        &self.key
    }

    fn target(&self) -> ObjectRef {
        ObjectRef::of::<Secret>(Some(&self.namespace), &self.secret_name)
    }

    /// Make sure the secret holds a verifiable token for `credential` outside
    /// its renewal window
    pub async fn ensure_token(
        &self,
        credential: &RemoteCredential,
        now: DateTime<Utc>,
    ) -> Result<TokenOutcome> {
        let target = self.target();

        let reason = match self.client.get(&target).await? {
            None => RotationReason::Missing,
            Some(raw) => match self.stored_token(raw) {
                None => {
                    warn!(secret = %target, "stored token is missing or unreadable, recreating secret");
                    self.delete_and_wait(&target).await?;
                    RotationReason::Corrupt
                }
                Some((text, claims)) if !self.issued_for(&text, &claims, credential) => {
                    info!(
                        subject = %claims.sub,
                        project = %credential.project_name,
                        credential = %credential.id,
                        "stored token was issued for another credential, refreshing"
                    );
                    RotationReason::Mismatch
                }
                Some((_, claims)) => {
                    let threshold = claims.renewal_threshold(self.policy.renewal_window);
                    match (threshold, claims.expires_at()) {
                        (Some(renew_at), Some(expires_at)) if now <= renew_at => {
                            debug!(
                                expires_at = %expires_at,
                                renew_at = %renew_at,
                                "token is not expiring soon"
                            );
                            return Ok(TokenOutcome::Kept { expires_at });
                        }
                        (_, expires_at) => {
                            info!(expires_at = ?expires_at, "token is expiring soon, refreshing");
                            RotationReason::Expiring
                        }
                    }
                }
            },
        };

        let issued = token::issue(&self.key, credential, &self.policy, now)?;
        let expires_at = issued.claims.expires_at().unwrap_or(now + self.policy.lifetime);
        self.write(issued.token).await?;

        info!(secret = %target, %reason, expires_at = %expires_at, "access token issued");
        Ok(TokenOutcome::Issued { reason, expires_at })
    }

    /// Stored token and its claims if it verifies against the admin key
    fn stored_token(&self, raw: serde_json::Value) -> Option<(String, TokenClaims)> {
        let secret: Secret = serde_json::from_value(raw).ok()?;
        let bytes = secret.data?.remove(TOKEN_KEY)?;
        let text = String::from_utf8(bytes.0).ok()?;
        let claims = token::parse(&self.key, &text)?;
        Some((text, claims))
    }

    /// Whether a verified token is the one `credential` would be issued now
    fn issued_for(&self, text: &str, claims: &TokenClaims, credential: &RemoteCredential) -> bool {
        claims.grants(credential, &self.policy)
            && token::key_id(text).as_deref() == Some(credential.id.as_str())
    }

    async fn write(&self, token: String) -> Result<()> {
        let secret = Secret {
            metadata: ObjectMeta {
                labels: Some(BTreeMap::from([(
                    MANAGED_BY_LABEL.to_string(),
                    crate::config::FIELD_MANAGER.to_string(),
                )])),
                ..Default::default()
            },
            type_: Some(TOKEN_SECRET_TYPE.to_string()),
            data: Some(BTreeMap::from([(
                TOKEN_KEY.to_string(),
                ByteString(token.into_bytes()),
            )])),
            ..Default::default()
        };
        apply_owned(self.client.as_ref(), Some(&self.namespace), &self.secret_name, secret).await?;
        Ok(())
    }

    /// Delete the secret and poll until the deletion is visible
    async fn delete_and_wait(&self, target: &ObjectRef) -> Result<()> {
        match self.client.delete(target).await {
            Ok(DeleteOutcome::AlreadyGone) => return Ok(()),
            Ok(DeleteOutcome::Requested) => {}
            // Another actor is deleting it as well
            Err(e) if e.is_conflict() => debug!(secret = %target, "deletion already in progress"),
            Err(e) => return Err(e),
        }

        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.poll_interval)
            .with_max_interval(self.poll_interval)
            .with_multiplier(1.0)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(Some(self.deletion_timeout))
            .build();

        let client = self.client.as_ref();
        backoff::future::retry(policy, || async move {
            match client.get(target).await {
                Ok(None) => Ok(()),
                Ok(Some(_)) => Err(backoff::Error::transient(Error::Timeout {
                    step: format!("deletion of {}", target),
                })),
                Err(e) if e.is_transient() => Err(backoff::Error::transient(e)),
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await?;

        debug!(secret = %target, "secret deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::admin_key::tests::{test_key, OTHER_KEY};
    use crate::cluster::memory::{MemoryResourceClient, ResourceOp};
    use crate::domain::ports::{CredentialKind, ResourceClient};
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    fn credential() -> RemoteCredential {
        RemoteCredential {
            id: "project-a:root".into(),
            project_name: "project-a".into(),
            kind: CredentialKind::Rs256PublicKey,
            payload: test_key().public_key_pem().to_string(),
        }
    }

    fn config() -> OperatorConfig {
        OperatorConfig {
            deletion_poll_interval: Duration::from_millis(5),
            deletion_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    fn manager(client: Arc<MemoryResourceClient>) -> TokenManager {
        TokenManager::new(client, Arc::new(test_key()), &config())
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap()
    }

    fn target() -> ObjectRef {
        ObjectRef::of::<Secret>(Some("kube-system"), crate::config::DEFAULT_TOKEN_SECRET)
    }

    async fn stored_token(client: &MemoryResourceClient) -> String {
        let raw = client.get(&target()).await.unwrap().unwrap();
        let secret: Secret = serde_json::from_value(raw).unwrap();
        String::from_utf8(secret.data.unwrap()[TOKEN_KEY].0.clone()).unwrap()
    }

    #[tokio::test]
    async fn test_missing_secret_is_issued() {
        let client = Arc::new(MemoryResourceClient::new());
        let outcome = manager(client.clone())
            .ensure_token(&credential(), start())
            .await
            .unwrap();

        assert_matches!(
            outcome,
            TokenOutcome::Issued { reason: RotationReason::Missing, .. }
        );
        let claims = token::parse(&test_key(), &stored_token(&client).await).unwrap();
        assert_eq!(claims.sub, "project-a");

        let raw = client.snapshot(&target()).unwrap();
        assert_eq!(raw["type"], TOKEN_SECRET_TYPE);
    }

    #[tokio::test]
    async fn test_rotation_boundary() {
        let client = Arc::new(MemoryResourceClient::new());
        let manager = manager(client.clone());
        manager.ensure_token(&credential(), start()).await.unwrap();

        let policy = TokenPolicy::default();
        let expires_at = start() + policy.lifetime;

        // expiresAt - now == renewal window + 1s
        let now = expires_at - policy.renewal_window - chrono::Duration::seconds(1);
        client.clear_ops();
        let outcome = manager.ensure_token(&credential(), now).await.unwrap();
        assert_eq!(outcome, TokenOutcome::Kept { expires_at });
        assert!(client.ops().is_empty());

        // expiresAt - now == renewal window - 1s
        let now = expires_at - policy.renewal_window + chrono::Duration::seconds(1);
        let outcome = manager.ensure_token(&credential(), now).await.unwrap();
        assert_matches!(
            outcome,
            TokenOutcome::Issued { reason: RotationReason::Expiring, expires_at: new_exp }
                if new_exp == now + policy.lifetime
        );
        assert_eq!(client.ops(), vec![ResourceOp::Apply(target().to_string())]);
    }

    #[tokio::test]
    async fn test_corrupt_token_is_recreated() {
        let client = Arc::new(MemoryResourceClient::new().with_delete_lag(3));
        client.seed(
            &target(),
            serde_json::json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": {"name": crate::config::DEFAULT_TOKEN_SECRET, "namespace": "kube-system"},
                "data": {"jwt": "bm90LWEtdG9rZW4="}
            }),
        );

        let outcome = manager(client.clone())
            .ensure_token(&credential(), start())
            .await
            .unwrap();
        assert_matches!(
            outcome,
            TokenOutcome::Issued { reason: RotationReason::Corrupt, .. }
        );

        let name = target().to_string();
        assert_eq!(
            client.ops(),
            vec![ResourceOp::Delete(name.clone()), ResourceOp::Apply(name)]
        );
        assert!(token::parse(&test_key(), &stored_token(&client).await).is_some());
    }

    #[tokio::test]
    async fn test_secret_without_token_field_is_recreated() {
        let client = Arc::new(MemoryResourceClient::new());
        client.seed(
            &target(),
            serde_json::json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": {"name": crate::config::DEFAULT_TOKEN_SECRET}
            }),
        );

        let outcome = manager(client.clone())
            .ensure_token(&credential(), start())
            .await
            .unwrap();
        assert_matches!(
            outcome,
            TokenOutcome::Issued { reason: RotationReason::Corrupt, .. }
        );
    }

    #[tokio::test]
    async fn test_token_signed_by_previous_key_is_recreated() {
        let client = Arc::new(MemoryResourceClient::new());
        let old_key = Arc::new(AdminKey::from_pem(OTHER_KEY.as_bytes()).unwrap());
        TokenManager::new(client.clone(), old_key, &config())
            .ensure_token(&credential(), start())
            .await
            .unwrap();

        let outcome = manager(client.clone())
            .ensure_token(&credential(), start())
            .await
            .unwrap();
        assert_matches!(
            outcome,
            TokenOutcome::Issued { reason: RotationReason::Corrupt, .. }
        );
    }

    #[tokio::test]
    async fn test_deletion_wait_is_bounded() {
        let client = Arc::new(MemoryResourceClient::new().with_delete_lag(u32::MAX));
        client.seed(
            &target(),
            serde_json::json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": {"name": crate::config::DEFAULT_TOKEN_SECRET}
            }),
        );

        let manager = TokenManager::new(
            client,
            Arc::new(test_key()),
            &OperatorConfig {
                deletion_poll_interval: Duration::from_millis(5),
                deletion_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        );
        assert_matches!(
            manager.ensure_token(&credential(), start()).await,
            Err(Error::Timeout { .. })
        );
    }

    #[tokio::test]
    async fn test_token_for_previous_project_is_rotated() {
        let client = Arc::new(MemoryResourceClient::new());
        let manager = manager(client.clone());
        manager.ensure_token(&credential(), start()).await.unwrap();

        let moved = RemoteCredential {
            id: "project-b:root".into(),
            project_name: "project-b".into(),
            ..credential()
        };
        client.clear_ops();
        let now = start() + chrono::Duration::minutes(1);
        let outcome = manager.ensure_token(&moved, now).await.unwrap();
        assert_matches!(
            outcome,
            TokenOutcome::Issued { reason: RotationReason::Mismatch, .. }
        );
        assert_eq!(client.ops(), vec![ResourceOp::Apply(target().to_string())]);

        let text = stored_token(&client).await;
        let claims = token::parse(&test_key(), &text).unwrap();
        assert_eq!(claims.sub, "project-b");
        assert_eq!(claims.roles, vec!["project-b:admin".to_string()]);
        assert_eq!(token::key_id(&text).as_deref(), Some("project-b:root"));

        // Now matching, so kept
        let outcome = manager.ensure_token(&moved, now).await.unwrap();
        assert_matches!(outcome, TokenOutcome::Kept { .. });
    }

    #[tokio::test]
    async fn test_token_for_previous_credential_id_is_rotated() {
        let client = Arc::new(MemoryResourceClient::new());
        let manager = manager(client.clone());
        manager.ensure_token(&credential(), start()).await.unwrap();

        let reuploaded = RemoteCredential {
            id: "project-a:root-2".into(),
            ..credential()
        };
        let outcome = manager.ensure_token(&reuploaded, start()).await.unwrap();
        assert_matches!(
            outcome,
            TokenOutcome::Issued { reason: RotationReason::Mismatch, .. }
        );
    }

    #[tokio::test]
    async fn test_token_for_other_caller_is_rotated() {
        let client = Arc::new(MemoryResourceClient::new());
        manager(client.clone())
            .ensure_token(&credential(), start())
            .await
            .unwrap();

        let mut config = config();
        config.token.audience = TokenPolicy::caller_audience("storage-system");
        let outcome = TokenManager::new(client.clone(), Arc::new(test_key()), &config)
            .ensure_token(&credential(), start())
            .await
            .unwrap();
        assert_matches!(
            outcome,
            TokenOutcome::Issued { reason: RotationReason::Mismatch, .. }
        );
        let claims = token::parse(&test_key(), &stored_token(&client).await).unwrap();
        assert_eq!(claims.aud, "storage-system/blockstore-operator");
    }
}
