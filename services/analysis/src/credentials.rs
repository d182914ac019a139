//! Document store credential resolution.
//!
//! Credentials come from an ordered chain of strategies. The first strategy
//! that produces a credential wins and the result is cached for the lifetime
//! of the process:
//!
//! 1. [`VaultSecretStrategy`] - secret material fetched with the process's
//!    ambient identity, no operator-supplied password involved
//! 2. [`EnvironmentStrategy`] - username/password from service configuration
//! 3. [`StaticFallbackStrategy`] - development-only static credential

use crate::config::{CredentialsConfig, StaticFallbackConfig};
use crate::error::{AuthenticationError, StoreError};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_secretsmanager::error::DisplayErrorContext;
use aws_sdk_secretsmanager::Client as SecretsClient;
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Where a credential came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialKind {
    VaultSecret,
    Environment,
    StaticFallback,
    /// Ambient identity of the execution environment itself
    ResourcePrincipal,
}

impl CredentialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKind::VaultSecret => "vault-secret",
            CredentialKind::Environment => "environment",
            CredentialKind::StaticFallback => "static-fallback",
            CredentialKind::ResourcePrincipal => "resource-principal",
        }
    }
}

/// Username/secret pair for HTTP Basic authentication against the store
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub kind: CredentialKind,
    pub username: String,
    secret: String,
    /// Position of the producing strategy in the resolver chain (0 = highest)
    pub priority: usize,
}

impl Credential {
    pub fn new(kind: CredentialKind, username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            kind,
            username: username.into(),
            secret: secret.into(),
            priority: 0,
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("kind", &self.kind)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("priority", &self.priority)
            .finish()
    }
}

/// Why a single strategy did not yield a credential
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StrategyError {
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("misconfigured: {0}")]
    Misconfigured(String),
}

/// Fetches secret material using the process's trusted identity
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecretSource: Send + Sync {
    async fn fetch_secret(&self, reference: &str) -> Result<String, StrategyError>;
}

/// One step of the credential chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialStrategy: Send + Sync {
    fn kind(&self) -> CredentialKind;

    async fn try_resolve(&self) -> Result<Credential, StrategyError>;
}

/// Secret source backed by AWS Secrets Manager and the default credential chain
pub struct SecretsManagerSource {
    client: SecretsClient,
}

impl SecretsManagerSource {
    pub async fn new(region: &str) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;

        Self {
            client: SecretsClient::new(&aws_config),
        }
    }
}

#[async_trait]
impl SecretSource for SecretsManagerSource {
    #[instrument(skip(self))]
    async fn fetch_secret(&self, reference: &str) -> Result<String, StrategyError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(StrategyError::Misconfigured("empty secret reference".to_string()));
        }

        match self.client.get_secret_value().secret_id(reference).send().await {
            Ok(output) => {
                if let Some(secret) = output.secret_string() {
                    return Ok(secret.to_string());
                }
                if let Some(blob) = output.secret_binary() {
                    return String::from_utf8(blob.as_ref().to_vec()).map_err(|e| {
                        StrategyError::Misconfigured(format!(
                            "secret {} is not valid UTF-8: {}",
                            reference, e
                        ))
                    });
                }
                Err(StrategyError::Misconfigured(format!(
                    "secret {} has no content",
                    reference
                )))
            }
            Err(e) => {
                let bad_reference = e
                    .as_service_error()
                    .map(|s| {
                        s.is_resource_not_found_exception()
                            || s.is_invalid_parameter_exception()
                            || s.is_invalid_request_exception()
                    })
                    .unwrap_or(false);
                let message = format!("{}: {}", reference, DisplayErrorContext(&e));

                if bad_reference {
                    Err(StrategyError::Misconfigured(message))
                } else {
                    Err(StrategyError::Unavailable(message))
                }
            }
        }
    }
}

/// Password (and optionally username) from the secret store
pub struct VaultSecretStrategy {
    source: Arc<dyn SecretSource>,
    username_ref: Option<String>,
    password_ref: Option<String>,
    configured_username: Option<String>,
}

impl VaultSecretStrategy {
    pub fn new(
        source: Arc<dyn SecretSource>,
        username_ref: Option<String>,
        password_ref: Option<String>,
        configured_username: Option<String>,
    ) -> Self {
        Self {
            source,
            username_ref: non_empty(username_ref),
            password_ref: non_empty(password_ref),
            configured_username: non_empty(configured_username),
        }
    }
}

#[async_trait]
impl CredentialStrategy for VaultSecretStrategy {
    fn kind(&self) -> CredentialKind {
        CredentialKind::VaultSecret
    }

    async fn try_resolve(&self) -> Result<Credential, StrategyError> {
        let password_ref = self.password_ref.as_deref().ok_or_else(|| {
            StrategyError::Unavailable("no password secret reference configured".to_string())
        })?;

        let password = self.source.fetch_secret(password_ref).await?;

        let username = match (&self.username_ref, &self.configured_username) {
            (Some(reference), _) => self.source.fetch_secret(reference).await?.trim().to_string(),
            (None, Some(username)) => username.clone(),
            (None, None) => {
                return Err(StrategyError::Misconfigured(
                    "password secret set but no username secret or configured username".to_string(),
                ))
            }
        };

        if username.is_empty() {
            return Err(StrategyError::Misconfigured("username secret is empty".to_string()));
        }

        Ok(Credential::new(CredentialKind::VaultSecret, username, password))
    }
}

/// Operator-supplied username/password from configuration
pub struct EnvironmentStrategy {
    username: Option<String>,
    password: Option<String>,
}

impl EnvironmentStrategy {
    pub fn new(username: Option<String>, password: Option<String>) -> Self {
        Self {
            username: non_empty(username),
            password: non_empty(password),
        }
    }
}

#[async_trait]
impl CredentialStrategy for EnvironmentStrategy {
    fn kind(&self) -> CredentialKind {
        CredentialKind::Environment
    }

    async fn try_resolve(&self) -> Result<Credential, StrategyError> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Ok(Credential::new(
                CredentialKind::Environment,
                username.clone(),
                password.clone(),
            )),
            (None, None) => Err(StrategyError::Unavailable(
                "no username/password configured".to_string(),
            )),
            (Some(_), None) => Err(StrategyError::Misconfigured(
                "username configured without password".to_string(),
            )),
            (None, Some(_)) => Err(StrategyError::Misconfigured(
                "password configured without username".to_string(),
            )),
        }
    }
}

/// Static development credential. NON-PRODUCTION.
pub struct StaticFallbackStrategy {
    config: StaticFallbackConfig,
}

impl StaticFallbackStrategy {
    pub fn new(config: StaticFallbackConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl CredentialStrategy for StaticFallbackStrategy {
    fn kind(&self) -> CredentialKind {
        CredentialKind::StaticFallback
    }

    async fn try_resolve(&self) -> Result<Credential, StrategyError> {
        if !self.config.enabled {
            return Err(StrategyError::Unavailable("static fallback disabled".to_string()));
        }
        if self.config.password.is_empty() {
            return Err(StrategyError::Misconfigured(
                "static fallback enabled without a password".to_string(),
            ));
        }

        warn!(
            username = %self.config.username,
            "Using NON-PRODUCTION static fallback credential for the document store"
        );

        Ok(Credential::new(
            CredentialKind::StaticFallback,
            self.config.username.clone(),
            self.config.password.clone(),
        ))
    }
}

/// Ordered credential chain with a process-lifetime cache
pub struct CredentialResolver {
    strategies: Vec<Box<dyn CredentialStrategy>>,
    cached: RwLock<Option<Credential>>,
}

impl CredentialResolver {
    pub fn new(strategies: Vec<Box<dyn CredentialStrategy>>) -> Self {
        Self {
            strategies,
            cached: RwLock::new(None),
        }
    }

    /// Standard chain: vault secret, then configuration, then static fallback
    pub fn from_config(config: &CredentialsConfig, secrets: Arc<dyn SecretSource>) -> Self {
        Self::new(vec![
            Box::new(VaultSecretStrategy::new(
                secrets,
                config.username_secret_ref.clone(),
                config.password_secret_ref.clone(),
                config.username.clone(),
            )),
            Box::new(EnvironmentStrategy::new(
                config.username.clone(),
                config.password.clone(),
            )),
            Box::new(StaticFallbackStrategy::new(config.static_fallback.clone())),
        ])
    }

    /// Return the cached credential or walk the chain in order
    pub async fn resolve(&self) -> Result<Credential, AuthenticationError> {
        if let Some(credential) = self.cached.read().clone() {
            return Ok(credential);
        }

        let mut attempts = Vec::with_capacity(self.strategies.len());

        for (priority, strategy) in self.strategies.iter().enumerate() {
            let kind = strategy.kind();
            match strategy.try_resolve().await {
                Ok(mut credential) => {
                    credential.priority = priority;
                    info!(
                        kind = kind.as_str(),
                        username = %credential.username,
                        "Resolved document store credential"
                    );
                    *self.cached.write() = Some(credential.clone());
                    return Ok(credential);
                }
                Err(StrategyError::Unavailable(reason)) => {
                    debug!(kind = kind.as_str(), reason = %reason, "Credential strategy unavailable");
                    attempts.push(format!("{}: unavailable: {}", kind.as_str(), reason));
                }
                Err(StrategyError::Misconfigured(reason)) => {
                    warn!(kind = kind.as_str(), reason = %reason, "Credential strategy misconfigured");
                    attempts.push(format!("{}: misconfigured: {}", kind.as_str(), reason));
                }
            }
        }

        metrics::counter!("credentials.resolution_failures").increment(1);
        Err(AuthenticationError::NoCredential { attempts })
    }

    /// Drop the cached credential so the next `resolve` walks the chain again
    pub fn invalidate(&self) {
        if self.cached.write().take().is_some() {
            debug!("Invalidated cached document store credential");
        }
    }

    pub fn cached(&self) -> Option<Credential> {
        self.cached.read().clone()
    }

    /// Run a store operation with the current credential. If the store
    /// rejects it, the credential is re-resolved once and the operation
    /// retried; a second rejection is returned to the caller.
    pub async fn with_credential<T, F, Fut>(&self, operation: F) -> Result<T, StoreError>
    where
        F: Fn(Credential) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let credential = self.resolve().await?;

        match operation(credential).await {
            Err(err) if err.is_authentication() => {
                warn!(error = %err, "Document store rejected credential, re-resolving once");
                self.invalidate();
                let credential = self.resolve().await?;
                operation(credential).await
            }
            result => result,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unavailable_secrets() -> Arc<dyn SecretSource> {
        let mut source = MockSecretSource::new();
        source
            .expect_fetch_secret()
            .returning(|_| Err(StrategyError::Unavailable("no identity".to_string())));
        Arc::new(source)
    }

    fn fallback(enabled: bool) -> StaticFallbackConfig {
        StaticFallbackConfig {
            enabled,
            username: "ADMIN".to_string(),
            password: "dev-password".to_string(),
        }
    }

    #[tokio::test]
    async fn test_falls_back_to_static_credential_in_order() {
        let config = CredentialsConfig {
            password_secret_ref: Some("secret/db-password".to_string()),
            static_fallback: fallback(true),
            ..Default::default()
        };
        let resolver = CredentialResolver::from_config(&config, unavailable_secrets());

        let credential = resolver.resolve().await.unwrap();
        assert_eq!(credential.kind, CredentialKind::StaticFallback);
        assert_eq!(credential.username, "ADMIN");
        assert_eq!(credential.secret(), "dev-password");
        assert_eq!(credential.priority, 2);
    }

    #[tokio::test]
    async fn test_environment_wins_over_static_fallback() {
        let config = CredentialsConfig {
            username: Some("app_user".to_string()),
            password: Some("hunter2".to_string()),
            static_fallback: fallback(true),
            ..Default::default()
        };
        let resolver = CredentialResolver::from_config(&config, unavailable_secrets());

        let credential = resolver.resolve().await.unwrap();
        assert_eq!(credential.kind, CredentialKind::Environment);
        assert_eq!(credential.priority, 1);
    }

    #[tokio::test]
    async fn test_vault_secret_takes_priority() {
        let mut source = MockSecretSource::new();
        source
            .expect_fetch_secret()
            .withf(|reference| reference.to_string() == "secret/db-password")
            .times(1)
            .returning(|_| Ok("vault-password".to_string()));
        source
            .expect_fetch_secret()
            .withf(|reference| reference.to_string() == "secret/db-username")
            .times(1)
            .returning(|_| Ok("  vault_user\n".to_string()));

        let config = CredentialsConfig {
            username_secret_ref: Some("secret/db-username".to_string()),
            password_secret_ref: Some("secret/db-password".to_string()),
            username: Some("app_user".to_string()),
            password: Some("hunter2".to_string()),
            ..Default::default()
        };
        let resolver = CredentialResolver::from_config(&config, Arc::new(source));

        let credential = resolver.resolve().await.unwrap();
        assert_eq!(credential.kind, CredentialKind::VaultSecret);
        assert_eq!(credential.username, "vault_user");
        assert_eq!(credential.secret(), "vault-password");
        assert_eq!(credential.priority, 0);
    }

    #[tokio::test]
    async fn test_vault_password_pairs_with_configured_username() {
        let mut source = MockSecretSource::new();
        source
            .expect_fetch_secret()
            .times(1)
            .returning(|_| Ok("vault-password".to_string()));

        let strategy = VaultSecretStrategy::new(
            Arc::new(source),
            None,
            Some("secret/db-password".to_string()),
            Some("app_user".to_string()),
        );

        let credential = strategy.try_resolve().await.unwrap();
        assert_eq!(credential.username, "app_user");
        assert_eq!(credential.secret(), "vault-password");
    }

    #[tokio::test]
    async fn test_strategies_are_tried_in_order_and_stop_at_first_success() {
        let mut first = MockCredentialStrategy::new();
        first.expect_kind().return_const(CredentialKind::VaultSecret);
        first
            .expect_try_resolve()
            .times(1)
            .returning(|| Err(StrategyError::Misconfigured("malformed reference".to_string())));

        let mut second = MockCredentialStrategy::new();
        second.expect_kind().return_const(CredentialKind::Environment);
        second
            .expect_try_resolve()
            .times(1)
            .returning(|| Ok(Credential::new(CredentialKind::Environment, "user", "pw")));

        let mut third = MockCredentialStrategy::new();
        third.expect_kind().return_const(CredentialKind::StaticFallback);
        third.expect_try_resolve().never();

        let resolver =
            CredentialResolver::new(vec![Box::new(first), Box::new(second), Box::new(third)]);

        let credential = resolver.resolve().await.unwrap();
        assert_eq!(credential.kind, CredentialKind::Environment);

        // Cached: no strategy runs again
        let again = resolver.resolve().await.unwrap();
        assert_eq!(again, credential);
    }

    #[tokio::test]
    async fn test_all_unavailable_is_authentication_error() {
        let resolver =
            CredentialResolver::from_config(&CredentialsConfig::default(), unavailable_secrets());

        let err = resolver.resolve().await.unwrap_err();
        match err {
            AuthenticationError::NoCredential { attempts } => {
                assert_eq!(attempts.len(), 3);
                assert!(attempts[0].starts_with("vault-secret: unavailable"));
                assert!(attempts[1].starts_with("environment: unavailable"));
                assert!(attempts[2].starts_with("static-fallback: unavailable"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(resolver.cached().is_none());
    }

    #[tokio::test]
    async fn test_misconfiguration_is_recorded_and_skipped() {
        let config = CredentialsConfig {
            username: Some("app_user".to_string()),
            static_fallback: fallback(true),
            ..Default::default()
        };
        let resolver = CredentialResolver::from_config(&config, unavailable_secrets());

        let credential = resolver.resolve().await.unwrap();
        assert_eq!(credential.kind, CredentialKind::StaticFallback);

        let config = CredentialsConfig {
            static_fallback: fallback(false),
            ..config
        };
        let resolver = CredentialResolver::from_config(&config, unavailable_secrets());
        let err = resolver.resolve().await.unwrap_err();
        assert!(err.to_string().contains("environment: misconfigured"));
    }

    #[tokio::test]
    async fn test_invalidate_forces_re_resolution() {
        let mut strategy = MockCredentialStrategy::new();
        strategy.expect_kind().return_const(CredentialKind::Environment);
        strategy
            .expect_try_resolve()
            .times(2)
            .returning(|| Ok(Credential::new(CredentialKind::Environment, "user", "pw")));

        let resolver = CredentialResolver::new(vec![Box::new(strategy)]);
        resolver.resolve().await.unwrap();
        resolver.resolve().await.unwrap();

        resolver.invalidate();
        assert!(resolver.cached().is_none());
        resolver.resolve().await.unwrap();
    }

    #[tokio::test]
    async fn test_with_credential_re_resolves_once_after_rejection() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let mut strategy = MockCredentialStrategy::new();
        strategy.expect_kind().return_const(CredentialKind::Environment);
        strategy
            .expect_try_resolve()
            .times(2)
            .returning(|| Ok(Credential::new(CredentialKind::Environment, "user", "pw")));
        let resolver = CredentialResolver::new(vec![Box::new(strategy)]);

        let calls = AtomicUsize::new(0);
        let result = resolver
            .with_credential(|_credential| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call == 0 {
                        Err(StoreError::from(AuthenticationError::Rejected { status: 401 }))
                    } else {
                        Ok(call)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_credential_gives_up_after_second_rejection() {
        let resolver = CredentialResolver::new(vec![Box::new(EnvironmentStrategy::new(
            Some("user".to_string()),
            Some("pw".to_string()),
        ))]);

        let result: Result<(), StoreError> = resolver
            .with_credential(|_credential| async {
                Err(StoreError::from(AuthenticationError::Rejected { status: 403 }))
            })
            .await;

        assert!(result.unwrap_err().is_authentication());
    }

    #[tokio::test]
    async fn test_with_credential_without_any_credential() {
        let resolver = CredentialResolver::new(Vec::new());
        let result: Result<(), StoreError> =
            resolver.with_credential(|_credential| async { Ok(()) }).await;

        assert!(matches!(
            result,
            Err(StoreError::Authentication(AuthenticationError::NoCredential { .. }))
        ));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let credential = Credential::new(CredentialKind::Environment, "user", "top-secret");
        let rendered = format!("{:?}", credential);
        assert!(rendered.contains("user"));
        assert!(!rendered.contains("top-secret"));
    }
}
