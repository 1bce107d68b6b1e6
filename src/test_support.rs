//! Scriptable provider and pre-wired managers shared by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::time::Duration as TokioDuration;
use url::Url;
use uuid::Uuid;

use crate::config::TokenLifecycleConfig;
use crate::models::{
    AccessToken, ConnectionConfig, ConnectionConfigInput, Environment, RefreshToken, TokenState,
};
use crate::providers::{OAuthProvider, ProviderError, TokenGrant};
use crate::store::{CredentialStore, MemoryStore, Stores, TokenStore};
use crate::token_manager::TokenManager;

struct Script {
    accepted_refresh: Option<String>,
    generation: u32,
    rotate: bool,
    expires_in: Option<u64>,
    refresh_delay: Option<TokioDuration>,
    exchange_delay: Option<TokioDuration>,
    refresh_failure: Option<ProviderError>,
    probe_result: Result<(), ProviderError>,
}

/// In-process authorization server issuing `at-N`/`rt-N` pairs.
///
/// Starts out accepting `rt-0`; every successful refresh or code exchange bumps
/// N and, while rotation is on, only the newest refresh token is accepted.
pub struct FakeProvider {
    script: Mutex<Script>,
    refresh_calls: AtomicUsize,
    exchange_calls: AtomicUsize,
    probe_calls: AtomicUsize,
}

impl FakeProvider {
    pub const VALID_CODE: &'static str = "good-code";

    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script {
                accepted_refresh: Some("rt-0".to_string()),
                generation: 0,
                rotate: true,
                expires_in: Some(21_600),
                refresh_delay: None,
                exchange_delay: None,
                refresh_failure: None,
                probe_result: Ok(()),
            }),
            refresh_calls: AtomicUsize::new(0),
            exchange_calls: AtomicUsize::new(0),
            probe_calls: AtomicUsize::new(0),
        }
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().expect("fake provider script lock")
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn exchange_calls(&self) -> usize {
        self.exchange_calls.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    pub fn set_refresh_delay(&self, delay: Option<TokioDuration>) {
        self.script().refresh_delay = delay;
    }

    pub fn set_exchange_delay(&self, delay: Option<TokioDuration>) {
        self.script().exchange_delay = delay;
    }

    pub fn set_rotation(&self, rotate: bool) {
        self.script().rotate = rotate;
    }

    pub fn set_expires_in(&self, expires_in: Option<u64>) {
        self.script().expires_in = expires_in;
    }

    pub fn fail_refreshes_with(&self, failure: Option<ProviderError>) {
        self.script().refresh_failure = failure;
    }

    /// Every refresh token presented from now on is `invalid_grant`.
    pub fn revoke_refresh_tokens(&self) {
        self.script().accepted_refresh = None;
    }

    pub fn set_probe_result(&self, result: Result<(), ProviderError>) {
        self.script().probe_result = result;
    }

    fn invalid_grant() -> ProviderError {
        ProviderError::Rejected {
            status: 400,
            error_code: Some("invalid_grant".to_string()),
            details: "invalid_grant".to_string(),
        }
    }
}

#[async_trait]
impl OAuthProvider for FakeProvider {
    fn slug(&self) -> &'static str {
        "bling"
    }

    fn authorize_url(&self, config: &ConnectionConfig, state: &str) -> Result<Url, ProviderError> {
        let mut url = Url::parse("https://bling.test/oauth/authorize").map_err(|e| {
            ProviderError::Configuration {
                details: e.to_string(),
            }
        })?;
        url.query_pairs_mut()
            .append_pair("client_id", &config.client_id)
            .append_pair("state", state);
        Ok(url)
    }

    fn api_base(&self, environment: Environment) -> String {
        format!("https://api.bling.test/{}", environment.as_str())
    }

    async fn exchange_code(
        &self,
        _config: &ConnectionConfig,
        code: &str,
    ) -> Result<TokenGrant, ProviderError> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.script().exchange_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if code != Self::VALID_CODE {
            return Err(Self::invalid_grant());
        }

        let mut script = self.script();
        script.generation += 1;
        let refresh = format!("rt-{}", script.generation);
        script.accepted_refresh = Some(refresh.clone());
        Ok(TokenGrant {
            access_token: AccessToken::new(format!("at-{}", script.generation)),
            refresh_token: Some(RefreshToken::new(refresh)),
            expires_in: script.expires_in,
        })
    }

    async fn refresh(
        &self,
        _config: &ConnectionConfig,
        refresh_token: &RefreshToken,
    ) -> Result<TokenGrant, ProviderError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.script().refresh_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut script = self.script();
        if let Some(failure) = script.refresh_failure.clone() {
            return Err(failure);
        }
        if script.accepted_refresh.as_deref() != Some(refresh_token.expose()) {
            return Err(Self::invalid_grant());
        }

        script.generation += 1;
        let rotated = script.rotate.then(|| format!("rt-{}", script.generation));
        if let Some(next) = &rotated {
            script.accepted_refresh = Some(next.clone());
        }
        Ok(TokenGrant {
            access_token: AccessToken::new(format!("at-{}", script.generation)),
            refresh_token: rotated.map(RefreshToken::new),
            expires_in: script.expires_in,
        })
    }

    async fn probe(
        &self,
        _config: &ConnectionConfig,
        _access_token: &AccessToken,
    ) -> Result<(), ProviderError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        self.script().probe_result.clone()
    }
}

pub fn lifecycle_config() -> TokenLifecycleConfig {
    TokenLifecycleConfig {
        refresh_jitter_factor: 0.0,
        ..TokenLifecycleConfig::default()
    }
}

pub fn config_input(client_id: &str) -> ConnectionConfigInput {
    ConnectionConfigInput {
        client_id: client_id.to_string(),
        client_secret: Some("s3cret".to_string()),
        redirect_uri: "https://vng.example.com/integrations/bling/callback".to_string(),
        environment: Environment::Production,
    }
}

/// A manager over a [`MemoryStore`] and a [`FakeProvider`], plus one tenant.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub provider: Arc<FakeProvider>,
    pub manager: TokenManager,
    pub tenant: Uuid,
}

impl Harness {
    /// Nothing stored yet.
    pub async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(FakeProvider::new());
        let manager = TokenManager::new(
            lifecycle_config(),
            Stores::memory(store.clone()),
            provider.clone(),
        );
        Self {
            store,
            provider,
            manager,
            tenant: Uuid::new_v4(),
        }
    }

    /// The tenant has a config but never authorized.
    pub async fn configured() -> Self {
        let harness = Self::new().await;
        harness
            .store
            .save(harness.tenant, config_input("client-1"))
            .await
            .expect("config saved");
        harness
    }

    /// The tenant holds `at-0`/`rt-0` expiring `expires_in` from now.
    pub async fn connected(expires_in: Duration) -> Self {
        let harness = Self::configured().await;
        harness
            .put_tokens(harness.tenant, "0", expires_in)
            .await;
        harness
    }

    /// Adds another configured tenant holding `at-<suffix>`/`rt-<suffix>`.
    pub async fn add_tenant(&self, suffix: &str, expires_in: Duration) -> Uuid {
        let tenant = Uuid::new_v4();
        self.store
            .save(tenant, config_input(&format!("client-{suffix}")))
            .await
            .expect("config saved");
        self.put_tokens(tenant, suffix, expires_in).await;
        tenant
    }

    async fn put_tokens(&self, tenant: Uuid, suffix: &str, expires_in: Duration) {
        TokenStore::put(
            &*self.store,
            TokenState {
                tenant_id: tenant,
                access_token: AccessToken::new(format!("at-{suffix}")),
                refresh_token: RefreshToken::new(format!("rt-{suffix}")),
                expires_at: Utc::now() + expires_in,
                last_sync: None,
            },
        )
        .await
        .expect("tokens stored");
    }

    pub async fn stored_tokens(&self) -> Option<TokenState> {
        TokenStore::get(&*self.store, self.tenant)
            .await
            .expect("token store readable")
    }
}
