//! # Token Lifecycle Manager
//!
//! Owns every write to a tenant's [`TokenState`]: the authorize redirect, the
//! code exchange, refreshes, disconnects and the background refresh loop.
//!
//! Refreshes are single-flight per tenant. The first caller becomes the leader
//! and talks to the provider; callers arriving while it is in flight subscribe
//! to the leader's broadcast and receive the same result. Stored tokens are
//! only replaced while the refresh token that was presented is still the
//! current one, so replicas racing on the same tenant cannot clobber each
//! other.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, histogram};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{Semaphore, broadcast};
use tokio::time::{Duration as TokioDuration, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::TokenLifecycleConfig;
use crate::error::IntegrationError;
use crate::models::{
    AccessToken, ConnectionConfig, ConnectionPhase, ConnectionStatus, PendingAuthorization,
    TokenState,
};
use crate::providers::{OAuthProvider, ProviderError, TokenGrant};
use crate::store::{AuthorizationStore, CredentialStore, Stores, TokenStore};
use crate::telemetry::metric;

/// Access-token lifetime assumed when the provider omits `expires_in`.
pub const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 6 * 60 * 60;

const MAX_TOKEN_LIFETIME_SECS: u64 = 366 * 24 * 60 * 60;

type RefreshOutcome = Result<TokenState, IntegrationError>;
type InFlight = Arc<Mutex<HashMap<Uuid, broadcast::Sender<RefreshOutcome>>>>;

/// Authorize redirect handed back to the settings UI.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AuthorizationRedirect {
    pub authorize_url: String,
    pub state: String,
    pub expires_at: DateTime<Utc>,
}

/// What a leader should do once it holds the tenant's refresh slot.
#[derive(Debug, Clone)]
enum RefreshMode {
    /// Skip the provider when the stored token already outlives the margin.
    IfStale(Duration),
    /// Skip the provider when the stored access token is no longer `rejected`.
    Replacing(AccessToken),
    Always,
}

enum Role {
    Leader(broadcast::Sender<RefreshOutcome>),
    Follower(broadcast::Receiver<RefreshOutcome>),
}

/// Counts for one background tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickSummary {
    pub due: usize,
    pub refreshed: usize,
    pub disconnected: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct TokenManager {
    config: TokenLifecycleConfig,
    credentials: Arc<dyn CredentialStore>,
    tokens: Arc<dyn TokenStore>,
    authorizations: Arc<dyn AuthorizationStore>,
    provider: Arc<dyn OAuthProvider>,
    in_flight: InFlight,
}

impl TokenManager {
    pub fn new(
        config: TokenLifecycleConfig,
        stores: Stores,
        provider: Arc<dyn OAuthProvider>,
    ) -> Self {
        Self {
            config,
            credentials: stores.credentials,
            tokens: stores.tokens,
            authorizations: stores.authorizations,
            provider,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn provider(&self) -> &Arc<dyn OAuthProvider> {
        &self.provider
    }

    pub fn lifecycle(&self) -> &TokenLifecycleConfig {
        &self.config
    }

    /// Loads the tenant's config, treating a missing one as a settings problem.
    pub async fn connection_config(
        &self,
        tenant_id: Uuid,
    ) -> Result<ConnectionConfig, IntegrationError> {
        match self.credentials.get(tenant_id).await {
            Ok(config) => Ok(config),
            Err(IntegrationError::NotFound) => Err(IntegrationError::ConfigInvalid(
                "Bling integration is not configured for this tenant".to_string(),
            )),
            Err(err) => Err(err),
        }
    }

    /// Starts the authorize flow and records the CSRF `state` it carries.
    #[instrument(skip_all, fields(tenant_id = %tenant_id))]
    pub async fn begin_authorization(
        &self,
        tenant_id: Uuid,
    ) -> Result<AuthorizationRedirect, IntegrationError> {
        let config = self.connection_config(tenant_id).await?;
        let now = Utc::now();

        if let Err(err) = self.authorizations.cleanup_expired(now).await {
            warn!(error = %err, "Failed to clean up expired authorization states");
        }

        let state = generate_state();
        let authorize_url = self
            .provider
            .authorize_url(&config, &state)
            .map_err(|err| IntegrationError::ConfigInvalid(err.to_string()))?;

        let expires_at =
            now + Duration::minutes(self.config.authorization_ttl_minutes as i64);
        self.authorizations
            .create(PendingAuthorization {
                tenant_id,
                state: state.clone(),
                expires_at,
            })
            .await?;

        info!(
            provider = self.provider.slug(),
            environment = %config.environment,
            "Authorization started"
        );

        Ok(AuthorizationRedirect {
            authorize_url: authorize_url.to_string(),
            state,
            expires_at,
        })
    }

    /// Resolves the tenant behind a callback `state`, then completes the exchange.
    #[instrument(skip_all)]
    pub async fn complete_authorization_callback(
        &self,
        state: &str,
        code: &str,
    ) -> Result<ConnectionStatus, IntegrationError> {
        let pending = self
            .authorizations
            .find_live(state, Utc::now())
            .await?
            .ok_or_else(|| {
                warn!("Callback carried an unknown or expired state");
                IntegrationError::AuthorizationError(
                    "unknown or expired authorization state".to_string(),
                )
            })?;

        self.complete_authorization(pending.tenant_id, code).await
    }

    /// Exchanges an authorization code for the tenant's first token pair.
    ///
    /// Pending authorizations survive a failed exchange so the tenant stays
    /// `connecting` and may retry.
    #[instrument(skip_all, fields(tenant_id = %tenant_id))]
    pub async fn complete_authorization(
        &self,
        tenant_id: Uuid,
        code: &str,
    ) -> Result<ConnectionStatus, IntegrationError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(IntegrationError::AuthorizationError(
                "authorization code is missing".to_string(),
            ));
        }

        let config = self.connection_config(tenant_id).await?;
        let grant = match timeout(
            self.config.request_timeout(),
            self.provider.exchange_code(&config, code),
        )
        .await
        {
            Err(_) => {
                warn!(
                    timeout_seconds = self.config.request_timeout_seconds,
                    "Code exchange timed out"
                );
                return Err(IntegrationError::network("code exchange timed out"));
            }
            Ok(Err(err)) => {
                warn!(error = %err, "Code exchange failed");
                return Err(exchange_error(err));
            }
            Ok(Ok(grant)) => grant,
        };

        let refresh_token = grant.refresh_token.clone().ok_or_else(|| {
            IntegrationError::AuthorizationError(
                "provider did not issue a refresh token".to_string(),
            )
        })?;

        let now = Utc::now();
        let previous_sync = self
            .tokens
            .get(tenant_id)
            .await?
            .and_then(|state| state.last_sync);
        self.tokens
            .put(TokenState {
                tenant_id,
                access_token: grant.access_token.clone(),
                refresh_token,
                expires_at: expiry_of(&grant, now),
                last_sync: previous_sync,
            })
            .await?;
        self.authorizations.clear_tenant(tenant_id).await?;

        info!(provider = self.provider.slug(), "Authorization completed");
        self.status(tenant_id).await
    }

    /// Returns an access token that outlives the safety margin, refreshing first
    /// when needed.
    #[instrument(skip_all, fields(tenant_id = %tenant_id))]
    pub async fn get_valid_token(&self, tenant_id: Uuid) -> Result<AccessToken, IntegrationError> {
        let margin = self.config.safety_margin();

        match self.tokens.get(tenant_id).await? {
            Some(state) if state.is_fresh(margin, Utc::now()) => return Ok(state.access_token),
            Some(_) => {}
            None => {
                self.connection_config(tenant_id).await?;
                return Err(IntegrationError::TokenExpired);
            }
        }

        let refreshed = match self
            .single_flight(tenant_id, RefreshMode::IfStale(margin))
            .await
        {
            // Another replica rotated the pair underneath us; use what it stored.
            Err(IntegrationError::AuthorizationError(reason)) => {
                match self.tokens.get(tenant_id).await? {
                    Some(state) if state.is_connected(Utc::now()) => state,
                    _ => return Err(IntegrationError::AuthorizationError(reason)),
                }
            }
            other => other?,
        };

        if !refreshed.is_connected(Utc::now()) {
            return Err(IntegrationError::network(
                "provider issued an access token that is already expired",
            ));
        }
        Ok(refreshed.access_token)
    }

    /// Exchanges the stored refresh token for a new pair.
    pub async fn refresh(&self, tenant_id: Uuid) -> Result<AccessToken, IntegrationError> {
        self.single_flight(tenant_id, RefreshMode::Always)
            .await
            .map(|state| state.access_token)
    }

    /// Refreshes after a provider call rejected `rejected`, unless a concurrent
    /// refresh already replaced it.
    pub async fn refresh_rejected(
        &self,
        tenant_id: Uuid,
        rejected: &AccessToken,
    ) -> Result<AccessToken, IntegrationError> {
        self.single_flight(tenant_id, RefreshMode::Replacing(rejected.clone()))
            .await
            .map(|state| state.access_token)
    }

    /// Clears tokens and pending authorizations; the config stays.
    #[instrument(skip_all, fields(tenant_id = %tenant_id))]
    pub async fn disconnect(&self, tenant_id: Uuid) -> Result<ConnectionStatus, IntegrationError> {
        let removed = self.tokens.clear(tenant_id).await?;
        let abandoned = self.authorizations.clear_tenant(tenant_id).await?;
        info!(
            tokens_removed = removed,
            authorizations_removed = abandoned,
            "Tenant disconnected"
        );
        self.status(tenant_id).await
    }

    /// Disconnects the tenant when the provider refused `rejected` and nothing
    /// newer has been stored since. Returns whether tokens were cleared.
    #[instrument(skip_all, fields(tenant_id = %tenant_id))]
    pub async fn mark_rejected(
        &self,
        tenant_id: Uuid,
        rejected: &AccessToken,
    ) -> Result<bool, IntegrationError> {
        let Some(current) = self.tokens.get(tenant_id).await? else {
            return Ok(false);
        };
        if &current.access_token != rejected {
            return Ok(false);
        }

        let cleared = self
            .tokens
            .clear_if_current(tenant_id, &current.refresh_token)
            .await?;
        if cleared {
            warn!(phase = %ConnectionPhase::Disconnected, "Provider rejected access token");
        }
        Ok(cleared)
    }

    pub async fn record_use(&self, tenant_id: Uuid) -> Result<(), IntegrationError> {
        self.tokens.touch_last_sync(tenant_id, Utc::now()).await
    }

    pub async fn status(&self, tenant_id: Uuid) -> Result<ConnectionStatus, IntegrationError> {
        let now = Utc::now();
        let config = match self.credentials.get(tenant_id).await {
            Ok(config) => Some(config),
            Err(IntegrationError::NotFound) => None,
            Err(err) => return Err(err),
        };
        let tokens = self.tokens.get(tenant_id).await?;
        let pending = self.authorizations.has_live(tenant_id, now).await?;
        let refreshing = self.lock_in_flight().contains_key(&tenant_id);

        let phase =
            ConnectionPhase::derive(config.is_some(), tokens.as_ref(), pending, refreshing, now);

        Ok(ConnectionStatus {
            tenant_id,
            phase,
            is_connected: config.is_some() && tokens.as_ref().is_some_and(|t| t.is_connected(now)),
            environment: config.map(|c| c.environment),
            expires_at: tokens.as_ref().map(|t| t.expires_at),
            last_sync: tokens.and_then(|t| t.last_sync),
        })
    }

    /// Run the background refresh loop until the provided shutdown token fires
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Starting background token refresh");
        let tick_interval = TokioDuration::from_secs(self.config.refresh_tick_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Background token refresh shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    match self.tick().await {
                        Ok(summary) => debug!(?summary, "Token refresh tick completed"),
                        Err(err) => error!(error = %err, "Token refresh tick failed"),
                    }
                }
            }
        }

        info!("Background token refresh stopped");
    }

    /// Refreshes every tenant whose token expires within the lead time.
    #[instrument(skip_all)]
    pub async fn tick(&self) -> Result<TickSummary, IntegrationError> {
        let now = Utc::now();
        let lead_time = Duration::seconds(self.config.refresh_lead_time_seconds as i64);

        if let Err(err) = self.authorizations.cleanup_expired(now).await {
            warn!(error = %err, "Failed to clean up expired authorization states");
        }

        let due = self.tokens.expiring_before(now + lead_time).await?;
        let mut summary = TickSummary {
            due: due.len(),
            ..TickSummary::default()
        };
        if due.is_empty() {
            return Ok(summary);
        }

        info!(
            due = due.len(),
            lead_time_seconds = self.config.refresh_lead_time_seconds,
            "Found tokens due for refresh"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.refresh_concurrency.max(1) as usize));
        let mut handles = Vec::with_capacity(due.len());

        for tenant_id in due {
            let semaphore = semaphore.clone();
            let manager = self.clone();
            let jitter = self.compute_jitter();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| IntegrationError::network("refresh pool closed"))?;
                if jitter > 0 {
                    debug!(tenant_id = %tenant_id, jitter_seconds = jitter, "Applying jitter before token refresh");
                    sleep(TokioDuration::from_secs(jitter)).await;
                }
                manager
                    .single_flight(tenant_id, RefreshMode::IfStale(lead_time))
                    .await
                    .map(|_| ())
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(Ok(())) => summary.refreshed += 1,
                Ok(Err(IntegrationError::TokenExpired)) => summary.disconnected += 1,
                Ok(Err(err)) => {
                    summary.failed += 1;
                    debug!(error = %err, "Background refresh failed");
                }
                Err(err) => {
                    summary.failed += 1;
                    error!(error = ?err, "Refresh task panicked or was cancelled");
                }
            }
        }

        Ok(summary)
    }

    fn compute_jitter(&self) -> u64 {
        if self.config.refresh_jitter_factor <= 0.0 {
            return 0;
        }

        let max_delay_seconds = (self.config.refresh_lead_time_seconds as f64
            * self.config.refresh_jitter_factor) as u64;

        let mut rng = rand::thread_rng();
        rng.gen_range(0..=max_delay_seconds)
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<Uuid, broadcast::Sender<RefreshOutcome>>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Joins the tenant's in-flight refresh or leads a new one.
    async fn single_flight(&self, tenant_id: Uuid, mode: RefreshMode) -> RefreshOutcome {
        let role = {
            let mut in_flight = self.lock_in_flight();
            match in_flight.get(&tenant_id) {
                Some(sender) => Role::Follower(sender.subscribe()),
                None => {
                    let (sender, _) = broadcast::channel(1);
                    in_flight.insert(tenant_id, sender.clone());
                    Role::Leader(sender)
                }
            }
        };

        match role {
            Role::Follower(mut receiver) => {
                counter!(metric::REFRESH_JOINED, "provider" => self.provider.slug()).increment(1);
                debug!(tenant_id = %tenant_id, "Joined in-flight token refresh");
                receiver.recv().await.unwrap_or_else(|_| {
                    Err(IntegrationError::network("in-flight token refresh was abandoned"))
                })
            }
            Role::Leader(sender) => {
                let in_flight = self.in_flight.clone();
                let guard = scopeguard::guard((), move |_| {
                    in_flight
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .remove(&tenant_id);
                });

                let outcome = self.lead_refresh(tenant_id, mode).await;

                {
                    let mut in_flight = self.lock_in_flight();
                    in_flight.remove(&tenant_id);
                    let _ = sender.send(outcome.clone());
                }
                scopeguard::ScopeGuard::into_inner(guard);

                outcome
            }
        }
    }

    #[instrument(skip_all, fields(tenant_id = %tenant_id, provider = self.provider.slug()))]
    async fn lead_refresh(&self, tenant_id: Uuid, mode: RefreshMode) -> RefreshOutcome {
        let config = self.connection_config(tenant_id).await?;
        let current = self
            .tokens
            .get(tenant_id)
            .await?
            .ok_or(IntegrationError::TokenExpired)?;

        let now = Utc::now();
        match &mode {
            RefreshMode::IfStale(margin) if current.is_fresh(*margin, now) => {
                debug!("Token was refreshed while waiting; skipping provider call");
                return Ok(current);
            }
            RefreshMode::Replacing(rejected) if &current.access_token != rejected => {
                debug!("Rejected token already replaced; skipping provider call");
                return Ok(current);
            }
            _ => {}
        }

        self.refresh_with(&config, current).await
    }

    async fn refresh_with(&self, config: &ConnectionConfig, current: TokenState) -> RefreshOutcome {
        let tenant_id = current.tenant_id;
        let provider = self.provider.slug();
        counter!(metric::REFRESH_ATTEMPTS, "provider" => provider).increment(1);
        let started = Instant::now();

        let result = timed(
            self.config.request_timeout(),
            self.provider.refresh(config, &current.refresh_token),
        )
        .await;
        histogram!(metric::REFRESH_DURATION, "provider" => provider)
            .record(started.elapsed().as_secs_f64());

        let grant = match result {
            Ok(grant) => grant,
            Err(err) if err.is_rejection() => {
                counter!(metric::REFRESH_FAILURES, "provider" => provider, "reason" => "rejected")
                    .increment(1);
                let cleared = self
                    .tokens
                    .clear_if_current(tenant_id, &current.refresh_token)
                    .await?;
                if cleared {
                    warn!(
                        error = %err,
                        phase = %ConnectionPhase::Disconnected,
                        "Refresh token rejected; tenant must re-authorize"
                    );
                    return Err(IntegrationError::TokenExpired);
                }
                warn!(error = %err, "Rejected refresh token was already rotated; keeping newer tokens");
                return Err(IntegrationError::AuthorizationError(
                    "refresh token was already rotated by a concurrent refresh".to_string(),
                ));
            }
            Err(err) => {
                let reason = if err.is_transient() { "transient" } else { "upstream" };
                counter!(metric::REFRESH_FAILURES, "provider" => provider, "reason" => reason)
                    .increment(1);
                warn!(error = %err, "Token refresh failed; keeping stored tokens");
                return Err(refresh_error(err));
            }
        };

        let now = Utc::now();
        let next = TokenState {
            tenant_id,
            access_token: grant.access_token.clone(),
            refresh_token: grant
                .refresh_token
                .clone()
                .unwrap_or_else(|| current.refresh_token.clone()),
            expires_at: expiry_of(&grant, now),
            last_sync: current.last_sync,
        };

        if !self
            .tokens
            .replace_if_current(&current.refresh_token, next.clone())
            .await?
        {
            counter!(metric::REFRESH_FAILURES, "provider" => provider, "reason" => "superseded")
                .increment(1);
            warn!("Stored tokens changed during refresh; discarding refreshed pair");
            return Err(IntegrationError::AuthorizationError(
                "refresh token was already rotated by a concurrent refresh".to_string(),
            ));
        }

        counter!(metric::REFRESH_SUCCESS, "provider" => provider).increment(1);
        info!(
            expires_at = %next.expires_at,
            duration_ms = started.elapsed().as_millis() as u64,
            "Token refreshed"
        );
        Ok(next)
    }
}

/// Runs a provider call under `limit`, folding an elapsed timer into [`ProviderError::Timeout`].
async fn timed<T>(
    limit: TokioDuration,
    call: impl Future<Output = Result<T, ProviderError>>,
) -> Result<T, ProviderError> {
    timeout(limit, call).await.unwrap_or(Err(ProviderError::Timeout))
}

fn expiry_of(grant: &TokenGrant, now: DateTime<Utc>) -> DateTime<Utc> {
    let lifetime = grant
        .expires_in
        .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS)
        .min(MAX_TOKEN_LIFETIME_SECS);
    now + Duration::seconds(lifetime as i64)
}

fn generate_state() -> String {
    let bytes: [u8; 32] = rand::thread_rng().r#gen();
    base64_url::encode(&bytes)
}

fn transient_error(err: &ProviderError) -> IntegrationError {
    IntegrationError::NetworkError {
        details: err.to_string(),
        retry_after: err.retry_after(),
    }
}

/// Failure of a code exchange.
fn exchange_error(err: ProviderError) -> IntegrationError {
    match err {
        ProviderError::Rejected { .. } | ProviderError::MalformedResponse { .. } => {
            IntegrationError::AuthorizationError(err.to_string())
        }
        ProviderError::Configuration { details } => IntegrationError::ConfigInvalid(details),
        ProviderError::Http { status, body } => IntegrationError::Upstream { status, body },
        ref transient => transient_error(transient),
    }
}

/// Failure of a refresh that did not reject the presented token.
fn refresh_error(err: ProviderError) -> IntegrationError {
    match err {
        ProviderError::Configuration { details } => IntegrationError::ConfigInvalid(details),
        ProviderError::Http { status, body } => IntegrationError::Upstream { status, body },
        ref other => transient_error(other),
    }
}
