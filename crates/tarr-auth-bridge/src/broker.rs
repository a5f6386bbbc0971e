use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oauth2::basic::{BasicClient, BasicTokenResponse};
use oauth2::{
    ClientId, DeviceAuthorizationUrl, EndpointNotSet, EndpointSet, RefreshToken, Scope,
    StandardDeviceAuthorizationResponse, TokenResponse, TokenUrl,
};
use reqwest::redirect::Policy;
use reqwest::Client;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::store::{CredentialStore, TokenCache};
use crate::{AuthError, TokenSource};

pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// Scope that makes the authority issue a refresh token.
const OFFLINE_ACCESS: &str = "offline_access";

/// Access tokens this close to expiry are treated as expired.
const EXPIRY_SKEW_SECS: i64 = 60;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub tenant_id: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub authority_host: String,
    /// Bounds on each call to the authority. Device-code polling is a
    /// series of such calls, so the overall wait is set by the code lifetime.
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl BrokerSettings {
    pub fn new(tenant_id: &str, client_id: &str, scopes: Vec<String>) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            client_id: client_id.to_string(),
            scopes,
            authority_host: DEFAULT_AUTHORITY_HOST.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_authority_host(mut self, host: &str) -> Self {
        self.authority_host = host.to_string();
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, request: Duration) -> Self {
        self.connect_timeout = connect;
        self.request_timeout = request;
        self
    }

    fn authority(&self) -> String {
        format!("{}/{}", self.authority_host.trim_end_matches('/'), self.tenant_id)
    }

    pub fn device_code_url(&self) -> String {
        format!("{}/oauth2/v2.0/devicecode", self.authority())
    }

    pub fn token_url(&self) -> String {
        format!("{}/oauth2/v2.0/token", self.authority())
    }

    /// Configured scopes plus `offline_access`, without duplicates.
    pub fn requested_scopes(&self) -> Vec<String> {
        let mut scopes: Vec<String> = Vec::with_capacity(self.scopes.len() + 1);
        for scope in self.scopes.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            if !scopes.iter().any(|s| s == scope) {
                scopes.push(scope.to_string());
            }
        }
        if !scopes.iter().any(|s| s.eq_ignore_ascii_case(OFFLINE_ACCESS)) {
            scopes.push(OFFLINE_ACCESS.to_string());
        }
        scopes
    }
}

/// What the operator needs to complete a device-code login.
#[derive(Debug, Clone)]
pub struct DevicePrompt {
    pub verification_uri: String,
    pub user_code: String,
    pub expires_in: Duration,
}

/// Displays the device-code prompt to the operator.
pub trait DeviceCodeNotifier: Send + Sync {
    fn notify(&self, prompt: &DevicePrompt);
}

/// Writes the prompt to stderr.
pub struct StderrNotifier;

impl DeviceCodeNotifier for StderrNotifier {
    fn notify(&self, prompt: &DevicePrompt) {
        eprintln!(
            "[GRAPH] Visit {} and enter code: {}",
            prompt.verification_uri, prompt.user_code
        );
    }
}

#[derive(Debug, Clone)]
struct AccessToken {
    secret: String,
    expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - chrono::Duration::seconds(EXPIRY_SKEW_SECS) > now,
            None => true,
        }
    }
}

struct BrokerState {
    cache: TokenCache,
    access: Option<AccessToken>,
    state_changed: bool,
}

type DeviceClient =
    BasicClient<EndpointNotSet, EndpointSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Hands out bearer tokens for one tenant/client pair.
///
/// The cache is read once here and written back only when a grant changed
/// it. Two processes sharing one cache path will overwrite each other.
pub struct CredentialBroker {
    settings: BrokerSettings,
    store: CredentialStore,
    http_client: Client,
    notifier: Arc<dyn DeviceCodeNotifier>,
    state: Mutex<BrokerState>,
}

impl CredentialBroker {
    pub fn new(settings: BrokerSettings, store: CredentialStore) -> Result<Self, AuthError> {
        let cache = match store.load()? {
            Some(cache) if cache.is_bound_to(&settings.tenant_id, &settings.client_id) => cache,
            Some(_) => {
                warn!(
                    path = %store.path().display(),
                    "credential cache belongs to a different tenant or client, ignoring it"
                );
                TokenCache::new(&settings.tenant_id, &settings.client_id)
            }
            None => TokenCache::new(&settings.tenant_id, &settings.client_id),
        };

        // The oauth2 crate requires a client that does not follow redirects.
        let http_client = Client::builder()
            .redirect(Policy::none())
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| AuthError::Config(format!("http client: {e}")))?;

        Ok(Self {
            settings,
            store,
            http_client,
            notifier: Arc::new(StderrNotifier),
            state: Mutex::new(BrokerState {
                cache,
                access: None,
                state_changed: false,
            }),
        })
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn DeviceCodeNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Whether a refresh token is available for silent reuse.
    pub async fn has_cached_credential(&self) -> bool {
        self.state.lock().await.cache.refresh_token.is_some()
    }

    /// Bearer token: in-memory token, then refresh grant, then device code.
    pub async fn acquire(&self) -> Result<String, AuthError> {
        let mut state = self.state.lock().await;
        self.acquire_locked(&mut state).await
    }

    /// Drop the in-memory access token and acquire a new one.
    pub async fn force_refresh(&self) -> Result<String, AuthError> {
        let mut state = self.state.lock().await;
        state.access = None;
        self.acquire_locked(&mut state).await
    }

    async fn acquire_locked(&self, state: &mut BrokerState) -> Result<String, AuthError> {
        if let Some(access) = state.access.as_ref() {
            if access.is_fresh(Utc::now()) {
                return Ok(access.secret.clone());
            }
            debug!("access token expired");
        }

        let client = self.build_client()?;
        let token = match self.try_silent(&client, state).await {
            Some(token) => token,
            None => self.device_flow(&client).await?,
        };

        let secret = self.absorb(state, &token)?;
        self.persist_if_changed(state)?;
        Ok(secret)
    }

    async fn try_silent(
        &self,
        client: &DeviceClient,
        state: &mut BrokerState,
    ) -> Option<BasicTokenResponse> {
        let refresh_token = state.cache.refresh_token.clone()?;
        let result = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token))
            .add_scopes(self.scopes())
            .request_async(&self.http_client)
            .await;

        match result {
            Ok(token) => {
                debug!(tenant = %self.settings.tenant_id, "refreshed access token silently");
                Some(token)
            }
            Err(err) => {
                warn!(error = %err, "silent token refresh failed, falling back to device code");
                state.cache.refresh_token = None;
                state.state_changed = true;
                None
            }
        }
    }

    async fn device_flow(&self, client: &DeviceClient) -> Result<BasicTokenResponse, AuthError> {
        let details: StandardDeviceAuthorizationResponse = client
            .exchange_device_code()
            .add_scopes(self.scopes())
            .request_async(&self.http_client)
            .await
            .map_err(|e| AuthError::DeviceFlowStart(e.to_string()))?;

        let prompt = DevicePrompt {
            verification_uri: details.verification_uri().to_string(),
            user_code: details.user_code().secret().to_string(),
            expires_in: details.expires_in(),
        };
        info!(
            verification_uri = %prompt.verification_uri,
            expires_in_secs = prompt.expires_in.as_secs(),
            "waiting for device code authorization"
        );
        self.notifier.notify(&prompt);

        let token = client
            .exchange_device_access_token(&details)
            .request_async(&self.http_client, tokio::time::sleep, None)
            .await
            .map_err(|e| AuthError::DeviceGrant(e.to_string()))?;

        info!(tenant = %self.settings.tenant_id, "device code authorization complete");
        Ok(token)
    }

    fn absorb(&self, state: &mut BrokerState, token: &BasicTokenResponse) -> Result<String, AuthError> {
        let secret = token.access_token().secret().to_string();
        if secret.is_empty() {
            return Err(AuthError::MissingAccessToken);
        }

        let expires_at = token
            .expires_in()
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| Utc::now() + d);

        if let Some(refresh) = token.refresh_token() {
            if state.cache.refresh_token.as_deref() != Some(refresh.secret().as_str()) {
                state.cache.refresh_token = Some(refresh.secret().to_string());
                state.state_changed = true;
            }
        }

        let scopes = self.settings.requested_scopes();
        if state.cache.scopes != scopes {
            state.cache.scopes = scopes;
            state.state_changed = true;
        }

        state.access = Some(AccessToken {
            secret: secret.clone(),
            expires_at,
        });
        Ok(secret)
    }

    fn persist_if_changed(&self, state: &mut BrokerState) -> Result<(), AuthError> {
        if !state.state_changed {
            return Ok(());
        }
        state.cache.updated_at = Some(Utc::now());
        self.store.save(&state.cache)?;
        state.state_changed = false;
        Ok(())
    }

    fn scopes(&self) -> Vec<Scope> {
        self.settings
            .requested_scopes()
            .into_iter()
            .map(Scope::new)
            .collect()
    }

    fn build_client(&self) -> Result<DeviceClient, AuthError> {
        let device_url = DeviceAuthorizationUrl::new(self.settings.device_code_url())
            .map_err(|e| AuthError::Config(format!("device code url: {e}")))?;
        let token_url = TokenUrl::new(self.settings.token_url())
            .map_err(|e| AuthError::Config(format!("token url: {e}")))?;
        Ok(BasicClient::new(ClientId::new(self.settings.client_id.clone()))
            .set_device_authorization_url(device_url)
            .set_token_uri(token_url))
    }
}

#[async_trait]
impl TokenSource for CredentialBroker {
    async fn token(&self) -> Result<String, AuthError> {
        self.acquire().await
    }

    async fn refresh(&self) -> Result<String, AuthError> {
        self.force_refresh().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingNotifier {
        prompts: std::sync::Mutex<Vec<DevicePrompt>>,
    }

    impl DeviceCodeNotifier for RecordingNotifier {
        fn notify(&self, prompt: &DevicePrompt) {
            self.prompts.lock().unwrap().push(prompt.clone());
        }
    }

    fn settings(server: &MockServer) -> BrokerSettings {
        BrokerSettings::new("tenant-x", "client-x", vec!["ChannelMessage.Read.All".to_string()])
            .with_authority_host(&server.base_url())
    }

    fn seeded_store(dir: &TempDir, refresh_token: &str) -> CredentialStore {
        let store = CredentialStore::new(dir.path().join("cache.json"));
        let cache = TokenCache {
            refresh_token: Some(refresh_token.to_string()),
            ..TokenCache::new("tenant-x", "client-x")
        };
        store.save(&cache).unwrap();
        store
    }

    #[test]
    fn test_requested_scopes_adds_offline_access_once() {
        let settings = BrokerSettings::new(
            "t",
            "c",
            vec![
                "ChannelMessage.Read.All".to_string(),
                " ChannelMessage.Read.All ".to_string(),
                "".to_string(),
            ],
        );
        assert_eq!(
            settings.requested_scopes(),
            vec!["ChannelMessage.Read.All".to_string(), "offline_access".to_string()]
        );

        let with_offline = BrokerSettings::new("t", "c", vec!["offline_access".to_string()]);
        assert_eq!(with_offline.requested_scopes(), vec!["offline_access".to_string()]);
    }

    #[test]
    fn test_authority_urls() {
        let settings = BrokerSettings::new("contoso", "c", vec![])
            .with_authority_host("https://login.example.com/");
        assert_eq!(
            settings.device_code_url(),
            "https://login.example.com/contoso/oauth2/v2.0/devicecode"
        );
        assert_eq!(
            settings.token_url(),
            "https://login.example.com/contoso/oauth2/v2.0/token"
        );
    }

    #[test]
    fn test_access_token_freshness() {
        let now = Utc::now();
        let fresh = AccessToken {
            secret: "a".to_string(),
            expires_at: Some(now + chrono::Duration::minutes(10)),
        };
        let nearly_expired = AccessToken {
            secret: "a".to_string(),
            expires_at: Some(now + chrono::Duration::seconds(30)),
        };
        assert!(fresh.is_fresh(now));
        assert!(!nearly_expired.is_fresh(now));
    }

    #[tokio::test]
    async fn test_silent_refresh_reuses_cache_and_persists_rotation() {
        let server = MockServer::start();
        let token = server.mock(|when, then| {
            when.method(POST).path("/tenant-x/oauth2/v2.0/token");
            then.status(200).json_body(json!({
                "access_token": "access-1",
                "token_type": "Bearer",
                "expires_in": 3600,
                "refresh_token": "refresh-2"
            }));
        });
        let device = server.mock(|when, then| {
            when.method(POST).path("/tenant-x/oauth2/v2.0/devicecode");
            then.status(500);
        });

        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir, "refresh-1");
        let broker = CredentialBroker::new(settings(&server), store.clone()).unwrap();

        assert_eq!(broker.acquire().await.unwrap(), "access-1");
        assert_eq!(broker.acquire().await.unwrap(), "access-1");
        assert_eq!(token.calls(), 1);
        assert_eq!(device.calls(), 0);

        let saved = store.load().unwrap().unwrap();
        assert_eq!(saved.refresh_token.as_deref(), Some("refresh-2"));
        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(!raw.contains("access-1"));
    }

    #[tokio::test]
    async fn test_force_refresh_discards_in_memory_token() {
        let server = MockServer::start();
        let token = server.mock(|when, then| {
            when.method(POST).path("/tenant-x/oauth2/v2.0/token");
            then.status(200).json_body(json!({
                "access_token": "access-1",
                "token_type": "Bearer",
                "expires_in": 3600
            }));
        });

        let dir = TempDir::new().unwrap();
        let broker = CredentialBroker::new(settings(&server), seeded_store(&dir, "refresh-1")).unwrap();

        broker.acquire().await.unwrap();
        broker.force_refresh().await.unwrap();
        assert_eq!(token.calls(), 2);
    }

    #[tokio::test]
    async fn test_device_code_flow_on_cache_miss() {
        let server = MockServer::start();
        let device = server.mock(|when, then| {
            when.method(POST).path("/tenant-x/oauth2/v2.0/devicecode");
            then.status(200).json_body(json!({
                "device_code": "device-123",
                "user_code": "ABCD-EFGH",
                "verification_uri": "https://microsoft.com/devicelogin",
                "expires_in": 900,
                "interval": 0
            }));
        });
        let token = server.mock(|when, then| {
            when.method(POST).path("/tenant-x/oauth2/v2.0/token");
            then.status(200).json_body(json!({
                "access_token": "access-device",
                "token_type": "Bearer",
                "expires_in": 3600,
                "refresh_token": "refresh-device"
            }));
        });

        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("auth").join("cache.json"));
        let notifier = Arc::new(RecordingNotifier::default());
        let broker = CredentialBroker::new(settings(&server), store.clone())
            .unwrap()
            .with_notifier(notifier.clone());

        assert!(!broker.has_cached_credential().await);
        assert_eq!(broker.acquire().await.unwrap(), "access-device");
        assert_eq!(device.calls(), 1);
        assert_eq!(token.calls(), 1);

        let prompts = notifier.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].user_code, "ABCD-EFGH");

        let saved = store.load().unwrap().unwrap();
        assert_eq!(saved.refresh_token.as_deref(), Some("refresh-device"));
        assert!(saved.scopes.contains(&"offline_access".to_string()));
    }

    #[tokio::test]
    async fn test_device_flow_start_failure_is_auth_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/tenant-x/oauth2/v2.0/devicecode");
            then.status(400).json_body(json!({
                "error": "invalid_client",
                "error_description": "unknown client"
            }));
        });

        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("cache.json"));
        let broker = CredentialBroker::new(settings(&server), store.clone()).unwrap();

        let err = broker.acquire().await.unwrap_err();
        assert!(matches!(err, AuthError::DeviceFlowStart(_)));
        assert!(store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hanging_authority_is_bounded_by_request_timeout() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/tenant-x/oauth2/v2.0/devicecode");
            then.status(200).delay(Duration::from_secs(10)).json_body(json!({
                "device_code": "device-123",
                "user_code": "ABCD-EFGH",
                "verification_uri": "https://microsoft.com/devicelogin",
                "expires_in": 900,
                "interval": 0
            }));
        });

        let dir = TempDir::new().unwrap();
        let settings = settings(&server).with_timeouts(Duration::from_secs(2), Duration::from_millis(200));
        let broker = CredentialBroker::new(settings, CredentialStore::new(dir.path().join("cache.json"))).unwrap();

        let started = std::time::Instant::now();
        let err = broker.acquire().await.unwrap_err();
        assert!(matches!(err, AuthError::DeviceFlowStart(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_default_timeouts() {
        let settings = BrokerSettings::new("t", "c", vec![]);
        assert_eq!(settings.connect_timeout, Duration::from_secs(10));
        assert_eq!(settings.request_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_cache_for_other_client_is_ignored() {
        let server = MockServer::start();
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("cache.json"));
        let foreign = TokenCache {
            refresh_token: Some("foreign".to_string()),
            ..TokenCache::new("tenant-x", "someone-else")
        };
        store.save(&foreign).unwrap();

        let broker = CredentialBroker::new(settings(&server), store).unwrap();
        assert!(!broker.has_cached_credential().await);
    }
}
