//! Startup: find the peer, connect to it, and mint the credential it needs
//!
//! ```text
//!   PeeringRequest ──► bootstrap secret ──► kubeconfig ──► connect (retry) ──► SyncTarget
//!   ServiceAccount ──► TokenRequest ──► kubeconfig ──► credential secret
//! ```
//!
//! Peering resolution and connection run once, and a failure there is fatal
//! for the process. Minting runs again on every tick so the credential held
//! by the foreign cluster never outlives its token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::api::PostParams;
use kube::config::Kubeconfig;
use kube::{Api, Client};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::advertisement::{credential_secret_name, Advertisement, KUBECONFIG_SECRET_KEY};
use crate::cluster::{new_secret, PeeringRequest, Secret, SecretExt};
use crate::config::ApiServerConfig;
use crate::remote::kube_client::{check_connection, store_error};
use crate::remote::kubeconfig::{
    client_from_kubeconfig, parse_kubeconfig, render_kubeconfig, token_kubeconfig,
};
use crate::remote::{
    ClientConfigError, KubeClusterSource, KubeResourceClient, ResourceClient, StoreError,
    SyncTarget,
};

/// Connection attempts before giving up
pub const DEFAULT_BOOTSTRAP_ATTEMPTS: u32 = 3;

/// Pause between connection attempts
pub const DEFAULT_BOOTSTRAP_PAUSE: Duration = Duration::from_secs(60);

/// Lifetime requested for minted service account tokens
pub const DEFAULT_CREDENTIAL_TTL: Duration = Duration::from_secs(3600);

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("Failed to read peering request '{name}': {source}")]
    PeeringRequest {
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("Bootstrap credential {namespace}/{name} unavailable: {reason}")]
    CredentialMissing {
        namespace: String,
        name: String,
        reason: String,
    },

    #[error("Invalid kubeconfig: {0}")]
    ClientConfig(#[from] ClientConfigError),

    #[error("Connection to foreign cluster failed: {0}")]
    Connect(StoreError),

    #[error("Could not connect to foreign cluster {foreign_cluster_id} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        foreign_cluster_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Failed to mint token for service account {service_account}: {source}")]
    Minting {
        service_account: String,
        #[source]
        source: StoreError,
    },

    #[error("Bootstrap cancelled")]
    Cancelled,
}

// ============================================================================
// SBIO: Traits for abstraction (allows mocking in tests)
// ============================================================================

/// Opens a connection to the foreign cluster described by a kubeconfig
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(
        &self,
        foreign_cluster_id: &str,
        kubeconfig: &Kubeconfig,
    ) -> Result<SyncTarget, BootstrapError>;
}

/// Looks up peering requests on the local cluster
#[async_trait]
pub trait PeeringDiscovery: Send + Sync {
    async fn peering_request(&self, name: &str) -> Result<PeeringRequest, StoreError>;
}

/// Produces the credential secret handed to the foreign cluster
#[async_trait]
pub trait CredentialMinter: Send + Sync {
    async fn mint(&self, home_cluster_id: &str, namespace: &str) -> Result<Secret, BootstrapError>;
}

// ============================================================================
// Connection with bounded retry
// ============================================================================

/// Connects to the foreign cluster, retrying a fixed number of times
pub struct ClientBootstrapper {
    connector: Arc<dyn RemoteConnector>,
    attempts: u32,
    pause: Duration,
}

impl ClientBootstrapper {
    pub fn new(connector: Arc<dyn RemoteConnector>) -> Self {
        Self {
            connector,
            attempts: DEFAULT_BOOTSTRAP_ATTEMPTS,
            pause: DEFAULT_BOOTSTRAP_PAUSE,
        }
    }

    pub fn with_retry(mut self, attempts: u32, pause: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.pause = pause;
        self
    }

    /// Try to connect up to the configured number of times
    ///
    /// The pause between attempts ends early on cancellation.
    pub async fn connect(
        &self,
        foreign_cluster_id: &str,
        kubeconfig: &Kubeconfig,
        cancel: &CancellationToken,
    ) -> Result<SyncTarget, BootstrapError> {
        let mut last_error = String::new();

        for attempt in 1..=self.attempts {
            match self.connector.connect(foreign_cluster_id, kubeconfig).await {
                Ok(target) => {
                    info!(
                        "Connected to foreign cluster {} (attempt {})",
                        foreign_cluster_id, attempt
                    );
                    return Ok(target);
                }
                Err(e) => {
                    warn!(
                        "connect failed for foreign cluster {} (attempt {}/{}): {}",
                        foreign_cluster_id, attempt, self.attempts, e
                    );
                    last_error = e.to_string();
                }
            }

            if attempt < self.attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(BootstrapError::Cancelled),
                    _ = tokio::time::sleep(self.pause) => {}
                }
            }
        }

        Err(BootstrapError::RetriesExhausted {
            foreign_cluster_id: foreign_cluster_id.to_string(),
            attempts: self.attempts,
            last_error,
        })
    }
}

/// Connects through the kube client and checks the server answers before
/// returning
pub struct KubeConnector;

#[async_trait]
impl RemoteConnector for KubeConnector {
    async fn connect(
        &self,
        foreign_cluster_id: &str,
        kubeconfig: &Kubeconfig,
    ) -> Result<SyncTarget, BootstrapError> {
        let client = client_from_kubeconfig(kubeconfig.clone()).await?;
        check_connection(&client).await.map_err(BootstrapError::Connect)?;

        Ok(SyncTarget::new(
            foreign_cluster_id,
            Arc::new(KubeResourceClient::<Advertisement>::new(client.clone())),
            Arc::new(KubeResourceClient::<Secret>::new(client)),
        ))
    }
}

// ============================================================================
// Peering resolution
// ============================================================================

/// What the peering request tells us about the foreign cluster
#[derive(Debug, Clone)]
pub struct PeeringInfo {
    pub foreign_cluster_id: String,
    /// Namespace on the foreign cluster holding our credential secret
    pub namespace: String,
    pub kubeconfig: Kubeconfig,
}

#[async_trait]
impl PeeringDiscovery for KubeClusterSource {
    async fn peering_request(&self, name: &str) -> Result<PeeringRequest, StoreError> {
        self.get_peering_request(name).await
    }
}

/// Resolve the foreign cluster from a peering request
///
/// The kubeconfig comes from the bootstrap secret the request points at,
/// unless `kubeconfig_override` is given (local debugging).
pub async fn resolve_peering(
    discovery: &dyn PeeringDiscovery,
    local_secrets: &dyn ResourceClient<Secret>,
    peering_request: &str,
    kubeconfig_override: Option<Kubeconfig>,
) -> Result<PeeringInfo, BootstrapError> {
    let request = discovery
        .peering_request(peering_request)
        .await
        .map_err(|source| BootstrapError::PeeringRequest {
            name: peering_request.to_string(),
            source,
        })?;

    let kubeconfig = match kubeconfig_override {
        Some(kubeconfig) => {
            info!("Using local kubeconfig override for foreign cluster {}", request.foreign_cluster_id());
            kubeconfig
        }
        None => read_bootstrap_kubeconfig(local_secrets, &request).await?,
    };

    Ok(PeeringInfo {
        foreign_cluster_id: request.foreign_cluster_id().to_string(),
        namespace: request.spec.namespace.clone(),
        kubeconfig,
    })
}

async fn read_bootstrap_kubeconfig(
    local_secrets: &dyn ResourceClient<Secret>,
    request: &PeeringRequest,
) -> Result<Kubeconfig, BootstrapError> {
    let secret_ref = &request.spec.kube_config_ref;
    let namespace = secret_ref.namespace.as_deref().unwrap_or_default();
    let name = secret_ref.name.as_deref().unwrap_or_default();
    let missing = |reason: String| BootstrapError::CredentialMissing {
        namespace: namespace.to_string(),
        name: name.to_string(),
        reason,
    };

    let secret = local_secrets
        .get(Some(namespace), name)
        .await
        .map_err(|e| missing(e.to_string()))?;
    let content = secret
        .data_string(KUBECONFIG_SECRET_KEY)
        .ok_or_else(|| missing(format!("no '{}' entry", KUBECONFIG_SECRET_KEY)))?;

    Ok(parse_kubeconfig(&content)?)
}

// ============================================================================
// Credential minting
// ============================================================================

/// Render the kubeconfig handed to the foreign cluster into its secret
///
/// The CA bundle is left out when the API server certificate is publicly
/// trusted.
pub fn render_credential(
    home_cluster_id: &str,
    namespace: &str,
    api_server: &ApiServerConfig,
    ca_data: Option<&str>,
    token: &str,
) -> Result<Secret, ClientConfigError> {
    let ca = if api_server.trusted_ca { None } else { ca_data };
    let kubeconfig = token_kubeconfig(home_cluster_id, &api_server.url(), ca, token, None)?;

    Ok(new_secret(namespace, credential_secret_name(home_cluster_id))
        .with_data(KUBECONFIG_SECRET_KEY, render_kubeconfig(&kubeconfig)?))
}

/// Mints a token for a local service account through the TokenRequest API
pub struct ServiceAccountMinter {
    client: Client,
    service_account: String,
    service_account_namespace: String,
    api_server: ApiServerConfig,
    ca_data: Option<String>,
    token_ttl: Duration,
}

impl ServiceAccountMinter {
    pub fn new(
        client: Client,
        service_account: impl Into<String>,
        service_account_namespace: impl Into<String>,
        api_server: ApiServerConfig,
        ca_data: Option<String>,
    ) -> Self {
        Self {
            client,
            service_account: service_account.into(),
            service_account_namespace: service_account_namespace.into(),
            api_server,
            ca_data,
            token_ttl: DEFAULT_CREDENTIAL_TTL,
        }
    }

    /// Requested token lifetime; the API server may shorten it
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    fn minting_error(&self, source: StoreError) -> BootstrapError {
        BootstrapError::Minting {
            service_account: self.service_account.clone(),
            source,
        }
    }
}

#[async_trait]
impl CredentialMinter for ServiceAccountMinter {
    async fn mint(&self, home_cluster_id: &str, namespace: &str) -> Result<Secret, BootstrapError> {
        let request = TokenRequest {
            spec: TokenRequestSpec {
                expiration_seconds: Some(self.token_ttl.as_secs() as i64),
                ..Default::default()
            },
            ..Default::default()
        };
        let body = serde_json::to_vec(&request)
            .map_err(|e| self.minting_error(StoreError::Decode(e.to_string())))?;

        let accounts: Api<ServiceAccount> =
            Api::namespaced(self.client.clone(), &self.service_account_namespace);
        let response: TokenRequest = accounts
            .create_subresource("token", &self.service_account, &PostParams::default(), body)
            .await
            .map_err(|e| {
                self.minting_error(store_error(e, "ServiceAccount", &self.service_account))
            })?;

        let token = response
            .status
            .map(|status| status.token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| self.minting_error(StoreError::Decode("empty token".to_string())))?;
        debug!(
            "Minted token for service account {}/{}",
            self.service_account_namespace, self.service_account
        );

        Ok(render_credential(
            home_cluster_id,
            namespace,
            &self.api_server,
            self.ca_data.as_deref(),
            &token,
        )?)
    }
}
