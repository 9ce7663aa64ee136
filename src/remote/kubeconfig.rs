//! Kubeconfig handling on top of `kube::config`
//!
//! Kubeconfigs are read when connecting to either cluster and rendered when
//! minting the credential handed to the foreign cluster. The local
//! connection falls back to `kube`'s inference chain (`$KUBECONFIG`,
//! `~/.kube/config`, then the in-cluster service account).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use kube::config::{Config, KubeConfigOptions, Kubeconfig};
use kube::Client;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientConfigError {
    #[error("Failed to load kubeconfig: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("Failed to infer cluster configuration: {0}")]
    Infer(#[from] kube::config::InferConfigError),

    #[error("Failed to render kubeconfig: {0}")]
    Render(String),

    #[error("Failed to build client: {0}")]
    Client(#[from] kube::Error),
}

/// Read a kubeconfig file; `~` and environment variables are expanded
pub fn load_kubeconfig(path: &str) -> Result<Kubeconfig, ClientConfigError> {
    let expanded = shellexpand::full(path)
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| path.to_string());
    Ok(Kubeconfig::read_from(expanded)?)
}

pub fn parse_kubeconfig(content: &str) -> Result<Kubeconfig, ClientConfigError> {
    Ok(Kubeconfig::from_yaml(content)?)
}

pub fn render_kubeconfig(kubeconfig: &Kubeconfig) -> Result<String, ClientConfigError> {
    serde_yaml::to_string(kubeconfig).map_err(|e| ClientConfigError::Render(e.to_string()))
}

/// Single-context kubeconfig authenticating with a bearer token
pub fn token_kubeconfig(
    name: &str,
    server: &str,
    ca_data: Option<&str>,
    token: &str,
    namespace: Option<&str>,
) -> Result<Kubeconfig, ClientConfigError> {
    let mut cluster = json!({ "server": server });
    if let Some(ca) = ca_data {
        cluster["certificate-authority-data"] = json!(ca);
    }

    let mut context = json!({ "cluster": name, "user": name });
    if let Some(namespace) = namespace {
        context["namespace"] = json!(namespace);
    }

    let document = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": name, "cluster": cluster }],
        "users": [{ "name": name, "user": { "token": token } }],
        "contexts": [{ "name": name, "context": context }],
        "current-context": name,
    });
    serde_json::from_value(document).map_err(|e| ClientConfigError::Render(e.to_string()))
}

/// Client for the kubeconfig's current context
pub async fn client_from_kubeconfig(kubeconfig: Kubeconfig) -> Result<Client, ClientConfigError> {
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
    Ok(Client::try_from(config)?)
}

/// Configuration for the local cluster: an explicit kubeconfig when given,
/// otherwise whatever `kube` infers from the environment
pub async fn local_config(path: Option<&str>) -> Result<Config, ClientConfigError> {
    match path {
        Some(path) => {
            let kubeconfig = load_kubeconfig(path)?;
            Ok(Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?)
        }
        None => Ok(Config::infer().await?),
    }
}

/// The configuration's trusted roots as base64 PEM, the form kubeconfigs
/// carry in `certificate-authority-data`
pub fn ca_bundle(config: &Config) -> Option<String> {
    let certs = config.root_cert.as_ref().filter(|certs| !certs.is_empty())?;

    let mut pem = String::new();
    for der in certs {
        let encoded = BASE64.encode(der);
        pem.push_str("-----BEGIN CERTIFICATE-----\n");
        for line in encoded.as_bytes().chunks(64) {
            pem.push_str(&String::from_utf8_lossy(line));
            pem.push('\n');
        }
        pem.push_str("-----END CERTIFICATE-----\n");
    }
    Some(BASE64.encode(pem))
}
