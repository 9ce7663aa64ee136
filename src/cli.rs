use clap::{ArgAction, Parser};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::advertisement::Advertisement;
use crate::config::ApiServerConfig;

#[derive(Parser, Debug)]
#[command(name = "advbroadcaster")]
#[command(about = "Publish this cluster's spare capacity as an Advertisement into a peer cluster")]
#[command(version)]
pub struct Args {
    /// Identity of this (home) cluster; names the published records
    #[arg(long, env = "CLUSTER_ID")]
    pub cluster_id: String,

    /// Peering request naming the foreign cluster to advertise to
    #[arg(long, env = "PEERING_REQUEST")]
    pub peering_request: String,

    /// Service account whose token is handed to the foreign cluster
    #[arg(long, env = "SERVICE_ACCOUNT", default_value = "broadcaster")]
    pub service_account: String,

    /// Namespace of the service account and the peering secrets
    #[arg(long, env = "POD_NAMESPACE", default_value = "liqo")]
    pub namespace: String,

    /// Kubeconfig for the local cluster (default: ~/.kube/config, then in-cluster)
    #[arg(long, env = "KUBECONFIG", value_name = "FILE")]
    pub kubeconfig: Option<String>,

    /// Use this kubeconfig for the foreign cluster instead of the peering secret
    #[arg(long, value_name = "FILE")]
    pub foreign_kubeconfig: Option<String>,

    /// YAML file with broadcaster settings
    #[arg(short, long, env = "BROADCASTER_CONFIG", value_name = "FILE")]
    pub config: Option<String>,

    /// Path to a .env file loaded before anything else
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// Address of the status server
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub status_addr: SocketAddr,

    /// API server address written into the credential for the foreign cluster
    #[arg(long, env = "APISERVER_ADDRESS")]
    pub apiserver_address: Option<String>,

    #[arg(long, env = "APISERVER_PORT", default_value = "6443")]
    pub apiserver_port: u16,

    /// The API server certificate is publicly trusted; omit the CA bundle
    #[arg(long, env = "APISERVER_TRUSTED")]
    pub apiserver_trusted: bool,

    /// Compute and print the advertisement without contacting the foreign cluster
    #[arg(long)]
    pub dry_run: bool,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

impl Args {
    /// Where the foreign cluster reaches us: the explicit address, or else
    /// the host of the local API server URL
    pub fn api_server_config(&self, local_server_url: &str) -> ApiServerConfig {
        let address = self
            .apiserver_address
            .clone()
            .unwrap_or_else(|| host_of(local_server_url).to_string());
        ApiServerConfig {
            address,
            port: self.apiserver_port,
            trusted_ca: self.apiserver_trusted,
        }
    }
}

/// Host part of a URL like `https://10.0.0.1:6443/`
fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let authority = rest.split('/').next().unwrap_or(rest);
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    }
}

/// Summary of the advertisement a dry run would publish
pub fn format_dry_run(adv: &Advertisement, foreign_cluster_id: Option<&str>) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "advbroadcaster v{} - Dry Run Mode\n\n",
        env!("CARGO_PKG_VERSION")
    ));
    output.push_str(&format!("Advertisement: {}\n", adv.name()));
    output.push_str(&format!(
        "Foreign cluster: {}\n\n",
        foreign_cluster_id.unwrap_or("(not resolved)")
    ));

    output.push_str("Available (resource quota):\n");
    for (class, quantity) in adv.availability() {
        output.push_str(&format!("  {:<20} {}\n", class, quantity));
    }

    output.push_str("Limits (limit range max):\n");
    match adv.limits() {
        Some(limits) if !limits.is_empty() => {
            for (class, quantity) in limits {
                output.push_str(&format!("  {:<20} {}\n", class, quantity));
            }
        }
        _ => output.push_str("  (none)\n"),
    }

    if !adv.spec.labels.is_empty() {
        output.push_str("Labels:\n");
        for (key, value) in &adv.spec.labels {
            output.push_str(&format!("  {}={}\n", key, value));
        }
    }

    output.push_str(&format!(
        "Neighbors: {}\nImages: {}\nExpires: {}\n",
        adv.spec.neighbors.len(),
        adv.spec.images.len(),
        adv.spec.time_to_live.to_rfc3339()
    ));
    output.push_str("\nRemove --dry-run to publish.\n");

    output
}
