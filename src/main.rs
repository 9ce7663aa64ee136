use std::process;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use advbroadcaster::advertisement::{credential_secret_name, AdvertisementBuilder, AdvertisementInputs};
use advbroadcaster::broadcaster::{
    create_shared_status, resolve_peering, ClientBootstrapper, ControlLoop, CredentialMinter,
    KubeConnector, RemoteSynchronizer, ServiceAccountMinter,
};
use advbroadcaster::cli::{format_dry_run, Args};
use advbroadcaster::cluster::{secret_reference, ResourceAccountant, Secret};
use advbroadcaster::config::{
    expand_path, load_or_default, spawn_config_reloader, validate_cluster_id, BroadcasterConfig,
};
use advbroadcaster::remote::kubeconfig::{ca_bundle, load_kubeconfig, local_config};
use advbroadcaster::remote::{KubeClusterSource, KubeResourceClient};
use advbroadcaster::server::{self, AppState};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = args.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    validate_cluster_id(&args.cluster_id)?;

    let config_path = args.config.as_deref().map(expand_path);
    let config = load_or_default(config_path.as_deref()).context("Failed to load configuration")?;
    let (config_tx, config_rx) = watch::channel(config.clone());

    // Local cluster
    let kube_config = local_config(args.kubeconfig.as_deref())
        .await
        .context("Failed to load local cluster configuration")?;
    let local_server = kube_config.cluster_url.to_string();
    let local_ca = ca_bundle(&kube_config);
    let local =
        kube::Client::try_from(kube_config).context("Failed to build local cluster client")?;
    let source = KubeClusterSource::new(local.clone());
    let accountant = ResourceAccountant::new(Arc::new(source.clone()));

    if args.dry_run {
        return dry_run(&args, &config, &accountant).await;
    }

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let status = create_shared_status();
    let state = AppState::new(args.cluster_id.clone(), status.clone(), config_rx.clone());
    let addr = args.status_addr;
    let server_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = server::serve(addr, state, server_cancel).await {
            error!("Status server error: {}", e);
        }
    });

    // Foreign cluster
    let foreign_override = args
        .foreign_kubeconfig
        .as_deref()
        .map(load_kubeconfig)
        .transpose()
        .context("Failed to load foreign kubeconfig override")?;
    let local_secrets = KubeResourceClient::<Secret>::new(local.clone());
    let peering = resolve_peering(&source, &local_secrets, &args.peering_request, foreign_override)
        .await
        .context("Failed to resolve the foreign cluster")?;
    info!(
        "Peering request {} resolved to foreign cluster {} (namespace {})",
        args.peering_request, peering.foreign_cluster_id, peering.namespace
    );

    let target = ClientBootstrapper::new(Arc::new(KubeConnector))
        .with_retry(config.timing.bootstrap_attempts, config.timing.bootstrap_pause())
        .connect(&peering.foreign_cluster_id, &peering.kubeconfig, &cancel)
        .await?;

    let minter = ServiceAccountMinter::new(
        local,
        args.service_account.clone(),
        args.namespace.clone(),
        args.api_server_config(&local_server),
        local_ca,
    )
    .with_token_ttl(config.timing.credential_ttl());

    // Fail fast on a missing service account or RBAC; every tick re-mints
    let credential = minter.mint(&args.cluster_id, &peering.namespace).await?;
    let synchronizer = Arc::new(RemoteSynchronizer::new(target, args.cluster_id.clone()));
    synchronizer
        .publish_credential(&credential)
        .await
        .context("Failed to publish the initial credential")?;

    if let Some(path) = config_path {
        spawn_config_reloader(path, config.timing.config_reload(), config_tx, cancel.clone());
    }

    ControlLoop::new(accountant, synchronizer, Arc::new(minter), peering.namespace, config_rx)
        .with_status(status)
        .run(cancel)
        .await;

    info!("Broadcaster stopped");
    Ok(())
}

async fn dry_run(
    args: &Args,
    config: &BroadcasterConfig,
    accountant: &ResourceAccountant,
) -> anyhow::Result<()> {
    let resources = accountant.account(&config.accounting_options()).await?;
    let inputs =
        AdvertisementInputs::from_resources(resources, &config.label_policies, &config.pricing);
    let secret_ref = secret_reference(&args.namespace, credential_secret_name(&args.cluster_id));
    let adv = AdvertisementBuilder::new(args.cluster_id.clone(), secret_ref)
        .with_ttl(config.timing.advertisement_ttl())
        .build(inputs, Utc::now());

    println!("{}", format_dry_run(&adv, None));
    Ok(())
}

/// Cancel on SIGINT or SIGTERM
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                        _ = term.recv() => info!("Received SIGTERM"),
                    }
                }
                Err(e) => {
                    warn!("Cannot listen for SIGTERM: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        cancel.cancel();
    });
}
