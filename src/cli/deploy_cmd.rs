// Copyright 2024-2026 GG-DEPLOY Contributors
// SPDX-License-Identifier: Apache-2.0

//! `deploy`: smoke-run a manifest on an in-process cluster.
//!
//! Deploys with the identity backend, optionally feeds hex payloads into
//! root inputs and fetches one result per root output, prints the
//! deployment record and a metrics snapshot, then undeploys. An interrupt
//! during the exchange still undeploys.

use std::path::Path;
use std::sync::Arc;

use crate::config::DeployConfig;
use crate::daemon::CommLibrary;
use crate::deployer::{DeployedModel, LocalCluster, MasterModelDeployer, QueueFabric};
use crate::executor::IdentityBackend;
use crate::planner::DeploymentManifest;
use crate::telemetry;

/// `name=hex` pairs from `--feed` arguments.
pub fn parse_feeds(args: &[String]) -> Result<Vec<(String, Vec<u8>)>, String> {
    let mut feeds = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg != "--feed" {
            continue;
        }
        let spec = iter.next().ok_or("--feed needs name=hex")?;
        let (name, payload) = spec.split_once('=').ok_or_else(|| format!("bad feed {spec}: expected name=hex"))?;
        let bytes = hex::decode(payload).map_err(|e| format!("bad feed {spec}: {e}"))?;
        feeds.push((name.to_string(), bytes));
    }
    Ok(feeds)
}

/// Returns the exit code.
pub async fn run_deploy(manifest_path: &Path, feeds: Vec<(String, Vec<u8>)>, config: &DeployConfig) -> i32 {
    match deploy(manifest_path, feeds, config).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Deploy failed: {}", e);
            1
        }
    }
}

async fn deploy(
    manifest_path: &Path,
    feeds: Vec<(String, Vec<u8>)>,
    config: &DeployConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let manifest = DeploymentManifest::from_file(manifest_path)?;
    let models = manifest.load_submodels(&super::base_dir(manifest_path))?;

    let cluster = Arc::new(LocalCluster::start(
        &manifest.devices,
        Arc::new(IdentityBackend),
        CommLibrary::new(),
        config.cluster_config(),
    )?);
    println!("Cluster on {} with {} device(s)", cluster.host_name(), cluster.devices().len());
    let deployer = MasterModelDeployer::new(
        Arc::clone(&cluster) as Arc<dyn QueueFabric>,
        cluster.clients()?,
        config.deployer_config(),
    );

    let deployed = deployer.deploy(&models, manifest.relation.as_ref()).await?;
    println!("{}", serde_json::to_string_pretty(&deployed)?);

    let exchanged = if feeds.is_empty() {
        Ok(())
    } else {
        let cluster = Arc::clone(&cluster);
        let record = deployed.clone();
        let task = tokio::task::spawn_blocking(move || exchange(&cluster, &record, &feeds));
        // Ctrl-C still undeploys before exiting.
        tokio::select! {
            joined = task => joined?,
            _ = tokio::signal::ctrl_c() => Err("interrupted".into()),
        }
    };

    deployer.undeploy(deployed.root_model_id).await?;
    println!("{}", serde_json::to_string_pretty(&telemetry::global_store().snapshot())?);
    exchanged
}

fn exchange(
    cluster: &LocalCluster,
    deployed: &DeployedModel,
    feeds: &[(String, Vec<u8>)],
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    for (name, bytes) in feeds {
        cluster.feed(deployed, name, bytes)?;
    }
    for name in deployed.output_names() {
        let bytes = cluster.fetch(deployed, name)?;
        println!("{} = {}", name, hex::encode(bytes));
    }
    Ok(())
}
