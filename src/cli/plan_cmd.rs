// Copyright 2024-2026 GG-DEPLOY Contributors
// SPDX-License-Identifier: Apache-2.0

//! `plan`: build and print the deploy plan for a manifest.

use std::path::Path;

use crate::config::DeployConfig;
use crate::planner::{DeployPlan, DeployPlanner, DeploymentManifest};

/// Returns the exit code.
pub fn run_plan(manifest_path: &Path, json: bool, config: &DeployConfig) -> i32 {
    match build(manifest_path, config) {
        Ok(plan) => {
            if json {
                match serde_json::to_string_pretty(&plan) {
                    Ok(text) => println!("{}", text),
                    Err(e) => {
                        eprintln!("Failed to render plan: {}", e);
                        return 1;
                    }
                }
            } else {
                print_plan(&plan);
            }
            0
        }
        Err(e) => {
            eprintln!("Plan failed: {}", e);
            1
        }
    }
}

fn build(manifest_path: &Path, config: &DeployConfig) -> Result<DeployPlan, Box<dyn std::error::Error>> {
    let manifest = DeploymentManifest::from_file(manifest_path)?;
    let models = manifest.load_submodels(&super::base_dir(manifest_path))?;
    let planner = DeployPlanner::new().with_default_queue_depth(config.default_queue_depth);
    Ok(planner.build_plan(&models, manifest.relation.as_ref(), &manifest.devices)?)
}

fn print_plan(plan: &DeployPlan) {
    println!("Queues ({}):", plan.queue_count());
    for (i, queue) in plan.queues().iter().enumerate() {
        let placement = queue
            .placement
            .map(|d| d.to_string())
            .unwrap_or_else(|| "host".to_string());
        println!("  [{:>3}] {:<32} depth={:<5} on {}", i, queue.name, queue.depth, placement);
    }
    println!("Bindings ({}):", plan.bindings().len());
    for binding in plan.bindings() {
        println!(
            "  {} -> {}",
            plan.queues()[binding.src_index].name,
            plan.queues()[binding.dst_index].name
        );
    }
    println!("Submodels ({}):", plan.submodels().len());
    for (name, info) in plan.submodels() {
        println!(
            "  {} on {} ({} bytes, sha256 {}) in={:?} out={:?} ctrl={:?}",
            name,
            info.device,
            info.artifact_size,
            &info.artifact_digest[..info.artifact_digest.len().min(12)],
            info.input_queue_indices,
            info.output_queue_indices,
            info.control_input_queue_indices
        );
    }
    println!(
        "Root: inputs={:?} outputs={:?} controls={:?}",
        plan.root_input_indices(),
        plan.root_output_indices(),
        plan.root_control_input_indices()
    );
}
