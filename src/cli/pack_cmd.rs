// Copyright 2024-2026 GG-DEPLOY Contributors
// SPDX-License-Identifier: Apache-2.0

//! `pack`: write a model container from a JSON description.
//!
//! ```json
//! { "models": [ { "model": { "name": "m", "inputs": [], "outputs": [] },
//!                 "weights": "00ff", "tasks": [],
//!                 "tbe_kernels": { "k0": "c0de" } } ] }
//! ```
//! Byte fields are hex.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::format::{serialize_models, CompiledModel, KernelStore, ModelDef, TaskDef};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackSpec {
    pub models: Vec<PackModel>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackModel {
    pub model: ModelDef,
    #[serde(default)]
    pub weights: String,
    #[serde(default)]
    pub tasks: Vec<TaskDef>,
    #[serde(default)]
    pub tbe_kernels: BTreeMap<String, String>,
    #[serde(default)]
    pub cust_kernels: BTreeMap<String, String>,
}

fn kernels(named: &BTreeMap<String, String>) -> Result<KernelStore, hex::FromHexError> {
    let mut store = KernelStore::default();
    for (name, bin) in named {
        store.insert(name.clone(), hex::decode(bin)?);
    }
    Ok(store)
}

impl PackModel {
    pub fn compile(&self) -> Result<CompiledModel, hex::FromHexError> {
        let mut model = CompiledModel::new(self.model.clone());
        model.weights = hex::decode(&self.weights)?;
        model.tasks = self.tasks.clone();
        model.tbe_kernels = kernels(&self.tbe_kernels)?;
        model.cust_kernels = kernels(&self.cust_kernels)?;
        Ok(model)
    }
}

/// Serialize a pack description into container bytes.
pub fn pack(spec: &PackSpec) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    if spec.models.is_empty() {
        return Err("pack description has no models".into());
    }
    let models = spec
        .models
        .iter()
        .map(PackModel::compile)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(serialize_models(&models))
}

/// Returns the exit code.
pub fn run_pack(spec_path: &Path, out_path: &Path) -> i32 {
    let result = std::fs::read_to_string(spec_path)
        .map_err(Box::<dyn std::error::Error>::from)
        .and_then(|text| Ok(serde_json::from_str::<PackSpec>(&text)?))
        .and_then(|spec| pack(&spec))
        .and_then(|bytes| {
            std::fs::write(out_path, &bytes)?;
            Ok(bytes.len())
        });
    match result {
        Ok(size) => {
            println!("Wrote {} ({} bytes)", out_path.display(), size);
            0
        }
        Err(e) => {
            eprintln!("Pack failed: {}", e);
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::inspect_cmd::parse_chunked;

    #[test]
    fn packed_models_parse_back() {
        let spec: PackSpec = serde_json::from_str(
            r#"{"models": [
                {"model": {"name": "a", "inputs": [], "outputs": []}, "weights": "0102",
                 "cust_kernels": {"k": "ff"}},
                {"model": {"name": "b", "inputs": [], "outputs": []}}
            ]}"#,
        )
        .unwrap();
        let bytes = pack(&spec).unwrap();
        let root = parse_chunked(&bytes, 7).unwrap();
        assert_eq!(root.root.name(), "a");
        assert_eq!(root.root.weights, vec![1, 2]);
        assert_eq!(root.root.cust_kernels.get("k"), Some(&[0xff][..]));
        assert!(root.submodels.contains_key("b"));
    }

    #[test]
    fn bad_hex_is_rejected() {
        let spec: PackSpec =
            serde_json::from_str(r#"{"models": [{"model": {"name": "a", "inputs": [], "outputs": []}, "weights": "zz"}]}"#)
                .unwrap();
        assert!(pack(&spec).is_err());
    }
}
