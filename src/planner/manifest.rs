//! Deployment manifest: a JSON file naming submodel artifacts, their
//! relation, and the target devices.
//!
//! Artifact paths are resolved relative to the manifest's directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::device::DeviceInfo;
use super::relation::ModelRelation;
use super::submodel::{Artifact, Submodel};

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid manifest JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to open artifact {path} for submodel {model}: {source}")]
    Artifact {
        model: String,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid manifest: {0}")]
    Invalid(String),
}

/// One submodel entry; `submodels` + `relation` make it a nested flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmodelSpec {
    pub name: String,
    /// Artifact file. Flow entries with nested submodels may omit it.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub submodels: Vec<SubmodelSpec>,
    #[serde(default)]
    pub relation: Option<ModelRelation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentManifest {
    pub models: Vec<SubmodelSpec>,
    #[serde(default)]
    pub relation: Option<ModelRelation>,
    #[serde(default = "default_devices")]
    pub devices: Vec<DeviceInfo>,
}

fn default_devices() -> Vec<DeviceInfo> {
    vec![DeviceInfo::new(0, 0, 0)]
}

impl DeploymentManifest {
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        let manifest: Self = serde_json::from_str(json)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Structural checks that do not need the artifacts.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.models.is_empty() {
            return Err(ManifestError::Invalid("models cannot be empty".into()));
        }
        if self.devices.is_empty() {
            return Err(ManifestError::Invalid("devices cannot be empty".into()));
        }
        let mut pending: Vec<&SubmodelSpec> = self.models.iter().collect();
        while let Some(spec) = pending.pop() {
            if spec.name.is_empty() {
                return Err(ManifestError::Invalid("submodel name cannot be empty".into()));
            }
            if spec.submodels.is_empty() && spec.path.is_none() {
                return Err(ManifestError::Invalid(format!(
                    "submodel {} needs a path or nested submodels",
                    spec.name
                )));
            }
            if !spec.submodels.is_empty() && spec.relation.is_none() {
                return Err(ManifestError::Invalid(format!(
                    "submodel {} has nested submodels but no relation",
                    spec.name
                )));
            }
            pending.extend(&spec.submodels);
        }
        Ok(())
    }

    /// Open every artifact and build the planner inputs.
    pub fn load_submodels(&self, base_dir: &Path) -> Result<Vec<Submodel>, ManifestError> {
        self.models.iter().map(|spec| load_spec(spec, base_dir)).collect()
    }
}

fn load_spec(spec: &SubmodelSpec, base_dir: &Path) -> Result<Submodel, ManifestError> {
    let artifact = match &spec.path {
        Some(path) => {
            let full = base_dir.join(path);
            Artifact::open(&full).map_err(|source| ManifestError::Artifact {
                model: spec.name.clone(),
                path: full,
                source,
            })?
        }
        None => Artifact::from_bytes(Vec::new()),
    };

    let inputs: Vec<&str> = spec.inputs.iter().map(String::as_str).collect();
    let outputs: Vec<&str> = spec.outputs.iter().map(String::as_str).collect();
    let mut model = Submodel::new(spec.name.clone(), artifact).with_boundary(&inputs, &outputs);

    if let Some(relation) = &spec.relation {
        if spec.submodels.is_empty() {
            model = model.with_relation(relation.clone());
        } else {
            let nested = spec
                .submodels
                .iter()
                .map(|child| load_spec(child, base_dir))
                .collect::<Result<Vec<_>, _>>()?;
            model = model.with_nested(nested, relation.clone());
        }
    }
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_loads_artifacts_relative_to_base() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.om"), b"aaaa").unwrap();
        let json = r#"{
            "models": [{"name": "a", "path": "a.om", "inputs": ["x"], "outputs": ["y"]}],
            "devices": [{"host_id": 0, "device_id": 1}]
        }"#;
        let manifest = DeploymentManifest::from_json(json).unwrap();
        let models = manifest.load_submodels(dir.path()).unwrap();
        assert_eq!(models[0].artifact().len(), 4);
        assert_eq!(models[0].input_names(), &["x".to_string()]);
        assert_eq!(manifest.devices[0].device_id, 1);
    }

    #[test]
    fn devices_default_to_first_device() {
        let manifest =
            DeploymentManifest::from_json(r#"{"models": [{"name": "a", "path": "a.om"}]}"#).unwrap();
        assert_eq!(manifest.devices, vec![DeviceInfo::new(0, 0, 0)]);
    }

    #[test]
    fn leaf_without_path_is_rejected() {
        let err = DeploymentManifest::from_json(r#"{"models": [{"name": "a"}]}"#).unwrap_err();
        assert!(matches!(err, ManifestError::Invalid(_)));
    }

    #[test]
    fn missing_artifact_reports_model() {
        let dir = tempfile::tempdir().unwrap();
        let manifest =
            DeploymentManifest::from_json(r#"{"models": [{"name": "a", "path": "gone.om"}]}"#).unwrap();
        let err = manifest.load_submodels(dir.path()).unwrap_err();
        assert!(matches!(err, ManifestError::Artifact { ref model, .. } if model == "a"));
    }
}
