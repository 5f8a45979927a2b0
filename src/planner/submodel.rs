//! Submodels: opaque compiled artifacts plus their boundary and nesting.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;
use sha2::{Digest, Sha256};

use super::relation::ModelRelation;

enum ArtifactBytes {
    Owned(Arc<[u8]>),
    Mapped(Arc<Mmap>),
}

/// Serialized compiled model, shared without copying.
#[derive(Clone)]
pub struct Artifact {
    bytes: Arc<ArtifactBytes>,
}

impl Artifact {
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self { bytes: Arc::new(ArtifactBytes::Owned(bytes.into())) }
    }

    /// Memory-map an artifact file (read-only, zero-copy).
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = File::open(path)?;
        // SAFETY: read-only mapping; artifact files are not modified while deployed.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self { bytes: Arc::new(ArtifactBytes::Mapped(Arc::new(mmap))) })
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self.bytes.as_ref() {
            ArtifactBytes::Owned(b) => b,
            ArtifactBytes::Mapped(m) => m,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// Hex SHA-256 of the artifact contents.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.as_bytes()))
    }
}

impl PartialEq for Artifact {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes) || self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Artifact {}

impl std::fmt::Debug for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Artifact").field("len", &self.len()).finish()
    }
}

/// One independently loadable compiled unit.
///
/// A submodel may itself be a flow: a set of nested submodels wired by its own
/// [`ModelRelation`]. The planner only asks whether such nesting exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submodel {
    name: String,
    artifact: Artifact,
    input_names: Vec<String>,
    output_names: Vec<String>,
    nested: BTreeMap<String, Submodel>,
    relation: Option<ModelRelation>,
}

impl Submodel {
    pub fn new(name: impl Into<String>, artifact: Artifact) -> Self {
        Self {
            name: name.into(),
            artifact,
            input_names: Vec::new(),
            output_names: Vec::new(),
            nested: BTreeMap::new(),
            relation: None,
        }
    }

    /// Declare the boundary tensor names (used for trivial relations).
    pub fn with_boundary(mut self, inputs: &[&str], outputs: &[&str]) -> Self {
        self.input_names = inputs.iter().map(|s| s.to_string()).collect();
        self.output_names = outputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_nested(mut self, nested: Vec<Submodel>, relation: ModelRelation) -> Self {
        self.nested = nested.into_iter().map(|m| (m.name.clone(), m)).collect();
        self.relation = Some(relation);
        self
    }

    pub fn with_relation(mut self, relation: ModelRelation) -> Self {
        self.relation = Some(relation);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn artifact(&self) -> &Artifact {
        &self.artifact
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    pub fn has_nested(&self) -> bool {
        !self.nested.is_empty()
    }

    pub fn nested(&self) -> &BTreeMap<String, Submodel> {
        &self.nested
    }

    pub fn relation(&self) -> Option<&ModelRelation> {
        self.relation.as_ref()
    }

    /// Copy of this submodel under a different name.
    pub(crate) fn renamed(&self, name: String) -> Self {
        Self { name, ..self.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn digest_is_hex_sha256() {
        let artifact = Artifact::from_bytes(b"abc".to_vec());
        assert_eq!(
            artifact.digest(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn mapped_artifact_matches_owned() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"model-bytes").unwrap();
        let mapped = Artifact::open(file.path()).unwrap();
        let owned = Artifact::from_bytes(b"model-bytes".to_vec());
        assert_eq!(mapped, owned);
        assert_eq!(mapped.len(), 11);
    }

    #[test]
    fn nesting_is_detected() {
        let leaf = Submodel::new("leaf", Artifact::from_bytes(vec![1]));
        assert!(!leaf.has_nested());
        let parent = Submodel::new("p", Artifact::from_bytes(vec![]))
            .with_nested(vec![leaf], ModelRelation::default());
        assert!(parent.has_nested());
        assert!(parent.relation().is_some());
    }
}
