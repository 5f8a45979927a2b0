//! Worklist-based unfolding of nested submodels into one flat map.
//!
//! Loop invariant: every entry still on the worklist is a submodel whose
//! queue info lives in `relation` under its (already prefixed) name. Each
//! iteration either moves a leaf into the flat map or replaces one node by its
//! children one level deeper, so the loop ends after at most
//! `MAX_NESTING_DEPTH` levels.

use std::collections::{BTreeMap, HashMap, VecDeque};

use super::relation::{ModelQueueInfo, ModelRelation, QueueDef};
use super::submodel::Submodel;
use super::PlanError;

/// Deepest nesting accepted before the input is rejected.
pub const MAX_NESTING_DEPTH: usize = 16;

/// Leaf submodels keyed by instance name, plus the rewritten relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatModelSet {
    pub models: BTreeMap<String, Submodel>,
    pub relation: ModelRelation,
}

/// Unfold `models` (and the relation wiring them) into leaf submodels only.
pub fn flatten(
    models: &BTreeMap<String, Submodel>,
    relation: Option<&ModelRelation>,
) -> Result<FlatModelSet, PlanError> {
    let (top_models, mut relation) = top_level(models, relation)?;

    let mut flat = BTreeMap::new();
    let mut worklist: VecDeque<(Submodel, usize)> =
        top_models.into_values().map(|m| (m, 0)).collect();

    while let Some((model, depth)) = worklist.pop_front() {
        if !model.has_nested() {
            let name = model.name().to_string();
            if flat.insert(name.clone(), model).is_some() {
                return Err(PlanError::DuplicateSubmodel(name));
            }
            continue;
        }
        if depth >= MAX_NESTING_DEPTH {
            return Err(PlanError::NestingTooDeep(MAX_NESTING_DEPTH));
        }

        let parent = model.name().to_string();
        let nested_relation = model
            .relation()
            .ok_or_else(|| PlanError::MissingNestedRelation(parent.clone()))?;
        let parent_info = relation
            .submodel_queue_infos
            .remove(&parent)
            .ok_or_else(|| PlanError::MissingQueueInfo(parent.clone()))?;

        let bound = boundary_names(&parent, &parent_info, &nested_relation.root_model_queue_info)?;
        let rename = |name: &str| {
            bound
                .get(name)
                .cloned()
                .unwrap_or_else(|| format!("{}/{}", parent, name))
        };

        for def in &nested_relation.queue_defs {
            if !bound.contains_key(&def.name) {
                relation.queue_defs.push(QueueDef::new(rename(&def.name), def.depth));
            }
        }
        for (child, info) in &nested_relation.submodel_queue_infos {
            let child_name = format!("{}/{}", parent, child);
            if relation.submodel_queue_infos.contains_key(&child_name) {
                return Err(PlanError::DuplicateSubmodel(child_name));
            }
            relation.submodel_queue_infos.insert(child_name, info.map_names(rename));
        }
        for child in model.nested().values() {
            let child_name = format!("{}/{}", parent, child.name());
            worklist.push_back((child.renamed(child_name), depth + 1));
        }
        tracing::debug!(parent = %parent, children = model.nested().len(), "unfolded nested submodel");
    }

    Ok(FlatModelSet { models: flat, relation })
}

/// Pick the top-level model set and relation the worklist starts from.
fn top_level(
    models: &BTreeMap<String, Submodel>,
    relation: Option<&ModelRelation>,
) -> Result<(BTreeMap<String, Submodel>, ModelRelation), PlanError> {
    if models.is_empty() {
        return Err(PlanError::EmptyModelSet);
    }
    if let Some(relation) = relation {
        return Ok((models.clone(), relation.clone()));
    }
    if models.len() != 1 {
        return Err(PlanError::MissingRelation(models.len()));
    }
    let Some(model) = models.values().next() else {
        return Err(PlanError::EmptyModelSet);
    };

    if model.has_nested() {
        // The lone model is itself the flow.
        let relation = model
            .relation()
            .ok_or_else(|| PlanError::MissingNestedRelation(model.name().to_string()))?;
        return Ok((model.nested().clone(), relation.clone()));
    }
    let relation = match model.relation() {
        Some(r) => r.clone(),
        None => ModelRelation::trivial(model.name(), model.input_names(), model.output_names()),
    };
    Ok((models.clone(), relation))
}

/// Map nested boundary names onto the names the parent exposes.
fn boundary_names(
    parent: &str,
    parent_info: &ModelQueueInfo,
    nested_root: &ModelQueueInfo,
) -> Result<HashMap<String, String>, PlanError> {
    let pairs = [
        ("input", &parent_info.input_queue_names, &nested_root.input_queue_names),
        ("output", &parent_info.output_queue_names, &nested_root.output_queue_names),
    ];
    let mut mapping = HashMap::new();
    for (kind, outer, inner) in pairs {
        if outer.len() != inner.len() {
            return Err(PlanError::CountMismatch {
                model: parent.to_string(),
                kind,
                parent: outer.len(),
                nested: inner.len(),
            });
        }
        for (inner_name, outer_name) in inner.iter().zip(outer) {
            mapping.insert(inner_name.clone(), outer_name.clone());
        }
    }

    // Externals are optional on the nested side; when declared they must line up.
    let outer_ext = &parent_info.external_queue_names;
    let inner_ext = &nested_root.external_queue_names;
    if !inner_ext.is_empty() {
        if inner_ext.len() != outer_ext.len() {
            return Err(PlanError::CountMismatch {
                model: parent.to_string(),
                kind: "external",
                parent: outer_ext.len(),
                nested: inner_ext.len(),
            });
        }
        for (inner_name, outer_name) in inner_ext.iter().zip(outer_ext) {
            mapping.insert(inner_name.clone(), outer_name.clone());
        }
    }
    Ok(mapping)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::submodel::Artifact;

    fn leaf(name: &str) -> Submodel {
        Submodel::new(name, Artifact::from_bytes(name.as_bytes().to_vec()))
    }

    fn nested_pair() -> Submodel {
        // p = x -> [c1] -> m -> [c2] -> y
        let mut inner = ModelRelation::default();
        inner.queue_defs = vec![QueueDef::new("x", 8), QueueDef::new("m", 8), QueueDef::new("y", 8)];
        inner.root_model_queue_info = ModelQueueInfo::new(&["x"], &["y"]);
        inner.submodel_queue_infos.insert("c1".into(), ModelQueueInfo::new(&["x"], &["m"]));
        inner.submodel_queue_infos.insert("c2".into(), ModelQueueInfo::new(&["m"], &["y"]));
        leaf("p").with_nested(vec![leaf("c1"), leaf("c2")], inner)
    }

    fn outer_relation() -> ModelRelation {
        let mut outer = ModelRelation::default();
        outer.queue_defs = vec![QueueDef::new("in", 4), QueueDef::new("out", 4)];
        outer.root_model_queue_info = ModelQueueInfo::new(&["in"], &["out"]);
        outer.submodel_queue_infos.insert("p".into(), ModelQueueInfo::new(&["in"], &["out"]));
        outer
    }

    #[test]
    fn nested_names_are_prefixed_except_boundary() {
        let models: BTreeMap<_, _> = [("p".to_string(), nested_pair())].into_iter().collect();
        let flat = flatten(&models, Some(&outer_relation())).unwrap();

        assert_eq!(flat.models.keys().collect::<Vec<_>>(), vec!["p/c1", "p/c2"]);
        let c1 = &flat.relation.submodel_queue_infos["p/c1"];
        assert_eq!(c1.input_queue_names, vec!["in"]);
        assert_eq!(c1.output_queue_names, vec!["p/m"]);
        let c2 = &flat.relation.submodel_queue_infos["p/c2"];
        assert_eq!(c2.output_queue_names, vec!["out"]);
        assert!(flat.relation.find_queue_def("p/m").is_some());
        assert!(flat.relation.find_queue_def("p/x").is_none());
        assert!(!flat.relation.submodel_queue_infos.contains_key("p"));
    }

    #[test]
    fn flatten_is_idempotent() {
        let models: BTreeMap<_, _> = [("p".to_string(), nested_pair())].into_iter().collect();
        let once = flatten(&models, Some(&outer_relation())).unwrap();
        let twice = flatten(&once.models, Some(&once.relation)).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn count_mismatch_is_rejected() {
        let mut relation = outer_relation();
        relation
            .submodel_queue_infos
            .insert("p".into(), ModelQueueInfo::new(&["in", "in2"], &["out"]));
        let models: BTreeMap<_, _> = [("p".to_string(), nested_pair())].into_iter().collect();
        let err = flatten(&models, Some(&relation)).unwrap_err();
        assert!(matches!(err, PlanError::CountMismatch { kind: "input", parent: 2, nested: 1, .. }));
    }

    #[test]
    fn lone_leaf_gets_trivial_relation() {
        let model = leaf("solo").with_boundary(&["a"], &["b"]);
        let models: BTreeMap<_, _> = [("solo".to_string(), model)].into_iter().collect();
        let flat = flatten(&models, None).unwrap();
        assert_eq!(flat.relation.root_model_queue_info.input_queue_names, vec!["a"]);
        assert_eq!(flat.relation.submodel_queue_infos["solo"].output_queue_names, vec!["b"]);
    }

    #[test]
    fn lone_flow_model_is_unfolded_without_prefix() {
        let models: BTreeMap<_, _> = [("p".to_string(), nested_pair())].into_iter().collect();
        let flat = flatten(&models, None).unwrap();
        assert_eq!(flat.models.keys().collect::<Vec<_>>(), vec!["c1", "c2"]);
    }

    #[test]
    fn several_models_need_a_relation() {
        let models: BTreeMap<_, _> = [("a".to_string(), leaf("a")), ("b".to_string(), leaf("b"))]
            .into_iter()
            .collect();
        assert_eq!(flatten(&models, None).unwrap_err(), PlanError::MissingRelation(2));
    }

    #[test]
    fn deep_nesting_is_bounded() {
        let mut model = leaf("l0").with_boundary(&["i"], &["o"]);
        for level in 1..=MAX_NESTING_DEPTH + 1 {
            let mut rel = ModelRelation::default();
            rel.root_model_queue_info = ModelQueueInfo::new(&["i"], &["o"]);
            rel.submodel_queue_infos
                .insert(model.name().to_string(), ModelQueueInfo::new(&["i"], &["o"]));
            model = leaf(&format!("l{}", level)).with_nested(vec![model], rel);
        }
        let mut relation = ModelRelation::default();
        relation.root_model_queue_info = ModelQueueInfo::new(&["i"], &["o"]);
        relation
            .submodel_queue_infos
            .insert(model.name().to_string(), ModelQueueInfo::new(&["i"], &["o"]));
        let models: BTreeMap<_, _> = [(model.name().to_string(), model)].into_iter().collect();
        assert_eq!(
            flatten(&models, Some(&relation)).unwrap_err(),
            PlanError::NestingTooDeep(MAX_NESTING_DEPTH)
        );
    }
}
