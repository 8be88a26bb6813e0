//! Dependency ordering for layers and recipes.
//!
//! Two orderings are computed here: the intra-recipe layer order, where
//! every `built` base and every `stacker://` import must resolve to an
//! already-emitted layer, and the cross-recipe prerequisite DAG, which is
//! topologically sorted so prerequisite recipes build first.

use crate::error::{Result, StackerError};
use crate::recipe::{DockerishUrl, ImageSource, Recipe, RecipeSet};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

/// Emit the recipe's layer names in buildable order.
///
/// The source order is scanned up to N times, admitting a layer once all of
/// its intra-recipe references point at admitted layers. When the recipe
/// declares prerequisites, unresolved references are assumed to live in a
/// prerequisite recipe and the layer is admitted anyway. Failure to converge
/// reports the residual set.
pub fn dependency_order(recipe: &Recipe) -> Result<Vec<String>> {
    let mut order = Vec::new();
    let mut processed: HashSet<String> = HashSet::new();
    let has_prerequisites = !recipe.build_config.prerequisites.is_empty();

    for _ in 0..recipe.len() {
        for name in &recipe.layer_order {
            if processed.contains(name) {
                continue;
            }

            let layer = recipe.get(name).expect("layer_order names a parsed layer");
            let source = layer.from_source()?;

            let base_ok = match source {
                ImageSource::Built { tag } => processed.contains(tag),
                _ => true,
            };

            let imports_ok = layer.imports.iter().all(|imp| {
                let url = DockerishUrl::parse(imp);
                url.scheme != "stacker" || processed.contains(&url.host)
            });

            if (base_ok && imports_ok) || has_prerequisites {
                debug!(layer = %name, "admitted to build order");
                order.push(name.clone());
                processed.insert(name.clone());
            }
        }
    }

    if order.len() != recipe.len() {
        let residual = recipe
            .layer_order
            .iter()
            .filter(|n| !processed.contains(*n))
            .cloned()
            .collect();
        return Err(StackerError::DependencyUnresolved { residual });
    }

    Ok(order)
}

/// The cross-recipe prerequisite DAG: vertices are recipe paths, edges run
/// from a recipe to each of its prerequisites.
#[derive(Debug)]
pub struct RecipeDag {
    /// path -> prerequisite paths
    edges: HashMap<String, Vec<String>>,
}

impl RecipeDag {
    pub fn new(set: &RecipeSet) -> Result<RecipeDag> {
        let mut edges = HashMap::new();
        for (path, recipe) in &set.recipes {
            // recipe keys are canonical paths; prerequisites may still carry
            // `..` segments, so canonicalize them to match
            let prereqs = recipe
                .prerequisites()
                .into_iter()
                .map(|p| {
                    std::fs::canonicalize(&p)
                        .map(|c| c.to_string_lossy().into_owned())
                        .unwrap_or(p)
                })
                .collect();
            edges.insert(path.clone(), prereqs);
        }
        Ok(RecipeDag { edges })
    }

    /// Topological order over recipe paths: every prerequisite appears
    /// before the recipes that depend on it. Cycles are fatal.
    pub fn sort(&self) -> Result<Vec<String>> {
        // Kahn's algorithm; "in-degree" counts unmet prerequisites
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for (path, prereqs) in &self.edges {
            in_degree.entry(path.as_str()).or_insert(0);
            for prereq in prereqs {
                // an edge out of the set cannot be waited on
                if !self.edges.contains_key(prereq) {
                    continue;
                }
                *in_degree.entry(path.as_str()).or_insert(0) += 1;
                dependents.entry(prereq.as_str()).or_default().push(path.as_str());
            }
        }

        let mut ready: VecDeque<&str> = {
            let mut roots: Vec<&str> =
                in_degree.iter().filter(|(_, d)| **d == 0).map(|(p, _)| *p).collect();
            roots.sort_unstable();
            roots.into_iter().collect()
        };

        let mut order = Vec::new();
        while let Some(path) = ready.pop_front() {
            order.push(path.to_string());

            if let Some(deps) = dependents.get(path) {
                for dep in deps {
                    let degree = in_degree.get_mut(dep).expect("dependent was counted");
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(dep);
                    }
                }
            }
        }

        if order.len() != self.edges.len() {
            let stuck = self
                .edges
                .keys()
                .find(|p| !order.contains(p))
                .cloned()
                .unwrap_or_default();
            return Err(StackerError::PrerequisiteCycle { path: stuck });
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{BuildConfig, LayerDefinition};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn layer(from: ImageSource, imports: &[&str]) -> LayerDefinition {
        LayerDefinition {
            from: Some(from),
            imports: imports.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn recipe(layers: Vec<(&str, LayerDefinition)>, prereqs: Vec<String>) -> Recipe {
        Recipe {
            after_substitutions: String::new(),
            layer_order: layers.iter().map(|(n, _)| n.to_string()).collect(),
            layers: layers.into_iter().map(|(n, l)| (n.to_string(), l)).collect::<BTreeMap<_, _>>(),
            build_config: BuildConfig { prerequisites: prereqs },
            path: "test.yaml".to_string(),
            reference_directory: PathBuf::from("/"),
        }
    }

    #[test]
    fn test_source_order_kept_when_no_deps() {
        let r = recipe(
            vec![
                ("b", layer(ImageSource::Scratch, &[])),
                ("a", layer(ImageSource::Scratch, &[])),
            ],
            vec![],
        );
        assert_eq!(dependency_order(&r).unwrap(), vec!["b", "a"]);
    }

    #[test]
    fn test_built_base_reorders() {
        let r = recipe(
            vec![
                ("child", layer(ImageSource::Built { tag: "base".into() }, &[])),
                ("base", layer(ImageSource::Scratch, &[])),
            ],
            vec![],
        );
        assert_eq!(dependency_order(&r).unwrap(), vec!["base", "child"]);
    }

    #[test]
    fn test_stacker_import_reorders() {
        let r = recipe(
            vec![
                ("consumer", layer(ImageSource::Scratch, &["stacker://producer/out.bin"])),
                ("producer", layer(ImageSource::Scratch, &[])),
            ],
            vec![],
        );
        assert_eq!(dependency_order(&r).unwrap(), vec!["producer", "consumer"]);
    }

    #[test]
    fn test_order_is_topological() {
        let r = recipe(
            vec![
                ("c", layer(ImageSource::Built { tag: "b".into() }, &["stacker://a/f"])),
                ("b", layer(ImageSource::Built { tag: "a".into() }, &[])),
                ("a", layer(ImageSource::Scratch, &[])),
            ],
            vec![],
        );
        let order = dependency_order(&r).unwrap();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn test_unresolved_reports_residual() {
        let r = recipe(
            vec![("child", layer(ImageSource::Built { tag: "nowhere".into() }, &[]))],
            vec![],
        );
        match dependency_order(&r).unwrap_err() {
            StackerError::DependencyUnresolved { residual } => {
                assert_eq!(residual, vec!["child"]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_prerequisites_admit_unresolved() {
        let r = recipe(
            vec![("child", layer(ImageSource::Built { tag: "elsewhere".into() }, &[]))],
            vec!["../base.yaml".to_string()],
        );
        assert_eq!(dependency_order(&r).unwrap(), vec!["child"]);
    }

    #[test]
    fn test_dag_sort_prereq_first() {
        let mut set = RecipeSet::default();
        set.recipes.insert("/app.yaml".to_string(), recipe(vec![], vec!["/base.yaml".into()]));
        set.recipes.insert("/base.yaml".to_string(), recipe(vec![], vec![]));

        let dag = RecipeDag::new(&set).unwrap();
        let order = dag.sort().unwrap();
        let pos = |p: &str| order.iter().position(|x| x == p).unwrap();
        assert!(pos("/base.yaml") < pos("/app.yaml"));
    }

    #[test]
    fn test_dag_cycle_is_fatal() {
        let mut set = RecipeSet::default();
        set.recipes.insert("/a.yaml".to_string(), recipe(vec![], vec!["/b.yaml".into()]));
        set.recipes.insert("/b.yaml".to_string(), recipe(vec![], vec!["/a.yaml".into()]));

        let dag = RecipeDag::new(&set).unwrap();
        assert!(matches!(dag.sort().unwrap_err(), StackerError::PrerequisiteCycle { .. }));
    }
}
