//! Read-only model of a resolved project: the root package, its dependency
//! closure, and the selected optional dependencies. Resolution and recipe
//! parsing happen upstream; this core only consumes the result.

use crate::error::{BuildError, Result};
use crate::types::BuildSettings;
use indexmap::IndexMap;
use petgraph::algo::toposort;
use petgraph::Graph;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    pub version_spec: String,
    #[serde(default)]
    pub optional: bool,
}

/// Per-configuration build-settings producer for a package. The base block
/// applies always; a configuration block overlays it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageRecipe {
    #[serde(default)]
    pub base: BuildSettings,
    #[serde(default)]
    pub configurations: IndexMap<String, BuildSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    pub recipe_path: PathBuf,
    #[serde(default)]
    pub dependencies: BTreeMap<String, Dependency>,
    #[serde(default)]
    pub recipe: PackageRecipe,
}

impl Package {
    /// Pick the configuration used for this package: the requested one if the
    /// recipe defines it, else the recipe's first configuration, else none
    /// (base settings only).
    pub fn select_configuration(&self, requested: &str) -> Option<String> {
        if self.recipe.configurations.contains_key(requested) {
            Some(requested.to_string())
        } else {
            self.recipe.configurations.keys().next().cloned()
        }
    }

    /// Build the initial settings for a configuration. The target name
    /// defaults to the package name.
    pub fn build_settings(&self, config: Option<&str>) -> BuildSettings {
        let mut settings = self.recipe.base.clone();
        if let Some(config) = config {
            if let Some(overlay) = self.recipe.configurations.get(config) {
                settings.apply_overlay(overlay);
            }
        }
        if settings.target_name.is_empty() {
            settings.target_name = self.name.clone();
        }
        if settings.target_path == PathBuf::new() {
            settings.target_path = self.path.clone();
        }
        settings
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    root: String,
    packages: IndexMap<String, Package>,
    /// Optional dependencies picked by the resolver.
    #[serde(default)]
    selections: BTreeSet<String>,
    /// Path of the selected-versions manifest, an up-to-date input for the
    /// root target.
    #[serde(default)]
    selections_path: Option<PathBuf>,
}

impl Project {
    pub fn new(root: Package, dependencies: Vec<Package>) -> Self {
        let root_name = root.name.clone();
        let mut packages = IndexMap::new();
        packages.insert(root_name.clone(), root);
        for pack in dependencies {
            packages.insert(pack.name.clone(), pack);
        }
        Self {
            root: root_name,
            packages,
            selections: BTreeSet::new(),
            selections_path: None,
        }
    }

    pub fn with_selections(
        mut self,
        selections: BTreeSet<String>,
        manifest: Option<PathBuf>,
    ) -> Self {
        self.selections = selections;
        self.selections_path = manifest;
        self
    }

    /// Load a resolved project description from its JSON dump.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| BuildError::io(path, e))?;
        serde_json::from_str(&text)
            .map_err(|e| BuildError::planning(format!("invalid project description: {e}")))
    }

    pub fn root_package(&self) -> &Package {
        &self.packages[&self.root]
    }

    pub fn package(&self, name: &str) -> Option<&Package> {
        self.packages.get(name)
    }

    pub fn packages(&self) -> impl Iterator<Item = &Package> {
        self.packages.values()
    }

    pub fn is_selected(&self, name: &str) -> bool {
        self.selections.contains(name)
    }

    pub fn selections_path(&self) -> Option<&Path> {
        self.selections_path.as_deref()
    }

    /// Packages in dependency order, roots first. The resolver guarantees an
    /// acyclic graph; a cycle still surfaces as a planning error rather than
    /// infinite descent.
    pub fn topological_order(&self) -> Result<Vec<&Package>> {
        let mut graph = Graph::<&str, ()>::new();
        let mut nodes = HashMap::new();
        for name in self.packages.keys() {
            nodes.insert(name.as_str(), graph.add_node(name.as_str()));
        }
        for pack in self.packages.values() {
            for dep_name in pack.dependencies.keys() {
                if let Some(&dep_node) = nodes.get(dep_name.as_str()) {
                    graph.add_edge(nodes[pack.name.as_str()], dep_node, ());
                }
            }
        }
        let order = toposort(&graph, None).map_err(|cycle| {
            BuildError::planning(format!(
                "dependency cycle involving {}",
                graph[cycle.node_id()]
            ))
        })?;
        Ok(order
            .into_iter()
            .map(|node| {
                let name: &str = graph[node];
                &self.packages[name]
            })
            .collect())
    }
}
