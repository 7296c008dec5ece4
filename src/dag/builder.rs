//! Dependency graph builder.
//!
//! Turns a root configuration and its reference graph into build tasks inside a
//! [`Submission`]. Loading and expansion are separate steps: [`GraphBuilder::load`]
//! fetches the reachable closure from the catalog, [`GraphBuilder::expand`] walks it
//! depth-first (leaves first) and registers one task per distinct configuration.

use conveyor_common::{Catalog, CatalogError, Configuration, ConfigurationId, TaskId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::dag::scheduler::Submission;
use crate::errors::GraphError;

/// The configurations reachable from a root, as loaded from the catalog.
#[derive(Debug, Clone)]
pub struct ConfigurationGraph {
    root: ConfigurationId,
    configurations: HashMap<ConfigurationId, Configuration>,
    /// Non-root configurations with a successful build on record
    prebuilt: HashSet<ConfigurationId>,
}

impl ConfigurationGraph {
    /// Build a graph from configurations already in hand. Every referenced id must be
    /// present.
    pub fn from_configurations(
        root: ConfigurationId,
        configurations: impl IntoIterator<Item = Configuration>,
    ) -> Result<Self, GraphError> {
        let configurations: HashMap<ConfigurationId, Configuration> = configurations
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        if !configurations.contains_key(&root) {
            return Err(GraphError::UnknownConfiguration {
                id: root,
                referenced_by: None,
            });
        }
        for cfg in configurations.values() {
            for dep in &cfg.dependencies {
                if !configurations.contains_key(dep) {
                    return Err(GraphError::UnknownConfiguration {
                        id: dep.clone(),
                        referenced_by: Some(cfg.id.clone()),
                    });
                }
            }
        }

        Ok(Self {
            root,
            configurations,
            prebuilt: HashSet::new(),
        })
    }

    pub fn root(&self) -> &ConfigurationId {
        &self.root
    }

    pub fn root_configuration(&self) -> Option<&Configuration> {
        self.configurations.get(&self.root)
    }

    pub fn get(&self, id: &ConfigurationId) -> Option<&Configuration> {
        self.configurations.get(id)
    }

    pub fn len(&self) -> usize {
        self.configurations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configurations.is_empty()
    }

    /// Whether a configuration is satisfied by an earlier successful build.
    pub fn is_prebuilt(&self, id: &ConfigurationId) -> bool {
        self.prebuilt.contains(id)
    }

    pub fn prebuilt(&self) -> impl Iterator<Item = &ConfigurationId> {
        self.prebuilt.iter()
    }
}

/// Loads configuration graphs and expands them into submissions.
pub struct GraphBuilder {
    catalog: Arc<dyn Catalog>,
    rebuild_dependencies: bool,
}

impl GraphBuilder {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self {
            catalog,
            rebuild_dependencies: false,
        }
    }

    /// Build dependencies even when the catalog already has a successful record.
    pub fn with_rebuild_dependencies(mut self, rebuild: bool) -> Self {
        self.rebuild_dependencies = rebuild;
        self
    }

    /// Load every configuration reachable from `root`, breadth-first, each id once.
    ///
    /// Dependencies of a prebuilt configuration are still loaded so cycles through it
    /// are detected, but it contributes no task.
    pub async fn load(&self, root: &ConfigurationId) -> Result<ConfigurationGraph, GraphError> {
        let mut configurations = HashMap::new();
        let mut prebuilt = HashSet::new();
        let mut queued: HashSet<ConfigurationId> = HashSet::from([root.clone()]);
        let mut queue: VecDeque<(ConfigurationId, Option<ConfigurationId>)> =
            VecDeque::from([(root.clone(), None)]);

        while let Some((id, referenced_by)) = queue.pop_front() {
            let cfg = match self.catalog.load_configuration(&id).await {
                Ok(cfg) => cfg,
                Err(CatalogError::NotFound(_)) => {
                    return Err(GraphError::UnknownConfiguration { id, referenced_by });
                }
                Err(source) => return Err(GraphError::Catalog { id, source }),
            };

            if &id != root && !self.rebuild_dependencies {
                let record = self
                    .catalog
                    .latest_successful_record(&id)
                    .await
                    .map_err(|source| GraphError::Catalog {
                        id: id.clone(),
                        source,
                    })?;
                if record.is_some() {
                    tracing::debug!(configuration = %id, "dependency already built, skipping");
                    prebuilt.insert(id.clone());
                }
            }

            for dep in &cfg.dependencies {
                if queued.insert(dep.clone()) {
                    queue.push_back((dep.clone(), Some(id.clone())));
                }
            }
            configurations.insert(id, cfg);
        }

        Ok(ConfigurationGraph {
            root: root.clone(),
            configurations,
            prebuilt,
        })
    }

    /// Load and expand in one step, returning the root task.
    pub async fn build(
        &self,
        root: &ConfigurationId,
        submission: &mut Submission,
    ) -> Result<TaskId, GraphError> {
        let graph = self.load(root).await?;
        Self::expand(&graph, submission)
    }

    /// Expand a loaded graph into `submission`, returning the root task.
    ///
    /// Configurations that already have a task in the submission are linked, not
    /// re-expanded. A configuration reachable from itself fails with
    /// [`GraphError::CyclicDependency`], reported as the path with its first id repeated
    /// at the end.
    pub fn expand(
        graph: &ConfigurationGraph,
        submission: &mut Submission,
    ) -> Result<TaskId, GraphError> {
        let mut path: Vec<ConfigurationId> = Vec::new();
        let mut on_path: HashSet<ConfigurationId> = HashSet::new();
        let mut checked: HashSet<ConfigurationId> = HashSet::new();
        Self::check_acyclic(graph, &graph.root, &mut path, &mut on_path, &mut checked)?;

        let root = Self::visit(graph, &graph.root, submission, &mut path, &mut on_path)?;
        // The root is never prebuilt, so a task always exists here.
        let root = root.ok_or_else(|| GraphError::UnknownConfiguration {
            id: graph.root.clone(),
            referenced_by: None,
        })?;
        submission.set_root(root);
        Ok(root)
    }

    /// Walk every edge, prebuilt configurations included.
    fn check_acyclic(
        graph: &ConfigurationGraph,
        id: &ConfigurationId,
        path: &mut Vec<ConfigurationId>,
        on_path: &mut HashSet<ConfigurationId>,
        checked: &mut HashSet<ConfigurationId>,
    ) -> Result<(), GraphError> {
        if on_path.contains(id) {
            return Err(cycle_error(path, id));
        }
        if checked.contains(id) {
            return Ok(());
        }
        let cfg = graph
            .get(id)
            .ok_or_else(|| GraphError::UnknownConfiguration {
                id: id.clone(),
                referenced_by: path.last().cloned(),
            })?;

        path.push(id.clone());
        on_path.insert(id.clone());
        for dep in &cfg.dependencies {
            Self::check_acyclic(graph, dep, path, on_path, checked)?;
        }
        path.pop();
        on_path.remove(id);
        checked.insert(id.clone());
        Ok(())
    }

    fn visit(
        graph: &ConfigurationGraph,
        id: &ConfigurationId,
        submission: &mut Submission,
        path: &mut Vec<ConfigurationId>,
        on_path: &mut HashSet<ConfigurationId>,
    ) -> Result<Option<TaskId>, GraphError> {
        if on_path.contains(id) {
            return Err(cycle_error(path, id));
        }
        if let Some(existing) = submission.task_for_configuration(id) {
            return Ok(Some(existing));
        }
        if graph.is_prebuilt(id) && id != &graph.root {
            return Ok(None);
        }

        let cfg = graph
            .get(id)
            .ok_or_else(|| GraphError::UnknownConfiguration {
                id: id.clone(),
                referenced_by: path.last().cloned(),
            })?;

        path.push(id.clone());
        on_path.insert(id.clone());

        let mut dependencies = Vec::with_capacity(cfg.dependencies.len());
        for dep in &cfg.dependencies {
            if let Some(task) = Self::visit(graph, dep, submission, path, on_path)?
                && !dependencies.contains(&task)
            {
                dependencies.push(task);
            }
        }

        path.pop();
        on_path.remove(id);

        Ok(Some(submission.add_task(cfg.clone(), dependencies)))
    }
}

/// The cycle closing at `id`, with its first id repeated at the end.
fn cycle_error(path: &[ConfigurationId], id: &ConfigurationId) -> GraphError {
    let start = path.iter().position(|p| p == id).unwrap_or(0);
    let mut cycle = path[start..].to_vec();
    cycle.push(id.clone());
    GraphError::CyclicDependency { cycle }
}
