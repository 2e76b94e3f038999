//! Version resolution.
//!
//! The resolver takes the project's dependency tree plus the existing lock
//! and produces a complete assignment of versions, or a structured conflict
//! naming the requirements that cannot be satisfied together.
//!
//! The search is conflict-directed backtracking over explicit state (see
//! [`solver`]): a requirement table, an assignment stack, a conflict cache
//! and per-frame candidate cursors. Names are processed in the order they
//! first appear in a breadth-first traversal of the tree, deterministic by
//! construction.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use hexpack_version::{Requirement, Version};

use crate::config::DEFAULT_REPO;
use crate::error::Result;
use crate::registry::RegistryStore;

mod solver;

use solver::{ActiveReq, Solver};

/// A node of the project's dependency tree.
#[derive(Debug, Clone)]
pub struct DependencyNode {
    /// Hosting repository.
    pub repo: String,

    /// Package name.
    pub name: String,

    /// Version requirement; `None` matches any version.
    pub requirement: Option<Requirement>,

    /// Optional nodes only constrain when the name is pulled in elsewhere.
    pub optional: bool,

    /// An override suppresses any deeper requirement for the same name.
    pub is_override: bool,

    /// Diagnostic breadcrumb naming where the declaration lives.
    pub from: String,

    /// Nested declarations (e.g. from umbrella or path dependencies).
    pub children: Vec<DependencyNode>,
}

impl DependencyNode {
    /// A node for `name` in the default repository.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            repo: DEFAULT_REPO.to_string(),
            name: name.into(),
            requirement: None,
            optional: false,
            is_override: false,
            from: "mix.exs".to_string(),
            children: Vec::new(),
        }
    }

    /// Set the requirement.
    pub fn with_requirement(mut self, requirement: Requirement) -> Self {
        self.requirement = Some(requirement);
        self
    }

    /// Set the hosting repository.
    pub fn with_repo(mut self, repo: impl Into<String>) -> Self {
        self.repo = repo.into();
        self
    }

    /// Mark the node optional.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Mark the node as an override.
    pub fn override_deeper(mut self) -> Self {
        self.is_override = true;
        self
    }

    /// Set the breadcrumb.
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }

    /// Attach nested declarations.
    pub fn with_children(mut self, children: Vec<DependencyNode>) -> Self {
        self.children = children;
        self
    }
}

/// One selected package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Hosting repository.
    pub repo: String,

    /// Selected version.
    pub version: Version,
}

/// A complete assignment: package name to `(repo, version)`.
///
/// Names are unique: one package name never spans two repositories.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub packages: BTreeMap<String, Selection>,
}

/// Outcome of a resolution attempt.
#[derive(Debug, Clone)]
pub enum Resolved {
    /// Every active requirement is satisfied.
    Complete(Resolution),

    /// The solver needs these `(repo, name)` packages in the registry store
    /// before it can continue. The caller prefetches and retries.
    Missing(Vec<(String, String)>),
}

/// Resolve the dependency tree against the registry store.
///
/// `lock` pins names to their locked version as long as every active
/// requirement still matches it.
pub fn resolve(
    store: &RegistryStore,
    tree: &[DependencyNode],
    lock: &BTreeMap<String, Selection>,
) -> Result<Resolved> {
    let flattened = flatten(tree);
    Solver::new(store, lock, flattened).solve()
}

/// The flattened tree: activation order, requirement table, override set.
pub(crate) struct Flattened {
    pub(crate) order: Vec<String>,
    pub(crate) reqs: HashMap<String, Vec<ActiveReq>>,
    pub(crate) overrides: HashSet<String>,
}

/// Walk the tree breadth-first into a flat requirement table.
///
/// A requirement strictly below an override for the same name is dropped
/// (the override replaces it); a sibling at the override's own level still
/// applies. Registry-declared requirements are deeper than any tree node, so
/// the solver suppresses them for every overridden name.
fn flatten(tree: &[DependencyNode]) -> Flattened {
    // Pass 1: the shallowest override level per name.
    let mut override_level: HashMap<String, usize> = HashMap::new();
    let mut queue: VecDeque<(&DependencyNode, usize)> = tree.iter().map(|n| (n, 0)).collect();
    while let Some((node, depth)) = queue.pop_front() {
        if node.is_override {
            let level = override_level.entry(node.name.clone()).or_insert(depth);
            *level = (*level).min(depth);
        }
        queue.extend(node.children.iter().map(|c| (c, depth + 1)));
    }

    // Pass 2: collect requirements, dropping whole subtrees that sit below
    // an override for their name.
    let mut order = Vec::new();
    let mut reqs: HashMap<String, Vec<ActiveReq>> = HashMap::new();
    let mut queue: VecDeque<(&DependencyNode, usize)> = tree.iter().map(|n| (n, 0)).collect();
    while let Some((node, depth)) = queue.pop_front() {
        if let Some(&level) = override_level.get(&node.name) {
            if level < depth {
                continue;
            }
        }

        reqs.entry(node.name.clone()).or_default().push(ActiveReq {
            repo: node.repo.clone(),
            requirement: node.requirement.clone(),
            optional: node.optional,
            from: node.from.clone(),
            introduced_by: None,
        });
        if !node.optional && !order.contains(&node.name) {
            order.push(node.name.clone());
        }
        queue.extend(node.children.iter().map(|c| (c, depth + 1)));
    }

    Flattened {
        order,
        reqs,
        overrides: override_level.into_keys().collect(),
    }
}
