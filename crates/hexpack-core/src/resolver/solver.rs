//! The backtracking solver.
//!
//! State is explicit: a requirement table, an assignment stack (frames), and
//! a cache of conflict sets, combinations of `(name, version)` assignments
//! known to be incompatible. Candidate selection skips any candidate that
//! would recreate a cached combination, and a failed name backjumps to the
//! most recent assignment that contributed to its requirement set.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use hexpack_version::{Requirement, Version};
use tracing::{debug, warn};

use crate::error::{Error, FailedRequirement, Result};
use crate::registry::RegistryStore;
use crate::types::Release;

use super::{Flattened, Resolution, Resolved, Selection};

/// One requirement active on a name.
#[derive(Debug, Clone)]
pub(crate) struct ActiveReq {
    /// Concrete hosting repository demanded by this requirement.
    pub(crate) repo: String,

    /// `None` matches any version.
    pub(crate) requirement: Option<Requirement>,

    /// Optional requirements constrain but never activate a name.
    pub(crate) optional: bool,

    /// Diagnostic breadcrumb.
    pub(crate) from: String,

    /// Index of the assignment frame that introduced this requirement;
    /// `None` for requirements from the top-level tree.
    pub(crate) introduced_by: Option<usize>,
}

impl ActiveReq {
    fn matches(&self, version: &Version) -> bool {
        match &self.requirement {
            Some(requirement) => requirement.matches(version),
            None => true,
        }
    }

    fn rendered(&self) -> FailedRequirement {
        FailedRequirement {
            requirement: self
                .requirement
                .as_ref()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "*".to_string()),
            from: self.from.clone(),
        }
    }
}

/// One assignment on the stack.
#[derive(Debug)]
struct Frame {
    name: String,
    repo: String,
    version: Version,
    /// Names whose requirement tables this frame appended to, in push order.
    introduced: Vec<String>,
    /// Length of the activation order before this frame ran.
    order_len_before: usize,
}

/// A combination of assignments known to be incompatible.
type ConflictSet = BTreeMap<String, String>;

enum Control {
    Continue,
    Missing(Vec<(String, String)>),
}

pub(crate) struct Solver<'a> {
    store: &'a RegistryStore,
    lock: &'a BTreeMap<String, Selection>,
    overrides: HashSet<String>,
    reqs: HashMap<String, Vec<ActiveReq>>,
    order: Vec<String>,
    frames: Vec<Frame>,
    assigned: HashMap<String, usize>,
    conflict_cache: Vec<ConflictSet>,
    /// The first conflict seen; reported if the search ultimately fails.
    root_conflict: Option<(String, Vec<FailedRequirement>)>,
}

impl<'a> Solver<'a> {
    pub(crate) fn new(
        store: &'a RegistryStore,
        lock: &'a BTreeMap<String, Selection>,
        flattened: Flattened,
    ) -> Self {
        Self {
            store,
            lock,
            overrides: flattened.overrides,
            reqs: flattened.reqs,
            order: flattened.order,
            frames: Vec::new(),
            assigned: HashMap::new(),
            conflict_cache: Vec::new(),
            root_conflict: None,
        }
    }

    pub(crate) fn solve(mut self) -> Result<Resolved> {
        loop {
            let Some(name) = self.next_unassigned() else {
                return self.finish();
            };
            match self.select(&name)? {
                Control::Continue => {}
                Control::Missing(missing) => return Ok(Resolved::Missing(missing)),
            }
        }
    }

    /// The first unassigned active name in activation order.
    fn next_unassigned(&self) -> Option<String> {
        self.order
            .iter()
            .find(|name| !self.assigned.contains_key(*name) && self.is_active(name))
            .cloned()
    }

    /// A name is active once some non-optional requirement demands it.
    fn is_active(&self, name: &str) -> bool {
        self.reqs
            .get(name)
            .map(|reqs| reqs.iter().any(|r| !r.optional))
            .unwrap_or(false)
    }

    fn select(&mut self, name: &str) -> Result<Control> {
        let reqs_for: Vec<ActiveReq> = self.reqs.get(name).cloned().unwrap_or_default();

        let repos: BTreeSet<String> = reqs_for.iter().map(|r| r.repo.clone()).collect();
        if repos.len() > 1 {
            return Err(Error::RepoConflict {
                name: name.to_string(),
                repos: repos.into_iter().collect(),
            });
        }
        let repo = repos
            .into_iter()
            .next()
            .unwrap_or_else(|| crate::config::DEFAULT_REPO.to_string());

        let Some(entry) = self.store.get(&repo, name) else {
            return Ok(Control::Missing(self.missing_packages()));
        };

        // Newest first; a satisfiable locked version is preferred outright.
        let locked = self
            .lock
            .get(name)
            .filter(|selection| selection.repo == repo);
        let mut candidates: Vec<&Release> = entry.releases.iter().rev().collect();
        if let Some(locked) = locked {
            if let Some(pos) = candidates.iter().position(|r| r.version == locked.version) {
                let pinned = candidates.remove(pos);
                candidates.insert(0, pinned);
            }
        }

        let mut ban_contributors: BTreeSet<usize> = BTreeSet::new();
        for release in candidates {
            if !reqs_for.iter().all(|r| r.matches(&release.version)) {
                continue;
            }

            let locked_to_this = locked.map(|s| s.version == release.version).unwrap_or(false);
            if let Some(retired) = &release.retired {
                if !locked_to_this {
                    debug!(
                        name,
                        version = %release.version,
                        reason = %retired.reason,
                        "skipping retired release"
                    );
                    continue;
                }
                warn!(
                    repo = %repo,
                    name,
                    version = %release.version,
                    reason = %retired.reason,
                    message = retired.message.as_deref().unwrap_or(""),
                    "lockfile pins a retired release"
                );
            }

            if let Some(contributors) = self.banned(name, &release.version) {
                ban_contributors.extend(contributors);
                continue;
            }

            debug!(repo = %repo, name, version = %release.version, "selecting");
            return self.assign(name, &repo, release.clone());
        }

        self.conflict(name, ban_contributors)
    }

    /// Push an assignment and introduce its declared dependencies.
    fn assign(&mut self, name: &str, repo: &str, release: Release) -> Result<Control> {
        let index = self.frames.len();
        let mut frame = Frame {
            name: name.to_string(),
            repo: repo.to_string(),
            version: release.version.clone(),
            introduced: Vec::new(),
            order_len_before: self.order.len(),
        };

        // An override replaces the deeper occurrence of its package outright:
        // the selected release's registry-declared dependencies are dropped in
        // favor of whatever the top-level tree declares.
        let suppress_deps = self.overrides.contains(name);
        if suppress_deps {
            debug!(name, "override suppresses the release's declared dependencies");
        }

        let mut violated: Option<(String, BTreeSet<usize>)> = None;
        for dep in release.dependencies.iter().filter(|_| !suppress_deps) {
            // Requirements on an overridden name are themselves suppressed.
            if self.overrides.contains(&dep.name) {
                debug!(name = %dep.name, "override suppresses transitive requirement");
                continue;
            }

            let dep_repo = dep.repo.clone().unwrap_or_else(|| repo.to_string());
            let active = ActiveReq {
                repo: dep_repo,
                requirement: dep.requirement.clone(),
                optional: dep.optional,
                from: format!("{} {}", name, release.version),
                introduced_by: Some(index),
            };

            let satisfied_by_current = self
                .assigned
                .get(&dep.name)
                .map(|&i| active.matches(&self.frames[i].version));

            self.reqs.entry(dep.name.clone()).or_default().push(active);
            frame.introduced.push(dep.name.clone());

            if !dep.optional && !self.order.contains(&dep.name) {
                self.order.push(dep.name.clone());
            }

            if satisfied_by_current == Some(false) && violated.is_none() {
                let assigned_frame = self.assigned[&dep.name];
                violated = Some((dep.name.clone(), BTreeSet::from([assigned_frame])));
            }
        }

        self.assigned.insert(name.to_string(), index);
        self.frames.push(frame);

        // A newly introduced requirement can contradict an existing
        // assignment; resolve that conflict before picking the next name.
        if let Some((dep_name, extra)) = violated {
            return self.conflict(&dep_name, extra);
        }
        Ok(Control::Continue)
    }

    /// Whether assigning `version` to `name` would recreate a cached
    /// conflict combination; returns the contributing frames if so.
    fn banned(&self, name: &str, version: &Version) -> Option<BTreeSet<usize>> {
        let version = version.to_string();
        for set in &self.conflict_cache {
            let complete = set.iter().all(|(member, member_version)| {
                if member == name {
                    member_version == &version
                } else {
                    self.assigned
                        .get(member)
                        .map(|&i| self.frames[i].version.to_string() == *member_version)
                        .unwrap_or(false)
                }
            });
            if complete && set.contains_key(name) {
                let contributors = set
                    .keys()
                    .filter(|member| member.as_str() != name)
                    .filter_map(|member| self.assigned.get(member).copied())
                    .collect();
                return Some(contributors);
            }
        }
        None
    }

    /// Handle exhaustion of a name's candidates.
    ///
    /// Backjumps to the most recent assignment that contributed to the
    /// failing requirement set, caching the incompatible combination. With
    /// no contributing assignment the conflict is final.
    fn conflict(&mut self, name: &str, extra: BTreeSet<usize>) -> Result<Control> {
        let reqs_for = self.reqs.get(name).cloned().unwrap_or_default();

        // The first conflict names the root cause; later ones are echoes of
        // the search unwinding toward it.
        if self.root_conflict.is_none() {
            self.root_conflict = Some((
                name.to_string(),
                reqs_for.iter().map(|r| r.rendered()).collect(),
            ));
        }

        let mut contributors: BTreeSet<usize> = extra;
        contributors.extend(reqs_for.iter().filter_map(|r| r.introduced_by));
        if let Some(&own) = self.assigned.get(name) {
            contributors.insert(own);
        }

        let Some(&target) = contributors.iter().max() else {
            let (name, requirements) = self.root_conflict.take().unwrap_or_else(|| {
                (
                    name.to_string(),
                    reqs_for.iter().map(|r| r.rendered()).collect(),
                )
            });
            return Err(Error::ResolutionConflict { name, requirements });
        };

        let conflict_set: ConflictSet = contributors
            .iter()
            .map(|&i| (self.frames[i].name.clone(), self.frames[i].version.to_string()))
            .collect();
        debug!(
            name,
            target,
            set = ?conflict_set,
            "conflict; backjumping"
        );
        self.conflict_cache.push(conflict_set);

        self.unwind_to(target);
        Ok(Control::Continue)
    }

    /// Pop frames `target..`, undoing their requirement and activation
    /// effects.
    fn unwind_to(&mut self, target: usize) {
        for frame in self.frames.drain(target..).rev() {
            self.assigned.remove(&frame.name);
            for dep_name in frame.introduced.iter().rev() {
                if let Some(reqs) = self.reqs.get_mut(dep_name) {
                    reqs.pop();
                }
            }
            self.order.truncate(frame.order_len_before);
        }
    }

    /// Every `(repo, name)` the solver needs but the store lacks.
    fn missing_packages(&self) -> Vec<(String, String)> {
        let mut missing = Vec::new();
        for name in &self.order {
            if !self.is_active(name) {
                continue;
            }
            let Some(reqs) = self.reqs.get(name) else {
                continue;
            };
            let repos: BTreeSet<&String> = reqs.iter().map(|r| &r.repo).collect();
            for repo in repos {
                if self.store.get(repo, name).is_none() {
                    missing.push((repo.clone(), name.clone()));
                }
            }
        }
        missing.sort();
        missing.dedup();
        missing
    }

    fn finish(self) -> Result<Resolved> {
        let mut resolution = Resolution::default();
        for frame in &self.frames {
            debug_assert!(
                self.reqs
                    .get(&frame.name)
                    .into_iter()
                    .flatten()
                    .all(|r| r.matches(&frame.version)),
                "selection violates an active requirement"
            );
            resolution.packages.insert(
                frame.name.clone(),
                Selection {
                    repo: frame.repo.clone(),
                    version: frame.version.clone(),
                },
            );
        }

        self.check_acyclic(&resolution)?;
        Ok(Resolved::Complete(resolution))
    }

    /// Reject resolutions with a cycle through non-optional edges.
    fn check_acyclic(&self, resolution: &Resolution) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit(
            solver: &Solver<'_>,
            resolution: &Resolution,
            name: &str,
            marks: &mut HashMap<String, Mark>,
            path: &mut Vec<String>,
        ) -> Result<()> {
            match marks.get(name) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|n| n == name).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(name.to_string());
                    return Err(Error::ResolutionConflict {
                        name: name.to_string(),
                        requirements: vec![FailedRequirement {
                            requirement: "non-optional dependency cycle".to_string(),
                            from: cycle.join(" -> "),
                        }],
                    });
                }
                None => {}
            }

            marks.insert(name.to_string(), Mark::Visiting);
            path.push(name.to_string());

            let selection = &resolution.packages[name];
            // An overridden package's registry edges were suppressed during
            // resolution and do not exist in the result either.
            if !solver.overrides.contains(name) {
                if let Some(deps) = solver.store.deps(&selection.repo, name, &selection.version) {
                    for dep in deps {
                        if dep.optional || !resolution.packages.contains_key(&dep.name) {
                            continue;
                        }
                        visit(solver, resolution, &dep.name, marks, path)?;
                    }
                }
            }

            path.pop();
            marks.insert(name.to_string(), Mark::Done);
            Ok(())
        }

        let mut marks = HashMap::new();
        let mut path = Vec::new();
        for name in resolution.packages.keys() {
            visit(self, resolution, name, &mut marks, &mut path)?;
        }
        Ok(())
    }
}
