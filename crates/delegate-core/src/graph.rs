//! In-memory dependency DAG.
//!
//! Mirrors the persisted pending edges: rebuilt from the database on boot,
//! updated incrementally afterwards. Holds forward (task -> dependencies)
//! and reverse (task -> dependents) adjacency, memoised transitive
//! closures, and a memoised depth computation.
//!
//! Cache invalidation happens BEFORE any mutation so the invalidation
//! walks the pre-mutation reachability; invalidating afterwards would miss
//! nodes that were only reachable through the edge being removed.

use std::collections::{HashMap, HashSet, VecDeque};

use uuid::Uuid;

use delegate_db::models::TaskDependency;
use delegate_db::queries::dependencies::{MAX_CHAIN_DEPTH, MAX_FAN_IN};

use crate::error::DelegateError;

#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// task -> the tasks it depends on.
    forward: HashMap<Uuid, HashSet<Uuid>>,
    /// task -> the tasks depending on it.
    reverse: HashMap<Uuid, HashSet<Uuid>>,
    deps_cache: HashMap<Uuid, HashSet<Uuid>>,
    dependents_cache: HashMap<Uuid, HashSet<Uuid>>,
    depth_cache: HashMap<Uuid, usize>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted pending edges.
    pub fn from_edges(edges: &[TaskDependency]) -> Self {
        let mut graph = Self::new();
        for edge in edges {
            graph
                .forward
                .entry(edge.task_id)
                .or_default()
                .insert(edge.depends_on_task_id);
            graph
                .reverse
                .entry(edge.depends_on_task_id)
                .or_default()
                .insert(edge.task_id);
        }
        graph
    }

    /// Number of edges in the graph.
    pub fn edge_count(&self) -> usize {
        self.forward.values().map(|s| s.len()).sum()
    }

    /// Add edge `task -> depends_on`.
    ///
    /// The cycle precheck runs on a view containing the proposed edge; the
    /// live graph is not touched until every check passes.
    pub fn add_edge(&mut self, task: Uuid, depends_on: Uuid) -> Result<(), DelegateError> {
        if task == depends_on {
            return Err(DelegateError::DependencyCycle(format!(
                "task {task} cannot depend on itself"
            )));
        }
        if self
            .forward
            .get(&task)
            .is_some_and(|deps| deps.contains(&depends_on))
        {
            return Err(DelegateError::DependencyExists(format!(
                "{task} -> {depends_on}"
            )));
        }
        let fan_in = self.forward.get(&task).map_or(0, |deps| deps.len());
        if fan_in >= MAX_FAN_IN {
            return Err(DelegateError::FanOutExceeded(format!(
                "task {task} already has {fan_in} dependencies (max {MAX_FAN_IN})"
            )));
        }
        if self.would_create_cycle(task, depends_on) {
            return Err(DelegateError::DependencyCycle(format!(
                "{task} -> {depends_on} would close a cycle"
            )));
        }

        // Longest chain that would pass through the new edge: the deepest
        // dependency chain below `depends_on`, plus the deepest dependent
        // chain above `task`, plus the two nodes themselves.
        let below = self.longest_chain(&self.forward, depends_on);
        let above = self.longest_chain(&self.reverse, task);
        let depth = below + above + 2;
        if depth > MAX_CHAIN_DEPTH {
            return Err(DelegateError::DepthExceeded(format!(
                "chain through {task} -> {depends_on} would be {depth} deep (max {MAX_CHAIN_DEPTH})"
            )));
        }

        // Invalidate while reachability still reflects the pre-mutation
        // graph, then mutate.
        self.invalidate_around(task, depends_on);
        self.forward.entry(task).or_default().insert(depends_on);
        self.reverse.entry(depends_on).or_default().insert(task);
        Ok(())
    }

    /// Remove edge `task -> depends_on`, if present.
    pub fn remove_edge(&mut self, task: Uuid, depends_on: Uuid) {
        let present = self
            .forward
            .get(&task)
            .is_some_and(|deps| deps.contains(&depends_on));
        if !present {
            return;
        }
        self.invalidate_around(task, depends_on);

        if let Some(deps) = self.forward.get_mut(&task) {
            deps.remove(&depends_on);
            if deps.is_empty() {
                // Delete phantom empty sets so removal never leaks entries.
                self.forward.remove(&task);
            }
        }
        if let Some(dependents) = self.reverse.get_mut(&depends_on) {
            dependents.remove(&task);
            if dependents.is_empty() {
                self.reverse.remove(&depends_on);
            }
        }
    }

    /// Remove a task and every edge touching it.
    pub fn remove_task(&mut self, task: Uuid) {
        let deps: Vec<Uuid> = self
            .forward
            .get(&task)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        let dependents: Vec<Uuid> = self
            .reverse
            .get(&task)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();

        for dep in deps {
            self.remove_edge(task, dep);
        }
        for dependent in dependents {
            self.remove_edge(dependent, task);
        }
        self.forward.remove(&task);
        self.reverse.remove(&task);
        self.depth_cache.remove(&task);
        self.deps_cache.remove(&task);
        self.dependents_cache.remove(&task);
    }

    /// True iff adding `task -> depends_on` would close a cycle, or the
    /// edge is a self-edge. Pure query; touches no caches.
    pub fn would_create_cycle(&self, task: Uuid, depends_on: Uuid) -> bool {
        if task == depends_on {
            return true;
        }
        // A cycle appears iff `task` is reachable from `depends_on` by
        // following dependency edges.
        let mut stack = vec![depends_on];
        let mut seen = HashSet::new();
        while let Some(node) = stack.pop() {
            if node == task {
                return true;
            }
            if !seen.insert(node) {
                continue;
            }
            if let Some(nexts) = self.forward.get(&node) {
                stack.extend(nexts.iter().copied());
            }
        }
        false
    }

    /// Full-graph cycle check with a recursion-stack set.
    pub fn has_cycle(&self) -> bool {
        let mut visited = HashSet::new();
        let mut stack = Vec::new();
        let mut on_stack = HashSet::new();

        for &start in self.forward.keys() {
            if visited.contains(&start) {
                continue;
            }
            // Iterative DFS with explicit enter/exit markers.
            stack.push((start, false));
            while let Some((node, exiting)) = stack.pop() {
                if exiting {
                    on_stack.remove(&node);
                    continue;
                }
                if on_stack.contains(&node) {
                    return true;
                }
                if !visited.insert(node) {
                    continue;
                }
                on_stack.insert(node);
                stack.push((node, true));
                if let Some(nexts) = self.forward.get(&node) {
                    for &next in nexts {
                        if on_stack.contains(&next) {
                            return true;
                        }
                        stack.push((next, false));
                    }
                }
            }
        }
        false
    }

    /// Transitive closure of dependencies, memoised.
    pub fn all_dependencies(&mut self, task: Uuid) -> HashSet<Uuid> {
        if let Some(cached) = self.deps_cache.get(&task) {
            return cached.clone();
        }
        let closure = Self::reachable(&self.forward, task);
        self.deps_cache.insert(task, closure.clone());
        closure
    }

    /// Transitive closure of dependents, memoised.
    pub fn all_dependents(&mut self, task: Uuid) -> HashSet<Uuid> {
        if let Some(cached) = self.dependents_cache.get(&task) {
            return cached.clone();
        }
        let closure = Self::reachable(&self.reverse, task);
        self.dependents_cache.insert(task, closure.clone());
        closure
    }

    /// Kahn's algorithm. Errors if the graph holds a cycle.
    pub fn topological_sort(&self) -> Result<Vec<Uuid>, DelegateError> {
        let mut nodes: HashSet<Uuid> = HashSet::new();
        nodes.extend(self.forward.keys());
        nodes.extend(self.reverse.keys());

        // In-degree counts incoming dependency edges (task -> dep means
        // dep must come first, so the edge dep -> task in sort order).
        let mut in_degree: HashMap<Uuid, usize> = nodes.iter().map(|&n| (n, 0)).collect();
        for (&task, deps) in &self.forward {
            *in_degree.get_mut(&task).expect("node present") += deps.len();
        }

        let mut ready: VecDeque<Uuid> = in_degree
            .iter()
            .filter(|&(_, &d)| d == 0)
            .map(|(&n, _)| n)
            .collect();
        let mut order = Vec::with_capacity(nodes.len());

        while let Some(node) = ready.pop_front() {
            order.push(node);
            if let Some(dependents) = self.reverse.get(&node) {
                for &dependent in dependents {
                    let d = in_degree.get_mut(&dependent).expect("node present");
                    *d -= 1;
                    if *d == 0 {
                        ready.push_back(dependent);
                    }
                }
            }
        }

        if order.len() != nodes.len() {
            return Err(DelegateError::DependencyCycle(
                "graph contains a cycle; no topological order exists".to_string(),
            ));
        }
        Ok(order)
    }

    /// Longest dependency chain rooted at `task` (number of nodes),
    /// memoised.
    pub fn max_depth(&mut self, task: Uuid) -> usize {
        if let Some(&d) = self.depth_cache.get(&task) {
            return d;
        }
        let mut memo = HashMap::new();
        let depth = Self::depth_dfs(&self.forward, task, &mut memo);
        // Fold the whole memo in; the DFS computed those too.
        self.depth_cache.extend(memo);
        depth
    }

    // -- internals ---------------------------------------------------------

    fn depth_dfs(
        forward: &HashMap<Uuid, HashSet<Uuid>>,
        node: Uuid,
        memo: &mut HashMap<Uuid, usize>,
    ) -> usize {
        if let Some(&d) = memo.get(&node) {
            return d;
        }
        let depth = 1 + forward
            .get(&node)
            .map(|nexts| {
                nexts
                    .iter()
                    .map(|&n| Self::depth_dfs(forward, n, memo))
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        memo.insert(node, depth);
        depth
    }

    /// Longest chain length in edges starting from (not counting) `node`.
    fn longest_chain(&self, adj: &HashMap<Uuid, HashSet<Uuid>>, node: Uuid) -> usize {
        fn go(
            adj: &HashMap<Uuid, HashSet<Uuid>>,
            node: Uuid,
            memo: &mut HashMap<Uuid, usize>,
        ) -> usize {
            if let Some(&d) = memo.get(&node) {
                return d;
            }
            let depth = adj
                .get(&node)
                .map(|nexts| {
                    nexts
                        .iter()
                        .map(|&n| go(adj, n, memo) + 1)
                        .max()
                        .unwrap_or(0)
                })
                .unwrap_or(0);
            memo.insert(node, depth);
            depth
        }
        go(adj, node, &mut HashMap::new())
    }

    /// Drop cache entries for `task` plus everything that can reach it,
    /// and `depends_on` plus everything it can reach. Runs before the
    /// mutation so reachability is the pre-mutation one.
    fn invalidate_around(&mut self, task: Uuid, depends_on: Uuid) {
        let mut upstream = Self::reachable(&self.reverse, task);
        upstream.insert(task);
        let mut downstream = Self::reachable(&self.forward, depends_on);
        downstream.insert(depends_on);

        for id in upstream.iter().chain(downstream.iter()) {
            self.deps_cache.remove(id);
            self.dependents_cache.remove(id);
            self.depth_cache.remove(id);
        }
    }

    fn reachable(adj: &HashMap<Uuid, HashSet<Uuid>>, start: Uuid) -> HashSet<Uuid> {
        let mut seen = HashSet::new();
        let mut stack: Vec<Uuid> = adj
            .get(&start)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        while let Some(node) = stack.pop() {
            if seen.insert(node) {
                if let Some(nexts) = adj.get(&node) {
                    stack.extend(nexts.iter().copied());
                }
            }
        }
        seen
    }
}
