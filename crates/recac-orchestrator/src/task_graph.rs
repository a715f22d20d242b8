//! Directed graph of feature tasks.
//!
//! The graph tracks per-task status, prerequisites, and exclusive write
//! paths. Node order is insertion order, which keeps topological sorts and
//! ready-set scans deterministic for logging and tests.

use recac_core::feature::{Feature, FeatureList, FeatureStatus};
use recac_core::{RecacError, RecacResult};
use std::collections::HashMap;
use std::path::Path;

/// Status of a task node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on prerequisites.
    Pending,
    /// All prerequisites done; eligible for claiming.
    Ready,
    /// Claimed by a worker.
    InProgress,
    /// Finished successfully.
    Done,
    /// Finished unsuccessfully.
    Failed,
}

impl TaskStatus {
    /// Whether the status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

/// A graph vertex: one feature's execution state.
#[derive(Debug, Clone)]
pub struct TaskNode {
    /// Feature id this node executes.
    pub id: String,
    /// Human-readable name (the feature description).
    pub name: String,
    /// Prerequisite feature ids.
    pub prerequisites: Vec<String>,
    /// Current status.
    pub status: TaskStatus,
    /// Paths this task needs exclusive write access to.
    pub exclusive_paths: Vec<String>,
    /// Number of retries consumed.
    pub retries: u32,
    /// Last failure message, if any.
    pub error: Option<String>,
}

/// Dependency graph of tasks.
#[derive(Debug, Default)]
pub struct TaskGraph {
    nodes: HashMap<String, TaskNode>,
    order: Vec<String>,
}

impl TaskGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node; adding an existing id replaces the node but keeps its
    /// original insertion position.
    pub fn add_node(&mut self, id: impl Into<String>, name: impl Into<String>, prereqs: Vec<String>) {
        let id = id.into();
        let node = TaskNode {
            id: id.clone(),
            name: name.into(),
            prerequisites: prereqs,
            status: TaskStatus::Pending,
            exclusive_paths: Vec::new(),
            retries: 0,
            error: None,
        };
        if self.nodes.insert(id.clone(), node).is_none() {
            self.order.push(id);
        }
    }

    /// Add a node from a feature, carrying its exclusive paths and mapping a
    /// passing feature to `Done`.
    pub fn add_feature(&mut self, feature: &Feature) {
        let status = if feature.passes {
            TaskStatus::Done
        } else {
            TaskStatus::Pending
        };
        let node = TaskNode {
            id: feature.id.clone(),
            name: feature.description.clone(),
            prerequisites: feature.dependencies.prerequisites.clone(),
            status,
            exclusive_paths: feature.dependencies.exclusive_write_paths.clone(),
            retries: 0,
            error: None,
        };
        if self.nodes.insert(feature.id.clone(), node).is_none() {
            self.order.push(feature.id.clone());
        }
    }

    /// Populate from a `feature_list.json` file.
    pub fn load_from_feature_list(&mut self, path: &Path) -> RecacResult<()> {
        let list = FeatureList::load(path)?;
        for feature in &list.features {
            self.add_feature(feature);
        }
        Ok(())
    }

    /// Merge a refreshed feature list: new features become nodes, features
    /// that now pass are marked done, and in-flight statuses are preserved.
    pub fn merge_features(&mut self, list: &FeatureList) {
        for feature in &list.features {
            match self.nodes.get_mut(&feature.id) {
                Some(node) => {
                    if feature.passes && !node.status.is_terminal() {
                        node.status = TaskStatus::Done;
                    }
                    node.exclusive_paths = feature.dependencies.exclusive_write_paths.clone();
                    node.prerequisites = feature.dependencies.prerequisites.clone();
                }
                None => self.add_feature(feature),
            }
        }
    }

    /// Borrow a node.
    pub fn get(&self, id: &str) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node ids in insertion order.
    pub fn ids(&self) -> &[String] {
        &self.order
    }

    /// The only mutator for task status; also records the error message.
    pub fn mark_status(&mut self, id: &str, status: TaskStatus, error: Option<String>) -> bool {
        match self.nodes.get_mut(id) {
            Some(node) => {
                node.status = status;
                node.error = error;
                true
            }
            None => false,
        }
    }

    /// Bump a node's retry counter, returning the new count.
    pub fn increment_retry(&mut self, id: &str) -> u32 {
        match self.nodes.get_mut(id) {
            Some(node) => {
                node.retries += 1;
                node.retries
            }
            None => 0,
        }
    }

    /// Detect a dependency cycle via DFS coloring; returns one cycle path.
    pub fn detect_cycles(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        fn visit(
            graph: &TaskGraph,
            id: &str,
            colors: &mut HashMap<String, Color>,
            stack: &mut Vec<String>,
        ) -> Option<Vec<String>> {
            match colors.get(id).copied().unwrap_or(Color::White) {
                Color::Black => return None,
                Color::Gray => {
                    // close the cycle from its first occurrence on the stack
                    let start = stack.iter().position(|s| s == id).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(id.to_string());
                    return Some(cycle);
                }
                Color::White => {}
            }
            colors.insert(id.to_string(), Color::Gray);
            stack.push(id.to_string());
            if let Some(node) = graph.nodes.get(id) {
                for prereq in &node.prerequisites {
                    if graph.nodes.contains_key(prereq) {
                        if let Some(cycle) = visit(graph, prereq, colors, stack) {
                            return Some(cycle);
                        }
                    }
                }
            }
            stack.pop();
            colors.insert(id.to_string(), Color::Black);
            None
        }

        let mut colors = HashMap::new();
        for id in &self.order {
            let mut stack = Vec::new();
            if let Some(cycle) = visit(self, id, &mut colors, &mut stack) {
                return Some(cycle);
            }
        }
        None
    }

    /// Topological order, stable across equal-rank nodes by insertion order.
    pub fn topological_sort(&self) -> RecacResult<Vec<String>> {
        if let Some(cycle) = self.detect_cycles() {
            return Err(RecacError::Orchestrator(format!(
                "circular dependency: {}",
                cycle.join(" -> ")
            )));
        }

        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for id in &self.order {
            in_degree.entry(id).or_insert(0);
        }
        for node in self.nodes.values() {
            for prereq in &node.prerequisites {
                if self.nodes.contains_key(prereq) {
                    *in_degree.entry(node.id.as_str()).or_insert(0) += 1;
                }
            }
        }

        let mut sorted = Vec::with_capacity(self.order.len());
        let mut remaining: Vec<&str> = self.order.iter().map(String::as_str).collect();
        while !remaining.is_empty() {
            let mut progressed = false;
            let mut next = Vec::new();
            for id in remaining {
                if in_degree.get(id).copied().unwrap_or(0) == 0 {
                    sorted.push(id.to_string());
                    progressed = true;
                    // lower the degree of every dependent
                    for node in self.nodes.values() {
                        if node.prerequisites.iter().any(|p| p == id) {
                            if let Some(degree) = in_degree.get_mut(node.id.as_str()) {
                                *degree = degree.saturating_sub(1);
                            }
                        }
                    }
                } else {
                    next.push(id);
                }
            }
            if !progressed {
                return Err(RecacError::Orchestrator("circular dependency".into()));
            }
            remaining = next;
        }
        Ok(sorted)
    }

    /// Ids whose status is pending/ready and whose prerequisites are all done.
    pub fn ready_tasks(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                let Some(node) = self.nodes.get(*id) else {
                    return false;
                };
                matches!(node.status, TaskStatus::Pending | TaskStatus::Ready)
                    && node.prerequisites.iter().all(|p| {
                        self.nodes
                            .get(p)
                            .map(|n| n.status == TaskStatus::Done)
                            // a prerequisite outside the graph cannot block
                            .unwrap_or(true)
                    })
            })
            .cloned()
            .collect()
    }

    /// Count of tasks per status.
    pub fn summary(&self) -> HashMap<TaskStatus, usize> {
        let mut summary = HashMap::new();
        for node in self.nodes.values() {
            *summary.entry(node.status).or_insert(0) += 1;
        }
        summary
    }

    /// Count of tasks with the given status.
    pub fn count(&self, status: TaskStatus) -> usize {
        self.nodes.values().filter(|n| n.status == status).count()
    }

    /// Exclusive paths of every in-progress node.
    pub fn in_progress_paths(&self) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| n.status == TaskStatus::InProgress)
            .flat_map(|n| n.exclusive_paths.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_abc() -> TaskGraph {
        let mut graph = TaskGraph::new();
        graph.add_node("a", "first", vec![]);
        graph.add_node("b", "second", vec!["a".into()]);
        graph.add_node("c", "third", vec!["a".into(), "b".into()]);
        graph
    }

    #[test]
    fn test_ready_tasks_respect_prerequisites() {
        let mut graph = graph_abc();
        assert_eq!(graph.ready_tasks(), vec!["a"]);

        graph.mark_status("a", TaskStatus::Done, None);
        assert_eq!(graph.ready_tasks(), vec!["b"]);

        graph.mark_status("b", TaskStatus::Done, None);
        assert_eq!(graph.ready_tasks(), vec!["c"]);
    }

    #[test]
    fn test_duplicate_add_replaces_but_keeps_position() {
        let mut graph = TaskGraph::new();
        graph.add_node("a", "one", vec![]);
        graph.add_node("b", "two", vec![]);
        graph.add_node("a", "one again", vec![]);
        assert_eq!(graph.ids(), &["a".to_string(), "b".to_string()]);
        assert_eq!(graph.get("a").unwrap().name, "one again");
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn test_topological_sort_is_stable() {
        let graph = graph_abc();
        assert_eq!(graph.topological_sort().unwrap(), vec!["a", "b", "c"]);

        let mut independent = TaskGraph::new();
        independent.add_node("z", "", vec![]);
        independent.add_node("m", "", vec![]);
        independent.add_node("a", "", vec![]);
        // equal-rank nodes keep insertion order
        assert_eq!(
            independent.topological_sort().unwrap(),
            vec!["z", "m", "a"]
        );
    }

    #[test]
    fn test_cycle_detection_reports_path() {
        let mut graph = TaskGraph::new();
        graph.add_node("1", "", vec!["3".into()]);
        graph.add_node("2", "", vec!["1".into()]);
        graph.add_node("3", "", vec!["2".into()]);

        let cycle = graph.detect_cycles().unwrap();
        assert!(cycle.len() >= 3);

        let err = graph.topological_sort().unwrap_err();
        assert!(err.to_string().contains("circular dependency"));
    }

    #[test]
    fn test_no_cycle_in_dag() {
        assert!(graph_abc().detect_cycles().is_none());
    }

    #[test]
    fn test_summary_counts() {
        let mut graph = graph_abc();
        graph.mark_status("a", TaskStatus::Done, None);
        graph.mark_status("b", TaskStatus::Failed, Some("boom".into()));
        let summary = graph.summary();
        assert_eq!(summary.get(&TaskStatus::Done), Some(&1));
        assert_eq!(summary.get(&TaskStatus::Failed), Some(&1));
        assert_eq!(summary.get(&TaskStatus::Pending), Some(&1));
        assert_eq!(graph.get("b").unwrap().error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_merge_features_marks_passing_done() {
        let mut graph = TaskGraph::new();
        let mut list = FeatureList::default();
        list.features.push(Feature::new("a", "first"));
        graph.merge_features(&list);
        assert_eq!(graph.get("a").unwrap().status, TaskStatus::Pending);

        // manager added a feature and QA marked the first one passing
        list.get_mut("a").unwrap().passes = true;
        list.features
            .push(Feature::new("b", "second").with_prerequisites(vec!["a".into()]));
        graph.merge_features(&list);

        assert_eq!(graph.get("a").unwrap().status, TaskStatus::Done);
        assert_eq!(graph.ready_tasks(), vec!["b"]);
    }

    #[test]
    fn test_merge_preserves_in_progress() {
        let mut graph = TaskGraph::new();
        let mut list = FeatureList::default();
        list.features.push(Feature::new("a", "first"));
        graph.merge_features(&list);
        graph.mark_status("a", TaskStatus::InProgress, None);

        graph.merge_features(&list);
        assert_eq!(graph.get("a").unwrap().status, TaskStatus::InProgress);
    }

    #[test]
    fn test_load_from_feature_list_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("feature_list.json");
        std::fs::write(
            &path,
            r#"{"features":[
                {"id":"auth","description":"login",
                 "dependencies":{"prerequisites":[],"exclusive_write_paths":["src/auth.rs"],"read_only_paths":[]}},
                {"id":"ui","description":"frontend",
                 "dependencies":{"prerequisites":["auth"],"exclusive_write_paths":[],"read_only_paths":[]}}
            ]}"#,
        )
        .unwrap();

        let mut graph = TaskGraph::new();
        graph.load_from_feature_list(&path).unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.get("auth").unwrap().exclusive_paths, vec!["src/auth.rs"]);
        assert_eq!(graph.ready_tasks(), vec!["auth"]);
    }

    #[test]
    fn test_retry_counter() {
        let mut graph = graph_abc();
        assert_eq!(graph.increment_retry("a"), 1);
        assert_eq!(graph.increment_retry("a"), 2);
        assert_eq!(graph.increment_retry("missing"), 0);
    }

    #[test]
    fn test_in_progress_paths_union() {
        let mut graph = TaskGraph::new();
        let feature = Feature::new("a", "one").with_exclusive_paths(vec!["src/a.rs".into()]);
        graph.add_feature(&feature);
        assert!(graph.in_progress_paths().is_empty());
        graph.mark_status("a", TaskStatus::InProgress, None);
        assert_eq!(graph.in_progress_paths(), vec!["src/a.rs"]);
    }
}
