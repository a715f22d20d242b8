//! The feature-list domain model.
//!
//! A project's plan is an array document `{"features":[...]}` produced by the
//! initializer agent and amended by the manager/QA agents. The authoritative
//! copy lives in the store; `feature_list.json` in the workspace is a
//! read-through mirror.

use crate::{RecacError, RecacResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Status of a planned feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    /// Not yet picked up.
    Todo,
    /// An agent is currently working on it.
    InProgress,
    /// Work finished and verified.
    Done,
    /// Code landed but not yet verified passing.
    Implemented,
    /// Work was attempted and gave up.
    Failed,
}

impl Default for FeatureStatus {
    fn default() -> Self {
        FeatureStatus::Todo
    }
}

impl std::fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeatureStatus::Todo => write!(f, "todo"),
            FeatureStatus::InProgress => write!(f, "in_progress"),
            FeatureStatus::Done => write!(f, "done"),
            FeatureStatus::Implemented => write!(f, "implemented"),
            FeatureStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Dependency declaration for a feature.
///
/// Two features may run concurrently only if their exclusive write paths do
/// not intersect; read-only paths carry no exclusion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureDependencies {
    /// Feature ids that must be done before this one starts.
    #[serde(default)]
    pub prerequisites: Vec<String>,
    /// Repository-relative paths this feature needs exclusive write access to.
    #[serde(default)]
    pub exclusive_write_paths: Vec<String>,
    /// Repository-relative paths this feature only reads.
    #[serde(default)]
    pub read_only_paths: Vec<String>,
}

/// A planned unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    /// Stable identifier, unique within the project.
    pub id: String,
    /// Grouping label (e.g. "backend", "infra").
    #[serde(default)]
    pub category: String,
    /// Relative ordering hint; lower runs earlier among ready features.
    #[serde(default)]
    pub priority: u32,
    /// What the feature delivers, in agent-readable prose.
    pub description: String,
    /// Current lifecycle status.
    #[serde(default)]
    pub status: FeatureStatus,
    /// Whether the feature's acceptance check currently passes.
    #[serde(default)]
    pub passes: bool,
    /// Prerequisites and path-exclusion declarations.
    #[serde(default)]
    pub dependencies: FeatureDependencies,
}

impl Feature {
    /// Create a minimal feature with the given id and description.
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            category: String::new(),
            priority: 0,
            description: description.into(),
            status: FeatureStatus::Todo,
            passes: false,
            dependencies: FeatureDependencies::default(),
        }
    }

    /// Builder: set prerequisite feature ids.
    pub fn with_prerequisites(mut self, prereqs: Vec<String>) -> Self {
        self.dependencies.prerequisites = prereqs;
        self
    }

    /// Builder: set exclusive write paths.
    pub fn with_exclusive_paths(mut self, paths: Vec<String>) -> Self {
        self.dependencies.exclusive_write_paths = paths;
        self
    }
}

/// The `{"features":[...]}` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureList {
    /// All planned features, in plan order.
    pub features: Vec<Feature>,
}

impl FeatureList {
    /// Parse a feature-list JSON document.
    pub fn from_json(json: &str) -> RecacResult<Self> {
        serde_json::from_str(json).map_err(RecacError::from)
    }

    /// Serialize back to the canonical JSON document.
    pub fn to_json(&self) -> RecacResult<String> {
        serde_json::to_string_pretty(self).map_err(RecacError::from)
    }

    /// Load from a `feature_list.json` file on disk.
    pub fn load(path: &Path) -> RecacResult<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    /// Look up a feature by id.
    pub fn get(&self, id: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.id == id)
    }

    /// Mutable lookup by id.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Feature> {
        self.features.iter_mut().find(|f| f.id == id)
    }

    /// Number of features whose acceptance check passes.
    pub fn passing_count(&self) -> usize {
        self.features.iter().filter(|f| f.passes).count()
    }

    /// True when every feature passes. An empty list does not count as
    /// all-passing: sign-off over an empty plan is always premature.
    pub fn all_passing(&self) -> bool {
        !self.features.is_empty() && self.features.iter().all(|f| f.passes)
    }

    /// Ids of features that are not yet passing.
    pub fn failing_ids(&self) -> Vec<String> {
        self.features
            .iter()
            .filter(|f| !f.passes)
            .map(|f| f.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_document() {
        let json = r#"{
            "features": [
                {
                    "id": "feat-auth",
                    "category": "backend",
                    "priority": 1,
                    "description": "Add login endpoint",
                    "status": "todo",
                    "passes": false,
                    "dependencies": {
                        "prerequisites": [],
                        "exclusive_write_paths": ["src/auth.rs"],
                        "read_only_paths": ["src/lib.rs"]
                    }
                }
            ]
        }"#;
        let list = FeatureList::from_json(json).unwrap();
        assert_eq!(list.features.len(), 1);
        let f = list.get("feat-auth").unwrap();
        assert_eq!(f.status, FeatureStatus::Todo);
        assert_eq!(f.dependencies.exclusive_write_paths, vec!["src/auth.rs"]);
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let json = r#"{"features":[{"id":"a","description":"minimal"}]}"#;
        let list = FeatureList::from_json(json).unwrap();
        let f = list.get("a").unwrap();
        assert_eq!(f.status, FeatureStatus::Todo);
        assert!(!f.passes);
        assert!(f.dependencies.prerequisites.is_empty());
    }

    #[test]
    fn test_roundtrip_preserves_status() {
        let mut list = FeatureList::default();
        let mut f = Feature::new("a", "thing");
        f.status = FeatureStatus::Implemented;
        f.passes = true;
        list.features.push(f);

        let parsed = FeatureList::from_json(&list.to_json().unwrap()).unwrap();
        assert_eq!(parsed.get("a").unwrap().status, FeatureStatus::Implemented);
        assert!(parsed.get("a").unwrap().passes);
    }

    #[test]
    fn test_all_passing_empty_list_is_false() {
        assert!(!FeatureList::default().all_passing());
    }

    #[test]
    fn test_passing_counts() {
        let mut list = FeatureList::default();
        let mut a = Feature::new("a", "one");
        a.passes = true;
        list.features.push(a);
        list.features.push(Feature::new("b", "two"));

        assert_eq!(list.passing_count(), 1);
        assert!(!list.all_passing());
        assert_eq!(list.failing_ids(), vec!["b".to_string()]);
    }
}
