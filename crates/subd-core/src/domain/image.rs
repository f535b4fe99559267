//! Image domain entity
//!
//! A target image: the tree the machine should converge to, the paths the
//! image does not manage, and the service triggers for its files.

use serde::{Deserialize, Serialize};

use super::filter::Filter;
use super::tree::FileSystemTree;
use super::triggers::Trigger;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub name: String,
    pub tree: FileSystemTree,
    /// Paths the image leaves alone. `None` marks a sparse image, which
    /// never deletes local paths it does not mention.
    #[serde(default)]
    pub filter: Option<Filter>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
}

impl Image {
    pub fn new(name: impl Into<String>, tree: FileSystemTree) -> Self {
        Self {
            name: name.into(),
            tree,
            filter: Some(Filter::default()),
            triggers: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: Option<Filter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_triggers(mut self, triggers: Vec<Trigger>) -> Self {
        self.triggers = triggers;
        self
    }

    /// Returns true if the image never deletes unmentioned paths
    pub fn is_sparse(&self) -> bool {
        self.filter.is_none()
    }

    /// Returns true if `path` is excluded by the image filter
    pub fn excludes(&self, path: &str) -> bool {
        self.filter.as_ref().is_some_and(|f| f.matches(path))
    }
}
