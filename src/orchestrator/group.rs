//! Group tree model from the orchestrator's hierarchical namespace

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::orchestrator::app::App;

/// Group id from the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn trimmed(&self) -> &str {
        self.0.trim_matches('/')
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupId {
    fn from(s: &str) -> Self {
        GroupId(s.to_string())
    }
}

/// A node in the orchestrator's group tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    #[serde(default)]
    pub apps: Vec<App>,

    #[serde(default)]
    pub groups: Vec<Group>,

    #[serde(default)]
    pub id: GroupId,

    #[serde(default)]
    pub version: String,
}

impl Group {
    /// A group is empty iff it holds no applications and no child groups.
    pub fn is_empty(&self) -> bool {
        self.apps.is_empty() && self.groups.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct GroupsResponse {
    #[serde(default)]
    groups: Vec<Group>,
}

/// Parse a group-tree envelope, `{"groups": […]}`
pub fn parse_groups(body: &[u8]) -> Result<Vec<Group>> {
    let response: GroupsResponse = serde_json::from_slice(body)?;
    Ok(response.groups)
}

/// Walk the tree depth-first and collect leaf groups (no child groups) that
/// also hold no applications.
pub fn collect_empty_leaf_groups(groups: &[Group]) -> Vec<Group> {
    let mut empty = Vec::new();
    for group in groups {
        if group.groups.is_empty() {
            if group.apps.is_empty() {
                empty.push(group.clone());
            }
        } else {
            empty.extend(collect_empty_leaf_groups(&group.groups));
        }
    }
    empty
}
