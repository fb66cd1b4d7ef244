use serde::{Deserialize, Serialize};

/// Read-only view of one node in the status tree.
///
/// `pending` is the number of requests still open at the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub name: String,
    pub received: u64,
    pub replied: u64,
    pub pending: i64,
    pub error: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub children: Option<Vec<StatusSnapshot>>,
}

impl StatusSnapshot {
    /// Finds a descendant (or this node) by name, depth first.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&StatusSnapshot> {
        if self.name == name {
            return Some(self);
        }
        self.children
            .iter()
            .flatten()
            .find_map(|child| child.find(name))
    }

    /// Visits this node and every descendant.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a StatusSnapshot)) {
        visit(self);
        for child in self.children.iter().flatten() {
            child.walk(visit);
        }
    }
}
