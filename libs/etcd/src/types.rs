//! Wire types of the v2 keys API.

use std::fmt;

use serde::Deserialize;

/// `errorCode` returned when the requested key does not exist.
pub const KEY_NOT_FOUND: u32 = 100;

/// `errorCode` returned when a watch asks for an index that has already
/// been dropped from the event history.
pub const EVENT_INDEX_CLEARED: u32 = 401;

/// The action reported for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    Get,
    Set,
    Create,
    Update,
    Delete,
    Expire,
    CompareAndSwap,
    CompareAndDelete,
    #[serde(other)]
    Unknown,
}

impl Action {
    /// True for actions that leave the node holding a (new) value.
    pub fn is_put(self) -> bool {
        matches!(
            self,
            Action::Set | Action::Create | Action::Update | Action::CompareAndSwap
        )
    }

    /// True for actions that remove the node.
    pub fn is_removal(self) -> bool {
        matches!(
            self,
            Action::Delete | Action::Expire | Action::CompareAndDelete
        )
    }
}

/// A key or directory in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Absolute key. Empty for the root directory.
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub dir: bool,
    /// Children, present on directory reads.
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub created_index: u64,
    #[serde(default)]
    pub modified_index: u64,
    #[serde(default)]
    pub ttl: Option<i64>,
    #[serde(default)]
    pub expiration: Option<String>,
}

impl Node {
    /// All non-directory nodes at or below this one, depth first.
    pub fn leaves(&self) -> Vec<&Node> {
        let mut out = Vec::new();
        collect_leaves(self, &mut out);
        out
    }

    /// Highest modified index in this subtree.
    pub fn max_modified_index(&self) -> u64 {
        self.nodes
            .iter()
            .map(Node::max_modified_index)
            .fold(self.modified_index, u64::max)
    }
}

fn collect_leaves<'a>(node: &'a Node, out: &mut Vec<&'a Node>) {
    if !node.dir {
        out.push(node);
        return;
    }
    for child in &node.nodes {
        collect_leaves(child, out);
    }
}

/// A successful keys API response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub action: Action,
    pub node: Node,
    #[serde(default)]
    pub prev_node: Option<Node>,
    /// Store index at the time of the response, from `X-Etcd-Index`.
    #[serde(skip)]
    pub etcd_index: Option<u64>,
}

/// An error body returned by the keys API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub error_code: u32,
    pub message: String,
    #[serde(default)]
    pub cause: Option<String>,
    /// Store index at the time of the error.
    #[serde(default)]
    pub index: u64,
}

impl ApiError {
    pub fn is_key_not_found(&self) -> bool {
        self.error_code == KEY_NOT_FOUND
    }

    pub fn is_index_cleared(&self) -> bool {
        self.error_code == EVENT_INDEX_CLEARED
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {}", self.message, self.error_code)?;
        if let Some(cause) = &self.cause {
            write!(f, ", cause {cause}")?;
        }
        write!(f, ", index {})", self.index)
    }
}
