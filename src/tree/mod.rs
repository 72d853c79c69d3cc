//! Branching conversation tree.
//!
//! Nodes live in an arena indexed by [`NodeId`]; ids are handed out in
//! creation order and never reused, and nodes are never removed. Index 0 is a
//! virtual root that owns the first turns and is never projected.
//!
//! Every node remembers which of its children is selected. The active path is
//! the chain obtained by following those selections from the root down to a
//! leaf, so forking or switching siblings only has to move selections and
//! rebuild the path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::models::{Direction, MessageRole, MessageView};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(usize);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub role: MessageRole,
    pub content: String,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Index into `children` of the branch shown by default.
    pub selected: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiblingInfo {
    /// 1-based position among the parent's children.
    pub position: usize,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "TreeSnapshot", into = "TreeSnapshot")]
pub struct ConversationTree {
    nodes: Vec<Node>,
    active_path: Vec<NodeId>,
}

/// Persisted form; the active path is rebuilt from the selections on load.
#[derive(Serialize, Deserialize)]
struct TreeSnapshot {
    nodes: Vec<Node>,
}

impl From<ConversationTree> for TreeSnapshot {
    fn from(tree: ConversationTree) -> Self {
        TreeSnapshot { nodes: tree.nodes }
    }
}

impl TryFrom<TreeSnapshot> for ConversationTree {
    type Error = AppError;

    fn try_from(snapshot: TreeSnapshot) -> Result<Self, Self::Error> {
        ConversationTree::from_nodes(snapshot.nodes)
    }
}

impl Default for ConversationTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationTree {
    pub fn new() -> Self {
        let root = Node {
            id: NodeId::ROOT,
            role: MessageRole::System,
            content: String::new(),
            parent: None,
            children: Vec::new(),
            selected: 0,
            created_at: Utc::now(),
        };
        Self { nodes: vec![root], active_path: Vec::new() }
    }

    /// Rebuilds a tree from persisted nodes, rejecting anything structurally
    /// inconsistent.
    pub fn from_nodes(nodes: Vec<Node>) -> Result<Self, AppError> {
        let corrupt = |detail: String| AppError::persistence(format!("corrupt conversation tree: {detail}"));

        match nodes.first() {
            None => return Err(corrupt("no root node".to_string())),
            Some(root) if root.parent.is_some() => {
                return Err(corrupt("root node has a parent".to_string()));
            }
            Some(_) => {}
        }

        let mut child_total = 0;
        for (index, node) in nodes.iter().enumerate() {
            if node.id.0 != index {
                return Err(corrupt(format!("node at index {index} carries id {}", node.id)));
            }
            if index > 0 {
                // Parents are always created before their children.
                match node.parent {
                    Some(parent) if parent.0 < index => {
                        if !nodes[parent.0].children.contains(&node.id) {
                            return Err(corrupt(format!("node {index} missing from its parent")));
                        }
                    }
                    _ => return Err(corrupt(format!("node {index} has an invalid parent"))),
                }
            }
            for child in &node.children {
                match nodes.get(child.0) {
                    Some(c) if c.parent == Some(node.id) => {}
                    _ => return Err(corrupt(format!("node {index} lists foreign child {child}"))),
                }
            }
            if !node.children.is_empty() && node.selected >= node.children.len() {
                return Err(corrupt(format!("node {index} selects a missing child")));
            }
            child_total += node.children.len();
        }
        if child_total != nodes.len() - 1 {
            return Err(corrupt("a node is listed under more than one parent".to_string()));
        }

        let mut tree = Self { nodes, active_path: Vec::new() };
        tree.refresh_active_path();
        Ok(tree)
    }

    #[cfg(test)]
    pub fn active_path(&self) -> &[NodeId] {
        &self.active_path
    }

    pub fn is_empty(&self) -> bool {
        self.active_path.is_empty()
    }

    /// Number of real nodes (root excluded), across every branch.
    pub fn node_count(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    fn get(&self, id: NodeId) -> Result<&Node, AppError> {
        self.nodes.get(id.0).ok_or_else(|| AppError::NotFound {
            entity_type: "Node".to_string(),
            id: id.to_string(),
        })
    }

    /// Last node of the active path, or the root when the tree is empty.
    pub fn leaf(&self) -> NodeId {
        self.active_path.last().copied().unwrap_or(NodeId::ROOT)
    }

    fn push_child(&mut self, parent: NodeId, role: MessageRole, content: String) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            id,
            role,
            content,
            parent: Some(parent),
            children: Vec::new(),
            selected: 0,
            created_at: Utc::now(),
        });
        let parent = &mut self.nodes[parent.0];
        parent.children.push(id);
        parent.selected = parent.children.len() - 1;
        id
    }

    /// Adds a new child under the active leaf and makes it the new leaf.
    pub fn append_to_active_path(&mut self, role: MessageRole, content: impl Into<String>) -> NodeId {
        let id = self.push_child(self.leaf(), role, content.into());
        self.active_path.push(id);
        id
    }

    /// Level 0 is the last message of the active path, level 1 its
    /// predecessor, and so on.
    pub fn resolve_level(&self, level: usize) -> Result<NodeId, AppError> {
        let len = self.active_path.len();
        if level >= len {
            return Err(AppError::OutOfRange { level, len });
        }
        Ok(self.active_path[len - 1 - level])
    }

    /// Creates a new child of `node` and routes the active path through it.
    /// Whatever used to hang below `node` stays in the tree as a sibling branch.
    pub fn fork_at(
        &mut self,
        node: NodeId,
        role: MessageRole,
        content: impl Into<String>,
    ) -> Result<NodeId, AppError> {
        self.get(node)?;
        let id = self.push_child(node, role, content.into());
        self.select_towards(node);
        self.refresh_active_path();
        Ok(id)
    }

    /// Moves the parent's selection one step from `node`. Returns the newly
    /// selected sibling, or `None` when `node` is already first/last.
    pub fn set_active_sibling(
        &mut self,
        node: NodeId,
        direction: Direction,
    ) -> Result<Option<NodeId>, AppError> {
        let parent = self
            .get(node)?
            .parent
            .ok_or_else(|| AppError::invalid_state("the root has no siblings"))?;
        let siblings = &self.nodes[parent.0].children;
        let position = siblings
            .iter()
            .position(|c| *c == node)
            .ok_or_else(|| AppError::Unexpected(format!("node {node} missing from its parent")))?;

        let target = match direction {
            Direction::Prev => position.checked_sub(1),
            Direction::Next => (position + 1 < siblings.len()).then_some(position + 1),
        };
        let Some(target) = target else {
            return Ok(None);
        };

        let selected = siblings[target];
        self.nodes[parent.0].selected = target;
        self.select_towards(parent);
        self.refresh_active_path();
        Ok(Some(selected))
    }

    pub fn sibling_info(&self, node: NodeId) -> SiblingInfo {
        let parent = self.node(node).and_then(|n| n.parent).and_then(|p| self.node(p));
        match parent {
            Some(parent) => SiblingInfo {
                position: parent.children.iter().position(|c| *c == node).map_or(1, |p| p + 1),
                count: parent.children.len(),
            },
            None => SiblingInfo { position: 1, count: 1 },
        }
    }

    /// Extends a node's content; used while a generation streams into it.
    pub fn append_content(&mut self, node: NodeId, text: &str) -> Result<(), AppError> {
        self.get(node)?;
        self.nodes[node.0].content.push_str(text);
        Ok(())
    }

    /// Nodes from the first turn down to `node`, root excluded.
    pub fn path_to(&self, node: NodeId) -> Vec<NodeId> {
        let mut path = Vec::new();
        let mut current = Some(node);
        while let Some(id) = current {
            if id == NodeId::ROOT {
                break;
            }
            path.push(id);
            current = self.node(id).and_then(|n| n.parent);
        }
        path.reverse();
        path
    }

    /// Read-only rendering of the active path sent to clients.
    pub fn projection(&self) -> Vec<MessageView> {
        self.active_path
            .iter()
            .filter_map(|id| self.node(*id))
            .map(|node| {
                let info = self.sibling_info(node.id);
                MessageView {
                    role: node.role,
                    content: node.content.clone(),
                    sibling_info: (info.position, info.count),
                }
            })
            .collect()
    }

    /// First user message on the active path; used to label unnamed chats.
    pub fn preview(&self) -> Option<&str> {
        self.active_path
            .iter()
            .filter_map(|id| self.node(*id))
            .find(|n| n.role == MessageRole::User)
            .map(|n| n.content.as_str())
    }

    /// Points every ancestor's selection at the chain leading to `node`.
    fn select_towards(&mut self, node: NodeId) {
        let mut child = node;
        while let Some(parent) = self.nodes[child.0].parent {
            if let Some(position) = self.nodes[parent.0].children.iter().position(|c| *c == child) {
                self.nodes[parent.0].selected = position;
            }
            child = parent;
        }
    }

    fn refresh_active_path(&mut self) {
        self.active_path.clear();
        let mut current = NodeId::ROOT;
        loop {
            let node = &self.nodes[current.0];
            match node.children.get(node.selected) {
                Some(&next) => {
                    self.active_path.push(next);
                    current = next;
                }
                None => break,
            }
        }
    }
}
