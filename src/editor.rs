use std::collections::HashSet;

use crate::history::History;
use crate::mindmap::{
    BRANCH_LABEL, BranchDirection, EdgeStylePatch, MindEdge, MindMap, MindMapError, MindNode,
    Point, edge_identifier,
};

/// Manual mind-map editor: the live map plus its undo/redo history.
///
/// Every mutating method snapshots the map before changing it. Methods that
/// end up changing nothing leave the history alone.
#[derive(Debug, Clone)]
pub struct MindMapEditor {
    map: MindMap,
    history: History<MindMap>,
    next_id: u64,
}

impl Default for MindMapEditor {
    fn default() -> Self {
        Self::new(MindMap::default())
    }
}

impl MindMapEditor {
    pub fn new(map: MindMap) -> Self {
        let next_id = next_free_id(&map);
        Self {
            map,
            history: History::default(),
            next_id,
        }
    }

    pub fn map(&self) -> &MindMap {
        &self.map
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    fn snapshot(&mut self) {
        self.history.record(self.map.clone());
    }

    fn allocate_id(&mut self) -> String {
        loop {
            self.next_id += 1;
            let candidate = format!("node_{}", self.next_id);
            if !self.map.contains_node(&candidate) {
                return candidate;
            }
        }
    }

    /// Adds a `direction` branch under `parent_id` and returns its id, or
    /// `None` when the parent does not exist.
    pub fn add_branch(&mut self, parent_id: &str, direction: BranchDirection) -> Option<String> {
        let parent = self.map.node(parent_id)?.clone();
        self.snapshot();

        let id = self.allocate_id();
        let position = self.map.next_branch_position(&parent, direction);
        let mut node = MindNode::branch(id.clone(), BRANCH_LABEL, direction, position);
        node.color = parent.color.clone();
        self.map.nodes.push(node);

        let mut edge = MindEdge::new(parent_id, id.clone());
        edge.source_handle = Some(direction);
        self.map.edges.push(edge);

        tracing::debug!(parent = parent_id, node = %id, direction = direction.as_str(), "added branch");
        Some(id)
    }

    /// Deletes `node_id` and its whole subtree. Returns the removed node ids.
    pub fn delete_node(&mut self, node_id: &str) -> HashSet<String> {
        self.delete_roots(&[node_id.to_string()])
    }

    /// Deletes every selected node together with its subtree.
    pub fn delete_selected(&mut self) -> HashSet<String> {
        let roots = self.map.selected_ids();
        self.delete_roots(&roots)
    }

    fn delete_roots(&mut self, roots: &[String]) -> HashSet<String> {
        let existing: Vec<&str> = roots
            .iter()
            .map(String::as_str)
            .filter(|id| self.map.contains_node(id))
            .collect();
        if existing.is_empty() {
            return HashSet::new();
        }

        let subtree = self.map.subtrees(existing);
        self.snapshot();
        self.map.remove(&subtree);
        tracing::debug!(removed = subtree.node_ids.len(), "deleted subtree");
        subtree.node_ids
    }

    /// Recolors `node_id` and all its descendants.
    pub fn change_color(&mut self, node_id: &str, color: &str) -> Result<usize, MindMapError> {
        if !self.map.contains_node(node_id) {
            return Err(MindMapError::NodeNotFound(node_id.to_string()));
        }
        self.snapshot();
        self.map.set_color(node_id, color)
    }

    pub fn rename(&mut self, node_id: &str, label: &str) -> Result<(), MindMapError> {
        if !self.map.contains_node(node_id) {
            return Err(MindMapError::NodeNotFound(node_id.to_string()));
        }
        self.snapshot();
        if let Some(node) = self.map.node_mut(node_id) {
            node.label = label.to_string();
        }
        Ok(())
    }

    pub fn move_node(&mut self, node_id: &str, position: Point) -> Result<(), MindMapError> {
        if !self.map.contains_node(node_id) {
            return Err(MindMapError::NodeNotFound(node_id.to_string()));
        }
        self.snapshot();
        if let Some(node) = self.map.node_mut(node_id) {
            node.position = position;
        }
        Ok(())
    }

    /// Replaces the selection. Selection is view state and is not recorded
    /// in history; unknown ids are ignored.
    pub fn set_selected<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>) {
        let wanted: HashSet<&str> = ids.into_iter().collect();
        for node in self.map.nodes.iter_mut() {
            node.selected = wanted.contains(node.id.as_str());
        }
    }

    /// Adds an edge `source -> target` after validating it. The target must
    /// be a branch node without a parent.
    pub fn connect(&mut self, source: &str, target: &str) -> Result<String, MindMapError> {
        self.map.validate_connection(source, target)?;
        self.snapshot();
        let mut edge = MindEdge::new(source, target);
        if self.map.edge(&edge.id).is_some() {
            edge.id = format!("{}-{}", edge_identifier(source, target), self.map.edges.len());
        }
        let id = edge.id.clone();
        self.map.edges.push(edge);
        Ok(id)
    }

    pub fn update_edge_style(
        &mut self,
        edge_id: &str,
        patch: &EdgeStylePatch,
    ) -> Result<(), MindMapError> {
        if self.map.edge(edge_id).is_none() {
            return Err(MindMapError::EdgeNotFound(edge_id.to_string()));
        }
        self.snapshot();
        if let Some(edge) = self.map.edges.iter_mut().find(|edge| edge.id == edge_id) {
            edge.style.apply(patch);
        }
        Ok(())
    }

    /// Replaces the whole map, e.g. with an AI-generated one. Recorded so
    /// the previous map can be restored. A map that fails
    /// [`MindMap::validate`] is rejected and nothing changes.
    pub fn replace(&mut self, map: MindMap) -> Result<(), MindMapError> {
        map.validate()?;
        self.snapshot();
        self.next_id = self.next_id.max(next_free_id(&map));
        self.map = map;
        Ok(())
    }

    pub fn undo(&mut self) -> bool {
        self.history.undo(&mut self.map)
    }

    pub fn redo(&mut self) -> bool {
        self.history.redo(&mut self.map)
    }
}

/// Highest numeric suffix among `node_N` ids, so freshly allocated ids
/// continue after anything already in the map.
fn next_free_id(map: &MindMap) -> u64 {
    map.nodes
        .iter()
        .filter_map(|node| node.id.strip_prefix("node_"))
        .filter_map(|suffix| suffix.parse::<u64>().ok())
        .max()
        .unwrap_or(0)
}
