use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

pub const CENTER_NODE_ID: &str = "center";
pub const DEFAULT_LABEL: &str = "Click to edit";
pub const BRANCH_LABEL: &str = "New Branch";

/// Horizontal distance between a parent and a new branch.
pub const BRANCH_STEP_X: f32 = 250.0;
/// Vertical distance between siblings on the same side.
pub const BRANCH_STEP_Y: f32 = 100.0;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MindMapError {
    #[error("node '{0}' not found")]
    NodeNotFound(String),
    #[error("edge '{0}' not found")]
    EdgeNotFound(String),
    #[error("node '{0}' cannot be connected to itself")]
    SelfLoop(String),
    #[error("node '{0}' already has an incoming edge")]
    TargetAlreadyConnected(String),
    #[error("the center node cannot be the target of a connection")]
    CenterAsTarget,
    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),
    #[error("duplicate edge id '{0}'")]
    DuplicateEdge(String),
    #[error("edge '{0}' points at a missing node")]
    DanglingEdge(String),
    #[error("a mind map needs exactly one center node, found {0}")]
    CenterCount(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchDirection {
    Left,
    Right,
}

impl BranchDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchDirection::Left => "left",
            BranchDirection::Right => "right",
        }
    }

    fn sign(&self) -> f32 {
        match self {
            BranchDirection::Left => -1.0,
            BranchDirection::Right => 1.0,
        }
    }
}

impl std::str::FromStr for BranchDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "left" | "l" => Ok(BranchDirection::Left),
            "right" | "r" => Ok(BranchDirection::Right),
            other => Err(format!("unknown branch direction '{other}'; expected left or right")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Center,
    Branch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MindNode {
    pub id: String,
    pub kind: NodeKind,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<BranchDirection>,
    pub position: Point,
    #[serde(default)]
    pub selected: bool,
}

impl MindNode {
    pub fn center(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Center,
            label: label.into(),
            color: None,
            direction: None,
            position: Point::default(),
            selected: false,
        }
    }

    pub fn branch(
        id: impl Into<String>,
        label: impl Into<String>,
        direction: BranchDirection,
        position: Point,
    ) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Branch,
            label: label.into(),
            color: None,
            direction: Some(direction),
            position,
            selected: false,
        }
    }

    pub fn is_center(&self) -> bool {
        self.kind == NodeKind::Center
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MarkerKind {
    #[default]
    None,
    Arrow,
    Diamond,
}

impl MarkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarkerKind::None => "none",
            MarkerKind::Arrow => "arrow",
            MarkerKind::Diamond => "diamond",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeStyle {
    pub stroke_width: f32,
    pub marker_start: MarkerKind,
    pub marker_end: MarkerKind,
    pub opacity: f32,
}

impl Default for EdgeStyle {
    fn default() -> Self {
        Self {
            stroke_width: 2.0,
            marker_start: MarkerKind::None,
            marker_end: MarkerKind::None,
            opacity: 1.0,
        }
    }
}

/// Partial update for an edge's style; `None` keeps the current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeStylePatch {
    #[serde(default)]
    pub stroke_width: Option<f32>,
    #[serde(default)]
    pub marker_start: Option<MarkerKind>,
    #[serde(default)]
    pub marker_end: Option<MarkerKind>,
    #[serde(default)]
    pub opacity: Option<f32>,
}

impl EdgeStyle {
    pub fn apply(&mut self, patch: &EdgeStylePatch) {
        if let Some(width) = patch.stroke_width {
            self.stroke_width = width.clamp(1.0, 10.0);
        }
        if let Some(marker) = patch.marker_start {
            self.marker_start = marker;
        }
        if let Some(marker) = patch.marker_end {
            self.marker_end = marker;
        }
        if let Some(opacity) = patch.opacity {
            self.opacity = opacity.clamp(0.0, 1.0);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MindEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<BranchDirection>,
    #[serde(default)]
    pub style: EdgeStyle,
}

impl MindEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: edge_identifier(&source, &target),
            source,
            target,
            source_handle: None,
            style: EdgeStyle::default(),
        }
    }
}

pub fn edge_identifier(source: &str, target: &str) -> String {
    format!("e{source}-{target}")
}

/// Node and edge ids reached from a set of roots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subtree {
    pub node_ids: HashSet<String>,
    pub edge_ids: HashSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MindMap {
    pub nodes: Vec<MindNode>,
    pub edges: Vec<MindEdge>,
}

impl Default for MindMap {
    fn default() -> Self {
        Self {
            nodes: vec![MindNode::center(CENTER_NODE_ID, DEFAULT_LABEL)],
            edges: Vec::new(),
        }
    }
}

impl MindMap {
    pub fn empty() -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn node(&self, id: &str) -> Option<&MindNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut MindNode> {
        self.nodes.iter_mut().find(|node| node.id == id)
    }

    pub fn edge(&self, id: &str) -> Option<&MindEdge> {
        self.edges.iter().find(|edge| edge.id == id)
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.node(id).is_some()
    }

    pub fn center(&self) -> Option<&MindNode> {
        self.nodes.iter().find(|node| node.is_center())
    }

    pub fn children_of<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a MindNode> + 'a {
        self.edges
            .iter()
            .filter(move |edge| edge.source == id)
            .filter_map(|edge| self.node(&edge.target))
    }

    pub fn parent_of(&self, id: &str) -> Option<&str> {
        self.edges
            .iter()
            .find(|edge| edge.target == id)
            .map(|edge| edge.source.as_str())
    }

    pub fn has_incoming(&self, id: &str) -> bool {
        self.edges.iter().any(|edge| edge.target == id)
    }

    pub fn selected_ids(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|node| node.selected)
            .map(|node| node.id.clone())
            .collect()
    }

    /// Collects `root`, everything reachable along outgoing edges, and every
    /// edge touching one of those nodes. Revisits are skipped, so cycles
    /// terminate.
    pub fn subtree(&self, root: &str) -> Subtree {
        let mut result = Subtree::default();
        self.collect_subtree(root, &mut result);
        result
    }

    /// Union of [`MindMap::subtree`] over several roots.
    pub fn subtrees<'a>(&self, roots: impl IntoIterator<Item = &'a str>) -> Subtree {
        let mut result = Subtree::default();
        for root in roots {
            self.collect_subtree(root, &mut result);
        }
        result
    }

    fn collect_subtree(&self, root: &str, result: &mut Subtree) {
        let mut stack = vec![root.to_string()];
        while let Some(current) = stack.pop() {
            if !result.node_ids.insert(current.clone()) {
                continue;
            }
            for edge in &self.edges {
                if edge.source == current || edge.target == current {
                    result.edge_ids.insert(edge.id.clone());
                }
                if edge.source == current && !result.node_ids.contains(&edge.target) {
                    stack.push(edge.target.clone());
                }
            }
        }
    }

    /// Drops every node and edge named in `subtree`. Returns whether
    /// anything was removed.
    pub fn remove(&mut self, subtree: &Subtree) -> bool {
        let before = (self.nodes.len(), self.edges.len());
        self.nodes.retain(|node| !subtree.node_ids.contains(&node.id));
        self.edges.retain(|edge| {
            !subtree.edge_ids.contains(&edge.id)
                && !subtree.node_ids.contains(&edge.source)
                && !subtree.node_ids.contains(&edge.target)
        });
        before != (self.nodes.len(), self.edges.len())
    }

    pub fn set_color(&mut self, root: &str, color: &str) -> Result<usize, MindMapError> {
        if !self.contains_node(root) {
            return Err(MindMapError::NodeNotFound(root.to_string()));
        }
        let subtree = self.subtree(root);
        let mut touched = 0;
        for node in self.nodes.iter_mut() {
            if subtree.node_ids.contains(&node.id) {
                node.color = Some(color.to_string());
                touched += 1;
            }
        }
        Ok(touched)
    }

    /// Number of children of `parent` whose branch direction is `direction`.
    pub fn branch_count(&self, parent: &str, direction: BranchDirection) -> usize {
        self.children_of(parent)
            .filter(|node| node.direction == Some(direction))
            .count()
    }

    /// Position for the next `direction` branch under `parent`, stacked
    /// below the existing branches on that side.
    pub fn next_branch_position(&self, parent: &MindNode, direction: BranchDirection) -> Point {
        let existing = self.branch_count(&parent.id, direction) as f32;
        Point {
            x: parent.position.x + direction.sign() * BRANCH_STEP_X,
            y: parent.position.y + existing * BRANCH_STEP_Y,
        }
    }

    pub fn validate_connection(&self, source: &str, target: &str) -> Result<(), MindMapError> {
        if !self.contains_node(source) {
            return Err(MindMapError::NodeNotFound(source.to_string()));
        }
        let target_node = self
            .node(target)
            .ok_or_else(|| MindMapError::NodeNotFound(target.to_string()))?;
        if source == target {
            return Err(MindMapError::SelfLoop(source.to_string()));
        }
        if target_node.is_center() {
            return Err(MindMapError::CenterAsTarget);
        }
        if self.has_incoming(target) {
            return Err(MindMapError::TargetAlreadyConnected(target.to_string()));
        }
        Ok(())
    }

    /// Checks a whole map, e.g. one received over the wire: unique node and
    /// edge ids, exactly one center node, edges between existing nodes, and
    /// every node with at most one parent.
    pub fn validate(&self) -> Result<(), MindMapError> {
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(MindMapError::DuplicateNode(node.id.clone()));
            }
        }
        let centers = self.nodes.iter().filter(|node| node.is_center()).count();
        if centers != 1 {
            return Err(MindMapError::CenterCount(centers));
        }

        let mut edge_ids = HashSet::new();
        let mut targets = HashSet::new();
        for edge in &self.edges {
            if !edge_ids.insert(edge.id.as_str()) {
                return Err(MindMapError::DuplicateEdge(edge.id.clone()));
            }
            if !ids.contains(edge.source.as_str()) || !ids.contains(edge.target.as_str()) {
                return Err(MindMapError::DanglingEdge(edge.id.clone()));
            }
            if edge.source == edge.target {
                return Err(MindMapError::SelfLoop(edge.source.clone()));
            }
            if self.node(&edge.target).is_some_and(MindNode::is_center) {
                return Err(MindMapError::CenterAsTarget);
            }
            if !targets.insert(edge.target.as_str()) {
                return Err(MindMapError::TargetAlreadyConnected(edge.target.clone()));
            }
        }
        Ok(())
    }

    /// Writes the map as a Mermaid flowchart. Nodes are listed in insertion
    /// order, followed by edges.
    pub fn to_mermaid(&self) -> String {
        let aliases: HashMap<&str, String> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| (node.id.as_str(), mermaid_alias(&node.id, idx)))
            .collect();

        let mut lines = vec!["graph LR".to_string()];
        for node in &self.nodes {
            let alias = &aliases[node.id.as_str()];
            let label = escape_mermaid_label(&node.label);
            match node.kind {
                NodeKind::Center => lines.push(format!("    {alias}(({label}))")),
                NodeKind::Branch => lines.push(format!("    {alias}[{label}]")),
            }
        }
        for edge in &self.edges {
            let (Some(from), Some(to)) = (
                aliases.get(edge.source.as_str()),
                aliases.get(edge.target.as_str()),
            ) else {
                continue;
            };
            let arrow = if edge.style.marker_end == MarkerKind::None {
                "---"
            } else {
                "-->"
            };
            lines.push(format!("    {from} {arrow} {to}"));
        }
        for node in &self.nodes {
            if let Some(color) = &node.color {
                let alias = &aliases[node.id.as_str()];
                lines.push(format!("    style {alias} fill:{color}"));
            }
        }

        let mut output = lines.join("\n");
        output.push('\n');
        output
    }
}

fn mermaid_alias(id: &str, idx: usize) -> String {
    if !id.is_empty() && id.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
        id.to_string()
    } else {
        format!("n{idx}")
    }
}

fn escape_mermaid_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|ch| match ch {
            '[' | ']' | '(' | ')' | '{' | '}' | '|' => ' ',
            '"' => '\'',
            other => other,
        })
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        " ".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MindMap {
        let mut map = MindMap::default();
        map.nodes.push(MindNode::branch("a", "A", BranchDirection::Right, Point::new(250.0, 0.0)));
        map.nodes.push(MindNode::branch("b", "B", BranchDirection::Right, Point::new(500.0, 0.0)));
        map.nodes.push(MindNode::branch("c", "C", BranchDirection::Left, Point::new(-250.0, 0.0)));
        map.edges.push(MindEdge::new(CENTER_NODE_ID, "a"));
        map.edges.push(MindEdge::new("a", "b"));
        map.edges.push(MindEdge::new(CENTER_NODE_ID, "c"));
        map
    }

    #[test]
    fn subtree_follows_outgoing_edges_only() {
        let map = sample();
        let subtree = map.subtree("a");
        assert_eq!(
            subtree.node_ids,
            HashSet::from(["a".to_string(), "b".to_string()])
        );
        assert!(subtree.edge_ids.contains("ecenter-a"));
        assert!(subtree.edge_ids.contains("ea-b"));
        assert!(!subtree.edge_ids.contains("ecenter-c"));
    }

    #[test]
    fn subtree_terminates_on_cycles() {
        let mut map = sample();
        map.edges.push(MindEdge::new("b", "a"));
        let subtree = map.subtree("a");
        assert_eq!(subtree.node_ids.len(), 2);
    }

    #[test]
    fn set_color_reaches_descendants() {
        let mut map = sample();
        let touched = map.set_color("a", "#ff0000").unwrap();
        assert_eq!(touched, 2);
        assert_eq!(map.node("b").unwrap().color.as_deref(), Some("#ff0000"));
        assert_eq!(map.node("c").unwrap().color, None);
        assert_eq!(map.node(CENTER_NODE_ID).unwrap().color, None);
    }

    #[test]
    fn validate_connection_rejects_second_parent() {
        let map = sample();
        assert_eq!(
            map.validate_connection("c", "b"),
            Err(MindMapError::TargetAlreadyConnected("b".to_string()))
        );
        assert_eq!(
            map.validate_connection("a", CENTER_NODE_ID),
            Err(MindMapError::CenterAsTarget)
        );
        assert_eq!(
            map.validate_connection("a", "a"),
            Err(MindMapError::SelfLoop("a".to_string()))
        );
    }

    #[test]
    fn edge_style_patch_clamps_values() {
        let mut style = EdgeStyle::default();
        style.apply(&EdgeStylePatch {
            stroke_width: Some(40.0),
            marker_end: Some(MarkerKind::Arrow),
            opacity: Some(1.5),
            ..Default::default()
        });
        assert_eq!(style.stroke_width, 10.0);
        assert_eq!(style.marker_end, MarkerKind::Arrow);
        assert_eq!(style.marker_start, MarkerKind::None);
        assert_eq!(style.opacity, 1.0);
    }

    #[test]
    fn mermaid_export_lists_nodes_and_edges() {
        let map = sample();
        let mermaid = map.to_mermaid();
        assert!(mermaid.starts_with("graph LR\n"));
        assert!(mermaid.contains("center((Click to edit))"));
        assert!(mermaid.contains("a[A]"));
        assert!(mermaid.contains("a --- b"));
    }

    #[test]
    fn validate_rejects_broken_maps() {
        assert_eq!(sample().validate(), Ok(()));

        let mut duplicate = sample();
        duplicate.nodes.push(MindNode::branch("a", "A again", BranchDirection::Left, Point::default()));
        assert_eq!(duplicate.validate(), Err(MindMapError::DuplicateNode("a".to_string())));

        let mut two_centers = sample();
        two_centers.nodes.push(MindNode::center("x", "Other"));
        assert_eq!(two_centers.validate(), Err(MindMapError::CenterCount(2)));
        assert_eq!(MindMap::empty().validate(), Err(MindMapError::CenterCount(0)));

        let mut second_parent = sample();
        second_parent.edges.push(MindEdge::new("c", "b"));
        assert_eq!(
            second_parent.validate(),
            Err(MindMapError::TargetAlreadyConnected("b".to_string()))
        );

        let mut dangling = sample();
        dangling.edges.push(MindEdge::new("a", "ghost"));
        assert_eq!(dangling.validate(), Err(MindMapError::DanglingEdge("ea-ghost".to_string())));
    }
}
