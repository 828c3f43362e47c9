//! AI-generated mind maps.
//!
//! Two flavours: a JSON node/edge graph that is converted into a
//! [`MindMap`] for the manual editor, and a Mermaid `mindmap` definition.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::extract::extract_object;
use crate::gemini::{AiError, CompletionBackend, CompletionRequest, GenerationConfig};
use crate::mindmap::{
    BRANCH_STEP_X, BRANCH_STEP_Y, BranchDirection, MindEdge, MindMap, MindNode, Point,
};
use crate::retry::{RetryPolicy, retry_on_rate_limit};

/// Id the model is told to use for the main topic.
pub const ROOT_ID: &str = "1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedNode {
    pub id: String,
    pub label: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedEdge {
    #[serde(default)]
    pub id: Option<String>,
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedGraph {
    pub nodes: Vec<GeneratedNode>,
    pub edges: Vec<GeneratedEdge>,
}

impl GeneratedGraph {
    /// Fills in a star around node `1` when the model returned no edges.
    pub fn ensure_edges(&mut self) {
        if !self.edges.is_empty() {
            return;
        }
        self.edges = self
            .nodes
            .iter()
            .skip(1)
            .map(|node| GeneratedEdge {
                id: Some(format!("e{ROOT_ID}-{}", node.id)),
                source: ROOT_ID.to_string(),
                target: node.id.clone(),
            })
            .collect();
    }

    fn root_id(&self) -> Option<&str> {
        self.nodes
            .iter()
            .find(|node| node.id == ROOT_ID || node.kind.as_deref() == Some("input"))
            .or_else(|| self.nodes.first())
            .map(|node| node.id.as_str())
    }

    /// Converts into an editor map. The root becomes the center node; its
    /// children alternate right and left, and deeper levels continue
    /// outward on their parent's side. Nodes the root cannot reach are
    /// hung off the center node with their own subtrees. Edges to unknown
    /// nodes and second parents are dropped.
    pub fn into_mind_map(self) -> MindMap {
        let Some(root) = self.root_id().map(str::to_string) else {
            return MindMap::default();
        };

        let mut labels: HashMap<&str, &str> = HashMap::new();
        for node in &self.nodes {
            labels.entry(node.id.as_str()).or_insert(node.label.as_str());
        }
        let mut layout = Layout {
            labels,
            map: MindMap::empty(),
            slots: HashMap::new(),
            toggle: false,
        };

        let root_label = layout.label(&root);
        layout.map.nodes.push(MindNode::center(root.clone(), root_label));
        layout.grow(&self.edges, (root.clone(), None, Point::default()));

        for node in &self.nodes {
            if layout.map.contains_node(&node.id) {
                continue;
            }
            tracing::debug!(node = %node.id, "attaching unreachable node to the center");
            let (direction, position) = layout.attach(&root, Point::default(), None, &node.id);
            layout.grow(&self.edges, (node.id.clone(), Some(direction), position));
        }

        layout.map
    }
}

struct Layout<'a> {
    labels: HashMap<&'a str, &'a str>,
    map: MindMap,
    /// Children placed so far per parent, left then right.
    slots: HashMap<String, [usize; 2]>,
    toggle: bool,
}

impl Layout<'_> {
    fn label(&self, id: &str) -> String {
        self.labels.get(id).copied().unwrap_or_default().to_string()
    }

    /// Places `child` under `parent`, which sits at `origin`. Without a
    /// `side` the direction alternates, starting on the right.
    fn attach(
        &mut self,
        parent: &str,
        origin: Point,
        side: Option<BranchDirection>,
        child: &str,
    ) -> (BranchDirection, Point) {
        let direction = side.unwrap_or_else(|| {
            self.toggle = !self.toggle;
            if self.toggle {
                BranchDirection::Right
            } else {
                BranchDirection::Left
            }
        });
        let (index, offset) = match direction {
            BranchDirection::Left => (0, -BRANCH_STEP_X),
            BranchDirection::Right => (1, BRANCH_STEP_X),
        };
        let slot = &mut self.slots.entry(parent.to_string()).or_default()[index];
        let position = Point::new(origin.x + offset, origin.y + *slot as f32 * BRANCH_STEP_Y);
        *slot += 1;

        let label = self.label(child);
        self.map
            .nodes
            .push(MindNode::branch(child.to_string(), label, direction, position));
        let mut edge = MindEdge::new(parent.to_string(), child.to_string());
        edge.source_handle = Some(direction);
        self.map.edges.push(edge);
        (direction, position)
    }

    /// Breadth-first placement of everything reachable from `start`.
    fn grow(&mut self, edges: &[GeneratedEdge], start: (String, Option<BranchDirection>, Point)) {
        let mut frontier = vec![start];
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for (parent, side, origin) in frontier {
                for edge in edges.iter().filter(|edge| edge.source == parent) {
                    if !self.labels.contains_key(edge.target.as_str())
                        || self.map.contains_node(&edge.target)
                    {
                        continue;
                    }
                    let (direction, position) = self.attach(&parent, origin, side, &edge.target);
                    next.push((edge.target.clone(), Some(direction), position));
                }
            }
            frontier = next;
        }
    }
}

pub fn build_graph_prompt(text: &str) -> String {
    format!(
        "Create a mindmap from the following text. Return ONLY a JSON object with two arrays: 'nodes' and 'edges'.
Each node should have: id (string), label (string), and type (either 'input' for center or 'default' for others).
Each edge should have: id (string), source (node id), target (node id).
The first node (id: '{ROOT_ID}') should be the main topic.
Keep the response focused and concise.
Text: {text}"
    )
}

pub fn graph_generation_config() -> GenerationConfig {
    GenerationConfig::default().with_max_tokens(2048)
}

/// Asks the backend for a node/edge graph describing `text`.
pub async fn generate_graph<B: CompletionBackend>(
    backend: &B,
    text: &str,
) -> Result<GeneratedGraph, AiError> {
    if text.trim().is_empty() {
        return Err(AiError::EmptyInput);
    }
    let request = CompletionRequest::text(build_graph_prompt(text), graph_generation_config());
    let response = retry_on_rate_limit(RetryPolicy::default(), || backend.complete(&request)).await?;

    let mut graph: GeneratedGraph = extract_object(&response)?;
    if graph.nodes.is_empty() {
        return Err(AiError::Invalid(
            "invalid mindmap structure: no nodes".to_string(),
        ));
    }
    graph.ensure_edges();
    tracing::info!(nodes = graph.nodes.len(), edges = graph.edges.len(), "generated mind map");
    Ok(graph)
}

pub fn build_mermaid_prompt(text: &str) -> String {
    format!(
        "Turn the text below into a Mermaid mindmap. The mindmap must:
1. Cover every detail of the text.
2. Give each branch enough explanation and related detail.
3. Have a hierarchy of appropriate depth.
4. Use fairly short sentences and phrases for each branch.

Text:
{text}"
    )
}

pub fn mermaid_generation_config() -> GenerationConfig {
    GenerationConfig {
        temperature: 0.9,
        top_p: 0.95,
        top_k: 40,
        max_output_tokens: Some(8192),
    }
}

fn mermaid_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```mermaid\s*|\s*```").expect("fence pattern is valid"))
}

fn nested_parens() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\((.*?)\((.*?)\)\)").expect("nested paren pattern is valid"))
}

/// Normalizes a model-written Mermaid mindmap so it parses: fences and
/// blank lines go, each line keeps at most one `( ... )` group, and the
/// `mindmap` header is added when missing.
pub fn clean_mermaid_code(response: &str) -> String {
    let cleaned = mermaid_fence().replace_all(response, "");
    let mut lines = Vec::new();

    for line in cleaned.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let mut line = nested_parens().replace_all(line, "($1 $2)").into_owned();
        while line.contains("((") || line.contains("))") {
            line = line.replace("((", "(").replace("))", ")");
        }

        let parts: Vec<&str> = line.split('(').collect();
        if parts.len() > 2 {
            let head = parts[0];
            let content: Vec<&str> = parts[1..]
                .iter()
                .map(|part| part.trim_matches(|ch| ch == ' ' || ch == ')'))
                .collect();
            line = format!("{head}({})", content.join(" "));
        }
        lines.push(line);
    }

    let result = lines.join("\n");
    if result.trim_start().starts_with("mindmap") {
        result
    } else {
        format!("mindmap\n{result}")
    }
}

/// Asks the backend for a Mermaid mindmap of `text`.
pub async fn generate_mermaid<B: CompletionBackend>(
    backend: &B,
    text: &str,
) -> Result<String, AiError> {
    if text.trim().is_empty() {
        return Err(AiError::EmptyInput);
    }
    let request = CompletionRequest::text(build_mermaid_prompt(text), mermaid_generation_config());
    let response = retry_on_rate_limit(RetryPolicy::default(), || backend.complete(&request)).await?;
    if response.trim().is_empty() {
        return Err(AiError::EmptyResponse);
    }
    Ok(clean_mermaid_code(&response))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Canned(String);

    impl CompletionBackend for Canned {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String, AiError> {
            Ok(self.0.clone())
        }
    }

    fn node(id: &str, label: &str) -> GeneratedNode {
        GeneratedNode {
            id: id.into(),
            label: label.into(),
            kind: None,
        }
    }

    #[test]
    fn missing_edges_become_a_star() {
        let mut graph = GeneratedGraph {
            nodes: vec![node("1", "Root"), node("2", "A"), node("3", "B")],
            edges: vec![],
        };
        graph.ensure_edges();
        assert_eq!(graph.edges.len(), 2);
        assert!(graph.edges.iter().all(|edge| edge.source == "1"));
        assert_eq!(graph.edges[1].id.as_deref(), Some("e1-3"));
    }

    #[test]
    fn conversion_alternates_sides_and_keeps_one_parent() {
        let graph = GeneratedGraph {
            nodes: vec![node("1", "Root"), node("2", "A"), node("3", "B"), node("4", "A.1")],
            edges: vec![
                GeneratedEdge { id: None, source: "1".into(), target: "2".into() },
                GeneratedEdge { id: None, source: "1".into(), target: "3".into() },
                GeneratedEdge { id: None, source: "2".into(), target: "4".into() },
                GeneratedEdge { id: None, source: "3".into(), target: "4".into() },
                GeneratedEdge { id: None, source: "1".into(), target: "99".into() },
            ],
        };
        let map = graph.into_mind_map();

        assert!(map.node("1").unwrap().is_center());
        assert_eq!(map.node("2").unwrap().direction, Some(BranchDirection::Right));
        assert_eq!(map.node("3").unwrap().direction, Some(BranchDirection::Left));
        assert_eq!(map.node("4").unwrap().position, Point::new(500.0, 0.0));
        assert_eq!(map.edges.len(), 3);
        assert_eq!(map.parent_of("4"), Some("2"));
    }

    #[test]
    fn unreachable_nodes_hang_off_the_center() {
        let graph = GeneratedGraph {
            nodes: vec![node("1", "Root"), node("2", "A"), node("3", "B"), node("4", "B.1")],
            edges: vec![
                GeneratedEdge { id: None, source: "1".into(), target: "2".into() },
                GeneratedEdge { id: None, source: "3".into(), target: "4".into() },
            ],
        };
        let map = graph.into_mind_map();

        let ids: Vec<&str> = map.nodes.iter().map(|node| node.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3", "4"]);
        assert_eq!(map.parent_of("3"), Some("1"));
        assert_eq!(map.parent_of("4"), Some("3"));
        assert_eq!(map.node("3").unwrap().direction, Some(BranchDirection::Left));
        assert_eq!(map.node("4").unwrap().position, Point::new(-500.0, 0.0));
        assert!(map.validate().is_ok());
    }

    #[test]
    fn clean_mermaid_flattens_parens_and_adds_header() {
        let raw = "```mermaid\n  root((Biology (Life) ))\n\n    Cells(Unit (basic) of (life))\n```";
        let cleaned = clean_mermaid_code(raw);
        let lines: Vec<&str> = cleaned.lines().collect();
        assert_eq!(lines[0], "mindmap");
        assert!(lines.iter().skip(1).all(|line| line.matches('(').count() <= 1));
        assert!(!cleaned.contains("```"));
    }

    #[test]
    fn clean_mermaid_keeps_existing_header() {
        let cleaned = clean_mermaid_code("mindmap\n  root(Topic)\n    Child");
        assert_eq!(cleaned, "mindmap\n  root(Topic)\n    Child");
    }

    #[tokio::test]
    async fn generate_graph_accepts_fenced_object() {
        let backend = Canned(
            "```json\n{\"nodes\": [{\"id\": \"1\", \"label\": \"Sun\", \"type\": \"input\"}, {\"id\": \"2\", \"label\": \"Light\"}], \"edges\": []}\n```"
                .to_string(),
        );
        let graph = generate_graph(&backend, "the sun").await.unwrap();
        assert_eq!(graph.edges.len(), 1);
        let map = graph.into_mind_map();
        assert_eq!(map.center().unwrap().label, "Sun");
    }

    #[tokio::test]
    async fn generate_graph_requires_edges_array() {
        let backend = Canned("{\"nodes\": [{\"id\": \"1\", \"label\": \"Sun\"}]}".to_string());
        let err = generate_graph(&backend, "the sun").await.unwrap_err();
        assert!(err.to_string().starts_with("invalid AI response format"));
    }

    #[tokio::test]
    async fn generate_graph_requires_nodes_array() {
        let backend = Canned("{\"topic\": \"nothing\"}".to_string());
        let err = generate_graph(&backend, "x").await.unwrap_err();
        assert!(err.to_string().starts_with("invalid AI response format"));
    }
}
