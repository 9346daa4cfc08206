//! Resolved question graph
//!
//! Root, modules, questions and tags are nodes; ordering, activation and
//! assignment are edges. The graph is built once when the catalog loads and
//! never mutated afterwards.

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap};

use super::action::Action;

/// Node in the catalog graph
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CatalogNode {
    Root,
    Module(String),
    Question(String),
    Tag(String),
}

/// Edge in the catalog graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogEdge {
    /// Parent asks this question at the given position
    Asks(usize),
    /// Affirming the question activates the target module
    Activates,
    /// Affirming the question assigns the target tag
    Assigns,
}

#[derive(Debug, Clone)]
pub struct QuestionGraph {
    graph: DiGraph<CatalogNode, CatalogEdge>,
    node_map: HashMap<CatalogNode, NodeIndex>,
}

impl QuestionGraph {
    pub(crate) fn new() -> Self {
        let mut graph = DiGraph::new();
        let mut node_map = HashMap::new();
        let root = graph.add_node(CatalogNode::Root);
        node_map.insert(CatalogNode::Root, root);
        Self { graph, node_map }
    }

    fn node(&mut self, node: CatalogNode) -> NodeIndex {
        if let Some(idx) = self.node_map.get(&node) {
            return *idx;
        }
        let idx = self.graph.add_node(node.clone());
        self.node_map.insert(node, idx);
        idx
    }

    pub(crate) fn add_tag(&mut self, tag: &str) {
        self.node(CatalogNode::Tag(tag.to_string()));
    }

    pub(crate) fn add_module(&mut self, module: &str) {
        self.node(CatalogNode::Module(module.to_string()));
    }

    /// Attach a question to its parent (`None` = root) with its action edge
    pub(crate) fn add_question(
        &mut self,
        parent: Option<&str>,
        position: usize,
        question: &str,
        action: &Action,
    ) {
        let parent_idx = match parent {
            Some(module) => self.node(CatalogNode::Module(module.to_string())),
            None => self.node(CatalogNode::Root),
        };
        let q_idx = self.node(CatalogNode::Question(question.to_string()));
        self.graph
            .add_edge(parent_idx, q_idx, CatalogEdge::Asks(position));

        match action {
            Action::AssignTag(tag) => {
                let t_idx = self.node(CatalogNode::Tag(tag.clone()));
                self.graph.add_edge(q_idx, t_idx, CatalogEdge::Assigns);
            }
            Action::ActivateModule(module) => {
                let m_idx = self.node(CatalogNode::Module(module.clone()));
                self.graph.add_edge(q_idx, m_idx, CatalogEdge::Activates);
            }
        }
    }

    /// Tags an answer to `question` may legitimately assign
    ///
    /// For a tag question that is its own tag; for a gating question it is
    /// every tag reachable through the module it activates.
    pub fn reachable_tags(&self, question: &str) -> BTreeSet<String> {
        let mut tags = BTreeSet::new();
        let Some(start) = self
            .node_map
            .get(&CatalogNode::Question(question.to_string()))
        else {
            return tags;
        };

        let mut dfs = Dfs::new(&self.graph, *start);
        while let Some(idx) = dfs.next(&self.graph) {
            if let CatalogNode::Tag(tag) = &self.graph[idx] {
                tags.insert(tag.clone());
            }
        }
        tags
    }

    /// Tags no question assigns; only the broad pass can reach them
    pub fn unreferenced_tags(&self) -> Vec<String> {
        self.nodes_without_incoming(|node| match node {
            CatalogNode::Tag(t) => Some(t.clone()),
            _ => None,
        })
    }

    /// Modules no question activates; they can never become active
    pub fn unreachable_modules(&self) -> Vec<String> {
        self.nodes_without_incoming(|node| match node {
            CatalogNode::Module(m) => Some(m.clone()),
            _ => None,
        })
    }

    fn nodes_without_incoming<F>(&self, pick: F) -> Vec<String>
    where
        F: Fn(&CatalogNode) -> Option<String>,
    {
        let mut out: Vec<String> = self
            .graph
            .node_indices()
            .filter(|idx| {
                self.graph
                    .neighbors_directed(*idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .filter_map(|idx| pick(&self.graph[idx]))
            .collect();
        out.sort();
        out
    }

    /// Modules that activate each other in a loop
    pub fn has_activation_cycle(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}
