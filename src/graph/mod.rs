// This module implements the graph IR: an arena of nodes addressed by stable NodeId handles,
// each node holding a LayerSpec, ordered predecessor and successor lists and the optional
// quantization record, plus a separate vector giving the topological order. Topology only
// changes through insert, delete_and_splice and replace, each of which keeps the edge lists
// mutual and the order topological. Deleted nodes leave a hole in the arena so handles held by
// a pass stay unambiguous while it iterates. verify() checks the full set of IR invariants and
// is called at the pipeline boundary and from the tests.

//! Layer graph IR.

pub mod layer;
pub mod tensor;

use std::fmt;
use std::fmt::Write as _;

use hashbrown::HashSet;

use crate::core::{CompileError, CompileResult, Quantization};

pub use layer::{
    Activation, BatchNorm, Conv, DType, Dense, LayerKind, LayerSpec, Pool, SampleNormMode, Shape,
    SliceRange,
};
pub use tensor::{Tensor, TensorData};

/// Stable handle of a node in a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// One layer instance with its edges.
#[derive(Debug, Clone)]
pub struct Node {
    pub spec: LayerSpec,
    pub q: Option<Quantization>,
    preds: Vec<NodeId>,
    succs: Vec<NodeId>,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn preds(&self) -> &[NodeId] {
        &self.preds
    }

    pub fn succs(&self) -> &[NodeId] {
        &self.succs
    }
}

/// Directed acyclic layer graph kept in topological order.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Option<Node>>,
    order: Vec<NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the graph input. Must be the first node.
    pub fn add_input(&mut self, spec: LayerSpec) -> CompileResult<NodeId> {
        if !self.order.is_empty() {
            return Err(CompileError::structural(&spec.name, "graph already has an input"));
        }
        if !spec.is_input() {
            return Err(CompileError::structural(
                &spec.name,
                format!("first node must be an Input layer, got {}", spec.kind.name()),
            ));
        }
        Ok(self.alloc(spec, Vec::new(), Vec::new(), 0))
    }

    /// Link a new node between `preds` and `succs`.
    ///
    /// The node is appended to the order when it has no successors, and placed
    /// right before its earliest successor otherwise.
    pub fn insert(&mut self, spec: LayerSpec, preds: &[NodeId], succs: &[NodeId]) -> CompileResult<NodeId> {
        if self.order.is_empty() {
            return Err(CompileError::structural(&spec.name, "graph has no input node"));
        }
        for &id in preds.iter().chain(succs) {
            if !self.contains(id) {
                return Err(CompileError::structural(
                    &spec.name,
                    format!("neighbour {id} is not in the graph"),
                ));
            }
        }

        let pos = succs
            .iter()
            .filter_map(|&s| self.position(s))
            .min()
            .unwrap_or(self.order.len());
        if pos == 0 {
            return Err(CompileError::structural(&spec.name, "cannot insert before the graph input"));
        }
        for &p in preds {
            if self.position(p).is_some_and(|pp| pp >= pos) {
                return Err(CompileError::structural(
                    &spec.name,
                    format!("predecessor '{}' does not precede the insertion point", self.node(p).name()),
                ));
            }
        }

        let id = self.alloc(spec, preds.to_vec(), succs.to_vec(), pos);
        for &p in preds {
            self.node_mut(p).succs.push(id);
        }
        for &s in succs {
            self.node_mut(s).preds.push(id);
        }
        Ok(id)
    }

    /// Remove a node, connecting its predecessors straight to its successors.
    ///
    /// Each neighbour's edge to the deleted node is replaced in place by the
    /// deleted node's own neighbours, in order. Duplicate edges are kept.
    pub fn delete_and_splice(&mut self, id: NodeId) -> CompileResult<()> {
        let Some(pos) = self.position(id) else {
            return Err(CompileError::structural(id.to_string(), "node is not in the graph"));
        };
        if pos == 0 {
            return Err(CompileError::structural(self.node(id).name(), "cannot delete the graph input"));
        }

        let Some(node) = self.nodes[id.index()].take() else {
            return Err(CompileError::structural(id.to_string(), "node is not in the graph"));
        };
        self.order.remove(pos);

        for &p in &node.preds {
            splice(&mut self.node_mut(p).succs, id, &node.succs);
        }
        for &s in &node.succs {
            splice(&mut self.node_mut(s).preds, id, &node.preds);
        }
        Ok(())
    }

    /// Put `spec` in place of `old`, keeping all of `old`'s edges.
    pub fn replace(&mut self, old: NodeId, spec: LayerSpec) -> CompileResult<NodeId> {
        let Some(pos) = self.position(old) else {
            return Err(CompileError::structural(&spec.name, format!("node {old} is not in the graph")));
        };
        if pos == 0 && !spec.is_input() {
            return Err(CompileError::structural(&spec.name, "graph input can only be replaced by an Input layer"));
        }
        let Some(node) = self.nodes[old.index()].take() else {
            return Err(CompileError::structural(&spec.name, format!("node {old} is not in the graph")));
        };
        self.order.remove(pos);

        let id = self.alloc(spec, node.preds.clone(), node.succs.clone(), pos);
        self.node_mut(id).q = node.q;
        for &p in &node.preds {
            splice(&mut self.node_mut(p).succs, old, &[id]);
        }
        for &s in &node.succs {
            splice(&mut self.node_mut(s).preds, old, &[id]);
        }
        Ok(id)
    }

    fn alloc(&mut self, spec: LayerSpec, preds: Vec<NodeId>, succs: Vec<NodeId>, pos: usize) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Some(Node { spec, q: None, preds, succs }));
        self.order.insert(pos, id);
        id
    }

    pub fn contains(&self, id: NodeId) -> bool {
        matches!(self.nodes.get(id.index()), Some(Some(_)))
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    /// Node behind a handle this graph handed out.
    ///
    /// Panics if the node was deleted, which is a pipeline bug.
    pub fn node(&self, id: NodeId) -> &Node {
        match self.get(id) {
            Some(node) => node,
            None => panic!("node {id} is not in the graph"),
        }
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        match self.nodes.get_mut(id.index()).and_then(Option::as_mut) {
            Some(node) => node,
            None => panic!("node {id} is not in the graph"),
        }
    }

    /// Node handles in topological order.
    pub fn ids(&self) -> &[NodeId] {
        &self.order
    }

    /// Nodes in topological order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.order.iter().map(move |&id| self.node(id))
    }

    pub fn position(&self, id: NodeId) -> Option<usize> {
        self.order.iter().position(|&o| o == id)
    }

    pub fn input(&self) -> Option<NodeId> {
        self.order.first().copied()
    }

    pub fn output(&self) -> Option<NodeId> {
        self.order.last().copied()
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.order.iter().copied().find(|&id| self.node(id).name() == name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Check every structural invariant of the IR.
    pub fn verify(&self) -> CompileResult<()> {
        let Some(&first) = self.order.first() else {
            return Err(CompileError::structural("<graph>", "graph is empty"));
        };
        let last = self.order.len() - 1;
        let mut names = HashSet::new();

        for (pos, &id) in self.order.iter().enumerate() {
            let Some(node) = self.get(id) else {
                return Err(CompileError::structural(id.to_string(), "ordered node is missing from the arena"));
            };
            let name = node.name();
            if !names.insert(name) {
                return Err(CompileError::structural(name, "duplicate layer name"));
            }

            if id == first {
                if !node.spec.is_input() || !node.preds.is_empty() {
                    return Err(CompileError::structural(name, "first node must be an Input without predecessors"));
                }
            } else {
                if node.spec.is_input() {
                    return Err(CompileError::structural(name, "graph has more than one input"));
                }
                if node.preds.is_empty() {
                    return Err(CompileError::structural(name, "node has no predecessors"));
                }
            }
            if pos != last && node.succs.is_empty() {
                return Err(CompileError::structural(name, "only the last node may be a sink"));
            }
            if pos == last && !node.succs.is_empty() {
                return Err(CompileError::structural(name, "last node must not have successors"));
            }

            for &p in &node.preds {
                let Some(pred) = self.get(p) else {
                    return Err(CompileError::structural(name, format!("dangling predecessor {p}")));
                };
                if count(&pred.succs, id) != count(&node.preds, p) {
                    return Err(CompileError::structural(name, format!("edge from '{}' is not mutual", pred.name())));
                }
                if self.position(p).map_or(true, |pp| pp >= pos) {
                    return Err(CompileError::structural(name, format!("predecessor '{}' comes later in the order", pred.name())));
                }
            }
            for &s in &node.succs {
                let Some(succ) = self.get(s) else {
                    return Err(CompileError::structural(name, format!("dangling successor {s}")));
                };
                if count(&succ.preds, id) != count(&node.succs, s) {
                    return Err(CompileError::structural(name, format!("edge to '{}' is not mutual", succ.name())));
                }
            }
        }
        Ok(())
    }

    /// True if every node comes after all of its predecessors.
    pub fn is_topologically_ordered(&self) -> bool {
        self.order.iter().enumerate().all(|(pos, &id)| {
            self.node(id)
                .preds
                .iter()
                .all(|&p| self.position(p).is_some_and(|pp| pp < pos))
        })
    }

    /// Graphviz rendering of the edges.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph {\n");
        for node in self.nodes() {
            for &s in &node.succs {
                let _ = writeln!(out, "\t\"{}\" -> \"{}\"", node.name(), self.node(s).name());
            }
        }
        out.push_str("}\n");
        out
    }
}

fn count(list: &[NodeId], id: NodeId) -> usize {
    list.iter().filter(|&&x| x == id).count()
}

/// Replace the first occurrence of `target` in `list` by `with`.
fn splice(list: &mut Vec<NodeId>, target: NodeId, with: &[NodeId]) {
    if let Some(index) = list.iter().position(|&x| x == target) {
        list.splice(index..=index, with.iter().copied());
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pad = 24;
        let header = format!(
            "{:<pad$} | {:<pad$} | {:<pad$} | {:<pad$} | {:<pad$}",
            "Inputs", "Layer", "Outputs", "Input shape", "Output shape"
        );
        let rule = "-".repeat(header.len());
        writeln!(f, "{rule}\n{header}\n{rule}")?;
        for node in self.nodes() {
            let ins: Vec<_> = node.preds.iter().map(|&p| self.node(p).name()).collect();
            let outs: Vec<_> = node.succs.iter().map(|&s| self.node(s).name()).collect();
            let in_shapes: Vec<_> = node.spec.input_shapes.iter().map(|s| format!("{s:?}")).collect();
            let out_shape = format!("{:?}", node.spec.output_shape());
            let layer = format!("{} ({})", node.name(), node.spec.kind.name());
            let rows = ins.len().max(outs.len()).max(in_shapes.len()).max(1);
            for row in 0..rows {
                writeln!(
                    f,
                    "{:<pad$} | {:<pad$} | {:<pad$} | {:<pad$} | {:<pad$}",
                    ins.get(row).copied().unwrap_or(""),
                    if row == 0 { layer.as_str() } else { "" },
                    outs.get(row).copied().unwrap_or(""),
                    in_shapes.get(row).map(String::as_str).unwrap_or(""),
                    if row == 0 { out_shape.as_str() } else { "" },
                )?;
            }
            writeln!(f, "{rule}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(name: &str, kind: LayerKind) -> LayerSpec {
        LayerSpec::new(name, kind, vec![vec![1, 4]], vec![vec![1, 4]])
    }

    fn chain() -> (Graph, NodeId, NodeId, NodeId) {
        let mut g = Graph::new();
        let input = g.add_input(LayerSpec::input("input", vec![1, 4])).unwrap();
        let id = g.insert(layer("id", LayerKind::Identity), &[input], &[]).unwrap();
        let out = g.insert(layer("out", LayerKind::Activation(Activation::Relu)), &[id], &[]).unwrap();
        (g, input, id, out)
    }

    #[test]
    fn test_insert_links_mutually() {
        let (g, input, id, out) = chain();
        assert_eq!(g.node(input).succs(), &[id]);
        assert_eq!(g.node(id).preds(), &[input]);
        assert_eq!(g.node(out).preds(), &[id]);
        assert_eq!(g.ids(), &[input, id, out]);
        g.verify().unwrap();
    }

    #[test]
    fn test_insert_unknown_neighbour_fails() {
        let (mut g, _, id, _) = chain();
        g.delete_and_splice(id).unwrap();
        let err = g.insert(layer("x", LayerKind::Identity), &[id], &[]).unwrap_err();
        assert!(matches!(err, CompileError::Structural { .. }));
    }

    #[test]
    fn test_insert_before_successor() {
        let (mut g, input, id, out) = chain();
        let mid = g.insert(layer("mid", LayerKind::Identity), &[input], &[id]).unwrap();
        assert_eq!(g.ids(), &[input, mid, id, out]);
        assert_eq!(g.node(id).preds(), &[input, mid]);
        assert!(g.is_topologically_ordered());
    }

    #[test]
    fn test_insert_cannot_break_order() {
        let (mut g, input, id, out) = chain();
        let err = g.insert(layer("bad", LayerKind::Identity), &[out], &[id]).unwrap_err();
        assert!(matches!(err, CompileError::Structural { .. }));
        assert_eq!(g.ids(), &[input, id, out]);
    }

    #[test]
    fn test_delete_and_splice() {
        let (mut g, input, id, out) = chain();
        g.delete_and_splice(id).unwrap();
        assert_eq!(g.node(input).succs(), &[out]);
        assert_eq!(g.node(out).preds(), &[input]);
        assert!(!g.contains(id));
        g.verify().unwrap();
    }

    #[test]
    fn test_delete_keeps_duplicate_edges() {
        let mut g = Graph::new();
        let x = g.add_input(LayerSpec::input("x", vec![1, 4])).unwrap();
        let drop = g.insert(layer("drop", LayerKind::Dropout { rate: 0.5 }), &[x], &[]).unwrap();
        let add = g
            .insert(layer("add", LayerKind::Add { activation: Activation::Linear }), &[x, drop], &[])
            .unwrap();
        g.delete_and_splice(drop).unwrap();
        assert_eq!(g.node(add).preds(), &[x, x]);
        assert_eq!(g.node(x).succs(), &[add, add]);
        g.verify().unwrap();
    }

    #[test]
    fn test_delete_splices_in_successor_order() {
        let mut g = Graph::new();
        let x = g.add_input(LayerSpec::input("x", vec![1, 4])).unwrap();
        let a = g.insert(layer("a", LayerKind::Identity), &[x], &[]).unwrap();
        let b = g.insert(layer("b", LayerKind::Identity), &[x], &[]).unwrap();
        let mid = g.insert(layer("mid", LayerKind::Identity), &[a], &[]).unwrap();
        let c = g.insert(layer("c", LayerKind::Identity), &[mid], &[]).unwrap();
        let d = g.insert(layer("d", LayerKind::Identity), &[mid], &[]).unwrap();
        g.delete_and_splice(mid).unwrap();
        assert_eq!(g.node(a).succs(), &[c, d]);
        assert_eq!(g.node(x).succs(), &[a, b]);
    }

    #[test]
    fn test_delete_input_fails() {
        let (mut g, input, _, _) = chain();
        assert!(g.delete_and_splice(input).is_err());
    }

    #[test]
    fn test_replace_keeps_edges_and_position() {
        let (mut g, input, id, out) = chain();
        let new = g.replace(id, layer("flat", LayerKind::Flatten)).unwrap();
        assert_eq!(g.ids(), &[input, new, out]);
        assert_eq!(g.node(input).succs(), &[new]);
        assert_eq!(g.node(out).preds(), &[new]);
        assert_eq!(g.node(new).name(), "flat");
        g.verify().unwrap();
    }

    #[test]
    fn test_verify_rejects_second_sink() {
        let (mut g, input, _, _) = chain();
        g.insert(layer("dangling", LayerKind::Identity), &[input], &[]).unwrap();
        // "out" is no longer the last node but has no successors.
        assert!(g.verify().is_err());
    }

    #[test]
    fn test_find_and_display() {
        let (g, _, id, _) = chain();
        assert_eq!(g.find("id"), Some(id));
        assert_eq!(g.find("missing"), None);
        let table = g.to_string();
        assert!(table.contains("id (Identity)"));
        assert!(g.to_dot().contains("\"input\" -> \"id\""));
    }
}
