// This module implements the Program Graph, the owned control-flow graph the backend
// consumes. Nodes live in an arena owned by ProgramGraph and are addressed by NodeId
// handles; edges are plain handles and every node keeps one predecessor entry per
// incoming edge, so the in-degree is explicit. Removing a node rewrites its predecessors
// to its follower and releases any node whose in-degree drops to zero, followed by a
// reachability sweep that collects cyclic regions nothing can reach any more. The graph
// also provides depth-first traversal with per-node marks, reverse post-order, a
// compacting deep clone that reports the node-to-node map, validation of the structural
// invariants the generator relies on, and a Graphviz dump.

//! Owned control-flow graph of intermediate statements.

pub mod statement;
pub mod value;
pub mod walk;

use std::cell::Cell;
use std::fmt::Write as _;

use hashbrown::{HashMap, HashSet};

use crate::core::{CompileError, CompileResult};

pub use statement::{validate_op_table, Op, OpInfo, ResultShape, Statement, StmtInfo};
pub use value::{
    Operand, Semantic, SemanticKind, Swizzle, TextureDims, TextureInfo, Value, ValueId,
    ValueKind, ValueTable,
};
pub use walk::{GraphVisitor, StatementNumbering, ValueUses, WrittenValues};

/// Handle of a node in a [`ProgramGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Whether the program runs per vertex or per fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramKind {
    Vertex,
    Fragment,
}

impl ProgramKind {
    pub fn name(self) -> &'static str {
        match self {
            ProgramKind::Vertex => "vertex",
            ProgramKind::Fragment => "fragment",
        }
    }
}

/// A conditional successor: taken when the scalar `cond` is positive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    pub cond: Operand,
    pub target: NodeId,
}

/// A basic block with its outgoing edges.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: Option<String>,
    pub block: Option<Vec<Statement>>,
    /// Conditional successors, tested in order.
    pub succs: Vec<Edge>,
    /// Taken when no conditional successor is.
    pub follower: Option<NodeId>,
    /// Temporaries declared locally to this node.
    pub decls: Vec<ValueId>,
    preds: Vec<NodeId>,
    marked: Cell<bool>,
}

impl Node {
    fn new(name: Option<&str>) -> Self {
        Self {
            name: name.map(str::to_string),
            block: None,
            succs: Vec::new(),
            follower: None,
            decls: Vec::new(),
            preds: Vec::new(),
            marked: Cell::new(false),
        }
    }

    pub fn statements(&self) -> &[Statement] {
        self.block.as_deref().unwrap_or(&[])
    }

    /// One entry per incoming edge.
    pub fn preds(&self) -> &[NodeId] {
        &self.preds
    }

    /// Conditional targets in order, then the follower.
    pub fn successors(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.succs
            .iter()
            .map(|e| e.target)
            .chain(self.follower)
    }

    pub fn is_marked(&self) -> bool {
        self.marked.get()
    }

    pub fn set_marked(&self, marked: bool) {
        self.marked.set(marked);
    }
}

/// The program graph: an arena of nodes plus the declared values.
#[derive(Debug, Clone)]
pub struct ProgramGraph {
    pub kind: ProgramKind,
    nodes: Vec<Option<Node>>,
    entry: NodeId,
    exit: NodeId,
    values: ValueTable,
}

impl ProgramGraph {
    /// Create a graph with empty entry and exit nodes.
    pub fn new(kind: ProgramKind) -> Self {
        let mut graph = Self {
            kind,
            nodes: Vec::new(),
            entry: NodeId(0),
            exit: NodeId(0),
            values: ValueTable::new(),
        };
        graph.entry = graph.add_node(Some("entry"));
        graph.exit = graph.add_node(Some("exit"));
        graph
    }

    pub fn entry(&self) -> NodeId {
        self.entry
    }

    pub fn exit(&self) -> NodeId {
        self.exit
    }

    pub fn values(&self) -> &ValueTable {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut ValueTable {
        &mut self.values
    }

    /// Create a node owned by the graph.
    pub fn add_node(&mut self, name: Option<&str>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Some(Node::new(name)));
        id
    }

    pub fn contains(&self, id: NodeId) -> bool {
        matches!(self.nodes.get(id.index()), Some(Some(_)))
    }

    pub fn node(&self, id: NodeId) -> &Node {
        match self.nodes.get(id.index()) {
            Some(Some(node)) => node,
            _ => panic!("dangling node handle {:?}", id),
        }
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        match self.nodes.get_mut(id.index()) {
            Some(Some(node)) => node,
            _ => panic!("dangling node handle {:?}", id),
        }
    }

    /// Live nodes in arena order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_some())
            .map(|(i, _)| NodeId(i as u32))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    /// Display name of a node.
    pub fn node_name(&self, id: NodeId) -> String {
        match &self.node(id).name {
            Some(name) => name.clone(),
            None => format!("n{}", id.0),
        }
    }

    pub fn push_statement(&mut self, id: NodeId, stmt: Statement) {
        self.node_mut(id).block.get_or_insert_with(Vec::new).push(stmt);
    }

    /// Set the unconditional follower of `from`.
    ///
    /// # Panics
    /// If `from` already has a follower.
    pub fn append(&mut self, from: NodeId, to: NodeId) {
        assert!(
            self.node(from).follower.is_none(),
            "node {:?} already has a follower",
            from
        );
        assert!(self.contains(to), "dangling node handle {:?}", to);
        self.node_mut(from).follower = Some(to);
        self.node_mut(to).preds.push(from);
    }

    /// Add a conditional successor to `from`.
    pub fn append_cond(&mut self, from: NodeId, cond: Operand, to: NodeId) {
        assert_eq!(cond.size(), 1, "branch condition must be scalar");
        assert!(self.contains(to), "dangling node handle {:?}", to);
        self.node_mut(from).succs.push(Edge { cond, target: to });
        self.node_mut(to).preds.push(from);
    }

    /// Redirect every edge of `node` that targets `old` to `new`.
    ///
    /// Returns the number of edges redirected. If `old` loses its last
    /// predecessor it is released.
    pub fn replace_succ(&mut self, node: NodeId, old: NodeId, new: NodeId) -> usize {
        assert!(self.contains(new), "dangling node handle {:?}", new);
        let mut count = 0;
        {
            let n = self.node_mut(node);
            for edge in &mut n.succs {
                if edge.target == old {
                    edge.target = new;
                    count += 1;
                }
            }
            if n.follower == Some(old) {
                n.follower = Some(new);
                count += 1;
            }
        }
        for _ in 0..count {
            self.remove_pred_entry(old, node);
            self.node_mut(new).preds.push(node);
        }
        if count > 0 && self.node(old).preds.is_empty() {
            self.release_from(old);
        }
        count
    }

    /// Split `id` after statement `after`. The new node takes the remaining
    /// statements and all outgoing edges; the two are left unlinked.
    pub fn split(&mut self, id: NodeId, after: usize) -> NodeId {
        let tail = self.add_node(None);
        let (stmts, succs, follower) = {
            let node = self.node_mut(id);
            let stmts = match &mut node.block {
                Some(block) if after + 1 < block.len() => block.split_off(after + 1),
                _ => Vec::new(),
            };
            (stmts, std::mem::take(&mut node.succs), node.follower.take())
        };
        for target in succs.iter().map(|e| e.target).chain(follower) {
            for p in &mut self.node_mut(target).preds {
                if *p == id {
                    *p = tail;
                    break;
                }
            }
        }
        let node = self.node_mut(tail);
        if !stmts.is_empty() {
            node.block = Some(stmts);
        }
        node.succs = succs;
        node.follower = follower;
        tail
    }

    /// Remove `id`, rewriting edges into it to target its follower.
    ///
    /// Nodes left without predecessors are released recursively and any
    /// cyclic region no longer reachable from the entry is swept.
    pub fn remove_node(&mut self, id: NodeId) {
        assert!(
            id != self.entry && id != self.exit,
            "cannot remove entry or exit"
        );
        let Some(follower) = self.node(id).follower else {
            panic!("removed node {:?} has no follower", id);
        };
        assert!(follower != id, "removed node {:?} follows itself", id);

        let mut preds: Vec<NodeId> = self.node(id).preds.clone();
        preds.sort();
        preds.dedup();
        for p in preds {
            if p != id {
                self.replace_succ(p, id, follower);
            }
        }
        if self.contains(id) {
            self.release_from(id);
        }
        self.sweep_unreachable();
        assert!(
            self.reachable().contains(&self.exit),
            "exit unreachable after removing {:?}",
            id
        );
    }

    fn remove_pred_entry(&mut self, node: NodeId, pred: NodeId) {
        let preds = &mut self.node_mut(node).preds;
        if let Some(pos) = preds.iter().position(|p| *p == pred) {
            preds.swap_remove(pos);
        }
    }

    /// Release `start` and every node that loses its last predecessor as a
    /// consequence.
    fn release_from(&mut self, start: NodeId) {
        let mut worklist = vec![start];
        while let Some(id) = worklist.pop() {
            if !self.contains(id) || id == self.entry || id == self.exit {
                continue;
            }
            let Some(node) = self.nodes[id.index()].take() else {
                continue;
            };
            log::trace!("releasing node {:?}", id);
            for target in node.successors() {
                if target == id || !self.contains(target) {
                    continue;
                }
                self.remove_pred_entry(target, id);
                if self.node(target).preds.is_empty() {
                    worklist.push(target);
                }
            }
        }
    }

    /// Release every node not reachable from the entry.
    pub fn sweep_unreachable(&mut self) -> usize {
        let reachable = self.reachable();
        let dead: Vec<NodeId> = self
            .node_ids()
            .filter(|id| !reachable.contains(id) && *id != self.exit)
            .collect();
        for id in &dead {
            if let Some(node) = self.nodes[id.index()].take() {
                for target in node.successors() {
                    if self.contains(target) {
                        self.remove_pred_entry(target, *id);
                    }
                }
            }
        }
        if !dead.is_empty() {
            log::debug!("swept {} unreachable nodes", dead.len());
        }
        dead.len()
    }

    fn reachable(&self) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut stack = vec![self.entry];
        while let Some(id) = stack.pop() {
            if seen.insert(id) {
                stack.extend(self.node(id).successors());
            }
        }
        seen
    }

    pub fn clear_marks(&self) {
        for node in self.nodes.iter().flatten() {
            node.set_marked(false);
        }
    }

    /// Depth-first pre-order from the entry, conditional successors first.
    pub fn dfs_order(&self) -> Vec<NodeId> {
        self.clear_marks();
        let mut order = Vec::new();
        let mut stack = vec![self.entry];
        while let Some(id) = stack.pop() {
            let node = self.node(id);
            if node.is_marked() {
                continue;
            }
            node.set_marked(true);
            order.push(id);
            let succs: Vec<NodeId> = node.successors().collect();
            for succ in succs.into_iter().rev() {
                if !self.node(succ).is_marked() {
                    stack.push(succ);
                }
            }
        }
        self.clear_marks();
        order
    }

    /// Reverse post-order from the entry.
    pub fn rpo(&self) -> Vec<NodeId> {
        let mut post = Vec::new();
        let mut stack = vec![(self.entry, false)];
        let mut visited = HashSet::new();
        while let Some((node, processed)) = stack.pop() {
            if processed {
                post.push(node);
                continue;
            }
            if !visited.insert(node) {
                continue;
            }
            stack.push((node, true));
            let succs: Vec<NodeId> = self.node(node).successors().collect();
            for succ in succs.into_iter().rev() {
                stack.push((succ, false));
            }
        }
        post.reverse();
        post
    }

    /// Rebuild every predecessor list from the edges.
    pub fn compute_predecessors(&mut self) {
        let ids: Vec<NodeId> = self.node_ids().collect();
        for id in &ids {
            self.node_mut(*id).preds.clear();
        }
        for id in ids {
            let succs: Vec<NodeId> = self.node(id).successors().collect();
            for succ in succs {
                self.node_mut(succ).preds.push(id);
            }
        }
    }

    /// Copy the graph, compacting node handles. Returns the copy and the map
    /// from original to copied handles.
    pub fn deep_clone(&self) -> (ProgramGraph, HashMap<NodeId, NodeId>) {
        let mut map = HashMap::new();
        let mut nodes = Vec::with_capacity(self.node_count());
        for id in self.node_ids() {
            map.insert(id, NodeId(nodes.len() as u32));
            nodes.push(id);
        }
        let remap = |id: &NodeId| map[id];
        let mut copy = ProgramGraph {
            kind: self.kind,
            nodes: Vec::with_capacity(nodes.len()),
            entry: remap(&self.entry),
            exit: remap(&self.exit),
            values: self.values.clone(),
        };
        for id in &nodes {
            let mut node = self.node(*id).clone();
            node.set_marked(false);
            for edge in &mut node.succs {
                edge.target = remap(&edge.target);
            }
            node.follower = node.follower.as_ref().map(remap);
            node.preds = node.preds.iter().map(remap).collect();
            copy.nodes.push(Some(node));
        }
        (copy, map)
    }

    /// Check the invariants the generator relies on.
    pub fn validate(&self) -> CompileResult<()> {
        let exit = self.node(self.exit);
        if !exit.succs.is_empty() || exit.follower.is_some() {
            return Err(CompileError::invariant("exit node has successors"));
        }
        let reachable = self.reachable();
        if !reachable.contains(&self.exit) {
            return Err(CompileError::invariant("exit is unreachable from entry"));
        }
        for id in self.node_ids() {
            let node = self.node(id);
            for target in node.successors() {
                if !self.contains(target) {
                    return Err(CompileError::invariant(format!(
                        "{} has an edge to a released node",
                        self.node_name(id)
                    )));
                }
            }
            if !reachable.contains(&id) {
                continue;
            }
            if id != self.exit && node.follower.is_none() {
                return Err(CompileError::invariant(format!(
                    "{} has no follower",
                    self.node_name(id)
                )));
            }
            for edge in &node.succs {
                if edge.cond.size() != 1 {
                    return Err(CompileError::invariant(format!(
                        "{} branches on a non-scalar condition",
                        self.node_name(id)
                    )));
                }
            }
            for stmt in node.statements() {
                if stmt.src.len() != stmt.op.info().arity
                    || stmt.dest.is_some() != stmt.op.has_result()
                {
                    return Err(CompileError::invariant(format!(
                        "malformed {} statement in {}",
                        stmt.op,
                        self.node_name(id)
                    )));
                }
                if let Some(dest) = &stmt.dest {
                    let kind = self.values.get(dest.value).kind;
                    if !dest.swizzle.is_mask() {
                        return Err(CompileError::invariant(format!(
                            "{} writes {}.{} with a repeated component",
                            stmt.op,
                            self.values.get(dest.value).name,
                            dest.swizzle
                        )));
                    }
                    if kind == ValueKind::Texture {
                        return Err(CompileError::invariant(format!(
                            "{} writes texture {}",
                            stmt.op,
                            self.values.get(dest.value).name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Graphviz rendering of the graph.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph program {\n");
        for id in self.node_ids() {
            let node = self.node(id);
            let mut label = self.node_name(id);
            for stmt in node.statements() {
                let _ = write!(label, "\\l{}", stmt.op);
            }
            let _ = writeln!(out, "  n{} [shape=box, label=\"{}\"];", id.0, label);
            for edge in &node.succs {
                let _ = writeln!(
                    out,
                    "  n{} -> n{} [style=dashed, label=\"{}.{}\"];",
                    id.0,
                    edge.target.0,
                    self.values.get(edge.cond.value).name,
                    edge.cond.swizzle
                );
            }
            if let Some(f) = node.follower {
                let _ = writeln!(out, "  n{} -> n{};", id.0, f.0);
            }
        }
        out.push_str("}\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond_value(graph: &mut ProgramGraph) -> Operand {
        let c = graph.values_mut().add(Value::input("c", 1));
        graph.values().operand(c)
    }

    fn diamond() -> (ProgramGraph, [NodeId; 3]) {
        let mut graph = ProgramGraph::new(ProgramKind::Fragment);
        let c = cond_value(&mut graph);
        let a = graph.add_node(Some("a"));
        let b = graph.add_node(Some("b"));
        let join = graph.add_node(Some("join"));
        let entry = graph.entry();
        let exit = graph.exit();
        graph.append_cond(entry, c, a);
        graph.append(entry, b);
        graph.append(a, join);
        graph.append(b, join);
        graph.append(join, exit);
        (graph, [a, b, join])
    }

    #[test]
    fn test_diamond_edges_and_preds() {
        let (graph, [a, b, join]) = diamond();
        assert_eq!(graph.node(join).preds().len(), 2);
        let succs: Vec<_> = graph.node(graph.entry()).successors().collect();
        assert_eq!(succs, vec![a, b]);
        graph.validate().unwrap();
        assert_eq!(graph.dfs_order()[..2], [graph.entry(), a]);
        assert_eq!(graph.rpo().last(), Some(&graph.exit()));
    }

    #[test]
    #[should_panic(expected = "already has a follower")]
    fn test_second_follower_panics() {
        let (mut graph, [a, b, _]) = diamond();
        graph.append(a, b);
    }

    #[test]
    fn test_split_moves_tail_and_edges() {
        let mut graph = ProgramGraph::new(ProgramKind::Fragment);
        let t = graph.values_mut().add(Value::temp("t", 1));
        let op = graph.values().operand(t);
        let entry = graph.entry();
        let exit = graph.exit();
        for _ in 0..3 {
            graph.push_statement(entry, Statement::new(Op::Asn, Some(op), vec![op]));
        }
        graph.append(entry, exit);

        let tail = graph.split(entry, 0);
        assert_eq!(graph.node(entry).statements().len(), 1);
        assert_eq!(graph.node(tail).statements().len(), 2);
        assert_eq!(graph.node(tail).follower, Some(exit));
        assert_eq!(graph.node(exit).preds(), &[tail]);
        assert!(graph.node(entry).follower.is_none());
    }

    #[test]
    fn test_remove_node_rewrites_preds() {
        let (mut graph, [a, _, join]) = diamond();
        graph.remove_node(a);
        assert!(!graph.contains(a));
        assert_eq!(graph.node(graph.entry()).succs[0].target, join);
        assert_eq!(graph.node(join).preds().len(), 2);
        graph.validate().unwrap();
    }

    #[test]
    fn test_release_collects_cycles() {
        let mut graph = ProgramGraph::new(ProgramKind::Fragment);
        let c = cond_value(&mut graph);
        let bridge = graph.add_node(Some("bridge"));
        let head = graph.add_node(Some("head"));
        let body = graph.add_node(Some("body"));
        let (entry, exit) = (graph.entry(), graph.exit());
        graph.append(entry, bridge);
        graph.append_cond(bridge, c, head);
        graph.append(bridge, exit);
        graph.append(head, body);
        graph.append_cond(body, c, head);
        graph.append(body, exit);

        // Dropping the only edge into the loop leaves head/body referencing
        // each other; both must be collected.
        graph.node_mut(bridge).succs.clear();
        graph.compute_predecessors();
        assert_eq!(graph.sweep_unreachable(), 2);
        assert!(!graph.contains(head) && !graph.contains(body));
        assert_eq!(graph.node(exit).preds(), &[bridge]);
    }

    #[test]
    fn test_replace_succ_releases_orphan() {
        let (mut graph, [a, b, join]) = diamond();
        let entry = graph.entry();
        assert_eq!(graph.replace_succ(entry, a, b), 1);
        assert!(!graph.contains(a));
        assert_eq!(graph.node(join).preds(), &[b]);
        assert_eq!(graph.node(b).preds().len(), 2);
    }

    #[test]
    fn test_deep_clone_preserves_structure() {
        let (mut graph, [a, _, _]) = diamond();
        graph.remove_node(a);
        let (copy, map) = graph.deep_clone();
        assert_eq!(copy.node_count(), graph.node_count());
        for id in graph.node_ids() {
            let orig: Vec<_> = graph.node(id).successors().map(|s| map[&s]).collect();
            let cloned: Vec<_> = copy.node(map[&id]).successors().collect();
            assert_eq!(orig, cloned);
        }
        copy.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_missing_follower() {
        let mut graph = ProgramGraph::new(ProgramKind::Vertex);
        let dangling = graph.add_node(None);
        let (entry, exit) = (graph.entry(), graph.exit());
        graph.append(entry, dangling);
        let c = cond_value(&mut graph);
        graph.append_cond(dangling, c, exit);
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("no follower"));
    }

    #[test]
    fn test_dot_output() {
        let (graph, _) = diamond();
        let dot = graph.to_dot();
        assert!(dot.starts_with("digraph program"));
        assert!(dot.contains("style=dashed"));
    }
}
