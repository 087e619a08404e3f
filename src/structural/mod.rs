// This module implements the Structural Analyzer. It builds a depth-first spanning tree
// over a frozen ProgramGraph (one leaf per reachable node), then repeatedly walks the tree
// in post-order trying, in priority order, to match a straight-line chain (reducing any
// section-marker pair inside it first), an if or if-else diamond, and a cyclic region found
// through the reach-under set of back edges. A match is merged into a new region node whose
// edges are rewritten to the merged node with duplicate edges coalesced (unconditional
// edges win). The fixpoint ends when no pattern matches; any remaining top-level nodes are
// wrapped into a root irreducible region so the result is always a single tree whose
// leaves are exactly the reachable graph nodes.

//! Structural region analysis.

use std::collections::VecDeque;
use std::fmt::Write as _;

use hashbrown::{HashMap, HashSet};

use crate::graph::{NodeId, Op, Operand, ProgramGraph};

/// Handle of a node in a [`StructuralTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SId(pub u32);

impl SId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Recognized control shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    Leaf,
    Block,
    Section,
    If,
    IfElse,
    SelfLoop,
    WhileLoop,
    Irreducible,
}

impl RegionKind {
    pub fn name(self) -> &'static str {
        match self {
            RegionKind::Leaf => "LEAF",
            RegionKind::Block => "BLOCK",
            RegionKind::Section => "SECTION",
            RegionKind::If => "IF",
            RegionKind::IfElse => "IFELSE",
            RegionKind::SelfLoop => "SELFLOOP",
            RegionKind::WhileLoop => "WHILELOOP",
            RegionKind::Irreducible => "IRREDUCIBLE",
        }
    }

    pub fn is_loop(self) -> bool {
        matches!(self, RegionKind::SelfLoop | RegionKind::WhileLoop)
    }
}

/// A structural edge. `cond` is `None` for an unconditional edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SEdge {
    pub cond: Option<Operand>,
    pub node: SId,
}

/// A region (or a leaf wrapping one graph node).
#[derive(Debug, Clone)]
pub struct SNode {
    pub kind: RegionKind,
    /// The wrapped graph node of a leaf.
    pub cfg: Option<NodeId>,
    /// Member regions in execution order.
    pub members: Vec<SId>,
    /// Region this node was merged into.
    pub container: Option<SId>,
    pub sec_start: bool,
    pub sec_end: bool,
    pub section_name: Option<String>,
    succs: Vec<SEdge>,
    preds: Vec<SEdge>,
    parent: Option<SId>,
    children: Vec<SId>,
    /// Smallest depth-first discovery index of any leaf inside.
    order: usize,
}

impl SNode {
    fn new(kind: RegionKind, cfg: Option<NodeId>, order: usize) -> Self {
        Self {
            kind,
            cfg,
            members: Vec::new(),
            container: None,
            sec_start: false,
            sec_end: false,
            section_name: None,
            succs: Vec::new(),
            preds: Vec::new(),
            parent: None,
            children: Vec::new(),
            order,
        }
    }

    pub fn succs(&self) -> &[SEdge] {
        &self.succs
    }

    pub fn preds(&self) -> &[SEdge] {
        &self.preds
    }

    /// Spanning-tree parent.
    pub fn parent(&self) -> Option<SId> {
        self.parent
    }
}

/// Add `edge`, or weaken an existing edge to the same node to unconditional.
fn push_edge(list: &mut Vec<SEdge>, edge: SEdge) {
    match list.iter_mut().find(|e| e.node == edge.node) {
        Some(existing) => {
            if edge.cond.is_none() {
                existing.cond = None;
            }
        }
        None => list.push(edge),
    }
}

/// The result of structural analysis.
#[derive(Debug, Clone)]
pub struct StructuralTree {
    nodes: Vec<SNode>,
    root: SId,
    leaf_map: HashMap<NodeId, SId>,
}

type Match = (RegionKind, Vec<SId>);

struct Reducer {
    nodes: Vec<SNode>,
    head: SId,
    postorder: VecDeque<SId>,
}

impl Reducer {
    fn node(&self, id: SId) -> &SNode {
        &self.nodes[id.index()]
    }

    fn node_mut(&mut self, id: SId) -> &mut SNode {
        &mut self.nodes[id.index()]
    }

    fn succs(&self, id: SId) -> &[SEdge] {
        &self.node(id).succs
    }

    fn preds(&self, id: SId) -> &[SEdge] {
        &self.node(id).preds
    }

    fn build_postorder(&mut self) {
        self.postorder.clear();
        let mut stack = vec![(self.head, false)];
        while let Some((id, done)) = stack.pop() {
            if done {
                self.postorder.push_back(id);
                continue;
            }
            stack.push((id, true));
            for child in self.node(id).children.iter().rev() {
                stack.push((*child, false));
            }
        }
    }

    /// Whether `p` lies in the spanning subtree rooted at `a`.
    fn is_descendant(&self, a: SId, p: SId) -> bool {
        let mut cur = Some(p);
        while let Some(id) = cur {
            if id == a {
                return true;
            }
            cur = self.node(id).parent;
        }
        false
    }

    fn reduce(&mut self) {
        let budget = self.nodes.len() * 4 + 16;
        let mut rounds = 0;
        loop {
            let mut changed = false;
            self.build_postorder();
            while let Some(node) = self.postorder.pop_front() {
                let found = self
                    .try_chain(node)
                    .or_else(|| self.try_conditional(node))
                    .or_else(|| self.try_cyclic(node));
                if let Some((kind, members)) = found {
                    let merged = self.merge(kind, members);
                    log::trace!(
                        "structural: {} {:?} from {:?}",
                        kind.name(),
                        merged,
                        self.node(merged).members
                    );
                    changed = true;
                }
            }
            rounds += 1;
            if !changed {
                break;
            }
            if rounds > budget {
                log::warn!("structural reduction did not converge");
                break;
            }
        }
    }

    /// Straight-line chain through `node`, or the section inside it.
    fn try_chain(&self, node: SId) -> Option<Match> {
        let mut set: VecDeque<SId> = VecDeque::new();

        let mut n = node;
        let mut p = true;
        let mut s = self.succs(n).len() == 1;
        while p && s {
            set.push_back(n);
            let next = self.succs(n)[0].node;
            if next == self.head || set.contains(&next) {
                p = false;
                break;
            }
            n = next;
            p = self.preds(n).len() == 1;
            s = self.succs(n).len() == 1;
        }
        if p && n != node {
            set.push_back(n);
        }

        n = node;
        p = self.preds(n).len() == 1;
        s = true;
        while p && s {
            if n != node {
                set.push_front(n);
            }
            let prev = self.preds(n)[0].node;
            if n == self.head || prev == node || set.contains(&prev) {
                s = false;
                break;
            }
            n = prev;
            p = self.preds(n).len() == 1;
            s = self.succs(n).len() == 1;
        }
        if s && n != node {
            set.push_front(n);
        }

        let set: Vec<SId> = set.into();
        if let Some(start) = set.iter().rposition(|m| self.node(*m).sec_start) {
            if let Some(len) = set[start..].iter().position(|m| self.node(*m).sec_end) {
                return Some((RegionKind::Section, set[start..=start + len].to_vec()));
            }
        }
        if set.len() >= 2 {
            return Some((RegionKind::Block, set));
        }
        None
    }

    fn try_conditional(&self, node: SId) -> Option<Match> {
        let succs = self.succs(node);
        if succs.len() != 2 {
            return None;
        }
        let (m, n) = (succs[0].node, succs[1].node);
        if m == node || n == node || m == n || m == self.head || n == self.head {
            return None;
        }
        let (sm, sn) = (self.succs(m), self.succs(n));
        let single_pred = |x: SId| self.preds(x).len() == 1;

        if sm.len() == 1
            && sn.len() == 1
            && sm[0].node == sn[0].node
            && sm[0].node != node
            && single_pred(m)
            && single_pred(n)
        {
            return Some((RegionKind::IfElse, vec![node, m, n]));
        }
        if sm.len() == 1 && sm[0].node == n && single_pred(m) {
            return Some((RegionKind::If, vec![node, m]));
        }
        if sn.len() == 1 && sn[0].node == m && single_pred(n) {
            return Some((RegionKind::If, vec![node, n]));
        }
        None
    }

    fn try_cyclic(&self, node: SId) -> Option<Match> {
        let mut work = Vec::new();
        for edge in self.preds(node) {
            if self.is_descendant(node, edge.node) {
                work.push(edge.node);
            }
        }
        if work.is_empty() {
            return None;
        }

        let mut seen = HashSet::new();
        let mut body = Vec::new();
        while let Some(p) = work.pop() {
            if p == node || !self.is_descendant(node, p) || !seen.insert(p) {
                continue;
            }
            body.push(p);
            work.extend(self.preds(p).iter().map(|e| e.node));
        }
        body.sort_by_key(|id| self.node(*id).order);

        let mut members = vec![node];
        members.extend(body);
        let kind = match members.len() {
            1 => RegionKind::SelfLoop,
            2 if self.succs(members[1]).len() == 1 => RegionKind::WhileLoop,
            _ => RegionKind::Irreducible,
        };
        Some((kind, members))
    }

    fn merge(&mut self, kind: RegionKind, members: Vec<SId>) -> SId {
        let new = SId(self.nodes.len() as u32);
        let first = members[0];
        let last = members[members.len() - 1];
        let order = members
            .iter()
            .map(|m| self.node(*m).order)
            .min()
            .unwrap_or(0);
        let mut region = SNode::new(kind, None, order);
        region.parent = self.node(first).parent;
        match kind {
            RegionKind::Block => {
                region.sec_start = self.node(first).sec_start;
                region.sec_end = self.node(last).sec_end;
            }
            RegionKind::If | RegionKind::IfElse => {
                region.sec_start = self.node(first).sec_start;
            }
            RegionKind::Section => {
                region.section_name = self.node(first).section_name.clone();
            }
            _ => {}
        }
        self.nodes.push(region);

        let is_member = |id: SId| members.contains(&id);
        let mut preds = Vec::new();
        let mut succs = Vec::new();
        let mut children = Vec::new();
        for (i, &m) in members.iter().enumerate() {
            for edge in self.node(m).preds.clone() {
                if i == 0 && kind == RegionKind::Block && edge.node == last {
                    push_edge(&mut preds, SEdge { cond: edge.cond, node: new });
                } else if !is_member(edge.node) {
                    push_edge(&mut preds, edge);
                }
            }
            for edge in self.node(m).succs.clone() {
                if m == last && kind == RegionKind::Block && edge.node == first {
                    push_edge(&mut succs, SEdge { cond: edge.cond, node: new });
                } else if !is_member(edge.node) {
                    push_edge(&mut succs, edge);
                }
            }
            for child in self.node(m).children.clone() {
                if !is_member(child) && !children.contains(&child) {
                    children.push(child);
                }
            }
            if let Some(parent) = self.node(m).parent {
                if !is_member(parent) {
                    let siblings = &mut self.node_mut(parent).children;
                    if siblings.contains(&new) {
                        siblings.retain(|c| *c != m);
                    } else {
                        for c in siblings.iter_mut() {
                            if *c == m {
                                *c = new;
                            }
                        }
                    }
                }
            }
            self.postorder.retain(|x| *x != m);
            self.node_mut(m).container = Some(new);
        }

        for child in &children {
            self.node_mut(*child).parent = Some(new);
        }
        for edge in &succs {
            if edge.node == new {
                continue;
            }
            let old = std::mem::take(&mut self.node_mut(edge.node).preds);
            let mut rewritten = Vec::with_capacity(old.len());
            for mut e in old {
                if is_member(e.node) {
                    e.node = new;
                }
                push_edge(&mut rewritten, e);
            }
            self.node_mut(edge.node).preds = rewritten;
        }
        for edge in &preds {
            if edge.node == new {
                continue;
            }
            let old = std::mem::take(&mut self.node_mut(edge.node).succs);
            let mut rewritten = Vec::with_capacity(old.len());
            for mut e in old {
                if is_member(e.node) {
                    e.node = new;
                }
                push_edge(&mut rewritten, e);
            }
            self.node_mut(edge.node).succs = rewritten;
        }

        // Nested blocks are spliced so a chain is a single flat block.
        let mut flat = Vec::with_capacity(members.len());
        for &m in &members {
            if kind == RegionKind::Block && self.node(m).kind == RegionKind::Block {
                for inner in self.node(m).members.clone() {
                    self.node_mut(inner).container = Some(new);
                    flat.push(inner);
                }
            } else {
                flat.push(m);
            }
        }

        {
            let region = self.node_mut(new);
            region.members = flat;
            region.preds = preds;
            region.succs = succs;
            region.children = children;
        }
        self.postorder.push_back(new);
        if members.contains(&self.head) {
            self.head = new;
        }
        new
    }
}

impl StructuralTree {
    /// Reduce `graph` into a region tree.
    pub fn analyze(graph: &ProgramGraph) -> Self {
        let mut nodes = Vec::new();
        let mut leaf_map = HashMap::new();

        // Depth-first spanning tree, conditional successors first.
        let mut stack = vec![(graph.entry(), None::<SId>)];
        while let Some((id, parent)) = stack.pop() {
            if leaf_map.contains_key(&id) {
                continue;
            }
            let sid = SId(nodes.len() as u32);
            let mut leaf = SNode::new(RegionKind::Leaf, Some(id), nodes.len());
            let stmts = graph.node(id).statements();
            if let Some(first) = stmts.first().filter(|s| s.op == Op::StartSec) {
                leaf.sec_start = true;
                leaf.section_name = first.section_name().map(str::to_string);
            }
            leaf.sec_end = stmts.last().is_some_and(|s| s.op == Op::EndSec);
            leaf.parent = parent;
            nodes.push(leaf);
            leaf_map.insert(id, sid);
            if let Some(p) = parent {
                nodes[p.index()].children.push(sid);
            }
            let succs: Vec<NodeId> = graph.node(id).successors().collect();
            for succ in succs.into_iter().rev() {
                if !leaf_map.contains_key(&succ) {
                    stack.push((succ, Some(sid)));
                }
            }
        }

        for (&id, &sid) in &leaf_map {
            let node = graph.node(id);
            let edges = node
                .succs
                .iter()
                .map(|e| (Some(e.cond), e.target))
                .chain(node.follower.map(|f| (None, f)));
            for (cond, target) in edges {
                let tsid = leaf_map[&target];
                push_edge(&mut nodes[sid.index()].succs, SEdge { cond, node: tsid });
                push_edge(&mut nodes[tsid.index()].preds, SEdge { cond, node: sid });
            }
        }
        // Edge order must not depend on map iteration order.
        for node in &mut nodes {
            if let Some(id) = node.cfg {
                let g = graph.node(id);
                let rank = |sid: SId, cfg: &HashMap<NodeId, SId>| {
                    g.successors()
                        .position(|t| cfg.get(&t) == Some(&sid))
                        .unwrap_or(usize::MAX)
                };
                node.succs.sort_by_key(|e| rank(e.node, &leaf_map));
            }
        }
        let orders: Vec<usize> = nodes.iter().map(|n| n.order).collect();
        for node in &mut nodes {
            node.preds.sort_by_key(|e| orders[e.node.index()]);
        }

        let head = leaf_map[&graph.entry()];
        let mut reducer = Reducer {
            nodes,
            head,
            postorder: VecDeque::new(),
        };
        reducer.reduce();

        let mut top: Vec<SId> = (0..reducer.nodes.len())
            .map(|i| SId(i as u32))
            .filter(|id| reducer.node(*id).container.is_none())
            .collect();
        let root = if top.len() == 1 {
            top[0]
        } else {
            log::debug!(
                "structural: wrapping {} unreduced regions in a root region",
                top.len()
            );
            top.sort_by_key(|id| reducer.node(*id).order);
            reducer.merge(RegionKind::Irreducible, top)
        };

        StructuralTree {
            nodes: reducer.nodes,
            root,
            leaf_map,
        }
    }

    pub fn root(&self) -> SId {
        self.root
    }

    pub fn node(&self, id: SId) -> &SNode {
        &self.nodes[id.index()]
    }

    pub fn kind(&self, id: SId) -> RegionKind {
        self.node(id).kind
    }

    pub fn members(&self, id: SId) -> &[SId] {
        &self.node(id).members
    }

    /// The leaf wrapping a graph node, if the node is reachable.
    pub fn leaf(&self, cfg: NodeId) -> Option<SId> {
        self.leaf_map.get(&cfg).copied()
    }

    /// Immediate container of a region.
    pub fn container(&self, id: SId) -> Option<SId> {
        self.node(id).container
    }

    /// Transitive containment: `outer` contains `inner` at any depth.
    pub fn contains(&self, outer: SId, inner: SId) -> bool {
        let mut cur = self.node(inner).container;
        while let Some(c) = cur {
            if c == outer {
                return true;
            }
            cur = self.node(c).container;
        }
        false
    }

    /// Whether graph node `cfg` lies inside region `id` (or is its leaf).
    pub fn contains_cfg(&self, id: SId, cfg: NodeId) -> bool {
        match self.leaf(cfg) {
            Some(leaf) => leaf == id || self.contains(id, leaf),
            None => false,
        }
    }

    /// Graph nodes under `id`, in member order.
    pub fn leaves(&self, id: SId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(s) = stack.pop() {
            let node = self.node(s);
            match node.cfg {
                Some(cfg) => out.push(cfg),
                None => stack.extend(node.members.iter().rev()),
            }
        }
        out
    }

    /// Graph node where execution of region `id` starts.
    pub fn entry(&self, id: SId) -> NodeId {
        let mut cur = id;
        loop {
            let node = self.node(cur);
            match node.cfg {
                Some(cfg) => return cfg,
                None => cur = node.members[0],
            }
        }
    }

    /// Indented text dump.
    pub fn describe(&self, graph: &ProgramGraph) -> String {
        let mut out = String::new();
        let mut stack = vec![(self.root, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            let node = self.node(id);
            let _ = write!(out, "{:indent$}{}", "", node.kind.name(), indent = depth * 2);
            if let Some(cfg) = node.cfg {
                let _ = write!(out, " {}", graph.node_name(cfg));
            }
            if let Some(name) = &node.section_name {
                if node.kind == RegionKind::Section {
                    let _ = write!(out, " \"{}\"", name);
                }
            }
            out.push('\n');
            for m in node.members.iter().rev() {
                stack.push((*m, depth + 1));
            }
        }
        out
    }

    /// Canonical nested form; equal signatures mean isomorphic trees.
    pub fn signature(&self, graph: &ProgramGraph) -> String {
        fn go(tree: &StructuralTree, graph: &ProgramGraph, id: SId, out: &mut String) {
            let node = tree.node(id);
            out.push_str(node.kind.name());
            out.push('(');
            match node.cfg {
                Some(cfg) => out.push_str(&graph.node_name(cfg)),
                None => {
                    for (i, m) in node.members.iter().enumerate() {
                        if i > 0 {
                            out.push(',');
                        }
                        go(tree, graph, *m, out);
                    }
                }
            }
            out.push(')');
        }
        let mut out = String::new();
        go(self, graph, self.root, &mut out);
        out
    }

    /// Graphviz rendering with one cluster per region.
    pub fn to_dot(&self, graph: &ProgramGraph) -> String {
        fn cluster(tree: &StructuralTree, graph: &ProgramGraph, id: SId, out: &mut String) {
            let node = tree.node(id);
            if let Some(cfg) = node.cfg {
                let _ = writeln!(out, "  n{} [label=\"{}\"];", cfg.0, graph.node_name(cfg));
                return;
            }
            let _ = writeln!(out, "  subgraph cluster_{} {{", id.0);
            let _ = writeln!(out, "  label=\"{}\";", node.kind.name());
            for m in &node.members {
                cluster(tree, graph, *m, out);
            }
            out.push_str("  }\n");
        }
        let mut out = String::from("digraph structural {\n");
        cluster(self, graph, self.root, &mut out);
        for cfg in self.leaves(self.root) {
            for succ in graph.node(cfg).successors() {
                let _ = writeln!(out, "  n{} -> n{};", cfg.0, succ.0);
            }
        }
        out.push_str("}\n");
        out
    }
}
